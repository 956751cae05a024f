// =============================================================================
// Application configuration — nested SECTION__KEY environment variables
// =============================================================================
//
// One `AppConfig` record is built at startup and owned by the orchestrator;
// nothing reads the environment after this point. Keys use two underscores
// between section and name (EXCHANGE__API_KEY). Out-of-range numeric values
// are a startup error, not a clamp.
// =============================================================================

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;

use crate::strategy::grid::{GridConfig, GridSpacing};

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

/// Exchange connectivity settings.
#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub name: String,
    pub api_key: String,
    pub api_secret: String,
    pub testnet: bool,
    /// Minimum spacing between REST calls.
    pub rate_limit: Duration,
    /// Per-call timeout.
    pub timeout: Duration,
}

/// Persistence settings.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub echo: bool,
    pub pool_size: u32,
}

/// Trading settings shared by risk and strategy layers.
#[derive(Debug, Clone)]
pub struct TradingConfig {
    pub symbol: String,
    pub dry_run: bool,
    pub max_position_pct: Decimal,
}

/// Alerting settings. Telegram/Discord delivery lives in external adapters;
/// the core only needs to know whether alerting is enabled and what secrets
/// to hand over.
#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub discord_webhook_url: Option<String>,
}

/// Observability API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_addr: String,
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

/// Complete engine configuration, assembled once from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub exchange: ExchangeConfig,
    pub db: DbConfig,
    pub trading: TradingConfig,
    pub alert: AlertConfig,
    pub api: ApiConfig,
    pub grid: GridConfig,
    pub log_level: String,
    pub json_logs: bool,
}

impl AppConfig {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        let exchange = ExchangeConfig {
            name: var_or("EXCHANGE__NAME", "binance"),
            api_key: var_or("EXCHANGE__API_KEY", ""),
            api_secret: var_or("EXCHANGE__API_SECRET", ""),
            testnet: var_bool("EXCHANGE__TESTNET", false)?,
            rate_limit: Duration::from_millis(var_range(
                "EXCHANGE__RATE_LIMIT_MS",
                200,
                50,
                1000,
            )?),
            timeout: Duration::from_millis(var_range(
                "EXCHANGE__TIMEOUT_MS",
                30_000,
                5_000,
                60_000,
            )?),
        };

        let db = DbConfig {
            url: var_or("DB__URL", "sqlite://lattice.db"),
            echo: var_bool("DB__ECHO", false)?,
            pool_size: var_range("DB__POOL_SIZE", 5, 1, 20)? as u32,
        };

        let trading = TradingConfig {
            symbol: var_or("TRADING__SYMBOL", "BTC/USDT"),
            dry_run: var_bool("TRADING__DRY_RUN", true)?,
            max_position_pct: var_decimal_range(
                "TRADING__MAX_POSITION_PCT",
                "0.20",
                "0.01",
                "1.0",
            )?,
        };

        let alert = AlertConfig {
            enabled: var_bool("ALERT__ENABLED", true)?,
            telegram_bot_token: var_opt("ALERT__TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: var_opt("ALERT__TELEGRAM_CHAT_ID"),
            discord_webhook_url: var_opt("ALERT__DISCORD_WEBHOOK_URL"),
        };

        let api = ApiConfig {
            bind_addr: var_or("API__BIND_ADDR", "0.0.0.0:3001"),
        };

        let grid = GridConfig {
            symbol: trading.symbol.clone(),
            lower_price: var_decimal_required("GRID__LOWER_PRICE")?,
            upper_price: var_decimal_required("GRID__UPPER_PRICE")?,
            num_grids: var_range("GRID__NUM_GRIDS", 10, 3, 100)? as u32,
            total_investment: var_decimal_required("GRID__TOTAL_INVESTMENT")?,
            spacing: match var_or("GRID__SPACING", "arithmetic").to_ascii_lowercase().as_str() {
                "arithmetic" => GridSpacing::Arithmetic,
                "geometric" => GridSpacing::Geometric,
                other => bail!("GRID__SPACING must be 'arithmetic' or 'geometric', got '{other}'"),
            },
            stop_loss_pct: match var_opt("GRID__STOP_LOSS_PCT") {
                Some(raw) => Some(
                    Decimal::from_str(&raw)
                        .with_context(|| format!("GRID__STOP_LOSS_PCT is not a decimal: '{raw}'"))?,
                ),
                None => None,
            },
            place_initial_sells: var_bool("GRID__PLACE_INITIAL_SELLS", false)?,
            cancel_orders_on_shutdown: var_bool("GRID__CANCEL_ORDERS_ON_SHUTDOWN", true)?,
        };
        grid.validate().context("invalid grid configuration")?;

        Ok(Self {
            exchange,
            db,
            trading,
            alert,
            api,
            grid,
            log_level: var_or("LOG_LEVEL", "info"),
            json_logs: var_bool("JSON_LOGS", false)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Env helpers
// ---------------------------------------------------------------------------

fn var_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn var_or(key: &str, default: &str) -> String {
    var_opt(key).unwrap_or_else(|| default.to_string())
}

fn var_bool(key: &str, default: bool) -> Result<bool> {
    match var_opt(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{key} must be a boolean, got '{other}'"),
        },
    }
}

fn var_range(key: &str, default: u64, min: u64, max: u64) -> Result<u64> {
    let value = match var_opt(key) {
        None => default,
        Some(raw) => raw
            .parse::<u64>()
            .with_context(|| format!("{key} is not an integer: '{raw}'"))?,
    };
    if value < min || value > max {
        bail!("{key} must be in [{min}, {max}], got {value}");
    }
    Ok(value)
}

fn var_decimal_required(key: &str) -> Result<Decimal> {
    let raw = var_opt(key).with_context(|| format!("{key} is required"))?;
    Decimal::from_str(&raw).with_context(|| format!("{key} is not a decimal: '{raw}'"))
}

fn var_decimal_range(key: &str, default: &str, min: &str, max: &str) -> Result<Decimal> {
    let value = match var_opt(key) {
        None => Decimal::from_str(default).expect("default decimal"),
        Some(raw) => {
            Decimal::from_str(&raw).with_context(|| format!("{key} is not a decimal: '{raw}'"))?
        }
    };
    let min = Decimal::from_str(min).expect("min decimal");
    let max = Decimal::from_str(max).expect("max decimal");
    if value < min || value > max {
        bail!("{key} must be in [{min}, {max}], got {value}");
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env-var tests mutate process state; serialize them.
    static ENV_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

    fn with_grid_env<R>(f: impl FnOnce() -> R) -> R {
        let _guard = ENV_LOCK.lock();
        std::env::set_var("GRID__LOWER_PRICE", "40000");
        std::env::set_var("GRID__UPPER_PRICE", "44000");
        std::env::set_var("GRID__TOTAL_INVESTMENT", "10000");
        let result = f();
        for key in [
            "GRID__LOWER_PRICE",
            "GRID__UPPER_PRICE",
            "GRID__TOTAL_INVESTMENT",
            "GRID__NUM_GRIDS",
            "EXCHANGE__RATE_LIMIT_MS",
            "TRADING__MAX_POSITION_PCT",
        ] {
            std::env::remove_var(key);
        }
        result
    }

    #[test]
    fn defaults_load_with_minimal_env() {
        with_grid_env(|| {
            let config = AppConfig::from_env().expect("config should load");
            assert_eq!(config.exchange.name, "binance");
            assert_eq!(config.exchange.timeout, Duration::from_millis(30_000));
            assert_eq!(config.db.pool_size, 5);
            assert!(config.trading.dry_run);
            assert_eq!(config.grid.num_grids, 10);
        });
    }

    #[test]
    fn out_of_range_rate_limit_is_rejected() {
        with_grid_env(|| {
            std::env::set_var("EXCHANGE__RATE_LIMIT_MS", "5000");
            let err = AppConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("EXCHANGE__RATE_LIMIT_MS"));
        });
    }

    #[test]
    fn out_of_range_position_pct_is_rejected() {
        with_grid_env(|| {
            std::env::set_var("TRADING__MAX_POSITION_PCT", "1.5");
            let err = AppConfig::from_env().unwrap_err();
            assert!(err.to_string().contains("TRADING__MAX_POSITION_PCT"));
        });
    }
}
