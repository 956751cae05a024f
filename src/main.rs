// =============================================================================
// Lattice Grid Engine — Main Entry Point
// =============================================================================
//
// Single long-running process: no subcommands. Exits 0 on clean shutdown,
// 1 on a fatal initialisation or runtime error. SIGINT/SIGTERM request a
// graceful shutdown.
// =============================================================================

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lattice_bot::bot::TradingBot;
use lattice_bot::config::AppConfig;

fn init_tracing(log_level: &str, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));
    if json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    // Peek at logging settings before full config validation so config
    // errors are themselves logged properly.
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
    let json_logs = matches!(
        std::env::var("JSON_LOGS").unwrap_or_default().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    );
    init_tracing(&log_level, json_logs);

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Lattice Grid Engine — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            std::process::exit(1);
        }
    };

    info!(
        symbol = %config.trading.symbol,
        dry_run = config.trading.dry_run,
        testnet = config.exchange.testnet,
        lower = %config.grid.lower_price,
        upper = %config.grid.upper_price,
        num_grids = config.grid.num_grids,
        "configuration loaded"
    );

    match TradingBot::new(config).run().await {
        Ok(()) => {
            info!("Lattice Grid Engine shut down cleanly.");
        }
        Err(e) => {
            error!(error = %e, "fatal error");
            std::process::exit(1);
        }
    }
}
