// =============================================================================
// Observability API — read-only HTTP surface for the external dashboard
// =============================================================================
//
// All endpoints are reads; control stays with the operator's process
// signals. CORS is permissive so the dashboard can be served from anywhere
// during development.
// =============================================================================

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Datelike, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::bot::BotState;

/// Readiness fails when the main loop has not beaten for this long.
const HEARTBEAT_STALE_SECS: i64 = 60;

/// Build the router with CORS middleware and shared state.
pub fn router(state: Arc<BotState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/metrics/prometheus", get(metrics_prometheus))
        .route("/api/status", get(status))
        .route("/api/trades", get(trades))
        .route("/api/positions", get(positions))
        .route("/api/pnl", get(pnl))
        .route("/api/equity", get(equity))
        .route("/api/orders", get(orders))
        .route("/api/ohlcv", get(ohlcv))
        .route("/api/config", get(config_view))
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(state: Arc<BotState>, bind_addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "API server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// =============================================================================
// Health & readiness
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

async fn health(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    let heartbeat_age = state.heartbeat_age_secs();
    let running = state.running.load(Ordering::SeqCst);

    let (status, message) = if !running {
        ("error", Some("engine is not running".to_string()))
    } else if heartbeat_age > HEARTBEAT_STALE_SECS {
        (
            "degraded",
            Some(format!("heartbeat is {heartbeat_age}s old")),
        )
    } else {
        ("healthy", None)
    };

    Json(HealthResponse {
        status,
        uptime_seconds: state.uptime_secs(),
        message,
    })
}

async fn ready(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    let fresh = state.running.load(Ordering::SeqCst)
        && state.heartbeat_age_secs() < HEARTBEAT_STALE_SECS;
    if fresh {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

// =============================================================================
// Metrics
// =============================================================================

async fn metrics(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "uptime_seconds": state.uptime_secs(),
        "heartbeat_age_seconds": state.heartbeat_age_secs(),
        "strategy": state.strategy_stats.read().clone(),
        "risk": {
            "circuit_breaker": state.risk.breaker().state(),
            "drawdown": state.risk.drawdown_stats(),
            "tracked_stops": state.risk.stop_count(),
        },
    }))
}

async fn metrics_prometheus(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    let breaker = state.risk.breaker().state();
    let stats = state.strategy_stats.read().clone();
    let running = state.running.load(Ordering::SeqCst) as u8;
    let tripped = breaker.is_tripped as u8;
    let completed = stats
        .pointer("/statistics/completed_cycles")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let active_orders = stats
        .pointer("/active_orders")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    let body = format!(
        "# TYPE trading_bot_uptime_seconds gauge\n\
         trading_bot_uptime_seconds {}\n\
         # TYPE trading_bot_heartbeat_age_seconds gauge\n\
         trading_bot_heartbeat_age_seconds {}\n\
         # TYPE trading_bot_running gauge\n\
         trading_bot_running {}\n\
         # TYPE trading_bot_circuit_breaker_tripped gauge\n\
         trading_bot_circuit_breaker_tripped {}\n\
         # TYPE trading_bot_consecutive_losses gauge\n\
         trading_bot_consecutive_losses {}\n\
         # TYPE trading_bot_completed_cycles counter\n\
         trading_bot_completed_cycles {}\n\
         # TYPE trading_bot_active_orders gauge\n\
         trading_bot_active_orders {}\n",
        state.uptime_secs(),
        state.heartbeat_age_secs(),
        running,
        tripped,
        breaker.consecutive_losses,
        completed,
        active_orders,
    );
    ([(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

// =============================================================================
// Status
// =============================================================================

async fn status(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "running": state.running.load(Ordering::SeqCst),
        "started_at": state.started_at.to_rfc3339(),
        "uptime_seconds": state.uptime_secs(),
        "symbol": state.config.trading.symbol,
        "dry_run": state.config.trading.dry_run,
        "exchange": state.exchange.name(),
        "last_price": state.last_price.read().map(|p| p.to_string()),
        "strategy": state.strategy_stats.read().clone(),
        "circuit_breaker": state.risk.breaker().state(),
        "drawdown": state.risk.drawdown_stats(),
    }))
}

// =============================================================================
// Trades & positions
// =============================================================================

#[derive(Deserialize)]
struct TradesQuery {
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default = "default_trade_limit")]
    limit: u32,
}

fn default_trade_limit() -> u32 {
    100
}

async fn trades(
    State(state): State<Arc<BotState>>,
    Query(query): Query<TradesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let trades = state
        .store
        .trade_history(query.symbol.as_deref(), None, query.limit.min(1000))
        .await?;
    Ok(Json(trades))
}

async fn positions(State(state): State<Arc<BotState>>) -> Result<impl IntoResponse, ApiError> {
    let cycles = state.store.open_cycles(None, None).await?;
    let last_price = *state.last_price.read();

    let positions: Vec<serde_json::Value> = cycles
        .into_iter()
        .map(|cycle| {
            let unrealized = last_price.map(|price| match cycle.side {
                crate::types::OrderSide::Buy => (price - cycle.open_rate) * cycle.amount,
                crate::types::OrderSide::Sell => (cycle.open_rate - price) * cycle.amount,
            });
            serde_json::json!({
                "trade": cycle,
                "current_price": last_price.map(|p| p.to_string()),
                "unrealized_pnl": unrealized.map(|p| p.to_string()),
            })
        })
        .collect();
    Ok(Json(positions))
}

// =============================================================================
// P&L aggregation
// =============================================================================

#[derive(Deserialize)]
struct PnlQuery {
    #[serde(default = "default_period")]
    period: String,
}

fn default_period() -> String {
    "daily".to_string()
}

async fn pnl(
    State(state): State<Arc<BotState>>,
    Query(query): Query<PnlQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state.store.trade_history(None, None, 10_000).await?;

    let mut buckets: std::collections::BTreeMap<String, Decimal> = Default::default();
    for trade in history.iter().filter(|t| !t.is_open) {
        let (Some(close_date), Some(profit)) = (trade.close_date, trade.profit) else {
            continue;
        };
        let key = match query.period.as_str() {
            "weekly" => format!("{}-W{:02}", close_date.iso_week().year(), close_date.iso_week().week()),
            "monthly" => format!("{}-{:02}", close_date.year(), close_date.month()),
            _ => close_date.format("%Y-%m-%d").to_string(),
        };
        *buckets.entry(key).or_default() += profit;
    }

    let series: Vec<serde_json::Value> = buckets
        .into_iter()
        .map(|(period, profit)| serde_json::json!({ "period": period, "pnl": profit.to_string() }))
        .collect();
    Ok(Json(serde_json::json!({ "period": query.period, "series": series })))
}

// =============================================================================
// Equity
// =============================================================================

#[derive(Deserialize)]
struct EquityQuery {
    #[serde(default = "default_equity_days")]
    days: i64,
}

fn default_equity_days() -> i64 {
    30
}

async fn equity(
    State(state): State<Arc<BotState>>,
    Query(query): Query<EquityQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let quote = state
        .config
        .trading
        .symbol
        .split('/')
        .nth(1)
        .unwrap_or("USDT")
        .to_string();
    let since = Utc::now() - Duration::days(query.days.clamp(1, 365));
    let series = state
        .store
        .equity_series(state.exchange.name(), &quote, since)
        .await?;
    Ok(Json(series))
}

// =============================================================================
// Orders & OHLCV
// =============================================================================

#[derive(Deserialize)]
struct OrdersQuery {
    #[serde(default)]
    symbol: Option<String>,
}

async fn orders(
    State(state): State<Arc<BotState>>,
    Query(query): Query<OrdersQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let orders = state
        .exchange
        .fetch_open_orders(query.symbol.as_deref())
        .await
        .map_err(|e| ApiError(StatusCode::BAD_GATEWAY, e.to_string()))?;
    Ok(Json(orders))
}

#[derive(Deserialize)]
struct OhlcvQuery {
    symbol: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default = "default_ohlcv_limit")]
    limit: u32,
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_ohlcv_limit() -> u32 {
    100
}

async fn ohlcv(
    State(state): State<Arc<BotState>>,
    Query(query): Query<OhlcvQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let limit = query.limit.clamp(1, 1000);
    let interval = crate::data::ohlcv_cache::timeframe_interval(&query.timeframe)
        .ok_or_else(|| ApiError(StatusCode::BAD_REQUEST, format!("unknown timeframe: {}", query.timeframe)))?;
    let end = Utc::now();
    let start = end - Duration::from_std(interval * limit).unwrap_or(Duration::days(7));

    if let Some(cached) = state
        .cache
        .get(&query.symbol, &query.timeframe, start, end)
        .await
    {
        return Ok(Json(cached));
    }

    let candles = state
        .exchange
        .fetch_ohlcv(&query.symbol, &query.timeframe, limit)
        .await
        .map_err(|e| ApiError(StatusCode::BAD_GATEWAY, e.to_string()))?;
    state
        .cache
        .put(&query.symbol, &query.timeframe, start, end, candles.clone())
        .await;
    Ok(Json(candles))
}

// =============================================================================
// Config (read-only, secrets redacted)
// =============================================================================

async fn config_view(State(state): State<Arc<BotState>>) -> impl IntoResponse {
    let config = &state.config;
    Json(serde_json::json!({
        "exchange": {
            "name": config.exchange.name,
            "testnet": config.exchange.testnet,
            "rate_limit_ms": config.exchange.rate_limit.as_millis() as u64,
            "timeout_ms": config.exchange.timeout.as_millis() as u64,
        },
        "trading": {
            "symbol": config.trading.symbol,
            "dry_run": config.trading.dry_run,
            "max_position_pct": config.trading.max_position_pct.to_string(),
        },
        "grid": {
            "lower_price": config.grid.lower_price.to_string(),
            "upper_price": config.grid.upper_price.to_string(),
            "num_grids": config.grid.num_grids,
            "total_investment": config.grid.total_investment.to_string(),
            "spacing": config.grid.spacing,
            "stop_loss_pct": config.grid.stop_loss_pct.map(|p| p.to_string()),
        },
        "alerting_enabled": config.alert.enabled,
        "log_level": config.log_level,
    }))
}

// =============================================================================
// Error plumbing
// =============================================================================

struct ApiError(StatusCode, String);

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = Json(serde_json::json!({ "error": self.1 }));
        (self.0, body).into_response()
    }
}
