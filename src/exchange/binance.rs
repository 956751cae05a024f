// =============================================================================
// Binance spot adapter — HMAC-SHA256 signed REST with filter validation
// =============================================================================
//
// Pre-flight on connect: load exchangeInfo (symbol -> precision + filters),
// synchronise the clock against /api/v3/time and store the offset. The
// offset is refreshed before any signed call when older than 300 s; a -1021
// response forces the next attempt to re-sync.
//
// SECURITY: the secret key is only ever used for HMAC signing and is never
// logged or serialised. The API key travels in the X-MBX-APIKEY header.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use parking_lot::{Mutex, RwLock};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::{debug, info, instrument, warn};

use crate::config::ExchangeConfig;
use crate::error::ExchangeError;
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::types::{Balance, Candle, Fill, Order, OrderSide, OrderStatus, OrderType, Ticker};

use super::filters::SymbolFilters;
use super::rate_limit::RateLimiter;
use super::{Exchange, MarketInfo};

type HmacSha256 = Hmac<Sha256>;

const MAINNET_URL: &str = "https://api.binance.com";
const TESTNET_URL: &str = "https://testnet.binance.vision";

/// Default recv-window sent with every signed request (milliseconds).
const DEFAULT_RECV_WINDOW_MS: u64 = 60_000;

/// Clock offset is refreshed when older than this.
const TIME_RESYNC_AFTER: Duration = Duration::from_secs(300);

/// Binance spot exchange adapter.
pub struct BinanceExchange {
    secret: String,
    base_url: String,
    recv_window_ms: u64,
    client: reqwest::Client,
    retry: RetryPolicy,
    rate_limiter: RateLimiter,
    /// serverTime - localTime, milliseconds.
    time_offset_ms: AtomicI64,
    last_time_sync: Mutex<Option<Instant>>,
    /// Unified symbol ("BTC/USDT") -> market metadata.
    markets: RwLock<HashMap<String, MarketInfo>>,
    /// Wire symbol ("BTCUSDT") -> unified symbol.
    wire_to_unified: RwLock<HashMap<String, String>>,
}

impl BinanceExchange {
    pub fn new(config: &ExchangeConfig) -> Self {
        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&config.api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(config.timeout)
            .build()
            .expect("failed to build reqwest client");

        let base_url = if config.testnet {
            info!("Binance adapter in TESTNET mode");
            TESTNET_URL.to_string()
        } else {
            MAINNET_URL.to_string()
        };

        Self {
            secret: config.api_secret.clone(),
            base_url,
            recv_window_ms: DEFAULT_RECV_WINDOW_MS,
            client,
            retry: RetryPolicy::default(),
            rate_limiter: RateLimiter::new(config.rate_limit),
            time_offset_ms: AtomicI64::new(0),
            last_time_sync: Mutex::new(None),
            markets: RwLock::new(HashMap::new()),
            wire_to_unified: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_recv_window(mut self, recv_window_ms: u64) -> Self {
        self.recv_window_ms = recv_window_ms;
        self
    }

    // -------------------------------------------------------------------------
    // Signing & time sync
    // -------------------------------------------------------------------------

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn local_now_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as i64
    }

    /// Exchange-adjusted timestamp for signed requests.
    fn timestamp_ms(&self) -> i64 {
        Self::local_now_ms() + self.time_offset_ms.load(Ordering::Relaxed)
    }

    fn signed_query(&self, params: &str) -> String {
        let ts = self.timestamp_ms();
        let rw = self.recv_window_ms;
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={rw}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={rw}")
        };
        let sig = self.sign(&base);
        format!("{base}&signature={sig}")
    }

    /// Single round-trip clock sync; stores `serverTime - localMidpoint`.
    /// Talks to reqwest directly: `request` consults the sync state before
    /// every signed call and must not be re-entered from here.
    async fn sync_time(&self) -> Result<(), ExchangeError> {
        self.rate_limiter.acquire(1).await?;
        let url = format!("{}/api/v3/time", self.base_url);

        let before = Self::local_now_ms();
        let resp = self.client.get(&url).send().await?;
        let after = Self::local_now_ms();

        self.rate_limiter.update_from_headers(resp.headers());
        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Network(format!("failed to parse time response: {e}")))?;
        if !status.is_success() {
            return Err(map_error(status.as_u16(), &body));
        }

        let server = body
            .get("serverTime")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| ExchangeError::Exchange("serverTime missing from response".into()))?;
        let offset = server - (before + after) / 2;

        self.time_offset_ms.store(offset, Ordering::Relaxed);
        *self.last_time_sync.lock() = Some(Instant::now());
        debug!(offset_ms = offset, "clock synchronised with exchange");
        Ok(())
    }

    /// Re-sync when the stored offset is stale. Called before every signed
    /// operation.
    async fn ensure_time_synced(&self) -> Result<(), ExchangeError> {
        let stale = {
            let last = self.last_time_sync.lock();
            match *last {
                Some(at) => at.elapsed() > TIME_RESYNC_AFTER,
                None => true,
            }
        };
        if stale {
            self.sync_time().await?;
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // HTTP plumbing
    // -------------------------------------------------------------------------

    async fn request(
        &self,
        method: Method,
        path: &str,
        params: &str,
        signed: bool,
        weight: u32,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.rate_limiter.acquire(weight).await?;

        let query = if signed {
            self.ensure_time_synced().await?;
            self.signed_query(params)
        } else {
            params.to_string()
        };

        let url = if query.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}{}?{}", self.base_url, path, query)
        };

        let resp = self.client.request(method, &url).send().await?;
        self.rate_limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::Network(format!("failed to parse response body: {e}")))?;

        if !status.is_success() {
            let err = map_error(status.as_u16(), &body);
            // A timestamp rejection means our offset drifted; force a re-sync
            // before the retry layer re-attempts.
            if body.get("code").and_then(|v| v.as_i64()) == Some(-1021) {
                *self.last_time_sync.lock() = None;
            }
            return Err(err);
        }
        Ok(body)
    }

    // -------------------------------------------------------------------------
    // Symbol mapping
    // -------------------------------------------------------------------------

    fn wire_symbol(symbol: &str) -> String {
        symbol.replace('/', "").to_uppercase()
    }

    fn unified_symbol(&self, wire: &str) -> String {
        self.wire_to_unified
            .read()
            .get(wire)
            .cloned()
            .unwrap_or_else(|| wire.to_string())
    }

    // -------------------------------------------------------------------------
    // Inner (unretried) operations
    // -------------------------------------------------------------------------

    async fn load_markets(&self) -> Result<(), ExchangeError> {
        let body = self
            .request(Method::GET, "/api/v3/exchangeInfo", "", false, 20)
            .await?;
        let symbols = body
            .get("symbols")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::Exchange("exchangeInfo missing 'symbols'".into()))?;

        let mut markets = HashMap::new();
        let mut wire_map = HashMap::new();
        for entry in symbols {
            if entry.get("status").and_then(|v| v.as_str()) != Some("TRADING") {
                continue;
            }
            let (Some(wire), Some(base), Some(quote)) = (
                entry.get("symbol").and_then(|v| v.as_str()),
                entry.get("baseAsset").and_then(|v| v.as_str()),
                entry.get("quoteAsset").and_then(|v| v.as_str()),
            ) else {
                continue;
            };
            let unified = format!("{base}/{quote}");
            let filters = entry
                .get("filters")
                .and_then(|v| v.as_array())
                .map(|arr| SymbolFilters::from_exchange_info(arr))
                .unwrap_or_else(SymbolFilters::unbounded);

            wire_map.insert(wire.to_string(), unified.clone());
            markets.insert(
                unified.clone(),
                MarketInfo {
                    symbol: unified,
                    base: base.to_string(),
                    quote: quote.to_string(),
                    filters,
                },
            );
        }

        info!(market_count = markets.len(), "markets loaded");
        *self.markets.write() = markets;
        *self.wire_to_unified.write() = wire_map;
        Ok(())
    }

    async fn fetch_ticker_inner(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let params = format!("symbol={}", Self::wire_symbol(symbol));
        let body = self
            .request(Method::GET, "/api/v3/ticker/24hr", &params, false, 2)
            .await?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            bid: parse_dec(&body, "bidPrice")?,
            ask: parse_dec(&body, "askPrice")?,
            last: parse_dec(&body, "lastPrice")?,
            timestamp: parse_millis(&body, "closeTime").unwrap_or_else(Utc::now),
        })
    }

    async fn fetch_balance_inner(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        let body = self
            .request(Method::GET, "/api/v3/account", "", true, 20)
            .await?;
        let raw = body
            .get("balances")
            .and_then(|v| v.as_array())
            .ok_or_else(|| ExchangeError::Exchange("account response missing 'balances'".into()))?;

        let mut out = HashMap::new();
        for b in raw {
            let Some(asset) = b.get("asset").and_then(|v| v.as_str()) else {
                continue;
            };
            let free = parse_dec(b, "free").unwrap_or(Decimal::ZERO);
            let used = parse_dec(b, "locked").unwrap_or(Decimal::ZERO);
            if !free.is_zero() || !used.is_zero() {
                out.insert(asset.to_string(), Balance::new(asset, free, used));
            }
        }
        Ok(out)
    }

    async fn create_order_inner(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        qty: Decimal,
        price: Option<Decimal>,
        client_order_id: Option<&str>,
    ) -> Result<Order, ExchangeError> {
        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            Self::wire_symbol(symbol),
            side.as_exchange(),
            order_type.as_exchange(),
            qty.normalize()
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={}&timeInForce=GTC", p.normalize()));
        }
        if let Some(coid) = client_order_id {
            params.push_str(&format!("&newClientOrderId={coid}"));
        }

        debug!(symbol, side = %side, order_type = %order_type, qty = %qty, "placing order");
        let body = self
            .request(Method::POST, "/api/v3/order", &params, true, 1)
            .await?;
        self.parse_order(&body)
    }

    async fn cancel_order_inner(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        let params = format!(
            "symbol={}&orderId={}",
            Self::wire_symbol(symbol),
            order_id
        );
        let body = self
            .request(Method::DELETE, "/api/v3/order", &params, true, 1)
            .await?;
        self.parse_order(&body)
    }

    async fn fetch_order_inner(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        let params = format!(
            "symbol={}&orderId={}",
            Self::wire_symbol(symbol),
            order_id
        );
        let body = self
            .request(Method::GET, "/api/v3/order", &params, true, 4)
            .await?;
        self.parse_order(&body)
    }

    async fn fetch_open_orders_inner(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<Order>, ExchangeError> {
        let params = match symbol {
            Some(s) => format!("symbol={}", Self::wire_symbol(s)),
            None => String::new(),
        };
        // Unscoped open-orders queries are heavily weighted by the venue.
        let weight = if symbol.is_some() { 6 } else { 80 };
        let body = self
            .request(Method::GET, "/api/v3/openOrders", &params, true, weight)
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Exchange("openOrders response is not an array".into()))?;
        raw.iter().map(|o| self.parse_order(o)).collect()
    }

    async fn fetch_ohlcv_inner(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let params = format!(
            "symbol={}&interval={}&limit={}",
            Self::wire_symbol(symbol),
            timeframe,
            limit
        );
        let body = self
            .request(Method::GET, "/api/v3/klines", &params, false, 2)
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Exchange("klines response is not an array".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for entry in raw {
            let Some(arr) = entry.as_array() else { continue };
            if arr.len() < 6 {
                warn!(elements = arr.len(), "skipping malformed kline entry");
                continue;
            }
            let ts = arr[0]
                .as_i64()
                .and_then(|ms| DateTime::<Utc>::from_timestamp_millis(ms))
                .ok_or_else(|| ExchangeError::Exchange("kline open time invalid".into()))?;
            candles.push(Candle {
                timestamp: ts,
                open: parse_dec_value(&arr[1])?,
                high: parse_dec_value(&arr[2])?,
                low: parse_dec_value(&arr[3])?,
                close: parse_dec_value(&arr[4])?,
                volume: parse_dec_value(&arr[5])?,
            });
        }
        Ok(candles)
    }

    async fn fetch_my_trades_inner(
        &self,
        symbol: &str,
        limit: u32,
    ) -> Result<Vec<Fill>, ExchangeError> {
        let params = format!(
            "symbol={}&limit={}",
            Self::wire_symbol(symbol),
            limit
        );
        let body = self
            .request(Method::GET, "/api/v3/myTrades", &params, true, 20)
            .await?;

        let raw = body
            .as_array()
            .ok_or_else(|| ExchangeError::Exchange("myTrades response is not an array".into()))?;

        let mut fills = Vec::with_capacity(raw.len());
        for t in raw {
            let side = if t.get("isBuyer").and_then(|v| v.as_bool()).unwrap_or(false) {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            fills.push(Fill {
                id: id_field(t, "id")?,
                order_id: t
                    .get("orderId")
                    .map(|v| v.to_string().trim_matches('"').to_string()),
                symbol: symbol.to_string(),
                side,
                amount: parse_dec(t, "qty")?,
                price: parse_dec(t, "price")?,
                cost: parse_dec(t, "quoteQty")?,
                fee: parse_dec(t, "commission").ok(),
                timestamp: parse_millis(t, "time").unwrap_or_else(Utc::now),
            });
        }
        // Most recent first.
        fills.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(fills)
    }

    /// Parse a Binance order object (create/cancel/query responses share the
    /// shape apart from the timestamp field name).
    fn parse_order(&self, body: &serde_json::Value) -> Result<Order, ExchangeError> {
        let wire = body
            .get("symbol")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ExchangeError::Exchange("order response missing 'symbol'".into()))?;

        let side: OrderSide = str_field(body, "side")?
            .parse()
            .map_err(ExchangeError::Exchange)?;
        let order_type: OrderType = str_field(body, "type")?
            .parse()
            .map_err(ExchangeError::Exchange)?;
        let status: OrderStatus = str_field(body, "status")?
            .parse()
            .map_err(ExchangeError::Exchange)?;

        let amount = parse_dec(body, "origQty")?;
        let filled = parse_dec(body, "executedQty").unwrap_or(Decimal::ZERO);
        let price = parse_dec(body, "price").ok().filter(|p| !p.is_zero());
        let cost = parse_dec(body, "cummulativeQuoteQty").unwrap_or(Decimal::ZERO);

        let timestamp = parse_millis(body, "transactTime")
            .or_else(|| parse_millis(body, "time"))
            .or_else(|| parse_millis(body, "updateTime"))
            .unwrap_or_else(Utc::now);

        Ok(Order {
            id: id_field(body, "orderId")?,
            client_order_id: body
                .get("clientOrderId")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string()),
            symbol: self.unified_symbol(wire),
            side,
            order_type,
            status,
            price,
            amount,
            filled,
            remaining: amount - filled,
            cost,
            fee: None,
            timestamp,
        })
    }
}

// ---------------------------------------------------------------------------
// Exchange impl
// ---------------------------------------------------------------------------

#[async_trait]
impl Exchange for BinanceExchange {
    fn name(&self) -> &str {
        "binance"
    }

    #[instrument(skip(self), name = "binance::connect")]
    async fn connect(&self) -> Result<(), ExchangeError> {
        retry_with_backoff(&self.retry, "load_markets", || self.load_markets()).await?;
        retry_with_backoff(&self.retry, "sync_time", || self.sync_time()).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), ExchangeError> {
        // reqwest pools close on drop; nothing persistent to tear down.
        Ok(())
    }

    fn market(&self, symbol: &str) -> Option<MarketInfo> {
        self.markets.read().get(symbol).cloned()
    }

    #[instrument(skip(self), name = "binance::fetch_ticker")]
    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_ticker", || self.fetch_ticker_inner(symbol)).await
    }

    #[instrument(skip(self), name = "binance::fetch_balance")]
    async fn fetch_balance(&self) -> Result<HashMap<String, Balance>, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_balance", || self.fetch_balance_inner()).await
    }

    #[instrument(skip(self, amount, price), name = "binance::create_order")]
    async fn create_order(
        &self,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        amount: Decimal,
        price: Option<Decimal>,
        client_order_id: Option<String>,
    ) -> Result<Order, ExchangeError> {
        let market = self
            .market(symbol)
            .ok_or_else(|| ExchangeError::InvalidOrder(format!("unknown market: {symbol}")))?;
        let (qty, price) = market.filters.validate_order(order_type, amount, price)?;

        retry_with_backoff(&self.retry, "create_order", || {
            self.create_order_inner(symbol, order_type, side, qty, price, client_order_id.as_deref())
        })
        .await
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        retry_with_backoff(&self.retry, "cancel_order", || {
            self.cancel_order_inner(order_id, symbol)
        })
        .await
    }

    #[instrument(skip(self), name = "binance::fetch_order")]
    async fn fetch_order(&self, order_id: &str, symbol: &str) -> Result<Order, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_order", || {
            self.fetch_order_inner(order_id, symbol)
        })
        .await
    }

    #[instrument(skip(self), name = "binance::fetch_open_orders")]
    async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_open_orders", || {
            self.fetch_open_orders_inner(symbol)
        })
        .await
    }

    #[instrument(skip(self), name = "binance::fetch_ohlcv")]
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: &str,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_ohlcv", || {
            self.fetch_ohlcv_inner(symbol, timeframe, limit)
        })
        .await
    }

    #[instrument(skip(self), name = "binance::fetch_my_trades")]
    async fn fetch_my_trades(&self, symbol: &str, limit: u32) -> Result<Vec<Fill>, ExchangeError> {
        retry_with_backoff(&self.retry, "fetch_my_trades", || {
            self.fetch_my_trades_inner(symbol, limit)
        })
        .await
    }
}

impl std::fmt::Debug for BinanceExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceExchange")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("recv_window_ms", &self.recv_window_ms)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Error mapping & parse helpers
// ---------------------------------------------------------------------------

/// Translate a Binance error response into the classified taxonomy.
fn map_error(status: u16, body: &serde_json::Value) -> ExchangeError {
    let code = body.get("code").and_then(|v| v.as_i64()).unwrap_or(0);
    let msg = body
        .get("msg")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let detail = format!("code {code}: {msg}");
    let lower = msg.to_ascii_lowercase();

    match code {
        -1002 | -1022 | -2014 | -2015 => ExchangeError::Authentication(detail),
        -2010 if lower.contains("insufficient") => ExchangeError::InsufficientFunds(detail),
        -2010 => ExchangeError::InvalidOrder(detail),
        -2011 | -2013 => ExchangeError::OrderNotFound(detail),
        -1013 if lower.contains("notional") => ExchangeError::InsufficientNotional(detail),
        -1013 | -1102 | -1106 | -1111 => ExchangeError::InvalidOrder(detail),
        -1003 => ExchangeError::RateLimit(detail),
        // Timestamp outside recvWindow; the caller re-syncs and retries.
        -1021 => ExchangeError::Network(detail),
        _ => match status {
            401 | 403 => ExchangeError::Authentication(detail),
            418 | 429 => ExchangeError::RateLimit(detail),
            500..=599 => ExchangeError::Network(detail),
            _ => ExchangeError::Exchange(detail),
        },
    }
}

/// Binance sends numbers as JSON strings in most payloads; accept both.
fn parse_dec_value(value: &serde_json::Value) -> Result<Decimal, ExchangeError> {
    if let Some(s) = value.as_str() {
        s.parse()
            .map_err(|_| ExchangeError::Exchange(format!("failed to parse decimal: '{s}'")))
    } else if value.is_number() {
        value
            .to_string()
            .parse()
            .map_err(|_| ExchangeError::Exchange(format!("failed to parse decimal: {value}")))
    } else {
        Err(ExchangeError::Exchange(format!(
            "expected decimal, got: {value}"
        )))
    }
}

fn parse_dec(body: &serde_json::Value, key: &str) -> Result<Decimal, ExchangeError> {
    body.get(key)
        .ok_or_else(|| ExchangeError::Exchange(format!("missing field '{key}'")))
        .and_then(parse_dec_value)
}

fn parse_millis(body: &serde_json::Value, key: &str) -> Option<DateTime<Utc>> {
    body.get(key)
        .and_then(|v| v.as_i64())
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn str_field<'a>(body: &'a serde_json::Value, key: &str) -> Result<&'a str, ExchangeError> {
    body.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExchangeError::Exchange(format!("missing field '{key}'")))
}

/// Ids arrive as numbers (orderId) or strings (trade id); normalise to String.
fn id_field(body: &serde_json::Value, key: &str) -> Result<String, ExchangeError> {
    match body.get(key) {
        Some(serde_json::Value::String(s)) => Ok(s.clone()),
        Some(v) if v.is_number() => Ok(v.to_string()),
        _ => Err(ExchangeError::Exchange(format!("missing field '{key}'"))),
    }
}
