// =============================================================================
// WebSocket handler — per-symbol ticker subscriptions with REST fallback
// =============================================================================
//
// One background task per subscribed symbol reads the venue's bookTicker
// push stream and invokes the registered callback in arrival order. On
// disconnect the task reconnects with exponential backoff (1 -> 60 s, reset
// on the first good message) without losing the subscription. When no push
// endpoint is configured the handler polls `fetch_ticker` at a fixed
// interval under the same callback contract.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ExchangeError;
use crate::types::Ticker;

use super::Exchange;

/// Public Binance spot stream endpoint.
pub const BINANCE_STREAM_BASE: &str = "wss://stream.binance.com:9443/ws";

/// Reconnect backoff bounds.
const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(60);

/// How long `stop()` waits for a task before force-cancelling it.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Callback invoked for every ticker update, in arrival order per symbol.
pub type TickerCallback = Arc<dyn Fn(Ticker) + Send + Sync>;

/// Subscription manager for live ticker delivery.
pub struct WebSocketHandler {
    exchange: Arc<dyn Exchange>,
    /// Push endpoint; None selects the REST polling fallback.
    stream_base: Option<String>,
    poll_interval: Duration,
    subscriptions: Mutex<HashMap<String, TickerCallback>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl WebSocketHandler {
    /// Handler using the venue's push stream.
    pub fn new(exchange: Arc<dyn Exchange>, stream_base: impl Into<String>) -> Self {
        Self::build(exchange, Some(stream_base.into()))
    }

    /// Handler that polls REST tickers instead of a push stream.
    pub fn polling(exchange: Arc<dyn Exchange>, poll_interval: Duration) -> Self {
        let mut handler = Self::build(exchange, None);
        handler.poll_interval = poll_interval;
        handler
    }

    fn build(exchange: Arc<dyn Exchange>, stream_base: Option<String>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            exchange,
            stream_base,
            poll_interval: Duration::from_secs(1),
            subscriptions: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Register a callback for a symbol. Must be called before `start()`.
    pub fn subscribe(&self, symbol: &str, callback: TickerCallback) {
        self.subscriptions.lock().insert(symbol.to_string(), callback);
        debug!(symbol, "ticker subscription registered");
    }

    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }

    /// Spawn one background task per subscribed symbol.
    pub fn start(&self) {
        let subs: Vec<(String, TickerCallback)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(s, cb)| (s.clone(), cb.clone()))
            .collect();

        let mut tasks = self.tasks.lock();
        for (symbol, callback) in subs {
            let shutdown_rx = self.shutdown_tx.subscribe();
            let handle = match &self.stream_base {
                Some(base) => {
                    let base = base.clone();
                    tokio::spawn(run_push_stream(base, symbol, callback, shutdown_rx))
                }
                None => {
                    let exchange = self.exchange.clone();
                    let interval = self.poll_interval;
                    tokio::spawn(run_poll_loop(exchange, symbol, callback, interval, shutdown_rx))
                }
            };
            tasks.push(handle);
        }
        info!(
            task_count = tasks.len(),
            mode = if self.stream_base.is_some() { "push" } else { "poll" },
            "ticker streams started"
        );
    }

    /// Signal shutdown and await task termination. No new callbacks are
    /// scheduled after this returns.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for mut handle in handles {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("ticker task did not stop within grace period; aborting");
                handle.abort();
            }
        }
        info!("ticker streams stopped");
    }
}

// ---------------------------------------------------------------------------
// Push stream task
// ---------------------------------------------------------------------------

fn stream_url(base: &str, symbol: &str) -> String {
    let wire = symbol.replace('/', "").to_lowercase();
    format!("{base}/{wire}@bookTicker")
}

async fn run_push_stream(
    base: String,
    symbol: String,
    callback: TickerCallback,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let url = stream_url(&base, &symbol);
    let mut backoff = RECONNECT_BASE;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }

        match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _response)) => {
                info!(symbol = %symbol, "ticker stream connected");
                let (_write, mut read) = ws_stream.split();
                let mut received_any = false;

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                return;
                            }
                        }
                        msg = read.next() => match msg {
                            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                                match parse_book_ticker(&symbol, &text) {
                                    Ok(ticker) => {
                                        if !received_any {
                                            received_any = true;
                                            backoff = RECONNECT_BASE;
                                        }
                                        callback(ticker);
                                    }
                                    Err(e) => warn!(symbol = %symbol, error = %e, "failed to parse ticker message"),
                                }
                            }
                            // Ping/pong handled by tungstenite; ignore other frames.
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                error!(symbol = %symbol, error = %e, "ticker stream read error");
                                break;
                            }
                            None => {
                                warn!(symbol = %symbol, "ticker stream ended");
                                break;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!(symbol = %symbol, error = %e, "ticker stream connect failed");
            }
        }

        // Reconnect with backoff, unless shutting down mid-sleep.
        warn!(
            symbol = %symbol,
            delay_s = backoff.as_secs(),
            "reconnecting ticker stream"
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

/// Parse a Binance bookTicker payload:
/// `{"u":400900217,"s":"BTCUSDT","b":"40000.10","B":"31.2","a":"40000.20","A":"40.6"}`
fn parse_book_ticker(symbol: &str, text: &str) -> Result<Ticker, ExchangeError> {
    let root: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ExchangeError::Exchange(format!("invalid ticker JSON: {e}")))?;

    let bid = dec_str(&root, "b")?;
    let ask = dec_str(&root, "a")?;
    // bookTicker carries no trade price; use the mid as the last price.
    let last = (bid + ask) / Decimal::TWO;

    Ok(Ticker {
        symbol: symbol.to_string(),
        bid,
        ask,
        last,
        timestamp: Utc::now(),
    })
}

fn dec_str(root: &serde_json::Value, key: &str) -> Result<Decimal, ExchangeError> {
    root.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ExchangeError::Exchange(format!("missing field '{key}'")))?
        .parse()
        .map_err(|_| ExchangeError::Exchange(format!("field '{key}' is not a decimal")))
}

// ---------------------------------------------------------------------------
// Poll fallback task
// ---------------------------------------------------------------------------

async fn run_poll_loop(
    exchange: Arc<dyn Exchange>,
    symbol: String,
    callback: TickerCallback,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker_interval = tokio::time::interval(interval);
    ticker_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            _ = ticker_interval.tick() => {
                match exchange.fetch_ticker(&symbol).await {
                    Ok(ticker) => callback(ticker),
                    Err(e) => warn!(symbol = %symbol, error = %e, "ticker poll failed"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Balance, Candle, Fill, Order, OrderSide, OrderType};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticExchange;

    #[async_trait]
    impl Exchange for StaticExchange {
        fn name(&self) -> &str {
            "static"
        }
        async fn connect(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn disconnect(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        fn market(&self, _symbol: &str) -> Option<super::super::MarketInfo> {
            None
        }
        async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                bid: dec!(99.9),
                ask: dec!(100.1),
                last: dec!(100),
                timestamp: Utc::now(),
            })
        }
        async fn fetch_balance(
            &self,
        ) -> Result<std::collections::HashMap<String, Balance>, ExchangeError> {
            Ok(Default::default())
        }
        async fn create_order(
            &self,
            _symbol: &str,
            _order_type: OrderType,
            _side: OrderSide,
            _amount: Decimal,
            _price: Option<Decimal>,
            _client_order_id: Option<String>,
        ) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Exchange("not implemented".into()))
        }
        async fn cancel_order(&self, _order_id: &str, _symbol: &str) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Exchange("not implemented".into()))
        }
        async fn fetch_order(&self, _order_id: &str, _symbol: &str) -> Result<Order, ExchangeError> {
            Err(ExchangeError::Exchange("not implemented".into()))
        }
        async fn fetch_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<Order>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_ohlcv(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _limit: u32,
        ) -> Result<Vec<Candle>, ExchangeError> {
            Ok(Vec::new())
        }
        async fn fetch_my_trades(
            &self,
            _symbol: &str,
            _limit: u32,
        ) -> Result<Vec<Fill>, ExchangeError> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn stream_url_lowercases_and_strips() {
        assert_eq!(
            stream_url(BINANCE_STREAM_BASE, "BTC/USDT"),
            "wss://stream.binance.com:9443/ws/btcusdt@bookTicker"
        );
    }

    #[test]
    fn parses_book_ticker_payload() {
        let text = r#"{"u":400900217,"s":"BTCUSDT","b":"40000.10","B":"31.2","a":"40000.30","A":"40.6"}"#;
        let ticker = parse_book_ticker("BTC/USDT", text).unwrap();
        assert_eq!(ticker.bid, dec!(40000.10));
        assert_eq!(ticker.ask, dec!(40000.30));
        assert_eq!(ticker.last, dec!(40000.20));
        assert_eq!(ticker.symbol, "BTC/USDT");
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(parse_book_ticker("BTC/USDT", "{}").is_err());
        assert!(parse_book_ticker("BTC/USDT", "not json").is_err());
    }

    #[tokio::test]
    async fn poll_fallback_delivers_ticks_and_stops() {
        let handler = Arc::new(WebSocketHandler::polling(
            Arc::new(StaticExchange),
            Duration::from_millis(10),
        ));
        let count = Arc::new(AtomicUsize::new(0));
        let count_cb = count.clone();

        handler.subscribe(
            "BTC/USDT",
            Arc::new(move |ticker| {
                assert_eq!(ticker.symbol, "BTC/USDT");
                count_cb.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handler.start();

        tokio::time::sleep(Duration::from_millis(60)).await;
        handler.stop().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected at least 2 polled ticks, got {seen}");

        // No further callbacks after stop.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }
}
