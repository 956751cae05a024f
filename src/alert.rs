// =============================================================================
// Alerting — channel contract and dispatch
// =============================================================================
//
// Delivery adapters (Telegram, Discord webhooks) live in a separate process;
// the core carries the channel protocol, a tracing-backed channel used by
// default, and the manager that fans alerts out, suppresses repeats and
// records every alert into the alert_logs table.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::persistence::Store;

/// Repeat alerts with the same key inside this window are suppressed.
const REPEAT_SUPPRESSION_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Alert model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// One alert to fan out. `key` groups repeats for suppression (e.g.
/// "circuit_breaker.daily_loss").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub key: String,
    pub message: String,
    pub metadata: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            key: key.into(),
            message: message.into(),
            metadata: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ---------------------------------------------------------------------------
// Channel protocol
// ---------------------------------------------------------------------------

/// A delivery target for alerts. Implementations must be cheap to call and
/// must not panic on delivery failure.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, alert: &Alert) -> anyhow::Result<()>;
}

/// Default channel: structured log lines at a level matching the severity.
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn send(&self, alert: &Alert) -> anyhow::Result<()> {
        match alert.severity {
            AlertSeverity::Info => info!(key = %alert.key, "{}", alert.message),
            AlertSeverity::Warning => warn!(key = %alert.key, "{}", alert.message),
            AlertSeverity::Critical => error!(key = %alert.key, "{}", alert.message),
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Fans alerts out to every registered channel, suppresses repeats per key
/// and persists each dispatched alert.
pub struct AlertManager {
    channels: Vec<Arc<dyn AlertChannel>>,
    store: Option<Arc<Store>>,
    enabled: bool,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertManager {
    pub fn new(enabled: bool) -> Self {
        Self {
            channels: vec![Arc::new(LogChannel) as Arc<dyn AlertChannel>],
            store: None,
            enabled,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Attach the persistence store so alerts are written to alert_logs.
    pub fn with_store(mut self, store: Arc<Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn add_channel(&mut self, channel: Arc<dyn AlertChannel>) {
        self.channels.push(channel);
    }

    /// Dispatch an alert. Returns true when it was sent (not suppressed).
    pub async fn send(&self, alert: Alert) -> bool {
        if !self.enabled {
            return false;
        }

        // Critical alerts are never suppressed.
        if alert.severity != AlertSeverity::Critical && self.is_suppressed(&alert) {
            return false;
        }
        self.last_sent.lock().insert(alert.key.clone(), alert.timestamp);

        for channel in &self.channels {
            let delivered = match channel.send(&alert).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        channel = channel.name(),
                        key = %alert.key,
                        error = %e,
                        "alert delivery failed"
                    );
                    false
                }
            };

            if let Some(store) = &self.store {
                if let Err(e) = store
                    .log_alert(
                        &alert.severity.to_string(),
                        channel.name(),
                        &alert.message,
                        alert.metadata.clone(),
                        delivered,
                    )
                    .await
                {
                    warn!(error = %e, "failed to persist alert log");
                }
            }
        }
        true
    }

    pub async fn info(&self, key: &str, message: impl Into<String>) -> bool {
        self.send(Alert::new(AlertSeverity::Info, key, message)).await
    }

    pub async fn warning(&self, key: &str, message: impl Into<String>) -> bool {
        self.send(Alert::new(AlertSeverity::Warning, key, message)).await
    }

    pub async fn critical(&self, key: &str, message: impl Into<String>) -> bool {
        self.send(Alert::new(AlertSeverity::Critical, key, message)).await
    }

    fn is_suppressed(&self, alert: &Alert) -> bool {
        let last = self.last_sent.lock();
        match last.get(&alert.key) {
            Some(prev) => (alert.timestamp - *prev).num_seconds() < REPEAT_SUPPRESSION_SECS,
            None => false,
        }
    }
}
