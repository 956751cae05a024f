// =============================================================================
// Classified exchange error taxonomy
// =============================================================================
//
// Adapters translate raw exchange failures into these kinds. The retry layer
// keys off `is_retryable()`: rate-limit, network and timeout errors may be
// retried; authentication, invalid-order and insufficient-funds errors are
// fatal for the call and bubble straight to the caller.
// =============================================================================

use thiserror::Error;

/// Errors raised by exchange operations.
#[derive(Debug, Clone, Error)]
pub enum ExchangeError {
    /// Credentials rejected. Fatal; never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Balance short for the requested order. Fatal for the call.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// Order parameters violate exchange filters even after rounding.
    #[error("invalid order: {0}")]
    InvalidOrder(String),

    /// Order notional (price x quantity) below the market minimum.
    #[error("insufficient notional: {0}")]
    InsufficientNotional(String),

    /// The exchange does not know the order id.
    #[error("order not found: {0}")]
    OrderNotFound(String),

    /// Rate limit exceeded; retryable with longer backoff.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Transport-level failure (DNS, TLS, connection reset, 5xx).
    #[error("network error: {0}")]
    Network(String),

    /// The per-call timeout elapsed.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Anything else the exchange reported that we could not classify.
    #[error("exchange error: {0}")]
    Exchange(String),
}

impl ExchangeError {
    /// Whether the retry policy may re-attempt the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimit(_) | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Short stable tag for logs and alert keys.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authentication(_) => "authentication",
            Self::InsufficientFunds(_) => "insufficient_funds",
            Self::InvalidOrder(_) => "invalid_order",
            Self::InsufficientNotional(_) => "insufficient_notional",
            Self::OrderNotFound(_) => "order_not_found",
            Self::RateLimit(_) => "rate_limit",
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::Exchange(_) => "exchange",
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            Self::Network(err.to_string())
        } else {
            Self::Exchange(err.to_string())
        }
    }
}

/// Errors raised by the startup reconciliation protocol. Unresolvable drift
/// aborts startup.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Persistence claims an order is closed but the exchange still has it
    /// open. Indicates a logic bug or database corruption.
    #[error("order {order_id} is closed locally but open on the exchange")]
    ClosedLocallyOpenRemotely { order_id: String },

    /// A discrepancy requires a human decision under the Manual policy.
    #[error("manual resolution required for order {order_id}: {detail}")]
    ManualResolutionRequired { order_id: String, detail: String },

    #[error("exchange error during reconciliation: {0}")]
    Exchange(#[from] ExchangeError),

    #[error("persistence error during reconciliation: {0}")]
    Persistence(#[from] sqlx::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ExchangeError::RateLimit("429".into()).is_retryable());
        assert!(ExchangeError::Network("reset".into()).is_retryable());
        assert!(ExchangeError::Timeout("30s".into()).is_retryable());
        assert!(!ExchangeError::Authentication("bad key".into()).is_retryable());
        assert!(!ExchangeError::InsufficientFunds("short".into()).is_retryable());
        assert!(!ExchangeError::InvalidOrder("tick".into()).is_retryable());
        assert!(!ExchangeError::OrderNotFound("42".into()).is_retryable());
    }

    #[test]
    fn kind_tags_are_stable() {
        assert_eq!(ExchangeError::RateLimit(String::new()).kind(), "rate_limit");
        assert_eq!(
            ExchangeError::InsufficientNotional(String::new()).kind(),
            "insufficient_notional"
        );
    }
}
