use thiserror::Error;

/// Persistence failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// A unique key (external id, market key, selection params) already exists.
    #[error("conflict on {entity}: {key}")]
    Conflict { entity: &'static str, key: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("store backend: {0}")]
    Backend(String),
}

/// Pipeline error taxonomy. Every variant is recoverable; callers log it and
/// move on to the next event, market or provider call.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FeedError {
    /// Timeout or connection failure. Retried on the next poll cycle.
    #[error("{provider} network error: {message}")]
    Network { provider: String, message: String },

    /// The provider signalled throttling; its limiter is now cooling down.
    #[error("{provider} rate limited")]
    RateLimited { provider: String },

    /// The local limiter refused the request; nothing was sent.
    #[error("{provider} request budget exhausted")]
    BudgetExhausted { provider: String },

    #[error("{provider} HTTP {status}")]
    Http { provider: String, status: u16 },

    /// Malformed payload or record.
    #[error("{provider} parse error: {message}")]
    Parse { provider: String, message: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unknown market type for {market_key}")]
    UnknownMarketType { market_key: String },

    #[error("settlement of event {event_id} failed: {message}")]
    Settlement { event_id: i64, message: String },

    #[error("operation cancelled")]
    Cancelled,
}

impl FeedError {
    pub fn network(provider: &str, message: impl Into<String>) -> Self {
        FeedError::Network { provider: provider.to_string(), message: message.into() }
    }

    pub fn parse(provider: &str, message: impl Into<String>) -> Self {
        FeedError::Parse { provider: provider.to_string(), message: message.into() }
    }

    /// Errors that mean "stop spending requests on this provider this cycle".
    pub fn is_budget_stop(&self) -> bool {
        matches!(self, FeedError::RateLimited { .. } | FeedError::BudgetExhausted { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            FeedError::Network { .. } => "network",
            FeedError::RateLimited { .. } => "rate_limited",
            FeedError::BudgetExhausted { .. } => "budget_exhausted",
            FeedError::Http { .. } => "http",
            FeedError::Parse { .. } => "parse",
            FeedError::Store(_) => "store",
            FeedError::UnknownMarketType { .. } => "unknown_market_type",
            FeedError::Settlement { .. } => "settlement",
            FeedError::Cancelled => "cancelled",
        }
    }
}

pub type FeedResult<T> = std::result::Result<T, FeedError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: FeedError = StoreError::Conflict { entity: "event", key: "betsapi:1".into() }.into();
        assert_eq!(err.kind(), "store");
        assert_eq!(err.to_string(), "store error: conflict on event: betsapi:1");
    }

    #[test]
    fn test_budget_stop_classification() {
        assert!(FeedError::RateLimited { provider: "oddsapi".into() }.is_budget_stop());
        assert!(FeedError::BudgetExhausted { provider: "oddsapi".into() }.is_budget_stop());
        assert!(!FeedError::network("oddsapi", "timeout").is_budget_stop());
    }
}
