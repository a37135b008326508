use thiserror::Error;

/// Error taxonomy for the gateway core.
///
/// The surface maps these onto HTTP: `EndpointNotAvailable` becomes 501,
/// `RateLimitExhausted` becomes 429 with a Retry-After header, everything
/// else becomes 500 with the upstream message preserved. Observability
/// failures never appear here — they are swallowed at the call site.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("'{endpoint}' is not available for provider '{provider}'")]
    EndpointNotAvailable { endpoint: String, provider: String },

    #[error("rate limit persisted through {attempts} attempts")]
    RateLimitExhausted {
        attempts: u32,
        retry_after: Option<u64>,
    },

    #[error("gave up after {attempts} attempts (last status: {last_status}): {last_error}")]
    RetryExhausted {
        attempts: u32,
        last_status: u16,
        last_error: String,
    },

    #[error("upstream returned {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        retry_after: Option<u64>,
    },

    #[error("network error: {0}")]
    Network(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl GatewayError {
    /// HTTP status of the upstream failure, if the error carries one.
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            GatewayError::Upstream { status, .. } => Some(*status),
            GatewayError::RateLimitExhausted { .. } => Some(429),
            GatewayError::RetryExhausted { last_status, .. } => Some(*last_status),
            _ => None,
        }
    }

    /// Retry-After hint in seconds, if the upstream supplied one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            GatewayError::Upstream { retry_after, .. } => *retry_after,
            GatewayError::RateLimitExhausted { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Cost-row status column for this failure: `rate_limit` or `error`.
    pub fn cost_status(&self) -> &'static str {
        match self {
            GatewayError::RateLimitExhausted { .. } => "rate_limit",
            _ => "error",
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        GatewayError::Network(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_status_extraction() {
        let e = GatewayError::Upstream {
            status: 503,
            message: "overloaded".into(),
            retry_after: Some(30),
        };
        assert_eq!(e.upstream_status(), Some(503));
        assert_eq!(e.retry_after(), Some(30));
        assert_eq!(e.cost_status(), "error");
    }

    #[test]
    fn rate_limit_maps_to_429() {
        let e = GatewayError::RateLimitExhausted {
            attempts: 4,
            retry_after: None,
        };
        assert_eq!(e.upstream_status(), Some(429));
        assert_eq!(e.cost_status(), "rate_limit");
    }

    #[test]
    fn translation_has_no_status() {
        let e = GatewayError::Translation("unknown role".into());
        assert_eq!(e.upstream_status(), None);
    }
}
