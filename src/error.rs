use log::error;
use std::fmt::Display;
use std::process::exit;
use std::time::Duration;
use thiserror::Error;

/// Caller-side invariant violations. These fail the call immediately and
/// are never produced by downstream services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} out of range: {value} not in {range}")]
    OutOfRange {
        field: &'static str,
        value: String,
        range: &'static str,
    },
    #[error("time range starts at {start} after its end {end}")]
    InvertedTimeRange { start: String, end: String },
    #[error("reservation {id:?} has no players")]
    EmptyFlight { id: String },
    #[error("unknown weather provider {0:?}")]
    UnknownProvider(String),
    #[error("unknown club type {0:?}")]
    UnknownClubType(String),
    #[error("membership references unknown club {0:?}")]
    UnknownClub(String),
    #[error("samples are not contiguous at {at}")]
    GappySamples { at: String },
}

/// The shared failure taxonomy for everything that talks to an external
/// system. Weather and CRM adapters both raise these kinds; the services
/// above them translate kinds into failover and isolation decisions.
#[derive(Error, Debug, Clone)]
pub enum ProviderError {
    /// Credentials rejected. Surfaced, never refreshed automatically.
    #[error("credentials rejected")]
    Unauthorized,
    /// Provider returned 429. The retry-after, when present, arms the
    /// rate limiter before this error propagates.
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    /// Well-formed transport, unparseable or contract-violating payload.
    #[error("bad response: {0}")]
    BadResponse(String),
    /// The provider declines the location. The strategy selector should
    /// have prevented this; treat occurrences as a bug signal.
    #[error("location outside provider coverage")]
    OutOfCoverage,
    #[error("transient failure: {0}")]
    Transient(String),
    /// Non-retryable: 4xx other than 401/429, or an upstream contract
    /// broken in a way waiting will not fix.
    #[error("permanent failure: {0}")]
    Permanent(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

impl ProviderError {
    /// Whether the kind is worth retrying in place with a fixed delay.
    /// Only the CRM layer retries; the weather layer fails over instead.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Transient(_))
    }

    /// Whether the weather service should move on to the next provider.
    pub const fn is_failover(&self) -> bool {
        !matches!(self, Self::Cancelled | Self::Validation(_))
    }
}

pub fn exit_if_handle_fatal<E, R>(error: E) -> R
where
    E: Display,
{
    error!("Fatal error: {error}");

    exit(1)
}

#[cfg(test)]
mod tests {
    use crate::error::ProviderError;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn retryable_kinds() {
        assert!(ProviderError::Timeout.is_retryable());
        assert!(ProviderError::Transient("connection reset".into()).is_retryable());
        assert!(!ProviderError::Permanent("404".into()).is_retryable());
        assert!(!ProviderError::Unauthorized.is_retryable());
        assert!(!ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(60))
        }
        .is_retryable());
    }

    #[test]
    fn failover_kinds() {
        assert!(ProviderError::Unauthorized.is_failover());
        assert!(ProviderError::OutOfCoverage.is_failover());
        assert!(ProviderError::Permanent("teapot".into()).is_failover());
        assert!(!ProviderError::Cancelled.is_failover());
    }

    #[test]
    fn messages_never_include_retry_after_value() {
        let e = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(61)),
        };
        assert_eq!("rate limited by provider", e.to_string());
    }
}
