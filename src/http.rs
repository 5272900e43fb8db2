use crate::cancel::CancellationToken;
use crate::error::ProviderError;
use crate::weather::rate_limit::RateLimiter;
use failsafe::backoff::{exponential, Exponential};
use failsafe::failure_policy::{consecutive_failures, ConsecutiveFailures};
use failsafe::{CircuitBreaker, Config, Error, StateMachine};
use log::{debug, trace, warn};
use once_cell::sync::Lazy;
use reqwest::blocking::{Client, Response};
use reqwest::header::{HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::RwLock;
use std::time::{Duration, Instant};

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(7);
pub const READ_TIMEOUT: Duration = Duration::from_secs(20);

/// Builds the blocking client every adapter shares. Per-request headers
/// carry the provider-specific pieces (user agent, authentication).
pub fn blocking_client() -> Result<Client, ProviderError> {
    Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(READ_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::Permanent(format!("HTTP client construction failed: {e}")))
}

/// Fixed-delay retry policy. Retries apply only to kinds
/// `ProviderError::is_retryable` accepts: transient network failures and
/// 5xx responses.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Weather adapters never retry in place; the service fails over.
    pub const NONE: Self = Self {
        attempts: 0,
        delay: Duration::ZERO,
    };

    /// CRM adapters retry three times with a fixed five second delay.
    pub const CRM: Self = Self {
        attempts: 3,
        delay: Duration::from_secs(5),
    };
}

pub struct OutboundRequest<'a> {
    pub source: &'a str,
    pub client: &'a Client,
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub user_agent: &'a str,
    pub retry: RetryPolicy,
    /// When present, `acquire` is called immediately before every
    /// outbound attempt, and an observed Retry-After arms the limiter.
    pub rate_gate: Option<(&'a RateLimiter, &'a str)>,
    pub cancel: &'a CancellationToken,
    pub deadline: Option<Instant>,
}

pub fn fetch_json<T: Debug + DeserializeOwned>(
    request: &OutboundRequest<'_>,
) -> Result<T, ProviderError> {
    let body = fetch_text(request)?;

    trace!("Deserializing body for {:?}", request.source);

    serde_json::from_str(&body)
        .map_err(|e| ProviderError::BadResponse(format!("undeserializable payload: {e}")))
}

pub fn fetch_text(request: &OutboundRequest<'_>) -> Result<String, ProviderError> {
    let mut attempt: u32 = 0;

    loop {
        request.cancel.ensure_live()?;

        if request.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ProviderError::Timeout);
        }

        if let Some((limiter, provider_id)) = request.rate_gate {
            limiter.acquire(provider_id, request.cancel, request.deadline)?;
        }

        match dispatch(request) {
            Ok(body) => return Ok(body),
            Err(error) => {
                if let ProviderError::RateLimited {
                    retry_after: Some(retry_after),
                } = &error
                {
                    if let Some((limiter, provider_id)) = request.rate_gate {
                        limiter.observe_retry_after(provider_id, *retry_after);
                    }
                }

                if error.is_retryable() && attempt < request.retry.attempts {
                    attempt += 1;
                    debug!(
                        "Retrying {:?} request to {} (attempt {attempt} of {}): {error}",
                        request.source,
                        redacted(&request.url),
                        request.retry.attempts
                    );
                    sleep_cancellable(request.retry.delay, request.cancel)?;
                    continue;
                }

                return Err(error);
            }
        }
    }
}

const CONSECUTIVE_FAILURE_COUNT: u32 = 3;
const EXPONENTIAL_BACKOFF_START_SECS: u64 = 30;
const EXPONENTIAL_BACKOFF_MAX_SECS: u64 = 300;

type HostCircuitBreaker = StateMachine<ConsecutiveFailures<Exponential>, ()>;

static CIRCUIT_BREAKER_REGISTRY: Lazy<RwLock<HashMap<String, HostCircuitBreaker>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

fn create_circuit_breaker() -> HostCircuitBreaker {
    Config::new()
        .failure_policy(consecutive_failures(
            CONSECUTIVE_FAILURE_COUNT,
            exponential(
                Duration::from_secs(EXPONENTIAL_BACKOFF_START_SECS),
                Duration::from_secs(EXPONENTIAL_BACKOFF_MAX_SECS),
            ),
        ))
        .build()
}

/// One attempt through the per-host circuit breaker. Only kinds that
/// indicate host trouble (timeouts, transport failures, 5xx) count as
/// breaker failures; auth and client errors pass through without
/// tripping it.
fn dispatch(request: &OutboundRequest<'_>) -> Result<String, ProviderError> {
    let host = request
        .url
        .host_str()
        .ok_or_else(|| ProviderError::Permanent("URL without a host".to_owned()))?
        .to_owned();

    {
        let registry = CIRCUIT_BREAKER_REGISTRY.read().expect("Poisoned lock");

        if let Some(breaker) = registry.get(&host) {
            return call_through_breaker(&host, breaker, request);
        }
    }

    {
        let mut registry = CIRCUIT_BREAKER_REGISTRY.write().expect("Poisoned lock");

        registry
            .entry(host.clone())
            .or_insert_with(create_circuit_breaker);
    }

    let registry = CIRCUIT_BREAKER_REGISTRY.read().expect("Poisoned lock");
    let breaker = registry
        .get(&host)
        .expect("Circuit breaker must now exist");

    call_through_breaker(&host, breaker, request)
}

fn call_through_breaker(
    host: &str,
    breaker: &HostCircuitBreaker,
    request: &OutboundRequest<'_>,
) -> Result<String, ProviderError> {
    match breaker.call(|| send_once(request)) {
        Err(Error::Inner(e)) => Err(e),
        Err(Error::Rejected) => {
            warn!("Circuit breaker for {host:?} is open, request rejected");
            Err(ProviderError::Transient(format!(
                "circuit breaker open for {host}"
            )))
        }
        Ok(classified) => classified,
    }
}

/// Sends one request. The outer `Err` carries breaker-countable kinds;
/// everything else is returned through the inner result.
#[allow(clippy::result_large_err)]
fn send_once(
    request: &OutboundRequest<'_>,
) -> Result<Result<String, ProviderError>, ProviderError> {
    let mut headers = request.headers.clone();

    if let Ok(value) = HeaderValue::from_str(request.user_agent) {
        headers.insert(USER_AGENT, value);
    }

    let response = request
        .client
        .request(request.method.clone(), request.url.clone())
        .headers(headers)
        .send()
        .map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Transient(format!("transport failure: {e}"))
            }
        })?;

    trace!(
        "Request to {} returned status {}",
        redacted(&request.url),
        response.status()
    );

    match classify_status(response.status(), retry_after_of(&response)) {
        None => Ok(response
            .text()
            .map_err(|e| ProviderError::Transient(format!("body read failed: {e}")))),
        Some(error @ (ProviderError::Timeout | ProviderError::Transient(_))) => Err(error),
        Some(error) => Ok(Err(error)),
    }
}

fn retry_after_of(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Maps a response status into the shared taxonomy. `None` is success.
pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> Option<ProviderError> {
    if status.is_success() {
        return None;
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Some(ProviderError::Unauthorized);
    }

    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(ProviderError::RateLimited { retry_after });
    }

    if status.is_client_error() {
        return Some(ProviderError::Permanent(format!("status {status}")));
    }

    if status.is_server_error() {
        return Some(ProviderError::Transient(format!("status {status}")));
    }

    Some(ProviderError::Permanent(format!(
        "unexpected status {status}"
    )))
}

const SLEEP_SLICE: Duration = Duration::from_millis(100);

fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> Result<(), ProviderError> {
    let wake_at = Instant::now() + duration;

    loop {
        cancel.ensure_live()?;

        let now = Instant::now();
        if now >= wake_at {
            return Ok(());
        }

        std::thread::sleep((wake_at - now).min(SLEEP_SLICE));
    }
}

const SENSITIVE_QUERY_KEYS: [&str; 6] = ["token", "appauth", "apikey", "api_key", "key", "secret"];

/// Display form of a URL with credential-bearing query values masked.
/// Everything this module logs goes through here.
pub fn redacted(url: &Url) -> String {
    let mut clone = url.clone();

    let masked: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            let lowered = k.to_lowercase();
            if SENSITIVE_QUERY_KEYS.contains(&lowered.as_str()) {
                (k.into_owned(), "***".to_owned())
            } else {
                (k.into_owned(), v.into_owned())
            }
        })
        .collect();

    if masked.is_empty() {
        return clone.to_string();
    }

    clone
        .query_pairs_mut()
        .clear()
        .extend_pairs(masked.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    clone.to_string()
}

#[cfg(test)]
mod tests {
    use crate::cancel::CancellationToken;
    use crate::error::ProviderError;
    use crate::http::{classify_status, redacted, sleep_cancellable, RetryPolicy};
    use pretty_assertions::assert_eq;
    use reqwest::{StatusCode, Url};
    use std::time::{Duration, Instant};

    #[test]
    fn success_statuses_classify_to_none() {
        assert!(classify_status(StatusCode::OK, None).is_none());
        assert!(classify_status(StatusCode::CREATED, None).is_none());
    }

    #[test]
    fn auth_statuses_classify_to_unauthorized() {
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, None),
            Some(ProviderError::Unauthorized)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, None),
            Some(ProviderError::Unauthorized)
        ));
    }

    #[test]
    fn rate_limit_carries_retry_after() {
        let classified = classify_status(
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(60)),
        );

        assert!(matches!(
            classified,
            Some(ProviderError::RateLimited {
                retry_after: Some(d)
            }) if d == Duration::from_secs(60)
        ));
    }

    #[test]
    fn client_errors_are_permanent_server_errors_transient() {
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, None),
            Some(ProviderError::Permanent(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, None),
            Some(ProviderError::Transient(_))
        ));
    }

    #[test]
    fn retry_policies() {
        assert_eq!(0, RetryPolicy::NONE.attempts);
        assert_eq!(3, RetryPolicy::CRM.attempts);
        assert_eq!(Duration::from_secs(5), RetryPolicy::CRM.delay);
    }

    #[test]
    fn redaction_masks_credential_query_values() {
        let url = Url::parse(
            "https://api.example.com/reservations?from=2026-08-01&appauth=sekrit&token=alsosekrit",
        )
        .unwrap();

        let shown = redacted(&url);

        assert!(!shown.contains("sekrit"));
        assert!(shown.contains("appauth=***"));
        assert!(shown.contains("token=***"));
        assert!(shown.contains("from=2026-08-01"));
    }

    #[test]
    fn redaction_leaves_plain_urls_alone() {
        let url = Url::parse("https://api.example.com/forecast?lat=59.89&lon=10.82").unwrap();

        assert_eq!(url.to_string(), redacted(&url));
    }

    #[test]
    fn cancelled_sleep_returns_early() {
        let token = CancellationToken::new();
        token.cancel();

        let started = Instant::now();
        let result = sleep_cancellable(Duration::from_secs(5), &token);

        assert!(matches!(result, Err(ProviderError::Cancelled)));
        assert!(started.elapsed() < Duration::from_millis(500));
    }
}
