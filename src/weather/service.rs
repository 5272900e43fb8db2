use crate::aggregator::ErrorAggregator;
use crate::cancel::CancellationToken;
use crate::error::ProviderError;
use crate::http::blocking_client;
use crate::model::TimeRange;
use crate::units::Location;
use crate::weather::cache::{LocationCache, ResponseCache, ResponseKey};
use crate::weather::model::WeatherForecast;
use crate::weather::rate_limit::RateLimiter;
use crate::weather::selector::{by_id, select, SharedProvider};
use crate::weather::{horizon_hours, FetchContext};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use moka::sync::{Cache as MokaCache, CacheBuilder};
use reqwest::blocking::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Overall budget for one weather fetch, including any rate-limiter
/// wait.
const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifetime of a single-flight entry. Long enough to collapse a burst of
/// identical requests into one upstream call, short enough that the
/// durable response cache stays the source of truth.
const SINGLE_FLIGHT_TTL: Duration = Duration::from_secs(1);
const SINGLE_FLIGHT_CAPACITY: u64 = 10_000;

/// What a weather request resolved to. `Stale` carries an expired cache
/// entry served best-effort after every live provider failed.
#[derive(Debug, Clone, PartialEq)]
pub enum WeatherOutcome {
    Fresh(WeatherForecast),
    Stale(WeatherForecast),
    Unavailable,
}

impl WeatherOutcome {
    pub const fn forecast(&self) -> Option<&WeatherForecast> {
        match self {
            Self::Fresh(forecast) | Self::Stale(forecast) => Some(forecast),
            Self::Unavailable => None,
        }
    }

    pub const fn served_stale(&self) -> bool {
        matches!(self, Self::Stale(_))
    }
}

/// Public entry point of the weather layer: provider selection, the
/// response cache, failover and stale service composed behind one call.
pub struct WeatherService {
    providers: Vec<SharedProvider>,
    response_cache: ResponseCache,
    location_cache: LocationCache,
    rate_limiter: Arc<RateLimiter>,
    aggregator: Arc<ErrorAggregator>,
    client: Client,
    single_flight: MokaCache<ResponseKey, WeatherOutcome>,
}

impl WeatherService {
    pub fn new(
        providers: Vec<SharedProvider>,
        response_cache: ResponseCache,
        location_cache: LocationCache,
        rate_limiter: Arc<RateLimiter>,
        aggregator: Arc<ErrorAggregator>,
    ) -> anyhow::Result<Self> {
        for provider in &providers {
            rate_limiter.register(provider.id(), provider.rate_policy());
        }

        Ok(Self {
            providers,
            response_cache,
            location_cache,
            rate_limiter,
            aggregator,
            client: blocking_client()?,
            single_flight: CacheBuilder::new(SINGLE_FLIGHT_CAPACITY)
                .time_to_live(SINGLE_FLIGHT_TTL)
                .build(),
        })
    }

    pub fn get_weather(
        &self,
        location: &Location,
        time_range: &TimeRange,
        override_provider: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<WeatherOutcome, ProviderError> {
        self.get_weather_at(location, time_range, override_provider, cancel, Utc::now())
    }

    /// Clock-injected variant backing `get_weather`; exercised directly
    /// by tests so cache expiry is deterministic.
    pub fn get_weather_at(
        &self,
        location: &Location,
        time_range: &TimeRange,
        override_provider: Option<&str>,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<WeatherOutcome, ProviderError> {
        let chain = self.chain(location, override_provider)?;

        let Some(primary) = chain.first() else {
            debug!("No provider covers {:?}", location.coordinates());
            return Ok(WeatherOutcome::Unavailable);
        };

        // Concurrent identical requests collapse into one resolution;
        // waiters share its outcome. Failed resolutions are not retained.
        let key = key_for(primary, location, time_range, now);

        self.single_flight
            .try_get_with_by_ref(&key, || {
                self.resolve(&chain, location, time_range, cancel, now)
            })
            .map_err(|error: Arc<ProviderError>| (*error).clone())
    }

    fn chain(
        &self,
        location: &Location,
        override_provider: Option<&str>,
    ) -> Result<Vec<SharedProvider>, ProviderError> {
        if let Some(id) = override_provider {
            let provider = by_id(&self.providers, id)
                .ok_or_else(|| crate::error::ValidationError::UnknownProvider(id.to_owned()))?;

            return Ok(vec![provider]);
        }

        Ok(select(&self.providers, location.coordinates()).map_or_else(Vec::new, |selection| {
            let mut chain = vec![selection.primary];
            chain.extend(selection.fallback);
            chain
        }))
    }

    fn resolve(
        &self,
        chain: &[SharedProvider],
        location: &Location,
        time_range: &TimeRange,
        cancel: &CancellationToken,
        now: DateTime<Utc>,
    ) -> Result<WeatherOutcome, ProviderError> {
        let deadline = Instant::now() + FETCH_TIMEOUT;

        for provider in chain {
            cancel.ensure_live()?;

            let key = key_for(provider, location, time_range, now);

            match self.response_cache.get(&key, now) {
                Ok(Some(forecast)) => {
                    debug!("Response cache hit for {:?}", provider.id());
                    return Ok(WeatherOutcome::Fresh(forecast));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("Response cache read failed, treating as miss: {error}");
                    self.aggregator.record("weather.cache", &error.to_string());
                }
            }

            // A provider with an armed retry-after is skipped wholesale;
            // queueing behind it would stall failover.
            if self.rate_limiter.is_backing_off(provider.id()) {
                info!("Provider {:?} is backing off, failing over", provider.id());
                continue;
            }

            let context = FetchContext {
                client: &self.client,
                rate_limiter: &self.rate_limiter,
                location_cache: &self.location_cache,
                cancel,
                deadline: Some(deadline),
                now,
            };

            match provider.fetch(&context, location, time_range) {
                Ok(forecast) => {
                    let forecast = forecast.restricted_to(time_range);

                    if let Err(error) = self.response_cache.put(&key, &forecast) {
                        warn!("Response cache write failed: {error}");
                        self.aggregator.record("weather.cache", &error.to_string());
                    }

                    return Ok(WeatherOutcome::Fresh(forecast));
                }
                Err(error) if error.is_failover() => {
                    if matches!(error, ProviderError::OutOfCoverage) {
                        warn!(
                            "Provider {:?} declined {:?} although the selector chose it",
                            provider.id(),
                            location.coordinates()
                        );
                    }

                    info!("Provider {:?} failed ({error}), failing over", provider.id());
                    self.aggregator
                        .record(&format!("weather.{}", provider.id()), &error.to_string());
                }
                Err(error) => return Err(error),
            }
        }

        // Every live provider failed; serve any stale entry best-effort.
        for provider in chain {
            let key = key_for(provider, location, time_range, now);

            match self.response_cache.get_ignoring_expiry(&key) {
                Ok(Some(forecast)) => {
                    info!("Serving stale {:?} forecast best-effort", provider.id());
                    return Ok(WeatherOutcome::Stale(forecast));
                }
                Ok(None) => {}
                Err(error) => {
                    warn!("Stale cache read failed: {error}");
                }
            }
        }

        Ok(WeatherOutcome::Unavailable)
    }
}

fn key_for(
    provider: &SharedProvider,
    location: &Location,
    time_range: &TimeRange,
    now: DateTime<Utc>,
) -> ResponseKey {
    let block_size = provider
        .manifest()
        .block_size_for(horizon_hours(now, time_range));

    ResponseKey::new(provider.id(), location.coordinates(), block_size, time_range)
}
