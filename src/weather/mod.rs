pub mod cache;
pub mod model;
pub mod providers;
pub mod rate_limit;
pub mod selector;
pub mod service;

use crate::cancel::CancellationToken;
use crate::error::ProviderError;
use crate::model::TimeRange;
use crate::units::{Coordinates, Location, Percent};
use crate::weather::cache::LocationCache;
use crate::weather::model::{BlockSize, WeatherCode};
use crate::weather::rate_limit::{RateLimiter, RatePolicy};
use chrono::{DateTime, Utc};
use geo::{Contains, Coord, Point, Rect};
use reqwest::blocking::Client;
use serde::Deserialize;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, Instant};
use std::vec::IntoIter;

pub use model::{WeatherForecast, WeatherSample};

/// Geographic region a provider is willing to answer for.
#[derive(Debug, Clone, Copy)]
pub enum Coverage {
    Global,
    BoundingBox {
        min_lat: f64,
        min_lon: f64,
        max_lat: f64,
        max_lon: f64,
    },
}

impl Coverage {
    pub fn contains(&self, coordinates: &Coordinates) -> bool {
        match *self {
            Self::Global => true,
            Self::BoundingBox {
                min_lat,
                min_lon,
                max_lat,
                max_lon,
            } => {
                let rect = Rect::new(
                    Coord {
                        x: min_lon,
                        y: min_lat,
                    },
                    Coord {
                        x: max_lon,
                        y: max_lat,
                    },
                );

                rect.contains(&Point::new(
                    coordinates.longitude.into(),
                    coordinates.latitude.into(),
                ))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRequirement {
    Anonymous,
    ApiKey,
}

/// Horizon bands shared by every adapter's cache-expiry policy: short is
/// up to two days out, medium up to a week, long beyond that.
pub const SHORT_HORIZON_HOURS: u32 = 48;
pub const MEDIUM_HORIZON_HOURS: u32 = 168;

/// Static description of one weather adapter: where it answers, how
/// often its model runs, how wide its forecast cells are per horizon,
/// and what its outbound calls must respect.
#[derive(Debug)]
pub struct ProviderManifest {
    pub provider_id: &'static str,
    pub coverage: Coverage,
    pub update_cadence: Duration,
    pub auth: AuthRequirement,
    pub default_rate_policy: RatePolicy,
    /// `(max_hours_ahead_inclusive, block)` rows scanned in order; the
    /// last row's block also serves anything beyond the final bound.
    pub block_size_bands: &'static [(u32, BlockSize)],
    /// Canonical-code → probability table used when the wire carries no
    /// explicit thunder probability.
    pub thunder_inference: &'static [(WeatherCode, f64)],
}

impl ProviderManifest {
    pub fn block_size_for(&self, hours_ahead: u32) -> BlockSize {
        self.block_size_bands
            .iter()
            .find(|(bound, _)| hours_ahead <= *bound)
            .or(self.block_size_bands.last())
            .map(|(_, block)| *block)
            .unwrap_or(BlockSize::OneHour)
    }

    pub fn infer_thunder(&self, code: WeatherCode) -> Option<Percent> {
        self.thunder_inference
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, pct)| Percent::from(*pct))
    }
}

/// Cache lifetime knobs from provider configuration, banded by horizon.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtlConfig {
    #[serde(default = "default_ttl_short")]
    pub cache_ttl_short_s: u64,
    #[serde(default = "default_ttl_medium")]
    pub cache_ttl_medium_s: u64,
    #[serde(default = "default_ttl_long")]
    pub cache_ttl_long_s: u64,
}

const fn default_ttl_short() -> u64 {
    30 * 60
}

const fn default_ttl_medium() -> u64 {
    3 * 60 * 60
}

const fn default_ttl_long() -> u64 {
    12 * 60 * 60
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            cache_ttl_short_s: default_ttl_short(),
            cache_ttl_medium_s: default_ttl_medium(),
            cache_ttl_long_s: default_ttl_long(),
        }
    }
}

impl CacheTtlConfig {
    pub const fn ttl_for(&self, hours_ahead: u32) -> Duration {
        let seconds = if hours_ahead <= SHORT_HORIZON_HOURS {
            self.cache_ttl_short_s
        } else if hours_ahead <= MEDIUM_HORIZON_HOURS {
            self.cache_ttl_medium_s
        } else {
            self.cache_ttl_long_s
        };

        Duration::from_secs(seconds)
    }
}

/// Rate knobs from provider configuration. Unset fields fall back to the
/// manifest's default policy.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Default)]
pub struct RateConfig {
    #[serde(default)]
    pub min_interval_s: Option<f64>,
    #[serde(default)]
    pub per_window: Option<WindowConfig>,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct WindowConfig {
    pub n: u32,
    pub window_s: u64,
}

impl RateConfig {
    pub fn into_policy(self, fallback: RatePolicy) -> RatePolicy {
        if let Some(window) = self.per_window {
            return RatePolicy::PerWindow {
                calls: window.n,
                window: Duration::from_secs(window.window_s),
            };
        }

        if let Some(seconds) = self.min_interval_s {
            return RatePolicy::MinInterval(Duration::from_secs_f64(seconds));
        }

        fallback
    }
}

/// Forecast horizon: whole hours between now and the requested window's
/// start, clamped at zero for windows already underway.
pub fn horizon_hours(now: DateTime<Utc>, range: &TimeRange) -> u32 {
    u32::try_from(
        range
            .start_utc()
            .signed_duration_since(now)
            .num_hours()
            .max(0),
    )
    .unwrap_or(u32::MAX)
}

/// Everything an adapter needs to perform one fetch. The clock is
/// injected so expiry arithmetic is testable.
pub struct FetchContext<'a> {
    pub client: &'a Client,
    pub rate_limiter: &'a RateLimiter,
    pub location_cache: &'a LocationCache,
    pub cancel: &'a CancellationToken,
    pub deadline: Option<Instant>,
    pub now: DateTime<Utc>,
}

pub trait WeatherProvider: Debug {
    fn manifest(&self) -> &'static ProviderManifest;

    /// Fetches, parses and normalizes one forecast. Implementations must
    /// go through the shared HTTP layer (which owns the rate-limiter
    /// gate) and must restrict the returned samples to `time_range`.
    fn fetch(
        &self,
        context: &FetchContext<'_>,
        location: &Location,
        time_range: &TimeRange,
    ) -> Result<WeatherForecast, ProviderError>;

    fn id(&self) -> &'static str {
        self.manifest().provider_id
    }

    /// Effective outbound policy: configuration override or the
    /// manifest default.
    fn rate_policy(&self) -> RatePolicy {
        self.manifest().default_rate_policy
    }
}

/// The configured provider set. Declaration order is the fixed priority
/// order the strategy selector scans.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct Providers {
    nordic: Option<providers::nordic::Nordic>,
    citygrid: Option<providers::citygrid::Citygrid>,
    global: Option<providers::global::Global>,
    nogoodnik: Option<providers::nogoodnik::Nogoodnik>,
}

impl Providers {
    pub fn with_nordic(mut self, nordic: providers::nordic::Nordic) -> Self {
        self.nordic = Some(nordic);
        self
    }

    pub fn with_citygrid(mut self, citygrid: providers::citygrid::Citygrid) -> Self {
        self.citygrid = Some(citygrid);
        self
    }

    pub fn with_global(mut self, global: providers::global::Global) -> Self {
        self.global = Some(global);
        self
    }

    pub fn with_nogoodnik(mut self, nogoodnik: providers::nogoodnik::Nogoodnik) -> Self {
        self.nogoodnik = Some(nogoodnik);
        self
    }
}

/// Shared `enabled` default: a configured provider section is active
/// unless it says otherwise.
pub const fn default_enabled() -> bool {
    true
}

impl IntoIterator for Providers {
    type Item = Arc<dyn WeatherProvider + Send + Sync>;
    type IntoIter = IntoIter<Arc<dyn WeatherProvider + Send + Sync>>;

    fn into_iter(self) -> Self::IntoIter {
        let mut vec: Vec<Arc<dyn WeatherProvider + Send + Sync>> = vec![];

        if let Some(provider) = self.nordic.filter(|p| p.enabled) {
            vec.push(Arc::new(provider));
        }

        if let Some(provider) = self.citygrid.filter(|p| p.enabled) {
            vec.push(Arc::new(provider));
        }

        if let Some(provider) = self.global.filter(|p| p.enabled) {
            vec.push(Arc::new(provider));
        }

        if let Some(provider) = self.nogoodnik.filter(|p| p.enabled) {
            vec.push(Arc::new(provider));
        }

        vec.into_iter()
    }
}
