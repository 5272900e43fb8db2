use crate::error::ProviderError;
use crate::model::TimeRange;
use crate::units::Location;
use crate::weather::model::{BlockSize, WeatherForecast};
use crate::weather::rate_limit::RatePolicy;
use crate::weather::{
    AuthRequirement, Coverage, FetchContext, ProviderManifest, WeatherProvider,
};
use serde::Deserialize;
use std::time::Duration;

const PROVIDER_ID: &str = "nogoodnik";

pub static MANIFEST: ProviderManifest = ProviderManifest {
    provider_id: PROVIDER_ID,
    coverage: Coverage::Global,
    update_cadence: Duration::from_secs(0),
    auth: AuthRequirement::Anonymous,
    default_rate_policy: RatePolicy::Unlimited,
    block_size_bands: &[(u32::MAX, BlockSize::OneHour)],
    thunder_inference: &[],
};

/// Always fails. Register it in a development configuration to exercise
/// failover and stale-cache behavior without breaking a real provider.
#[derive(Deserialize, Debug, Clone)]
pub struct Nogoodnik {
    #[serde(default = "crate::weather::default_enabled")]
    pub enabled: bool,
}

impl Default for Nogoodnik {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl WeatherProvider for Nogoodnik {
    fn manifest(&self) -> &'static ProviderManifest {
        &MANIFEST
    }

    fn fetch(
        &self,
        _context: &FetchContext<'_>,
        _location: &Location,
        _time_range: &TimeRange,
    ) -> Result<WeatherForecast, ProviderError> {
        Err(ProviderError::Transient(
            "this provider is no good and always fails".to_owned(),
        ))
    }
}
