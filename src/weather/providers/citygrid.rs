//! Citygrid forecast service. API-key protected, city-id keyed: raw
//! coordinates must first be resolved to the provider's nearest grid
//! city through a discovery endpoint. Resolutions are remembered in the
//! location cache for thirty days and reused while the query point stays
//! within fifty kilometers of the resolved city.
//!
//! Wire times are UTC unix timestamps. Temperatures arrive in Kelvin,
//! precipitation as three hour accumulations; both are converted to the
//! canonical units. Forecast cells are always three hours wide.

use crate::error::{ProviderError, ValidationError};
use crate::http::{fetch_json, OutboundRequest, RetryPolicy};
use crate::model::TimeRange;
use crate::units::{Coordinates, Kelvin, Location, MillimetersPerHour, Percent, Ratio, ToCelsius};
use crate::weather::cache::ResolvedLocation;
use crate::weather::model::{BlockSize, DayPhase, WeatherCode, WeatherForecast, WeatherSample};
use crate::weather::rate_limit::RatePolicy;
use crate::weather::{
    AuthRequirement, CacheTtlConfig, Coverage, FetchContext, ProviderManifest, RateConfig,
    WeatherProvider,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use reqwest::{Method, Url};
use serde::Deserialize;
use std::time::Duration;

const PROVIDER_ID: &str = "citygrid";
const GEO_ENDPOINT_URL: &str = "https://api.citygrid-weather.com/geo/1.0/nearest";
const FORECAST_ENDPOINT_URL: &str = "https://api.citygrid-weather.com/data/2.5/forecast";

const LOCATION_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);
const LOCATION_MAX_DISTANCE_KM: f64 = 50.0;
const ACCUMULATION_HOURS: u32 = 3;

pub static MANIFEST: ProviderManifest = ProviderManifest {
    provider_id: PROVIDER_ID,
    coverage: Coverage::BoundingBox {
        min_lat: 45.0,
        min_lon: 5.0,
        max_lat: 55.0,
        max_lon: 17.0,
    },
    update_cadence: Duration::from_secs(1800),
    auth: AuthRequirement::ApiKey,
    default_rate_policy: RatePolicy::MinInterval(Duration::from_secs(1)),
    block_size_bands: &[(u32::MAX, BlockSize::ThreeHours)],
    thunder_inference: &[
        (WeatherCode::Thunder, 80.0),
        (WeatherCode::RainAndThunder, 60.0),
        (WeatherCode::HeavyRainAndThunder, 90.0),
    ],
};

#[derive(Deserialize, Debug, Clone)]
pub struct Citygrid {
    #[serde(default = "crate::weather::default_enabled")]
    pub enabled: bool,
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    ttls: CacheTtlConfig,
    #[serde(flatten)]
    rate: RateConfig,
}

impl Default for Citygrid {
    fn default() -> Self {
        Self {
            enabled: true,
            api_key: None,
            user_agent: None,
            ttls: CacheTtlConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct GeoCity {
    id: u64,
    name: String,
    lat: f64,
    lon: f64,
}

#[derive(Deserialize, Debug)]
struct CitygridResponse {
    list: Vec<CitygridItem>,
}

#[derive(Deserialize, Debug)]
struct CitygridItem {
    dt: i64,
    main: CitygridMain,
    wind: CitygridWind,
    pop: Option<f64>,
    rain: Option<CitygridRain>,
    weather: Vec<CitygridCondition>,
}

#[derive(Deserialize, Debug)]
struct CitygridMain {
    temp: Kelvin,
}

#[derive(Deserialize, Debug)]
struct CitygridWind {
    speed: f64,
    deg: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct CitygridRain {
    #[serde(rename = "3h")]
    three_hours: f64,
}

#[derive(Deserialize, Debug)]
struct CitygridCondition {
    id: u16,
}

/// Maps the provider's condition-id families to the canonical set.
fn map_condition_id(id: u16, phase: DayPhase) -> Result<WeatherCode, ProviderError> {
    let code = match id {
        200..=202 => WeatherCode::RainAndThunder,
        210..=221 => WeatherCode::Thunder,
        230..=232 => WeatherCode::RainAndThunder,
        300..=321 => WeatherCode::LightRain,
        500 => WeatherCode::LightRain,
        501 => WeatherCode::Rain,
        502..=504 => WeatherCode::HeavyRain,
        511 => WeatherCode::Sleet,
        520 | 521 | 531 => phase.pick(WeatherCode::RainShowersDay, WeatherCode::RainShowersNight),
        522 => WeatherCode::HeavyRain,
        600 | 620 => WeatherCode::LightSnow,
        601 | 621 => WeatherCode::Snow,
        602 | 622 => WeatherCode::HeavySnow,
        611 | 612 => WeatherCode::LightSleet,
        613 | 615 | 616 => WeatherCode::Sleet,
        701 | 741 => WeatherCode::Fog,
        800 => phase.pick(WeatherCode::ClearDay, WeatherCode::ClearNight),
        801 => phase.pick(WeatherCode::FairDay, WeatherCode::FairNight),
        802 => phase.pick(WeatherCode::PartlyCloudyDay, WeatherCode::PartlyCloudyNight),
        803 | 804 => WeatherCode::Cloudy,
        other => {
            return Err(ProviderError::BadResponse(format!(
                "unknown condition id {other}"
            )))
        }
    };

    Ok(code)
}

fn bad_sample(error: ValidationError) -> ProviderError {
    ProviderError::BadResponse(error.to_string())
}

impl Citygrid {
    fn api_key(&self) -> Result<&str, ProviderError> {
        self.api_key.as_deref().ok_or(ProviderError::Unauthorized)
    }

    /// Resolves coordinates to the provider's nearest grid city, going
    /// to the discovery endpoint only on a location-cache miss.
    fn resolve_location(
        &self,
        context: &FetchContext<'_>,
        coordinates: &Coordinates,
    ) -> Result<ResolvedLocation, ProviderError> {
        match context.location_cache.lookup(
            PROVIDER_ID,
            coordinates,
            LOCATION_MAX_AGE,
            LOCATION_MAX_DISTANCE_KM,
            context.now,
        ) {
            Ok(Some(resolved)) => {
                debug!(
                    "Location cache hit for citygrid: {:?}",
                    resolved.provider_location_name
                );
                return Ok(resolved);
            }
            Ok(None) => {}
            Err(e) => log::warn!("Location cache lookup failed, treating as miss: {e}"),
        }

        let url = Url::parse_with_params(
            GEO_ENDPOINT_URL,
            &[
                ("lat", format!("{}", coordinates.latitude)),
                ("lon", format!("{}", coordinates.longitude)),
                ("appid", self.api_key()?.to_owned()),
            ],
        )
        .map_err(|e| ProviderError::Permanent(format!("URL construction failed: {e}")))?;

        let cities: Vec<GeoCity> = fetch_json(&self.outbound(context, url))?;

        let city = cities.into_iter().next().ok_or(ProviderError::OutOfCoverage)?;

        let resolved = ResolvedLocation {
            provider_location_id: city.id.to_string(),
            provider_location_name: city.name,
            coordinates: Coordinates {
                latitude: city.lat.into(),
                longitude: city.lon.into(),
            },
            resolved_at_utc: context.now,
        };

        if let Err(e) = context
            .location_cache
            .remember(PROVIDER_ID, coordinates, &resolved)
        {
            log::warn!("Could not remember citygrid location resolution: {e}");
        }

        Ok(resolved)
    }

    fn outbound<'a>(&'a self, context: &'a FetchContext<'_>, url: Url) -> OutboundRequest<'a> {
        OutboundRequest {
            source: PROVIDER_ID,
            client: context.client,
            method: Method::GET,
            url,
            headers: reqwest::header::HeaderMap::new(),
            user_agent: self
                .user_agent
                .as_deref()
                .unwrap_or(crate::config::DEFAULT_USER_AGENT),
            retry: RetryPolicy::NONE,
            rate_gate: Some((context.rate_limiter, PROVIDER_ID)),
            cancel: context.cancel,
            deadline: context.deadline,
        }
    }

    fn normalize(
        &self,
        response: &CitygridResponse,
        location: &Location,
        time_range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Result<WeatherForecast, ProviderError> {
        let longitude: f64 = location.coordinates().longitude.into();
        let mut samples = Vec::new();

        for item in &response.list {
            let Some(time) = DateTime::from_timestamp(item.dt, 0) else {
                return Err(ProviderError::BadResponse(format!(
                    "unrepresentable timestamp {}",
                    item.dt
                )));
            };

            if time < time_range.start_utc() || time >= time_range.end_utc() {
                continue;
            }

            let phase = DayPhase::solar(time, longitude);
            let condition = item
                .weather
                .first()
                .ok_or_else(|| ProviderError::BadResponse("missing condition entry".to_owned()))?;
            let code = map_condition_id(condition.id, phase)?;

            let precipitation = item.rain.as_ref().map_or(MillimetersPerHour::from(0.0), |r| {
                MillimetersPerHour::from_accumulation(r.three_hours, ACCUMULATION_HOURS)
            });

            let sample = WeatherSample::new(
                time,
                BlockSize::ThreeHours,
                item.main.temp.to_celsius(),
                precipitation,
                item.pop.map(|p| Percent::from(Ratio::Fraction(p))),
                item.wind.speed.into(),
                item.wind.deg.map(Into::into),
                code,
                MANIFEST.infer_thunder(code),
            )
            .map_err(bad_sample)?;

            samples.push(sample);
        }

        let hours_ahead = crate::weather::horizon_hours(now, time_range);
        let expires_at = now
            + ChronoDuration::from_std(self.ttls.ttl_for(hours_ahead))
                .unwrap_or_else(|_| ChronoDuration::hours(1));

        WeatherForecast::new(
            location.clone(),
            PROVIDER_ID.to_owned(),
            samples,
            now,
            expires_at,
        )
        .map_err(bad_sample)
    }
}

impl WeatherProvider for Citygrid {
    fn manifest(&self) -> &'static ProviderManifest {
        &MANIFEST
    }

    fn rate_policy(&self) -> RatePolicy {
        self.rate.into_policy(MANIFEST.default_rate_policy)
    }

    fn fetch(
        &self,
        context: &FetchContext<'_>,
        location: &Location,
        time_range: &TimeRange,
    ) -> Result<WeatherForecast, ProviderError> {
        if !MANIFEST.coverage.contains(location.coordinates()) {
            return Err(ProviderError::OutOfCoverage);
        }

        let resolved = self.resolve_location(context, location.coordinates())?;

        let url = Url::parse_with_params(
            FORECAST_ENDPOINT_URL,
            &[
                ("id", resolved.provider_location_id.clone()),
                ("appid", self.api_key()?.to_owned()),
            ],
        )
        .map_err(|e| ProviderError::Permanent(format!("URL construction failed: {e}")))?;

        debug!(
            "Requesting citygrid forecast for city {:?}",
            resolved.provider_location_name
        );

        let response: CitygridResponse = fetch_json(&self.outbound(context, url))?;

        self.normalize(&response, location, time_range, context.now)
    }
}

#[cfg(test)]
mod tests {
    use crate::cancel::CancellationToken;
    use crate::http::blocking_client;
    use crate::model::TimeRange;
    use crate::units::{Coordinates, Location};
    use crate::weather::cache::{open_ephemeral, ResolvedLocation};
    use crate::weather::model::{DayPhase, WeatherCode};
    use crate::weather::providers::citygrid::{
        map_condition_id, Citygrid, CitygridResponse,
    };
    use crate::weather::rate_limit::RateLimiter;
    use crate::weather::FetchContext;
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn munich() -> Location {
        Location::new(
            Coordinates {
                latitude: 48.1159.into(),
                longitude: 11.5709.into(),
            },
            None,
        )
        .unwrap()
    }

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, h, 0, 0).unwrap()
    }

    fn payload() -> CitygridResponse {
        let items: Vec<serde_json::Value> = (0..8)
            .map(|i| {
                serde_json::json!({
                    "dt": t(0).timestamp() + i * 3 * 3600,
                    "main": { "temp": 293.15 },
                    "wind": { "speed": 5.5, "deg": 140.0 },
                    "pop": 0.35,
                    "rain": { "3h": 1.8 },
                    "weather": [{ "id": 501 }]
                })
            })
            .collect();

        serde_json::from_value(serde_json::json!({ "list": items })).unwrap()
    }

    #[test]
    fn normalization_converts_units_to_canonical() {
        let citygrid = Citygrid::default();
        let range = TimeRange::new(t(6), t(12)).unwrap();

        let forecast = citygrid
            .normalize(&payload(), &munich(), &range, t(1))
            .unwrap();

        assert_eq!("citygrid", forecast.provider_id());
        assert_eq!(2, forecast.samples().len());

        let sample = &forecast.samples()[0];
        // 293.15 K is exactly 20 °C.
        assert_eq!(20.0, f64::from(sample.temperature()));
        // 1.8 mm over three hours.
        assert_eq!(0.6, f64::from(sample.precipitation()));
        // pop fraction becomes a percentage.
        assert_eq!(Some(35.0), sample.precipitation_probability().map(f64::from));
        assert_eq!(WeatherCode::Rain, sample.code());
    }

    #[test]
    fn warm_location_cache_resolves_without_network() {
        let (_, locations) = open_ephemeral().unwrap();
        let resolved = ResolvedLocation {
            provider_location_id: "2867714".into(),
            provider_location_name: "München".into(),
            coordinates: Coordinates {
                latitude: 48.1374.into(),
                longitude: 11.5755.into(),
            },
            resolved_at_utc: t(0),
        };
        locations
            .remember("citygrid", munich().coordinates(), &resolved)
            .unwrap();

        let client = blocking_client().unwrap();
        let limiter = RateLimiter::new();
        let cancel = CancellationToken::new();
        let context = FetchContext {
            client: &client,
            rate_limiter: &limiter,
            location_cache: &locations,
            cancel: &cancel,
            deadline: None,
            now: t(1),
        };

        let citygrid = Citygrid {
            api_key: Some("test-key".into()),
            ..Citygrid::default()
        };

        let hit = citygrid
            .resolve_location(&context, munich().coordinates())
            .unwrap();

        assert_eq!("2867714", hit.provider_location_id);
    }

    #[test]
    fn missing_api_key_is_unauthorized() {
        let citygrid = Citygrid::default();

        assert!(citygrid.api_key().is_err());
    }

    #[test]
    fn condition_family_mapping() {
        assert_eq!(
            WeatherCode::RainAndThunder,
            map_condition_id(200, DayPhase::Day).unwrap()
        );
        assert_eq!(
            WeatherCode::RainShowersNight,
            map_condition_id(521, DayPhase::Night).unwrap()
        );
        assert_eq!(
            WeatherCode::ClearDay,
            map_condition_id(800, DayPhase::Day).unwrap()
        );
        assert_eq!(WeatherCode::Cloudy, map_condition_id(804, DayPhase::Day).unwrap());
        assert!(map_condition_id(999, DayPhase::Day).is_err());
    }
}
