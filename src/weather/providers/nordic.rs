//! Nordic forecast service. Anonymous, coordinate-keyed GeoJSON API in
//! the met.no locationforecast style: one `properties.timeseries` array
//! whose entries carry instantaneous details plus accumulation blocks
//! for the next one, six and twelve hours.
//!
//! Wire times are UTC instants. Short-range responses expire at the next
//! top of the hour minus five minutes, aligned with the provider's
//! hourly model runs; longer horizons use the configured TTL bands.

use crate::error::{ProviderError, ValidationError};
use crate::http::{fetch_json, OutboundRequest, RetryPolicy};
use crate::model::TimeRange;
use crate::units::{Location, MillimetersPerHour, Percent};
use crate::weather::model::{BlockSize, DayPhase, WeatherCode, WeatherForecast, WeatherSample};
use crate::weather::rate_limit::RatePolicy;
use crate::weather::{
    horizon_hours, AuthRequirement, CacheTtlConfig, Coverage, FetchContext, ProviderManifest,
    RateConfig, WeatherProvider, SHORT_HORIZON_HOURS,
};
use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use log::debug;
use reqwest::{Method, Url};
use serde::Deserialize;
use std::time::Duration;

const PROVIDER_ID: &str = "nordic";
const ENDPOINT_URL: &str = "https://api.nordicweather.net/weatherapi/locationforecast/2.0/compact";

pub static MANIFEST: ProviderManifest = ProviderManifest {
    provider_id: PROVIDER_ID,
    coverage: Coverage::BoundingBox {
        min_lat: 54.0,
        min_lon: 4.0,
        max_lat: 71.5,
        max_lon: 32.0,
    },
    update_cadence: Duration::from_secs(3600),
    auth: AuthRequirement::Anonymous,
    default_rate_policy: RatePolicy::MinInterval(Duration::from_millis(500)),
    block_size_bands: &[
        (SHORT_HORIZON_HOURS, BlockSize::OneHour),
        (crate::weather::MEDIUM_HORIZON_HOURS, BlockSize::SixHours),
        (u32::MAX, BlockSize::TwelveHours),
    ],
    thunder_inference: &[
        (WeatherCode::Thunder, 80.0),
        (WeatherCode::RainAndThunder, 60.0),
        (WeatherCode::HeavyRainAndThunder, 90.0),
    ],
};

#[derive(Deserialize, Debug, Clone)]
pub struct Nordic {
    #[serde(default = "crate::weather::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    ttls: CacheTtlConfig,
    #[serde(flatten)]
    rate: RateConfig,
}

impl Default for Nordic {
    fn default() -> Self {
        Self {
            enabled: true,
            user_agent: None,
            ttls: CacheTtlConfig::default(),
            rate: RateConfig::default(),
        }
    }
}

#[derive(Deserialize, Debug)]
struct NordicResponse {
    properties: NordicProperties,
}

#[derive(Deserialize, Debug)]
struct NordicProperties {
    timeseries: Vec<NordicEntry>,
}

#[derive(Deserialize, Debug)]
struct NordicEntry {
    time: DateTime<Utc>,
    data: NordicData,
}

#[derive(Deserialize, Debug)]
struct NordicData {
    instant: NordicInstant,
    next_1_hours: Option<NordicBlock>,
    next_6_hours: Option<NordicBlock>,
    next_12_hours: Option<NordicBlock>,
}

#[derive(Deserialize, Debug)]
struct NordicInstant {
    details: NordicInstantDetails,
}

#[derive(Deserialize, Debug)]
struct NordicInstantDetails {
    air_temperature: f64,
    wind_speed: f64,
    wind_from_direction: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct NordicBlock {
    summary: NordicSummary,
    details: Option<NordicBlockDetails>,
}

#[derive(Deserialize, Debug)]
struct NordicSummary {
    symbol_code: String,
}

#[derive(Deserialize, Debug, Default)]
struct NordicBlockDetails {
    precipitation_amount: Option<f64>,
    probability_of_precipitation: Option<f64>,
    probability_of_thunder: Option<f64>,
}

/// Maps a native symbol code to the canonical set. The day/night suffix
/// on the wire is ignored; variants are chosen from the local solar
/// hour so every provider classifies identically.
fn map_symbol(symbol_code: &str, phase: DayPhase) -> Result<WeatherCode, ProviderError> {
    let base = symbol_code
        .split('_')
        .next()
        .unwrap_or(symbol_code);

    let code = match base {
        "clearsky" => phase.pick(WeatherCode::ClearDay, WeatherCode::ClearNight),
        "fair" => phase.pick(WeatherCode::FairDay, WeatherCode::FairNight),
        "partlycloudy" => phase.pick(WeatherCode::PartlyCloudyDay, WeatherCode::PartlyCloudyNight),
        "cloudy" => WeatherCode::Cloudy,
        "fog" => WeatherCode::Fog,
        "lightrain" | "lightrainshowers" => WeatherCode::LightRain,
        "rain" => WeatherCode::Rain,
        "heavyrain" | "heavyrainshowers" => WeatherCode::HeavyRain,
        "rainshowers" => phase.pick(WeatherCode::RainShowersDay, WeatherCode::RainShowersNight),
        "lightsnow" | "lightsnowshowers" => WeatherCode::LightSnow,
        "snow" | "snowshowers" => WeatherCode::Snow,
        "heavysnow" | "heavysnowshowers" => WeatherCode::HeavySnow,
        "lightsleet" | "lightsleetshowers" => WeatherCode::LightSleet,
        "sleet" | "sleetshowers" => WeatherCode::Sleet,
        "heavysleet" | "heavysleetshowers" => WeatherCode::HeavySleet,
        "thunder" | "thunderstorm" => WeatherCode::Thunder,
        "lightrainandthunder" | "rainandthunder" | "rainshowersandthunder"
        | "lightrainshowersandthunder" => WeatherCode::RainAndThunder,
        "heavyrainandthunder" | "heavyrainshowersandthunder" => WeatherCode::HeavyRainAndThunder,
        other => {
            return Err(ProviderError::BadResponse(format!(
                "unknown symbol code {other:?}"
            )))
        }
    };

    Ok(code)
}

/// Short-range responses are republished hourly; expire at the next top
/// of the hour minus a five minute publication margin.
fn short_range_expiry(now: DateTime<Utc>) -> DateTime<Utc> {
    let top_of_next_hour = now
        .with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .map(|t| t + ChronoDuration::hours(1))
        .unwrap_or(now);

    let candidate = top_of_next_hour - ChronoDuration::minutes(5);

    if candidate <= now {
        candidate + ChronoDuration::hours(1)
    } else {
        candidate
    }
}

impl Nordic {
    fn normalize(
        &self,
        response: &NordicResponse,
        location: &Location,
        time_range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Result<WeatherForecast, ProviderError> {
        let hours_ahead = horizon_hours(now, time_range);
        let block_size = MANIFEST.block_size_for(hours_ahead);
        let longitude: f64 = location.coordinates().longitude.into();

        let mut samples = Vec::new();

        for entry in &response.properties.timeseries {
            if entry.time < time_range.start_utc() || entry.time >= time_range.end_utc() {
                continue;
            }

            let Some((block, accumulation_hours)) = pick_block(&entry.data, block_size) else {
                continue;
            };

            let phase = DayPhase::solar(entry.time, longitude);
            let code = map_symbol(&block.summary.symbol_code, phase)?;
            let details = block.details.as_ref();

            let precipitation = details
                .and_then(|d| d.precipitation_amount)
                .map_or(MillimetersPerHour::from(0.0), |amount| {
                    MillimetersPerHour::from_accumulation(amount, accumulation_hours)
                });

            let thunder_probability = details
                .and_then(|d| d.probability_of_thunder)
                .map(Percent::from)
                .or_else(|| MANIFEST.infer_thunder(code));

            let sample = WeatherSample::new(
                entry.time,
                block_size,
                entry.data.instant.details.air_temperature.into(),
                precipitation,
                details
                    .and_then(|d| d.probability_of_precipitation)
                    .map(Percent::from),
                entry.data.instant.details.wind_speed.into(),
                entry.data.instant.details.wind_from_direction.map(Into::into),
                code,
                thunder_probability,
            )
            .map_err(bad_sample)?;

            samples.push(sample);
        }

        // Entries arrive time-ordered, but samples wider than the wire
        // step must be thinned to one per block.
        samples.dedup_by_key(|s| s.time_utc());
        samples = thin_to_block(samples, block_size, time_range.start_utc());

        let expires_at = if hours_ahead <= SHORT_HORIZON_HOURS {
            short_range_expiry(now)
        } else {
            now + ChronoDuration::from_std(self.ttls.ttl_for(hours_ahead))
                .unwrap_or_else(|_| ChronoDuration::hours(1))
        };

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

fn bad_sample(error: ValidationError) -> ProviderError {
    ProviderError::BadResponse(error.to_string())
}

/// Prefers the block matching the requested width, falling back to the
/// six hour accumulation when the hourly one has run out near the end of
/// the series. The second tuple element is the accumulation window used
/// to convert amounts into per-hour rates.
fn pick_block(data: &NordicData, block_size: BlockSize) -> Option<(&NordicBlock, u32)> {
    match block_size {
        BlockSize::OneHour => data
            .next_1_hours
            .as_ref()
            .map(|b| (b, 1))
            .or(data.next_6_hours.as_ref().map(|b| (b, 6))),
        BlockSize::SixHours => data.next_6_hours.as_ref().map(|b| (b, 6)),
        BlockSize::TwelveHours | BlockSize::ThreeHours => {
            data.next_12_hours.as_ref().map(|b| (b, 12))
        }
    }
}

/// Keeps only samples aligned to the block grid anchored at the window
/// start, so consecutive sample times differ by exactly one block.
fn thin_to_block(
    samples: Vec<WeatherSample>,
    block_size: BlockSize,
    anchor: DateTime<Utc>,
) -> Vec<WeatherSample> {
    let step = i64::from(block_size.hours()) * 3600;

    samples
        .into_iter()
        .filter(|s| {
            let offset = s.time_utc().signed_duration_since(anchor).num_seconds();
            offset.rem_euclid(step) == 0
        })
        .collect()
}

impl WeatherProvider for Nordic {
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

        let mut params = vec![
            ("lat", format!("{}", location.coordinates().latitude)),
            ("lon", format!("{}", location.coordinates().longitude)),
        ];

        if let Some(altitude) = location.altitude_meters() {
            params.push(("altitude", altitude.to_string()));
        }

        let url = Url::parse_with_params(ENDPOINT_URL, &params)
            .map_err(|e| ProviderError::Permanent(format!("URL construction failed: {e}")))?;

        debug!("Requesting nordic forecast for {url}");

        let response: NordicResponse = fetch_json(&OutboundRequest {
            source: PROVIDER_ID,
            client: context.client,
            method: Method::GET,
            url,
            headers: reqwest::header::HeaderMap::new(),
            user_agent: self.user_agent.as_deref().unwrap_or(crate::config::DEFAULT_USER_AGENT),
            retry: RetryPolicy::NONE,
            rate_gate: Some((context.rate_limiter, PROVIDER_ID)),
            cancel: context.cancel,
            deadline: context.deadline,
        })?;

        self.normalize(&response, location, time_range, context.now)
    }
}

#[cfg(test)]
mod tests {
    use crate::model::TimeRange;
    use crate::units::{Coordinates, Location};
    use crate::weather::model::{BlockSize, DayPhase, WeatherCode};
    use crate::weather::providers::nordic::{
        map_symbol, short_range_expiry, Nordic, NordicResponse,
    };
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    fn oslo() -> Location {
        Location::new(
            Coordinates {
                latitude: 59.8940.into(),
                longitude: 10.8282.into(),
            },
            Some(90),
        )
        .unwrap()
    }

    fn t(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, day, h, m, 0).unwrap()
    }

    fn hourly_payload() -> NordicResponse {
        let entries: Vec<serde_json::Value> = (0..8)
            .map(|h| {
                serde_json::json!({
                    "time": format!("2026-08-02T{h:02}:00:00Z"),
                    "data": {
                        "instant": {
                            "details": {
                                "air_temperature": 11.5 + f64::from(h),
                                "wind_speed": 4.2,
                                "wind_from_direction": 210.0
                            }
                        },
                        "next_1_hours": {
                            "summary": { "symbol_code": "lightrain" },
                            "details": {
                                "precipitation_amount": 0.4,
                                "probability_of_precipitation": 55.0
                            }
                        },
                        "next_6_hours": {
                            "summary": { "symbol_code": "rain" },
                            "details": { "precipitation_amount": 3.0 }
                        }
                    }
                })
            })
            .collect();

        serde_json::from_value(serde_json::json!({
            "properties": { "timeseries": entries }
        }))
        .unwrap()
    }

    #[test]
    fn short_range_window_yields_hourly_samples() {
        let nordic = Nordic::default();
        let now = t(1, 10, 20);
        let range = TimeRange::new(t(2, 1, 0), t(2, 5, 0)).unwrap();

        let forecast = nordic
            .normalize(&hourly_payload(), &oslo(), &range, now)
            .unwrap();

        assert_eq!("nordic", forecast.provider_id());
        assert_eq!(4, forecast.samples().len());
        assert_eq!(t(2, 1, 0), forecast.samples()[0].time_utc());
        assert_eq!(t(2, 4, 0), forecast.samples()[3].time_utc());

        for sample in forecast.samples() {
            assert_eq!(BlockSize::OneHour, sample.block_size());
            assert_eq!(WeatherCode::LightRain, sample.code());
            assert_eq!(0.4, f64::from(sample.precipitation()));
            assert_eq!(Some(55.0), sample.precipitation_probability().map(f64::from));
        }
    }

    #[test]
    fn short_range_expiry_is_next_top_of_hour_minus_five_minutes() {
        assert_eq!(t(1, 10, 55), short_range_expiry(t(1, 10, 20)));
        // Inside the five minute margin the next slot is used instead.
        assert_eq!(t(1, 11, 55), short_range_expiry(t(1, 10, 57)));
        assert_eq!(t(1, 10, 55), short_range_expiry(t(1, 10, 0)));
    }

    #[test]
    fn hourly_gap_falls_back_to_six_hour_accumulation() {
        let payload: NordicResponse = serde_json::from_value(serde_json::json!({
            "properties": { "timeseries": [{
                "time": "2026-08-02T01:00:00Z",
                "data": {
                    "instant": { "details": { "air_temperature": 9.0, "wind_speed": 2.0 } },
                    "next_6_hours": {
                        "summary": { "symbol_code": "rain" },
                        "details": { "precipitation_amount": 3.0 }
                    }
                }
            }] }
        }))
        .unwrap();

        let range = TimeRange::new(t(2, 1, 0), t(2, 2, 0)).unwrap();
        let forecast = Nordic::default()
            .normalize(&payload, &oslo(), &range, t(1, 10, 0))
            .unwrap();

        assert_eq!(1, forecast.samples().len());
        // 3 mm over six hours, uniformly distributed.
        assert_eq!(0.5, f64::from(forecast.samples()[0].precipitation()));
        assert_eq!(None, forecast.samples()[0].wind_direction());
    }

    #[test]
    fn thunder_probability_inferred_from_code_when_absent() {
        let payload: NordicResponse = serde_json::from_value(serde_json::json!({
            "properties": { "timeseries": [{
                "time": "2026-08-02T13:00:00Z",
                "data": {
                    "instant": { "details": { "air_temperature": 19.0, "wind_speed": 6.0 } },
                    "next_1_hours": {
                        "summary": { "symbol_code": "rainandthunder" },
                        "details": { "precipitation_amount": 2.2 }
                    }
                }
            }] }
        }))
        .unwrap();

        let range = TimeRange::new(t(2, 13, 0), t(2, 14, 0)).unwrap();
        let forecast = Nordic::default()
            .normalize(&payload, &oslo(), &range, t(2, 11, 0))
            .unwrap();

        let sample = &forecast.samples()[0];
        assert_eq!(WeatherCode::RainAndThunder, sample.code());
        assert_eq!(Some(60.0), sample.thunder_probability().map(f64::from));
    }

    #[test]
    fn symbol_mapping_honours_solar_phase() {
        assert_eq!(
            WeatherCode::ClearNight,
            map_symbol("clearsky_day", DayPhase::Night).unwrap()
        );
        assert_eq!(
            WeatherCode::RainShowersDay,
            map_symbol("rainshowers_night", DayPhase::Day).unwrap()
        );
        assert!(map_symbol("plasma_storm", DayPhase::Day).is_err());
    }

    #[test]
    fn unknown_symbol_is_a_bad_response() {
        let payload: NordicResponse = serde_json::from_value(serde_json::json!({
            "properties": { "timeseries": [{
                "time": "2026-08-02T01:00:00Z",
                "data": {
                    "instant": { "details": { "air_temperature": 9.0, "wind_speed": 2.0 } },
                    "next_1_hours": { "summary": { "symbol_code": "frogs" } }
                }
            }] }
        }))
        .unwrap();

        let range = TimeRange::new(t(2, 1, 0), t(2, 2, 0)).unwrap();
        let result = Nordic::default().normalize(&payload, &oslo(), &range, t(1, 10, 0));

        assert!(result.is_err());
    }
}
