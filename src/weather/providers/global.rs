//! Global forecast service. Coordinate-keyed API in the open-meteo
//! style: parallel hourly arrays plus WMO condition codes, anonymous
//! with an optional commercial API key.
//!
//! Wire times are UTC (the request pins `timezone=UTC`) without an
//! offset suffix. Wind arrives in km/h and is converted to m/s; medium
//! and long horizons aggregate hourly cells into three or six hour
//! blocks anchored at the requested window start.

use crate::error::{ProviderError, ValidationError};
use crate::http::{fetch_json, OutboundRequest, RetryPolicy};
use crate::model::TimeRange;
use crate::units::{KilometersPerHour, Location, MetersPerSecond, Percent};
use crate::weather::model::{BlockSize, DayPhase, WeatherCode, WeatherForecast, WeatherSample};
use crate::weather::rate_limit::RatePolicy;
use crate::weather::{
    horizon_hours, AuthRequirement, CacheTtlConfig, Coverage, FetchContext, ProviderManifest,
    RateConfig, WeatherProvider, MEDIUM_HORIZON_HOURS, SHORT_HORIZON_HOURS,
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, Utc};
use log::debug;
use reqwest::{Method, Url};
use serde::Deserialize;
use std::time::Duration;

const PROVIDER_ID: &str = "global";
const ENDPOINT_URL: &str = "https://api.global-meteo.com/v1/forecast";

const HOURLY_FIELDS: &str =
    "temperature_2m,precipitation,precipitation_probability,wind_speed_10m,wind_direction_10m,weather_code";

pub static MANIFEST: ProviderManifest = ProviderManifest {
    provider_id: PROVIDER_ID,
    coverage: Coverage::Global,
    update_cadence: Duration::from_secs(3600),
    auth: AuthRequirement::Anonymous,
    default_rate_policy: RatePolicy::PerWindow {
        calls: 60,
        window: Duration::from_secs(60),
    },
    block_size_bands: &[
        (SHORT_HORIZON_HOURS, BlockSize::OneHour),
        (MEDIUM_HORIZON_HOURS, BlockSize::ThreeHours),
        (u32::MAX, BlockSize::SixHours),
    ],
    thunder_inference: &[
        (WeatherCode::Thunder, 80.0),
        (WeatherCode::RainAndThunder, 60.0),
        (WeatherCode::HeavyRainAndThunder, 90.0),
    ],
};

#[derive(Deserialize, Debug, Clone)]
pub struct Global {
    #[serde(default = "crate::weather::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(flatten)]
    ttls: CacheTtlConfig,
    #[serde(flatten)]
    rate: RateConfig,
}

impl Default for Global {
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
struct GlobalResponse {
    hourly: GlobalHourly,
}

#[derive(Deserialize, Debug)]
struct GlobalHourly {
    time: Vec<String>,
    temperature_2m: Vec<f64>,
    precipitation: Vec<f64>,
    precipitation_probability: Option<Vec<f64>>,
    wind_speed_10m: Vec<f64>,
    wind_direction_10m: Option<Vec<f64>>,
    weather_code: Vec<u16>,
}

const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M";

fn parse_wire_time(value: &str) -> Result<DateTime<Utc>, ProviderError> {
    NaiveDateTime::parse_from_str(value, WIRE_TIME_FORMAT)
        .map(|naive| naive.and_utc())
        .map_err(|e| ProviderError::BadResponse(format!("unparseable time {value:?}: {e}")))
}

/// Maps a WMO weather interpretation code to the canonical set.
fn map_wmo_code(code: u16, phase: DayPhase) -> Result<WeatherCode, ProviderError> {
    let mapped = match code {
        0 => phase.pick(WeatherCode::ClearDay, WeatherCode::ClearNight),
        1 => phase.pick(WeatherCode::FairDay, WeatherCode::FairNight),
        2 => phase.pick(WeatherCode::PartlyCloudyDay, WeatherCode::PartlyCloudyNight),
        3 => WeatherCode::Cloudy,
        45 | 48 => WeatherCode::Fog,
        51 | 53 | 55 | 61 => WeatherCode::LightRain,
        56 | 57 => WeatherCode::LightSleet,
        63 => WeatherCode::Rain,
        65 => WeatherCode::HeavyRain,
        66 | 67 => WeatherCode::Sleet,
        71 => WeatherCode::LightSnow,
        73 | 77 => WeatherCode::Snow,
        75 => WeatherCode::HeavySnow,
        80 | 81 => phase.pick(WeatherCode::RainShowersDay, WeatherCode::RainShowersNight),
        82 => WeatherCode::HeavyRain,
        85 => WeatherCode::LightSnow,
        86 => WeatherCode::HeavySnow,
        95 => WeatherCode::RainAndThunder,
        96 | 99 => WeatherCode::HeavyRainAndThunder,
        other => {
            return Err(ProviderError::BadResponse(format!(
                "unknown WMO code {other}"
            )))
        }
    };

    Ok(mapped)
}

/// One wire cell in canonical units, before block aggregation.
#[derive(Debug, Clone)]
struct HourlyCell {
    time: DateTime<Utc>,
    temperature: f64,
    precipitation_mm: f64,
    precipitation_probability: Option<f64>,
    wind_speed: MetersPerSecond,
    wind_direction: Option<f64>,
    code: WeatherCode,
}

fn bad_sample(error: ValidationError) -> ProviderError {
    ProviderError::BadResponse(error.to_string())
}

impl Global {
    fn normalize(
        &self,
        response: &GlobalResponse,
        location: &Location,
        time_range: &TimeRange,
        now: DateTime<Utc>,
    ) -> Result<WeatherForecast, ProviderError> {
        let hourly = &response.hourly;
        let len = hourly.time.len();

        if hourly.temperature_2m.len() != len
            || hourly.precipitation.len() != len
            || hourly.wind_speed_10m.len() != len
            || hourly.weather_code.len() != len
        {
            return Err(ProviderError::BadResponse(
                "parallel hourly arrays have mismatched lengths".to_owned(),
            ));
        }

        let hours_ahead = horizon_hours(now, time_range);
        let block_size = MANIFEST.block_size_for(hours_ahead);
        let longitude: f64 = location.coordinates().longitude.into();

        let mut cells = Vec::new();

        for index in 0..len {
            let time = parse_wire_time(&hourly.time[index])?;

            if time < time_range.start_utc() || time >= time_range.end_utc() {
                continue;
            }

            let phase = DayPhase::solar(time, longitude);

            cells.push(HourlyCell {
                time,
                temperature: hourly.temperature_2m[index],
                precipitation_mm: hourly.precipitation[index],
                precipitation_probability: hourly
                    .precipitation_probability
                    .as_ref()
                    .and_then(|v| v.get(index).copied()),
                wind_speed: KilometersPerHour::from(hourly.wind_speed_10m[index]).into(),
                wind_direction: hourly
                    .wind_direction_10m
                    .as_ref()
                    .and_then(|v| v.get(index).copied()),
                code: map_wmo_code(hourly.weather_code[index], phase)?,
            });
        }

        let samples = aggregate(&cells, block_size, time_range.start_utc())?;

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

/// Folds hourly cells into block-sized samples anchored at the window
/// start. Temperature and wind average; precipitation averages into a
/// rate; probabilities take the block maximum; the condition code is
/// the worst of the block, with the wind direction sampled from the
/// windiest cell.
fn aggregate(
    cells: &[HourlyCell],
    block_size: BlockSize,
    anchor: DateTime<Utc>,
) -> Result<Vec<WeatherSample>, ProviderError> {
    let step = i64::from(block_size.hours());
    let mut samples: Vec<WeatherSample> = Vec::new();
    let mut group: Vec<&HourlyCell> = Vec::new();
    let mut group_index: Option<i64> = None;

    let flush = |group: &[&HourlyCell], samples: &mut Vec<WeatherSample>| -> Result<(), ProviderError> {
        let Some(first) = group.first() else {
            return Ok(());
        };

        let n = group.len() as f64;
        let temperature = group.iter().map(|c| c.temperature).sum::<f64>() / n;
        let precipitation = group.iter().map(|c| c.precipitation_mm).sum::<f64>() / n;
        let wind_speed =
            group.iter().map(|c| f64::from(c.wind_speed)).sum::<f64>() / n;
        let precipitation_probability = group
            .iter()
            .filter_map(|c| c.precipitation_probability)
            .fold(None, |acc: Option<f64>, p| Some(acc.map_or(p, |a| a.max(p))));
        let windiest = group
            .iter()
            .max_by(|a, b| {
                f64::from(a.wind_speed)
                    .partial_cmp(&f64::from(b.wind_speed))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(first);
        let code = group
            .iter()
            .map(|c| c.code)
            .max_by_key(|c| c.severity())
            .unwrap_or(first.code);

        let block_time = first.time;
        let sample = WeatherSample::new(
            block_time,
            block_size,
            temperature.into(),
            precipitation.into(),
            precipitation_probability.map(Percent::from),
            wind_speed.into(),
            windiest.wind_direction.map(Into::into),
            code,
            MANIFEST.infer_thunder(code),
        )
        .map_err(bad_sample)?;

        samples.push(sample);
        Ok(())
    };

    for cell in cells {
        let offset_hours = cell.time.signed_duration_since(anchor).num_seconds() / 3600;
        let index = offset_hours.div_euclid(step);

        if group_index != Some(index) {
            flush(&group, &mut samples)?;
            group.clear();
            group_index = Some(index);
        }

        group.push(cell);
    }

    flush(&group, &mut samples)?;

    Ok(samples)
}

impl WeatherProvider for Global {
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
        let mut url = Url::parse_with_params(
            ENDPOINT_URL,
            &[
                ("hourly", HOURLY_FIELDS.to_owned()),
                ("timezone", "UTC".to_owned()),
                ("latitude", format!("{}", location.coordinates().latitude)),
                ("longitude", format!("{}", location.coordinates().longitude)),
                (
                    "start_date",
                    time_range.start_utc().format("%Y-%m-%d").to_string(),
                ),
                (
                    "end_date",
                    time_range.end_utc().format("%Y-%m-%d").to_string(),
                ),
            ],
        )
        .map_err(|e| ProviderError::Permanent(format!("URL construction failed: {e}")))?;

        if let Some(api_key) = &self.api_key {
            url.query_pairs_mut().append_pair("apikey", api_key);
        }

        debug!("Requesting global forecast for {}", crate::http::redacted(&url));

        let response: GlobalResponse = fetch_json(&OutboundRequest {
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
        })?;

        self.normalize(&response, location, time_range, context.now)
    }
}
