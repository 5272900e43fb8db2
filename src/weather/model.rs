use crate::error::ValidationError;
use crate::model::TimeRange;
use crate::units::{Celsius, Degrees, Location, MetersPerSecond, MillimetersPerHour, Percent};
use chrono::{DateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The time width of a single forecast cell.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockSize {
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "3h")]
    ThreeHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "12h")]
    TwelveHours,
}

impl BlockSize {
    pub const fn hours(self) -> u32 {
        match self {
            Self::OneHour => 1,
            Self::ThreeHours => 3,
            Self::SixHours => 6,
            Self::TwelveHours => 12,
        }
    }

    pub const fn duration(self) -> Duration {
        Duration::from_secs(self.hours() as u64 * 3600)
    }

    pub fn chrono_duration(self) -> chrono::Duration {
        chrono::Duration::hours(i64::from(self.hours()))
    }

    /// Stable textual form used in cache keys and the on-disk schema.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OneHour => "1h",
            Self::ThreeHours => "3h",
            Self::SixHours => "6h",
            Self::TwelveHours => "12h",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "1h" => Some(Self::OneHour),
            "3h" => Some(Self::ThreeHours),
            "6h" => Some(Self::SixHours),
            "12h" => Some(Self::TwelveHours),
            _ => None,
        }
    }
}

/// Canonical condition codes. Every provider maps its native codes into
/// this closed set; no provider-specific code escapes its adapter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WeatherCode {
    ClearDay,
    ClearNight,
    FairDay,
    FairNight,
    PartlyCloudyDay,
    PartlyCloudyNight,
    Cloudy,
    Fog,
    LightRain,
    Rain,
    HeavyRain,
    RainShowersDay,
    RainShowersNight,
    LightSnow,
    Snow,
    HeavySnow,
    LightSleet,
    Sleet,
    HeavySleet,
    Thunder,
    RainAndThunder,
    HeavyRainAndThunder,
}

impl std::fmt::Display for WeatherCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ClearDay | Self::ClearNight => "clear",
            Self::FairDay | Self::FairNight => "fair",
            Self::PartlyCloudyDay | Self::PartlyCloudyNight => "partly cloudy",
            Self::Cloudy => "cloudy",
            Self::Fog => "fog",
            Self::LightRain => "light rain",
            Self::Rain => "rain",
            Self::HeavyRain => "heavy rain",
            Self::RainShowersDay | Self::RainShowersNight => "rain showers",
            Self::LightSnow => "light snow",
            Self::Snow => "snow",
            Self::HeavySnow => "heavy snow",
            Self::LightSleet => "light sleet",
            Self::Sleet => "sleet",
            Self::HeavySleet => "heavy sleet",
            Self::Thunder => "thunder",
            Self::RainAndThunder => "rain and thunder",
            Self::HeavyRainAndThunder => "heavy rain and thunder",
        };

        f.write_str(label)
    }
}

impl WeatherCode {
    /// Coarse severity used when several native cells collapse into one
    /// block: the block reports its worst condition.
    pub const fn severity(self) -> u8 {
        match self {
            Self::ClearDay | Self::ClearNight => 0,
            Self::FairDay | Self::FairNight => 1,
            Self::PartlyCloudyDay | Self::PartlyCloudyNight => 2,
            Self::Cloudy => 3,
            Self::Fog => 4,
            Self::LightRain | Self::LightSnow | Self::LightSleet => 5,
            Self::RainShowersDay | Self::RainShowersNight => 6,
            Self::Rain | Self::Snow | Self::Sleet => 7,
            Self::HeavyRain | Self::HeavySnow | Self::HeavySleet => 8,
            Self::Thunder => 9,
            Self::RainAndThunder => 10,
            Self::HeavyRainAndThunder => 11,
        }
    }
}

/// Day/night split used for condition-code variants: 06:00-17:59 local
/// hour is day. Adapters only know coordinates, so the local hour is
/// approximated as solar time, offsetting UTC by one hour per 15° of
/// longitude.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    Day,
    Night,
}

impl DayPhase {
    pub fn solar(time_utc: DateTime<Utc>, longitude: f64) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let offset = (longitude / 15.0).round() as i64;
        let hour = (i64::from(time_utc.hour()) + offset).rem_euclid(24);

        if (6..18).contains(&hour) {
            Self::Day
        } else {
            Self::Night
        }
    }

    pub fn at_zone(time_utc: DateTime<Utc>, tz: Tz) -> Self {
        let hour = tz.from_utc_datetime(&time_utc.naive_utc()).hour();

        if (6..18).contains(&hour) {
            Self::Day
        } else {
            Self::Night
        }
    }

    pub const fn pick(self, day: WeatherCode, night: WeatherCode) -> WeatherCode {
        match self {
            Self::Day => day,
            Self::Night => night,
        }
    }
}

const TEMPERATURE_RANGE: std::ops::RangeInclusive<f64> = -60.0..=60.0;
const WIND_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;
const PERCENT_RANGE: std::ops::RangeInclusive<f64> = 0.0..=100.0;

/// One forecast cell in canonical units. Optional fields are absent when
/// the provider does not report them, never zero-filled.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeatherSample {
    time_utc: DateTime<Utc>,
    block_size: BlockSize,
    temperature: Celsius,
    precipitation: MillimetersPerHour,
    precipitation_probability: Option<Percent>,
    wind_speed: MetersPerSecond,
    wind_direction: Option<Degrees>,
    code: WeatherCode,
    thunder_probability: Option<Percent>,
}

impl WeatherSample {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        time_utc: DateTime<Utc>,
        block_size: BlockSize,
        temperature: Celsius,
        precipitation: MillimetersPerHour,
        precipitation_probability: Option<Percent>,
        wind_speed: MetersPerSecond,
        wind_direction: Option<Degrees>,
        code: WeatherCode,
        thunder_probability: Option<Percent>,
    ) -> Result<Self, ValidationError> {
        let temp: f64 = temperature.into();
        if !TEMPERATURE_RANGE.contains(&temp) {
            return Err(ValidationError::OutOfRange {
                field: "temperature",
                value: temp.to_string(),
                range: "[-60, 60]",
            });
        }

        let precip: f64 = precipitation.into();
        if precip < 0.0 {
            return Err(ValidationError::OutOfRange {
                field: "precipitation",
                value: precip.to_string(),
                range: "[0, inf)",
            });
        }

        let wind: f64 = wind_speed.into();
        if !WIND_RANGE.contains(&wind) {
            return Err(ValidationError::OutOfRange {
                field: "wind_speed",
                value: wind.to_string(),
                range: "[0, 100]",
            });
        }

        for (field, value) in [
            ("precipitation_probability", precipitation_probability),
            ("thunder_probability", thunder_probability),
        ] {
            if let Some(pct) = value {
                let pct: f64 = pct.into();
                if !PERCENT_RANGE.contains(&pct) {
                    return Err(ValidationError::OutOfRange {
                        field,
                        value: pct.to_string(),
                        range: "[0, 100]",
                    });
                }
            }
        }

        Ok(Self {
            time_utc,
            block_size,
            temperature,
            precipitation,
            precipitation_probability,
            wind_speed,
            wind_direction,
            code,
            thunder_probability,
        })
    }

    pub const fn time_utc(&self) -> DateTime<Utc> {
        self.time_utc
    }

    pub const fn block_size(&self) -> BlockSize {
        self.block_size
    }

    pub const fn temperature(&self) -> Celsius {
        self.temperature
    }

    pub const fn precipitation(&self) -> MillimetersPerHour {
        self.precipitation
    }

    pub const fn precipitation_probability(&self) -> Option<Percent> {
        self.precipitation_probability
    }

    pub const fn wind_speed(&self) -> MetersPerSecond {
        self.wind_speed
    }

    pub const fn wind_direction(&self) -> Option<Degrees> {
        self.wind_direction
    }

    pub const fn code(&self) -> WeatherCode {
        self.code
    }

    pub const fn thunder_probability(&self) -> Option<Percent> {
        self.thunder_probability
    }
}

/// A contiguous, time-ordered run of samples from one provider.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WeatherForecast {
    location: Location,
    provider_id: String,
    samples: Vec<WeatherSample>,
    fetched_at_utc: DateTime<Utc>,
    expires_at_utc: DateTime<Utc>,
}

impl WeatherForecast {
    pub fn new(
        location: Location,
        provider_id: String,
        samples: Vec<WeatherSample>,
        fetched_at_utc: DateTime<Utc>,
        expires_at_utc: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        for pair in samples.windows(2) {
            let expected = pair[0].time_utc() + pair[0].block_size().chrono_duration();

            if pair[1].time_utc() != expected {
                return Err(ValidationError::GappySamples {
                    at: pair[1].time_utc().to_rfc3339(),
                });
            }
        }

        Ok(Self {
            location,
            provider_id,
            samples,
            fetched_at_utc,
            expires_at_utc,
        })
    }

    pub const fn location(&self) -> &Location {
        &self.location
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn samples(&self) -> &[WeatherSample] {
        &self.samples
    }

    pub const fn fetched_at_utc(&self) -> DateTime<Utc> {
        self.fetched_at_utc
    }

    pub const fn expires_at_utc(&self) -> DateTime<Utc> {
        self.expires_at_utc
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at_utc
    }

    /// Restricts to samples whose start lies in `[start, end)` of the
    /// requested range. Contiguity survives because restriction only
    /// trims a prefix and a suffix.
    pub fn restricted_to(mut self, range: &TimeRange) -> Self {
        self.samples
            .retain(|s| s.time_utc() >= range.start_utc() && s.time_utc() < range.end_utc());
        self
    }
}
