use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Canonical temperature unit. Everything leaving an adapter is Celsius.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, From, Into, PartialEq, PartialOrd, Display)]
#[display("{_0:.1}")]
pub struct Celsius(f64);

impl ToCelsius for Celsius {
    fn to_celsius(&self) -> Self {
        Self(self.0)
    }
}

#[derive(Deserialize, Debug, Copy, Clone, From, PartialEq)]
pub struct Kelvin(f64);

const ABSOLUTE_ZERO_IN_CELSIUS: f64 = 273.15;

impl ToCelsius for Kelvin {
    fn to_celsius(&self) -> Celsius {
        Celsius(self.0 - ABSOLUTE_ZERO_IN_CELSIUS)
    }
}

#[derive(Deserialize, Debug, Copy, Clone, From, PartialEq)]
pub struct Fahrenheit(f64);

impl ToCelsius for Fahrenheit {
    fn to_celsius(&self) -> Celsius {
        Celsius(((self.0 - 32.0) * 5.0) / 9.0)
    }
}

pub trait ToCelsius {
    fn to_celsius(&self) -> Celsius;
}

/// Canonical wind speed unit.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, From, Into, PartialEq, PartialOrd, Display)]
#[display("{_0:.1}")]
pub struct MetersPerSecond(f64);

#[derive(Deserialize, Debug, Copy, Clone, From, PartialEq)]
pub struct KilometersPerHour(f64);

impl From<KilometersPerHour> for MetersPerSecond {
    fn from(value: KilometersPerHour) -> Self {
        Self(value.0 / 3.6)
    }
}

/// Canonical precipitation intensity unit.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, From, Into, PartialEq, PartialOrd, Display)]
#[display("{_0:.2}")]
pub struct MillimetersPerHour(f64);

impl MillimetersPerHour {
    /// Spreads an accumulation measured over `hours` into a per-hour rate,
    /// assuming uniform distribution over the accumulation window.
    pub fn from_accumulation(millimeters: f64, hours: u32) -> Self {
        Self(millimeters / f64::from(hours.max(1)))
    }
}

/// Compass direction in degrees, normalized to `[0, 360)`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, Into, PartialEq, PartialOrd, Display)]
#[display("{_0:.0}")]
pub struct Degrees(f64);

impl From<f64> for Degrees {
    fn from(value: f64) -> Self {
        Self(value.rem_euclid(360.0))
    }
}

/// Probability or share expressed as a percentage `[0, 100]`.
#[derive(Serialize, Deserialize, Debug, Copy, Clone, From, Into, PartialEq, PartialOrd, Display)]
#[display("{_0:.0}")]
pub struct Percent(f64);

#[derive(Deserialize, Debug, Copy, Clone, PartialEq)]
#[serde(untagged)]
pub enum Ratio {
    Fraction(f64),
}

impl From<Ratio> for Percent {
    fn from(value: Ratio) -> Self {
        match value {
            Ratio::Fraction(v) => Self(v * 100.0),
        }
    }
}

/// A single geographic coordinate component.
///
/// Equality is epsilon-based so that values which round-trip through
/// provider payloads still compare equal.
#[derive(Serialize, Deserialize, From, Into, Debug, Copy, Clone, Display)]
#[display("{_0:.4}")]
pub struct Coordinate(f64);

const COORDINATE_EPSILON: f64 = 0.000_000_1;

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        (self.0 - other.0).abs() < COORDINATE_EPSILON
    }
}

/// Cache keys quantize coordinates to four decimal places (~11 m) so
/// repeated nearby queries share entries.
const QUANTIZATION_SCALE: f64 = 10_000.0;

impl Coordinate {
    pub fn quantized(self) -> Self {
        Self((self.0 * QUANTIZATION_SCALE).round() / QUANTIZATION_SCALE)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Coordinates {
    #[serde(alias = "lat")]
    pub latitude: Coordinate,
    #[serde(alias = "lon")]
    pub longitude: Coordinate,
}

impl Coordinates {
    pub fn quantized(&self) -> Self {
        Self {
            latitude: self.latitude.quantized(),
            longitude: self.longitude.quantized(),
        }
    }
}

/// A validated point on earth with an optional altitude.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(try_from = "RawLocation", into = "RawLocation")]
pub struct Location {
    coordinates: Coordinates,
    altitude_meters: Option<i32>,
}

#[derive(Serialize, Deserialize, Clone)]
struct RawLocation {
    #[serde(flatten)]
    coordinates: Coordinates,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    altitude_meters: Option<i32>,
}

impl TryFrom<RawLocation> for Location {
    type Error = ValidationError;

    fn try_from(raw: RawLocation) -> Result<Self, Self::Error> {
        Self::new(raw.coordinates, raw.altitude_meters)
    }
}

impl From<Location> for RawLocation {
    fn from(location: Location) -> Self {
        Self {
            coordinates: location.coordinates,
            altitude_meters: location.altitude_meters,
        }
    }
}

impl Location {
    pub fn new(
        coordinates: Coordinates,
        altitude_meters: Option<i32>,
    ) -> Result<Self, ValidationError> {
        let lat: f64 = coordinates.latitude.into();
        let lon: f64 = coordinates.longitude.into();

        if !(-90.0..=90.0).contains(&lat) {
            return Err(ValidationError::OutOfRange {
                field: "latitude",
                value: lat.to_string(),
                range: "[-90, 90]",
            });
        }

        if !(-180.0..=180.0).contains(&lon) {
            return Err(ValidationError::OutOfRange {
                field: "longitude",
                value: lon.to_string(),
                range: "[-180, 180]",
            });
        }

        Ok(Self {
            coordinates,
            altitude_meters,
        })
    }

    pub const fn coordinates(&self) -> &Coordinates {
        &self.coordinates
    }

    pub const fn altitude_meters(&self) -> Option<i32> {
        self.altitude_meters
    }
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points, haversine on a sphere of
/// radius 6371 km.
pub fn haversine_km(a: &Coordinates, b: &Coordinates) -> f64 {
    let lat_a = f64::from(a.latitude).to_radians();
    let lat_b = f64::from(b.latitude).to_radians();
    let d_lat = (f64::from(b.latitude) - f64::from(a.latitude)).to_radians();
    let d_lon = (f64::from(b.longitude) - f64::from(a.longitude)).to_radians();

    let h = (d_lat / 2.0).sin().powi(2) + lat_a.cos() * lat_b.cos() * (d_lon / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use crate::units::{
        haversine_km, Celsius, Coordinate, Coordinates, Degrees, Fahrenheit, Kelvin,
        KilometersPerHour, Location, MetersPerSecond, MillimetersPerHour, ToCelsius,
    };
    use pretty_assertions::assert_eq;

    fn coords(lat: f64, lon: f64) -> Coordinates {
        Coordinates {
            latitude: lat.into(),
            longitude: lon.into(),
        }
    }

    #[test]
    fn kelvin_to_celsius() {
        assert_eq!(Celsius::from(0.0), Kelvin::from(273.15).to_celsius());
        assert_eq!(Celsius::from(-60.0), Kelvin::from(213.15).to_celsius());
    }

    #[test]
    fn fahrenheit_to_celsius() {
        assert_eq!(Celsius::from(0.0), Fahrenheit::from(32.0).to_celsius());
        assert_eq!(Celsius::from(100.0), Fahrenheit::from(212.0).to_celsius());
    }

    #[test]
    fn kmh_to_mps() {
        assert_eq!(
            MetersPerSecond::from(10.0),
            MetersPerSecond::from(KilometersPerHour::from(36.0))
        );
    }

    #[test]
    fn accumulation_spread_over_window() {
        assert_eq!(
            MillimetersPerHour::from(0.5),
            MillimetersPerHour::from_accumulation(3.0, 6)
        );
    }

    #[test]
    fn accumulation_with_zero_window_is_not_divided() {
        assert_eq!(
            MillimetersPerHour::from(3.0),
            MillimetersPerHour::from_accumulation(3.0, 0)
        );
    }

    #[test]
    fn degrees_normalized_into_range() {
        assert_eq!(Degrees::from(10.0), Degrees::from(370.0));
        assert_eq!(Degrees::from(350.0), Degrees::from(-10.0));
        assert_eq!(Degrees::from(0.0), Degrees::from(360.0));
    }

    #[test]
    fn quantization_rounds_to_four_decimals() {
        assert_eq!(
            Coordinate::from(59.8940),
            Coordinate::from(59.894_04).quantized()
        );
        assert_eq!(
            Coordinate::from(59.8941),
            Coordinate::from(59.894_06).quantized()
        );
        assert_eq!(
            Coordinate::from(-10.8282),
            Coordinate::from(-10.828_24).quantized()
        );
    }

    #[test]
    fn location_rejects_out_of_range_latitude() {
        assert!(Location::new(coords(90.1, 0.0), None).is_err());
        assert!(Location::new(coords(-90.1, 0.0), None).is_err());
    }

    #[test]
    fn location_rejects_out_of_range_longitude() {
        assert!(Location::new(coords(0.0, 180.5), None).is_err());
    }

    #[test]
    fn location_accepts_boundaries() {
        assert!(Location::new(coords(90.0, -180.0), Some(-12)).is_ok());
    }

    #[test]
    fn location_serde_round_trips() {
        let location = Location::new(coords(59.8940, 10.8282), Some(90)).unwrap();
        let json = serde_json::to_string(&location).unwrap();

        assert_eq!(location, serde_json::from_str::<Location>(&json).unwrap());
    }

    #[test]
    fn haversine_oslo_to_bergen() {
        let oslo = coords(59.9139, 10.7522);
        let bergen = coords(60.3913, 5.3221);

        let distance = haversine_km(&oslo, &bergen);

        assert!(
            (distance - 305.0).abs() < 5.0,
            "expected ~305 km, got {distance}"
        );
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        let p = coords(41.8789, 2.7649);
        assert_eq!(0.0, haversine_km(&p, &p));
    }
}
