use crate::model::TimeRange;
use crate::units::{haversine_km, Coordinates};
use crate::weather::model::{BlockSize, WeatherForecast};
use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Response-cache key. Coordinates are quantized to four decimal places
/// before key derivation so nearby queries share entries; the quantized
/// values are carried as scaled integers to keep the key hashable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey {
    provider_id: String,
    lat_e4: i32,
    lon_e4: i32,
    block_size: BlockSize,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

const QUANTIZATION_SCALE: f64 = 10_000.0;

fn quantize_e4(value: f64) -> i32 {
    #[allow(clippy::cast_possible_truncation)]
    {
        (value * QUANTIZATION_SCALE).round() as i32
    }
}

fn e4_to_f64(value: i32) -> f64 {
    f64::from(value) / QUANTIZATION_SCALE
}

impl ResponseKey {
    pub fn new(
        provider_id: &str,
        coordinates: &Coordinates,
        block_size: BlockSize,
        window: &TimeRange,
    ) -> Self {
        Self {
            provider_id: provider_id.to_owned(),
            lat_e4: quantize_e4(coordinates.latitude.into()),
            lon_e4: quantize_e4(coordinates.longitude.into()),
            block_size,
            window_start: window.start_utc(),
            window_end: window.end_utc(),
        }
    }

    fn lat(&self) -> f64 {
        e4_to_f64(self.lat_e4)
    }

    fn lon(&self) -> f64 {
        e4_to_f64(self.lon_e4)
    }
}

/// A coordinate→provider-location resolution, as stored by the location
/// cache for providers that key their API on location ids.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResolvedLocation {
    pub provider_location_id: String,
    pub provider_location_name: String,
    pub coordinates: Coordinates,
    pub resolved_at_utc: DateTime<Utc>,
}

const RESPONSE_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS response_cache (
    provider_id TEXT NOT NULL,
    lat REAL NOT NULL,
    lon REAL NOT NULL,
    block_size TEXT NOT NULL,
    window_start TEXT NOT NULL,
    window_end TEXT NOT NULL,
    forecast BLOB NOT NULL,
    fetched_at TEXT NOT NULL,
    expires_at TEXT NOT NULL,
    PRIMARY KEY (provider_id, lat, lon, block_size, window_start, window_end)
)";

const LOCATION_SCHEMA: &str = "CREATE TABLE IF NOT EXISTS location_cache (
    provider_id TEXT NOT NULL,
    query_lat REAL NOT NULL,
    query_lon REAL NOT NULL,
    provider_location_id TEXT NOT NULL,
    provider_location_name TEXT NOT NULL,
    resolved_lat REAL NOT NULL,
    resolved_lon REAL NOT NULL,
    distance_km REAL NOT NULL,
    resolved_at TEXT NOT NULL,
    PRIMARY KEY (provider_id, query_lat, query_lon)
)";

/// Opens (or creates) the cache database and returns handles for the two
/// logically independent stores sharing it. The connection serializes
/// readers and writers, which satisfies the per-key serialization
/// contract wholesale.
pub fn open(path: &Path) -> anyhow::Result<(ResponseCache, LocationCache)> {
    let connection = Connection::open(path)
        .with_context(|| format!("Opening cache database {}", path.display()))?;

    open_with(connection)
}

/// In-memory variant, used by tests and `--dry-run`.
pub fn open_ephemeral() -> anyhow::Result<(ResponseCache, LocationCache)> {
    open_with(Connection::open_in_memory()?)
}

fn open_with(connection: Connection) -> anyhow::Result<(ResponseCache, LocationCache)> {
    connection.execute(RESPONSE_SCHEMA, [])?;
    connection.execute(LOCATION_SCHEMA, [])?;

    let shared = Arc::new(Mutex::new(connection));

    Ok((
        ResponseCache {
            connection: Arc::clone(&shared),
        },
        LocationCache { connection: shared },
    ))
}

fn parse_instant(value: &str) -> anyhow::Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .map_err(|e| anyhow!("Unparseable cache timestamp {value:?}: {e}"))?
        .with_timezone(&Utc))
}

/// Durable store of provider forecast responses with provider-aligned
/// expiry. Entries past expiry are ignored by `get`, served only by
/// `get_ignoring_expiry`, and removed by `clear`.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    connection: Arc<Mutex<Connection>>,
}

impl ResponseCache {
    pub fn get(
        &self,
        key: &ResponseKey,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<WeatherForecast>> {
        self.select(key)?
            .filter(|forecast| !forecast.is_expired(now))
            .map_or(Ok(None), |forecast| Ok(Some(forecast)))
    }

    /// Stale-tolerant read used for best-effort service after every live
    /// provider has failed.
    pub fn get_ignoring_expiry(&self, key: &ResponseKey) -> anyhow::Result<Option<WeatherForecast>> {
        self.select(key)
    }

    fn select(&self, key: &ResponseKey) -> anyhow::Result<Option<WeatherForecast>> {
        let connection = self.connection.lock().expect("Poisoned lock");

        let row: Option<Vec<u8>> = connection
            .query_row(
                "SELECT forecast FROM response_cache
                 WHERE provider_id = ?1 AND lat = ?2 AND lon = ?3
                   AND block_size = ?4 AND window_start = ?5 AND window_end = ?6",
                params![
                    key.provider_id,
                    key.lat(),
                    key.lon(),
                    key.block_size.as_str(),
                    key.window_start.to_rfc3339(),
                    key.window_end.to_rfc3339(),
                ],
                |row| row.get(0),
            )
            .optional()?;

        row.map_or(Ok(None), |blob| {
            Ok(Some(serde_json::from_slice(&blob).with_context(|| {
                format!("Corrupt forecast blob for {:?}", key.provider_id)
            })?))
        })
    }

    /// Idempotent write, last writer wins. Durable before return.
    pub fn put(&self, key: &ResponseKey, forecast: &WeatherForecast) -> anyhow::Result<()> {
        let blob = serde_json::to_vec(forecast)?;
        let connection = self.connection.lock().expect("Poisoned lock");

        connection.execute(
            "INSERT OR REPLACE INTO response_cache
             (provider_id, lat, lon, block_size, window_start, window_end, forecast, fetched_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                key.provider_id,
                key.lat(),
                key.lon(),
                key.block_size.as_str(),
                key.window_start.to_rfc3339(),
                key.window_end.to_rfc3339(),
                blob,
                forecast.fetched_at_utc().to_rfc3339(),
                forecast.expires_at_utc().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Range-delete: both filters optional, combined conjunctively.
    pub fn clear(
        &self,
        provider_id: Option<&str>,
        older_than: Option<DateTime<Utc>>,
    ) -> anyhow::Result<usize> {
        let connection = self.connection.lock().expect("Poisoned lock");

        let deleted = match (provider_id, older_than) {
            (Some(provider), Some(cutoff)) => connection.execute(
                "DELETE FROM response_cache WHERE provider_id = ?1 AND fetched_at < ?2",
                params![provider, cutoff.to_rfc3339()],
            )?,
            (Some(provider), None) => connection.execute(
                "DELETE FROM response_cache WHERE provider_id = ?1",
                params![provider],
            )?,
            (None, Some(cutoff)) => connection.execute(
                "DELETE FROM response_cache WHERE fetched_at < ?1",
                params![cutoff.to_rfc3339()],
            )?,
            (None, None) => connection.execute("DELETE FROM response_cache", [])?,
        };

        debug!("Cleared {deleted} response cache entries");

        Ok(deleted)
    }
}

/// Durable store of coordinate→provider-location resolutions for
/// location-id based providers.
#[derive(Debug, Clone)]
pub struct LocationCache {
    connection: Arc<Mutex<Connection>>,
}

impl LocationCache {
    /// Returns the remembered resolution for the quantized query cell,
    /// unless it is older than `max_age` or farther than
    /// `max_distance_km` from the query.
    pub fn lookup(
        &self,
        provider_id: &str,
        query: &Coordinates,
        max_age: Duration,
        max_distance_km: f64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Option<ResolvedLocation>> {
        let connection = self.connection.lock().expect("Poisoned lock");

        let row: Option<(String, String, f64, f64, f64, String)> = connection
            .query_row(
                "SELECT provider_location_id, provider_location_name,
                        resolved_lat, resolved_lon, distance_km, resolved_at
                 FROM location_cache
                 WHERE provider_id = ?1 AND query_lat = ?2 AND query_lon = ?3",
                params![
                    provider_id,
                    e4_to_f64(quantize_e4(query.latitude.into())),
                    e4_to_f64(quantize_e4(query.longitude.into())),
                ],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, name, lat, lon, distance_km, resolved_at)) = row else {
            return Ok(None);
        };

        let resolved_at = parse_instant(&resolved_at)?;
        let age = now.signed_duration_since(resolved_at);

        if age > chrono::Duration::from_std(max_age)? || distance_km > max_distance_km {
            return Ok(None);
        }

        Ok(Some(ResolvedLocation {
            provider_location_id: id,
            provider_location_name: name,
            coordinates: Coordinates {
                latitude: lat.into(),
                longitude: lon.into(),
            },
            resolved_at_utc: resolved_at,
        }))
    }

    pub fn remember(
        &self,
        provider_id: &str,
        query: &Coordinates,
        resolved: &ResolvedLocation,
    ) -> anyhow::Result<()> {
        let quantized = query.quantized();
        let distance_km = haversine_km(&quantized, &resolved.coordinates);
        let connection = self.connection.lock().expect("Poisoned lock");

        connection.execute(
            "INSERT OR REPLACE INTO location_cache
             (provider_id, query_lat, query_lon, provider_location_id, provider_location_name,
              resolved_lat, resolved_lon, distance_km, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                provider_id,
                e4_to_f64(quantize_e4(query.latitude.into())),
                e4_to_f64(quantize_e4(query.longitude.into())),
                resolved.provider_location_id,
                resolved.provider_location_name,
                f64::from(resolved.coordinates.latitude),
                f64::from(resolved.coordinates.longitude),
                distance_km,
                resolved.resolved_at_utc.to_rfc3339(),
            ],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::model::TimeRange;
    use crate::units::{Coordinates, Location};
    use crate::weather::cache::{open, open_ephemeral, ResolvedLocation, ResponseKey};
    use crate::weather::model::{BlockSize, WeatherCode, WeatherForecast, WeatherSample};
    use chrono::{DateTime, TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn t(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 2, h, 0, 0).unwrap()
    }

    fn coords() -> Coordinates {
        Coordinates {
            latitude: 59.8940.into(),
            longitude: 10.8282.into(),
        }
    }

    fn forecast(expires_at: DateTime<Utc>) -> WeatherForecast {
        WeatherForecast::new(
            Location::new(coords(), None).unwrap(),
            "nordic".into(),
            vec![WeatherSample::new(
                t(10),
                BlockSize::OneHour,
                14.0.into(),
                0.2.into(),
                Some(35.0.into()),
                5.0.into(),
                Some(200.0.into()),
                WeatherCode::LightRain,
                None,
            )
            .unwrap()],
            t(9),
            expires_at,
        )
        .unwrap()
    }

    fn key() -> ResponseKey {
        ResponseKey::new(
            "nordic",
            &coords(),
            BlockSize::OneHour,
            &TimeRange::new(t(10), t(14)).unwrap(),
        )
    }

    #[test]
    fn get_after_put_returns_value_within_expiry() {
        let (responses, _) = open_ephemeral().unwrap();
        let stored = forecast(t(12));

        responses.put(&key(), &stored).unwrap();

        assert_eq!(Some(stored), responses.get(&key(), t(10)).unwrap());
    }

    #[test]
    fn expired_entry_is_a_miss_but_stays_readable_stale() {
        let (responses, _) = open_ephemeral().unwrap();
        let stored = forecast(t(12));

        responses.put(&key(), &stored).unwrap();

        assert_eq!(None, responses.get(&key(), t(12)).unwrap());
        assert_eq!(
            Some(stored),
            responses.get_ignoring_expiry(&key()).unwrap()
        );
    }

    #[test]
    fn last_write_wins() {
        let (responses, _) = open_ephemeral().unwrap();

        responses.put(&key(), &forecast(t(12))).unwrap();
        let newer = forecast(t(13));
        responses.put(&key(), &newer).unwrap();

        assert_eq!(Some(newer), responses.get(&key(), t(10)).unwrap());
    }

    #[test]
    fn nearby_queries_share_the_quantized_key() {
        let near = Coordinates {
            latitude: 59.894_04.into(),
            longitude: 10.828_16.into(),
        };
        let window = TimeRange::new(t(10), t(14)).unwrap();

        assert_eq!(
            key(),
            ResponseKey::new("nordic", &near, BlockSize::OneHour, &window)
        );
    }

    #[test]
    fn clear_by_provider_and_age() {
        let (responses, _) = open_ephemeral().unwrap();
        let other_key = ResponseKey::new(
            "global",
            &coords(),
            BlockSize::ThreeHours,
            &TimeRange::new(t(10), t(14)).unwrap(),
        );

        responses.put(&key(), &forecast(t(12))).unwrap();
        responses.put(&other_key, &forecast(t(12))).unwrap();

        assert_eq!(1, responses.clear(Some("nordic"), None).unwrap());
        assert_eq!(None, responses.get_ignoring_expiry(&key()).unwrap());
        assert!(responses.get_ignoring_expiry(&other_key).unwrap().is_some());

        // fetched_at is t(9); a cutoff before that deletes nothing.
        assert_eq!(0, responses.clear(None, Some(t(8))).unwrap());
        assert_eq!(1, responses.clear(None, Some(t(10))).unwrap());
    }

    #[test]
    fn cache_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weather.db");
        let stored = forecast(t(12));

        {
            let (responses, _) = open(&path).unwrap();
            responses.put(&key(), &stored).unwrap();
        }

        let (responses, _) = open(&path).unwrap();
        assert_eq!(Some(stored), responses.get(&key(), t(10)).unwrap());
    }

    #[test]
    fn location_lookup_respects_age_and_distance() {
        let (_, locations) = open_ephemeral().unwrap();
        let resolved = ResolvedLocation {
            provider_location_id: "2950159".into(),
            provider_location_name: "Oslo".into(),
            coordinates: Coordinates {
                latitude: 59.9139.into(),
                longitude: 10.7522.into(),
            },
            resolved_at_utc: t(9),
        };

        locations.remember("citygrid", &coords(), &resolved).unwrap();

        // Fresh and close enough: hit.
        let hit = locations
            .lookup(
                "citygrid",
                &coords(),
                Duration::from_secs(3600),
                50.0,
                t(9),
            )
            .unwrap();
        assert_eq!(Some(resolved.clone()), hit);

        // Too old: miss.
        assert_eq!(
            None,
            locations
                .lookup(
                    "citygrid",
                    &coords(),
                    Duration::from_secs(3600),
                    50.0,
                    t(11),
                )
                .unwrap()
        );

        // Too far: miss. Oslo center is ~5 km from the query point.
        assert_eq!(
            None,
            locations
                .lookup("citygrid", &coords(), Duration::from_secs(3600), 1.0, t(9))
                .unwrap()
        );
    }

    #[test]
    fn location_lookup_shares_quantized_cells() {
        let (_, locations) = open_ephemeral().unwrap();
        let resolved = ResolvedLocation {
            provider_location_id: "2950159".into(),
            provider_location_name: "Oslo".into(),
            coordinates: coords(),
            resolved_at_utc: t(9),
        };

        locations.remember("citygrid", &coords(), &resolved).unwrap();

        let near = Coordinates {
            latitude: 59.894_02.into(),
            longitude: 10.828_21.into(),
        };
        let hit = locations
            .lookup("citygrid", &near, Duration::from_secs(3600), 50.0, t(9))
            .unwrap();

        assert!(hit.is_some());
    }
}
