use crate::error::ValidationError;
use crate::units::Location;
use crate::weather::WeatherForecast;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// A closed interval in UTC. Wall-clock display uses the local zone
/// carried on the owning event, never the range itself.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(try_from = "RawTimeRange")]
pub struct TimeRange {
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawTimeRange {
    start_utc: DateTime<Utc>,
    end_utc: DateTime<Utc>,
}

impl TryFrom<RawTimeRange> for TimeRange {
    type Error = ValidationError;

    fn try_from(raw: RawTimeRange) -> Result<Self, Self::Error> {
        Self::new(raw.start_utc, raw.end_utc)
    }
}

impl TimeRange {
    pub fn new(start_utc: DateTime<Utc>, end_utc: DateTime<Utc>) -> Result<Self, ValidationError> {
        if start_utc > end_utc {
            return Err(ValidationError::InvertedTimeRange {
                start: start_utc.to_rfc3339(),
                end: end_utc.to_rfc3339(),
            });
        }

        Ok(Self { start_utc, end_utc })
    }

    pub const fn start_utc(&self) -> DateTime<Utc> {
        self.start_utc
    }

    pub const fn end_utc(&self) -> DateTime<Utc> {
        self.end_utc
    }

    pub fn duration(&self) -> chrono::Duration {
        self.end_utc - self.start_utc
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start_utc <= instant && instant <= self.end_utc
    }

    /// Temporal overlap with another range, `None` when disjoint.
    pub fn overlap(&self, other: &Self) -> Option<chrono::Duration> {
        let start = self.start_utc.max(other.start_utc);
        let end = self.end_utc.min(other.end_utc);

        (start < end).then(|| end - start)
    }

    /// Gap between two disjoint ranges, `None` when they overlap or touch.
    pub fn gap(&self, other: &Self) -> Option<chrono::Duration> {
        if self.overlap(other).is_some() {
            return None;
        }

        let gap = if self.end_utc <= other.start_utc {
            other.start_utc - self.end_utc
        } else {
            self.start_utc - other.end_utc
        };

        Some(gap)
    }

    /// Widens the range symmetrically. Used for the weather window margin.
    pub fn widened(&self, margin: chrono::Duration) -> Self {
        Self {
            start_utc: self.start_utc - margin,
            end_utc: self.end_utc + margin,
        }
    }
}

const HANDICAP_MIN: f64 = -10.0;
const HANDICAP_MAX: f64 = 54.0;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Player {
    name: String,
    club_abbreviation: Option<String>,
    handicap: Option<f64>,
}

impl Player {
    pub fn new(
        name: String,
        club_abbreviation: Option<String>,
        handicap: Option<f64>,
    ) -> Result<Self, ValidationError> {
        if let Some(hcp) = handicap {
            if !(HANDICAP_MIN..=HANDICAP_MAX).contains(&hcp) {
                return Err(ValidationError::OutOfRange {
                    field: "handicap",
                    value: hcp.to_string(),
                    range: "[-10, 54]",
                });
            }
        }

        Ok(Self {
            name,
            club_abbreviation,
            handicap,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn club_abbreviation(&self) -> Option<&str> {
        self.club_abbreviation.as_deref()
    }

    pub const fn handicap(&self) -> Option<f64> {
        self.handicap
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

/// A tee-time reservation normalized out of one of the CRM adapters.
/// Status transitions are only ever observed, never authored here.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Reservation {
    id: String,
    club_id: String,
    course_name: String,
    time: TimeRange,
    local_tz: Tz,
    players: Vec<Player>,
    booker_user_id: String,
    status: ReservationStatus,
    raw: serde_json::Value,
}

impl Reservation {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        club_id: String,
        course_name: String,
        time: TimeRange,
        local_tz: Tz,
        players: Vec<Player>,
        booker_user_id: String,
        status: ReservationStatus,
        raw: serde_json::Value,
    ) -> Result<Self, ValidationError> {
        if players.is_empty() {
            return Err(ValidationError::EmptyFlight { id });
        }

        Ok(Self {
            id,
            club_id,
            course_name,
            time,
            local_tz,
            players,
            booker_user_id,
            status,
            raw,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn club_id(&self) -> &str {
        &self.club_id
    }

    pub fn course_name(&self) -> &str {
        &self.course_name
    }

    pub const fn time(&self) -> &TimeRange {
        &self.time
    }

    pub const fn local_tz(&self) -> Tz {
        self.local_tz
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn booker_user_id(&self) -> &str {
        &self.booker_user_id
    }

    pub const fn status(&self) -> ReservationStatus {
        self.status
    }

    pub const fn raw(&self) -> &serde_json::Value {
        &self.raw
    }

    /// Replaces the flight with a fuller player list discovered after the
    /// initial fetch. The flight must stay non-empty.
    pub fn with_players(mut self, players: Vec<Player>) -> Result<Self, ValidationError> {
        if players.is_empty() {
            return Err(ValidationError::EmptyFlight {
                id: self.id.clone(),
            });
        }

        self.players = players;
        Ok(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl Default for EventPriority {
    fn default() -> Self {
        Self::Normal
    }
}

/// A user-supplied non-golf event that shares the calendar with
/// reservations.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExternalEvent {
    pub id: String,
    pub summary: String,
    pub time: TimeRange,
    pub local_tz: Tz,
    pub category: String,
    #[serde(default)]
    pub priority: EventPriority,
    #[serde(default)]
    pub location: Option<Location>,
}

/// Either kind of calendar entry, before weather decoration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum CalendarEvent {
    Golf(Reservation),
    External(ExternalEvent),
}

impl CalendarEvent {
    pub fn id(&self) -> &str {
        match self {
            Self::Golf(r) => r.id(),
            Self::External(e) => &e.id,
        }
    }

    pub const fn time(&self) -> &TimeRange {
        match self {
            Self::Golf(r) => r.time(),
            Self::External(e) => &e.time,
        }
    }

    pub const fn local_tz(&self) -> Tz {
        match self {
            Self::Golf(r) => r.local_tz(),
            Self::External(e) => e.local_tz,
        }
    }

    pub fn priority(&self) -> EventPriority {
        match self {
            Self::Golf(_) => EventPriority::Normal,
            Self::External(e) => e.priority,
        }
    }
}

/// A calendar entry with its best-effort forecast. Weather stays `None`
/// when every provider was unreachable and nothing usable was cached.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct DecoratedEvent {
    pub event: CalendarEvent,
    pub weather: Option<WeatherForecast>,
    pub served_stale: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    BearerToken,
    CookieSession,
    UrlParameter,
}

/// Opaque credential material. Never logged, never serialized into
/// cache keys, never part of an error payload; `Debug` redacts values.
#[derive(Deserialize, Clone, PartialEq, Eq)]
pub struct Credentials {
    auth_kind: AuthKind,
    secrets: BTreeMap<String, String>,
}

impl Credentials {
    pub const fn new(auth_kind: AuthKind, secrets: BTreeMap<String, String>) -> Self {
        Self { auth_kind, secrets }
    }

    pub const fn auth_kind(&self) -> AuthKind {
        self.auth_kind
    }

    pub fn secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(String::as_str)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("auth_kind", &self.auth_kind)
            .field("secrets", &format_args!("<{} redacted>", self.secrets.len()))
            .finish()
    }
}

/// A binding between a user and a club, carrying the credential material
/// for that club's tee sheet.
#[derive(Deserialize, Debug, Clone)]
pub struct Membership {
    pub club_id: String,
    pub user_id: String,
    pub credentials: Credentials,
    /// Calendar display length of a reservation whose tee sheet reports
    /// only a start time.
    #[serde(with = "humantime_serde", default = "default_display_duration")]
    pub display_duration: Duration,
    pub local_tz: Tz,
}

const fn default_display_duration() -> Duration {
    Duration::from_secs(4 * 60 * 60)
}
