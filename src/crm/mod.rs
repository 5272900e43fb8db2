pub mod auth;
pub mod fairway;
pub mod greenfee;
pub mod teepass;

use crate::cancel::CancellationToken;
use crate::config::ClubConfig;
use crate::error::{ProviderError, ValidationError};
use crate::model::{Membership, Player, Reservation, ReservationStatus};
use chrono::{DateTime, Utc};
use log::trace;
use reqwest::blocking::Client;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

/// A flight never carries more than four players; tee sheets that return
/// more are truncated.
pub const MAX_FLIGHT_PLAYERS: usize = 4;

/// One reservation as returned by a tee sheet, before normalization.
/// The payload shape is owned by the adapter that produced it.
#[derive(Debug, Clone)]
pub struct RawReservation {
    pub payload: serde_json::Value,
}

pub struct CrmContext<'a> {
    pub client: &'a Client,
    pub cancel: &'a CancellationToken,
    pub now: DateTime<Utc>,
}

/// One tee-sheet protocol. Implementations fetch raw reservations,
/// optionally complete flights with a second call, and normalize into
/// the common model. All returned times are UTC.
pub trait CrmAdapter: Debug + Send + Sync {
    /// The `club.type` id selecting this adapter.
    fn kind(&self) -> &'static str;

    fn list_reservations(
        &self,
        context: &CrmContext<'_>,
        club: &ClubConfig,
        membership: &Membership,
        horizon_days: u32,
    ) -> Result<Vec<RawReservation>, ProviderError>;

    /// Completes the flight for one reservation. `None` keeps the
    /// players already embedded in the raw record; the default is that
    /// no-op, for systems that inline players in the first call.
    fn list_flight_players(
        &self,
        _context: &CrmContext<'_>,
        _club: &ClubConfig,
        _membership: &Membership,
        _raw: &RawReservation,
    ) -> Result<Option<Vec<Player>>, ProviderError> {
        Ok(None)
    }

    fn parse(
        &self,
        club: &ClubConfig,
        membership: &Membership,
        raw: &RawReservation,
    ) -> Result<Reservation, ProviderError>;
}

pub type SharedCrmAdapter = Arc<dyn CrmAdapter>;

/// Adapter lookup keyed by the `club.type` string from configuration.
#[derive(Debug)]
pub struct CrmRegistry {
    adapters: HashMap<&'static str, SharedCrmAdapter>,
}

impl Default for CrmRegistry {
    fn default() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };

        registry.register(Arc::new(fairway::Fairway::default()));
        registry.register(Arc::new(greenfee::Greenfee::default()));
        registry.register(Arc::new(teepass::Teepass::default()));

        registry
    }
}

impl CrmRegistry {
    pub fn register(&mut self, adapter: SharedCrmAdapter) {
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub fn by_kind(&self, kind: &str) -> Result<SharedCrmAdapter, ProviderError> {
        self.adapters
            .get(kind)
            .map(Arc::clone)
            .ok_or_else(|| ValidationError::UnknownClubType(kind.to_owned()).into())
    }
}

/// Stable reservation id: the club id joined with the provider's own.
pub fn reservation_id(club_id: &str, provider_reservation_id: &str) -> String {
    format!("{club_id}:{provider_reservation_id}")
}

/// Status strings across tee sheets collapse into the common set;
/// transitions are observed, never authored, so unknown values default
/// to confirmed rather than failing the record.
pub fn map_status(value: Option<&str>) -> ReservationStatus {
    match value.map(str::to_lowercase).as_deref() {
        Some("pending" | "reserved" | "requested") => ReservationStatus::Pending,
        Some("cancelled" | "canceled") => ReservationStatus::Cancelled,
        Some("completed" | "past" | "finished") => ReservationStatus::Completed,
        Some("confirmed" | "active" | "booked") | None => ReservationStatus::Confirmed,
        Some(other) => {
            trace!("Unrecognized reservation status {other:?}, assuming confirmed");
            ReservationStatus::Confirmed
        }
    }
}

/// Builds a player from whatever fields the tee sheet managed to
/// deliver. Records missing a name entirely fall back to a placeholder
/// so the flight stays countable; invalid handicaps are dropped rather
/// than failing the reservation.
pub fn tolerant_player(
    name: Option<String>,
    club_abbreviation: Option<String>,
    handicap: Option<f64>,
) -> Player {
    let name = name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| "Guest".to_owned());

    Player::new(name.clone(), club_abbreviation.clone(), handicap)
        .or_else(|_| Player::new(name, club_abbreviation, None))
        .unwrap_or_else(|_| {
            Player::new("Guest".to_owned(), None, None).expect("Placeholder player is valid")
        })
}
