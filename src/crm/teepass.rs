//! Teepass tee sheets. URL-parameter family: credentials ride in the
//! query string, players arrive inlined. Wire date-times are UTC with a
//! `Z` suffix.

use crate::config::ClubConfig;
use crate::crm::auth::{ensure_kind, AuthStrategy, UrlParameter};
use crate::crm::{
    map_status, reservation_id, tolerant_player, CrmAdapter, CrmContext, RawReservation,
    MAX_FLIGHT_PLAYERS,
};
use crate::error::ProviderError;
use crate::http::{fetch_json, OutboundRequest, RetryPolicy};
use crate::model::{Membership, Player, Reservation, TimeRange};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde::Deserialize;

const KIND: &str = "teepass";
const TOKEN_PARAMETER: &str = "token";

#[derive(Debug, Default)]
pub struct Teepass {}

#[derive(Deserialize, Debug, Clone)]
struct TeepassBooking {
    booking_id: u64,
    begins_at: DateTime<Utc>,
    #[serde(default)]
    ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    course: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    flight: Vec<TeepassPlayer>,
}

#[derive(Deserialize, Debug, Clone)]
struct TeepassPlayer {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    club_code: Option<String>,
    #[serde(default)]
    exact_hcp: Option<f64>,
}

impl Teepass {
    fn decode(raw: &RawReservation) -> Result<TeepassBooking, ProviderError> {
        serde_json::from_value(raw.payload.clone())
            .map_err(|e| ProviderError::Permanent(format!("malformed teepass record: {e}")))
    }
}

impl CrmAdapter for Teepass {
    fn kind(&self) -> &'static str {
        KIND
    }

    fn list_reservations(
        &self,
        context: &CrmContext<'_>,
        club: &ClubConfig,
        membership: &Membership,
        horizon_days: u32,
    ) -> Result<Vec<RawReservation>, ProviderError> {
        ensure_kind(&membership.credentials, crate::model::AuthKind::UrlParameter)?;

        let from = context.now.date_naive();
        let base = Url::parse_with_params(
            &club.base_url,
            &[("from", from.format("%Y-%m-%d").to_string())],
        )
        .map_err(|e| ProviderError::Permanent(format!("bad base URL: {e}")))?;

        let url = UrlParameter::new(TOKEN_PARAMETER).build_url(base, &membership.credentials)?;

        debug!(
            "Listing teepass bookings for club {:?} from {from}",
            club.name
        );

        let rows: Vec<serde_json::Value> = fetch_json(&OutboundRequest {
            source: KIND,
            client: context.client,
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            user_agent: crate::config::DEFAULT_USER_AGENT,
            retry: RetryPolicy::CRM,
            rate_gate: None,
            cancel: context.cancel,
            deadline: None,
        })?;

        let cutoff = context.now + ChronoDuration::days(i64::from(horizon_days));

        let mut raws = Vec::new();
        for payload in rows {
            let row: TeepassBooking = serde_json::from_value(payload.clone())
                .map_err(|e| ProviderError::Permanent(format!("malformed teepass record: {e}")))?;

            if row.begins_at > cutoff {
                continue;
            }

            raws.push(RawReservation { payload });
        }

        Ok(raws)
    }

    fn parse(
        &self,
        club: &ClubConfig,
        membership: &Membership,
        raw: &RawReservation,
    ) -> Result<Reservation, ProviderError> {
        let row = Self::decode(raw)?;

        let end = row.ends_at.unwrap_or_else(|| {
            row.begins_at
                + ChronoDuration::from_std(membership.display_duration)
                    .unwrap_or_else(|_| ChronoDuration::hours(4))
        });
        let time = TimeRange::new(row.begins_at, end).map_err(ProviderError::Validation)?;

        let mut players: Vec<Player> = row
            .flight
            .iter()
            .map(|p| tolerant_player(p.display_name.clone(), p.club_code.clone(), p.exact_hcp))
            .collect();

        if players.len() > MAX_FLIGHT_PLAYERS {
            warn!(
                "Booking {} carries {} players, capping at {MAX_FLIGHT_PLAYERS}",
                row.booking_id,
                players.len()
            );
            players.truncate(MAX_FLIGHT_PLAYERS);
        }

        if players.is_empty() {
            players.push(tolerant_player(
                Some(format!("Member {}", membership.user_id)),
                None,
                None,
            ));
        }

        Reservation::new(
            reservation_id(&membership.club_id, &row.booking_id.to_string()),
            membership.club_id.clone(),
            row.course
                .clone()
                .unwrap_or_else(|| club.course_name().to_owned()),
            time,
            club.local_tz,
            players,
            membership.user_id.clone(),
            map_status(row.state.as_deref()),
            raw.payload.clone(),
        )
        .map_err(ProviderError::Validation)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ClubConfig;
    use crate::crm::teepass::Teepass;
    use crate::crm::{CrmAdapter, RawReservation};
    use crate::model::{AuthKind, Credentials, Membership};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn club() -> ClubConfig {
        serde_json::from_value(serde_json::json!({
            "name": "Costa Brava Golf",
            "type": "teepass",
            "lat": 41.8789,
            "lon": 2.7649,
            "base_url": "https://teepass.cbgolf.example/v1/bookings",
            "local_tz": "Europe/Madrid"
        }))
        .unwrap()
    }

    fn membership() -> Membership {
        Membership {
            club_id: "costa-brava".into(),
            user_id: "55".into(),
            credentials: Credentials::new(
                AuthKind::UrlParameter,
                BTreeMap::from([("token".to_owned(), "qwerty".to_owned())]),
            ),
            display_duration: Duration::from_secs(4 * 3600),
            local_tz: chrono_tz::Europe::Madrid,
        }
    }

    #[test]
    fn parse_normalizes_booking() {
        let reservation = Teepass::default()
            .parse(
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({
                        "booking_id": 314,
                        "begins_at": "2026-08-20T07:00:00Z",
                        "ends_at": "2026-08-20T11:00:00Z",
                        "state": "confirmed",
                        "flight": [
                            { "display_name": "Jordi B", "club_code": "CBG", "exact_hcp": 7.9 }
                        ]
                    }),
                },
            )
            .unwrap();

        assert_eq!("costa-brava:314", reservation.id());
        assert_eq!("Costa Brava Golf", reservation.course_name());
        assert_eq!(1, reservation.players().len());
        assert_eq!("Jordi B", reservation.players()[0].name());
        assert_eq!(
            Utc.with_ymd_and_hms(2026, 8, 20, 7, 0, 0).unwrap(),
            reservation.time().start_utc()
        );
        assert_eq!(chrono_tz::Europe::Madrid, reservation.local_tz());
    }

    #[test]
    fn missing_flight_becomes_the_member() {
        let reservation = Teepass::default()
            .parse(
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({
                        "booking_id": 315,
                        "begins_at": "2026-08-20T07:00:00Z"
                    }),
                },
            )
            .unwrap();

        assert_eq!("Member 55", reservation.players()[0].name());
        assert_eq!(chrono::Duration::hours(4), reservation.time().duration());
    }
}
