//! Greenfee tee sheets. Cookie-session family with the embedded-players
//! flow: one call returns the member's reservations with the whole
//! flight inlined, so no flight completion call exists.
//!
//! Wire date-times are RFC 3339 with an explicit UTC offset and are
//! converted to UTC on output.

use crate::config::ClubConfig;
use crate::crm::auth::{ensure_kind, AuthStrategy, CookieSession};
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

const KIND: &str = "greenfee";
const COOKIE_NAME: &str = "GFSESSID";

#[derive(Debug, Default)]
pub struct Greenfee {}

#[derive(Deserialize, Debug, Clone)]
struct GreenfeeReservation {
    id: u64,
    start: DateTime<Utc>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    course: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    players: Vec<GreenfeePlayer>,
}

#[derive(Deserialize, Debug, Clone)]
struct GreenfeePlayer {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    club: Option<String>,
    #[serde(default)]
    hcp: Option<f64>,
}

impl Greenfee {
    fn decode(raw: &RawReservation) -> Result<GreenfeeReservation, ProviderError> {
        serde_json::from_value(raw.payload.clone())
            .map_err(|e| ProviderError::Permanent(format!("malformed greenfee record: {e}")))
    }
}

impl CrmAdapter for Greenfee {
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
        ensure_kind(&membership.credentials, crate::model::AuthKind::CookieSession)?;

        let from = context.now.date_naive();
        let url = Url::parse_with_params(
            &club.base_url,
            &[("from", from.format("%Y-%m-%d").to_string())],
        )
        .map_err(|e| ProviderError::Permanent(format!("bad base URL: {e}")))?;

        let mut headers = HeaderMap::new();
        CookieSession::new(COOKIE_NAME).apply(&membership.credentials, &mut headers)?;

        debug!(
            "Listing greenfee reservations for club {:?} from {from}",
            club.name
        );

        let rows: Vec<serde_json::Value> = fetch_json(&OutboundRequest {
            source: KIND,
            client: context.client,
            method: Method::GET,
            url,
            headers,
            user_agent: crate::config::DEFAULT_USER_AGENT,
            retry: RetryPolicy::CRM,
            rate_gate: None,
            cancel: context.cancel,
            deadline: None,
        })?;

        let cutoff = context.now + ChronoDuration::days(i64::from(horizon_days));

        let mut raws = Vec::new();
        for payload in rows {
            let row: GreenfeeReservation = serde_json::from_value(payload.clone())
                .map_err(|e| ProviderError::Permanent(format!("malformed greenfee record: {e}")))?;

            if row.start > cutoff {
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

        let end = row.end.unwrap_or_else(|| {
            row.start
                + ChronoDuration::from_std(membership.display_duration)
                    .unwrap_or_else(|_| ChronoDuration::hours(4))
        });
        let time = TimeRange::new(row.start, end).map_err(ProviderError::Validation)?;

        let mut players: Vec<Player> = row
            .players
            .iter()
            .map(|p| tolerant_player(p.name.clone(), p.club.clone(), p.hcp))
            .collect();

        if players.len() > MAX_FLIGHT_PLAYERS {
            warn!(
                "Reservation {} carries {} players, capping at {MAX_FLIGHT_PLAYERS}",
                row.id,
                players.len()
            );
            players.truncate(MAX_FLIGHT_PLAYERS);
        }

        // A record without any inlined player still represents the
        // member's own booking.
        if players.is_empty() {
            players.push(tolerant_player(
                Some(format!("Member {}", membership.user_id)),
                None,
                None,
            ));
        }

        Reservation::new(
            reservation_id(&membership.club_id, &row.id.to_string()),
            membership.club_id.clone(),
            row.course
                .clone()
                .unwrap_or_else(|| club.course_name().to_owned()),
            time,
            club.local_tz,
            players,
            membership.user_id.clone(),
            map_status(row.status.as_deref()),
            raw.payload.clone(),
        )
        .map_err(ProviderError::Validation)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ClubConfig;
    use crate::crm::greenfee::Greenfee;
    use crate::crm::{CrmAdapter, RawReservation};
    use crate::model::{AuthKind, Credentials, Membership, ReservationStatus};
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn club() -> ClubConfig {
        serde_json::from_value(serde_json::json!({
            "name": "Hirsala Golf",
            "type": "greenfee",
            "lat": 60.0910,
            "lon": 24.4650,
            "base_url": "https://booking.hirsala.example/api/reservations",
            "local_tz": "Europe/Helsinki"
        }))
        .unwrap()
    }

    fn membership() -> Membership {
        Membership {
            club_id: "hirsala".into(),
            user_id: "777".into(),
            credentials: Credentials::new(
                AuthKind::CookieSession,
                BTreeMap::from([("session".to_owned(), "s3ss10n".to_owned())]),
            ),
            display_duration: Duration::from_secs(4 * 3600),
            local_tz: chrono_tz::Europe::Helsinki,
        }
    }

    #[test]
    fn parse_keeps_embedded_flight() {
        let reservation = Greenfee::default()
            .parse(
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({
                        "id": 99,
                        "start": "2026-08-15T06:30:00Z",
                        "end": "2026-08-15T10:30:00Z",
                        "course": "Hirsala Championship",
                        "status": "booked",
                        "players": [
                            { "name": "Maija M", "club": "HG", "hcp": 10.1 },
                            { "name": "Pekka P", "club": "HG" }
                        ]
                    }),
                },
            )
            .unwrap();

        assert_eq!("hirsala:99", reservation.id());
        assert_eq!("Hirsala Championship", reservation.course_name());
        assert_eq!(ReservationStatus::Confirmed, reservation.status());
        assert_eq!(2, reservation.players().len());
        assert_eq!(Some(10.1), reservation.players()[0].handicap());
        assert_eq!(
            Utc.with_ymd_and_hms(2026, 8, 15, 6, 30, 0).unwrap(),
            reservation.time().start_utc()
        );
    }

    #[test]
    fn empty_player_list_becomes_the_member() {
        let reservation = Greenfee::default()
            .parse(
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({
                        "id": 100,
                        "start": "2026-08-15T06:30:00Z"
                    }),
                },
            )
            .unwrap();

        assert_eq!(1, reservation.players().len());
        assert_eq!("Member 777", reservation.players()[0].name());
    }

    #[test]
    fn oversized_embedded_flight_is_capped() {
        let players: Vec<serde_json::Value> = (0..6)
            .map(|i| serde_json::json!({ "name": format!("P{i}") }))
            .collect();

        let reservation = Greenfee::default()
            .parse(
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({
                        "id": 101,
                        "start": "2026-08-15T06:30:00Z",
                        "players": players
                    }),
                },
            )
            .unwrap();

        assert_eq!(4, reservation.players().len());
    }

    #[test]
    fn flight_completion_is_a_no_op() {
        let client = crate::http::blocking_client().unwrap();
        let cancel = crate::cancel::CancellationToken::new();
        let context = crate::crm::CrmContext {
            client: &client,
            cancel: &cancel,
            now: Utc::now(),
        };

        let players = Greenfee::default()
            .list_flight_players(
                &context,
                &club(),
                &membership(),
                &RawReservation {
                    payload: serde_json::json!({ "id": 1, "start": "2026-08-15T06:30:00Z" }),
                },
            )
            .unwrap();

        assert!(players.is_none());
    }
}
