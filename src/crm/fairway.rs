//! Fairway tee sheets. Bearer-token family with the split-player flow:
//! the reservations call returns only the owner's bookings with the
//! owner as sole player, and a second call against the REST base
//! returns every player booked on a resource for a given day, from
//! which flights are grouped by start time and resource id.
//!
//! Wire date-times are server-local wall clock without an offset; they
//! are interpreted in the club's configured IANA zone and converted to
//! UTC on output. This adapter never guesses: a club without a zone
//! cannot be configured.

use crate::config::ClubConfig;
use crate::crm::auth::{ensure_kind, AuthStrategy, BearerToken, UrlParameter};
use crate::crm::{
    map_status, reservation_id, tolerant_player, CrmAdapter, CrmContext, RawReservation,
    MAX_FLIGHT_PLAYERS,
};
use crate::error::ProviderError;
use crate::http::{fetch_json, OutboundRequest, RetryPolicy};
use crate::model::{Membership, Player, Reservation, TimeRange};
use chrono::{Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use log::{debug, warn};
use reqwest::header::HeaderMap;
use reqwest::{Method, Url};
use serde::Deserialize;

const KIND: &str = "fairway";
const SESSION_TYPE: &str = "teesheet";
const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Default)]
pub struct Fairway {}

#[derive(Deserialize, Debug, Clone)]
struct FairwayListResponse {
    #[serde(default)]
    rows: Option<Vec<serde_json::Value>>,
    #[serde(default)]
    reservations: Option<Vec<serde_json::Value>>,
}

impl FairwayListResponse {
    fn into_rows(self) -> Vec<serde_json::Value> {
        self.rows.or(self.reservations).unwrap_or_default()
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct FairwayReservation {
    reservation_time_id: u64,
    date_time_start: String,
    #[serde(default)]
    date_time_end: Option<String>,
    #[serde(default)]
    resource_id: Option<u64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    product_name: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    club_abbreviation: Option<String>,
    #[serde(default)]
    handicap_active: Option<f64>,
}

#[derive(Deserialize, Debug)]
struct FairwayFlightResponse {
    #[serde(default)]
    reservations: Vec<FairwayFlightPlayer>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct FairwayFlightPlayer {
    #[serde(default)]
    resource_id: Option<u64>,
    date_time_start: String,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    family_name: Option<String>,
    #[serde(default)]
    club_abbreviation: Option<String>,
    #[serde(default)]
    handicap_active: Option<f64>,
}

fn parse_local(value: &str, tz: Tz) -> Result<chrono::DateTime<Utc>, ProviderError> {
    let naive = NaiveDateTime::parse_from_str(value, WIRE_TIME_FORMAT)
        .map_err(|e| ProviderError::Permanent(format!("unparseable wire time {value:?}: {e}")))?;

    tz.from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
        .ok_or_else(|| {
            ProviderError::Permanent(format!("wire time {value:?} does not exist in {tz}"))
        })
}

fn full_name(first: Option<&str>, family: Option<&str>) -> Option<String> {
    match (first, family) {
        (Some(first), Some(family)) => Some(format!("{first} {family}")),
        (Some(first), None) => Some(first.to_owned()),
        (None, Some(family)) => Some(family.to_owned()),
        (None, None) => None,
    }
}

fn owner_player(row: &FairwayReservation) -> Player {
    tolerant_player(
        full_name(row.first_name.as_deref(), row.family_name.as_deref()),
        row.club_abbreviation.clone(),
        row.handicap_active,
    )
}

/// Groups the day's players into the reservation's flight: same resource
/// id and start time, at most four players. An empty group means the
/// full-day data did not know the reservation; the embedded owner-only
/// list then stands.
fn collect_flight(
    day_players: &[FairwayFlightPlayer],
    row: &FairwayReservation,
) -> Option<Vec<Player>> {
    let flight: Vec<Player> = day_players
        .iter()
        .filter(|p| p.resource_id == row.resource_id && p.date_time_start == row.date_time_start)
        .map(|p| {
            tolerant_player(
                full_name(p.first_name.as_deref(), p.family_name.as_deref()),
                p.club_abbreviation.clone(),
                p.handicap_active,
            )
        })
        .collect();

    if flight.is_empty() {
        return None;
    }

    if flight.len() > MAX_FLIGHT_PLAYERS {
        warn!(
            "Flight at {:?} has {} players, capping at {MAX_FLIGHT_PLAYERS}",
            row.date_time_start,
            flight.len()
        );
        return Some(flight.into_iter().take(MAX_FLIGHT_PLAYERS).collect());
    }

    Some(flight)
}

impl Fairway {
    fn decode(raw: &RawReservation) -> Result<FairwayReservation, ProviderError> {
        serde_json::from_value(raw.payload.clone())
            .map_err(|e| ProviderError::Permanent(format!("malformed fairway record: {e}")))
    }

    fn request<'a>(
        context: &'a CrmContext<'_>,
        url: Url,
        headers: HeaderMap,
    ) -> OutboundRequest<'a> {
        OutboundRequest {
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
        }
    }
}

impl CrmAdapter for Fairway {
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
        ensure_kind(&membership.credentials, crate::model::AuthKind::BearerToken)?;

        let from = context.now.date_naive();
        let base = Url::parse_with_params(
            &club.base_url,
            &[("from", from.format("%Y-%m-%d").to_string())],
        )
        .map_err(|e| ProviderError::Permanent(format!("bad base URL: {e}")))?;

        let url = UrlParameter::new("appauth").build_url(base, &membership.credentials)?;

        let mut headers = HeaderMap::new();
        BearerToken::new(Some(SESSION_TYPE)).apply(&membership.credentials, &mut headers)?;

        debug!(
            "Listing fairway reservations for club {:?} from {from}",
            club.name
        );

        let response: FairwayListResponse =
            fetch_json(&Self::request(context, url, headers))?;

        let cutoff = context.now + ChronoDuration::days(i64::from(horizon_days));

        let mut raws = Vec::new();
        for payload in response.into_rows() {
            let row: FairwayReservation = serde_json::from_value(payload.clone())
                .map_err(|e| ProviderError::Permanent(format!("malformed fairway record: {e}")))?;
            let start = parse_local(&row.date_time_start, club.local_tz)?;

            if start > cutoff {
                continue;
            }

            raws.push(RawReservation { payload });
        }

        Ok(raws)
    }

    /// The flight call is only worth making for future tee times; past
    /// reservations keep the owner-only player list.
    fn list_flight_players(
        &self,
        context: &CrmContext<'_>,
        club: &ClubConfig,
        membership: &Membership,
        raw: &RawReservation,
    ) -> Result<Option<Vec<Player>>, ProviderError> {
        let row = Self::decode(raw)?;
        let start = parse_local(&row.date_time_start, club.local_tz)?;

        if start <= context.now {
            return Ok(None);
        }

        let (Some(rest_base), Some(product_id)) = (&club.rest_base_url, &club.product_id) else {
            debug!(
                "Club {:?} has no REST base or product id, keeping embedded players",
                club.name
            );
            return Ok(None);
        };

        let date = row
            .date_time_start
            .split(' ')
            .next()
            .unwrap_or(&row.date_time_start);

        let base = Url::parse_with_params(
            &format!("{}/reservations", rest_base.trim_end_matches('/')),
            &[
                ("productid", product_id.as_str()),
                ("date", date),
                ("golf", "1"),
            ],
        )
        .map_err(|e| ProviderError::Permanent(format!("bad REST base URL: {e}")))?;

        let url = UrlParameter::new("appauth").build_url(base, &membership.credentials)?;

        let mut headers = HeaderMap::new();
        BearerToken::new(Some(SESSION_TYPE)).apply(&membership.credentials, &mut headers)?;

        let response: FairwayFlightResponse =
            fetch_json(&Self::request(context, url, headers))?;

        Ok(collect_flight(&response.reservations, &row))
    }

    fn parse(
        &self,
        club: &ClubConfig,
        membership: &Membership,
        raw: &RawReservation,
    ) -> Result<Reservation, ProviderError> {
        let row = Self::decode(raw)?;

        let start = parse_local(&row.date_time_start, club.local_tz)?;
        let end = match &row.date_time_end {
            Some(end) => parse_local(end, club.local_tz)?,
            None => {
                start
                    + ChronoDuration::from_std(membership.display_duration)
                        .unwrap_or_else(|_| ChronoDuration::hours(4))
            }
        };

        let time = TimeRange::new(start, end).map_err(ProviderError::Validation)?;

        let course_name = row
            .product_name
            .clone()
            .unwrap_or_else(|| club.course_name().to_owned());

        Reservation::new(
            reservation_id(&membership.club_id, &row.reservation_time_id.to_string()),
            membership.club_id.clone(),
            course_name,
            time,
            club.local_tz,
            vec![owner_player(&row)],
            membership.user_id.clone(),
            map_status(row.status.as_deref()),
            raw.payload.clone(),
        )
        .map_err(ProviderError::Validation)
    }
}
