use crate::aggregator::ErrorAggregator;
use crate::cancel::CancellationToken;
use crate::config::{ClubConfig, FanOuts, UserConfig};
use crate::crm::{CrmContext, CrmRegistry};
use crate::error::{ProviderError, ValidationError};
use crate::http::blocking_client;
use crate::model::{CalendarEvent, DecoratedEvent, ExternalEvent, Membership, Reservation};
use crate::weather::service::{WeatherOutcome, WeatherService};
use chrono::Utc;
use log::{info, warn};
use reqwest::blocking::Client;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};

/// Weather window margin around a reservation, in minutes.
const WEATHER_MARGIN_MINUTES: i64 = 0;

/// One membership whose fetch failed. The user's other memberships are
/// unaffected; the emitter notes the gap on the calendar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipFailure {
    pub club_id: String,
    pub message: String,
}

/// Per-user pipeline stage: iterates memberships, dispatches each to its
/// CRM adapter, completes flights, and decorates every reservation with
/// a forecast. Output order is not defined; the event pipeline re-sorts.
pub struct ReservationService {
    clubs: BTreeMap<String, ClubConfig>,
    registry: CrmRegistry,
    weather: Arc<WeatherService>,
    aggregator: Arc<ErrorAggregator>,
    fan_outs: FanOuts,
    horizon_days: u32,
    client: Client,
}

impl ReservationService {
    pub fn new(
        clubs: BTreeMap<String, ClubConfig>,
        registry: CrmRegistry,
        weather: Arc<WeatherService>,
        aggregator: Arc<ErrorAggregator>,
        fan_outs: FanOuts,
        horizon_days: u32,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            clubs,
            registry,
            weather,
            aggregator,
            fan_outs,
            horizon_days,
            client: blocking_client()?,
        })
    }

    /// Fetches and decorates everything the user's memberships yield.
    pub async fn decorated_events(
        self: Arc<Self>,
        user: &UserConfig,
        cancel: &CancellationToken,
    ) -> (Vec<DecoratedEvent>, Vec<MembershipFailure>) {
        let (reservations, failures) = Self::fetch_all_memberships(&self, user, cancel).await;
        let events = Self::decorate_all(&self, reservations, cancel).await;

        let stale = events.iter().filter(|e| e.served_stale).count();
        let missing = events.iter().filter(|e| e.weather.is_none()).count();
        info!(
            "Fetched {} reservations from {} memberships ({} failed); weather: {} decorated, {stale} stale, {missing} missing",
            events.len(),
            user.memberships.len(),
            failures.len(),
            events.len() - missing,
        );

        (events, failures)
    }

    async fn fetch_all_memberships(
        this: &Arc<Self>,
        user: &UserConfig,
        cancel: &CancellationToken,
    ) -> (Vec<Reservation>, Vec<MembershipFailure>) {
        let permits = this
            .fan_outs
            .memberships
            .min(user.memberships.len())
            .max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join_set = JoinSet::new();

        for membership in user.memberships.clone() {
            let service = Arc::clone(this);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("Semaphore is never closed");
                let club_id = membership.club_id.clone();

                let result = task::spawn_blocking(move || {
                    service.fetch_membership(&membership, &cancel)
                })
                .await;

                (club_id, result)
            });
        }

        let mut reservations = Vec::new();
        let mut failures = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            let Ok((club_id, result)) = joined else {
                warn!("Membership task was aborted");
                continue;
            };

            match result {
                Ok(Ok(mut fetched)) => reservations.append(&mut fetched),
                Ok(Err(error)) => {
                    warn!("Membership fetch for club {club_id:?} failed: {error}");
                    this.aggregator
                        .record(&format!("crm.{club_id}"), &error.to_string());
                    failures.push(MembershipFailure {
                        club_id,
                        message: error.to_string(),
                    });
                }
                Err(join_error) => {
                    warn!("Membership task for club {club_id:?} panicked: {join_error}");
                    failures.push(MembershipFailure {
                        club_id,
                        message: join_error.to_string(),
                    });
                }
            }
        }

        (reservations, failures)
    }

    fn fetch_membership(
        &self,
        membership: &Membership,
        cancel: &CancellationToken,
    ) -> Result<Vec<Reservation>, ProviderError> {
        cancel.ensure_live()?;

        let club = self
            .clubs
            .get(&membership.club_id)
            .ok_or_else(|| ValidationError::UnknownClub(membership.club_id.clone()))?;
        let adapter = self.registry.by_kind(&club.kind)?;

        let context = CrmContext {
            client: &self.client,
            cancel,
            now: Utc::now(),
        };

        let raws = adapter.list_reservations(&context, club, membership, self.horizon_days)?;

        let mut reservations = Vec::with_capacity(raws.len());

        for raw in &raws {
            cancel.ensure_live()?;

            let mut reservation = adapter.parse(club, membership, raw)?;

            // A failed flight completion degrades to the embedded list
            // instead of dropping the reservation.
            match adapter.list_flight_players(&context, club, membership, raw) {
                Ok(Some(players)) => {
                    reservation = reservation
                        .with_players(players)
                        .map_err(ProviderError::Validation)?;
                }
                Ok(None) => {}
                Err(error) => {
                    warn!(
                        "Flight completion for {:?} failed, keeping embedded players: {error}",
                        reservation.id()
                    );
                    self.aggregator
                        .record(&format!("crm.{}", membership.club_id), &error.to_string());
                }
            }

            reservations.push(reservation);
        }

        Ok(reservations)
    }

    async fn decorate_all(
        this: &Arc<Self>,
        reservations: Vec<Reservation>,
        cancel: &CancellationToken,
    ) -> Vec<DecoratedEvent> {
        let permits = this.fan_outs.weather.max(1);
        let semaphore = Arc::new(Semaphore::new(permits));
        let mut join_set = JoinSet::new();

        for reservation in reservations {
            let service = Arc::clone(this);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);

            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .expect("Semaphore is never closed");

                task::spawn_blocking(move || service.decorate(reservation, &cancel)).await
            });
        }

        let mut events = Vec::new();

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(event)) => events.push(event),
                Ok(Err(join_error)) => warn!("Decoration task panicked: {join_error}"),
                Err(join_error) => warn!("Decoration task was aborted: {join_error}"),
            }
        }

        events
    }

    fn decorate(&self, reservation: Reservation, cancel: &CancellationToken) -> DecoratedEvent {
        let window = reservation
            .time()
            .widened(chrono::Duration::minutes(WEATHER_MARGIN_MINUTES));

        let outcome = self.clubs.get(reservation.club_id()).map(|club| {
            self.weather
                .get_weather(&club.location, &window, None, cancel)
        });

        let outcome = match outcome {
            Some(Ok(outcome)) => outcome,
            Some(Err(error)) => {
                warn!(
                    "Weather decoration for {:?} failed: {error}",
                    reservation.id()
                );
                self.aggregator.record("weather.service", &error.to_string());
                WeatherOutcome::Unavailable
            }
            None => WeatherOutcome::Unavailable,
        };

        let served_stale = outcome.served_stale();
        let weather = match outcome {
            WeatherOutcome::Fresh(forecast) | WeatherOutcome::Stale(forecast) => Some(forecast),
            WeatherOutcome::Unavailable => None,
        };

        DecoratedEvent {
            event: CalendarEvent::Golf(reservation),
            weather,
            served_stale,
        }
    }

    /// Decorates one user-supplied event. Only events that carry a
    /// location get weather.
    pub fn decorate_external(
        &self,
        event: ExternalEvent,
        cancel: &CancellationToken,
    ) -> DecoratedEvent {
        let outcome = event.location.as_ref().map(|location| {
            self.weather
                .get_weather(location, &event.time, None, cancel)
        });

        let outcome = match outcome {
            Some(Ok(outcome)) => outcome,
            Some(Err(error)) => {
                warn!("Weather decoration for {:?} failed: {error}", event.id);
                self.aggregator.record("weather.service", &error.to_string());
                WeatherOutcome::Unavailable
            }
            None => WeatherOutcome::Unavailable,
        };

        let served_stale = outcome.served_stale();
        let weather = match outcome {
            WeatherOutcome::Fresh(forecast) | WeatherOutcome::Stale(forecast) => Some(forecast),
            WeatherOutcome::Unavailable => None,
        };

        DecoratedEvent {
            event: CalendarEvent::External(event),
            weather,
            served_stale,
        }
    }
}
