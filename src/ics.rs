//! Contract surface toward the ICS emitter. The emitter itself is an
//! external collaborator: this module fixes what every event in the
//! stream is guaranteed to carry (stable id, UTC range plus local zone,
//! coordinates, composed summary, forecast description, reminder
//! offset) and the trait a concrete emitter implements. No iCalendar
//! serialization happens in this crate.

use crate::model::{CalendarEvent, DecoratedEvent};
use crate::pipeline::Conflict;
use crate::reservations::MembershipFailure;
use crate::weather::model::WeatherForecast;
use chrono::{Duration, TimeZone};
use log::info;
use std::fmt::Debug;
use std::fmt::Write as _;
use std::path::Path;

/// Everything one user's calendar is built from: the time-ordered event
/// stream, the conflict advisories, and per-club fetch failures to note
/// on the calendar.
#[derive(Debug, Clone)]
pub struct Calendar {
    pub events: Vec<DecoratedEvent>,
    pub conflicts: Vec<Conflict>,
    pub notes: Vec<MembershipFailure>,
    /// Reminder offset relative to event start; negative is before.
    pub reminder: Duration,
}

pub trait CalendarSink: Debug + Send + Sync {
    fn write(&self, path: &Path, calendar: &Calendar) -> anyhow::Result<()>;
}

/// Human-readable one-line summary: course and flight for golf events,
/// the configured summary for external ones.
pub fn event_summary(event: &DecoratedEvent) -> String {
    match &event.event {
        CalendarEvent::Golf(reservation) => {
            let players = reservation
                .players()
                .iter()
                .map(crate::model::Player::name)
                .collect::<Vec<_>>()
                .join(", ");

            format!("Golf {}: {players}", reservation.course_name())
        }
        CalendarEvent::External(external) => external.summary.clone(),
    }
}

/// Structured description block with one line per forecast sample, in
/// the event's local wall clock. Stale data is flagged, missing weather
/// annotated rather than omitted.
pub fn event_description(event: &DecoratedEvent) -> String {
    let Some(forecast) = &event.weather else {
        return "Weather: unavailable".to_owned();
    };

    let mut description = String::from("Weather");
    if event.served_stale {
        description.push_str(" (stale)");
    }
    description.push(':');

    let tz = event.event.local_tz();

    for sample in forecast.samples() {
        let local = tz.from_utc_datetime(&sample.time_utc().naive_utc());

        let _ = write!(
            description,
            "\n{} {}: {}°C, {} mm/h",
            local.format("%H:%M"),
            sample.code(),
            sample.temperature(),
            sample.precipitation(),
        );

        if let Some(probability) = sample.precipitation_probability() {
            let _ = write!(description, " ({probability}%)");
        }

        let _ = write!(description, ", wind {} m/s", sample.wind_speed());

        if let Some(thunder) = sample.thunder_probability() {
            let _ = write!(description, ", thunder {thunder}%");
        }
    }

    description
}

/// Development sink: reports what a real emitter would write without
/// touching the filesystem. Used by `--dry-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink {}

impl CalendarSink for LogSink {
    fn write(&self, path: &Path, calendar: &Calendar) -> anyhow::Result<()> {
        info!(
            "Calendar for {}: {} events, {} conflicts, {} notes, reminder {}min",
            path.display(),
            calendar.events.len(),
            calendar.conflicts.len(),
            calendar.notes.len(),
            calendar.reminder.num_minutes(),
        );

        for event in &calendar.events {
            info!(
                "  {} {}",
                event.event.time().start_utc().format("%Y-%m-%d %H:%M"),
                event_summary(event)
            );
        }

        Ok(())
    }
}
