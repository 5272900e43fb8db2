use crate::model::{DecoratedEvent, EventPriority};
use chrono::Duration;
use log::debug;

/// Advisory that two events sit too close together. Events are never
/// mutated or dropped on conflict; priorities only order advisories in
/// operator-facing output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub a: String,
    pub b: String,
    /// Temporal overlap, or for gap-only conflicts the shortfall
    /// against the configured buffer.
    pub overlap: Duration,
    pub severity: EventPriority,
}

/// Merges decorated reservations and external events into one stream
/// ordered by start time (event id as tie-break) and derives conflict
/// advisories: overlapping ranges, or gaps shorter than
/// `buffer_minutes`.
pub fn assemble(
    mut events: Vec<DecoratedEvent>,
    buffer_minutes: i64,
) -> (Vec<DecoratedEvent>, Vec<Conflict>) {
    events.sort_by(|a, b| {
        a.event
            .time()
            .start_utc()
            .cmp(&b.event.time().start_utc())
            .then_with(|| a.event.id().cmp(b.event.id()))
    });

    let buffer = Duration::minutes(buffer_minutes.max(0));
    let mut conflicts = Vec::new();

    for (i, left) in events.iter().enumerate() {
        for right in &events[i + 1..] {
            // Sorted by start: once the next event begins after the
            // buffered end of this one, nothing further can conflict.
            if right.event.time().start_utc() >= left.event.time().end_utc() + buffer {
                break;
            }

            let overlap = match left.event.time().overlap(right.event.time()) {
                Some(overlap) => overlap,
                None => {
                    let gap = left
                        .event
                        .time()
                        .gap(right.event.time())
                        .unwrap_or_else(Duration::zero);

                    if gap >= buffer {
                        continue;
                    }

                    buffer - gap
                }
            };

            debug!(
                "Conflict between {:?} and {:?} ({overlap})",
                left.event.id(),
                right.event.id()
            );

            conflicts.push(Conflict {
                a: left.event.id().to_owned(),
                b: right.event.id().to_owned(),
                overlap,
                severity: left.event.priority().max(right.event.priority()),
            });
        }
    }

    conflicts.sort_by(|x, y| {
        y.severity
            .cmp(&x.severity)
            .then_with(|| y.overlap.cmp(&x.overlap))
            .then_with(|| x.a.cmp(&y.a))
    });

    (events, conflicts)
}
