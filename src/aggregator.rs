use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// How many identical-fingerprint occurrences trip an immediate report.
const DEFAULT_COUNT_THRESHOLD: u32 = 5;
/// How long a window may accumulate before any occurrence trips one.
const DEFAULT_WINDOW: Duration = Duration::from_secs(300);
/// Bound on distinct fingerprints held; the lowest-count bucket is
/// dropped first under pressure.
const MAX_BUCKETS: usize = 256;

/// One coalesced error line, as emitted in reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatedError {
    pub component: String,
    pub fingerprint: String,
    pub count: u32,
    pub sample_message: String,
}

#[derive(Debug)]
struct Bucket {
    count: u32,
    sample_message: String,
}

#[derive(Debug)]
struct State {
    buckets: HashMap<(String, String), Bucket>,
    window_started_at: Instant,
}

/// Process-scoped error sink. Components report every failure here; the
/// aggregator deduplicates by `(component, message-fingerprint)` and
/// emits a coalesced report when a fingerprint repeats five times or a
/// five-minute window holds at least one occurrence.
///
/// Recording never blocks: under lock contention the event is logged
/// directly instead of aggregated.
#[derive(Debug)]
pub struct ErrorAggregator {
    state: Mutex<State>,
    count_threshold: u32,
    window: Duration,
}

impl Default for ErrorAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_COUNT_THRESHOLD, DEFAULT_WINDOW)
    }
}

/// Message fingerprint: digit runs collapse to `#` so messages that
/// differ only in ids, counts or status codes coalesce.
fn fingerprint(message: &str) -> String {
    let mut result = String::with_capacity(message.len());
    let mut in_digits = false;

    for c in message.chars() {
        if c.is_ascii_digit() {
            if !in_digits {
                result.push('#');
                in_digits = true;
            }
        } else {
            in_digits = false;
            result.push(c);
        }
    }

    result
}

impl ErrorAggregator {
    pub fn new(count_threshold: u32, window: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                buckets: HashMap::new(),
                window_started_at: Instant::now(),
            }),
            count_threshold,
            window,
        }
    }

    pub fn record(&self, component: &str, message: &str) {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("Aggregator busy, logging directly: [{component}] {message}");
            return;
        };

        let key = (component.to_owned(), fingerprint(message));

        if !state.buckets.contains_key(&key) && state.buckets.len() >= MAX_BUCKETS {
            evict_lowest_count(&mut state.buckets);
        }

        let bucket = state.buckets.entry(key.clone()).or_insert_with(|| Bucket {
            count: 0,
            sample_message: message.to_owned(),
        });
        bucket.count += 1;
        let tripped_count = bucket.count >= self.count_threshold;

        let tripped_window =
            state.window_started_at.elapsed() >= self.window && !state.buckets.is_empty();

        if tripped_count {
            let bucket = state
                .buckets
                .remove(&key)
                .expect("Bucket was just inserted");
            warn!(
                "Repeated failure in {}: {} ({} occurrences)",
                key.0, bucket.sample_message, bucket.count
            );
        }

        if tripped_window {
            Self::emit(&mut state);
        }
    }

    /// Emits whatever is pending regardless of thresholds. Called at the
    /// end of a pipeline run so short-lived processes still report.
    pub fn flush(&self) -> Vec<AggregatedError> {
        let mut state = self.state.lock().expect("Poisoned lock");

        Self::emit(&mut state)
    }

    fn emit(state: &mut State) -> Vec<AggregatedError> {
        let mut report: Vec<AggregatedError> = state
            .buckets
            .drain()
            .map(|((component, fp), bucket)| AggregatedError {
                component,
                fingerprint: fp,
                count: bucket.count,
                sample_message: bucket.sample_message,
            })
            .collect();

        report.sort_by(|a, b| b.count.cmp(&a.count).then(a.component.cmp(&b.component)));

        for line in &report {
            warn!(
                "{} failures in {}: {}",
                line.count, line.component, line.sample_message
            );
        }

        state.window_started_at = Instant::now();

        report
    }
}

fn evict_lowest_count(buckets: &mut HashMap<(String, String), Bucket>) {
    let victim = buckets
        .iter()
        .min_by_key(|(_, bucket)| bucket.count)
        .map(|(key, _)| key.clone());

    if let Some(key) = victim {
        buckets.remove(&key);
    }
}
