use crate::cancel::CancellationToken;
use crate::error::ProviderError;
use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outbound politeness policy for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RatePolicy {
    #[default]
    Unlimited,
    /// At most one call per interval.
    MinInterval(Duration),
    /// At most `calls` calls per sliding window.
    PerWindow { calls: u32, window: Duration },
}

#[derive(Debug, Default)]
struct Gate {
    policy: RatePolicy,
    queue: VecDeque<u64>,
    next_ticket: u64,
    last_grant: Option<Instant>,
    grants: VecDeque<Instant>,
    /// One-shot override armed by an observed Retry-After. Cleared when
    /// the next slot is granted.
    not_before: Option<Instant>,
}

impl Gate {
    /// `None` when the head of the queue may proceed now, otherwise the
    /// earliest instant at which it could.
    fn ready_at(&mut self, now: Instant) -> Option<Instant> {
        if let Some(not_before) = self.not_before {
            if now < not_before {
                return Some(not_before);
            }
        }

        match self.policy {
            RatePolicy::Unlimited => None,
            RatePolicy::MinInterval(interval) => match self.last_grant {
                Some(last) if now < last + interval => Some(last + interval),
                _ => None,
            },
            RatePolicy::PerWindow { calls, window } => {
                while let Some(oldest) = self.grants.front() {
                    if *oldest + window <= now {
                        self.grants.pop_front();
                    } else {
                        break;
                    }
                }

                if self.grants.len() < calls as usize {
                    None
                } else {
                    self.grants.front().map(|oldest| *oldest + window)
                }
            }
        }
    }

    fn grant(&mut self, now: Instant) {
        self.not_before = None;
        self.last_grant = Some(now);

        if matches!(self.policy, RatePolicy::PerWindow { .. }) {
            self.grants.push_back(now);
        }
    }

    fn abandon(&mut self, ticket: u64) {
        self.queue.retain(|t| *t != ticket);
    }
}

/// Process-local gate shared by every task that talks to weather
/// providers. Callers always wait; there is no try-acquire. Waiters for
/// the same provider are released in arrival order, and a waiter that is
/// cancelled gives up its place without consuming a slot.
#[derive(Debug, Default)]
pub struct RateLimiter {
    gates: Mutex<HashMap<String, Gate>>,
    waiters: Condvar,
}

/// Upper bound on one condvar wait so cancellation and deadlines are
/// noticed promptly even without a wakeup.
const WAIT_SLICE: Duration = Duration::from_millis(25);

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provider_id: &str, policy: RatePolicy) {
        let mut gates = self.gates.lock().expect("Poisoned lock");

        gates.entry(provider_id.to_owned()).or_default().policy = policy;
    }

    /// Blocks until a slot for `provider_id` is available. Returns
    /// `Cancelled` when the token fires and `Timeout` when the deadline
    /// passes first; in both cases the caller's queue position is
    /// released without granting a slot.
    pub fn acquire(
        &self,
        provider_id: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<(), ProviderError> {
        let mut gates = self.gates.lock().expect("Poisoned lock");

        let gate = gates.entry(provider_id.to_owned()).or_default();
        let ticket = gate.next_ticket;
        gate.next_ticket += 1;
        gate.queue.push_back(ticket);

        loop {
            let now = Instant::now();

            if cancel.is_cancelled() {
                self.give_up(&mut gates, provider_id, ticket);
                return Err(ProviderError::Cancelled);
            }

            if deadline.is_some_and(|d| now >= d) {
                self.give_up(&mut gates, provider_id, ticket);
                return Err(ProviderError::Timeout);
            }

            let gate = gates
                .get_mut(provider_id)
                .expect("Gate exists for the lifetime of its waiters");

            let wait = if gate.queue.front() == Some(&ticket) {
                match gate.ready_at(now) {
                    None => {
                        gate.queue.pop_front();
                        gate.grant(now);
                        self.waiters.notify_all();
                        return Ok(());
                    }
                    Some(at) => (at - now).min(WAIT_SLICE),
                }
            } else {
                WAIT_SLICE
            };

            let (guard, _timeout) = self
                .waiters
                .wait_timeout(gates, wait)
                .expect("Poisoned lock");
            gates = guard;
        }
    }

    /// Arms a one-shot backoff for the provider, overriding the normal
    /// gate until it elapses. Later observations only ever push the
    /// release further out.
    pub fn observe_retry_after(&self, provider_id: &str, retry_after: Duration) {
        let mut gates = self.gates.lock().expect("Poisoned lock");

        let gate = gates.entry(provider_id.to_owned()).or_default();
        let proposed = Instant::now() + retry_after;
        gate.not_before = Some(gate.not_before.map_or(proposed, |nb| nb.max(proposed)));

        self.waiters.notify_all();
    }

    /// Whether a retry-after backoff is currently armed. The weather
    /// service consults this to skip a provider wholesale instead of
    /// queueing behind a known-armed gate.
    pub fn is_backing_off(&self, provider_id: &str) -> bool {
        let mut gates = self.gates.lock().expect("Poisoned lock");

        gates
            .get_mut(provider_id)
            .and_then(|gate| gate.not_before)
            .is_some_and(|nb| Instant::now() < nb)
    }

    fn give_up(&self, gates: &mut HashMap<String, Gate>, provider_id: &str, ticket: u64) {
        if let Some(gate) = gates.get_mut(provider_id) {
            gate.abandon(ticket);
        }

        self.waiters.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use crate::cancel::CancellationToken;
    use crate::error::ProviderError;
    use crate::weather::rate_limit::{RateLimiter, RatePolicy};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn unlimited_gate_grants_immediately() {
        let limiter = RateLimiter::new();
        let token = CancellationToken::new();

        let started = Instant::now();
        limiter.acquire("anything", &token, None).unwrap();

        assert!(started.elapsed() < Duration::from_millis(20));
    }

    #[test]
    fn min_interval_spaces_grants() {
        let limiter = RateLimiter::new();
        limiter.register("nordic", RatePolicy::MinInterval(Duration::from_millis(40)));
        let token = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire("nordic", &token, None).unwrap();
        }

        assert!(
            started.elapsed() >= Duration::from_millis(80),
            "three grants need two full intervals, got {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn windowed_cap_limits_burst() {
        let limiter = RateLimiter::new();
        limiter.register(
            "global",
            RatePolicy::PerWindow {
                calls: 2,
                window: Duration::from_millis(60),
            },
        );
        let token = CancellationToken::new();

        let started = Instant::now();
        for _ in 0..3 {
            limiter.acquire("global", &token, None).unwrap();
        }

        assert!(
            started.elapsed() >= Duration::from_millis(60),
            "third grant must wait for the window, got {:?}",
            started.elapsed()
        );
    }

    #[test]
    fn waiters_release_in_arrival_order() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.register("nordic", RatePolicy::MinInterval(Duration::from_millis(50)));
        let order = Arc::new(Mutex::new(Vec::new()));

        // Occupy the first slot so every thread below has to wait.
        limiter
            .acquire("nordic", &CancellationToken::new(), None)
            .unwrap();

        let handles: Vec<_> = (0..3)
            .map(|i| {
                let limiter = Arc::clone(&limiter);
                let order = Arc::clone(&order);
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10 * (i + 1)));
                    limiter
                        .acquire("nordic", &CancellationToken::new(), None)
                        .unwrap();
                    order.lock().unwrap().push(i);
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(vec![0, 1, 2], *order.lock().unwrap());
    }

    #[test]
    fn retry_after_overrides_the_gate() {
        let limiter = RateLimiter::new();
        limiter.register("nordic", RatePolicy::Unlimited);
        limiter.observe_retry_after("nordic", Duration::from_millis(60));

        assert!(limiter.is_backing_off("nordic"));

        let started = Instant::now();
        limiter
            .acquire("nordic", &CancellationToken::new(), None)
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(55));
        assert!(!limiter.is_backing_off("nordic"));
    }

    #[test]
    fn cancelled_waiter_releases_its_place() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.register(
            "nordic",
            RatePolicy::PerWindow {
                calls: 1,
                window: Duration::from_millis(100),
            },
        );

        limiter
            .acquire("nordic", &CancellationToken::new(), None)
            .unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let limiter = Arc::clone(&limiter);
            let token = token.clone();
            thread::spawn(move || limiter.acquire("nordic", &token, None))
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(ProviderError::Cancelled)));

        // The abandoned position must not block the next arrival longer
        // than the window itself.
        let started = Instant::now();
        limiter
            .acquire("nordic", &CancellationToken::new(), None)
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn deadline_turns_into_timeout() {
        let limiter = RateLimiter::new();
        limiter.register("nordic", RatePolicy::MinInterval(Duration::from_secs(3600)));
        let token = CancellationToken::new();

        limiter.acquire("nordic", &token, None).unwrap();

        let result = limiter.acquire(
            "nordic",
            &token,
            Some(Instant::now() + Duration::from_millis(40)),
        );

        assert!(matches!(result, Err(ProviderError::Timeout)));
    }
}
