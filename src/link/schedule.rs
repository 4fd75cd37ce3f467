//! Round scheduling: minimum interval, backoff ladder and jitter

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;
use tokio::time::Instant;

/// Retry delays in seconds, indexed by consecutive failures minus one
pub const BACKOFF_LADDER_S: [f64; 5] = [1.0, 2.0, 4.0, 8.0, 12.0];

/// Upper bound of the random delay added to every schedule
pub const MAX_JITTER: Duration = Duration::from_millis(200);

/// Delay before the next attempt after `consecutive_failures` failures, without jitter
pub fn backoff_delay(consecutive_failures: u32, backoff_max: Duration) -> Duration {
    let idx = (consecutive_failures.max(1) as usize - 1).min(BACKOFF_LADDER_S.len() - 1);
    Duration::from_secs_f64(BACKOFF_LADDER_S[idx]).min(backoff_max)
}

/// Counters and timing that drive the next attempt
#[derive(Debug, Clone, Default)]
pub struct ScheduleState {
    pub next_attempt_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub ok_count: u64,
    pub fail_count: u64,
    /// Sum of full-round read time over successful rounds
    pub acc_read_ms: f64,
    /// Sum of the gap between the two reads over successful rounds
    pub acc_skew_ms: f64,
}

impl ScheduleState {
    pub fn avg_read_ms(&self) -> f64 {
        if self.ok_count == 0 {
            0.0
        } else {
            self.acc_read_ms / self.ok_count as f64
        }
    }

    pub fn avg_skew_ms(&self) -> f64 {
        if self.ok_count == 0 {
            0.0
        } else {
            self.acc_skew_ms / self.ok_count as f64
        }
    }
}

#[derive(Debug)]
pub struct Scheduler {
    state: ScheduleState,
    min_interval: Duration,
    backoff_max: Duration,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(min_interval: Duration, backoff_max: Duration, seed: Option<u64>) -> Self {
        let rng = seed.map_or_else(StdRng::from_entropy, StdRng::seed_from_u64);
        Self {
            state: ScheduleState::default(),
            min_interval,
            backoff_max,
            rng,
        }
    }

    pub const fn state(&self) -> &ScheduleState {
        &self.state
    }

    /// A round may start now
    pub fn is_due(&self, now: Instant) -> bool {
        self.state.next_attempt_at.is_none_or(|at| now >= at)
    }

    /// Time left until the next round may start
    pub fn next_in(&self, now: Instant) -> Duration {
        self.state
            .next_attempt_at
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(now))
    }

    fn jitter(&mut self) -> Duration {
        Duration::from_secs_f64(self.rng.gen_range(0.0..MAX_JITTER.as_secs_f64()))
    }

    /// Book a successful round; returns the delay until the next one
    pub fn record_success(&mut self, now: Instant, read_ms: f64, skew_ms: f64) -> Duration {
        self.state.consecutive_failures = 0;
        self.state.ok_count += 1;
        self.state.acc_read_ms += read_ms;
        self.state.acc_skew_ms += skew_ms;
        let delay = self.min_interval + self.jitter();
        self.state.next_attempt_at = Some(now + delay);
        delay
    }

    /// Book a failed round; returns the backoff delay until the next one
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        self.state.consecutive_failures = self.state.consecutive_failures.saturating_add(1);
        self.state.fail_count += 1;
        let delay = backoff_delay(self.state.consecutive_failures, self.backoff_max) + self.jitter();
        self.state.next_attempt_at = Some(now + delay);
        delay
    }
}
