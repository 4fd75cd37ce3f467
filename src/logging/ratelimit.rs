use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const PRUNE_AT: usize = 512;

/// Drops repeats of the same message within a time window.
#[derive(Debug)]
pub struct RateLimiter {
    window: Duration,
    last_seen: HashMap<String, Instant>,
}

impl RateLimiter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_seen: HashMap::new(),
        }
    }

    /// Whether `key` may be emitted at `now`; records the emission when allowed
    pub fn allow_at(&mut self, key: &str, now: Instant) -> bool {
        if self.window.is_zero() {
            return true;
        }
        if let Some(prev) = self.last_seen.get(key)
            && now.saturating_duration_since(*prev) < self.window
        {
            return false;
        }
        if self.last_seen.len() >= PRUNE_AT {
            let window = self.window;
            self.last_seen
                .retain(|_, seen| now.saturating_duration_since(*seen) < window);
        }
        self.last_seen.insert(key.to_string(), now);
        true
    }
}

static WINDOW_MS: AtomicU64 = AtomicU64::new(0);
static GLOBAL: Lazy<Mutex<RateLimiter>> = Lazy::new(|| Mutex::new(RateLimiter::new(Duration::ZERO)));

/// Set the process-wide dedupe window
pub fn set_rate_limit_ms(ms: u64) {
    WINDOW_MS.store(ms, Ordering::Relaxed);
    if let Ok(mut limiter) = GLOBAL.lock() {
        limiter.window = Duration::from_millis(ms);
    }
}

pub(crate) fn should_emit(component: &str, level: tracing::Level, message: &str) -> bool {
    if WINDOW_MS.load(Ordering::Relaxed) == 0 {
        return true;
    }
    let key = format!("{}|{}|{}", component, level, message);
    GLOBAL
        .lock()
        .map_or(true, |mut limiter| limiter.allow_at(&key, Instant::now()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeats_inside_window_are_dropped() {
        let mut rl = RateLimiter::new(Duration::from_millis(400));
        let t0 = Instant::now();
        assert!(rl.allow_at("a", t0));
        assert!(!rl.allow_at("a", t0 + Duration::from_millis(100)));
        assert!(rl.allow_at("b", t0 + Duration::from_millis(100)));
        assert!(rl.allow_at("a", t0 + Duration::from_millis(450)));
    }

    #[test]
    fn zero_window_allows_everything() {
        let mut rl = RateLimiter::new(Duration::ZERO);
        let t0 = Instant::now();
        assert!(rl.allow_at("a", t0));
        assert!(rl.allow_at("a", t0));
    }
}
