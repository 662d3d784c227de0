//! Per-caller rate limiting on a keyed `governor` limiter with an
//! injectable clock.
//!
//! One [`RateLimiter`] is created per process and shared by `Arc` with
//! whatever needs it. Time comes from a [`Clock`] so tests can step it.
//! A budget of `max_requests` per `window` allows a burst of `max_requests`
//! and then replenishes one request every `window / max_requests`.

use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::nanos::Nanos;
use governor::state::keyed::HashMapStateStore;
use governor::Quota;
use tracing::debug;

use crate::error::{Error, Result};

/// Keyed limiters shrink their state once this many callers are tracked.
const MAX_TRACKED_CALLERS: usize = 1000;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += step;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Presents a [`Clock`] to governor as nanoseconds since the limiter was
/// built. Readings before that point clamp to zero.
#[derive(Clone)]
struct GovernorClock {
    clock: Arc<dyn Clock>,
    epoch: DateTime<Utc>,
}

impl GovernorClock {
    fn new(clock: Arc<dyn Clock>) -> Self {
        let epoch = clock.now();
        Self { clock, epoch }
    }
}

impl governor::clock::Clock for GovernorClock {
    type Instant = Nanos;

    fn now(&self) -> Nanos {
        let elapsed = (self.clock.now() - self.epoch).to_std().unwrap_or_default();
        Nanos::from(elapsed)
    }
}

type KeyedLimiter = governor::RateLimiter<
    String,
    HashMapStateStore<String>,
    GovernorClock,
    governor::middleware::NoOpMiddleware<Nanos>,
>;

/// Rate limiter keyed by caller identity.
pub struct RateLimiter {
    /// `None` when the window is zero: every request is allowed.
    limiter: Option<KeyedLimiter>,
    clock: GovernorClock,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let burst = NonZeroU32::new(max_requests).unwrap_or(NonZeroU32::MIN);
        let clock = GovernorClock::new(clock);
        let limiter = Quota::with_period(window / burst.get())
            .map(|quota| quota.allow_burst(burst))
            .map(|quota| KeyedLimiter::hashmap_with_clock(quota, &clock));
        Self { limiter, clock }
    }

    /// Record a request for `caller`, or fail with [`Error::RateLimited`]
    /// when its budget is spent.
    pub fn check(&self, caller: &str) -> Result<()> {
        let Some(limiter) = &self.limiter else {
            return Ok(());
        };

        if limiter.len() > MAX_TRACKED_CALLERS {
            limiter.retain_recent();
        }

        limiter.check_key(&caller.to_string()).map_err(|not_until| {
            let now = governor::clock::Clock::now(&self.clock);
            let retry_after_ms = not_until.wait_time_from(now).as_millis() as u64;
            debug!(
                subsystem = "ingest",
                component = "rate_limit",
                caller,
                retry_after_ms,
                "Rate limit exceeded"
            );
            Error::RateLimited { retry_after_ms }
        })
    }
}
