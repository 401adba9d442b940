//! Request admission control
//!
//! Fixed 60-second windows counted per caller plus one global window.
//! Windows reset lazily on read; there are no background timers.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

/// Entries beyond this count trigger a sweep of expired caller windows
const PRUNE_THRESHOLD: usize = 10_000;

/// Source of "now" for window bookkeeping
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic limiter scenarios
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Maximum admitted requests per caller per window
    pub per_caller_max: u32,
    /// Maximum admitted requests across all callers per window
    pub global_max: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_caller_max: 20,
            global_max: 1000,
            window: Duration::seconds(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    CallerLimit,
    GlobalLimit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    /// Requests this caller may still make in the current window
    pub remaining: u32,
    pub reason: Option<RejectReason>,
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
    count: u32,
    window_start: DateTime<Utc>,
}

impl WindowCounter {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_start: now,
        }
    }

    fn refresh(&mut self, now: DateTime<Utc>, window: Duration) {
        if now - self.window_start >= window {
            self.count = 0;
            self.window_start = now;
        }
    }

    fn expired(&self, now: DateTime<Utc>, window: Duration) -> bool {
        now - self.window_start >= window
    }
}

struct LimiterState {
    callers: HashMap<String, WindowCounter>,
    global: WindowCounter,
}

#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub tracked_callers: usize,
    pub global_count: u32,
}

/// Per-caller and global admission check. Both counters are updated under
/// one lock, so increment-and-check is atomic across concurrent requests.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: AsyncMutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        let now = clock.now();
        Self {
            config,
            clock,
            state: AsyncMutex::new(LimiterState {
                callers: HashMap::new(),
                global: WindowCounter::new(now),
            }),
        }
    }

    pub fn with_system_clock(config: RateLimitConfig) -> Self {
        Self::new(config, Arc::new(SystemClock))
    }

    pub async fn admit(&self, caller_id: &str) -> bool {
        self.check(caller_id).await.allowed
    }

    /// Admit or reject; on rejection no counter is incremented
    pub async fn check(&self, caller_id: &str) -> Admission {
        let now = self.clock.now();
        let window = self.config.window;
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        state.global.refresh(now, window);

        if state.callers.len() >= PRUNE_THRESHOLD {
            state.callers.retain(|_, counter| !counter.expired(now, window));
        }

        let global_count = state.global.count;
        let caller = state
            .callers
            .entry(caller_id.to_string())
            .or_insert_with(|| WindowCounter::new(now));
        caller.refresh(now, window);

        if caller.count >= self.config.per_caller_max {
            warn!(caller_id, count = caller.count, "Caller rate limit reached");
            return Admission {
                allowed: false,
                remaining: 0,
                reason: Some(RejectReason::CallerLimit),
            };
        }

        if global_count >= self.config.global_max {
            warn!(caller_id, global_count, "Global rate limit reached");
            return Admission {
                allowed: false,
                remaining: self.config.per_caller_max.saturating_sub(caller.count),
                reason: Some(RejectReason::GlobalLimit),
            };
        }

        caller.count += 1;
        let remaining = self.config.per_caller_max.saturating_sub(caller.count);
        state.global.count += 1;

        debug!(caller_id, remaining, "Request admitted");

        Admission {
            allowed: true,
            remaining,
            reason: None,
        }
    }

    pub async fn stats(&self) -> RateLimitStats {
        let state = self.state.lock().await;
        RateLimitStats {
            tracked_callers: state.callers.len(),
            global_count: state.global.count,
        }
    }
}
