//! Per-provider sliding-window admission control.
//!
//! Two rolling windows (minute, hour) plus a cooldown armed by a provider 429.
//! `try_acquire` never blocks; callers decide whether to wait or skip.

use chrono::{DateTime, Duration, Utc};
use feed_model::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub per_minute: u32,
    pub per_hour: u32,
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { per_minute: 30, per_hour: 1000, cooldown: Duration::minutes(5) }
    }
}

impl RateLimitConfig {
    pub fn new(per_minute: u32, per_hour: u32) -> Self {
        Self { per_minute, per_hour, ..Self::default() }
    }
}

#[derive(Debug, Default)]
struct LimiterState {
    admitted: VecDeque<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    successes: u64,
    throttled: u64,
}

impl LimiterState {
    fn prune(&mut self, now: DateTime<Utc>) {
        let horizon = now - Duration::hours(1);
        while self.admitted.front().map_or(false, |t| *t <= horizon) {
            self.admitted.pop_front();
        }
        if self.cooldown_until.map_or(false, |until| until <= now) {
            self.cooldown_until = None;
        }
    }

    fn minute_count(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - Duration::minutes(1);
        self.admitted.iter().rev().take_while(|t| **t > horizon).count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    pub last_minute: usize,
    pub last_hour: usize,
    pub successes: u64,
    pub throttled: u64,
    pub cooling_down: bool,
}

pub struct RateLimiter {
    provider: String,
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(provider: impl Into<String>, config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { provider: provider.into(), config, clock, state: Mutex::new(LimiterState::default()) }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admits one request if both windows have room and no cooldown is active.
    pub fn try_acquire(&self) -> bool {
        let now = self.clock.now();
        let mut st = self.lock();
        st.prune(now);
        if st.cooldown_until.is_some() {
            return false;
        }
        if st.minute_count(now) >= self.config.per_minute as usize
            || st.admitted.len() >= self.config.per_hour as usize
        {
            return false;
        }
        st.admitted.push_back(now);
        true
    }

    pub fn record_success(&self) {
        self.lock().successes += 1;
    }

    /// Provider answered 429: pause everything for the cooldown window.
    pub fn record_too_many_requests(&self) {
        let now = self.clock.now();
        let mut st = self.lock();
        st.throttled += 1;
        st.cooldown_until = Some(now + self.config.cooldown);
        warn!(provider = %self.provider, cooldown_secs = self.config.cooldown.num_seconds(), "provider throttled, cooling down");
    }

    /// Requests that could be admitted right now.
    pub fn available_slots(&self) -> usize {
        let now = self.clock.now();
        let mut st = self.lock();
        st.prune(now);
        if st.cooldown_until.is_some() {
            return 0;
        }
        let minute_left = (self.config.per_minute as usize).saturating_sub(st.minute_count(now));
        let hour_left = (self.config.per_hour as usize).saturating_sub(st.admitted.len());
        minute_left.min(hour_left)
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut st = self.lock();
        st.prune(now);
        st.cooldown_until.map(|until| until - now)
    }

    /// How long until the minute window frees a slot. `None` when a slot is free
    /// now, or when only the hour window or a cooldown is blocking.
    pub fn minute_slot_in(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut st = self.lock();
        st.prune(now);
        if st.cooldown_until.is_some() || st.admitted.len() >= self.config.per_hour as usize {
            return None;
        }
        let in_minute = st.minute_count(now);
        if in_minute == 0 || in_minute < self.config.per_minute as usize {
            return None;
        }
        let oldest_in_window = st.admitted.iter().rev().nth(in_minute - 1).copied()?;
        Some(oldest_in_window + Duration::minutes(1) - now)
    }

    pub fn stats(&self) -> LimiterStats {
        let now = self.clock.now();
        let mut st = self.lock();
        st.prune(now);
        LimiterStats {
            last_minute: st.minute_count(now),
            last_hour: st.admitted.len(),
            successes: st.successes,
            throttled: st.throttled,
            cooling_down: st.cooldown_until.is_some(),
        }
    }
}
