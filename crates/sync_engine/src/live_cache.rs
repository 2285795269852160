//! In-play bookkeeping per provider: who is live, last score, how many polls
//! an event has been missing from the in-play list.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveCacheConfig {
    /// Consecutive absences before an event counts as ended.
    pub miss_threshold: u32,
    /// How long a confirmed-ended entry is kept for late corrections.
    pub grace: Duration,
}

impl Default for LiveCacheConfig {
    fn default() -> Self {
        Self { miss_threshold: 3, grace: Duration::minutes(5) }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedLiveEvent {
    pub sport_slug: String,
    pub provider_event_id: String,
    pub event_id: i64,
    pub score: Option<String>,
    pub timer: Option<String>,
    pub miss_count: u32,
    pub last_updated: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    pub first_sighting: bool,
    pub score_changed: bool,
}

pub fn cache_key(sport_slug: &str, provider_event_id: &str) -> String {
    format!("{sport_slug}:{provider_event_id}")
}

#[derive(Debug, Default)]
pub struct LiveEventCache {
    config: LiveCacheConfig,
    entries: Mutex<HashMap<String, CachedLiveEvent>>,
}

impl LiveEventCache {
    pub fn new(config: LiveCacheConfig) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()) }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CachedLiveEvent>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records an in-play sighting. The first sighting never reports a score change.
    pub fn observe(
        &self,
        sport_slug: &str,
        provider_event_id: &str,
        event_id: i64,
        score: Option<String>,
        timer: Option<String>,
        now: DateTime<Utc>,
    ) -> Observation {
        let key = cache_key(sport_slug, provider_event_id);
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                let score_changed = matches!((&entry.score, &score), (Some(old), Some(new)) if old != new);
                entry.event_id = event_id;
                entry.miss_count = 0;
                entry.last_updated = now;
                if score.is_some() {
                    entry.score = score;
                }
                if timer.is_some() {
                    entry.timer = timer;
                }
                Observation { first_sighting: false, score_changed }
            }
            None => {
                entries.insert(
                    key,
                    CachedLiveEvent {
                        sport_slug: sport_slug.to_string(),
                        provider_event_id: provider_event_id.to_string(),
                        event_id,
                        score,
                        timer,
                        miss_count: 0,
                        last_updated: now,
                        ended_at: None,
                    },
                );
                Observation { first_sighting: true, score_changed: false }
            }
        }
    }

    /// The provider itself reported the event finished.
    pub fn mark_ended(&self, sport_slug: &str, provider_event_id: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.lock().get_mut(&cache_key(sport_slug, provider_event_id)) {
            entry.ended_at.get_or_insert(now);
        }
    }

    /// Bumps the miss count of every live entry of `sport_slug` not in `seen` and
    /// returns the entries that just crossed the threshold.
    pub fn record_misses(&self, sport_slug: &str, seen: &HashSet<String>, now: DateTime<Utc>) -> Vec<CachedLiveEvent> {
        let mut confirmed = Vec::new();
        for entry in self.lock().values_mut() {
            if entry.sport_slug != sport_slug || entry.ended_at.is_some() {
                continue;
            }
            if seen.contains(&entry.provider_event_id) {
                continue;
            }
            entry.miss_count += 1;
            if entry.miss_count >= self.config.miss_threshold {
                entry.ended_at = Some(now);
                confirmed.push(entry.clone());
            }
        }
        confirmed.sort_by_key(|e| e.event_id);
        confirmed
    }

    /// Drops ended entries whose grace window has passed.
    pub fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let grace = self.config.grace;
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.ended_at.map_or(true, |t| t + grace > now));
        before - entries.len()
    }

    pub fn get(&self, sport_slug: &str, provider_event_id: &str) -> Option<CachedLiveEvent> {
        self.lock().get(&cache_key(sport_slug, provider_event_id)).cloned()
    }

    /// Entries of `sport_slug` still considered live.
    pub fn live_count(&self, sport_slug: &str) -> usize {
        self.lock().values().filter(|e| e.sport_slug == sport_slug && e.ended_at.is_none()).count()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 20, 0, 0).unwrap()
    }

    fn seen(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_first_sighting_is_not_a_change() {
        let cache = LiveEventCache::new(LiveCacheConfig::default());
        let obs = cache.observe("football", "1", 10, Some("1-0".into()), None, t0());
        assert_eq!(obs, Observation { first_sighting: true, score_changed: false });
        let obs = cache.observe("football", "1", 10, Some("1-0".into()), None, t0());
        assert!(!obs.score_changed);
        let obs = cache.observe("football", "1", 10, Some("2-0".into()), None, t0());
        assert!(obs.score_changed);
        // a missing score does not erase the cached one
        let obs = cache.observe("football", "1", 10, None, None, t0());
        assert!(!obs.score_changed);
        assert_eq!(cache.get("football", "1").unwrap().score.as_deref(), Some("2-0"));
    }

    #[test]
    fn test_two_misses_then_seen_resets() {
        let cache = LiveEventCache::new(LiveCacheConfig::default());
        cache.observe("football", "1", 10, None, None, t0());
        assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        cache.observe("football", "1", 10, None, None, t0());
        assert_eq!(cache.get("football", "1").unwrap().miss_count, 0);
        assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        assert_eq!(cache.live_count("football"), 1);
    }

    #[test]
    fn test_third_miss_confirms_once_then_grace_eviction() {
        let cache = LiveEventCache::new(LiveCacheConfig::default());
        cache.observe("football", "1", 10, None, None, t0());
        cache.observe("basketball", "1", 11, None, None, t0());
        for _ in 0..2 {
            assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        }
        let ended = cache.record_misses("football", &seen(&[]), t0());
        assert_eq!(ended.len(), 1);
        assert_eq!(ended[0].event_id, 10);
        assert!(cache.record_misses("football", &seen(&[]), t0()).is_empty());
        assert_eq!(cache.live_count("basketball"), 1);

        assert_eq!(cache.evict_expired(t0() + Duration::minutes(4)), 0);
        assert_eq!(cache.evict_expired(t0() + Duration::minutes(5)), 1);
        assert_eq!(cache.len(), 1);
    }
}
