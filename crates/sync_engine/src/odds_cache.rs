//! Short-lived memory of recent odds fetches, so one event is not re-fetched
//! every poll while its odds are still fresh.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

#[derive(Debug)]
pub struct OddsCache {
    ttl: Duration,
    fetched: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl OddsCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, fetched: Mutex::new(HashMap::new()) }
    }

    /// True when the key was never fetched or its last fetch is older than the TTL.
    pub fn should_fetch(&self, key: &str, now: DateTime<Utc>) -> bool {
        let fetched = self.fetched.lock().unwrap_or_else(PoisonError::into_inner);
        fetched.get(key).map_or(true, |at| now - *at >= self.ttl)
    }

    pub fn record(&self, key: &str, now: DateTime<Utc>) {
        self.fetched.lock().unwrap_or_else(PoisonError::into_inner).insert(key.to_string(), now);
    }

    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let mut fetched = self.fetched.lock().unwrap_or_else(PoisonError::into_inner);
        let before = fetched.len();
        fetched.retain(|_, at| now - *at < self.ttl);
        before - fetched.len()
    }
}

impl Default for OddsCache {
    fn default() -> Self {
        Self::new(Duration::seconds(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_ttl_gate() {
        let t0 = Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap();
        let cache = OddsCache::default();
        assert!(cache.should_fetch("1:42", t0));
        cache.record("1:42", t0);
        assert!(!cache.should_fetch("1:42", t0 + Duration::seconds(59)));
        assert!(cache.should_fetch("1:42", t0 + Duration::seconds(60)));
        assert!(cache.should_fetch("1:43", t0));
        assert_eq!(cache.prune(t0 + Duration::seconds(30)), 0);
        assert_eq!(cache.prune(t0 + Duration::seconds(61)), 1);
    }
}
