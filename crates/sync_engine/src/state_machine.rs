//! Event lifecycle rules.
//!
//! UPCOMING < LIVE < {ENDED, CANCELLED, POSTPONED}. Statuses only move up the
//! order; terminal statuses are never left. UPCOMING also moves to LIVE once the
//! start time has passed, whatever the feed says.

use chrono::{DateTime, Utc};
use feed_model::EventStatus;

/// Status for an event seen for the first time.
pub fn initial_status(reported: EventStatus, start_time: DateTime<Utc>, now: DateTime<Utc>) -> EventStatus {
    match reported {
        EventStatus::Upcoming if now >= start_time => EventStatus::Live,
        other => other,
    }
}

/// Status after applying a provider report to the stored status.
pub fn next_status(
    current: EventStatus,
    reported: EventStatus,
    start_time: DateTime<Utc>,
    now: DateTime<Utc>,
) -> EventStatus {
    if current.is_terminal() {
        return current;
    }
    let candidate = initial_status(reported, start_time, now);
    if candidate.rank() < current.rank() {
        current
    } else {
        candidate
    }
}

/// A status change worth acting on, `None` when nothing moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: EventStatus,
    pub to: EventStatus,
}

impl Transition {
    pub fn between(from: EventStatus, to: EventStatus) -> Option<Self> {
        (from != to).then_some(Self { from, to })
    }

    /// Settlement fires on this and only this.
    pub fn is_end(&self) -> bool {
        self.to == EventStatus::Ended
    }

    pub fn went_live(&self) -> bool {
        self.to == EventStatus::Live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const ALL: [EventStatus; 5] = [
        EventStatus::Upcoming,
        EventStatus::Live,
        EventStatus::Ended,
        EventStatus::Cancelled,
        EventStatus::Postponed,
    ];

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap()
    }

    #[test]
    fn test_live_is_never_downgraded() {
        let started = t0() - Duration::hours(1);
        assert_eq!(next_status(EventStatus::Live, EventStatus::Upcoming, started, t0()), EventStatus::Live);
    }

    #[test]
    fn test_time_fallback_to_live() {
        let start = t0() + Duration::minutes(10);
        assert_eq!(next_status(EventStatus::Upcoming, EventStatus::Upcoming, start, t0()), EventStatus::Upcoming);
        assert_eq!(
            next_status(EventStatus::Upcoming, EventStatus::Upcoming, start, t0() + Duration::minutes(10)),
            EventStatus::Live
        );
        assert_eq!(initial_status(EventStatus::Upcoming, t0() - Duration::minutes(1), t0()), EventStatus::Live);
    }

    #[test]
    fn test_terminal_statuses_stick() {
        for terminal in [EventStatus::Ended, EventStatus::Cancelled, EventStatus::Postponed] {
            for reported in ALL {
                assert_eq!(next_status(terminal, reported, t0(), t0()), terminal);
            }
        }
        assert_eq!(next_status(EventStatus::Upcoming, EventStatus::Cancelled, t0(), t0()), EventStatus::Cancelled);
        assert_eq!(next_status(EventStatus::Live, EventStatus::Postponed, t0(), t0()), EventStatus::Postponed);
    }

    #[test]
    fn test_random_histories_are_monotonic() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let start = t0() + Duration::minutes(rng.gen_range(-120..120));
            let mut now = t0() - Duration::hours(3);
            let mut status = initial_status(ALL[rng.gen_range(0..2)], start, now);
            let mut history = vec![status];
            for _ in 0..20 {
                now += Duration::minutes(rng.gen_range(0..30));
                status = next_status(status, ALL[rng.gen_range(0..ALL.len())], start, now);
                history.push(status);
            }
            for pair in history.windows(2) {
                assert!(pair[0].rank() <= pair[1].rank(), "{history:?}");
                if pair[0].is_terminal() {
                    assert_eq!(pair[0], pair[1]);
                }
            }
        }
    }

    #[test]
    fn test_transition_flags() {
        assert!(Transition::between(EventStatus::Live, EventStatus::Live).is_none());
        let t = Transition::between(EventStatus::Live, EventStatus::Ended).unwrap();
        assert!(t.is_end());
        assert!(!t.went_live());
    }
}
