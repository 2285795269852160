//! Which sports to poll this tick.
//!
//! Each sport has a next-due time for its in-play and upcoming polls. A tick
//! returns due polls by tier, capped by the limiter's free slots; lower tiers
//! wait for the next tick. With nothing due and budget to spare, the sport
//! checked least recently gets a discovery poll.

use chrono::{DateTime, Duration, Utc};
use providers::SportPlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollKind {
    InPlay,
    Upcoming,
    Discovery,
}

impl PollKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PollKind::InPlay => "in_play",
            PollKind::Upcoming => "upcoming",
            PollKind::Discovery => "discovery",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollTask {
    pub sport_key: String,
    pub slug: String,
    pub kind: PollKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// In-play interval for tier 1, 2 and 3+.
    pub tier_intervals: [Duration; 3],
    /// Tier 2+ sports with nothing live are polled this many times less often.
    pub idle_factor: i32,
    pub upcoming_interval: Duration,
    /// Gap between consecutive sports' first polls.
    pub stagger: Duration,
    /// Free limiter slots required before a discovery poll is spent.
    pub discovery_min_slots: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tier_intervals: [Duration::seconds(15), Duration::seconds(30), Duration::seconds(60)],
            idle_factor: 4,
            upcoming_interval: Duration::minutes(30),
            stagger: Duration::seconds(3),
            discovery_min_slots: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct SportState {
    plan: SportPlan,
    next_in_play: DateTime<Utc>,
    next_upcoming: DateTime<Utc>,
    last_discovery: Option<DateTime<Utc>>,
    live_count: usize,
}

#[derive(Debug, Clone)]
pub struct PollScheduler {
    config: SchedulerConfig,
    sports: Vec<SportState>,
}

impl PollScheduler {
    pub fn new(mut plans: Vec<SportPlan>, config: SchedulerConfig, now: DateTime<Utc>) -> Self {
        plans.sort_by_key(|p| p.tier);
        let sports = plans
            .into_iter()
            .enumerate()
            .map(|(i, plan)| {
                let first = now + config.stagger * i as i32;
                SportState { plan, next_in_play: first, next_upcoming: first, last_discovery: None, live_count: 0 }
            })
            .collect();
        Self { config, sports }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn in_play_interval(&self, tier: u8, live_count: usize) -> Duration {
        let idx = usize::from(tier.clamp(1, 3) - 1);
        let base = self.config.tier_intervals[idx];
        if tier >= 2 && live_count == 0 {
            base * self.config.idle_factor
        } else {
            base
        }
    }

    /// Due polls in priority order, at most `available_slots` of them.
    pub fn plan(&self, now: DateTime<Utc>, available_slots: usize) -> Vec<PollTask> {
        let task = |s: &SportState, kind| PollTask { sport_key: s.plan.key.clone(), slug: s.plan.slug.clone(), kind };

        let mut in_play: Vec<&SportState> = self.sports.iter().filter(|s| s.next_in_play <= now).collect();
        in_play.sort_by_key(|s| (s.plan.tier, s.next_in_play));
        let mut upcoming: Vec<&SportState> = self.sports.iter().filter(|s| s.next_upcoming <= now).collect();
        upcoming.sort_by_key(|s| (s.plan.tier, s.next_upcoming));

        let due: Vec<PollTask> = in_play
            .into_iter()
            .map(|s| task(s, PollKind::InPlay))
            .chain(upcoming.into_iter().map(|s| task(s, PollKind::Upcoming)))
            .take(available_slots)
            .collect();
        if !due.is_empty() || available_slots < self.config.discovery_min_slots {
            return due;
        }

        self.sports
            .iter()
            .min_by_key(|s| (s.last_discovery, s.plan.tier))
            .map(|s| vec![task(s, PollKind::Discovery)])
            .unwrap_or_default()
    }

    pub fn mark_polled(&mut self, sport_key: &str, kind: PollKind, now: DateTime<Utc>) {
        let upcoming_interval = self.config.upcoming_interval;
        let Some(idx) = self.sports.iter().position(|s| s.plan.key == sport_key) else {
            return;
        };
        let interval = self.in_play_interval(self.sports[idx].plan.tier, self.sports[idx].live_count);
        let state = &mut self.sports[idx];
        match kind {
            PollKind::InPlay => state.next_in_play = now + interval,
            PollKind::Upcoming => state.next_upcoming = now + upcoming_interval,
            PollKind::Discovery => state.last_discovery = Some(now),
        }
    }

    pub fn set_live_count(&mut self, sport_key: &str, live_count: usize) {
        if let Some(state) = self.sports.iter_mut().find(|s| s.plan.key == sport_key) {
            state.live_count = live_count;
        }
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.sports.iter().map(|s| s.next_in_play.min(s.next_upcoming)).min()
    }

    pub fn len(&self) -> usize {
        self.sports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sports.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn plan(key: &str, tier: u8) -> SportPlan {
        SportPlan { key: key.into(), slug: key.into(), tier }
    }

    fn kinds(tasks: &[PollTask]) -> Vec<(&str, PollKind)> {
        tasks.iter().map(|t| (t.sport_key.as_str(), t.kind)).collect()
    }

    #[test]
    fn test_start_is_staggered() {
        let s = PollScheduler::new(vec![plan("football", 1), plan("tennis", 2)], SchedulerConfig::default(), t0());
        assert_eq!(kinds(&s.plan(t0(), 10)), [("football", PollKind::InPlay), ("football", PollKind::Upcoming)]);
        let later = s.plan(t0() + Duration::seconds(3), 10);
        assert_eq!(later.len(), 4);
    }

    #[test]
    fn test_budget_cuts_lower_priority() {
        let plans = vec![plan("esports", 3), plan("football", 1), plan("basketball", 2)];
        let s = PollScheduler::new(plans, SchedulerConfig::default(), t0());
        let tasks = s.plan(t0() + Duration::seconds(10), 2);
        assert_eq!(kinds(&tasks), [("football", PollKind::InPlay), ("basketball", PollKind::InPlay)]);
        assert!(s.plan(t0() + Duration::seconds(10), 0).is_empty());
    }

    #[test]
    fn test_intervals_by_tier_and_activity() {
        let mut s = PollScheduler::new(vec![plan("football", 1), plan("tennis", 2)], SchedulerConfig::default(), t0());
        for kind in [PollKind::InPlay, PollKind::Upcoming] {
            s.mark_polled("football", kind, t0());
            s.mark_polled("tennis", kind, t0());
        }
        // tier 1 keeps its pace with nothing live; idle tier 2 slows down
        let due = s.plan(t0() + Duration::seconds(15), 10);
        assert_eq!(kinds(&due), [("football", PollKind::InPlay)]);
        assert!(!kinds(&s.plan(t0() + Duration::seconds(119), 10)).contains(&("tennis", PollKind::InPlay)));

        s.set_live_count("tennis", 2);
        s.mark_polled("tennis", PollKind::InPlay, t0());
        assert!(kinds(&s.plan(t0() + Duration::seconds(30), 10)).contains(&("tennis", PollKind::InPlay)));
    }

    #[test]
    fn test_discovery_only_when_idle_with_spare_budget() {
        let mut s = PollScheduler::new(vec![plan("football", 1), plan("tennis", 2)], SchedulerConfig::default(), t0());
        for key in ["football", "tennis"] {
            s.mark_polled(key, PollKind::InPlay, t0());
            s.mark_polled(key, PollKind::Upcoming, t0());
        }
        let now = t0() + Duration::seconds(5);
        assert_eq!(kinds(&s.plan(now, 5)), [("football", PollKind::Discovery)]);
        assert!(s.plan(now, 1).is_empty());

        s.mark_polled("football", PollKind::Discovery, now);
        assert_eq!(kinds(&s.plan(now, 5)), [("tennis", PollKind::Discovery)]);
        s.mark_polled("tennis", PollKind::Discovery, now + Duration::seconds(1));
        assert_eq!(kinds(&s.plan(now + Duration::seconds(2), 5)), [("football", PollKind::Discovery)]);
    }
}
