//! Safety net for events the pollers lost track of.
//!
//! Two passes per run: events still UPCOMING/LIVE hours after kick-off, and
//! LIVE events nobody has touched for a while (or that are simply too old).
//! Both end the event in bulk and hand it to settlement with their own source
//! tag. Placeholder orphans are deleted at the end of each run.

use chrono::Duration;
use feed_model::{Clock, EventStatus, FeedResult, StaleCriteria, StopFlag, Store};
use logger::{now_iso, EventLogger, StaleSweepEvent};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::settlement::{SettleSource, SettlementEngine};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaleSweepConfig {
    pub interval: std::time::Duration,
    /// UPCOMING/LIVE events that started this long ago are ended.
    pub unsettled_after: Duration,
    /// LIVE events without an update for this long are ended.
    pub idle_live_after: Duration,
    /// LIVE events that started this long ago are ended regardless of updates.
    pub max_live_age: Duration,
}

impl Default for StaleSweepConfig {
    fn default() -> Self {
        Self {
            interval: std::time::Duration::from_secs(300),
            unsettled_after: Duration::hours(4),
            idle_live_after: Duration::minutes(10),
            max_live_age: Duration::hours(6),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub unsettled_found: usize,
    pub idle_live_found: usize,
    pub settled: usize,
    pub orphans_removed: usize,
}

pub struct StaleSweeper {
    store: Arc<dyn Store>,
    settlement: Arc<SettlementEngine>,
    clock: Arc<dyn Clock>,
    config: StaleSweepConfig,
    audit: Option<Arc<EventLogger>>,
}

impl StaleSweeper {
    pub fn new(
        store: Arc<dyn Store>,
        settlement: Arc<SettlementEngine>,
        clock: Arc<dyn Clock>,
        config: StaleSweepConfig,
    ) -> Self {
        Self { store, settlement, clock, config, audit: None }
    }

    pub fn with_audit(mut self, audit: Arc<EventLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn run_once(&self) -> FeedResult<SweepReport> {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let unsettled = StaleCriteria {
            statuses: vec![EventStatus::Upcoming, EventStatus::Live],
            started_before: Some(now - self.config.unsettled_after),
            untouched_since: None,
            match_any: false,
        };
        let (found, settled) = self.pass(&unsettled, SettleSource::StaleSweep).await?;
        report.unsettled_found = found;
        report.settled += settled;
        self.record("unsettled", found, settled, 0);

        let idle_live = StaleCriteria {
            statuses: vec![EventStatus::Live],
            started_before: Some(now - self.config.max_live_age),
            untouched_since: Some(now - self.config.idle_live_after),
            match_any: true,
        };
        let (found, settled) = self.pass(&idle_live, SettleSource::StaleLive).await?;
        report.idle_live_found = found;
        report.settled += settled;

        report.orphans_removed = match self.store.delete_orphan_events().await {
            Ok(n) => n,
            Err(e) => {
                warn!("orphan cleanup failed: {e}");
                0
            }
        };
        self.record("idle_live", found, settled, report.orphans_removed);

        if report.unsettled_found + report.idle_live_found + report.orphans_removed > 0 {
            info!(
                unsettled = report.unsettled_found,
                idle_live = report.idle_live_found,
                settled = report.settled,
                orphans = report.orphans_removed,
                "stale sweep"
            );
        }
        Ok(report)
    }

    async fn pass(&self, criteria: &StaleCriteria, source: SettleSource) -> FeedResult<(usize, usize)> {
        let ended = self.store.bulk_mark_ended_by_staleness(criteria).await?;
        let mut settled = 0;
        for event in &ended {
            match self.settlement.settle_event(event, None, source).await {
                Ok(_) => settled += 1,
                Err(e) => warn!(event_id = event.id, source = source.as_str(), "stale settlement failed: {e}"),
            }
        }
        Ok((ended.len(), settled))
    }

    fn record(&self, pass: &'static str, found: usize, settled: usize, orphans_removed: usize) {
        if let Some(audit) = &self.audit {
            audit.log_quiet(&StaleSweepEvent {
                ts: now_iso(),
                event: "STALE_SWEEP",
                pass,
                found,
                settled,
                orphans_removed,
            });
        }
    }

    /// Runs until `stop` fires; a failed run is logged and retried next interval.
    pub async fn run(&self, stop: StopFlag) {
        let mut interval = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = stop.stopped() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(kind = e.kind(), "stale sweep failed: {e}");
                    }
                }
            }
        }
        info!("stale sweep stopped");
    }

    pub fn start(self: Arc<Self>, stop: StopFlag) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(stop).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use feed_model::memory::{MemoryJobQueue, MemoryStore, RecordingPublisher};
    use feed_model::{EventDraft, EventMetadata, ManualClock, Scores};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    struct Harness {
        clock: ManualClock,
        store: Arc<MemoryStore>,
        jobs: Arc<MemoryJobQueue>,
        sweeper: StaleSweeper,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(t0());
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::with_clock(shared.clone()));
        let jobs = Arc::new(MemoryJobQueue::new(shared.clone(), Duration::minutes(10)));
        let settlement = Arc::new(
            SettlementEngine::new(store.clone(), jobs.clone(), Arc::new(RecordingPublisher::new()), shared.clone())
                .with_seed(9),
        );
        let sweeper = StaleSweeper::new(store.clone(), settlement, shared, StaleSweepConfig::default());
        Harness { clock, store, jobs, sweeper }
    }

    async fn add(store: &MemoryStore, ext: &str, home: &str, status: EventStatus, start: DateTime<Utc>) -> i64 {
        store
            .create_event(EventDraft {
                competition_id: 1,
                sport_slug: "football".into(),
                external_id: ext.into(),
                home_team: home.into(),
                away_team: "Chelsea".into(),
                home_logo: None,
                away_logo: None,
                status,
                start_time: start,
                scores: None,
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_old_events_are_ended_and_settled_once() {
        let h = harness();
        let forgotten = add(&h.store, "betsapi:1", "Arsenal", EventStatus::Upcoming, t0() - Duration::hours(5)).await;
        let recent = add(&h.store, "betsapi:2", "Leeds", EventStatus::Upcoming, t0() - Duration::hours(1)).await;

        let report = h.sweeper.run_once().await.unwrap();
        assert_eq!((report.unsettled_found, report.settled), (1, 1));

        let ev = h.store.get_event(forgotten).await.unwrap().unwrap();
        assert_eq!(ev.status, EventStatus::Ended);
        assert!(ev.scores.is_some());
        assert_eq!(h.store.get_event(recent).await.unwrap().unwrap().status, EventStatus::Upcoming);
        let jobs = h.jobs.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].payload["source"], "stale-sweep");

        let again = h.sweeper.run_once().await.unwrap();
        assert_eq!(again, SweepReport::default());
        assert_eq!(h.jobs.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_idle_live_events_are_ended() {
        let h = harness();
        let idle = add(&h.store, "betsapi:1", "Arsenal", EventStatus::Live, t0() - Duration::minutes(30)).await;
        let busy = add(&h.store, "betsapi:2", "Leeds", EventStatus::Live, t0() - Duration::minutes(30)).await;

        h.clock.advance(Duration::minutes(11));
        let mut touched = h.store.get_event(busy).await.unwrap().unwrap();
        touched.updated_at = h.clock.now();
        touched.scores = Some(Scores::new(1, 1));
        h.store.update_event(&touched).await.unwrap();

        let report = h.sweeper.run_once().await.unwrap();
        assert_eq!((report.unsettled_found, report.idle_live_found), (0, 1));
        assert_eq!(h.store.get_event(idle).await.unwrap().unwrap().status, EventStatus::Ended);
        assert_eq!(h.store.get_event(busy).await.unwrap().unwrap().status, EventStatus::Live);
        assert_eq!(h.jobs.jobs()[0].payload["source"], "stale-live");
    }

    #[tokio::test]
    async fn test_orphans_removed() {
        let h = harness();
        add(&h.store, "betsapi:1", "TBD", EventStatus::Upcoming, t0() + Duration::hours(1)).await;
        let report = h.sweeper.run_once().await.unwrap();
        assert_eq!(report.orphans_removed, 1);
        assert!(h.store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_flag() {
        let h = harness();
        let sweeper = Arc::new(h.sweeper);
        let stop = StopFlag::new();
        let handle = sweeper.start(stop.clone());
        stop.stop();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle).await.unwrap().unwrap();
    }
}
