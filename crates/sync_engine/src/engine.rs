//! One polling loop per provider.
//!
//! The engine owns that provider's caches and scheduler; the store, publisher,
//! clock and settlement engine are shared with the other providers' engines.
//! Work inside one engine is sequential; engines run concurrently.

use chrono::{DateTime, Duration, Utc};
use feed_model::{Clock, Event, EventStatus, FeedError, FeedResult, Publisher, StopFlag, Store};
use logger::{now_iso, EventLogger, PollSummaryEvent};
use providers::{ProviderAdapter, ProviderEvent, SportPlan};
use serde_json::json;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::live_cache::{cache_key, LiveCacheConfig, LiveEventCache};
use crate::markets::MarketSynchronizer;
use crate::odds_cache::OddsCache;
use crate::reconcile::Reconciler;
use crate::scheduler::{PollKind, PollScheduler, SchedulerConfig};
use crate::settlement::SettlementEngine;
use crate::synthetic::{SyntheticOdds, SyntheticOddsConfig};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub tick: std::time::Duration,
    pub live_cache: LiveCacheConfig,
    pub odds_ttl: Duration,
    /// Odds requests allowed per poll on top of the list request.
    pub odds_per_poll: usize,
    pub odds_change_threshold: f64,
    pub fuzzy_window: Duration,
    pub synthetic: SyntheticOddsConfig,
    pub synthetic_seed: Option<u64>,
    pub scheduler: SchedulerConfig,
    /// Days covered by an upcoming poll, today included.
    pub upcoming_days: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick: std::time::Duration::from_secs(5),
            live_cache: LiveCacheConfig::default(),
            odds_ttl: Duration::seconds(60),
            odds_per_poll: 5,
            odds_change_threshold: 0.001,
            fuzzy_window: Duration::hours(2),
            synthetic: SyntheticOddsConfig::default(),
            synthetic_seed: None,
            scheduler: SchedulerConfig::default(),
            upcoming_days: 2,
        }
    }
}

/// Collaborators shared by every engine.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn Store>,
    pub publisher: Arc<dyn Publisher>,
    pub clock: Arc<dyn Clock>,
    pub audit: Option<Arc<EventLogger>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub fetched: usize,
    pub processed: usize,
    pub failed: usize,
    /// Events ended because they dropped out of the in-play list.
    pub ended: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub polls: usize,
    pub processed: usize,
    pub failed_polls: usize,
    pub budget_stopped: bool,
}

pub struct ProviderEngine {
    adapter: Arc<dyn ProviderAdapter>,
    deps: EngineDeps,
    reconciler: Reconciler,
    markets: MarketSynchronizer,
    synthetic: SyntheticOdds,
    live: LiveEventCache,
    odds: OddsCache,
    scheduler: Mutex<PollScheduler>,
    config: EngineConfig,
    stop: StopFlag,
}

impl ProviderEngine {
    pub fn new(
        adapter: Arc<dyn ProviderAdapter>,
        deps: EngineDeps,
        settlement: Arc<SettlementEngine>,
        config: EngineConfig,
    ) -> Self {
        let mut reconciler =
            Reconciler::new(deps.store.clone(), deps.publisher.clone(), deps.clock.clone(), settlement)
                .with_fuzzy_window(config.fuzzy_window);
        if let Some(audit) = &deps.audit {
            reconciler = reconciler.with_audit(audit.clone());
        }
        let markets = MarketSynchronizer::new(deps.store.clone(), deps.publisher.clone(), config.odds_change_threshold);
        let scheduler = PollScheduler::new(adapter.sports(), config.scheduler.clone(), deps.clock.now());
        Self {
            synthetic: SyntheticOdds::new(config.synthetic, config.synthetic_seed),
            live: LiveEventCache::new(config.live_cache),
            odds: OddsCache::new(config.odds_ttl),
            scheduler: Mutex::new(scheduler),
            adapter,
            deps,
            reconciler,
            markets,
            config,
            stop: StopFlag::new(),
        }
    }

    pub fn provider(&self) -> &'static str {
        self.adapter.name()
    }

    pub fn live_cache(&self) -> &LiveEventCache {
        &self.live
    }

    fn scheduler(&self) -> MutexGuard<'_, PollScheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run().await })
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    async fn run(&self) {
        let provider = self.provider();
        info!(provider, sports = self.scheduler().len(), "engine started");
        let mut interval = tokio::time::interval(self.config.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.stopped() => break,
                _ = interval.tick() => {
                    let report = self.tick().await;
                    if report.polls > 0 {
                        debug!(provider, polls = report.polls, processed = report.processed, "tick");
                    }
                }
            }
        }
        info!(provider, "engine stopped");
    }

    /// Runs every poll the scheduler says is due, highest priority first.
    /// A budget refusal ends the tick; the remaining polls stay due.
    pub async fn tick(&self) -> TickReport {
        let provider = self.provider();
        let now = self.deps.clock.now();
        let tasks = self.scheduler().plan(now, self.adapter.limiter().available_slots());
        let mut report = TickReport::default();

        for task in tasks {
            if self.stop.is_stopped() {
                break;
            }
            let plan = SportPlan { key: task.sport_key.clone(), slug: task.slug.clone(), tier: 0 };
            let result = match task.kind {
                PollKind::InPlay => self.poll_in_play(&plan).await,
                PollKind::Upcoming => self.poll_upcoming(&plan).await,
                PollKind::Discovery => self.poll_discovery(&plan).await,
            };
            match result {
                Ok(summary) => {
                    report.polls += 1;
                    report.processed += summary.processed;
                }
                Err(e) if e.is_budget_stop() => {
                    warn!(provider, sport = %task.sport_key, kind = task.kind.as_str(), "{e}, ending tick");
                    report.budget_stopped = true;
                    break;
                }
                Err(FeedError::Cancelled) => break,
                Err(e) => {
                    warn!(provider, sport = %task.sport_key, kind = task.kind.as_str(), err_kind = e.kind(), "poll failed: {e}");
                    report.failed_polls += 1;
                }
            }
            self.scheduler().mark_polled(&task.sport_key, task.kind, self.deps.clock.now());
        }

        let now = self.deps.clock.now();
        self.live.evict_expired(now);
        self.odds.prune(now);
        if report.processed > 0 {
            if let Err(e) = self.deps.store.refresh_sport_counts().await {
                warn!(provider, "sport count refresh failed: {e}");
            }
        }
        report
    }

    // ── Polls ────────────────────────────────────────────────────────────────

    pub async fn poll_in_play(&self, plan: &SportPlan) -> FeedResult<PollSummary> {
        let batch = self.adapter.fetch_in_play(&plan.key).await?;
        let mut summary = PollSummary { fetched: batch.events.len(), failed: batch.rejected, ..Default::default() };
        let mut odds_budget = self.config.odds_per_poll;
        let mut seen = HashSet::new();

        for incoming in &batch.events {
            seen.insert(incoming.provider_event_id.clone());
            match self.ingest_live(plan, incoming, &mut odds_budget).await {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    warn!(provider = self.provider(), id = %incoming.provider_event_id, "in-play event skipped: {e}");
                    summary.failed += 1;
                }
            }
        }

        let now = self.deps.clock.now();
        for gone in self.live.record_misses(&plan.slug, &seen, now) {
            let reason = format!("missing from {} in-play for {} polls", self.provider(), gone.miss_count);
            match self.reconciler.mark_ended(gone.event_id, &reason).await {
                Ok(Some(_)) => summary.ended += 1,
                Ok(None) => {}
                Err(e) => warn!(event_id = gone.event_id, "could not end missing event: {e}"),
            }
        }
        self.scheduler().set_live_count(&plan.key, self.live.live_count(&plan.slug));

        self.record(plan, PollKind::InPlay, &summary);
        Ok(summary)
    }

    async fn ingest_live(&self, plan: &SportPlan, incoming: &ProviderEvent, odds_budget: &mut usize) -> FeedResult<()> {
        let outcome = self.reconciler.reconcile(incoming).await?;
        let mut event = outcome.event;
        let now = self.deps.clock.now();

        match event.status {
            EventStatus::Live => {
                let obs = self.live.observe(
                    &plan.slug,
                    &incoming.provider_event_id,
                    event.id,
                    incoming.score_string(),
                    incoming.timer.clone(),
                    now,
                );
                if obs.score_changed {
                    self.deps.publisher.publish(
                        &format!("event:{}", event.id),
                        "score",
                        json!({
                            "eventId": event.id,
                            "scores": event.scores,
                            "timer": event.metadata.timer,
                        }),
                    );
                }
            }
            status if status.is_terminal() => {
                self.live.mark_ended(&plan.slug, &incoming.provider_event_id, now);
                return Ok(());
            }
            _ => {}
        }

        let went_live = outcome.transition.map_or(false, |t| t.went_live())
            || (outcome.created && event.status == EventStatus::Live);
        if went_live {
            if let Err(e) = self.markets.snapshot_pre_match(&mut event, now).await {
                warn!(event_id = event.id, "pre-match snapshot failed: {e}");
            }
        }
        self.sync_odds(plan, incoming, &event, odds_budget).await
    }

    pub async fn poll_upcoming(&self, plan: &SportPlan) -> FeedResult<PollSummary> {
        let today = self.deps.clock.now().date_naive();
        let mut summary = PollSummary::default();
        let mut odds_budget = self.config.odds_per_poll;
        for offset in 0..self.config.upcoming_days {
            if self.stop.is_stopped() {
                return Err(FeedError::Cancelled);
            }
            let day = today + chrono::Days::new(u64::from(offset));
            let batch = match self.adapter.fetch_upcoming(&plan.key, day, &self.stop).await {
                Ok(batch) => batch,
                // keep what earlier days produced unless the budget is gone
                Err(e) if offset > 0 && !e.is_budget_stop() => {
                    warn!(provider = self.provider(), sport = %plan.key, %day, "upcoming fetch failed: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            self.ingest_batch(plan, &batch.events, &mut summary, &mut odds_budget).await;
            summary.fetched += batch.events.len();
            summary.failed += batch.rejected;
        }
        self.record(plan, PollKind::Upcoming, &summary);
        Ok(summary)
    }

    /// Whole tree when the provider has one, otherwise today's fixtures.
    pub async fn poll_discovery(&self, plan: &SportPlan) -> FeedResult<PollSummary> {
        let (events, rejected) = match self.adapter.fetch_tree(&plan.key).await? {
            Some(tree) => (tree.into_events(), 0),
            None => {
                let today = self.deps.clock.now().date_naive();
                let batch = self.adapter.fetch_upcoming(&plan.key, today, &self.stop).await?;
                (batch.events, batch.rejected)
            }
        };
        let mut summary = PollSummary { fetched: events.len(), failed: rejected, ..Default::default() };
        // discovery spends its budget on fixtures, not prices
        let mut odds_budget = 0;
        self.ingest_batch(plan, &events, &mut summary, &mut odds_budget).await;
        self.record(plan, PollKind::Discovery, &summary);
        Ok(summary)
    }

    async fn ingest_batch(
        &self,
        plan: &SportPlan,
        events: &[ProviderEvent],
        summary: &mut PollSummary,
        odds_budget: &mut usize,
    ) {
        for incoming in events {
            let result = match self.reconciler.reconcile(incoming).await {
                Ok(outcome) if outcome.event.status.is_terminal() => Ok(()),
                Ok(outcome) => self.sync_odds(plan, incoming, &outcome.event, odds_budget).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    warn!(provider = self.provider(), id = %incoming.provider_event_id, "event skipped: {e}");
                    summary.failed += 1;
                }
            }
        }
    }

    // ── Odds ─────────────────────────────────────────────────────────────────

    /// Inline markets first, then a fetched odds payload when budget and the
    /// odds cache allow, then synthetic prices for events with no markets.
    async fn sync_odds(
        &self,
        plan: &SportPlan,
        incoming: &ProviderEvent,
        event: &Event,
        odds_budget: &mut usize,
    ) -> FeedResult<()> {
        if !incoming.markets.is_empty() {
            self.markets.sync_event(event, &incoming.markets).await;
            return Ok(());
        }

        let now = self.deps.clock.now();
        let key = cache_key(&plan.slug, &incoming.provider_event_id);
        if self.adapter.supports_odds() && *odds_budget > 0 && self.odds.should_fetch(&key, now) {
            *odds_budget -= 1;
            self.odds.record(&key, now);
            match self.adapter.fetch_odds(&plan.key, &incoming.provider_event_id).await {
                Ok(Some(raw)) if !raw.markets.is_empty() => {
                    self.markets.sync_event(event, &raw.markets).await;
                    return Ok(());
                }
                Ok(_) => {}
                Err(e) if e.is_budget_stop() => {
                    debug!(provider = self.provider(), "odds budget spent: {e}");
                    *odds_budget = 0;
                }
                Err(e) => warn!(provider = self.provider(), event_id = event.id, "odds fetch failed: {e}"),
            }
        }

        if self.deps.store.count_markets(event.id).await? == 0 {
            let synthetic = self.synthetic.markets(&event.sport_slug, &event.home_team, &event.away_team);
            self.markets.sync_event(event, &synthetic).await;
        }
        Ok(())
    }

    fn record(&self, plan: &SportPlan, kind: PollKind, summary: &PollSummary) {
        debug!(
            provider = self.provider(),
            sport = %plan.slug,
            kind = kind.as_str(),
            fetched = summary.fetched,
            processed = summary.processed,
            failed = summary.failed,
            ended = summary.ended,
            "poll"
        );
        if let Some(audit) = &self.deps.audit {
            audit.log_quiet(&PollSummaryEvent {
                ts: now_iso(),
                event: "POLL_SUMMARY",
                provider: self.provider().to_string(),
                sport: plan.slug.clone(),
                kind: kind.as_str(),
                fetched: summary.fetched,
                processed: summary.processed,
                failed: summary.failed,
                ended: summary.ended,
            });
        }
    }

    pub fn next_due(&self) -> Option<DateTime<Utc>> {
        self.scheduler().next_due()
    }
}
