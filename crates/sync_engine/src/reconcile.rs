//! Folds provider events into canonical events.
//!
//! Lookup order: exact external id, fuzzy claim of another provider's event,
//! create. A unique-key conflict on link or create means another poller got
//! there first; the winner is re-read and updated instead.

use chrono::{DateTime, Duration, Utc};
use feed_model::{
    external_id, is_placeholder_team, slugify, Clock, CompetitionUpsert, Event, EventDraft, EventMetadata,
    EventStatus, FeedError, FeedResult, Publisher, SportUpsert, Store, StoreError,
};
use logger::{now_iso, EventLogger, StatusTransitionEvent};
use providers::ProviderEvent;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::matching::best_match;
use crate::settlement::{SettleSource, SettlementEngine, SettlementOutcome};
use crate::state_machine::{initial_status, next_status, Transition};

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileOutcome {
    pub event: Event,
    pub created: bool,
    /// This provider's id was attached to an event another provider created.
    pub linked: bool,
    pub transition: Option<Transition>,
    pub settlement: Option<SettlementOutcome>,
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    settlement: Arc<SettlementEngine>,
    fuzzy_window: Duration,
    audit: Option<Arc<EventLogger>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
        settlement: Arc<SettlementEngine>,
    ) -> Self {
        Self { store, publisher, clock, settlement, fuzzy_window: Duration::hours(2), audit: None }
    }

    pub fn with_fuzzy_window(mut self, window: Duration) -> Self {
        self.fuzzy_window = window;
        self
    }

    pub fn with_audit(mut self, audit: Arc<EventLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub async fn reconcile(&self, incoming: &ProviderEvent) -> FeedResult<ReconcileOutcome> {
        if is_placeholder_team(&incoming.home_team) || is_placeholder_team(&incoming.away_team) {
            return Err(FeedError::parse(
                incoming.provider,
                format!("placeholder teams on {}: {:?} v {:?}", incoming.provider_event_id, incoming.home_team, incoming.away_team),
            ));
        }
        let ext = incoming.external_id();
        let now = self.clock.now();

        if let Some(existing) = self.store.find_by_external_id(&ext).await? {
            return self.finish(existing, incoming, now, false).await;
        }

        if let Some(candidate) = self.fuzzy_candidate(incoming).await? {
            match self.store.link_external_id(candidate.id, &ext).await {
                Ok(()) => {
                    debug!(event_id = candidate.id, external_id = %ext, "fuzzy claim");
                    let mut claimed = candidate;
                    if !claimed.owns_external_id(&ext) {
                        claimed.linked_ids.push(ext.clone());
                    }
                    return self.finish(claimed, incoming, now, true).await;
                }
                Err(StoreError::Conflict { .. }) => return self.after_conflict(&ext, incoming, now).await,
                Err(e) => return Err(e.into()),
            }
        }

        let draft = self.draft(incoming, now).await?;
        match self.store.create_event(draft).await {
            Ok(event) => {
                info!(
                    event_id = event.id,
                    external_id = %ext,
                    status = event.status.as_str(),
                    "{} v {}",
                    event.home_team,
                    event.away_team
                );
                self.record_transition(&event, None, "created");
                Ok(ReconcileOutcome { event, created: true, linked: false, transition: None, settlement: None })
            }
            Err(StoreError::Conflict { .. }) => self.after_conflict(&ext, incoming, now).await,
            Err(e) => Err(e.into()),
        }
    }

    /// Ends a live event the provider stopped reporting. `None` if it was
    /// already terminal or is gone.
    pub async fn mark_ended(&self, event_id: i64, reason: &str) -> FeedResult<Option<ReconcileOutcome>> {
        let Some(mut event) = self.store.get_event(event_id).await? else {
            return Ok(None);
        };
        if event.status.is_terminal() {
            return Ok(None);
        }
        let from = event.status;
        event.status = EventStatus::Ended;
        event.is_live = false;
        event.updated_at = self.clock.now();
        self.store.update_event(&event).await?;
        let transition = Transition::between(from, EventStatus::Ended);
        let settlement = self.on_transition(&event, transition, reason).await;
        Ok(Some(ReconcileOutcome { event, created: false, linked: false, transition, settlement }))
    }

    async fn fuzzy_candidate(&self, incoming: &ProviderEvent) -> FeedResult<Option<Event>> {
        let from = incoming.start_time - self.fuzzy_window;
        let to = incoming.start_time + self.fuzzy_window;
        let candidates = self.store.find_fuzzy(&incoming.home_team, &incoming.away_team, from, to).await?;
        Ok(best_match(
            incoming.provider,
            &incoming.home_team,
            &incoming.away_team,
            incoming.start_time,
            self.fuzzy_window,
            &candidates,
        )
        .cloned())
    }

    async fn after_conflict(
        &self,
        ext: &str,
        incoming: &ProviderEvent,
        now: DateTime<Utc>,
    ) -> FeedResult<ReconcileOutcome> {
        debug!(external_id = ext, "lost create race, re-reading");
        match self.store.find_by_external_id(ext).await? {
            Some(winner) => self.finish(winner, incoming, now, false).await,
            None => Err(StoreError::Conflict { entity: "event", key: ext.to_string() }.into()),
        }
    }

    async fn draft(&self, incoming: &ProviderEvent, now: DateTime<Utc>) -> FeedResult<EventDraft> {
        let sport = self
            .store
            .upsert_sport(SportUpsert {
                slug: incoming.sport.slug.clone(),
                name: incoming.sport.name.clone(),
                icon: incoming.sport.icon.clone(),
                sort_order: incoming.sport.sort_order,
            })
            .await?;
        let competition = self
            .store
            .upsert_competition(CompetitionUpsert {
                sport_id: sport.id,
                slug: slugify(&incoming.competition.name),
                name: incoming.competition.name.clone(),
                country: incoming.competition.country.clone(),
                external_id: Some(external_id(incoming.provider, &incoming.competition.key)),
            })
            .await?;
        Ok(EventDraft {
            competition_id: competition.id,
            sport_slug: sport.slug,
            external_id: incoming.external_id(),
            home_team: incoming.home_team.clone(),
            away_team: incoming.away_team.clone(),
            home_logo: incoming.home_logo.clone(),
            away_logo: incoming.away_logo.clone(),
            status: initial_status(incoming.status, incoming.start_time, now),
            start_time: incoming.start_time,
            scores: incoming.scores,
            metadata: EventMetadata {
                timer: incoming.timer.clone(),
                elapsed_minutes: incoming.elapsed_minutes,
                period_scores: incoming.period_scores.clone(),
                pre_match_odds: None,
            },
        })
    }

    async fn finish(
        &self,
        mut event: Event,
        incoming: &ProviderEvent,
        now: DateTime<Utc>,
        linked: bool,
    ) -> FeedResult<ReconcileOutcome> {
        let from = event.status;
        merge(&mut event, incoming, now);
        self.store.update_event(&event).await?;
        let transition = Transition::between(from, event.status);
        let reason = format!("{} reported {}", incoming.provider, incoming.raw_status);
        let settlement = self.on_transition(&event, transition, &reason).await;
        Ok(ReconcileOutcome { event, created: false, linked, transition, settlement })
    }

    async fn on_transition(
        &self,
        event: &Event,
        transition: Option<Transition>,
        reason: &str,
    ) -> Option<SettlementOutcome> {
        let transition = transition?;
        info!(
            event_id = event.id,
            from = transition.from.as_str(),
            to = transition.to.as_str(),
            reason,
            "status change"
        );
        self.publisher.publish(
            &format!("event:{}", event.id),
            "status",
            json!({
                "eventId": event.id,
                "from": transition.from.as_str(),
                "to": transition.to.as_str(),
                "isLive": event.is_live,
                "scores": event.scores,
            }),
        );
        self.record_transition(event, Some(transition.from), reason);
        if !transition.is_end() {
            return None;
        }
        match self.settlement.settle_event(event, event.scores, SettleSource::Primary).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                warn!(event_id = event.id, "settlement failed, left for the stale sweep: {e}");
                None
            }
        }
    }

    fn record_transition(&self, event: &Event, from: Option<EventStatus>, reason: &str) {
        if let Some(audit) = &self.audit {
            audit.log_quiet(&StatusTransitionEvent {
                ts: now_iso(),
                event: "STATUS_TRANSITION",
                event_id: event.id,
                external_id: event.external_id.clone(),
                from: from.map(|s| s.as_str().to_string()),
                to: event.status.as_str().to_string(),
                reason: reason.to_string(),
            });
        }
    }
}

/// Applies a provider report to a stored event.
///
/// Names and start time only come from the provider that created the event;
/// any owning provider may move status, scores and the clock.
pub fn merge(event: &mut Event, incoming: &ProviderEvent, now: DateTime<Utc>) {
    if event.external_id == incoming.external_id() {
        event.home_team = incoming.home_team.clone();
        event.away_team = incoming.away_team.clone();
        event.start_time = incoming.start_time;
    }
    if event.home_logo.is_none() {
        event.home_logo = incoming.home_logo.clone();
    }
    if event.away_logo.is_none() {
        event.away_logo = incoming.away_logo.clone();
    }

    event.status = next_status(event.status, incoming.status, event.start_time, now);
    event.is_live = event.status == EventStatus::Live;
    if incoming.scores.is_some() {
        event.scores = incoming.scores;
    }
    if incoming.timer.is_some() {
        event.metadata.timer = incoming.timer.clone();
    }
    if incoming.elapsed_minutes.is_some() {
        event.metadata.elapsed_minutes = incoming.elapsed_minutes;
    }
    for (period, score) in &incoming.period_scores {
        event.metadata.period_scores.insert(period.clone(), *score);
    }
    event.updated_at = now;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use feed_model::memory::{MemoryJobQueue, MemoryStore, RecordingPublisher};
    use feed_model::{ManualClock, Scores};
    use providers::vocab::sport_ref;
    use providers::CompetitionRef;
    use std::collections::BTreeMap;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap()
    }

    pub(crate) fn provider_event(
        provider: &'static str,
        id: &str,
        home: &str,
        away: &str,
        start: DateTime<Utc>,
        status: EventStatus,
    ) -> ProviderEvent {
        ProviderEvent {
            provider,
            provider_event_id: id.into(),
            sport: sport_ref("football"),
            competition: CompetitionRef { key: "epl".into(), name: "Premier League".into(), country: Some("England".into()) },
            home_team: home.into(),
            away_team: away.into(),
            home_logo: None,
            away_logo: None,
            start_time: start,
            status,
            raw_status: status.as_str().to_lowercase(),
            scores: None,
            timer: None,
            elapsed_minutes: None,
            period_scores: BTreeMap::new(),
            markets: vec![],
        }
    }

    struct Harness {
        clock: ManualClock,
        store: Arc<MemoryStore>,
        jobs: Arc<MemoryJobQueue>,
        publisher: Arc<RecordingPublisher>,
        reconciler: Reconciler,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(t0() - Duration::hours(1));
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::with_clock(shared.clone()));
        let jobs = Arc::new(MemoryJobQueue::new(shared.clone(), Duration::minutes(10)));
        let publisher = Arc::new(RecordingPublisher::new());
        let settlement =
            Arc::new(SettlementEngine::new(store.clone(), jobs.clone(), publisher.clone(), shared.clone()).with_seed(3));
        let reconciler = Reconciler::new(store.clone(), publisher.clone(), shared, settlement);
        Harness { clock, store, jobs, publisher, reconciler }
    }

    #[tokio::test]
    async fn test_create_then_update_in_place() {
        let h = harness();
        let first = h
            .reconciler
            .reconcile(&provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        assert!(first.created);
        assert_eq!(first.event.external_id, "betsapi:1");
        assert_eq!(h.store.competitions().await[0].external_id.as_deref(), Some("betsapi:epl"));

        let mut live = provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Live);
        live.scores = Some(Scores::new(1, 0));
        live.timer = Some("12:00".into());
        let second = h.reconciler.reconcile(&live).await.unwrap();
        assert!(!second.created);
        assert_eq!(second.event.id, first.event.id);
        assert_eq!(second.transition.map(|t| t.to), Some(EventStatus::Live));
        assert!(second.event.is_live);
        assert_eq!(second.event.metadata.timer.as_deref(), Some("12:00"));
        assert_eq!(h.publisher.named("status").len(), 1);

        // a stale pre-match report does not undo LIVE
        let back = h
            .reconciler
            .reconcile(&provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        assert_eq!(back.event.status, EventStatus::Live);
        assert_eq!(back.event.scores, Some(Scores::new(1, 0)));
        assert!(back.transition.is_none());
    }

    #[tokio::test]
    async fn test_two_providers_one_event() {
        let h = harness();
        let a = h
            .reconciler
            .reconcile(&provider_event("betsapi", "1", "Wolverhampton Wanderers", "Chelsea FC", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        let b = h
            .reconciler
            .reconcile(&provider_event(
                "pinnacle",
                "900",
                "Wolverhampton",
                "Chelsea",
                t0() + Duration::minutes(30),
                EventStatus::Upcoming,
            ))
            .await
            .unwrap();
        assert!(b.linked);
        assert_eq!(a.event.id, b.event.id);
        assert_eq!(h.store.all_events().await.len(), 1);
        // the creating provider keeps names and start time
        assert_eq!(b.event.home_team, "Wolverhampton Wanderers");
        assert_eq!(b.event.start_time, t0());

        let again = h
            .reconciler
            .reconcile(&provider_event("pinnacle", "900", "Wolverhampton", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        assert_eq!(again.event.id, a.event.id);
        assert!(!again.linked);
    }

    #[tokio::test]
    async fn test_outside_window_creates_a_second_event() {
        let h = harness();
        h.reconciler
            .reconcile(&provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        let other = h
            .reconciler
            .reconcile(&provider_event("oddsapi", "x", "Arsenal", "Chelsea", t0() + Duration::hours(3), EventStatus::Upcoming))
            .await
            .unwrap();
        assert!(other.created);
        assert_eq!(h.store.all_events().await.len(), 2);
    }

    #[tokio::test]
    async fn test_placeholder_teams_rejected() {
        let h = harness();
        let err = h
            .reconciler
            .reconcile(&provider_event("betsapi", "1", "TBD", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "parse");
        assert!(h.store.all_events().await.is_empty());
    }

    #[tokio::test]
    async fn test_end_settles_exactly_once() {
        let h = harness();
        h.clock.set(t0() + Duration::minutes(100));
        let mut live = provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Live);
        live.scores = Some(Scores::new(2, 1));
        h.reconciler.reconcile(&live).await.unwrap();

        let mut ended = live.clone();
        ended.status = EventStatus::Ended;
        let out = h.reconciler.reconcile(&ended).await.unwrap();
        assert!(out.transition.unwrap().is_end());
        assert!(!out.event.is_live);
        assert!(out.settlement.unwrap().job_enqueued);

        let repeat = h.reconciler.reconcile(&ended).await.unwrap();
        assert!(repeat.transition.is_none());
        assert!(repeat.settlement.is_none());
        assert!(h.reconciler.mark_ended(out.event.id, "missing").await.unwrap().is_none());
        assert_eq!(h.jobs.jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_time_fallback_and_created_terminal() {
        let h = harness();
        h.clock.set(t0() + Duration::minutes(5));
        let created = h
            .reconciler
            .reconcile(&provider_event("betsapi", "1", "Arsenal", "Chelsea", t0(), EventStatus::Upcoming))
            .await
            .unwrap();
        assert_eq!(created.event.status, EventStatus::Live);

        let finished = h
            .reconciler
            .reconcile(&provider_event("betsapi", "2", "Leeds", "Everton", t0(), EventStatus::Ended))
            .await
            .unwrap();
        assert_eq!(finished.event.status, EventStatus::Ended);
        assert!(h.jobs.jobs().is_empty());
    }
}
