//! Settlement: final score → selection results → SETTLED markets → one
//! `auto-settle-event` job per event.
//!
//! Settled selections and markets are immutable in the store, so running this
//! twice for the same event (primary path then a stale sweep) settles nothing
//! the second time.

use feed_model::{
    Clock, Event, EventStatus, FeedError, FeedResult, JobQueue, Market, MarketStatus, MarketType, Publisher, Scores,
    Selection, SelectionStatus, Store, AUTO_SETTLE_EVENT,
};
use logger::{now_iso, EventLogger, SettlementEvent};
use rand::rngs::StdRng;
use rand::SeedableRng;
use regex::Regex;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tracing::{info, warn};

use crate::synthetic::synthetic_score;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreOrigin {
    /// Already stored on the event.
    Known,
    /// Passed in by the caller.
    Supplied,
    Synthetic,
}

impl ScoreOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            ScoreOrigin::Known => "known",
            ScoreOrigin::Supplied => "supplied",
            ScoreOrigin::Synthetic => "synthetic",
        }
    }
}

/// Which path ended the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleSource {
    Primary,
    StaleSweep,
    StaleLive,
}

impl SettleSource {
    pub fn as_str(self) -> &'static str {
        match self {
            SettleSource::Primary => "primary",
            SettleSource::StaleSweep => "stale-sweep",
            SettleSource::StaleLive => "stale-live",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettlementOutcome {
    pub event_id: i64,
    pub scores: Scores,
    pub origin: ScoreOrigin,
    pub markets_settled: usize,
    /// Markets left OPEN: unknown type, missing period score, store failure.
    pub markets_skipped: usize,
    pub job_enqueued: bool,
}

pub fn job_key(event_id: i64) -> String {
    format!("{AUTO_SETTLE_EVENT}:{event_id}")
}

// ── Pure resolution ──────────────────────────────────────────────────────────

fn total_key_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"OU([+-]?\d+(?:\.\d+)?)").ok()).as_ref()
}

fn number_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[+-]?\d+(?:\.\d+)?").ok()).as_ref()
}

/// Total line from the market key, else the last number in the display name,
/// else the stored line.
pub fn total_line(market: &Market) -> Option<f64> {
    let from_key = total_key_re()
        .and_then(|re| re.captures(&market.market_key))
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok());
    let from_name = || {
        number_re()
            .and_then(|re| re.find_iter(&market.name).last())
            .and_then(|m| m.as_str().parse().ok())
    };
    from_key.or_else(from_name).or(market.line)
}

fn handicap_of(selection: &Selection, market: &Market) -> Option<f64> {
    if let Some(h) = selection.handicap {
        return Some(h);
    }
    if let Some(h) = selection.params.strip_prefix("hdp=").and_then(|v| v.parse().ok()) {
        return Some(h);
    }
    // the market line is quoted from the home side
    match selection.outcome.as_str() {
        "HOME" => market.line,
        "AWAY" => market.line.map(|l| -l),
        _ => None,
    }
}

fn compare(a: f64, b: f64) -> SelectionStatus {
    if a > b {
        SelectionStatus::Won
    } else if a < b {
        SelectionStatus::Lost
    } else {
        SelectionStatus::Void
    }
}

fn unresolvable(market: &Market, message: impl Into<String>) -> FeedError {
    FeedError::Settlement { event_id: market.event_id, message: format!("{}: {}", market.market_key, message.into()) }
}

/// Result for every selection of `market` under `final_score`.
///
/// Period markets use `period_scores`; an unknown period score or an
/// unsupported market type is an error and the market must stay OPEN.
pub fn resolve_market(
    market: &Market,
    selections: &[Selection],
    final_score: Scores,
    period_scores: &BTreeMap<String, Scores>,
) -> FeedResult<Vec<(i64, SelectionStatus)>> {
    let score = match &market.period {
        Some(p) => *period_scores.get(p).ok_or_else(|| unresolvable(market, format!("no score for period {p}")))?,
        None => final_score,
    };
    let (home, away) = (f64::from(score.home), f64::from(score.away));

    match market.market_type {
        MarketType::Moneyline => {
            let has_draw = selections.iter().any(|s| s.outcome == "DRAW");
            let winner = if home > away {
                "HOME"
            } else if away > home {
                "AWAY"
            } else if has_draw {
                "DRAW"
            } else {
                return Ok(selections.iter().map(|s| (s.id, SelectionStatus::Void)).collect());
            };
            selections
                .iter()
                .map(|s| match s.outcome.as_str() {
                    "HOME" | "AWAY" | "DRAW" if s.outcome == winner => Ok((s.id, SelectionStatus::Won)),
                    "HOME" | "AWAY" | "DRAW" => Ok((s.id, SelectionStatus::Lost)),
                    other => Err(unresolvable(market, format!("outcome {other}"))),
                })
                .collect()
        }
        MarketType::Total => {
            let line = total_line(market).ok_or_else(|| unresolvable(market, "no line"))?;
            let total = home + away;
            selections
                .iter()
                .map(|s| match s.outcome.as_str() {
                    "OVER" => Ok((s.id, compare(total, line))),
                    "UNDER" => Ok((s.id, compare(line, total))),
                    other => Err(unresolvable(market, format!("outcome {other}"))),
                })
                .collect()
        }
        MarketType::Spread => selections
            .iter()
            .map(|s| {
                let h = handicap_of(s, market).ok_or_else(|| unresolvable(market, "no handicap"))?;
                match s.outcome.as_str() {
                    "HOME" => Ok((s.id, compare(home + h, away))),
                    "AWAY" => Ok((s.id, compare(away + h, home))),
                    other => Err(unresolvable(market, format!("outcome {other}"))),
                }
            })
            .collect(),
        MarketType::Outright | MarketType::Prop => {
            Err(FeedError::UnknownMarketType { market_key: market.market_key.clone() })
        }
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct SettlementEngine {
    store: Arc<dyn Store>,
    jobs: Arc<dyn JobQueue>,
    publisher: Arc<dyn Publisher>,
    clock: Arc<dyn Clock>,
    audit: Option<Arc<EventLogger>>,
    rng: Mutex<StdRng>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn Store>,
        jobs: Arc<dyn JobQueue>,
        publisher: Arc<dyn Publisher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { store, jobs, publisher, clock, audit: None, rng: Mutex::new(StdRng::from_entropy()) }
    }

    pub fn with_audit(mut self, audit: Arc<EventLogger>) -> Self {
        self.audit = Some(audit);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    /// Settles every open market of an ENDED event and enqueues the payout job.
    ///
    /// Per-market failures leave that market OPEN and are counted, not returned.
    pub async fn settle_event(
        &self,
        event: &Event,
        supplied: Option<Scores>,
        source: SettleSource,
    ) -> FeedResult<SettlementOutcome> {
        // the caller's copy may predate the ENDED write (stale sweep)
        let mut current = self.store.get_event(event.id).await?.unwrap_or_else(|| event.clone());
        if current.status != EventStatus::Ended {
            return Err(FeedError::Settlement {
                event_id: event.id,
                message: format!("event is {}", current.status.as_str()),
            });
        }

        let (scores, origin) = match (current.scores, supplied) {
            (Some(s), _) => (s, ScoreOrigin::Known),
            (None, Some(s)) => (s, ScoreOrigin::Supplied),
            (None, None) => {
                let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
                (synthetic_score(&current.sport_slug, &mut *rng), ScoreOrigin::Synthetic)
            }
        };
        if origin != ScoreOrigin::Known {
            current.scores = Some(scores);
            current.updated_at = self.clock.now();
            self.store
                .update_event(&current)
                .await
                .map_err(|e| FeedError::Settlement { event_id: current.id, message: e.to_string() })?;
        }

        let (markets_settled, markets_skipped) = self.settle_markets(&current, scores).await?;

        self.publisher.publish(
            &format!("sport:{}", current.sport_slug),
            "event-ended",
            json!({
                "eventId": current.id,
                "homeTeam": current.home_team,
                "awayTeam": current.away_team,
                "homeScore": scores.home,
                "awayScore": scores.away,
            }),
        );

        let payload = json!({
            "eventId": current.id,
            "homeScore": scores.home,
            "awayScore": scores.away,
            "source": source.as_str(),
            "scoreOrigin": origin.as_str(),
        });
        let job_enqueued = match self.jobs.enqueue(AUTO_SETTLE_EVENT, payload, &job_key(current.id)).await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(event_id = current.id, "settlement job enqueue failed: {e}");
                false
            }
        };

        info!(
            event_id = current.id,
            source = source.as_str(),
            score = %scores,
            origin = origin.as_str(),
            markets_settled,
            markets_skipped,
            job_enqueued,
            "event settled"
        );
        if let Some(audit) = &self.audit {
            audit.log_quiet(&SettlementEvent {
                ts: now_iso(),
                event: "SETTLEMENT",
                event_id: current.id,
                source: source.as_str().to_string(),
                home_score: scores.home,
                away_score: scores.away,
                score_origin: origin.as_str().to_string(),
                markets_settled,
                markets_skipped,
                job_enqueued,
            });
        }

        Ok(SettlementOutcome { event_id: current.id, scores, origin, markets_settled, markets_skipped, job_enqueued })
    }

    async fn settle_markets(&self, event: &Event, scores: Scores) -> FeedResult<(usize, usize)> {
        let markets = self.store.list_markets(event.id).await?;
        let (mut settled, mut skipped) = (0, 0);
        for market in markets.iter().filter(|m| m.status != MarketStatus::Settled) {
            match self.settle_market(event, market, scores).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e @ FeedError::UnknownMarketType { .. }) => {
                    warn!(event_id = event.id, market_id = market.id, "left open: {e}");
                    skipped += 1;
                }
                Err(e) => {
                    warn!(event_id = event.id, market_id = market.id, kind = e.kind(), "left open: {e}");
                    skipped += 1;
                }
            }
        }
        Ok((settled, skipped))
    }

    /// Selections first, then the market compare-and-set. Returns false when
    /// another path settled the market in between.
    async fn settle_market(&self, event: &Event, market: &Market, scores: Scores) -> FeedResult<bool> {
        let selections = self.store.list_selections(market.id).await?;
        let results = resolve_market(market, &selections, scores, &event.metadata.period_scores)?;
        for (selection_id, status) in results {
            self.store.set_selection_status(selection_id, status).await?;
        }
        Ok(self.store.settle_market(market.id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use feed_model::memory::{MemoryJobQueue, MemoryStore, RecordingPublisher};
    use feed_model::{EventDraft, EventMetadata, ManualClock, MarketUpsert, SelectionUpsert};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 21, 0, 0).unwrap()
    }

    fn market(market_type: MarketType, key: &str, period: Option<&str>, line: Option<f64>) -> Market {
        Market {
            id: 1,
            event_id: 9,
            market_key: key.into(),
            name: key.into(),
            market_type,
            status: MarketStatus::Open,
            period: period.map(str::to_string),
            line,
            updated_at: t0(),
        }
    }

    fn sel(id: i64, outcome: &str, handicap: Option<f64>) -> Selection {
        Selection {
            id,
            market_id: 1,
            outcome: outcome.into(),
            name: outcome.into(),
            params: String::new(),
            odds: 1.9,
            probability: None,
            handicap,
            status: SelectionStatus::Active,
            updated_at: t0(),
        }
    }

    fn resolve(m: &Market, sels: &[Selection], home: i32, away: i32) -> Vec<SelectionStatus> {
        resolve_market(m, sels, Scores::new(home, away), &BTreeMap::new())
            .unwrap()
            .into_iter()
            .map(|(_, s)| s)
            .collect()
    }

    use SelectionStatus::{Lost, Void, Won};

    #[test]
    fn test_moneyline_rules() {
        let ml = market(MarketType::Moneyline, "ML", None, None);
        let three = [sel(1, "HOME", None), sel(2, "DRAW", None), sel(3, "AWAY", None)];
        let two = [sel(1, "HOME", None), sel(3, "AWAY", None)];
        assert_eq!(resolve(&ml, &three, 2, 1), [Won, Lost, Lost]);
        assert_eq!(resolve(&ml, &three, 1, 1), [Lost, Won, Lost]);
        assert_eq!(resolve(&ml, &two, 1, 1), [Void, Void]);
        assert_eq!(resolve(&ml, &two, 0, 3), [Lost, Won]);
    }

    #[test]
    fn test_total_rules() {
        let sels = [sel(1, "OVER", None), sel(2, "UNDER", None)];
        let ou25 = market(MarketType::Total, "OU2.5", None, None);
        assert_eq!(resolve(&ou25, &sels, 2, 1), [Won, Lost]);
        assert_eq!(resolve(&ou25, &sels, 1, 1), [Lost, Won]);
        let ou2 = market(MarketType::Total, "OU2", None, None);
        assert_eq!(resolve(&ou2, &sels, 1, 1), [Void, Void]);

        let mut by_name = market(MarketType::Total, "PROP:goals", None, None);
        by_name.name = "Total Goals 3.5".into();
        assert_eq!(total_line(&by_name), Some(3.5));
        by_name.name = "Goals".into();
        by_name.line = Some(1.5);
        assert_eq!(total_line(&by_name), Some(1.5));
    }

    #[test]
    fn test_spread_rules() {
        let sp = market(MarketType::Spread, "SPREAD-0.5", None, Some(-0.5));
        let sels = [sel(1, "HOME", Some(-0.5)), sel(2, "AWAY", Some(0.5))];
        assert_eq!(resolve(&sp, &sels, 1, 1), [Lost, Won]);
        assert_eq!(resolve(&sp, &sels, 2, 1), [Won, Lost]);

        // handicap falls back to the market line
        let sp1 = market(MarketType::Spread, "SPREAD-1", None, Some(-1.0));
        let bare = [sel(1, "HOME", None), sel(2, "AWAY", None)];
        assert_eq!(resolve(&sp1, &bare, 2, 1), [Void, Void]);
    }

    #[test]
    fn test_period_market_needs_period_score() {
        let h1 = market(MarketType::Moneyline, "ML:H1", Some("H1"), None);
        let sels = [sel(1, "HOME", None), sel(2, "DRAW", None), sel(3, "AWAY", None)];
        let err = resolve_market(&h1, &sels, Scores::new(2, 1), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, FeedError::Settlement { event_id: 9, .. }));

        let periods = BTreeMap::from([("H1".to_string(), Scores::new(0, 0))]);
        let got = resolve_market(&h1, &sels, Scores::new(2, 1), &periods).unwrap();
        assert_eq!(got, vec![(1, Lost), (2, Won), (3, Lost)]);
    }

    #[test]
    fn test_props_are_never_guessed() {
        let prop = market(MarketType::Prop, "PROP:correct-score", None, None);
        let err = resolve_market(&prop, &[sel(1, "1-0", None)], Scores::new(1, 0), &BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), "unknown_market_type");
    }

    struct Harness {
        store: Arc<MemoryStore>,
        jobs: Arc<MemoryJobQueue>,
        publisher: Arc<RecordingPublisher>,
        engine: SettlementEngine,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let jobs = Arc::new(MemoryJobQueue::new(clock.clone(), Duration::minutes(10)));
        let publisher = Arc::new(RecordingPublisher::new());
        let engine = SettlementEngine::new(store.clone(), jobs.clone(), publisher.clone(), clock).with_seed(1);
        Harness { store, jobs, publisher, engine }
    }

    async fn ended_event(store: &MemoryStore, scores: Option<Scores>) -> Event {
        store
            .create_event(EventDraft {
                competition_id: 1,
                sport_slug: "football".into(),
                external_id: "betsapi:55".into(),
                home_team: "Arsenal".into(),
                away_team: "Chelsea".into(),
                home_logo: None,
                away_logo: None,
                status: EventStatus::Ended,
                start_time: t0() - Duration::hours(2),
                scores,
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap()
    }

    async fn add_market(store: &MemoryStore, event_id: i64, key: &str, t: MarketType, outcomes: &[&str]) -> i64 {
        let m = store
            .upsert_market(MarketUpsert {
                event_id,
                market_key: key.into(),
                name: key.into(),
                market_type: t,
                period: None,
                line: None,
            })
            .await
            .unwrap();
        for o in outcomes {
            store
                .upsert_selection(SelectionUpsert {
                    market_id: m.id,
                    outcome: o.to_string(),
                    name: o.to_string(),
                    params: String::new(),
                    odds: 2.0,
                    probability: None,
                    handicap: None,
                })
                .await
                .unwrap();
        }
        m.id
    }

    #[tokio::test]
    async fn test_settle_event_once() {
        let h = harness();
        let ev = ended_event(&h.store, Some(Scores::new(2, 1))).await;
        let ml = add_market(&h.store, ev.id, "ML", MarketType::Moneyline, &["HOME", "DRAW", "AWAY"]).await;
        add_market(&h.store, ev.id, "OU2.5", MarketType::Total, &["OVER", "UNDER"]).await;
        let prop = add_market(&h.store, ev.id, "PROP:first-scorer", MarketType::Prop, &["Saka"]).await;

        let first = h.engine.settle_event(&ev, None, SettleSource::Primary).await.unwrap();
        assert_eq!(first.origin, ScoreOrigin::Known);
        assert_eq!((first.markets_settled, first.markets_skipped), (2, 1));
        assert!(first.job_enqueued);

        let statuses: Vec<_> =
            h.store.list_selections(ml).await.unwrap().into_iter().map(|s| (s.outcome, s.status)).collect();
        assert_eq!(statuses, vec![("HOME".to_string(), Won), ("DRAW".to_string(), Lost), ("AWAY".to_string(), Lost)]);
        let markets = h.store.list_markets(ev.id).await.unwrap();
        assert_eq!(markets.iter().find(|m| m.id == prop).unwrap().status, MarketStatus::Open);

        let second = h.engine.settle_event(&ev, None, SettleSource::StaleSweep).await.unwrap();
        assert_eq!(second.markets_settled, 0);
        assert!(!second.job_enqueued);

        let jobs = h.jobs.jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].idempotency_key, format!("auto-settle-event:{}", ev.id));
        assert_eq!(jobs[0].payload["homeScore"], 2);
        assert_eq!(jobs[0].payload["source"], "primary");
        assert_eq!(h.publisher.named("event-ended")[0].channel, "sport:football");
    }

    #[tokio::test]
    async fn test_missing_score_is_supplied_or_synthesised_and_persisted() {
        let h = harness();
        let ev = ended_event(&h.store, None).await;
        let out = h.engine.settle_event(&ev, Some(Scores::new(0, 2)), SettleSource::Primary).await.unwrap();
        assert_eq!((out.origin, out.scores), (ScoreOrigin::Supplied, Scores::new(0, 2)));
        let stored = h.store.get_event(ev.id).await.unwrap().unwrap();
        assert_eq!(stored.scores, Some(Scores::new(0, 2)));

        let h = harness();
        let ev = ended_event(&h.store, None).await;
        let out = h.engine.settle_event(&ev, None, SettleSource::StaleSweep).await.unwrap();
        assert_eq!(out.origin, ScoreOrigin::Synthetic);
        assert!((0..=3).contains(&out.scores.home) && (0..=3).contains(&out.scores.away));
        assert_eq!(h.store.get_event(ev.id).await.unwrap().unwrap().scores, Some(out.scores));
        assert_eq!(h.jobs.jobs()[0].payload["scoreOrigin"], "synthetic");
    }

    #[tokio::test]
    async fn test_refuses_events_that_are_not_ended() {
        let h = harness();
        let mut ev = ended_event(&h.store, None).await;
        ev.status = EventStatus::Live;
        h.store.update_event(&ev).await.unwrap();
        let err = h.engine.settle_event(&ev, None, SettleSource::Primary).await.unwrap_err();
        assert_eq!(err.kind(), "settlement");
        assert!(h.jobs.jobs().is_empty());
    }
}
