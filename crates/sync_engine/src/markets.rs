//! Canonical market vocabulary and the odds synchronizer.
//!
//! Raw market keys differ per feed (`1_3`, `totals`, `basketball_spreads`,
//! `Goals Over/Under First Half`), so classification runs keyword rules over
//! the key and display name after stripping sport prefixes. Adapter tables
//! win when they already know the type.

use chrono::{DateTime, Utc};
use feed_model::{
    Event, FeedResult, MarketStatus, MarketType, MarketUpsert, PreMatchOdds, Publisher, SelectionUpsert, Store,
};
use providers::{ProviderMarket, ProviderSelection};
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

// ── Vocabulary ───────────────────────────────────────────────────────────────

struct Rules {
    sport_prefix: Option<Regex>,
    kinds: Vec<(Regex, MarketType)>,
    periods: Vec<(Regex, &'static str)>,
}

fn rules() -> &'static Rules {
    static RULES: OnceLock<Rules> = OnceLock::new();
    RULES.get_or_init(|| {
        let re = |p: &str| Regex::new(p).map_err(|e| warn!("market rule `{p}` rejected: {e}")).ok();
        Rules {
            sport_prefix: re(
                r"^(?:\d+|soccer|football|basketball|icehockey|hockey|tennis|baseball|americanfootball|volleyball|handball)[_:\-]",
            ),
            // order matters: first hit wins
            kinds: vec![
                (re(r"outright|futures|tournament[_ ]winner|to win (?:the )?(?:league|cup|tournament)"), MarketType::Outright),
                (re(r"handicap|spread|\bhdp\b|\bah\b|asian"), MarketType::Spread),
                (re(r"total|over[_/ ]?under|\bo/u\b|\bou\b|goal[_ ]?line|totals"), MarketType::Total),
                (re(r"moneyline|money[_ ]line|\bh2h\b|1x2|match[_ ]winner|\bwinner\b|result|\bml\b|[23][_ ]?way"), MarketType::Moneyline),
            ]
            .into_iter()
            .filter_map(|(re, t)| Some((re?, t)))
            .collect(),
            periods: vec![
                (re(r"(?:^|[_ ])h1\b|1st[_ ]half|first[_ ]half|half[_ ]time"), "H1"),
                (re(r"(?:^|[_ ])h2\b|2nd[_ ]half|second[_ ]half"), "H2"),
                (re(r"(?:^|[_ ])q1\b|1st[_ ]quarter"), "Q1"),
                (re(r"(?:^|[_ ])q2\b|2nd[_ ]quarter"), "Q2"),
                (re(r"(?:^|[_ ])q3\b|3rd[_ ]quarter"), "Q3"),
                (re(r"(?:^|[_ ])q4\b|4th[_ ]quarter"), "Q4"),
                (re(r"(?:^|[_ ])p1\b|1st[_ ]period"), "P1"),
                (re(r"(?:^|[_ ])p2\b|2nd[_ ]period"), "P2"),
                (re(r"(?:^|[_ ])p3\b|3rd[_ ]period"), "P3"),
            ]
            .into_iter()
            .filter_map(|(re, code)| Some((re?, code)))
            .collect(),
        }
    })
}

/// Canonical identity of a market on an event.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSpec {
    pub market_key: String,
    pub name: String,
    pub market_type: MarketType,
    pub period: Option<String>,
    pub line: Option<f64>,
}

fn haystack(raw: &ProviderMarket) -> String {
    let r = rules();
    let key = raw.raw_key.to_lowercase();
    let key = match &r.sport_prefix {
        Some(prefix) => prefix.replace(&key, "").into_owned(),
        None => key,
    };
    match &raw.name {
        Some(name) => format!("{key} {}", name.to_lowercase()),
        None => key,
    }
}

pub fn classify_type(raw: &ProviderMarket) -> MarketType {
    if let Some(t) = raw.market_type {
        return t;
    }
    let text = haystack(raw);
    rules()
        .kinds
        .iter()
        .find(|(re, _)| re.is_match(&text))
        .map(|(_, t)| *t)
        .unwrap_or(MarketType::Prop)
}

pub fn classify_period(raw: &ProviderMarket) -> Option<String> {
    if let Some(p) = &raw.period {
        return Some(p.clone());
    }
    let text = haystack(raw);
    rules().periods.iter().find(|(re, _)| re.is_match(&text)).map(|(_, code)| code.to_string())
}

fn fmt_line(line: f64) -> String {
    format!("{line}")
}

fn period_label(period: &str) -> &'static str {
    match period {
        "H1" => "1st Half",
        "H2" => "2nd Half",
        "Q1" => "1st Quarter",
        "Q2" => "2nd Quarter",
        "Q3" => "3rd Quarter",
        "Q4" => "4th Quarter",
        "P1" => "1st Period",
        "P2" => "2nd Period",
        "P3" => "3rd Period",
        _ => "Period",
    }
}

/// Key, name and type for a provider market.
///
/// Keys: `ML`, `SPREAD-0.5`, `OU2.5`, `OUTRIGHT`, `PROP:<slug>`; a period adds `:<code>`.
pub fn classify(raw: &ProviderMarket) -> MarketSpec {
    let market_type = classify_type(raw);
    let period = classify_period(raw);
    let line = raw.line.or_else(|| raw.selections.iter().find_map(|s| s.handicap));
    let (base_key, base_name) = match (market_type, line) {
        (MarketType::Moneyline, _) => ("ML".to_string(), "Match Result".to_string()),
        (MarketType::Total, Some(l)) => (format!("OU{}", fmt_line(l)), format!("Over/Under {}", fmt_line(l))),
        (MarketType::Spread, Some(l)) => (format!("SPREAD{l:+}"), format!("Handicap {l:+}")),
        (MarketType::Outright, _) => ("OUTRIGHT".to_string(), raw.name.clone().unwrap_or_else(|| "Outright".into())),
        _ => {
            let slug = feed_model::slugify(raw.name.as_deref().unwrap_or(&raw.raw_key));
            (format!("PROP:{slug}"), raw.name.clone().unwrap_or_else(|| raw.raw_key.clone()))
        }
    };
    // a total or spread without a line cannot be settled; keep it as a prop
    let market_type = match (market_type, line) {
        (MarketType::Total | MarketType::Spread, None) => MarketType::Prop,
        (t, _) => t,
    };
    match period {
        Some(p) => MarketSpec {
            market_key: format!("{base_key}:{p}"),
            name: format!("{base_name} ({})", period_label(&p)),
            market_type,
            period: Some(p),
            line,
        },
        None => MarketSpec { market_key: base_key, name: base_name, market_type, period: None, line },
    }
}

/// Normalised parameters separating same-outcome selections of one market.
pub fn selection_params(market_type: MarketType, sel: &ProviderSelection, line: Option<f64>) -> String {
    match market_type {
        MarketType::Spread => sel.handicap.map(|h| format!("hdp={h}")).unwrap_or_default(),
        MarketType::Total => line.map(|l| format!("line={l}")).unwrap_or_default(),
        _ => String::new(),
    }
}

/// Strictly greater than the threshold, compared on a micro-unit grid so that
/// a delta of exactly the threshold is not a change.
pub fn odds_changed(old: f64, new: f64, threshold: f64) -> bool {
    let delta = ((new - old).abs() * 1e6).round();
    delta > (threshold * 1e6).round()
}

// ── Synchronizer ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub markets: usize,
    pub selections: usize,
    pub changed: usize,
    pub skipped_settled: usize,
    pub failed: usize,
}

pub struct MarketSynchronizer {
    store: Arc<dyn Store>,
    publisher: Arc<dyn Publisher>,
    change_threshold: f64,
}

impl MarketSynchronizer {
    pub fn new(store: Arc<dyn Store>, publisher: Arc<dyn Publisher>, change_threshold: f64) -> Self {
        Self { store, publisher, change_threshold }
    }

    /// Upserts every market and selection of `markets` onto `event`. Failures
    /// are counted per entity; the rest of the batch proceeds.
    pub async fn sync_event(&self, event: &Event, markets: &[ProviderMarket]) -> SyncReport {
        let mut report = SyncReport::default();
        for raw in markets {
            if let Err(e) = self.sync_market(event, raw, &mut report).await {
                warn!(event_id = event.id, raw_key = %raw.raw_key, "market sync failed: {e}");
                report.failed += 1;
            }
        }
        report
    }

    async fn sync_market(&self, event: &Event, raw: &ProviderMarket, report: &mut SyncReport) -> FeedResult<()> {
        let spec = classify(raw);
        let market = self
            .store
            .upsert_market(MarketUpsert {
                event_id: event.id,
                market_key: spec.market_key.clone(),
                name: spec.name.clone(),
                market_type: spec.market_type,
                period: spec.period.clone(),
                line: spec.line,
            })
            .await?;
        report.markets += 1;
        if market.status == MarketStatus::Settled {
            report.skipped_settled += raw.selections.len();
            return Ok(());
        }

        for sel in &raw.selections {
            let params = selection_params(spec.market_type, sel, spec.line);
            let existing = match self.store.find_selection(market.id, &sel.outcome, &params).await {
                Ok(found) => found,
                Err(e) => {
                    warn!(market_id = market.id, outcome = %sel.outcome, "selection lookup failed: {e}");
                    report.failed += 1;
                    continue;
                }
            };
            if existing.as_ref().map_or(false, |s| s.status.is_settled()) {
                report.skipped_settled += 1;
                continue;
            }
            let upsert = SelectionUpsert {
                market_id: market.id,
                outcome: sel.outcome.clone(),
                name: sel.label.clone(),
                params: params.clone(),
                odds: sel.odds,
                probability: Some(1.0 / sel.odds),
                handicap: sel.handicap,
            };
            if let Err(e) = self.store.upsert_selection(upsert).await {
                warn!(market_id = market.id, outcome = %sel.outcome, "selection upsert failed: {e}");
                report.failed += 1;
                continue;
            }
            report.selections += 1;
            if let Some(old) = existing {
                if odds_changed(old.odds, sel.odds, self.change_threshold) {
                    report.changed += 1;
                    self.publisher.publish(
                        &format!("event:{}", event.id),
                        "odds",
                        json!({
                            "eventId": event.id,
                            "marketKey": spec.market_key,
                            "outcome": sel.outcome,
                            "params": params,
                            "old": old.odds,
                            "odds": sel.odds,
                        }),
                    );
                }
            }
        }
        Ok(())
    }

    /// Copies the current full-event moneyline prices into the event metadata.
    /// Returns false when there is nothing to copy or a snapshot already exists.
    pub async fn snapshot_pre_match(&self, event: &mut Event, now: DateTime<Utc>) -> FeedResult<bool> {
        if event.metadata.pre_match_odds.is_some() {
            return Ok(false);
        }
        let markets = self.store.list_markets(event.id).await?;
        let Some(ml) = markets.iter().find(|m| m.market_type == MarketType::Moneyline && m.period.is_none()) else {
            return Ok(false);
        };
        let selections = self.store.list_selections(ml.id).await?;
        let price = |outcome: &str| selections.iter().find(|s| s.outcome == outcome).map(|s| s.odds);
        let snapshot = PreMatchOdds { home: price("HOME"), draw: price("DRAW"), away: price("AWAY"), captured_at: now };
        if snapshot.home.is_none() && snapshot.away.is_none() {
            return Ok(false);
        }
        debug!(event_id = event.id, "pre-match odds captured");
        event.metadata.pre_match_odds = Some(snapshot);
        self.store.update_event(event).await?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use feed_model::memory::{MemoryStore, RecordingPublisher};
    use feed_model::{CompetitionUpsert, EventDraft, EventMetadata, EventStatus, SelectionStatus, SportUpsert};

    fn raw(key: &str, name: Option<&str>, line: Option<f64>, sels: &[(&str, f64, Option<f64>)]) -> ProviderMarket {
        ProviderMarket {
            raw_key: key.into(),
            name: name.map(str::to_string),
            market_type: None,
            period: None,
            line,
            selections: sels
                .iter()
                .map(|(o, odds, h)| ProviderSelection { label: o.to_string(), outcome: o.to_string(), odds: *odds, handicap: *h })
                .collect(),
        }
    }

    #[test]
    fn test_classify_by_keywords() {
        let m = classify(&raw("basketball_totals", None, Some(220.5), &[]));
        assert_eq!((m.market_key.as_str(), m.market_type), ("OU220.5", MarketType::Total));

        let m = classify(&raw("1_2", Some("Asian Handicap"), Some(-0.5), &[]));
        assert_eq!((m.market_key.as_str(), m.market_type), ("SPREAD-0.5", MarketType::Spread));

        let m = classify(&raw("13", Some("First Half Winner"), None, &[]));
        assert_eq!(m.market_key, "ML:H1");
        assert_eq!(m.name, "Match Result (1st Half)");
        assert_eq!(m.period.as_deref(), Some("H1"));

        let m = classify(&raw("soccer_h2h", None, None, &[]));
        assert_eq!(m.market_type, MarketType::Moneyline);

        let m = classify(&raw("outrights", Some("Premier League Winner"), None, &[]));
        assert_eq!(m.market_type, MarketType::Outright);

        let m = classify(&raw("45", Some("Correct Score"), None, &[]));
        assert_eq!((m.market_key.as_str(), m.market_type), ("PROP:correct-score", MarketType::Prop));

        // total with no line cannot settle
        let m = classify(&raw("totals", None, None, &[]));
        assert_eq!(m.market_type, MarketType::Prop);
    }

    #[test]
    fn test_adapter_hint_and_period_win() {
        let mut m = raw("1_8", Some("Half Time Result"), None, &[]);
        m.market_type = Some(MarketType::Moneyline);
        m.period = Some("H1".into());
        assert_eq!(classify(&m).market_key, "ML:H1");
        let m = raw("totals_h1", None, Some(1.5), &[]);
        assert_eq!(classify(&m).market_key, "OU1.5:H1");
    }

    #[test]
    fn test_odds_change_threshold() {
        assert!(!odds_changed(1.900, 1.901, 0.001));
        assert!(!odds_changed(2.0, 2.0, 0.001));
        assert!(odds_changed(1.900, 1.902, 0.001));
        assert!(odds_changed(1.9011, 1.9, 0.001));
        assert!(!odds_changed(1.85, 1.8505, 0.001));
    }

    async fn seeded_event(store: &MemoryStore) -> Event {
        let sport = store
            .upsert_sport(SportUpsert { slug: "football".into(), name: "Football".into(), icon: "x".into(), sort_order: 1 })
            .await
            .unwrap();
        let comp = store
            .upsert_competition(CompetitionUpsert {
                sport_id: sport.id,
                slug: "epl".into(),
                name: "EPL".into(),
                country: None,
                external_id: None,
            })
            .await
            .unwrap();
        store
            .create_event(EventDraft {
                competition_id: comp.id,
                sport_slug: "football".into(),
                external_id: "betsapi:1".into(),
                home_team: "Arsenal".into(),
                away_team: "Chelsea".into(),
                home_logo: None,
                away_logo: None,
                status: EventStatus::Upcoming,
                start_time: Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap(),
                scores: None,
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sync_publishes_only_real_changes() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let sync = MarketSynchronizer::new(store.clone(), publisher.clone(), 0.001);
        let event = seeded_event(&store).await;

        let ml = |home: f64| {
            let mut m = raw("h2h", None, None, &[("HOME", home, None), ("DRAW", 3.4, None), ("AWAY", 4.0, None)]);
            m.market_type = Some(MarketType::Moneyline);
            m
        };
        let first = sync.sync_event(&event, &[ml(1.90)]).await;
        assert_eq!((first.markets, first.selections, first.changed), (1, 3, 0));
        assert!(publisher.named("odds").is_empty());

        sync.sync_event(&event, &[ml(1.901)]).await;
        assert!(publisher.named("odds").is_empty());

        let third = sync.sync_event(&event, &[ml(1.95)]).await;
        assert_eq!(third.changed, 1);
        let msgs = publisher.named("odds");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].channel, format!("event:{}", event.id));
        assert_eq!(msgs[0].payload["outcome"], "HOME");
        assert_eq!(store.count_markets(event.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_settled_selection_is_never_touched() {
        let store = Arc::new(MemoryStore::new());
        let sync = MarketSynchronizer::new(store.clone(), Arc::new(RecordingPublisher::new()), 0.001);
        let event = seeded_event(&store).await;
        let total = raw("totals", None, Some(2.5), &[("OVER", 1.9, None), ("UNDER", 1.9, None)]);
        sync.sync_event(&event, &[total]).await;

        let market = store.list_markets(event.id).await.unwrap().remove(0);
        let over = store.find_selection(market.id, "OVER", "line=2.5").await.unwrap().unwrap();
        assert!(store.set_selection_status(over.id, SelectionStatus::Won).await.unwrap());

        let moved = raw("totals", None, Some(2.5), &[("OVER", 1.5, None), ("UNDER", 2.6, None)]);
        let report = sync.sync_event(&event, &[moved]).await;
        assert_eq!(report.skipped_settled, 1);
        let over = store.find_selection(market.id, "OVER", "line=2.5").await.unwrap().unwrap();
        assert_eq!(over.status, SelectionStatus::Won);
        assert_eq!(over.odds, 1.9);
    }

    #[tokio::test]
    async fn test_pre_match_snapshot_taken_once() {
        let store = Arc::new(MemoryStore::new());
        let sync = MarketSynchronizer::new(store.clone(), Arc::new(RecordingPublisher::new()), 0.001);
        let mut event = seeded_event(&store).await;
        let now = Utc.with_ymd_and_hms(2026, 6, 1, 19, 0, 0).unwrap();
        assert!(!sync.snapshot_pre_match(&mut event, now).await.unwrap());

        let mut ml = raw("h2h", None, None, &[("HOME", 2.1, None), ("AWAY", 3.3, None)]);
        ml.market_type = Some(MarketType::Moneyline);
        sync.sync_event(&event, &[ml]).await;
        assert!(sync.snapshot_pre_match(&mut event, now).await.unwrap());
        assert!(!sync.snapshot_pre_match(&mut event, now).await.unwrap());

        let stored = store.get_event(event.id).await.unwrap().unwrap();
        let snap = stored.metadata.pre_match_odds.unwrap();
        assert_eq!((snap.home, snap.draw, snap.away), (Some(2.1), None, Some(3.3)));
    }
}
