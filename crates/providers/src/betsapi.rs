/// BetsAPI adapter.
///
/// Endpoints:
///   GET /v3/events/inplay?sport_id=        - live events
///   GET /v3/events/upcoming?sport_id=&day=YYYYMMDD&page=
///   GET /v2/event/odds?event_id=           - `<sport>_<n>` keyed odds history
///
/// Auth: `token` query parameter. Status comes as numeric `time_status`.
use async_trait::async_trait;
use chrono::NaiveDate;
use feed_model::{Clock, EventStatus, FeedError, FeedResult, MarketType, Scores, StopFlag};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::{
    collect_records, flex, parse_score_pair, require_teams, unix_to_utc, vocab, AdapterConfig, Auth, CompetitionRef,
    EventBatch, ProviderAdapter, ProviderEvent, ProviderHttp, ProviderMarket, ProviderSelection, RateLimitConfig,
    RateLimiter, RawOdds, SportPlan, SportRef,
};

pub const PROVIDER: &str = "betsapi";
const DEFAULT_BASE: &str = "https://api.b365api.com";
const LOGO_BASE: &str = "https://assets.b365api.com/images/team/m";

// (sport_id, canonical slug, tier)
const SPORT_TABLE: &[(&str, &str, u8)] = &[
    ("1", "football", 1),
    ("18", "basketball", 1),
    ("13", "tennis", 1),
    ("17", "ice-hockey", 2),
    ("91", "volleyball", 2),
    ("16", "baseball", 2),
    ("12", "american-football", 2),
    ("78", "handball", 3),
    ("92", "table-tennis", 3),
    ("8", "rugby", 3),
    ("3", "cricket", 3),
    ("151", "esports", 3),
];

const STATUS_TABLE: &[(&str, EventStatus)] = &[
    ("0", EventStatus::Upcoming),  // not started
    ("1", EventStatus::Live),      // in play
    ("2", EventStatus::Upcoming),  // to be fixed
    ("3", EventStatus::Ended),
    ("4", EventStatus::Postponed),
    ("5", EventStatus::Cancelled),
    ("6", EventStatus::Ended),     // walkover
    ("7", EventStatus::Live),      // interrupted
    ("8", EventStatus::Cancelled), // abandoned
    ("9", EventStatus::Ended),     // retired
    ("99", EventStatus::Cancelled), // removed
];

// odds key suffix → (type, period, display name)
const MARKET_TABLE: &[(&str, MarketType, Option<&str>, &str)] = &[
    ("1", MarketType::Moneyline, None, "Full Time Result"),
    ("2", MarketType::Spread, None, "Handicap"),
    ("3", MarketType::Total, None, "Over/Under"),
    ("5", MarketType::Spread, Some("H1"), "1st Half Handicap"),
    ("6", MarketType::Total, Some("H1"), "1st Half Over/Under"),
    ("8", MarketType::Moneyline, Some("H1"), "Half Time Result"),
];

fn market_entry(raw_key: &str) -> Option<&'static (&'static str, MarketType, Option<&'static str>, &'static str)> {
    let suffix = raw_key.rsplit_once('_').map_or(raw_key, |(_, s)| s);
    MARKET_TABLE.iter().find(|(k, ..)| *k == suffix)
}

fn slug_for(sport_id: &str) -> Option<&'static str> {
    SPORT_TABLE.iter().find(|(id, ..)| *id == sport_id).map(|(_, slug, _)| *slug)
}

fn status_for(raw: &str) -> EventStatus {
    STATUS_TABLE
        .iter()
        .find(|(code, _)| *code == raw)
        .map(|(_, s)| *s)
        .unwrap_or(EventStatus::Upcoming)
}

// ── Raw payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default, deserialize_with = "flex::opt_i64")]
    success: Option<i64>,
    #[serde(default)]
    results: Value,
    #[serde(default)]
    pager: Option<Pager>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pager {
    #[serde(deserialize_with = "flex::string")]
    page: String,
    #[serde(deserialize_with = "flex::string")]
    per_page: String,
    #[serde(deserialize_with = "flex::string")]
    total: String,
}

impl Pager {
    fn has_more(&self) -> bool {
        let page: u64 = self.page.parse().unwrap_or(1);
        let per_page: u64 = self.per_page.parse().unwrap_or(50);
        let total: u64 = self.total.parse().unwrap_or(0);
        page * per_page < total
    }
}

#[derive(Debug, Deserialize)]
struct BetsEvent {
    #[serde(deserialize_with = "flex::string")]
    id: String,
    #[serde(deserialize_with = "flex::string")]
    sport_id: String,
    #[serde(default, deserialize_with = "flex::opt_i64")]
    time: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    time_status: Option<String>,
    league: BetsLeague,
    home: BetsTeam,
    away: BetsTeam,
    #[serde(default)]
    ss: Option<String>,
    #[serde(default)]
    timer: Option<BetsTimer>,
    /// Object keyed by period number, or `[]` when empty.
    #[serde(default)]
    scores: Value,
}

#[derive(Debug, Deserialize)]
struct BetsLeague {
    #[serde(deserialize_with = "flex::string")]
    id: String,
    name: String,
    #[serde(default)]
    cc: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BetsTeam {
    name: String,
    #[serde(default, deserialize_with = "flex::opt_string")]
    image_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BetsTimer {
    #[serde(default, deserialize_with = "flex::opt_i64")]
    tm: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_i64")]
    ts: Option<i64>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    q: Option<String>,
}

impl Envelope {
    fn into_results(self) -> FeedResult<Value> {
        if self.success == Some(0) {
            let msg = self.error.unwrap_or_else(|| "success=0".to_string());
            return Err(FeedError::parse(PROVIDER, format!("api error: {msg}")));
        }
        Ok(self.results)
    }
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Set-based sports report "6-4,3-2"; each decided segment is one set won.
fn parse_ss(slug: &str, ss: &str, finished: bool) -> Option<Scores> {
    if !ss.contains(',') || !matches!(slug, "tennis" | "volleyball" | "table-tennis") {
        return parse_score_pair(ss);
    }
    let segments: Vec<Scores> = ss.split(',').filter_map(parse_score_pair).collect();
    if segments.is_empty() {
        return None;
    }
    let decided = if finished { segments.len() } else { segments.len() - 1 };
    let mut sets = Scores::new(0, 0);
    for s in &segments[..decided] {
        if s.home > s.away {
            sets.home += 1;
        } else if s.away > s.home {
            sets.away += 1;
        }
    }
    Some(sets)
}

fn period_code(slug: &str, key: &str) -> Option<&'static str> {
    match (slug, key) {
        ("football", "1") => Some("H1"),
        ("ice-hockey", "1") => Some("P1"),
        ("ice-hockey", "2") => Some("P2"),
        ("ice-hockey", "3") => Some("P3"),
        ("basketball", "1") => Some("Q1"),
        ("basketball", "2") => Some("Q2"),
        ("basketball", "4") => Some("Q3"),
        ("basketball", "5") => Some("Q4"),
        _ => None,
    }
}

fn parse_period_scores(slug: &str, raw: &Value) -> BTreeMap<String, Scores> {
    let mut out = BTreeMap::new();
    let Some(map) = raw.as_object() else { return out };
    for (key, val) in map {
        let Some(code) = period_code(slug, key) else { continue };
        let side = |name: &str| -> Option<i32> {
            match val.get(name)? {
                Value::String(s) => s.trim().parse().ok(),
                Value::Number(n) => n.as_i64().map(|n| n as i32),
                _ => None,
            }
        };
        if let (Some(h), Some(a)) = (side("home"), side("away")) {
            out.insert(code.to_string(), Scores::new(h, a));
        }
    }
    out
}

fn logo(image_id: &Option<String>) -> Option<String> {
    image_id.as_ref().filter(|id| *id != "0").map(|id| format!("{LOGO_BASE}/{id}.png"))
}

fn parse_event(raw: BetsEvent) -> FeedResult<ProviderEvent> {
    let slug = slug_for(&raw.sport_id)
        .ok_or_else(|| FeedError::parse(PROVIDER, format!("unknown sport_id {}", raw.sport_id)))?;
    require_teams(PROVIDER, &raw.home.name, &raw.away.name)?;
    let time = raw.time.ok_or_else(|| FeedError::parse(PROVIDER, format!("event {} has no time", raw.id)))?;
    let start_time = unix_to_utc(PROVIDER, time)?;
    let raw_status = raw.time_status.unwrap_or_else(|| "0".to_string());
    let status = status_for(&raw_status);

    let scores = raw.ss.as_deref().and_then(|ss| parse_ss(slug, ss, status.is_terminal()));
    let (timer, elapsed_minutes) = match &raw.timer {
        Some(t) => {
            let mmss = t.tm.map(|m| format!("{:02}:{:02}", m, t.ts.unwrap_or(0)));
            let label = match (&t.q, mmss) {
                (Some(q), Some(clock)) => Some(format!("Q{q} {clock}")),
                (None, Some(clock)) => Some(clock),
                (Some(q), None) => Some(format!("Q{q}")),
                (None, None) => None,
            };
            (label, t.tm.and_then(|m| u32::try_from(m).ok()))
        }
        None => (None, None),
    };

    Ok(ProviderEvent {
        provider: PROVIDER,
        provider_event_id: raw.id,
        sport: vocab::sport_ref(slug),
        competition: CompetitionRef {
            key: raw.league.id,
            name: raw.league.name,
            country: raw.league.cc.filter(|c| !c.is_empty()).map(|c| c.to_uppercase()),
        },
        home_logo: logo(&raw.home.image_id),
        away_logo: logo(&raw.away.image_id),
        home_team: raw.home.name.trim().to_string(),
        away_team: raw.away.name.trim().to_string(),
        start_time,
        status,
        raw_status,
        scores,
        timer,
        elapsed_minutes,
        period_scores: parse_period_scores(slug, &raw.scores),
        markets: Vec::new(),
    })
}

fn parse_events(results: Value) -> EventBatch {
    let rows = match results {
        Value::Array(rows) => rows,
        _ => Vec::new(),
    };
    collect_records::<BetsEvent, _>(PROVIDER, rows, parse_event)
}

fn odds_field(entry: &Value, field: &str) -> Option<f64> {
    entry.get(field).and_then(vocab::parse_odds)
}

fn handicap(entry: &Value) -> Option<f64> {
    match entry.get("handicap")? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn selection(field: &str, odds: f64, handicap: Option<f64>) -> ProviderSelection {
    ProviderSelection {
        label: field.to_string(),
        outcome: vocab::canonical_outcome(field, "", ""),
        odds,
        handicap,
    }
}

/// Latest snapshot (index 0) of each recognised market key.
fn parse_odds_payload(event_id: &str, results: &Value) -> Option<RawOdds> {
    let odds = results.get("odds")?.as_object()?;
    let mut markets = Vec::new();
    for (raw_key, history) in odds {
        let Some(&(_, market_type, period, name)) = market_entry(raw_key) else {
            debug!(provider = PROVIDER, raw_key, "unmapped odds key");
            continue;
        };
        let Some(latest) = history.as_array().and_then(|h| h.first()) else { continue };

        let (line, selections) = match market_type {
            MarketType::Moneyline => {
                let sels: Vec<_> = ["home_od", "draw_od", "away_od"]
                    .iter()
                    .filter_map(|f| odds_field(latest, f).map(|o| selection(f, o, None)))
                    .collect();
                (None, sels)
            }
            MarketType::Spread => {
                // split lines such as "-0.5,-1.0" carry no single handicap
                let Some(h) = handicap(latest) else { continue };
                let mut sels = Vec::new();
                if let Some(o) = odds_field(latest, "home_od") {
                    sels.push(selection("home_od", o, Some(h)));
                }
                if let Some(o) = odds_field(latest, "away_od") {
                    sels.push(selection("away_od", o, Some(-h)));
                }
                (Some(h), sels)
            }
            _ => {
                let Some(h) = handicap(latest) else { continue };
                let sels: Vec<_> = ["over_od", "under_od"]
                    .iter()
                    .filter_map(|f| odds_field(latest, f).map(|o| selection(f, o, None)))
                    .collect();
                (Some(h), sels)
            }
        };
        if selections.len() < 2 {
            continue;
        }
        markets.push(ProviderMarket {
            raw_key: raw_key.clone(),
            name: Some(name.to_string()),
            market_type: Some(market_type),
            period: period.map(str::to_string),
            line,
            selections,
        });
    }
    if markets.is_empty() {
        return None;
    }
    markets.sort_by(|a, b| a.raw_key.cmp(&b.raw_key));
    Some(RawOdds { provider_event_id: event_id.to_string(), markets })
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct BetsApiAdapter {
    http: ProviderHttp,
    max_pages: u32,
}

impl BetsApiAdapter {
    pub fn new(config: AdapterConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = config.limits.unwrap_or(RateLimitConfig::new(60, 3600));
        let limiter = Arc::new(RateLimiter::new(PROVIDER, limits, clock));
        let http = ProviderHttp::new(
            PROVIDER,
            config.base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()),
            Auth::Query { name: "token", value: config.credential },
            limiter,
            config.http,
        );
        Self { http, max_pages: config.max_pages.max(1) }
    }
}

#[async_trait]
impl ProviderAdapter for BetsApiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn sports(&self) -> Vec<SportPlan> {
        SPORT_TABLE
            .iter()
            .map(|(id, slug, tier)| SportPlan { key: id.to_string(), slug: slug.to_string(), tier: *tier })
            .collect()
    }

    fn limiter(&self) -> &Arc<RateLimiter> {
        self.http.limiter()
    }

    fn supports_odds(&self) -> bool {
        true
    }

    async fn fetch_in_play(&self, sport_key: &str) -> FeedResult<EventBatch> {
        let env: Envelope = self.http.get_json("/v3/events/inplay", &[("sport_id", sport_key.to_string())]).await?;
        Ok(parse_events(env.into_results()?))
    }

    async fn fetch_upcoming(&self, sport_key: &str, day: NaiveDate, stop: &StopFlag) -> FeedResult<EventBatch> {
        let mut batch = EventBatch::default();
        for page in 1..=self.max_pages {
            if stop.is_stopped() {
                break;
            }
            let query = [
                ("sport_id", sport_key.to_string()),
                ("day", day.format("%Y%m%d").to_string()),
                ("page", page.to_string()),
            ];
            let env: Envelope = match self.http.get_json("/v3/events/upcoming", &query).await {
                Ok(env) => env,
                Err(e) if page > 1 => {
                    warn!(provider = PROVIDER, sport_key, page, "upcoming pagination stopped: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            let more = env.pager.as_ref().map_or(false, Pager::has_more);
            batch.extend(parse_events(env.into_results()?));
            if !more {
                break;
            }
        }
        Ok(batch)
    }

    async fn fetch_odds(&self, _sport_key: &str, event_id: &str) -> FeedResult<Option<RawOdds>> {
        let env: Envelope = self.http.get_json("/v2/event/odds", &[("event_id", event_id.to_string())]).await?;
        Ok(parse_odds_payload(event_id, &env.into_results()?))
    }

    fn map_status(&self, raw: &str) -> EventStatus {
        status_for(raw)
    }

    fn map_sport(&self, code: &str) -> Option<SportRef> {
        slug_for(code).map(vocab::sport_ref)
    }

    fn map_market_type(&self, raw_key: &str) -> Option<MarketType> {
        market_entry(raw_key).map(|(_, t, ..)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_model::SystemClock;
    use serde_json::json;

    fn inplay_fixture() -> Value {
        json!({
            "success": 1,
            "pager": {"page": 1, "per_page": 50, "total": 3},
            "results": [
                {
                    "id": "9120011", "sport_id": "1", "time": "1780315200", "time_status": "1",
                    "league": {"id": "94", "name": "England Premier League", "cc": "gb"},
                    "home": {"id": "1", "name": "Arsenal", "image_id": "1234"},
                    "away": {"id": "2", "name": "Chelsea", "image_id": 0},
                    "ss": "2-1",
                    "timer": {"tm": 67, "ts": 12, "tt": "1", "ta": 0, "md": 1},
                    "scores": {"1": {"home": "1", "away": "1"}, "2": {"home": "2", "away": "1"}}
                },
                {
                    "id": 9120012, "sport_id": 13, "time": 1780315200, "time_status": 3,
                    "league": {"id": 7, "name": "ATP Halle"},
                    "home": {"name": "Player A"}, "away": {"name": "Player B"},
                    "ss": "6-4,3-6,7-5",
                    "scores": []
                },
                {
                    "id": "9120013", "sport_id": "1", "time": "1780315200", "time_status": "0",
                    "league": {"id": "94", "name": "England Premier League"},
                    "home": {"name": "TBD"}, "away": {"name": "Chelsea"}
                }
            ]
        })
    }

    #[test]
    fn test_parse_inplay_fixture() {
        let env: Envelope = serde_json::from_value(inplay_fixture()).unwrap();
        let batch = parse_events(env.into_results().unwrap());
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.rejected, 1);

        let ev = &batch.events[0];
        assert_eq!(ev.external_id(), "betsapi:9120011");
        assert_eq!(ev.sport.slug, "football");
        assert_eq!(ev.status, EventStatus::Live);
        assert_eq!(ev.scores, Some(Scores::new(2, 1)));
        assert_eq!(ev.timer.as_deref(), Some("67:12"));
        assert_eq!(ev.elapsed_minutes, Some(67));
        assert_eq!(ev.period_scores.get("H1"), Some(&Scores::new(1, 1)));
        assert_eq!(ev.competition.country.as_deref(), Some("GB"));
        assert_eq!(ev.home_logo.as_deref(), Some("https://assets.b365api.com/images/team/m/1234.png"));
        assert_eq!(ev.away_logo, None);

        let tennis = &batch.events[1];
        assert_eq!(tennis.status, EventStatus::Ended);
        assert_eq!(tennis.scores, Some(Scores::new(2, 1)));
    }

    #[test]
    fn test_live_tennis_counts_only_finished_sets() {
        assert_eq!(parse_ss("tennis", "6-4,2-3", false), Some(Scores::new(1, 0)));
        assert_eq!(parse_ss("football", "1-0", false), Some(Scores::new(1, 0)));
    }

    #[test]
    fn test_status_vocabulary() {
        assert_eq!(status_for("1"), EventStatus::Live);
        assert_eq!(status_for("4"), EventStatus::Postponed);
        assert_eq!(status_for("99"), EventStatus::Cancelled);
        assert_eq!(status_for("42"), EventStatus::Upcoming);
    }

    #[test]
    fn test_api_error_envelope() {
        let env: Envelope = serde_json::from_value(json!({"success": 0, "error": "TOKEN_INVALID"})).unwrap();
        assert_eq!(env.into_results().unwrap_err().kind(), "parse");
    }

    #[test]
    fn test_parse_odds_payload() {
        let results = json!({
            "stats": {},
            "odds": {
                "1_1": [
                    {"id": "2", "home_od": "1.80", "draw_od": "3.60", "away_od": "4.50", "add_time": "1780315100"},
                    {"id": "1", "home_od": "1.90", "draw_od": "3.40", "away_od": "4.00"}
                ],
                "1_2": [{"handicap": "-0.5", "home_od": "1.95", "away_od": "1.85"}],
                "1_3": [{"handicap": "2.5", "over_od": "1.70", "under_od": "2.10"}],
                "1_5": [{"handicap": "-0.5,-1.0", "home_od": "2.0", "away_od": "1.8"}],
                "1_4": [{"handicap": "9.5", "over_od": "1.9", "under_od": "1.9"}]
            }
        });
        let odds = parse_odds_payload("9120011", &results).unwrap();
        let keys: Vec<_> = odds.markets.iter().map(|m| m.raw_key.as_str()).collect();
        assert_eq!(keys, vec!["1_1", "1_2", "1_3"]);

        let ml = &odds.markets[0];
        assert_eq!(ml.market_type, Some(MarketType::Moneyline));
        let outcomes: Vec<_> = ml.selections.iter().map(|s| (s.outcome.as_str(), s.odds)).collect();
        assert_eq!(outcomes, vec![("HOME", 1.80), ("DRAW", 3.60), ("AWAY", 4.50)]);

        let spread = &odds.markets[1];
        assert_eq!(spread.line, Some(-0.5));
        assert_eq!(spread.selections[1].handicap, Some(0.5));

        let total = &odds.markets[2];
        assert_eq!(total.line, Some(2.5));
        assert_eq!(total.selections[0].outcome, "OVER");
    }

    #[test]
    fn test_adapter_tables() {
        let adapter = BetsApiAdapter::new(AdapterConfig::new("token"), Arc::new(SystemClock));
        assert_eq!(adapter.map_sport("18").map(|s| s.slug), Some("basketball".to_string()));
        assert_eq!(adapter.map_market_type("18_3"), Some(MarketType::Total));
        assert_eq!(adapter.map_market_type("1_4"), None);
        assert!(adapter.sports().iter().any(|s| s.slug == "tennis" && s.tier == 1));
        assert_eq!(adapter.limiter().config().per_minute, 60);
    }
}
