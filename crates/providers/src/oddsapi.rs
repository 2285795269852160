/// The Odds API (v4) adapter.
///
/// Sport keys are league-level (`soccer_epl`, `basketball_nba`), so the sport
/// key doubles as the competition key.
///
///   GET /v4/sports/<key>/scores?daysFrom=1        - live + recently completed
///   GET /v4/sports/<key>/events?commenceTimeFrom=&commenceTimeTo=
///   GET /v4/sports/<key>/events/<id>/odds?markets=h2h,spreads,totals
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime};
use feed_model::{Clock, EventStatus, FeedError, FeedResult, MarketType, Scores, StopFlag};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use crate::{
    collect_records, require_teams, rfc3339_to_utc, vocab, AdapterConfig, Auth, CompetitionRef, EventBatch,
    ProviderAdapter, ProviderEvent, ProviderHttp, ProviderMarket, ProviderSelection, RateLimitConfig, RateLimiter,
    RawOdds, SportPlan, SportRef,
};

pub const PROVIDER: &str = "oddsapi";
const DEFAULT_BASE: &str = "https://api.the-odds-api.com";

const PLAN: &[(&str, u8)] = &[
    ("soccer_epl", 1),
    ("soccer_spain_la_liga", 1),
    ("soccer_uefa_champs_league", 2),
    ("basketball_nba", 1),
    ("basketball_euroleague", 2),
    ("icehockey_nhl", 2),
    ("americanfootball_nfl", 2),
    ("baseball_mlb", 2),
    ("mma_mixed_martial_arts", 3),
];

// sport key group (prefix before the first `_`) → canonical slug
const GROUP_TABLE: &[(&str, &str)] = &[
    ("soccer", "football"),
    ("basketball", "basketball"),
    ("icehockey", "ice-hockey"),
    ("americanfootball", "american-football"),
    ("baseball", "baseball"),
    ("tennis", "tennis"),
    ("mma", "mma"),
    ("boxing", "mma"),
    ("cricket", "cricket"),
    ("rugbyleague", "rugby"),
    ("rugbyunion", "rugby"),
    ("handball", "handball"),
];

const STATUS_TABLE: &[(&str, EventStatus)] = &[
    ("scheduled", EventStatus::Upcoming),
    ("live", EventStatus::Live),
    ("completed", EventStatus::Ended),
];

const MARKET_TABLE: &[(&str, MarketType, Option<&str>, &str)] = &[
    ("h2h", MarketType::Moneyline, None, "Head to Head"),
    ("spreads", MarketType::Spread, None, "Point Spread"),
    ("totals", MarketType::Total, None, "Totals"),
    ("h2h_h1", MarketType::Moneyline, Some("H1"), "1st Half Head to Head"),
    ("spreads_h1", MarketType::Spread, Some("H1"), "1st Half Spread"),
    ("totals_h1", MarketType::Total, Some("H1"), "1st Half Totals"),
    ("outrights", MarketType::Outright, None, "Outright Winner"),
];

fn slug_for(sport_key: &str) -> Option<&'static str> {
    let group = sport_key.split('_').next().unwrap_or(sport_key);
    GROUP_TABLE.iter().find(|(g, _)| *g == group).map(|(_, slug)| *slug)
}

fn status_for(raw: &str) -> EventStatus {
    STATUS_TABLE
        .iter()
        .find(|(t, _)| *t == raw)
        .map(|(_, s)| *s)
        .unwrap_or(EventStatus::Upcoming)
}

// ── Raw payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OddsApiEvent {
    id: String,
    sport_key: String,
    #[serde(default)]
    sport_title: Option<String>,
    commence_time: String,
    home_team: String,
    away_team: String,
    #[serde(default)]
    completed: Option<bool>,
    #[serde(default)]
    scores: Option<Vec<TeamScore>>,
}

#[derive(Debug, Deserialize)]
struct TeamScore {
    name: String,
    score: String,
}

#[derive(Debug, Deserialize)]
struct OddsPayload {
    id: String,
    home_team: String,
    away_team: String,
    #[serde(default)]
    bookmakers: Vec<Bookmaker>,
}

#[derive(Debug, Deserialize)]
struct Bookmaker {
    key: String,
    #[serde(default)]
    markets: Vec<BookMarket>,
}

#[derive(Debug, Deserialize)]
struct BookMarket {
    key: String,
    #[serde(default)]
    outcomes: Vec<BookOutcome>,
}

#[derive(Debug, Deserialize)]
struct BookOutcome {
    name: String,
    price: Value,
    #[serde(default)]
    point: Option<f64>,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Scores list present and not completed means the event is running.
fn status_token(ev: &OddsApiEvent) -> &'static str {
    if ev.completed == Some(true) {
        "completed"
    } else if ev.scores.as_ref().map_or(false, |s| !s.is_empty()) {
        "live"
    } else {
        "scheduled"
    }
}

fn team_score(scores: &[TeamScore], team: &str) -> Option<i32> {
    scores.iter().find(|s| s.name == team).and_then(|s| s.score.trim().parse().ok())
}

fn parse_event(raw: OddsApiEvent) -> FeedResult<ProviderEvent> {
    let slug = slug_for(&raw.sport_key)
        .ok_or_else(|| FeedError::parse(PROVIDER, format!("unknown sport key {}", raw.sport_key)))?;
    require_teams(PROVIDER, &raw.home_team, &raw.away_team)?;
    let token = status_token(&raw);
    let scores = raw.scores.as_deref().and_then(|s| {
        Some(Scores::new(team_score(s, &raw.home_team)?, team_score(s, &raw.away_team)?))
    });
    Ok(ProviderEvent {
        provider: PROVIDER,
        provider_event_id: raw.id,
        sport: vocab::sport_ref(slug),
        competition: CompetitionRef {
            name: raw.sport_title.unwrap_or_else(|| raw.sport_key.clone()),
            key: raw.sport_key,
            country: None,
        },
        start_time: rfc3339_to_utc(PROVIDER, &raw.commence_time)?,
        home_team: raw.home_team,
        away_team: raw.away_team,
        home_logo: None,
        away_logo: None,
        status: status_for(token),
        raw_status: token.to_string(),
        scores,
        timer: None,
        elapsed_minutes: None,
        period_scores: BTreeMap::new(),
        markets: Vec::new(),
    })
}

fn parse_events(rows: Vec<Value>) -> EventBatch {
    collect_records::<OddsApiEvent, _>(PROVIDER, rows, parse_event)
}

/// First bookmaker that quotes anything; outcome names are team names.
fn parse_odds_payload(payload: OddsPayload) -> Option<RawOdds> {
    let book = payload.bookmakers.iter().find(|b| !b.markets.is_empty())?;
    debug!(provider = PROVIDER, bookmaker = %book.key, event = %payload.id, "odds source");
    let mut markets = Vec::new();
    for m in &book.markets {
        let Some(&(_, market_type, period, name)) = MARKET_TABLE.iter().find(|(k, ..)| *k == m.key) else {
            continue;
        };
        let mut by_line: BTreeMap<String, ProviderMarket> = BTreeMap::new();
        for o in &m.outcomes {
            let Some(odds) = vocab::parse_odds(&o.price) else { continue };
            let outcome = vocab::canonical_outcome(&o.name, &payload.home_team, &payload.away_team);
            let (line, handicap) = match market_type {
                MarketType::Spread => {
                    let Some(p) = o.point else { continue };
                    (Some(if outcome == "AWAY" { -p } else { p }), Some(p))
                }
                MarketType::Total => (o.point, None),
                _ => (None, None),
            };
            let key = line.map(|l| l.to_string()).unwrap_or_default();
            by_line
                .entry(key)
                .or_insert_with(|| ProviderMarket {
                    raw_key: m.key.clone(),
                    name: Some(name.to_string()),
                    market_type: Some(market_type),
                    period: period.map(str::to_string),
                    line,
                    selections: Vec::new(),
                })
                .selections
                .push(ProviderSelection { label: o.name.clone(), outcome, odds, handicap });
        }
        markets.extend(by_line.into_values().filter(|m| m.selections.len() >= 2));
    }
    if markets.is_empty() {
        return None;
    }
    Some(RawOdds { provider_event_id: payload.id, markets })
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct OddsApiAdapter {
    http: ProviderHttp,
}

impl OddsApiAdapter {
    pub fn new(config: AdapterConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = config.limits.unwrap_or(RateLimitConfig::new(10, 500));
        let limiter = Arc::new(RateLimiter::new(PROVIDER, limits, clock));
        let http = ProviderHttp::new(
            PROVIDER,
            config.base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()),
            Auth::Query { name: "apiKey", value: config.credential },
            limiter,
            config.http,
        );
        Self { http }
    }
}

#[async_trait]
impl ProviderAdapter for OddsApiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn sports(&self) -> Vec<SportPlan> {
        PLAN.iter()
            .filter_map(|(key, tier)| {
                slug_for(key).map(|slug| SportPlan { key: key.to_string(), slug: slug.to_string(), tier: *tier })
            })
            .collect()
    }

    fn limiter(&self) -> &Arc<RateLimiter> {
        self.http.limiter()
    }

    fn supports_odds(&self) -> bool {
        true
    }

    /// Completed events are kept so the caller sees final scores.
    async fn fetch_in_play(&self, sport_key: &str) -> FeedResult<EventBatch> {
        let path = format!("/v4/sports/{sport_key}/scores");
        let rows: Vec<Value> = self.http.get_json(&path, &[("daysFrom", "1".to_string())]).await?;
        let mut batch = parse_events(rows);
        batch.events.retain(|e| e.status != EventStatus::Upcoming);
        Ok(batch)
    }

    /// Single request per day; the API does not paginate.
    async fn fetch_upcoming(&self, sport_key: &str, day: NaiveDate, stop: &StopFlag) -> FeedResult<EventBatch> {
        if stop.is_stopped() {
            return Ok(EventBatch::default());
        }
        let from = day.and_time(NaiveTime::MIN).and_utc();
        let to = from + chrono::Duration::days(1) - chrono::Duration::seconds(1);
        let query = [
            ("commenceTimeFrom", from.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
            ("commenceTimeTo", to.format("%Y-%m-%dT%H:%M:%SZ").to_string()),
        ];
        let rows: Vec<Value> = self.http.get_json(&format!("/v4/sports/{sport_key}/events"), &query).await?;
        Ok(parse_events(rows))
    }

    async fn fetch_odds(&self, sport_key: &str, event_id: &str) -> FeedResult<Option<RawOdds>> {
        let path = format!("/v4/sports/{sport_key}/events/{event_id}/odds");
        let query = [
            ("regions", "eu".to_string()),
            ("markets", "h2h,spreads,totals".to_string()),
            ("oddsFormat", "decimal".to_string()),
        ];
        let payload: OddsPayload = self.http.get_json(&path, &query).await?;
        Ok(parse_odds_payload(payload))
    }

    fn map_status(&self, raw: &str) -> EventStatus {
        status_for(raw)
    }

    fn map_sport(&self, code: &str) -> Option<SportRef> {
        slug_for(code).map(vocab::sport_ref)
    }

    fn map_market_type(&self, raw_key: &str) -> Option<MarketType> {
        MARKET_TABLE.iter().find(|(k, ..)| *k == raw_key).map(|(_, t, ..)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_model::SystemClock;
    use serde_json::json;

    #[test]
    fn test_parse_scores_fixture() {
        let rows = vec![
            json!({
                "id": "a1b2", "sport_key": "basketball_nba", "sport_title": "NBA",
                "commence_time": "2026-06-01T23:10:00Z", "completed": false,
                "home_team": "Boston Celtics", "away_team": "Miami Heat",
                "scores": [{"name": "Miami Heat", "score": "88"}, {"name": "Boston Celtics", "score": "91"}],
                "last_update": "2026-06-02T01:02:03Z"
            }),
            json!({
                "id": "c3d4", "sport_key": "basketball_nba", "sport_title": "NBA",
                "commence_time": "2026-06-01T20:00:00Z", "completed": true,
                "home_team": "Denver Nuggets", "away_team": "Utah Jazz",
                "scores": [{"name": "Denver Nuggets", "score": "110"}, {"name": "Utah Jazz", "score": "101"}]
            }),
            json!({
                "id": "e5f6", "sport_key": "basketball_nba", "commence_time": "2026-06-03T00:00:00Z",
                "completed": false, "home_team": "A", "away_team": "B", "scores": null
            }),
            json!({"id": "bad", "sport_key": "curling_world", "commence_time": "2026-06-03T00:00:00Z",
                   "home_team": "A", "away_team": "B"}),
        ];
        let batch = parse_events(rows);
        assert_eq!(batch.events.len(), 3);
        assert_eq!(batch.rejected, 1);

        let live = &batch.events[0];
        assert_eq!(live.status, EventStatus::Live);
        assert_eq!(live.scores, Some(Scores::new(91, 88)));
        assert_eq!(live.competition.key, "basketball_nba");
        assert_eq!(live.competition.name, "NBA");
        assert_eq!(batch.events[1].status, EventStatus::Ended);
        assert_eq!(batch.events[2].status, EventStatus::Upcoming);
        assert_eq!(batch.events[2].competition.name, "basketball_nba");
    }

    #[test]
    fn test_parse_odds_maps_team_names() {
        let payload: OddsPayload = serde_json::from_value(json!({
            "id": "a1b2", "sport_key": "soccer_epl",
            "home_team": "Arsenal", "away_team": "Chelsea",
            "bookmakers": [
                {"key": "empty", "markets": []},
                {"key": "pinnacle", "title": "Pinnacle", "markets": [
                    {"key": "h2h", "outcomes": [
                        {"name": "Arsenal", "price": 1.95}, {"name": "Chelsea", "price": 3.9}, {"name": "Draw", "price": 3.6}
                    ]},
                    {"key": "spreads", "outcomes": [
                        {"name": "Arsenal", "price": 1.9, "point": -0.5}, {"name": "Chelsea", "price": 1.95, "point": 0.5}
                    ]},
                    {"key": "totals", "outcomes": [
                        {"name": "Over", "price": 2.0, "point": 2.5}, {"name": "Under", "price": 1.8, "point": 2.5}
                    ]},
                    {"key": "btts", "outcomes": [{"name": "Yes", "price": 1.7}, {"name": "No", "price": 2.1}]}
                ]}
            ]
        }))
        .unwrap();
        let odds = parse_odds_payload(payload).unwrap();
        assert_eq!(odds.markets.len(), 3);
        let h2h: Vec<_> = odds.markets[0].selections.iter().map(|s| s.outcome.as_str()).collect();
        assert_eq!(h2h, vec!["HOME", "AWAY", "DRAW"]);
        assert_eq!(odds.markets[1].line, Some(-0.5));
        assert_eq!(odds.markets[2].line, Some(2.5));
    }

    #[test]
    fn test_adapter_vocabulary() {
        let adapter = OddsApiAdapter::new(AdapterConfig::new("k"), Arc::new(SystemClock));
        assert_eq!(adapter.map_sport("icehockey_nhl").map(|s| s.slug), Some("ice-hockey".to_string()));
        assert_eq!(adapter.map_sport("curling_world"), None);
        assert_eq!(adapter.map_status("completed"), EventStatus::Ended);
        assert_eq!(adapter.map_market_type("totals_h1"), Some(MarketType::Total));
        assert!(adapter.sports().iter().all(|p| !p.slug.is_empty()));
    }
}
