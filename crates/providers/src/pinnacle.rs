/// Pinnacle adapter.
///
/// Fixtures come as a league tree. Live state is split across two calls:
/// `liveStatus` on the fixture and the global `/v1/inrunning` feed with
/// per-event state and elapsed minutes. Scores are not published here.
///
///   GET /v1/fixtures?sportId=&isLive=1   + /v1/inrunning
///   GET /v1/fixtures?sportId=            - full tree, filtered by day for upcoming
///   GET /v1/odds?sportId=&eventIds=      - periods (0 = full game, 1 = first half)
///
/// Auth: HTTP Basic, credential given as `user:password`.
use async_trait::async_trait;
use chrono::NaiveDate;
use feed_model::{Clock, EventStatus, FeedError, FeedResult, MarketType, StopFlag};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use crate::{
    collect_records, require_teams, rfc3339_to_utc, vocab, AdapterConfig, Auth, CompetitionRef, EventBatch,
    ProviderAdapter, ProviderEvent, ProviderHttp, ProviderMarket, ProviderSelection, ProviderTree, RateLimitConfig,
    RateLimiter, RawOdds, SportPlan, SportRef, TreeCompetition,
};

pub const PROVIDER: &str = "pinnacle";
const DEFAULT_BASE: &str = "https://api.pinnacle.com";

const SPORT_TABLE: &[(&str, &str, u8)] = &[
    ("29", "football", 1),
    ("4", "basketball", 1),
    ("33", "tennis", 1),
    ("19", "ice-hockey", 2),
    ("15", "american-football", 2),
    ("3", "baseball", 2),
    ("34", "volleyball", 3),
    ("18", "handball", 3),
    ("27", "rugby", 3),
    ("22", "mma", 3),
    ("12", "esports", 3),
];

// in-running state → (status, short label)
const STATE_TABLE: &[(i64, EventStatus, &str)] = &[
    (1, EventStatus::Live, "1H"),
    (2, EventStatus::Live, "HT"),
    (3, EventStatus::Live, "2H"),
    (4, EventStatus::Live, "FT"),
    (5, EventStatus::Live, "ET1"),
    (6, EventStatus::Live, "ETHT"),
    (7, EventStatus::Live, "ET2"),
    (8, EventStatus::Live, "AET"),
    (9, EventStatus::Ended, "END"),
    (10, EventStatus::Live, "SUSP"),
    (11, EventStatus::Live, "PEN"),
];

const MARKET_TABLE: &[(&str, MarketType)] = &[
    ("moneyline", MarketType::Moneyline),
    ("spread", MarketType::Spread),
    ("total", MarketType::Total),
];

fn slug_for(sport_id: &str) -> Option<&'static str> {
    SPORT_TABLE.iter().find(|(id, ..)| *id == sport_id).map(|(_, slug, _)| *slug)
}

/// Tokens: `prematch`, `live` (offered in-play, no state yet), `state:<n>`.
fn status_for(raw: &str) -> EventStatus {
    match raw {
        "live" => EventStatus::Live,
        _ => raw
            .strip_prefix("state:")
            .and_then(|n| n.parse::<i64>().ok())
            .and_then(|n| STATE_TABLE.iter().find(|(s, ..)| *s == n))
            .map(|(_, status, _)| *status)
            .unwrap_or(EventStatus::Upcoming),
    }
}

fn period_code(number: i64) -> Option<Option<&'static str>> {
    match number {
        0 => Some(None),
        1 => Some(Some("H1")),
        _ => None,
    }
}

// ── Raw payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FixturesResponse {
    #[serde(default)]
    league: Vec<FixtureLeague>,
}

#[derive(Debug, Deserialize)]
struct FixtureLeague {
    id: i64,
    name: String,
    #[serde(default)]
    events: Vec<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinFixture {
    id: i64,
    starts: String,
    home: String,
    away: String,
    #[serde(default)]
    live_status: Option<i64>,
    #[serde(default)]
    parent_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct InRunningResponse {
    #[serde(default)]
    sports: Vec<InRunningSport>,
}

#[derive(Debug, Deserialize)]
struct InRunningSport {
    #[serde(default)]
    leagues: Vec<InRunningLeague>,
}

#[derive(Debug, Deserialize)]
struct InRunningLeague {
    #[serde(default)]
    events: Vec<InRunningEvent>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct InRunningEvent {
    id: i64,
    state: i64,
    #[serde(default)]
    elapsed: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct OddsResponse {
    #[serde(default)]
    leagues: Vec<OddsLeague>,
}

#[derive(Debug, Deserialize)]
struct OddsLeague {
    #[serde(default)]
    events: Vec<OddsEvent>,
}

#[derive(Debug, Deserialize)]
struct OddsEvent {
    id: i64,
    #[serde(default)]
    periods: Vec<OddsPeriod>,
}

#[derive(Debug, Deserialize)]
struct OddsPeriod {
    number: i64,
    #[serde(default)]
    moneyline: Option<Moneyline>,
    #[serde(default)]
    spreads: Vec<SpreadLine>,
    #[serde(default)]
    totals: Vec<TotalLine>,
}

#[derive(Debug, Deserialize)]
struct Moneyline {
    home: Option<f64>,
    away: Option<f64>,
    #[serde(default)]
    draw: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SpreadLine {
    hdp: f64,
    home: Option<f64>,
    away: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TotalLine {
    points: f64,
    over: Option<f64>,
    under: Option<f64>,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn league_country(name: &str) -> Option<String> {
    name.split_once(" - ").map(|(country, _)| country.trim().to_string())
}

fn parse_fixture(
    slug: &'static str,
    league: &CompetitionRef,
    states: &HashMap<i64, InRunningEvent>,
    raw: PinFixture,
) -> FeedResult<ProviderEvent> {
    if raw.parent_id.is_some() {
        return Err(FeedError::parse(PROVIDER, format!("event {} is a derived fixture", raw.id)));
    }
    require_teams(PROVIDER, &raw.home, &raw.away)?;
    let running = states.get(&raw.id);
    let raw_status = match (running, raw.live_status) {
        (Some(r), _) => format!("state:{}", r.state),
        (None, Some(1)) => "live".to_string(),
        _ => "prematch".to_string(),
    };
    let timer = running.and_then(|r| {
        let label = STATE_TABLE.iter().find(|(s, ..)| *s == r.state).map(|(_, _, l)| *l)?;
        Some(match r.elapsed {
            Some(m) => format!("{label} {m}'"),
            None => label.to_string(),
        })
    });
    Ok(ProviderEvent {
        provider: PROVIDER,
        provider_event_id: raw.id.to_string(),
        sport: vocab::sport_ref(slug),
        competition: league.clone(),
        start_time: rfc3339_to_utc(PROVIDER, &raw.starts)?,
        home_team: raw.home.trim().to_string(),
        away_team: raw.away.trim().to_string(),
        home_logo: None,
        away_logo: None,
        status: status_for(&raw_status),
        raw_status,
        scores: None,
        timer,
        elapsed_minutes: running.and_then(|r| r.elapsed),
        period_scores: BTreeMap::new(),
        markets: Vec::new(),
    })
}

fn build_tree(
    sport_key: &str,
    resp: FixturesResponse,
    states: &HashMap<i64, InRunningEvent>,
) -> FeedResult<(ProviderTree, usize)> {
    let slug = slug_for(sport_key).ok_or_else(|| FeedError::parse(PROVIDER, format!("unknown sport {sport_key}")))?;
    let mut rejected = 0;
    let mut competitions = Vec::new();
    for league in resp.league {
        let competition = CompetitionRef {
            key: league.id.to_string(),
            country: league_country(&league.name),
            name: league.name,
        };
        let batch =
            collect_records::<PinFixture, _>(PROVIDER, league.events, |f| parse_fixture(slug, &competition, states, f));
        rejected += batch.rejected;
        if !batch.events.is_empty() {
            competitions.push(TreeCompetition { competition, events: batch.events });
        }
    }
    Ok((ProviderTree { sport: vocab::sport_ref(slug), competitions }, rejected))
}

fn index_states(resp: InRunningResponse) -> HashMap<i64, InRunningEvent> {
    resp.sports
        .into_iter()
        .flat_map(|s| s.leagues)
        .flat_map(|l| l.events)
        .map(|e| (e.id, e))
        .collect()
}

fn sel(label: &str, outcome: &str, odds: Option<f64>, handicap: Option<f64>) -> Option<ProviderSelection> {
    let odds = odds.filter(|o| (1.01..=1000.0).contains(o))?;
    Some(ProviderSelection { label: label.to_string(), outcome: outcome.to_string(), odds, handicap })
}

fn period_markets(period: &OddsPeriod) -> Vec<ProviderMarket> {
    let Some(code) = period_code(period.number) else { return Vec::new() };
    let market = |raw_key: &str, market_type, line, selections: Vec<ProviderSelection>| ProviderMarket {
        raw_key: raw_key.to_string(),
        name: None,
        market_type: Some(market_type),
        period: code.map(str::to_string),
        line,
        selections,
    };
    let mut out = Vec::new();
    if let Some(ml) = &period.moneyline {
        let sels: Vec<_> = [
            sel("home", "HOME", ml.home, None),
            sel("draw", "DRAW", ml.draw, None),
            sel("away", "AWAY", ml.away, None),
        ]
        .into_iter()
        .flatten()
        .collect();
        out.push(market("moneyline", MarketType::Moneyline, None, sels));
    }
    for s in &period.spreads {
        let sels: Vec<_> =
            [sel("home", "HOME", s.home, Some(s.hdp)), sel("away", "AWAY", s.away, Some(-s.hdp))].into_iter().flatten().collect();
        out.push(market("spread", MarketType::Spread, Some(s.hdp), sels));
    }
    for t in &period.totals {
        let sels: Vec<_> =
            [sel("over", "OVER", t.over, None), sel("under", "UNDER", t.under, None)].into_iter().flatten().collect();
        out.push(market("total", MarketType::Total, Some(t.points), sels));
    }
    out.retain(|m| m.selections.len() >= 2);
    out
}

fn parse_odds_response(event_id: &str, resp: OddsResponse) -> Option<RawOdds> {
    let wanted: i64 = event_id.parse().ok()?;
    let event = resp.leagues.into_iter().flat_map(|l| l.events).find(|e| e.id == wanted)?;
    let markets: Vec<_> = event.periods.iter().flat_map(period_markets).collect();
    if markets.is_empty() {
        return None;
    }
    Some(RawOdds { provider_event_id: event_id.to_string(), markets })
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct PinnacleAdapter {
    http: ProviderHttp,
}

impl PinnacleAdapter {
    pub fn new(config: AdapterConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = config.limits.unwrap_or(RateLimitConfig::new(30, 1000));
        let limiter = Arc::new(RateLimiter::new(PROVIDER, limits, clock));
        let (user, password) = match config.credential.split_once(':') {
            Some((u, p)) => (u.to_string(), p.to_string()),
            None => (config.credential.clone(), String::new()),
        };
        let http = ProviderHttp::new(
            PROVIDER,
            config.base_url.unwrap_or_else(|| DEFAULT_BASE.to_string()),
            Auth::Basic { user, password },
            limiter,
            config.http,
        );
        Self { http }
    }

    async fn fixtures(&self, sport_key: &str, live_only: bool) -> FeedResult<FixturesResponse> {
        let mut query = vec![("sportId", sport_key.to_string())];
        if live_only {
            query.push(("isLive", "1".to_string()));
        }
        self.http.get_json("/v1/fixtures", &query).await
    }
}

#[async_trait]
impl ProviderAdapter for PinnacleAdapter {
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
        let fixtures = self.fixtures(sport_key, true).await?;
        // states are an enrichment; fixtures alone still mark events live
        let states = match self.http.get_json::<InRunningResponse>("/v1/inrunning", &[]).await {
            Ok(resp) => index_states(resp),
            Err(e) => {
                warn!(provider = PROVIDER, sport_key, "in-running states unavailable: {e}");
                HashMap::new()
            }
        };
        let (tree, rejected) = build_tree(sport_key, fixtures, &states)?;
        let mut events = tree.into_events();
        events.retain(|e| e.status != EventStatus::Upcoming);
        Ok(EventBatch { events, rejected })
    }

    async fn fetch_upcoming(&self, sport_key: &str, day: NaiveDate, stop: &StopFlag) -> FeedResult<EventBatch> {
        if stop.is_stopped() {
            return Ok(EventBatch::default());
        }
        let (tree, rejected) = build_tree(sport_key, self.fixtures(sport_key, false).await?, &HashMap::new())?;
        let mut events = tree.into_events();
        events.retain(|e| e.start_time.date_naive() == day);
        Ok(EventBatch { events, rejected })
    }

    async fn fetch_odds(&self, sport_key: &str, event_id: &str) -> FeedResult<Option<RawOdds>> {
        let query = [
            ("sportId", sport_key.to_string()),
            ("eventIds", event_id.to_string()),
            ("oddsFormat", "Decimal".to_string()),
        ];
        let resp: OddsResponse = self.http.get_json("/v1/odds", &query).await?;
        Ok(parse_odds_response(event_id, resp))
    }

    async fn fetch_tree(&self, sport_key: &str) -> FeedResult<Option<ProviderTree>> {
        let (tree, _) = build_tree(sport_key, self.fixtures(sport_key, false).await?, &HashMap::new())?;
        Ok(Some(tree))
    }

    fn map_status(&self, raw: &str) -> EventStatus {
        status_for(raw)
    }

    fn map_sport(&self, code: &str) -> Option<SportRef> {
        slug_for(code).map(vocab::sport_ref)
    }

    fn map_market_type(&self, raw_key: &str) -> Option<MarketType> {
        MARKET_TABLE.iter().find(|(k, _)| *k == raw_key).map(|(_, t)| *t)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> FixturesResponse {
        serde_json::from_value(json!({
            "sportId": 29, "last": 1780000000,
            "league": [
                {"id": 1980, "name": "England - Premier League", "events": [
                    {"id": 1601, "starts": "2026-06-01T19:00:00Z", "home": "Arsenal", "away": "Chelsea", "liveStatus": 1, "status": "O"},
                    {"id": 1602, "starts": "2026-06-02T19:00:00Z", "home": "Everton", "away": "Fulham", "liveStatus": 2, "status": "O"},
                    {"id": 1603, "starts": "2026-06-01T19:00:00Z", "home": "Arsenal (Corners)", "away": "Chelsea (Corners)", "parentId": 1601}
                ]},
                {"id": 2000, "name": "Friendlies", "events": [
                    {"id": 1700, "starts": "2026-06-01T12:00:00Z", "home": "TBA", "away": "B"}
                ]}
            ]
        }))
        .unwrap()
    }

    fn states() -> HashMap<i64, InRunningEvent> {
        index_states(
            serde_json::from_value(json!({
                "sports": [{"id": 29, "leagues": [{"id": 1980, "events": [{"id": 1601, "state": 3, "elapsed": 67}]}]}]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_tree_and_inrunning_states() {
        let (tree, rejected) = build_tree("29", fixtures(), &states()).unwrap();
        assert_eq!(rejected, 2);
        assert_eq!(tree.competitions.len(), 1);
        let comp = &tree.competitions[0];
        assert_eq!(comp.competition.country.as_deref(), Some("England"));

        let live = &comp.events[0];
        assert_eq!(live.status, EventStatus::Live);
        assert_eq!(live.raw_status, "state:3");
        assert_eq!(live.timer.as_deref(), Some("2H 67'"));
        assert_eq!(live.elapsed_minutes, Some(67));
        assert_eq!(comp.events[1].status, EventStatus::Upcoming);
    }

    #[test]
    fn test_status_tokens() {
        assert_eq!(status_for("prematch"), EventStatus::Upcoming);
        assert_eq!(status_for("live"), EventStatus::Live);
        assert_eq!(status_for("state:9"), EventStatus::Ended);
        assert_eq!(status_for("state:99"), EventStatus::Upcoming);
    }

    #[test]
    fn test_parse_period_odds() {
        let resp: OddsResponse = serde_json::from_value(json!({
            "sportId": 29, "last": 1,
            "leagues": [{"id": 1980, "events": [{"id": 1601, "periods": [
                {"lineId": 1, "number": 0,
                 "moneyline": {"home": 1.95, "away": 4.1, "draw": 3.55},
                 "spreads": [{"hdp": -0.5, "home": 1.93, "away": 1.98}, {"hdp": -0.75, "home": 2.2, "away": 1.7}],
                 "totals": [{"points": 2.5, "over": 1.9, "under": 1.99}]},
                {"lineId": 2, "number": 1, "moneyline": {"home": 2.6, "away": 4.8, "draw": 2.1}},
                {"lineId": 3, "number": 3, "moneyline": {"home": 2.0, "away": 2.0}}
            ]}]}]
        }))
        .unwrap();
        let odds = parse_odds_response("1601", resp).unwrap();
        assert_eq!(odds.markets.len(), 5);
        assert_eq!(odds.markets[0].period, None);
        assert_eq!(odds.markets[1].line, Some(-0.5));
        assert_eq!(odds.markets[1].selections[1].handicap, Some(0.5));
        let h1 = odds.markets.last().unwrap();
        assert_eq!(h1.period.as_deref(), Some("H1"));
        assert_eq!(h1.selections.len(), 3);
    }

    #[test]
    fn test_unknown_event_has_no_odds() {
        let resp: OddsResponse = serde_json::from_value(json!({"leagues": []})).unwrap();
        assert_eq!(parse_odds_response("1601", resp), None);
    }
}
