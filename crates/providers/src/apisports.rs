/// API-Sports adapter.
///
/// One host per sport, one request budget shared across them:
///   football  - v3, `/fixtures?live=all`, `/fixtures?date=`, `/odds?fixture=`
///   others    - v1, `/games?live=all`, `/games?date=`
///
/// Auth: `x-apisports-key` header. Throttling can also arrive as a 200 with
/// an `errors.rateLimit` entry.
use async_trait::async_trait;
use chrono::NaiveDate;
use feed_model::{Clock, EventStatus, FeedError, FeedResult, MarketType, Scores, StopFlag};
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::warn;

use crate::{
    collect_records, flex, require_teams, rfc3339_to_utc, unix_to_utc, vocab, AdapterConfig, Auth,
    CompetitionRef, EventBatch, ProviderAdapter, ProviderEvent, ProviderHttp, ProviderMarket, ProviderSelection,
    RateLimitConfig, RateLimiter, RawOdds, SportPlan, SportRef,
};

pub const PROVIDER: &str = "apisports";

// (sport key, canonical slug, tier, default host)
const SPORT_TABLE: &[(&str, &str, u8, &str)] = &[
    ("football", "football", 1, "https://v3.football.api-sports.io"),
    ("basketball", "basketball", 1, "https://v1.basketball.api-sports.io"),
    ("hockey", "ice-hockey", 2, "https://v1.hockey.api-sports.io"),
    ("baseball", "baseball", 3, "https://v1.baseball.api-sports.io"),
    ("volleyball", "volleyball", 3, "https://v1.volleyball.api-sports.io"),
    ("handball", "handball", 3, "https://v1.handball.api-sports.io"),
];

const STATUS_TABLE: &[(&str, EventStatus)] = &[
    ("TBD", EventStatus::Upcoming),
    ("NS", EventStatus::Upcoming),
    ("1H", EventStatus::Live),
    ("HT", EventStatus::Live),
    ("2H", EventStatus::Live),
    ("ET", EventStatus::Live),
    ("BT", EventStatus::Live),
    ("P", EventStatus::Live),
    ("PT", EventStatus::Live),
    ("SUSP", EventStatus::Live),
    ("INT", EventStatus::Live),
    ("INTR", EventStatus::Live),
    ("LIVE", EventStatus::Live),
    ("Q1", EventStatus::Live),
    ("Q2", EventStatus::Live),
    ("Q3", EventStatus::Live),
    ("Q4", EventStatus::Live),
    ("OT", EventStatus::Live),
    ("P1", EventStatus::Live),
    ("P2", EventStatus::Live),
    ("P3", EventStatus::Live),
    ("FT", EventStatus::Ended),
    ("AET", EventStatus::Ended),
    ("PEN", EventStatus::Ended),
    ("AOT", EventStatus::Ended),
    ("AP", EventStatus::Ended),
    ("AWD", EventStatus::Ended),
    ("WO", EventStatus::Ended),
    ("PST", EventStatus::Postponed),
    ("POST", EventStatus::Postponed),
    ("CANC", EventStatus::Cancelled),
    ("ABD", EventStatus::Cancelled),
];

// football bet id → (type, period, name). Other sports carry no odds here.
const BET_TABLE: &[(&str, MarketType, Option<&str>, &str)] = &[
    ("1", MarketType::Moneyline, None, "Match Winner"),
    ("4", MarketType::Spread, None, "Asian Handicap"),
    ("5", MarketType::Total, None, "Goals Over/Under"),
    ("6", MarketType::Total, Some("H1"), "Goals Over/Under First Half"),
    ("13", MarketType::Moneyline, Some("H1"), "First Half Winner"),
];

fn status_for(raw: &str) -> EventStatus {
    STATUS_TABLE
        .iter()
        .find(|(code, _)| code.eq_ignore_ascii_case(raw))
        .map(|(_, s)| *s)
        .unwrap_or(EventStatus::Upcoming)
}

fn slug_for(key: &str) -> Option<&'static str> {
    SPORT_TABLE.iter().find(|(k, ..)| *k == key).map(|(_, slug, ..)| *slug)
}

// ── Raw payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope {
    /// `[]` when fine, an object keyed by error kind otherwise.
    #[serde(default)]
    errors: Value,
    #[serde(default)]
    response: Vec<Value>,
    #[serde(default)]
    paging: Option<Paging>,
}

#[derive(Debug, Deserialize)]
struct Paging {
    #[serde(default)]
    current: u32,
    #[serde(default)]
    total: u32,
}

#[derive(Debug, PartialEq)]
enum EnvelopeError {
    RateLimited,
    Api(String),
}

impl Envelope {
    fn error(&self) -> Option<EnvelopeError> {
        let obj = self.errors.as_object().filter(|o| !o.is_empty())?;
        if obj.contains_key("rateLimit") || obj.contains_key("requests") {
            return Some(EnvelopeError::RateLimited);
        }
        Some(EnvelopeError::Api(Value::Object(obj.clone()).to_string()))
    }

    fn has_more(&self) -> bool {
        self.paging.as_ref().map_or(false, |p| p.current < p.total)
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    short: String,
    #[serde(default)]
    elapsed: Option<u32>,
    #[serde(default, deserialize_with = "flex::opt_string")]
    timer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiLeague {
    #[serde(deserialize_with = "flex::string")]
    id: String,
    name: String,
    #[serde(default)]
    country: Option<Value>,
}

impl ApiLeague {
    /// Football sends a country name; the game APIs nest `{name}` or omit it.
    fn country(&self, fallback: Option<&Value>) -> Option<String> {
        let pick = |v: &Value| match v {
            Value::String(s) => Some(s.clone()),
            Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
            _ => None,
        };
        self.country.as_ref().and_then(pick).or_else(|| fallback.and_then(pick))
    }
}

#[derive(Debug, Deserialize)]
struct ApiTeam {
    name: String,
    #[serde(default)]
    logo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiTeams {
    home: ApiTeam,
    away: ApiTeam,
}

#[derive(Debug, Deserialize)]
struct ApiPair {
    home: Option<i32>,
    away: Option<i32>,
}

impl ApiPair {
    fn scores(&self) -> Option<Scores> {
        Some(Scores::new(self.home?, self.away?))
    }
}

/// Football shape: fixture meta nested under `fixture`, goals at top level.
#[derive(Debug, Deserialize)]
struct FixtureRow {
    fixture: FixtureMeta,
    league: ApiLeague,
    teams: ApiTeams,
    #[serde(default)]
    goals: Option<ApiPair>,
    #[serde(default)]
    score: Option<FixtureScore>,
}

#[derive(Debug, Deserialize)]
struct FixtureMeta {
    #[serde(deserialize_with = "flex::string")]
    id: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    status: ApiStatus,
}

#[derive(Debug, Deserialize)]
struct FixtureScore {
    #[serde(default)]
    halftime: Option<ApiPair>,
}

/// Game shape (basketball, hockey...): flat meta, `scores` per side.
#[derive(Debug, Deserialize)]
struct GameRow {
    #[serde(deserialize_with = "flex::string")]
    id: String,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    timestamp: Option<i64>,
    status: ApiStatus,
    league: ApiLeague,
    #[serde(default)]
    country: Option<Value>,
    teams: ApiTeams,
    #[serde(default)]
    scores: Option<GameScores>,
}

#[derive(Debug, Deserialize)]
struct GameScores {
    home: Value,
    away: Value,
}

// ── Parsing ──────────────────────────────────────────────────────────────────

fn start_time(date: Option<&str>, timestamp: Option<i64>) -> FeedResult<chrono::DateTime<chrono::Utc>> {
    match (timestamp, date) {
        (Some(ts), _) => unix_to_utc(PROVIDER, ts),
        (None, Some(d)) => rfc3339_to_utc(PROVIDER, d),
        (None, None) => Err(FeedError::parse(PROVIDER, "event has no start time")),
    }
}

fn parse_fixture(row: FixtureRow) -> FeedResult<ProviderEvent> {
    require_teams(PROVIDER, &row.teams.home.name, &row.teams.away.name)?;
    let status = status_for(&row.fixture.status.short);
    let start_time = start_time(row.fixture.date.as_deref(), row.fixture.timestamp)?;
    let mut period_scores = BTreeMap::new();
    if let Some(ht) = row.score.as_ref().and_then(|s| s.halftime.as_ref()).and_then(ApiPair::scores) {
        period_scores.insert("H1".to_string(), ht);
    }
    let elapsed = row.fixture.status.elapsed;
    Ok(ProviderEvent {
        provider: PROVIDER,
        provider_event_id: row.fixture.id,
        sport: vocab::sport_ref("football"),
        competition: CompetitionRef {
            country: row.league.country(None),
            key: row.league.id,
            name: row.league.name,
        },
        home_team: row.teams.home.name.trim().to_string(),
        away_team: row.teams.away.name.trim().to_string(),
        home_logo: row.teams.home.logo,
        away_logo: row.teams.away.logo,
        start_time,
        status,
        raw_status: row.fixture.status.short,
        scores: row.goals.as_ref().and_then(ApiPair::scores),
        timer: elapsed.map(|m| format!("{m}'")),
        elapsed_minutes: elapsed,
        period_scores,
        markets: Vec::new(),
    })
}

/// A side's score: bare number (hockey), or an object with `total` and
/// per-period entries (basketball).
fn side_total(v: &Value) -> Option<i32> {
    match v {
        Value::Number(n) => n.as_i64().map(|n| n as i32),
        Value::Object(o) => o.get("total").and_then(Value::as_i64).map(|n| n as i32),
        _ => None,
    }
}

fn side_period(v: &Value, key: &str) -> Option<i32> {
    v.get(key).and_then(Value::as_i64).map(|n| n as i32)
}

fn parse_game(slug: &'static str, row: GameRow) -> FeedResult<ProviderEvent> {
    require_teams(PROVIDER, &row.teams.home.name, &row.teams.away.name)?;
    let status = status_for(&row.status.short);
    let start_time = start_time(row.date.as_deref(), row.timestamp)?;

    let mut scores = None;
    let mut period_scores = BTreeMap::new();
    if let Some(s) = &row.scores {
        scores = match (side_total(&s.home), side_total(&s.away)) {
            (Some(h), Some(a)) => Some(Scores::new(h, a)),
            _ => None,
        };
        for (key, code) in [("quarter_1", "Q1"), ("quarter_2", "Q2"), ("quarter_3", "Q3"), ("quarter_4", "Q4")] {
            if let (Some(h), Some(a)) = (side_period(&s.home, key), side_period(&s.away, key)) {
                period_scores.insert(code.to_string(), Scores::new(h, a));
            }
        }
    }

    let timer = match (&row.status.timer, status) {
        (Some(t), EventStatus::Live) => Some(format!("{} {t}'", row.status.short)),
        (None, EventStatus::Live) => Some(row.status.short.clone()),
        _ => None,
    };
    Ok(ProviderEvent {
        provider: PROVIDER,
        provider_event_id: row.id,
        sport: vocab::sport_ref(slug),
        competition: CompetitionRef {
            country: row.league.country(row.country.as_ref()),
            key: row.league.id,
            name: row.league.name,
        },
        home_team: row.teams.home.name.trim().to_string(),
        away_team: row.teams.away.name.trim().to_string(),
        home_logo: row.teams.home.logo,
        away_logo: row.teams.away.logo,
        start_time,
        status,
        raw_status: row.status.short,
        scores,
        timer,
        elapsed_minutes: row.status.timer.as_deref().and_then(|t| t.parse().ok()),
        period_scores,
        markets: Vec::new(),
    })
}

fn parse_rows(sport_key: &str, rows: Vec<Value>) -> FeedResult<EventBatch> {
    let slug = slug_for(sport_key).ok_or_else(|| FeedError::parse(PROVIDER, format!("unknown sport {sport_key}")))?;
    Ok(if sport_key == "football" {
        collect_records::<FixtureRow, _>(PROVIDER, rows, parse_fixture)
    } else {
        collect_records::<GameRow, _>(PROVIDER, rows, |row| parse_game(slug, row))
    })
}

/// Odds value labels look like "Home", "Draw", "Over 2.5", "Home -1".
fn parse_bet(bet: &Value) -> Vec<ProviderMarket> {
    let Some(bet_id) = bet.get("id").map(|v| match v {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }) else {
        return Vec::new();
    };
    let Some(&(_, market_type, period, name)) = BET_TABLE.iter().find(|(id, ..)| *id == bet_id) else {
        return Vec::new();
    };
    let values = bet.get("values").and_then(Value::as_array).cloned().unwrap_or_default();

    // one market per line; moneylines have a single unnamed line
    let mut by_line: BTreeMap<String, ProviderMarket> = BTreeMap::new();
    for v in &values {
        let Some(label) = v.get("value").and_then(Value::as_str) else { continue };
        let Some(odds) = v.get("odd").and_then(vocab::parse_odds) else { continue };
        let outcome = vocab::canonical_outcome(label, "", "");
        let number = vocab::trailing_number(label);
        let (line, handicap) = match market_type {
            MarketType::Moneyline => (None, None),
            MarketType::Spread => {
                let Some(h) = number else { continue };
                let home_line = if outcome == "AWAY" { -h } else { h };
                (Some(home_line), Some(h))
            }
            _ => {
                let Some(l) = number else { continue };
                (Some(l), None)
            }
        };
        let key = line.map(|l| format!("{l}")).unwrap_or_default();
        let market = by_line.entry(key).or_insert_with(|| ProviderMarket {
            raw_key: bet_id.clone(),
            name: Some(name.to_string()),
            market_type: Some(market_type),
            period: period.map(str::to_string),
            line,
            selections: Vec::new(),
        });
        market.selections.push(ProviderSelection { label: label.to_string(), outcome, odds, handicap });
    }
    by_line.into_values().filter(|m| m.selections.len() >= 2).collect()
}

fn parse_odds_response(event_id: &str, response: &[Value]) -> Option<RawOdds> {
    let bookmaker = response.first()?.get("bookmakers")?.as_array()?.first()?;
    let bets = bookmaker.get("bets")?.as_array()?;
    let markets: Vec<_> = bets.iter().flat_map(parse_bet).collect();
    if markets.is_empty() {
        return None;
    }
    Some(RawOdds { provider_event_id: event_id.to_string(), markets })
}

// ── Adapter ──────────────────────────────────────────────────────────────────

pub struct ApiSportsAdapter {
    hosts: HashMap<&'static str, ProviderHttp>,
    limiter: Arc<RateLimiter>,
    max_pages: u32,
}

impl ApiSportsAdapter {
    /// A `base_url` override points every sport at the same host.
    pub fn new(config: AdapterConfig, clock: Arc<dyn Clock>) -> Self {
        let limits = config.limits.unwrap_or(RateLimitConfig::new(10, 100));
        let limiter = Arc::new(RateLimiter::new(PROVIDER, limits, clock));
        let hosts = SPORT_TABLE
            .iter()
            .map(|(key, _, _, host)| {
                let base = config.base_url.clone().unwrap_or_else(|| host.to_string());
                let auth = Auth::Header { name: "x-apisports-key", value: config.credential.clone() };
                (*key, ProviderHttp::new(PROVIDER, base, auth, limiter.clone(), config.http))
            })
            .collect();
        Self { hosts, limiter, max_pages: config.max_pages.max(1) }
    }

    fn host(&self, sport_key: &str) -> FeedResult<&ProviderHttp> {
        self.hosts
            .get(sport_key)
            .ok_or_else(|| FeedError::parse(PROVIDER, format!("unknown sport {sport_key}")))
    }

    fn list_path(sport_key: &str) -> &'static str {
        if sport_key == "football" {
            "/fixtures"
        } else {
            "/games"
        }
    }

    async fn get(&self, sport_key: &str, path: &str, query: &[(&str, String)]) -> FeedResult<Envelope> {
        let env: Envelope = self.host(sport_key)?.get_json(path, query).await?;
        match env.error() {
            None => Ok(env),
            Some(EnvelopeError::RateLimited) => {
                self.limiter.record_too_many_requests();
                Err(FeedError::RateLimited { provider: PROVIDER.to_string() })
            }
            Some(EnvelopeError::Api(msg)) => Err(FeedError::parse(PROVIDER, format!("api error: {msg}"))),
        }
    }
}

#[async_trait]
impl ProviderAdapter for ApiSportsAdapter {
    fn name(&self) -> &'static str {
        PROVIDER
    }

    fn sports(&self) -> Vec<SportPlan> {
        SPORT_TABLE
            .iter()
            .map(|(key, slug, tier, _)| SportPlan { key: key.to_string(), slug: slug.to_string(), tier: *tier })
            .collect()
    }

    fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn supports_odds(&self) -> bool {
        true
    }

    async fn fetch_in_play(&self, sport_key: &str) -> FeedResult<EventBatch> {
        let env = self.get(sport_key, Self::list_path(sport_key), &[("live", "all".to_string())]).await?;
        parse_rows(sport_key, env.response)
    }

    async fn fetch_upcoming(&self, sport_key: &str, day: NaiveDate, stop: &StopFlag) -> FeedResult<EventBatch> {
        let mut batch = EventBatch::default();
        for page in 1..=self.max_pages {
            if stop.is_stopped() {
                break;
            }
            let mut query = vec![("date", day.format("%Y-%m-%d").to_string())];
            if page > 1 {
                query.push(("page", page.to_string()));
            }
            let env = match self.get(sport_key, Self::list_path(sport_key), &query).await {
                Ok(env) => env,
                Err(e) if page > 1 => {
                    warn!(provider = PROVIDER, sport_key, page, "upcoming pagination stopped: {e}");
                    break;
                }
                Err(e) => return Err(e),
            };
            let more = env.has_more();
            batch.extend(parse_rows(sport_key, env.response)?);
            if !more {
                break;
            }
        }
        Ok(batch)
    }

    async fn fetch_odds(&self, sport_key: &str, event_id: &str) -> FeedResult<Option<RawOdds>> {
        if sport_key != "football" {
            return Ok(None);
        }
        let env = self.get(sport_key, "/odds", &[("fixture", event_id.to_string())]).await?;
        Ok(parse_odds_response(event_id, &env.response))
    }

    fn map_status(&self, raw: &str) -> EventStatus {
        status_for(raw)
    }

    fn map_sport(&self, code: &str) -> Option<SportRef> {
        slug_for(code).map(vocab::sport_ref)
    }

    fn map_market_type(&self, raw_key: &str) -> Option<MarketType> {
        BET_TABLE.iter().find(|(id, ..)| *id == raw_key).map(|(_, t, ..)| *t)
    }
}
