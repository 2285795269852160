//! FeedSync — Providers
//!
//! One adapter per upstream feed. Every adapter fetches through its own
//! rate limiter and maps provider vocabulary (sport codes, status codes,
//! market keys, selection labels) into the canonical `ProviderEvent` shape.
//!
//!   betsapi   - in-play / paginated upcoming / odds, numeric time_status
//!   apisports - football fixtures + basketball/hockey games, short status codes
//!   oddsapi   - scores + events + bookmaker odds
//!   pinnacle  - fixtures tree, in-running states, period odds

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use feed_model::{EventStatus, FeedError, FeedResult, MarketType, Scores, StopFlag};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;

pub mod apisports;
pub mod betsapi;
pub mod http;
pub mod oddsapi;
pub mod pinnacle;
pub mod rate_limiter;
pub mod vocab;

mod flex;

pub use http::{Auth, HttpConfig, ProviderHttp};
pub use rate_limiter::{LimiterStats, RateLimitConfig, RateLimiter};

// ── Canonical shapes ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SportRef {
    pub slug: String,
    pub name: String,
    pub icon: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompetitionRef {
    /// Provider league key, unique within the provider.
    pub key: String,
    pub name: String,
    pub country: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderSelection {
    /// Label as the provider printed it.
    pub label: String,
    /// HOME / AWAY / DRAW / OVER / UNDER / named outcome.
    pub outcome: String,
    pub odds: f64,
    pub handicap: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderMarket {
    pub raw_key: String,
    pub name: Option<String>,
    /// Set when the adapter's own table recognised the key.
    pub market_type: Option<MarketType>,
    /// Canonical period code (`H1`, `Q2`, `P1`...); `None` for the full event.
    pub period: Option<String>,
    pub line: Option<f64>,
    pub selections: Vec<ProviderSelection>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderEvent {
    pub provider: &'static str,
    pub provider_event_id: String,
    pub sport: SportRef,
    pub competition: CompetitionRef,
    pub home_team: String,
    pub away_team: String,
    pub home_logo: Option<String>,
    pub away_logo: Option<String>,
    pub start_time: DateTime<Utc>,
    pub status: EventStatus,
    /// Status token before mapping, kept for logs.
    pub raw_status: String,
    pub scores: Option<Scores>,
    pub timer: Option<String>,
    pub elapsed_minutes: Option<u32>,
    pub period_scores: BTreeMap<String, Scores>,
    /// Inline odds when the feed ships them with the event.
    pub markets: Vec<ProviderMarket>,
}

impl ProviderEvent {
    pub fn external_id(&self) -> String {
        feed_model::external_id(self.provider, &self.provider_event_id)
    }

    pub fn score_string(&self) -> Option<String> {
        self.scores.map(|s| s.to_string())
    }

    pub fn is_live(&self) -> bool {
        self.status == EventStatus::Live
    }
}

/// Result of one list fetch; `rejected` counts records that failed to parse.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    pub events: Vec<ProviderEvent>,
    pub rejected: usize,
}

impl EventBatch {
    pub fn extend(&mut self, other: EventBatch) {
        self.events.extend(other.events);
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawOdds {
    pub provider_event_id: String,
    pub markets: Vec<ProviderMarket>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TreeCompetition {
    pub competition: CompetitionRef,
    pub events: Vec<ProviderEvent>,
}

/// Sport → competitions → events, for providers that expose the whole tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTree {
    pub sport: SportRef,
    pub competitions: Vec<TreeCompetition>,
}

impl ProviderTree {
    pub fn into_events(self) -> Vec<ProviderEvent> {
        self.competitions.into_iter().flat_map(|c| c.events).collect()
    }
}

/// A sport the adapter can poll, with its scheduling tier (1 = always polled).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SportPlan {
    pub key: String,
    pub slug: String,
    pub tier: u8,
}

/// Connection settings common to all adapters.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub credential: String,
    pub base_url: Option<String>,
    pub limits: Option<RateLimitConfig>,
    pub http: HttpConfig,
    /// Upper bound on pages fetched per upcoming call.
    pub max_pages: u32,
}

impl AdapterConfig {
    pub fn new(credential: impl Into<String>) -> Self {
        Self {
            credential: credential.into(),
            base_url: None,
            limits: None,
            http: HttpConfig::default(),
            max_pages: 5,
        }
    }
}

// ── Adapter contract ─────────────────────────────────────────────────────────

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn sports(&self) -> Vec<SportPlan>;

    fn limiter(&self) -> &Arc<RateLimiter>;

    fn supports_odds(&self) -> bool;

    async fn fetch_in_play(&self, sport_key: &str) -> FeedResult<EventBatch>;

    /// Events starting on `day`. Pagination stops early on `stop` or when
    /// the limiter refuses further pages.
    async fn fetch_upcoming(&self, sport_key: &str, day: NaiveDate, stop: &StopFlag) -> FeedResult<EventBatch>;

    /// `Ok(None)` when the provider has no odds for this sport or event.
    async fn fetch_odds(&self, sport_key: &str, event_id: &str) -> FeedResult<Option<RawOdds>>;

    async fn fetch_tree(&self, _sport_key: &str) -> FeedResult<Option<ProviderTree>> {
        Ok(None)
    }

    fn map_status(&self, raw: &str) -> EventStatus;

    fn map_sport(&self, code: &str) -> Option<SportRef>;

    fn map_market_type(&self, raw_key: &str) -> Option<MarketType>;

    fn map_selection_name(&self, raw: &str, home: &str, away: &str) -> String {
        vocab::canonical_outcome(raw, home, away)
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

/// Parses each record on its own so a single malformed one is skipped, not fatal.
pub(crate) fn collect_records<R, F>(provider: &'static str, records: Vec<serde_json::Value>, mut map: F) -> EventBatch
where
    R: DeserializeOwned,
    F: FnMut(R) -> FeedResult<ProviderEvent>,
{
    let mut batch = EventBatch::default();
    for value in records {
        let parsed = serde_json::from_value::<R>(value)
            .map_err(|e| FeedError::parse(provider, e.to_string()))
            .and_then(&mut map);
        match parsed {
            Ok(ev) => batch.events.push(ev),
            Err(e) => {
                warn!(provider, "skipping record: {e}");
                batch.rejected += 1;
            }
        }
    }
    batch
}

/// Rejects events without two real team names.
pub(crate) fn require_teams(provider: &'static str, home: &str, away: &str) -> FeedResult<()> {
    if feed_model::is_placeholder_team(home) || feed_model::is_placeholder_team(away) {
        return Err(FeedError::parse(provider, format!("placeholder teams `{home}` vs `{away}`")));
    }
    Ok(())
}

pub(crate) fn unix_to_utc(provider: &'static str, secs: i64) -> FeedResult<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| FeedError::parse(provider, format!("bad timestamp {secs}")))
}

pub(crate) fn rfc3339_to_utc(provider: &'static str, raw: &str) -> FeedResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| FeedError::parse(provider, format!("bad time `{raw}`: {e}")))
}

/// Parses "2-1" / "2:1" style scores.
pub(crate) fn parse_score_pair(raw: &str) -> Option<Scores> {
    let (h, a) = raw.trim().split_once(['-', ':'])?;
    Some(Scores::new(h.trim().parse().ok()?, a.trim().parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_score_pair() {
        assert_eq!(parse_score_pair("2-1"), Some(Scores::new(2, 1)));
        assert_eq!(parse_score_pair(" 102:99 "), Some(Scores::new(102, 99)));
        assert_eq!(parse_score_pair("-"), None);
        assert_eq!(parse_score_pair(""), None);
    }

    #[test]
    fn test_collect_records_skips_bad_rows() {
        #[derive(serde::Deserialize)]
        struct Row {
            id: u32,
        }
        let rows = vec![serde_json::json!({"id": 1}), serde_json::json!({"id": "x"}), serde_json::json!({"id": 3})];
        let batch = collect_records::<Row, _>("test", rows, |r| {
            if r.id == 3 {
                return Err(FeedError::parse("test", "three"));
            }
            Ok(ProviderEvent {
                provider: "test",
                provider_event_id: r.id.to_string(),
                sport: vocab::sport_ref("football"),
                competition: CompetitionRef { key: "1".into(), name: "L".into(), country: None },
                home_team: "A".into(),
                away_team: "B".into(),
                home_logo: None,
                away_logo: None,
                start_time: Utc::now(),
                status: EventStatus::Upcoming,
                raw_status: "0".into(),
                scores: None,
                timer: None,
                elapsed_minutes: None,
                period_scores: BTreeMap::new(),
                markets: vec![],
            })
        });
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.rejected, 2);
    }

    #[test]
    fn test_placeholder_teams_rejected() {
        assert!(require_teams("test", "TBD", "B").is_err());
        assert!(require_teams("test", "A", "B").is_ok());
    }
}
