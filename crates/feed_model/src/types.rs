use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ── Statuses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Upcoming,
    Live,
    Ended,
    Cancelled,
    Postponed,
}

impl EventStatus {
    /// Position in the lifecycle order UPCOMING < LIVE < {ENDED, CANCELLED, POSTPONED}.
    pub fn rank(self) -> u8 {
        match self {
            EventStatus::Upcoming => 0,
            EventStatus::Live => 1,
            EventStatus::Ended | EventStatus::Cancelled | EventStatus::Postponed => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventStatus::Upcoming => "UPCOMING",
            EventStatus::Live => "LIVE",
            EventStatus::Ended => "ENDED",
            EventStatus::Cancelled => "CANCELLED",
            EventStatus::Postponed => "POSTPONED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "UPCOMING" => Some(EventStatus::Upcoming),
            "LIVE" => Some(EventStatus::Live),
            "ENDED" => Some(EventStatus::Ended),
            "CANCELLED" => Some(EventStatus::Cancelled),
            "POSTPONED" => Some(EventStatus::Postponed),
            _ => None,
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketType {
    Moneyline,
    Spread,
    Total,
    Outright,
    Prop,
}

impl MarketType {
    pub fn as_str(self) -> &'static str {
        match self {
            MarketType::Moneyline => "MONEYLINE",
            MarketType::Spread => "SPREAD",
            MarketType::Total => "TOTAL",
            MarketType::Outright => "OUTRIGHT",
            MarketType::Prop => "PROP",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketStatus {
    Open,
    Suspended,
    Settled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SelectionStatus {
    Active,
    Suspended,
    Won,
    Lost,
    Void,
}

impl SelectionStatus {
    /// WON/LOST/VOID are final; nothing may touch the selection afterwards.
    pub fn is_settled(self) -> bool {
        matches!(self, SelectionStatus::Won | SelectionStatus::Lost | SelectionStatus::Void)
    }
}

// ── Entities ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scores {
    pub home: i32,
    pub away: i32,
}

impl Scores {
    pub fn new(home: i32, away: i32) -> Self {
        Self { home, away }
    }

    pub fn total(&self) -> i32 {
        self.home + self.away
    }
}

impl fmt::Display for Scores {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sport {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub icon: String,
    pub sort_order: i32,
    pub event_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: i64,
    pub sport_id: i64,
    pub slug: String,
    pub name: String,
    pub country: Option<String>,
    /// `<provider>:<leagueKey>` of the provider that first created the row.
    pub external_id: Option<String>,
}

/// Moneyline prices captured when the event first went live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreMatchOdds {
    pub home: Option<f64>,
    pub draw: Option<f64>,
    pub away: Option<f64>,
    pub captured_at: DateTime<Utc>,
}

/// Provider-opaque event details.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_minutes: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub period_scores: BTreeMap<String, Scores>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_match_odds: Option<PreMatchOdds>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub competition_id: i64,
    pub sport_slug: String,
    /// Primary dedup anchor, `<provider>:<providerEventId>`.
    pub external_id: String,
    /// Ids attached later by fuzzy claims from other providers.
    pub linked_ids: Vec<String>,
    pub home_team: String,
    pub away_team: String,
    pub home_logo: Option<String>,
    pub away_logo: Option<String>,
    pub status: EventStatus,
    pub is_live: bool,
    pub start_time: DateTime<Utc>,
    pub scores: Option<Scores>,
    pub metadata: EventMetadata,
    pub updated_at: DateTime<Utc>,
}

impl Event {
    /// True if any id owned by this event comes from `provider`.
    pub fn has_provider(&self, provider: &str) -> bool {
        let prefix = format!("{provider}:");
        self.external_id.starts_with(&prefix) || self.linked_ids.iter().any(|id| id.starts_with(&prefix))
    }

    pub fn owns_external_id(&self, external_id: &str) -> bool {
        self.external_id == external_id || self.linked_ids.iter().any(|id| id == external_id)
    }
}

pub fn external_id(provider: &str, provider_event_id: &str) -> String {
    format!("{provider}:{provider_event_id}")
}

/// Placeholder team names that never identify a real fixture.
pub fn is_placeholder_team(name: &str) -> bool {
    let trimmed = name.trim();
    trimmed.is_empty()
        || trimmed == "?"
        || trimmed.eq_ignore_ascii_case("tbd")
        || trimmed.eq_ignore_ascii_case("tba")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Market {
    pub id: i64,
    pub event_id: i64,
    /// Unique per event, e.g. `ML`, `OU2.5`, `OU2.5:H1`.
    pub market_key: String,
    pub name: String,
    pub market_type: MarketType,
    pub status: MarketStatus,
    pub period: Option<String>,
    pub line: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub id: i64,
    pub market_id: i64,
    /// HOME / AWAY / DRAW / OVER / UNDER or a named outright outcome.
    pub outcome: String,
    pub name: String,
    /// Normalized parameters (handicap / line) distinguishing same-outcome rows.
    pub params: String,
    pub odds: f64,
    pub probability: Option<f64>,
    pub handicap: Option<f64>,
    pub status: SelectionStatus,
    pub updated_at: DateTime<Utc>,
}

// ── Upsert inputs ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SportUpsert {
    pub slug: String,
    pub name: String,
    pub icon: String,
    pub sort_order: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompetitionUpsert {
    pub sport_id: i64,
    pub slug: String,
    pub name: String,
    pub country: Option<String>,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventDraft {
    pub competition_id: i64,
    pub sport_slug: String,
    pub external_id: String,
    pub home_team: String,
    pub away_team: String,
    pub home_logo: Option<String>,
    pub away_logo: Option<String>,
    pub status: EventStatus,
    pub start_time: DateTime<Utc>,
    pub scores: Option<Scores>,
    pub metadata: EventMetadata,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketUpsert {
    pub event_id: i64,
    pub market_key: String,
    pub name: String,
    pub market_type: MarketType,
    pub period: Option<String>,
    pub line: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectionUpsert {
    pub market_id: i64,
    pub outcome: String,
    pub name: String,
    pub params: String,
    pub odds: f64,
    pub probability: Option<f64>,
    pub handicap: Option<f64>,
}

/// Criteria for the stale-event sweeps.
#[derive(Debug, Clone, PartialEq)]
pub struct StaleCriteria {
    pub statuses: Vec<EventStatus>,
    /// Event started before this instant.
    pub started_before: Option<DateTime<Utc>>,
    /// Event not updated since this instant.
    pub untouched_since: Option<DateTime<Utc>>,
    /// Combine the two time conditions with OR instead of AND.
    pub match_any: bool,
}

impl StaleCriteria {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.statuses.contains(&event.status) {
            return false;
        }
        let started = self.started_before.map(|t| event.start_time < t);
        let idle = self.untouched_since.map(|t| event.updated_at < t);
        match (started, idle) {
            (None, None) => true,
            (Some(s), None) => s,
            (None, Some(i)) => i,
            (Some(s), Some(i)) if self.match_any => s || i,
            (Some(s), Some(i)) => s && i,
        }
    }
}

pub fn slugify(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut dash = false;
    for c in raw.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out
}
