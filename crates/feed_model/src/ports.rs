//! Collaborator contracts. The pipeline only talks to persistence, fan-out and
//! the job runner through these traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::StoreResult;
use crate::types::{
    Competition, CompetitionUpsert, Event, EventDraft, Market, MarketStatus, MarketUpsert, Selection,
    SelectionStatus, SelectionUpsert, Sport, SportUpsert, StaleCriteria,
};

// ── Store ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait Store: Send + Sync {
    async fn upsert_sport(&self, sport: SportUpsert) -> StoreResult<Sport>;

    /// Creates the competition or returns the existing one for `(sport_id, slug)`.
    /// Name/country are only overwritten when `external_id` matches the owner.
    async fn upsert_competition(&self, competition: CompetitionUpsert) -> StoreResult<Competition>;

    /// Looks up both primary and linked external ids.
    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Event>>;

    /// Candidate events starting inside `[from, to]`. Name matching is left to the caller.
    async fn find_fuzzy(
        &self,
        home_team: &str,
        away_team: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>>;

    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>>;

    /// Fails with `StoreError::Conflict` if the external id is already taken.
    async fn create_event(&self, draft: EventDraft) -> StoreResult<Event>;

    async fn update_event(&self, event: &Event) -> StoreResult<()>;

    /// Attaches another provider's id to an existing event.
    /// Fails with `StoreError::Conflict` if the id belongs to another event.
    async fn link_external_id(&self, event_id: i64, external_id: &str) -> StoreResult<()>;

    /// Creates the market or reopens it; a SETTLED market is returned untouched.
    async fn upsert_market(&self, market: MarketUpsert) -> StoreResult<Market>;

    async fn list_markets(&self, event_id: i64) -> StoreResult<Vec<Market>>;

    async fn count_markets(&self, event_id: i64) -> StoreResult<usize>;

    /// Compare-and-set to SETTLED. Returns false if the market was already settled.
    async fn settle_market(&self, market_id: i64) -> StoreResult<bool>;

    async fn set_market_status(&self, market_id: i64, status: MarketStatus) -> StoreResult<()>;

    async fn find_selection(&self, market_id: i64, outcome: &str, params: &str) -> StoreResult<Option<Selection>>;

    /// Inserts or updates odds. Settled selections are returned unchanged.
    async fn upsert_selection(&self, selection: SelectionUpsert) -> StoreResult<Selection>;

    async fn list_selections(&self, market_id: i64) -> StoreResult<Vec<Selection>>;

    /// Returns false (and changes nothing) if the selection is already settled.
    async fn set_selection_status(&self, selection_id: i64, status: SelectionStatus) -> StoreResult<bool>;

    async fn find_stale_events(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>>;

    /// Marks every matching event ENDED and returns them as they were before the update.
    async fn bulk_mark_ended_by_staleness(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>>;

    /// Recomputes the cached non-terminal event count of every sport.
    async fn refresh_sport_counts(&self) -> StoreResult<()>;

    /// Removes placeholder events without usable team data and without markets.
    async fn delete_orphan_events(&self) -> StoreResult<usize>;
}

// ── Broadcast ────────────────────────────────────────────────────────────────

/// Best-effort fan-out. Implementations must never block or fail the caller.
pub trait Publisher: Send + Sync {
    fn publish(&self, channel: &str, event_name: &str, payload: serde_json::Value);
}

/// Publisher for environments without a transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish(&self, _channel: &str, _event_name: &str, _payload: serde_json::Value) {}
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

pub const AUTO_SETTLE_EVENT: &str = "auto-settle-event";

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Returns false when a job with the same key was enqueued inside the dedupe window.
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value, idempotency_key: &str) -> StoreResult<bool>;
}

// ── Clock ────────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock for deterministic tests and replays.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Arc::new(Mutex::new(start)) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
