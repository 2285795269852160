//! In-memory implementations of the ports, used by tests and dry runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::error::{StoreError, StoreResult};
use crate::ports::{Clock, JobQueue, Publisher, Store, SystemClock};
use crate::types::{
    is_placeholder_team, Competition, CompetitionUpsert, Event, EventDraft, EventStatus, Market, MarketStatus,
    MarketUpsert, Selection, SelectionStatus, SelectionUpsert, Sport, SportUpsert, StaleCriteria,
};

#[derive(Default)]
struct Tables {
    next_id: i64,
    sports: Vec<Sport>,
    competitions: Vec<Competition>,
    events: HashMap<i64, Event>,
    markets: HashMap<i64, Market>,
    selections: HashMap<i64, Selection>,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn event_by_external(&self, external_id: &str) -> Option<&Event> {
        self.events.values().find(|e| e.owns_external_id(external_id))
    }
}

pub struct MemoryStore {
    tables: tokio::sync::Mutex<Tables>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { tables: tokio::sync::Mutex::new(Tables::default()), clock }
    }

    pub async fn all_events(&self) -> Vec<Event> {
        let t = self.tables.lock().await;
        let mut events: Vec<Event> = t.events.values().cloned().collect();
        events.sort_by_key(|e| e.id);
        events
    }

    pub async fn sports(&self) -> Vec<Sport> {
        self.tables.lock().await.sports.clone()
    }

    pub async fn competitions(&self) -> Vec<Competition> {
        self.tables.lock().await.competitions.clone()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_sport(&self, sport: SportUpsert) -> StoreResult<Sport> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t.sports.iter_mut().find(|s| s.slug == sport.slug) {
            existing.name = sport.name;
            existing.icon = sport.icon;
            existing.sort_order = sport.sort_order;
            return Ok(existing.clone());
        }
        let id = t.next_id();
        let row = Sport {
            id,
            slug: sport.slug,
            name: sport.name,
            icon: sport.icon,
            sort_order: sport.sort_order,
            event_count: 0,
        };
        t.sports.push(row.clone());
        Ok(row)
    }

    async fn upsert_competition(&self, c: CompetitionUpsert) -> StoreResult<Competition> {
        let mut t = self.tables.lock().await;
        if let Some(existing) = t.competitions.iter_mut().find(|x| x.sport_id == c.sport_id && x.slug == c.slug) {
            let authoritative = existing.external_id.is_none() || existing.external_id == c.external_id;
            if authoritative {
                existing.name = c.name;
                existing.country = c.country.or(existing.country.take());
                if existing.external_id.is_none() {
                    existing.external_id = c.external_id;
                }
            }
            return Ok(existing.clone());
        }
        let id = t.next_id();
        let row = Competition {
            id,
            sport_id: c.sport_id,
            slug: c.slug,
            name: c.name,
            country: c.country,
            external_id: c.external_id,
        };
        t.competitions.push(row.clone());
        Ok(row)
    }

    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Event>> {
        let t = self.tables.lock().await;
        Ok(t.event_by_external(external_id).cloned())
    }

    async fn find_fuzzy(
        &self,
        _home_team: &str,
        _away_team: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>> {
        let t = self.tables.lock().await;
        let mut found: Vec<Event> =
            t.events.values().filter(|e| e.start_time >= from && e.start_time <= to).cloned().collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        Ok(self.tables.lock().await.events.get(&event_id).cloned())
    }

    async fn create_event(&self, d: EventDraft) -> StoreResult<Event> {
        let mut t = self.tables.lock().await;
        if t.event_by_external(&d.external_id).is_some() {
            return Err(StoreError::Conflict { entity: "event", key: d.external_id });
        }
        let id = t.next_id();
        let now = self.clock.now();
        let row = Event {
            id,
            competition_id: d.competition_id,
            sport_slug: d.sport_slug,
            external_id: d.external_id,
            linked_ids: Vec::new(),
            home_team: d.home_team,
            away_team: d.away_team,
            home_logo: d.home_logo,
            away_logo: d.away_logo,
            is_live: d.status == EventStatus::Live,
            status: d.status,
            start_time: d.start_time,
            scores: d.scores,
            metadata: d.metadata,
            updated_at: now,
        };
        t.events.insert(id, row.clone());
        Ok(row)
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        match t.events.get_mut(&event.id) {
            Some(slot) => {
                *slot = event.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound { entity: "event", id: event.id.to_string() }),
        }
    }

    async fn link_external_id(&self, event_id: i64, external_id: &str) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        if let Some(owner) = t.event_by_external(external_id) {
            if owner.id == event_id {
                return Ok(());
            }
            return Err(StoreError::Conflict { entity: "event", key: external_id.to_string() });
        }
        let now = self.clock.now();
        let ev = t
            .events
            .get_mut(&event_id)
            .ok_or_else(|| StoreError::NotFound { entity: "event", id: event_id.to_string() })?;
        ev.linked_ids.push(external_id.to_string());
        ev.updated_at = now;
        Ok(())
    }

    async fn upsert_market(&self, m: MarketUpsert) -> StoreResult<Market> {
        let mut t = self.tables.lock().await;
        let now = self.clock.now();
        if let Some(existing) =
            t.markets.values_mut().find(|x| x.event_id == m.event_id && x.market_key == m.market_key)
        {
            if existing.status != MarketStatus::Settled {
                existing.status = MarketStatus::Open;
                existing.name = m.name;
                existing.updated_at = now;
            }
            return Ok(existing.clone());
        }
        let id = t.next_id();
        let row = Market {
            id,
            event_id: m.event_id,
            market_key: m.market_key,
            name: m.name,
            market_type: m.market_type,
            status: MarketStatus::Open,
            period: m.period,
            line: m.line,
            updated_at: now,
        };
        t.markets.insert(id, row.clone());
        Ok(row)
    }

    async fn list_markets(&self, event_id: i64) -> StoreResult<Vec<Market>> {
        let t = self.tables.lock().await;
        let mut found: Vec<Market> = t.markets.values().filter(|m| m.event_id == event_id).cloned().collect();
        found.sort_by_key(|m| m.id);
        Ok(found)
    }

    async fn count_markets(&self, event_id: i64) -> StoreResult<usize> {
        let t = self.tables.lock().await;
        Ok(t.markets.values().filter(|m| m.event_id == event_id).count())
    }

    async fn settle_market(&self, market_id: i64) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let now = self.clock.now();
        let m = t
            .markets
            .get_mut(&market_id)
            .ok_or_else(|| StoreError::NotFound { entity: "market", id: market_id.to_string() })?;
        if m.status == MarketStatus::Settled {
            return Ok(false);
        }
        m.status = MarketStatus::Settled;
        m.updated_at = now;
        Ok(true)
    }

    async fn set_market_status(&self, market_id: i64, status: MarketStatus) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let m = t
            .markets
            .get_mut(&market_id)
            .ok_or_else(|| StoreError::NotFound { entity: "market", id: market_id.to_string() })?;
        if m.status != MarketStatus::Settled {
            m.status = status;
        }
        Ok(())
    }

    async fn find_selection(&self, market_id: i64, outcome: &str, params: &str) -> StoreResult<Option<Selection>> {
        let t = self.tables.lock().await;
        Ok(t
            .selections
            .values()
            .find(|s| s.market_id == market_id && s.outcome == outcome && s.params == params)
            .cloned())
    }

    async fn upsert_selection(&self, s: SelectionUpsert) -> StoreResult<Selection> {
        let mut t = self.tables.lock().await;
        let now = self.clock.now();
        if let Some(existing) = t
            .selections
            .values_mut()
            .find(|x| x.market_id == s.market_id && x.outcome == s.outcome && x.params == s.params)
        {
            if !existing.status.is_settled() {
                existing.odds = s.odds;
                existing.probability = s.probability;
                existing.name = s.name;
                existing.status = SelectionStatus::Active;
                existing.updated_at = now;
            }
            return Ok(existing.clone());
        }
        let id = t.next_id();
        let row = Selection {
            id,
            market_id: s.market_id,
            outcome: s.outcome,
            name: s.name,
            params: s.params,
            odds: s.odds,
            probability: s.probability,
            handicap: s.handicap,
            status: SelectionStatus::Active,
            updated_at: now,
        };
        t.selections.insert(id, row.clone());
        Ok(row)
    }

    async fn list_selections(&self, market_id: i64) -> StoreResult<Vec<Selection>> {
        let t = self.tables.lock().await;
        let mut found: Vec<Selection> = t.selections.values().filter(|s| s.market_id == market_id).cloned().collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    async fn set_selection_status(&self, selection_id: i64, status: SelectionStatus) -> StoreResult<bool> {
        let mut t = self.tables.lock().await;
        let now = self.clock.now();
        let s = t
            .selections
            .get_mut(&selection_id)
            .ok_or_else(|| StoreError::NotFound { entity: "selection", id: selection_id.to_string() })?;
        if s.status.is_settled() {
            return Ok(false);
        }
        s.status = status;
        s.updated_at = now;
        Ok(true)
    }

    async fn find_stale_events(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>> {
        let t = self.tables.lock().await;
        let mut found: Vec<Event> = t.events.values().filter(|e| criteria.matches(e)).cloned().collect();
        found.sort_by_key(|e| e.id);
        Ok(found)
    }

    async fn bulk_mark_ended_by_staleness(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>> {
        let mut t = self.tables.lock().await;
        let now = self.clock.now();
        let mut before = Vec::new();
        for ev in t.events.values_mut() {
            if criteria.matches(ev) {
                before.push(ev.clone());
                ev.status = EventStatus::Ended;
                ev.is_live = false;
                ev.updated_at = now;
            }
        }
        before.sort_by_key(|e| e.id);
        Ok(before)
    }

    async fn refresh_sport_counts(&self) -> StoreResult<()> {
        let mut t = self.tables.lock().await;
        let mut counts: HashMap<String, i64> = HashMap::new();
        for ev in t.events.values().filter(|e| !e.status.is_terminal()) {
            *counts.entry(ev.sport_slug.clone()).or_default() += 1;
        }
        for sport in t.sports.iter_mut() {
            sport.event_count = counts.get(&sport.slug).copied().unwrap_or(0);
        }
        Ok(())
    }

    async fn delete_orphan_events(&self) -> StoreResult<usize> {
        let mut t = self.tables.lock().await;
        let with_markets: Vec<i64> = t.markets.values().map(|m| m.event_id).collect();
        let orphans: Vec<i64> = t
            .events
            .values()
            .filter(|e| is_placeholder_team(&e.home_team) || is_placeholder_team(&e.away_team))
            .filter(|e| !with_markets.contains(&e.id))
            .map(|e| e.id)
            .collect();
        for id in &orphans {
            t.events.remove(id);
        }
        Ok(orphans.len())
    }
}

// ── Publisher ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub channel: String,
    pub event_name: String,
    pub payload: serde_json::Value,
}

/// Keeps every broadcast for later inspection.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    messages: Mutex<Vec<Published>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<Published> {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn named(&self, event_name: &str) -> Vec<Published> {
        self.messages().into_iter().filter(|m| m.event_name == event_name).collect()
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, channel: &str, event_name: &str, payload: serde_json::Value) {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).push(Published {
            channel: channel.to_string(),
            event_name: event_name.to_string(),
            payload,
        });
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct EnqueuedJob {
    pub job_type: String,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub enqueued_at: DateTime<Utc>,
}

pub struct MemoryJobQueue {
    jobs: Mutex<Vec<EnqueuedJob>>,
    dedupe_window: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryJobQueue {
    pub fn new(clock: Arc<dyn Clock>, dedupe_window: chrono::Duration) -> Self {
        Self { jobs: Mutex::new(Vec::new()), dedupe_window, clock }
    }

    pub fn jobs(&self) -> Vec<EnqueuedJob> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value, idempotency_key: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let duplicate = jobs
            .iter()
            .any(|j| j.idempotency_key == idempotency_key && now - j.enqueued_at < self.dedupe_window);
        if duplicate {
            return Ok(false);
        }
        jobs.push(EnqueuedJob {
            job_type: job_type.to_string(),
            payload,
            idempotency_key: idempotency_key.to_string(),
            enqueued_at: now,
        });
        Ok(true)
    }
}
