//! SQLite-backed `Store` and `JobQueue`.
//!
//! One connection behind a mutex; every call runs on the blocking pool.
//! Unique indexes back the dedup keys and surface as `StoreError::Conflict`.
//! Timestamps are stored as unix milliseconds, enums as their wire names.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use feed_model::{
    is_placeholder_team, Clock, Competition, CompetitionUpsert, Event, EventDraft, EventMetadata, EventStatus,
    JobQueue, Market, MarketStatus, MarketUpsert, Scores, Selection, SelectionStatus, SelectionUpsert, Sport,
    SportUpsert, StaleCriteria, Store, StoreError, StoreResult,
};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

const EVENT_COLUMNS: &str = "id, competition_id, sport_slug, external_id, home_team, away_team, home_logo, away_logo, \
     status, is_live, start_time, score_home, score_away, metadata, updated_at";
const MARKET_COLUMNS: &str = "id, event_id, market_key, name, market_type, status, period, line, updated_at";
const SELECTION_COLUMNS: &str =
    "id, market_id, outcome, name, params, odds, probability, handicap, status, updated_at";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
    job_window: Duration,
}

impl SqliteStore {
    pub fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let db_path = Path::new(path);
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path).with_context(|| format!("open sqlite db at {path}"))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::with_connection(conn, clock)
    }

    pub fn open_in_memory(clock: Arc<dyn Clock>) -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite")?;
        Self::with_connection(conn, clock)
    }

    fn with_connection(conn: Connection, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        init_schema(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)), clock, job_window: Duration::minutes(10) })
    }

    /// Settlement jobs with the same key inside this window are dropped.
    pub fn with_job_window(mut self, window: Duration) -> Self {
        self.job_window = window;
        self
    }

    async fn call<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, DateTime<Utc>) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let now = self.clock.now();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard, now)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("blocking task: {e}")))?
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            slug TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            icon TEXT NOT NULL,
            sort_order INTEGER NOT NULL,
            event_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS competitions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            sport_id INTEGER NOT NULL REFERENCES sports(id),
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            country TEXT,
            external_id TEXT,
            UNIQUE(sport_id, slug)
        );

        CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            competition_id INTEGER NOT NULL,
            sport_slug TEXT NOT NULL,
            external_id TEXT NOT NULL UNIQUE,
            home_team TEXT NOT NULL,
            away_team TEXT NOT NULL,
            home_logo TEXT,
            away_logo TEXT,
            status TEXT NOT NULL,
            is_live INTEGER NOT NULL,
            start_time INTEGER NOT NULL,
            score_home INTEGER,
            score_away INTEGER,
            metadata TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_start ON events(start_time);
        CREATE INDEX IF NOT EXISTS idx_events_status ON events(status);

        CREATE TABLE IF NOT EXISTS event_links (
            external_id TEXT PRIMARY KEY,
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE
        );

        CREATE TABLE IF NOT EXISTS markets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id INTEGER NOT NULL REFERENCES events(id) ON DELETE CASCADE,
            market_key TEXT NOT NULL,
            name TEXT NOT NULL,
            market_type TEXT NOT NULL,
            status TEXT NOT NULL,
            period TEXT,
            line REAL,
            updated_at INTEGER NOT NULL,
            UNIQUE(event_id, market_key)
        );

        CREATE TABLE IF NOT EXISTS selections (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            market_id INTEGER NOT NULL REFERENCES markets(id) ON DELETE CASCADE,
            outcome TEXT NOT NULL,
            name TEXT NOT NULL,
            params TEXT NOT NULL,
            odds REAL NOT NULL,
            probability REAL,
            handicap REAL,
            status TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(market_id, outcome, params)
        );

        CREATE TABLE IF NOT EXISTS jobs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_type TEXT NOT NULL,
            idempotency_key TEXT NOT NULL,
            payload TEXT NOT NULL,
            enqueued_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_key ON jobs(idempotency_key, enqueued_at);
        "#,
    )
    .context("init schema")?;
    Ok(())
}

// ── Conversions ──────────────────────────────────────────────────────────────

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Unique-index violations become `Conflict`, everything else `Backend`.
fn insert_error(e: rusqlite::Error, entity: &'static str, key: &str) -> StoreError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            StoreError::Conflict { entity, key: key.to_string() }
        }
        _ => backend(e),
    }
}

fn wire<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        Ok(other) => other.to_string(),
        Err(_) => String::new(),
    }
}

fn enum_col<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_value(serde_json::Value::String(raw))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let ms: i64 = row.get(idx)?;
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, ms))
}

fn ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn sport_from_row(row: &Row) -> rusqlite::Result<Sport> {
    Ok(Sport {
        id: row.get(0)?,
        slug: row.get(1)?,
        name: row.get(2)?,
        icon: row.get(3)?,
        sort_order: row.get(4)?,
        event_count: row.get(5)?,
    })
}

fn competition_from_row(row: &Row) -> rusqlite::Result<Competition> {
    Ok(Competition {
        id: row.get(0)?,
        sport_id: row.get(1)?,
        slug: row.get(2)?,
        name: row.get(3)?,
        country: row.get(4)?,
        external_id: row.get(5)?,
    })
}

fn event_from_row(row: &Row) -> rusqlite::Result<Event> {
    let home: Option<i32> = row.get(11)?;
    let away: Option<i32> = row.get(12)?;
    let metadata_raw: String = row.get(13)?;
    let metadata: EventMetadata = serde_json::from_str(&metadata_raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(13, Type::Text, Box::new(e)))?;
    Ok(Event {
        id: row.get(0)?,
        competition_id: row.get(1)?,
        sport_slug: row.get(2)?,
        external_id: row.get(3)?,
        linked_ids: Vec::new(),
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        home_logo: row.get(6)?,
        away_logo: row.get(7)?,
        status: enum_col(row, 8)?,
        is_live: row.get(9)?,
        start_time: time_col(row, 10)?,
        scores: home.zip(away).map(|(h, a)| Scores::new(h, a)),
        metadata,
        updated_at: time_col(row, 14)?,
    })
}

fn market_from_row(row: &Row) -> rusqlite::Result<Market> {
    Ok(Market {
        id: row.get(0)?,
        event_id: row.get(1)?,
        market_key: row.get(2)?,
        name: row.get(3)?,
        market_type: enum_col(row, 4)?,
        status: enum_col(row, 5)?,
        period: row.get(6)?,
        line: row.get(7)?,
        updated_at: time_col(row, 8)?,
    })
}

fn selection_from_row(row: &Row) -> rusqlite::Result<Selection> {
    Ok(Selection {
        id: row.get(0)?,
        market_id: row.get(1)?,
        outcome: row.get(2)?,
        name: row.get(3)?,
        params: row.get(4)?,
        odds: row.get(5)?,
        probability: row.get(6)?,
        handicap: row.get(7)?,
        status: enum_col(row, 8)?,
        updated_at: time_col(row, 9)?,
    })
}

// ── Queries shared by several operations ─────────────────────────────────────

fn attach_links(conn: &Connection, events: &mut [Event]) -> StoreResult<()> {
    let mut stmt = conn
        .prepare_cached("SELECT external_id FROM event_links WHERE event_id = ?1 ORDER BY rowid")
        .map_err(backend)?;
    for event in events.iter_mut() {
        event.linked_ids = stmt
            .query_map([event.id], |r| r.get(0))
            .map_err(backend)?
            .collect::<rusqlite::Result<Vec<String>>>()
            .map_err(backend)?;
    }
    Ok(())
}

fn events_where(conn: &Connection, clause: &str, args: impl rusqlite::Params) -> StoreResult<Vec<Event>> {
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE {clause} ORDER BY id");
    let mut stmt = conn.prepare(&sql).map_err(backend)?;
    let mut events = stmt
        .query_map(args, event_from_row)
        .map_err(backend)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(backend)?;
    attach_links(conn, &mut events)?;
    Ok(events)
}

fn event_by_id(conn: &Connection, event_id: i64) -> StoreResult<Option<Event>> {
    Ok(events_where(conn, "id = ?1", [event_id])?.pop())
}

fn event_by_external(conn: &Connection, external_id: &str) -> StoreResult<Option<Event>> {
    let owner: Option<i64> = conn
        .query_row(
            "SELECT id FROM events WHERE external_id = ?1
             UNION SELECT event_id FROM event_links WHERE external_id = ?1
             LIMIT 1",
            [external_id],
            |r| r.get(0),
        )
        .optional()
        .map_err(backend)?;
    match owner {
        Some(id) => event_by_id(conn, id),
        None => Ok(None),
    }
}

fn market_by_key(conn: &Connection, event_id: i64, market_key: &str) -> StoreResult<Option<Market>> {
    conn.query_row(
        &format!("SELECT {MARKET_COLUMNS} FROM markets WHERE event_id = ?1 AND market_key = ?2"),
        params![event_id, market_key],
        market_from_row,
    )
    .optional()
    .map_err(backend)
}

fn selection_by_key(conn: &Connection, market_id: i64, outcome: &str, sel_params: &str) -> StoreResult<Option<Selection>> {
    conn.query_row(
        &format!("SELECT {SELECTION_COLUMNS} FROM selections WHERE market_id = ?1 AND outcome = ?2 AND params = ?3"),
        params![market_id, outcome, sel_params],
        selection_from_row,
    )
    .optional()
    .map_err(backend)
}

fn exists(conn: &Connection, table: &str, id: i64) -> StoreResult<bool> {
    conn.query_row(&format!("SELECT 1 FROM {table} WHERE id = ?1"), [id], |_| Ok(()))
        .optional()
        .map(|hit| hit.is_some())
        .map_err(backend)
}

fn stale_candidates(conn: &Connection, criteria: &StaleCriteria) -> StoreResult<Vec<Event>> {
    if criteria.statuses.is_empty() {
        return Ok(Vec::new());
    }
    let statuses: Vec<String> = criteria.statuses.iter().map(wire).collect();
    let marks = vec!["?"; statuses.len()].join(", ");
    let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE status IN ({marks}) ORDER BY id");
    let mut stmt = conn.prepare(&sql).map_err(backend)?;
    let mut events = stmt
        .query_map(params_from_iter(statuses.iter()), event_from_row)
        .map_err(backend)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(backend)?;
    events.retain(|e| criteria.matches(e));
    attach_links(conn, &mut events)?;
    Ok(events)
}

// ── Store ────────────────────────────────────────────────────────────────────

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_sport(&self, sport: SportUpsert) -> StoreResult<Sport> {
        self.call(move |conn, _| {
            conn.execute(
                "INSERT INTO sports(slug, name, icon, sort_order) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(slug) DO UPDATE SET name=excluded.name, icon=excluded.icon, sort_order=excluded.sort_order",
                params![sport.slug, sport.name, sport.icon, sport.sort_order],
            )
            .map_err(backend)?;
            conn.query_row(
                "SELECT id, slug, name, icon, sort_order, event_count FROM sports WHERE slug = ?1",
                [&sport.slug],
                sport_from_row,
            )
            .map_err(backend)
        })
        .await
    }

    async fn upsert_competition(&self, c: CompetitionUpsert) -> StoreResult<Competition> {
        self.call(move |conn, _| {
            let tx = conn.transaction().map_err(backend)?;
            let existing = tx
                .query_row(
                    "SELECT id, sport_id, slug, name, country, external_id FROM competitions
                     WHERE sport_id = ?1 AND slug = ?2",
                    params![c.sport_id, c.slug],
                    competition_from_row,
                )
                .optional()
                .map_err(backend)?;
            let row = match existing {
                Some(mut row) => {
                    if row.external_id.is_none() || row.external_id == c.external_id {
                        row.name = c.name;
                        row.country = c.country.or(row.country);
                        row.external_id = row.external_id.or(c.external_id);
                        tx.execute(
                            "UPDATE competitions SET name = ?2, country = ?3, external_id = ?4 WHERE id = ?1",
                            params![row.id, row.name, row.country, row.external_id],
                        )
                        .map_err(backend)?;
                    }
                    row
                }
                None => {
                    tx.execute(
                        "INSERT INTO competitions(sport_id, slug, name, country, external_id) VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![c.sport_id, c.slug, c.name, c.country, c.external_id],
                    )
                    .map_err(|e| insert_error(e, "competition", &c.slug))?;
                    Competition {
                        id: tx.last_insert_rowid(),
                        sport_id: c.sport_id,
                        slug: c.slug,
                        name: c.name,
                        country: c.country,
                        external_id: c.external_id,
                    }
                }
            };
            tx.commit().map_err(backend)?;
            Ok(row)
        })
        .await
    }

    async fn find_by_external_id(&self, external_id: &str) -> StoreResult<Option<Event>> {
        let external_id = external_id.to_string();
        self.call(move |conn, _| event_by_external(conn, &external_id)).await
    }

    async fn find_fuzzy(
        &self,
        _home_team: &str,
        _away_team: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> StoreResult<Vec<Event>> {
        self.call(move |conn, _| events_where(conn, "start_time BETWEEN ?1 AND ?2", [ms(from), ms(to)]))
            .await
    }

    async fn get_event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        self.call(move |conn, _| event_by_id(conn, event_id)).await
    }

    async fn create_event(&self, d: EventDraft) -> StoreResult<Event> {
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            let linked: bool = tx
                .query_row("SELECT 1 FROM event_links WHERE external_id = ?1", [&d.external_id], |_| Ok(()))
                .optional()
                .map_err(backend)?
                .is_some();
            if linked {
                return Err(StoreError::Conflict { entity: "event", key: d.external_id });
            }
            let metadata = serde_json::to_string(&d.metadata).map_err(|e| StoreError::Backend(e.to_string()))?;
            tx.execute(
                &format!(
                    "INSERT INTO events({}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    EVENT_COLUMNS
                ),
                params![
                    d.competition_id,
                    d.sport_slug,
                    d.external_id,
                    d.home_team,
                    d.away_team,
                    d.home_logo,
                    d.away_logo,
                    wire(&d.status),
                    d.status == EventStatus::Live,
                    ms(d.start_time),
                    d.scores.map(|s| s.home),
                    d.scores.map(|s| s.away),
                    metadata,
                    ms(now),
                ],
            )
            .map_err(|e| insert_error(e, "event", &d.external_id))?;
            let id = tx.last_insert_rowid();
            tx.commit().map_err(backend)?;
            event_by_id(conn, id)?.ok_or(StoreError::NotFound { entity: "event", id: id.to_string() })
        })
        .await
    }

    async fn update_event(&self, event: &Event) -> StoreResult<()> {
        let event = event.clone();
        self.call(move |conn, _| {
            let metadata = serde_json::to_string(&event.metadata).map_err(|e| StoreError::Backend(e.to_string()))?;
            let changed = conn
                .execute(
                    "UPDATE events SET competition_id = ?2, sport_slug = ?3, home_team = ?4, away_team = ?5,
                        home_logo = ?6, away_logo = ?7, status = ?8, is_live = ?9, start_time = ?10,
                        score_home = ?11, score_away = ?12, metadata = ?13, updated_at = ?14
                     WHERE id = ?1",
                    params![
                        event.id,
                        event.competition_id,
                        event.sport_slug,
                        event.home_team,
                        event.away_team,
                        event.home_logo,
                        event.away_logo,
                        wire(&event.status),
                        event.is_live,
                        ms(event.start_time),
                        event.scores.map(|s| s.home),
                        event.scores.map(|s| s.away),
                        metadata,
                        ms(event.updated_at),
                    ],
                )
                .map_err(backend)?;
            if changed == 0 {
                return Err(StoreError::NotFound { entity: "event", id: event.id.to_string() });
            }
            Ok(())
        })
        .await
    }

    async fn link_external_id(&self, event_id: i64, external_id: &str) -> StoreResult<()> {
        let external_id = external_id.to_string();
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            if let Some(owner) = event_by_external(&tx, &external_id)? {
                if owner.id == event_id {
                    return Ok(());
                }
                return Err(StoreError::Conflict { entity: "event", key: external_id });
            }
            if !exists(&tx, "events", event_id)? {
                return Err(StoreError::NotFound { entity: "event", id: event_id.to_string() });
            }
            tx.execute("INSERT INTO event_links(external_id, event_id) VALUES (?1, ?2)", params![external_id, event_id])
                .map_err(|e| insert_error(e, "event", &external_id))?;
            tx.execute("UPDATE events SET updated_at = ?2 WHERE id = ?1", params![event_id, ms(now)])
                .map_err(backend)?;
            tx.commit().map_err(backend)
        })
        .await
    }

    async fn upsert_market(&self, m: MarketUpsert) -> StoreResult<Market> {
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            match market_by_key(&tx, m.event_id, &m.market_key)? {
                Some(existing) if existing.status == MarketStatus::Settled => return Ok(existing),
                Some(existing) => {
                    tx.execute(
                        "UPDATE markets SET status = ?2, name = ?3, updated_at = ?4 WHERE id = ?1",
                        params![existing.id, wire(&MarketStatus::Open), m.name, ms(now)],
                    )
                    .map_err(backend)?;
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO markets({MARKET_COLUMNS}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
                        ),
                        params![
                            m.event_id,
                            m.market_key,
                            m.name,
                            wire(&m.market_type),
                            wire(&MarketStatus::Open),
                            m.period,
                            m.line,
                            ms(now),
                        ],
                    )
                    .map_err(|e| insert_error(e, "market", &m.market_key))?;
                }
            }
            let row = market_by_key(&tx, m.event_id, &m.market_key)?
                .ok_or_else(|| StoreError::NotFound { entity: "market", id: m.market_key.clone() })?;
            tx.commit().map_err(backend)?;
            Ok(row)
        })
        .await
    }

    async fn list_markets(&self, event_id: i64) -> StoreResult<Vec<Market>> {
        self.call(move |conn, _| {
            let mut stmt = conn
                .prepare(&format!("SELECT {MARKET_COLUMNS} FROM markets WHERE event_id = ?1 ORDER BY id"))
                .map_err(backend)?;
            let rows = stmt
                .query_map([event_id], market_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }

    async fn count_markets(&self, event_id: i64) -> StoreResult<usize> {
        self.call(move |conn, _| {
            conn.query_row("SELECT COUNT(1) FROM markets WHERE event_id = ?1", [event_id], |r| r.get::<_, i64>(0))
                .map(|n| n as usize)
                .map_err(backend)
        })
        .await
    }

    async fn settle_market(&self, market_id: i64) -> StoreResult<bool> {
        self.call(move |conn, now| {
            let settled = wire(&MarketStatus::Settled);
            let changed = conn
                .execute(
                    "UPDATE markets SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status != ?2",
                    params![market_id, settled, ms(now)],
                )
                .map_err(backend)?;
            if changed == 0 && !exists(conn, "markets", market_id)? {
                return Err(StoreError::NotFound { entity: "market", id: market_id.to_string() });
            }
            Ok(changed == 1)
        })
        .await
    }

    async fn set_market_status(&self, market_id: i64, status: MarketStatus) -> StoreResult<()> {
        self.call(move |conn, now| {
            let changed = conn
                .execute(
                    "UPDATE markets SET status = ?2, updated_at = ?3 WHERE id = ?1 AND status != ?4",
                    params![market_id, wire(&status), ms(now), wire(&MarketStatus::Settled)],
                )
                .map_err(backend)?;
            if changed == 0 && !exists(conn, "markets", market_id)? {
                return Err(StoreError::NotFound { entity: "market", id: market_id.to_string() });
            }
            Ok(())
        })
        .await
    }

    async fn find_selection(&self, market_id: i64, outcome: &str, params: &str) -> StoreResult<Option<Selection>> {
        let (outcome, sel_params) = (outcome.to_string(), params.to_string());
        self.call(move |conn, _| selection_by_key(conn, market_id, &outcome, &sel_params)).await
    }

    async fn upsert_selection(&self, s: SelectionUpsert) -> StoreResult<Selection> {
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            match selection_by_key(&tx, s.market_id, &s.outcome, &s.params)? {
                Some(existing) if existing.status.is_settled() => return Ok(existing),
                Some(existing) => {
                    tx.execute(
                        "UPDATE selections SET odds = ?2, probability = ?3, name = ?4, status = ?5, updated_at = ?6
                         WHERE id = ?1",
                        params![existing.id, s.odds, s.probability, s.name, wire(&SelectionStatus::Active), ms(now)],
                    )
                    .map_err(backend)?;
                }
                None => {
                    tx.execute(
                        &format!(
                            "INSERT INTO selections({SELECTION_COLUMNS}) VALUES (NULL, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
                        ),
                        params![
                            s.market_id,
                            s.outcome,
                            s.name,
                            s.params,
                            s.odds,
                            s.probability,
                            s.handicap,
                            wire(&SelectionStatus::Active),
                            ms(now),
                        ],
                    )
                    .map_err(|e| insert_error(e, "selection", &s.outcome))?;
                }
            }
            let row = selection_by_key(&tx, s.market_id, &s.outcome, &s.params)?
                .ok_or_else(|| StoreError::NotFound { entity: "selection", id: s.outcome.clone() })?;
            tx.commit().map_err(backend)?;
            Ok(row)
        })
        .await
    }

    async fn list_selections(&self, market_id: i64) -> StoreResult<Vec<Selection>> {
        self.call(move |conn, _| {
            let mut stmt = conn
                .prepare(&format!("SELECT {SELECTION_COLUMNS} FROM selections WHERE market_id = ?1 ORDER BY id"))
                .map_err(backend)?;
            let rows = stmt
                .query_map([market_id], selection_from_row)
                .map_err(backend)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }

    async fn set_selection_status(&self, selection_id: i64, status: SelectionStatus) -> StoreResult<bool> {
        self.call(move |conn, now| {
            let changed = conn
                .execute(
                    "UPDATE selections SET status = ?2, updated_at = ?3
                     WHERE id = ?1 AND status NOT IN (?4, ?5, ?6)",
                    params![
                        selection_id,
                        wire(&status),
                        ms(now),
                        wire(&SelectionStatus::Won),
                        wire(&SelectionStatus::Lost),
                        wire(&SelectionStatus::Void),
                    ],
                )
                .map_err(backend)?;
            if changed == 0 && !exists(conn, "selections", selection_id)? {
                return Err(StoreError::NotFound { entity: "selection", id: selection_id.to_string() });
            }
            Ok(changed == 1)
        })
        .await
    }

    async fn find_stale_events(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>> {
        let criteria = criteria.clone();
        self.call(move |conn, _| stale_candidates(conn, &criteria)).await
    }

    async fn bulk_mark_ended_by_staleness(&self, criteria: &StaleCriteria) -> StoreResult<Vec<Event>> {
        let criteria = criteria.clone();
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            let before = stale_candidates(&tx, &criteria)?;
            {
                let mut stmt = tx
                    .prepare("UPDATE events SET status = ?2, is_live = 0, updated_at = ?3 WHERE id = ?1")
                    .map_err(backend)?;
                for ev in &before {
                    stmt.execute(params![ev.id, wire(&EventStatus::Ended), ms(now)]).map_err(backend)?;
                }
            }
            tx.commit().map_err(backend)?;
            Ok(before)
        })
        .await
    }

    async fn refresh_sport_counts(&self) -> StoreResult<()> {
        self.call(move |conn, _| {
            conn.execute(
                "UPDATE sports SET event_count = (
                    SELECT COUNT(1) FROM events e
                    WHERE e.sport_slug = sports.slug AND e.status IN (?1, ?2)
                 )",
                params![wire(&EventStatus::Upcoming), wire(&EventStatus::Live)],
            )
            .map(|_| ())
            .map_err(backend)
        })
        .await
    }

    async fn delete_orphan_events(&self) -> StoreResult<usize> {
        self.call(move |conn, _| {
            let tx = conn.transaction().map_err(backend)?;
            let candidates: Vec<(i64, String, String)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT id, home_team, away_team FROM events e
                         WHERE NOT EXISTS (SELECT 1 FROM markets m WHERE m.event_id = e.id)",
                    )
                    .map_err(backend)?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
                    .map_err(backend)?
                    .collect::<rusqlite::Result<Vec<_>>>()
                    .map_err(backend)?;
                rows
            };
            let mut removed = 0;
            for (id, home, away) in candidates {
                if is_placeholder_team(&home) || is_placeholder_team(&away) {
                    tx.execute("DELETE FROM event_links WHERE event_id = ?1", [id]).map_err(backend)?;
                    removed += tx.execute("DELETE FROM events WHERE id = ?1", [id]).map_err(backend)?;
                }
            }
            tx.commit().map_err(backend)?;
            Ok(removed)
        })
        .await
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────────

#[async_trait]
impl JobQueue for SqliteStore {
    async fn enqueue(&self, job_type: &str, payload: serde_json::Value, idempotency_key: &str) -> StoreResult<bool> {
        let (job_type, key) = (job_type.to_string(), idempotency_key.to_string());
        let window = self.job_window;
        self.call(move |conn, now| {
            let tx = conn.transaction().map_err(backend)?;
            let recent: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM jobs WHERE idempotency_key = ?1 AND enqueued_at > ?2 LIMIT 1",
                    params![key, ms(now - window)],
                    |r| r.get(0),
                )
                .optional()
                .map_err(backend)?;
            if recent.is_some() {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO jobs(job_type, idempotency_key, payload, enqueued_at) VALUES (?1, ?2, ?3, ?4)",
                params![job_type, key, payload.to_string(), ms(now)],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(true)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use feed_model::{ManualClock, MarketType, PreMatchOdds};
    use std::collections::BTreeMap;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 18, 0, 0).unwrap()
    }

    fn store() -> (ManualClock, SqliteStore) {
        let clock = ManualClock::new(t0());
        let store = SqliteStore::open_in_memory(Arc::new(clock.clone())).unwrap();
        (clock, store)
    }

    async fn seed(store: &SqliteStore, external_id: &str, home: &str) -> Event {
        let sport = store
            .upsert_sport(SportUpsert { slug: "football".into(), name: "Football".into(), icon: "x".into(), sort_order: 1 })
            .await
            .unwrap();
        let comp = store
            .upsert_competition(CompetitionUpsert {
                sport_id: sport.id,
                slug: "premier-league".into(),
                name: "Premier League".into(),
                country: Some("England".into()),
                external_id: Some("betsapi:94".into()),
            })
            .await
            .unwrap();
        store
            .create_event(EventDraft {
                competition_id: comp.id,
                sport_slug: "football".into(),
                external_id: external_id.into(),
                home_team: home.into(),
                away_team: "Chelsea".into(),
                home_logo: None,
                away_logo: None,
                status: EventStatus::Upcoming,
                start_time: t0(),
                scores: None,
                metadata: EventMetadata::default(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_event_round_trip_with_metadata_and_links() {
        let (_, store) = store();
        let mut ev = seed(&store, "betsapi:1", "Arsenal").await;
        ev.status = EventStatus::Live;
        ev.is_live = true;
        ev.scores = Some(Scores::new(1, 0));
        ev.metadata.timer = Some("33:10".into());
        ev.metadata.period_scores = BTreeMap::from([("H1".to_string(), Scores::new(1, 0))]);
        ev.metadata.pre_match_odds = Some(PreMatchOdds { home: Some(1.8), draw: None, away: Some(4.2), captured_at: t0() });
        store.update_event(&ev).await.unwrap();
        store.link_external_id(ev.id, "pinnacle:77").await.unwrap();
        ev.linked_ids.push("pinnacle:77".into());

        let by_link = store.find_by_external_id("pinnacle:77").await.unwrap().unwrap();
        assert_eq!(by_link, ev);
        let window = store.find_fuzzy("", "", t0() - Duration::hours(2), t0() + Duration::hours(2)).await.unwrap();
        assert_eq!(window.len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_external_ids_conflict() {
        let (_, store) = store();
        let a = seed(&store, "betsapi:1", "Arsenal").await;
        let b = seed(&store, "betsapi:2", "Leeds").await;
        store.link_external_id(a.id, "oddsapi:x").await.unwrap();

        let dup = EventDraft {
            competition_id: a.competition_id,
            sport_slug: "football".into(),
            external_id: "betsapi:1".into(),
            home_team: "Arsenal".into(),
            away_team: "Chelsea".into(),
            home_logo: None,
            away_logo: None,
            status: EventStatus::Upcoming,
            start_time: t0(),
            scores: None,
            metadata: EventMetadata::default(),
        };
        assert!(matches!(store.create_event(dup.clone()).await, Err(StoreError::Conflict { .. })));
        let linked_dup = EventDraft { external_id: "oddsapi:x".into(), ..dup };
        assert!(matches!(store.create_event(linked_dup).await, Err(StoreError::Conflict { .. })));
        assert!(matches!(store.link_external_id(b.id, "oddsapi:x").await, Err(StoreError::Conflict { .. })));
        // relinking to the owner is a no-op
        store.link_external_id(a.id, "oddsapi:x").await.unwrap();
    }

    #[tokio::test]
    async fn test_settled_rows_are_immutable() {
        let (_, store) = store();
        let ev = seed(&store, "betsapi:1", "Arsenal").await;
        let upsert = MarketUpsert {
            event_id: ev.id,
            market_key: "OU2.5".into(),
            name: "Over/Under 2.5".into(),
            market_type: MarketType::Total,
            period: None,
            line: Some(2.5),
        };
        let m = store.upsert_market(upsert.clone()).await.unwrap();
        let over = SelectionUpsert {
            market_id: m.id,
            outcome: "OVER".into(),
            name: "Over 2.5".into(),
            params: "line=2.5".into(),
            odds: 1.9,
            probability: Some(0.52),
            handicap: None,
        };
        let s = store.upsert_selection(over.clone()).await.unwrap();
        assert!(store.set_selection_status(s.id, SelectionStatus::Won).await.unwrap());
        assert!(!store.set_selection_status(s.id, SelectionStatus::Lost).await.unwrap());

        let again = store.upsert_selection(SelectionUpsert { odds: 3.0, ..over }).await.unwrap();
        assert_eq!((again.status, again.odds), (SelectionStatus::Won, 1.9));

        assert!(store.settle_market(m.id).await.unwrap());
        assert!(!store.settle_market(m.id).await.unwrap());
        let reopened = store.upsert_market(upsert).await.unwrap();
        assert_eq!(reopened.status, MarketStatus::Settled);
        assert_eq!(store.count_markets(ev.id).await.unwrap(), 1);
        assert!(matches!(store.settle_market(999).await, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_staleness_counts_and_orphans() {
        let (clock, store) = store();
        let old = seed(&store, "betsapi:1", "Arsenal").await;
        seed(&store, "betsapi:2", "TBD").await;
        clock.advance(Duration::hours(5));

        store.refresh_sport_counts().await.unwrap();
        let criteria = StaleCriteria {
            statuses: vec![EventStatus::Upcoming, EventStatus::Live],
            started_before: Some(clock.now() - Duration::hours(4)),
            untouched_since: None,
            match_any: false,
        };
        assert_eq!(store.find_stale_events(&criteria).await.unwrap().len(), 2);
        let before = store.bulk_mark_ended_by_staleness(&criteria).await.unwrap();
        assert_eq!(before.len(), 2);
        assert_eq!(before[0].status, EventStatus::Upcoming);
        let now_ended = store.get_event(old.id).await.unwrap().unwrap();
        assert_eq!((now_ended.status, now_ended.updated_at), (EventStatus::Ended, clock.now()));
        assert!(store.find_stale_events(&criteria).await.unwrap().is_empty());

        assert_eq!(store.delete_orphan_events().await.unwrap(), 1);
        store.refresh_sport_counts().await.unwrap();
        let conn = store.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT event_count FROM sports", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_jobs_dedupe_inside_window() {
        let (clock, store) = store();
        let payload = serde_json::json!({"eventId": 1});
        assert!(store.enqueue("auto-settle-event", payload.clone(), "auto-settle-event:1").await.unwrap());
        assert!(!store.enqueue("auto-settle-event", payload.clone(), "auto-settle-event:1").await.unwrap());
        clock.advance(Duration::minutes(11));
        assert!(store.enqueue("auto-settle-event", payload, "auto-settle-event:1").await.unwrap());
    }

    #[tokio::test]
    async fn test_competition_owner_keeps_name() {
        let (_, store) = store();
        seed(&store, "betsapi:1", "Arsenal").await;
        let other = store
            .upsert_competition(CompetitionUpsert {
                sport_id: 1,
                slug: "premier-league".into(),
                name: "EPL".into(),
                country: None,
                external_id: Some("oddsapi:soccer_epl".into()),
            })
            .await
            .unwrap();
        assert_eq!(other.name, "Premier League");
        assert_eq!(other.external_id.as_deref(), Some("betsapi:94"));
    }
}
