use anyhow::{Context, Result};
use rusqlite::Connection;

fn main() -> Result<()> {
    let db_path = std::env::var("FEED_DB_PATH").unwrap_or_else(|_| "data/feedsync.db".to_string());
    let conn = Connection::open(&db_path).with_context(|| format!("open db at {db_path}"))?;

    let tables = ["sports", "competitions", "events", "event_links", "markets", "selections", "jobs"];

    println!("db_path={db_path}");
    for t in tables {
        let count: i64 = conn
            .query_row(&format!("SELECT COUNT(1) FROM {t}"), [], |r| r.get(0))
            .with_context(|| format!("count {t}"))?;
        println!("{t}: {count}");
    }

    let mut by_status = conn
        .prepare("SELECT status, COUNT(1) FROM events GROUP BY status ORDER BY status")
        .context("prepare status breakdown")?;
    let rows = by_status
        .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
        .context("read status breakdown")?;
    for row in rows {
        let (status, count) = row?;
        println!("events[{status}]: {count}");
    }

    let mut recent = conn
        .prepare("SELECT idempotency_key, payload, enqueued_at FROM jobs ORDER BY enqueued_at DESC LIMIT 5")
        .context("prepare recent jobs")?;
    let jobs: Vec<(String, String, i64)> = recent
        .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .context("read recent jobs")?
        .collect::<rusqlite::Result<_>>()?;

    if jobs.is_empty() {
        println!("recent_jobs: <none>");
    }
    for (key, payload, enqueued_at) in jobs {
        let ts = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(enqueued_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| enqueued_at.to_string());
        println!("job: ts={ts} key={key} payload={payload}");
    }

    Ok(())
}
