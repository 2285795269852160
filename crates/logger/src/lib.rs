/// FeedSync — Logger
/// JSONL audit stream + tracing setup

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

pub struct EventLogger {
    log_dir: PathBuf,
}

impl EventLogger {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let dir = log_dir.into();
        fs::create_dir_all(&dir).ok();
        Self { log_dir: dir }
    }

    /// Appends one JSON line to today's file (`<log_dir>/YYYY-MM-DD.jsonl`).
    pub fn log<T: Serialize>(&self, event: &T) -> Result<()> {
        let date  = Utc::now().format("%Y-%m-%d").to_string();
        let path  = self.log_dir.join(format!("{date}.jsonl"));
        let line  = serde_json::to_string(event)?;
        let mut f = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(f, "{line}")?;
        Ok(())
    }

    /// Same as `log` but never fails the caller.
    pub fn log_quiet<T: Serialize>(&self, event: &T) {
        if let Err(e) = self.log(event) {
            tracing::warn!("audit log write failed: {e}");
        }
    }

    pub fn dir(&self) -> &PathBuf {
        &self.log_dir
    }
}

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

/// fmt subscriber with `RUST_LOG`, falling back to `default_filter`.
pub fn init_tracing(default_filter: &str) {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_filter))
        )
        .try_init();
}

// ── Event types ──────────────────────────────────────────────────────────────

#[derive(Serialize, Debug)]
pub struct PollSummaryEvent {
    pub ts:          String,
    pub event:       &'static str,   // "POLL_SUMMARY"
    pub provider:    String,
    pub sport:       String,
    pub kind:        &'static str,   // "in_play" | "upcoming" | "discovery"
    pub fetched:     usize,
    pub processed:   usize,
    pub failed:      usize,
    pub ended:       usize,
}

#[derive(Serialize, Debug)]
pub struct StatusTransitionEvent {
    pub ts:          String,
    pub event:       &'static str,   // "STATUS_TRANSITION"
    pub event_id:    i64,
    pub external_id: String,
    pub from:        Option<String>,
    pub to:          String,
    pub reason:      String,
}

#[derive(Serialize, Debug)]
pub struct SettlementEvent {
    pub ts:               String,
    pub event:            &'static str,   // "SETTLEMENT"
    pub event_id:         i64,
    pub source:           String,         // "primary" | "stale-sweep" | "stale-live"
    pub home_score:       i32,
    pub away_score:       i32,
    pub score_origin:     String,         // "known" | "supplied" | "synthetic"
    pub markets_settled:  usize,
    pub markets_skipped:  usize,
    pub job_enqueued:     bool,
}

#[derive(Serialize, Debug)]
pub struct StaleSweepEvent {
    pub ts:          String,
    pub event:       &'static str,   // "STALE_SWEEP"
    pub pass:        &'static str,   // "unsettled" | "idle_live"
    pub found:       usize,
    pub settled:     usize,
    pub orphans_removed: usize,
}

#[derive(Serialize, Debug)]
pub struct BroadcastEvent {
    pub ts:          String,
    pub event:       &'static str,   // "BROADCAST"
    pub channel:     String,
    pub name:        String,
    pub payload:     serde_json::Value,
}
