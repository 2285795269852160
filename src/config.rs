//! Process configuration read from the environment (and `.env`).

use providers::{AdapterConfig, RateLimitConfig};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub name: &'static str,
    pub adapter: AdapterConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub log_dir: String,
    pub tick: Duration,
    pub stale_sweep_interval: Duration,
    /// Only providers whose credential is set.
    pub providers: Vec<ProviderSettings>,
}

/// Provider name, credential variable, env prefix for limit overrides and
/// the plan limits (per minute, per hour) a partial override falls back to.
const PROVIDERS: [(&str, &str, &str, (u32, u32)); 4] = [
    ("betsapi", "BETSAPI_TOKEN", "BETSAPI", (60, 3600)),
    ("apisports", "APISPORTS_KEY", "APISPORTS", (10, 100)),
    ("oddsapi", "ODDS_API_KEY", "ODDS_API", (10, 500)),
    ("pinnacle", "PINNACLE_AUTH", "PINNACLE", (30, 1000)),
];

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str, default: u64| -> u64 {
            lookup(key).and_then(|v| v.trim().parse().ok()).unwrap_or(default)
        };

        let providers = PROVIDERS
            .iter()
            .filter_map(|&(name, key_var, prefix, (default_minute, default_hour))| {
                let credential = lookup(key_var).filter(|v| !v.trim().is_empty())?;
                let mut adapter = AdapterConfig::new(credential.trim());
                let per_minute = lookup(&format!("{prefix}_PER_MINUTE")).and_then(|v| v.trim().parse().ok());
                let per_hour = lookup(&format!("{prefix}_PER_HOUR")).and_then(|v| v.trim().parse().ok());
                if per_minute.is_some() || per_hour.is_some() {
                    adapter.limits = Some(RateLimitConfig::new(
                        per_minute.unwrap_or(default_minute),
                        per_hour.unwrap_or(default_hour),
                    ));
                }
                Some(ProviderSettings { name, adapter })
            })
            .collect();

        Self {
            db_path: lookup("FEED_DB_PATH").unwrap_or_else(|| "data/feedsync.db".to_string()),
            log_dir: lookup("FEED_LOG_DIR").unwrap_or_else(|| "logs".to_string()),
            tick: Duration::from_secs(parsed("FEED_TICK_SECS", 5).max(1)),
            stale_sweep_interval: Duration::from_secs(parsed("STALE_SWEEP_SECS", 300).max(1)),
            providers,
        }
    }
}
