//! Minimal HTTP contract shared by the adapters: auth, budget, pacing,
//! timeouts and typed failures.

use feed_model::{FeedError, FeedResult};
use governor::{DefaultDirectRateLimiter, Quota};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::rate_limiter::RateLimiter;

#[derive(Debug, Clone)]
pub enum Auth {
    None,
    Query { name: &'static str, value: String },
    Header { name: &'static str, value: String },
    Basic { user: String, password: String },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HttpConfig {
    /// Per-request timeout; expiry surfaces as `FeedError::Network`.
    pub timeout: Duration,
    /// Longest single sleep spent waiting for the minute window to free a slot.
    pub limiter_wait: Duration,
    /// Minimum gap between consecutive requests to the same provider.
    pub min_spacing: Duration,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            limiter_wait: Duration::from_secs(2),
            min_spacing: Duration::from_millis(250),
        }
    }
}

pub struct ProviderHttp {
    provider: &'static str,
    base_url: String,
    client: reqwest::Client,
    auth: Auth,
    limiter: Arc<RateLimiter>,
    pacer: DefaultDirectRateLimiter,
    config: HttpConfig,
}

impl ProviderHttp {
    pub fn new(
        provider: &'static str,
        base_url: impl Into<String>,
        auth: Auth,
        limiter: Arc<RateLimiter>,
        config: HttpConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent("FeedSync/1.0")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let quota = Quota::with_period(config.min_spacing)
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MAX));
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            auth,
            limiter,
            pacer: DefaultDirectRateLimiter::direct(quota),
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Admission with at most one bounded sleep when only the minute window is full.
    async fn admit(&self) -> FeedResult<()> {
        if self.limiter.try_acquire() {
            return Ok(());
        }
        if self.limiter.cooldown_remaining().is_some() {
            return Err(FeedError::RateLimited { provider: self.provider.to_string() });
        }
        let wait = self
            .limiter
            .minute_slot_in()
            .and_then(|d| d.to_std().ok())
            .filter(|d| *d <= self.config.limiter_wait);
        if let Some(wait) = wait {
            tokio::time::sleep(wait).await;
            if self.limiter.try_acquire() {
                return Ok(());
            }
        }
        Err(FeedError::BudgetExhausted { provider: self.provider.to_string() })
    }

    /// GET `path` and decode the JSON body into `T`.
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> FeedResult<T> {
        self.admit().await?;
        self.pacer.until_ready().await;

        let url = self.url(path);
        let mut req = self.client.get(&url).header("Accept", "application/json").query(query);
        match &self.auth {
            Auth::None => {}
            Auth::Query { name, value } => req = req.query(&[(*name, value.as_str())]),
            Auth::Header { name, value } => req = req.header(*name, value.as_str()),
            Auth::Basic { user, password } => req = req.basic_auth(user, Some(password)),
        }

        let resp = req.send().await.map_err(|e| self.network_error(e))?;
        let status = resp.status();
        if status.as_u16() == 429 {
            self.limiter.record_too_many_requests();
            return Err(FeedError::RateLimited { provider: self.provider.to_string() });
        }
        if !status.is_success() {
            return Err(FeedError::Http { provider: self.provider.to_string(), status: status.as_u16() });
        }

        let raw = resp.text().await.map_err(|e| self.network_error(e))?;
        self.limiter.record_success();
        debug!(provider = self.provider, path, "{} bytes: {}", raw.len(), &raw[..floor_char_boundary(&raw, 200)]);
        decode(self.provider, &raw)
    }

    fn network_error(&self, e: reqwest::Error) -> FeedError {
        if e.is_timeout() {
            FeedError::network(self.provider, format!("timeout after {:?}", self.config.timeout))
        } else {
            FeedError::network(self.provider, e.to_string())
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(provider: &str, raw: &str) -> FeedResult<T> {
    serde_json::from_str(raw).map_err(|e| {
        let snippet = &raw[..floor_char_boundary(raw, 120)];
        FeedError::parse(provider, format!("{e} in `{snippet}`"))
    })
}

fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut i = max;
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
