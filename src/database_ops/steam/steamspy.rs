use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

use crate::database_ops::models::SteamGameFields;
use crate::util::env as env_util;

const DEFAULT_BASE_URL: &str = "https://steamspy.com/api.php";

/// Steam data fetch keyed by a link's `external_uid` (the Steam app id).
/// `Ok(None)` means the upstream has no usable record for that id.
#[async_trait]
pub trait SteamDataClient: Send + Sync {
    async fn fetch_game_details(&self, external_uid: &str) -> Result<Option<SteamSpyApp>>;
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SteamSpyApp {
    pub appid: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub owners: Option<String>,
    #[serde(default)]
    pub average_forever: Option<i64>,
    #[serde(default)]
    pub ccu: Option<i64>,
    #[serde(default, deserialize_with = "de_price")]
    pub price: Option<i64>,
    #[serde(default, deserialize_with = "de_tags")]
    pub tags: IndexMap<String, i64>,
}

impl SteamSpyApp {
    pub fn to_fields(&self) -> SteamGameFields {
        SteamGameFields {
            owners: self.owners.clone(),
            average_forever: clamp_i32(self.average_forever.unwrap_or(0)),
            ccu: clamp_i32(self.ccu.unwrap_or(0)),
            price: self.price.map(clamp_i32),
            tags: self.tags.clone(),
        }
    }
}

fn clamp_i32(v: i64) -> i32 {
    v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

// SteamSpy sends prices as strings of cents ("999"), sometimes numbers, sometimes null.
fn de_price<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    })
}

// Tags arrive as {"name": votes}, but an app without tags comes back as `[]`.
fn de_tags<'de, D>(deserializer: D) -> std::result::Result<IndexMap<String, i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut out = IndexMap::new();
    if let Value::Object(map) = Value::deserialize(deserializer)? {
        for (name, votes) in map {
            if let Some(v) = votes.as_i64() {
                out.insert(name, v);
            }
        }
    }
    Ok(out)
}

/// Interpret one `appdetails` body. SteamSpy answers unknown ids with HTTP 200 and a
/// record whose name is null.
pub fn parse_app_details(body: Value) -> Result<Option<SteamSpyApp>> {
    if !body.is_object() {
        return Err(anyhow!("malformed SteamSpy payload: expected object"));
    }
    let app: SteamSpyApp =
        serde_json::from_value(body).context("malformed SteamSpy appdetails payload")?;
    match app.name.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => Ok(Some(app)),
        _ => Ok(None),
    }
}

#[derive(Debug, Clone)]
pub struct SteamSpyConfig {
    pub base_url: String,
    pub max_retries: usize,
    pub timeout: Duration,
}

impl Default for SteamSpyConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            max_retries: 4,
            timeout: Duration::from_secs(20),
        }
    }
}

impl SteamSpyConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: env_util::env_opt("STEAMSPY_BASE_URL").unwrap_or(d.base_url),
            max_retries: env_util::env_parse("STEAMSPY_MAX_RETRIES", d.max_retries),
            timeout: Duration::from_secs(env_util::env_parse("STEAMSPY_TIMEOUT_SECS", 20u64)),
        }
    }
}

pub struct SteamSpyClient {
    http: Client,
    cfg: SteamSpyConfig,
}

impl SteamSpyClient {
    pub fn new(cfg: SteamSpyConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("gameshelf-sync/0.1 (+steamspy)")
            .timeout(cfg.timeout)
            .build()
            .context("failed to construct SteamSpy HTTP client")?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SteamSpyConfig::from_env())
    }

    // 429s and 5xx are retried with growing delays, honouring Retry-After when it is longer.
    async fn get_with_backoff_json(&self, query_pairs: &[(&str, &str)]) -> Result<Value> {
        let mut attempt: usize = 0;
        loop {
            let resp = self
                .http
                .get(&self.cfg.base_url)
                .header("Accept", "application/json")
                .query(query_pairs)
                .send()
                .await
                .context("SteamSpy request failed")?;
            let status = resp.status();
            if status.is_success() {
                return resp
                    .json::<Value>()
                    .await
                    .context("SteamSpy returned a non-JSON body");
            }
            let retry_after = resp
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok());
            let max_retries = self.cfg.max_retries;
            let Some(sleep_secs) = backoff_secs(status, attempt, max_retries, retry_after) else {
                let text = resp.text().await.unwrap_or_default();
                return Err(anyhow!("SteamSpy returned {status} after {attempt} retries: {text}"));
            };
            warn!(%status, attempt, sleep_secs, "SteamSpy request retry");
            attempt += 1;
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;
        }
    }
}

const RETRY_DELAYS_SECS: [u64; 4] = [5, 10, 15, 20];

/// Seconds to wait before retry `attempt`, or `None` when the status is final or the
/// retries are used up.
fn backoff_secs(
    status: StatusCode,
    attempt: usize,
    max_retries: usize,
    retry_after: Option<u64>,
) -> Option<u64> {
    let retryable = status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
    if !retryable || attempt >= RETRY_DELAYS_SECS.len().min(max_retries) {
        return None;
    }
    Some(RETRY_DELAYS_SECS[attempt].max(retry_after.unwrap_or(0)))
}

#[async_trait]
impl SteamDataClient for SteamSpyClient {
    async fn fetch_game_details(&self, external_uid: &str) -> Result<Option<SteamSpyApp>> {
        let appid = external_uid.trim();
        if appid.is_empty() || !appid.chars().all(|c| c.is_ascii_digit()) {
            return Err(anyhow!("invalid Steam app id: {external_uid:?}"));
        }
        debug!(appid, "fetching SteamSpy appdetails");
        let body = self
            .get_with_backoff_json(&[("request", "appdetails"), ("appid", appid)])
            .await?;
        parse_app_details(body)
    }
}
