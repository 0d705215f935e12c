use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rand::Rng;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::database_ops::models::GameMetadataUpdate;
use crate::util::env as env_util;

const TWITCH_TOKEN_URL: &str = "https://id.twitch.tv/oauth2/token";
const IGDB_BASE_URL: &str = "https://api.igdb.com/v4";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IgdbCover {
    #[serde(default)]
    pub image_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IgdbGame {
    pub id: i64,
    #[serde(default)]
    pub name: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub first_release_date: Option<i64>,
    #[serde(default)]
    pub cover: Option<IgdbCover>,
}

impl IgdbGame {
    pub fn release_date(&self) -> Option<DateTime<Utc>> {
        self.first_release_date
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn to_update(&self) -> GameMetadataUpdate {
        GameMetadataUpdate {
            name: self
                .name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
            first_release_date: self.release_date(),
            cover_image_id: self.cover.as_ref().and_then(|c| c.image_id.clone()),
        }
    }
}

#[async_trait]
pub trait IgdbApi: Send + Sync {
    async fn fetch_game(&self, igdb_id: i64) -> Result<Option<IgdbGame>>;
}

#[derive(Debug, Clone)]
pub struct IgdbConfig {
    pub base_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl IgdbConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env_util::env_opt("IGDB_BASE_URL")
                .unwrap_or_else(|| IGDB_BASE_URL.to_string()),
            client_id: env_util::env_req("TWITCH_CLIENT_ID")
                .context("TWITCH_CLIENT_ID is required for IGDB")?,
            client_secret: env_util::env_req("TWITCH_CLIENT_SECRET")
                .context("TWITCH_CLIENT_SECRET is required for IGDB")?,
            max_retries: env_util::env_parse("IGDB_MAX_RETRIES", 5),
            backoff_ms: env_util::env_parse("IGDB_BACKOFF_MS", 1000),
        })
    }
}

#[derive(Debug, Deserialize)]
struct TwitchTokenResponse {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug, Clone)]
struct IgdbToken {
    access_token: String,
    expires_at: Instant,
}

pub struct IgdbClient {
    cfg: IgdbConfig,
    http: Client,
    token: Arc<Mutex<Option<IgdbToken>>>,
}

impl IgdbClient {
    pub fn new(cfg: IgdbConfig) -> Result<Self> {
        let user_agent = env_util::env_opt("IGDB_USER_AGENT")
            .unwrap_or_else(|| "gameshelf-sync/0.1 (+igdb)".to_string());
        let http = Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .context("failed to construct IGDB HTTP client")?;
        Ok(Self {
            cfg,
            http,
            token: Arc::new(Mutex::new(None)),
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(IgdbConfig::from_env()?)
    }

    async fn ensure_token(&self) -> Result<String> {
        {
            let guard = self.token.lock().await;
            if let Some(token) = guard.as_ref() {
                if token.expires_at > Instant::now() + Duration::from_secs(30) {
                    return Ok(token.access_token.clone());
                }
            }
        }
        let token = self.request_new_token().await?;
        let mut guard = self.token.lock().await;
        *guard = Some(token.clone());
        Ok(token.access_token)
    }

    async fn request_new_token(&self) -> Result<IgdbToken> {
        let response = self
            .http
            .post(TWITCH_TOKEN_URL)
            .query(&[
                ("client_id", self.cfg.client_id.as_str()),
                ("client_secret", self.cfg.client_secret.as_str()),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await
            .context("requesting Twitch OAuth token")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("twitch token request failed (status={status}): {text}"));
        }
        let token: TwitchTokenResponse = response.json().await?;
        let ttl = token.expires_in.saturating_sub(30).max(30);
        Ok(IgdbToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(ttl),
        })
    }

    fn retry_wait(&self, attempt: u32) -> Duration {
        let base = self.cfg.backoff_ms * (attempt as u64 + 1);
        let jitter = rand::thread_rng().gen_range(0..=self.cfg.backoff_ms / 4);
        Duration::from_millis(base + jitter)
    }

    async fn execute_request<T>(&self, endpoint: &str, body: String) -> Result<Vec<T>>
    where
        T: DeserializeOwned,
    {
        let url = format!("{}/{}", self.cfg.base_url.trim_end_matches('/'), endpoint);
        let mut attempt = 0u32;
        loop {
            let token = self.ensure_token().await?;
            let response = self
                .http
                .post(&url)
                .header("Client-ID", &self.cfg.client_id)
                .header("Content-Type", "text/plain")
                .header("Authorization", format!("Bearer {token}"))
                .body(body.clone())
                .send()
                .await;

            match response {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let text = resp.text().await?;
                        return serde_json::from_str(&text)
                            .map_err(|err| anyhow!("failed to parse IGDB payload ({err}): {text}"));
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        *self.token.lock().await = None;
                    }
                    let retryable = status == StatusCode::TOO_MANY_REQUESTS
                        || status == StatusCode::UNAUTHORIZED
                        || status.is_server_error();
                    if retryable && attempt < self.cfg.max_retries {
                        let wait = self.retry_wait(attempt);
                        let wait_ms = wait.as_millis() as u64;
                        warn!(%status, attempt, wait_ms, "igdb request retry");
                        tokio::time::sleep(wait).await;
                        attempt += 1;
                        continue;
                    }
                    let text = resp.text().await.unwrap_or_default();
                    return Err(anyhow!("igdb request failed (status={status}): {text}"));
                }
                Err(err) => {
                    if attempt >= self.cfg.max_retries {
                        return Err(err.into());
                    }
                    tokio::time::sleep(self.retry_wait(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }
}

pub fn game_query(igdb_id: i64) -> String {
    format!("fields id,name,first_release_date,cover.image_id; where id = {igdb_id}; limit 1;")
}

#[async_trait]
impl IgdbApi for IgdbClient {
    #[instrument(skip(self))]
    async fn fetch_game(&self, igdb_id: i64) -> Result<Option<IgdbGame>> {
        let games: Vec<IgdbGame> = self.execute_request("games", game_query(igdb_id)).await?;
        debug!(returned = games.len(), "igdb games response");
        Ok(games.into_iter().find(|g| g.id == igdb_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn game_payload_maps_to_metadata_update() {
        let game: IgdbGame = serde_json::from_value(json!({
            "id": 1942,
            "name": "  The Witcher 3: Wild Hunt ",
            "first_release_date": 1431993600,
            "cover": {"id": 89386, "image_id": "co1wyy"}
        }))
        .unwrap();
        let update = game.to_update();
        assert_eq!(update.name.as_deref(), Some("The Witcher 3: Wild Hunt"));
        assert_eq!(
            update.first_release_date,
            Some(Utc.with_ymd_and_hms(2015, 5, 19, 0, 0, 0).unwrap())
        );
        assert_eq!(update.cover_image_id.as_deref(), Some("co1wyy"));
    }

    #[test]
    fn sparse_payload_leaves_fields_unset() {
        let game: IgdbGame = serde_json::from_value(json!({"id": 7, "name": ""})).unwrap();
        assert_eq!(game.to_update(), GameMetadataUpdate::default());
    }

    #[test]
    fn query_targets_a_single_id() {
        assert_eq!(
            game_query(1942),
            "fields id,name,first_release_date,cover.image_id; where id = 1942; limit 1;"
        );
    }
}
