//! SteamGridDB artwork lookup keyed by Steam app id, and the refresh that writes
//! hero/logo identifiers back onto `games`.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::database_ops::models::{GameArtworkUpdate, STEAM_SOURCE_ID};
use crate::database_ops::store::SyncStore;
use crate::util::env as env_util;

const DEFAULT_BASE_URL: &str = "https://www.steamgriddb.com/api/v2";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GridAsset {
    pub id: i64,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GridResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<GridAsset>,
    #[serde(default)]
    errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtworkKind {
    Hero,
    Logo,
}

impl ArtworkKind {
    fn path(self) -> &'static str {
        match self {
            ArtworkKind::Hero => "heroes",
            ArtworkKind::Logo => "logos",
        }
    }
}

#[async_trait]
pub trait ArtworkApi: Send + Sync {
    /// First asset of a kind for a Steam app id; `None` when SteamGridDB has none.
    async fn fetch_asset(&self, kind: ArtworkKind, steam_app_id: &str) -> Result<Option<GridAsset>>;
}

#[derive(Debug, Clone)]
pub struct SteamGridDbConfig {
    pub base_url: String,
    pub api_key: String,
}

impl SteamGridDbConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env_util::env_opt("STEAMGRIDDB_BASE_URL")
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            api_key: env_util::env_req("STEAMGRIDDB_API_KEY")?,
        })
    }
}

pub struct SteamGridDbClient {
    http: Client,
    cfg: SteamGridDbConfig,
}

impl SteamGridDbClient {
    pub fn new(cfg: SteamGridDbConfig) -> Result<Self> {
        let http = Client::builder()
            .user_agent("gameshelf-sync/0.1 (+steamgriddb)")
            .timeout(Duration::from_secs(20))
            .build()
            .context("failed to construct SteamGridDB HTTP client")?;
        Ok(Self { http, cfg })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(SteamGridDbConfig::from_env()?)
    }

    fn asset_url(&self, kind: ArtworkKind, steam_app_id: &str) -> String {
        format!(
            "{}/{}/steam/{}",
            self.cfg.base_url.trim_end_matches('/'),
            kind.path(),
            urlencoding::encode(steam_app_id.trim())
        )
    }
}

fn first_asset(body: &str) -> Result<Option<GridAsset>> {
    let parsed: GridResponse =
        serde_json::from_str(body).context("malformed SteamGridDB payload")?;
    if !parsed.success {
        return Err(anyhow!("SteamGridDB error: {}", parsed.errors.join("; ")));
    }
    Ok(parsed.data.into_iter().next())
}

#[async_trait]
impl ArtworkApi for SteamGridDbClient {
    async fn fetch_asset(
        &self,
        kind: ArtworkKind,
        steam_app_id: &str,
    ) -> Result<Option<GridAsset>> {
        let url = self.asset_url(kind, steam_app_id);
        debug!(%url, "fetching SteamGridDB asset");
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.cfg.api_key)
            .send()
            .await
            .context("SteamGridDB request failed")?;
        let status = resp.status();
        // Unknown app ids come back as 404.
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("SteamGridDB returned {status}: {text}"));
        }
        first_asset(&text)
    }
}

/// Look up hero and logo for the game's Steam link and store their ids.
/// Returns the update applied; an empty update means nothing was found.
pub async fn refresh_artwork(
    store: &dyn SyncStore,
    api: &dyn ArtworkApi,
    game_id: i64,
) -> Result<GameArtworkUpdate> {
    let Some(app_id) = store.external_uid_for_game(game_id, STEAM_SOURCE_ID).await? else {
        warn!(game_id, "game has no Steam link; skipping artwork refresh");
        return Ok(GameArtworkUpdate::default());
    };
    let hero = api.fetch_asset(ArtworkKind::Hero, &app_id).await?;
    let logo = api.fetch_asset(ArtworkKind::Logo, &app_id).await?;
    let update = GameArtworkUpdate {
        hero_image_id: hero.map(|a| a.id.to_string()),
        logo_image_id: logo.map(|a| a.id.to_string()),
    };
    if update == GameArtworkUpdate::default() {
        info!(game_id, app_id = %app_id, "no SteamGridDB artwork found");
        return Ok(update);
    }
    store.update_game_artwork(game_id, &update).await?;
    info!(
        game_id,
        app_id = %app_id,
        hero = update.hero_image_id.is_some(),
        logo = update.logo_image_id.is_some(),
        "artwork refreshed"
    );
    Ok(update)
}
