use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// `external_game_sources.id` of the Steam catalog.
pub const STEAM_SOURCE_ID: i64 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Game {
    pub id: i64,
    pub igdb_id: Option<i64>,
    pub name: String,
    pub first_release_date: Option<DateTime<Utc>>,
    pub update_priority: i32,
    pub cover_image_id: Option<String>,
    pub hero_image_id: Option<String>,
    pub logo_image_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExternalGameSource {
    pub id: i64,
    pub igdb_category: i32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(anyhow::anyhow!("unknown sync status: {other}")),
        }
    }
}

/// A `game_external_sources` row: one game linked to one external catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameExternalSource {
    pub id: i64,
    pub game_id: i64,
    pub external_game_source_id: i64,
    pub external_uid: String,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A link with its owning game and source definition eager-loaded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkWithGame {
    pub link: GameExternalSource,
    pub game: Game,
    pub source: ExternalGameSource,
}

/// Status write issued by the chain after each attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncStatusUpdate {
    pub status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// Fields copied from a SteamSpy `appdetails` payload.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SteamGameFields {
    pub owners: Option<String>,
    pub average_forever: i32,
    pub ccu: i32,
    pub price: Option<i32>,
    pub tags: IndexMap<String, i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SteamGameData {
    pub id: i64,
    pub game_id: i64,
    pub steam_app_id: i64,
    pub owners: Option<String>,
    pub average_forever: i32,
    pub ccu: i32,
    pub price: Option<i32>,
    pub tags: IndexMap<String, i64>,
    pub updated_at: DateTime<Utc>,
}

impl SteamGameData {
    pub fn owners_bounds(&self) -> Option<(u64, u64)> {
        self.owners.as_deref().and_then(parse_owners_range)
    }
}

/// Parse SteamSpy's "1,000,000 .. 2,000,000" owner estimate into numeric bounds.
pub fn parse_owners_range(raw: &str) -> Option<(u64, u64)> {
    static RANGE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = RANGE
        .get_or_init(|| Regex::new(r"^\s*([\d,]+)\s*\.\.\s*([\d,]+)\s*$").ok())
        .as_ref()?;
    let caps = re.captures(raw)?;
    let low: u64 = caps[1].replace(',', "").parse().ok()?;
    let high: u64 = caps[2].replace(',', "").parse().ok()?;
    (low <= high).then_some((low, high))
}

/// Metadata written back to `games` by the IGDB refresh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameMetadataUpdate {
    pub name: Option<String>,
    pub first_release_date: Option<DateTime<Utc>>,
    pub cover_image_id: Option<String>,
}

/// Artwork identifiers written back to `games` by the SteamGridDB refresh.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GameArtworkUpdate {
    pub hero_image_id: Option<String>,
    pub logo_image_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatusCounts {
    pub pending: i64,
    pub synced: i64,
    pub failed: i64,
}
