// API request/response models (DTOs)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::database_ops::models::{SteamGameData, SyncStatusCounts};
use crate::database_ops::scheduler::StaleLink;

/// Standard API response wrapper
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<Meta>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            meta: Some(Meta::now()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            meta: Some(Meta::now()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Meta {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    pub version: String,
}

impl Meta {
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
            request_id: uuid::Uuid::new_v4().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    /// "connected", "disconnected" or "not_configured".
    pub database: String,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SyncTriggerRequest {
    /// Report what would be seeded without enqueueing.
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Serialize)]
pub struct SyncTriggerResponse {
    pub dry_run: bool,
    pub selected: usize,
    pub seeded: Option<(i64, Option<i64>)>,
    pub queued: bool,
    /// First few selected links, for display.
    pub preview: Vec<StaleLink>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub source_id: i64,
    pub counts: SyncStatusCounts,
    pub total: i64,
}

#[derive(Debug, Serialize)]
pub struct GameSteamDataResponse {
    pub game_id: i64,
    pub steam: SteamGameData,
    /// Parsed `owners` range, when SteamSpy's format was recognised.
    pub owners_min: Option<u64>,
    pub owners_max: Option<u64>,
}
