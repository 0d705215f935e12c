// HTTP request handlers for API endpoints

use crate::api::models::*;
use crate::api::server::AppState;
use actix_web::{web, HttpResponse, Result};

const PREVIEW_LEN: usize = 10;

fn internal_error(context: &str, err: anyhow::Error) -> HttpResponse {
    tracing::error!(error = %err, "{context}");
    HttpResponse::InternalServerError().json(ApiResponse::<()>::error(format!("{context}: {err}")))
}

pub async fn health_check(state: web::Data<AppState>) -> Result<HttpResponse> {
    let database = match &state.db {
        Some(db) if db.ping().await => "connected",
        Some(_) => "disconnected",
        None => "not_configured",
    };

    let response = ApiResponse::success(HealthResponse {
        status: "healthy".to_string(),
        database: database.to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
    });

    Ok(HttpResponse::Ok().json(response))
}

/// Seed a Steam sync chain from the current stale selection.
pub async fn trigger_steam_sync(
    state: web::Data<AppState>,
    payload: Option<web::Json<SyncTriggerRequest>>,
) -> Result<HttpResponse> {
    let request = payload.map(web::Json::into_inner).unwrap_or_default();
    tracing::info!(dry_run = request.dry_run, "steam sync trigger requested");

    let selected = match state.selector.select_stale_links().await {
        Ok(selected) => selected,
        Err(e) => return Ok(internal_error("stale selection failed", e)),
    };
    let preview = selected.iter().take(PREVIEW_LEN).cloned().collect();

    if request.dry_run {
        let seeded = selected
            .first()
            .map(|first| (first.link_id, selected.get(1).map(|s| s.link_id)));
        return Ok(HttpResponse::Ok().json(ApiResponse::success(SyncTriggerResponse {
            dry_run: true,
            selected: selected.len(),
            seeded,
            queued: false,
            preview,
        })));
    }

    match state.selector.seed_chain().await {
        Ok(outcome) => Ok(HttpResponse::Accepted().json(ApiResponse::success(
            SyncTriggerResponse {
                dry_run: false,
                selected: outcome.selected,
                seeded: outcome.seeded,
                queued: outcome.queued,
                preview,
            },
        ))),
        Err(e) => Ok(internal_error("seeding sync chain failed", e)),
    }
}

pub async fn steam_sync_status(state: web::Data<AppState>) -> Result<HttpResponse> {
    let source_id = state.selector.config().source_id;
    match state.store.status_counts(source_id).await {
        Ok(counts) => {
            let total = counts.pending + counts.synced + counts.failed;
            Ok(HttpResponse::Ok().json(ApiResponse::success(SyncStatusResponse {
                source_id,
                counts,
                total,
            })))
        }
        Err(e) => Ok(internal_error("status query failed", e)),
    }
}

pub async fn game_steam_data(
    state: web::Data<AppState>,
    path: web::Path<i64>,
) -> Result<HttpResponse> {
    let game_id = path.into_inner();
    match state.store.steam_game_data_for_game(game_id).await {
        Ok(Some(steam)) => {
            let bounds = steam.owners_bounds();
            Ok(HttpResponse::Ok().json(ApiResponse::success(GameSteamDataResponse {
                game_id,
                owners_min: bounds.map(|b| b.0),
                owners_max: bounds.map(|b| b.1),
                steam,
            })))
        }
        Ok(None) => Ok(HttpResponse::NotFound().json(ApiResponse::<()>::error(format!(
            "no Steam data for game {game_id}"
        )))),
        Err(e) => Ok(internal_error("steam data lookup failed", e)),
    }
}
