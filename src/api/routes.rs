use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        .service(
            web::scope("/api/v1")
                .route(
                    "/sync/steam/trigger",
                    web::post().to(handlers::trigger_steam_sync),
                )
                .route(
                    "/sync/steam/status",
                    web::get().to(handlers::steam_sync_status),
                )
                .route("/games/{id}/steam", web::get().to(handlers::game_steam_data)),
        );
}
