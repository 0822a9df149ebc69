//! HTTP routes: the `/audio` WebSocket, the landing page, health and config.

pub mod config;
pub mod landing;

pub use config::get_config;
pub use landing::{landing_page, not_found};

use crate::{health, websocket};
use actix_web::web;

/// Registers every route. Shared by `main` and the route tests.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/audio", web::get().to(websocket::audio_websocket))
        .route("/", web::get().to(landing_page))
        .route("/index.html", web::get().to(landing_page))
        .route("/health", web::get().to(health::health_check))
        .service(
            web::scope("/api/v1")
                .route("/health", web::get().to(health::health_check))
                .route("/metrics", web::get().to(health::detailed_metrics))
                .route("/config", web::get().to(get_config)),
        )
        .default_service(web::to(not_found));
}
