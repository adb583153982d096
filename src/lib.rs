pub mod api;
pub mod config;
pub mod error;
pub mod identity;
pub mod room;
pub mod server;
pub mod stats;
pub mod store;
pub mod ws;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
};

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::{App, AppState};

/// Builds the route table. Every route and the fallback sit behind the CORS
/// layer; a successful upgrade has its CORS headers stripped again.
pub fn create_app(state: AppState, config: &Config) -> Router {
    let cors = server::cors_layer(&config.allowed_origins);

    let connect = Router::new()
        .route("/connect/{room_id}", get(ws::connect_handler))
        .layer(cors.clone())
        .layer(middleware::map_response(ws::strip_cors_from_upgrade));

    let http = Router::new()
        .route(
            "/assets/{id}",
            get(api::assets::get_asset).post(api::assets::put_asset),
        )
        .route("/stats/total", get(api::stats::total))
        .route("/stats/connections", get(api::stats::connections))
        .route("/stats/room", get(api::stats::room_count))
        .route("/stats/heartbeat", post(api::stats::heartbeat))
        .route("/health", get(api::health))
        .fallback(api::not_found)
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(cors);

    connect.merge(http).with_state(state)
}
