pub mod api;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::config::ServerConfig;
use crate::state::AppState;

pub fn router(state: AppState, cfg: &ServerConfig) -> Router {
    let body_limit = usize::try_from(cfg.max_upload_bytes).unwrap_or(usize::MAX);

    Router::new()
        .route("/", get(api::health))
        .route("/upload", post(api::upload))
        .route("/videos/:uid", get(api::list_videos))
        .route("/stream/start", post(api::start_stream))
        .route("/stream/stop", post(api::stop_stream))
        .route("/stream/status", get(api::stream_status))
        .route("/stream/sessions", get(api::list_sessions))
        .route("/stream/logs/:slot_id", get(api::stream_logs))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cfg.cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
