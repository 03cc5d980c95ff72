use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use super::handlers::{
    discover_json, epg_xml, fallback_handler, health_check, iptv_channel, lineup_json,
    lineup_status_json, metrics_text, playlist_m3u, tune_tuner,
};
use super::state::AppState;

/// Create the Axum router with all routes configured
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // HDHomeRun emulation endpoints
        .route("/discover.json", get(discover_json))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        .route("/tune/{tuner}", get(tune_tuner))
        // IPTV surface
        .route("/iptv/channel/{file}", get(iptv_channel))
        .route("/iptv/playlist.m3u", get(playlist_m3u))
        .route("/epg.xml", get(epg_xml))
        // Observability
        .route("/metrics", get(metrics_text))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
