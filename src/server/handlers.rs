//! HTTP handlers for the tuner and IPTV surfaces
//!
//! Tuning semantics: an unknown channel is 404, a disabled channel is 403,
//! and a tuned channel always receives a valid MPEG-TS body for the life of
//! the connection. During cold start a short run of null transport packets
//! keeps the client fed until the transcoder's first real bytes arrive.

use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::hdhr::{
    self, derive_base_url, find_channel_by_number, parse_tune_target,
};
use super::m3u;
use super::state::AppState;
use crate::metrics;

/// Health check response structure
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// Health check endpoint handler
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
        }),
    )
}

/// Fallback handler for unknown routes
pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn host_of(headers: &HeaderMap) -> Option<&str> {
    headers.get(header::HOST).and_then(|v| v.to_str().ok())
}

fn generate_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// HDHomeRun discovery endpoint
pub async fn discover_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let base_url = derive_base_url(host_of(&headers), state.port());
    let response = hdhr::generate_discover_response(
        &base_url,
        state.config.device_id.as_deref(),
        state.config.tuner_count,
    );
    Json(response)
}

/// HDHomeRun lineup endpoint
pub async fn lineup_json(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("lineup: database connection failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    })?;
    let base_url = derive_base_url(host_of(&headers), state.port());
    let lineup = hdhr::generate_lineup(&mut conn, &base_url).map_err(|e| {
        tracing::error!("lineup: generation failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        )
    })?;
    Ok(Json(lineup))
}

/// HDHomeRun lineup status endpoint
pub async fn lineup_status_json() -> impl IntoResponse {
    Json(hdhr::generate_lineup_status())
}

#[derive(Deserialize)]
pub struct TuneQuery {
    pub channel: Option<String>,
}

/// Tuner endpoint: `GET /tune/tuner{K}?channel=auto:v{N}`
pub async fn tune_tuner(
    State(state): State<AppState>,
    Path(tuner): Path<String>,
    Query(query): Query<TuneQuery>,
) -> Response {
    if !tuner.starts_with("tuner") {
        return StatusCode::NOT_FOUND.into_response();
    }
    let Some(raw_channel) = query.channel else {
        return (StatusCode::BAD_REQUEST, "missing channel parameter").into_response();
    };
    let number = parse_tune_target(&raw_channel);
    stream_channel(&state, &number).await
}

/// IPTV endpoint: `GET /iptv/channel/{N}.ts`
pub async fn iptv_channel(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Response {
    let number = file.strip_suffix(".ts").unwrap_or(&file);
    stream_channel(&state, number).await
}

/// Attach a client to a channel's broadcaster and stream its queue
async fn stream_channel(state: &AppState, raw_number: &str) -> Response {
    let mut conn = match state.get_connection() {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!("tune: database connection failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };

    let channel = match find_channel_by_number(&mut conn, raw_number) {
        Ok(Some(channel)) => channel,
        Ok(None) => return StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            tracing::error!("tune: channel lookup failed: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response();
        }
    };
    if !channel.is_enabled() {
        return StatusCode::FORBIDDEN.into_response();
    }
    let Some(channel_id) = channel.id else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // The attach preloads null-packet keepalive so the client sees valid
    // transport stream bytes during the transcoder's cold start; the
    // connection is never closed to signal startup delays
    let broadcaster = state.registry.get_or_create(channel_id);
    broadcaster.clone().start();
    let (stream, session_id) = broadcaster.attach_client();

    tracing::info!(
        channel = %channel.number,
        session_id = %session_id,
        "client tuned"
    );

    let body = Body::from_stream(stream);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "video/mp2t")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// M3U playlist endpoint
pub async fn playlist_m3u(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let mut conn = state.get_connection().map_err(|e| {
        tracing::error!("playlist: database connection failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Service temporarily unavailable".to_string(),
        )
    })?;

    let base_url = derive_base_url(host_of(&headers), state.port());
    let content = m3u::generate_m3u_playlist(&mut conn, &base_url).map_err(|e| {
        tracing::error!("playlist: generation failed: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Unable to generate playlist".to_string(),
        )
    })?;

    let etag = generate_etag(&content);
    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("audio/x-mpegurl"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        response_headers.insert(header::ETAG, value);
    }
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok((response_headers, content))
}

/// XMLTV EPG endpoint.
///
/// A failed generation serves the previous cycle's document; the validator
/// never lets a broken guide out.
pub async fn epg_xml(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let document = match state.epg.generate(Utc::now()).await {
        Ok(document) => {
            state.epg_cache.store(document.clone());
            document
        }
        Err(e) => {
            metrics::epg::XMLTV_VALIDATION_ERRORS.inc();
            tracing::error!("EPG generation failed, serving last good document: {}", e);
            match state.epg_cache.last_good() {
                Some(previous) => previous,
                None => {
                    return Err((
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "EPG unavailable".to_string(),
                    ))
                }
            }
        }
    };

    let etag = format!("\"{}\"", generate_etag(&document));
    if let Some(client_etag) = headers.get(header::IF_NONE_MATCH) {
        if client_etag.to_str().map(|v| v == etag).unwrap_or(false) {
            let mut response_headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&etag) {
                response_headers.insert(header::ETAG, value);
            }
            return Ok((StatusCode::NOT_MODIFIED, response_headers, String::new()));
        }
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&etag) {
        response_headers.insert(header::ETAG, value);
    }
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok((StatusCode::OK, response_headers, document))
}

/// Prometheus text exposition endpoint
pub async fn metrics_text() -> impl IntoResponse {
    metrics::refresh_system_gauges();
    let body = metrics::gather_text();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_etag_is_stable_per_content() {
        assert_eq!(generate_etag("abc"), generate_etag("abc"));
        assert_ne!(generate_etag("abc"), generate_etag("abd"));
    }
}
