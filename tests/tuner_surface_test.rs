//! Integration tests for the tuner and IPTV HTTP surface
//!
//! Boots the Axum router on an ephemeral port against an in-memory SQLite
//! database and exercises the appliance contracts: discovery shape, lineup
//! uniqueness, lineup/EPG agreement, tune failure semantics, and the MPEG-TS
//! body on a successful tune.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::SqliteConnection;
use tokio::net::TcpListener;

use telecast::broadcast::{BroadcastShared, BroadcasterRegistry, RestartGate};
use telecast::config::{Config, HealthConfig, PoolConfig};
use telecast::db::run_migrations;
use telecast::epg::{EpgCache, EpgGenerator};
use telecast::library::UrlResolver;
use telecast::playout::PlayoutEngine;
use telecast::server::{routes::create_router, AppState};
use telecast::transcode::{Accelerator, AcceleratorSelection, ProcessPool};

/// In-memory database with the full schema and a small channel lineup
fn seeded_pool() -> Pool<ConnectionManager<SqliteConnection>> {
    let manager = ConnectionManager::<SqliteConnection>::new(":memory:");
    let pool = Pool::builder()
        .max_size(1)
        .build(manager)
        .expect("Failed to create test pool");

    let mut conn = pool.get().expect("Failed to get connection");
    run_migrations(&mut conn).expect("Failed to run migrations");

    diesel::sql_query(
        "INSERT INTO channels (id, number, name, enabled, logo) VALUES
         (1, '7', 'Retro Movies', 1, NULL),
         (2, '1984.1', 'Docs', 1, 'http://host/docs.png'),
         (3, '9', 'Dark Channel', 0, NULL)",
    )
    .execute(&mut conn)
    .expect("seed channels");

    pool
}

fn test_state(pool: Pool<ConnectionManager<SqliteConnection>>) -> AppState {
    let config = Arc::new(Config {
        device_id: Some("0A1B2C3D".to_string()),
        ..Config::default()
    });
    let process_pool = Arc::new(ProcessPool::with_probes(
        PoolConfig::default(),
        // The stub never streams; tune tests only rely on the keepalive
        // preload, not transcoder output
        "true".to_string(),
        Box::new(|| None),
        Box::new(|| None),
    ));
    let engine = Arc::new(PlayoutEngine::new(pool.clone()));
    let gate = Arc::new(RestartGate::new(HealthConfig::default()));
    let shared = Arc::new(BroadcastShared {
        db: pool.clone(),
        pool: process_pool.clone(),
        engine: engine.clone(),
        resolver: Arc::new(UrlResolver::new(vec![])),
        accelerator: Arc::new(AcceleratorSelection::new(vec![Accelerator::Software])),
        gate: gate.clone(),
        config: config.clone(),
    });
    let registry = BroadcasterRegistry::new(shared);
    let epg = Arc::new(EpgGenerator::new(
        pool.clone(),
        engine,
        Duration::from_secs(48 * 3600),
    ));

    AppState::new(
        pool,
        config,
        registry,
        epg,
        Arc::new(EpgCache::new()),
        gate,
        process_pool,
    )
}

/// Start a test server on a random available port
async fn start_test_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    let state = test_state(seeded_pool());
    let app = create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind to port");
    let addr = listener.local_addr().expect("Failed to get local address");

    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("Server error");
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr, handle)
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, _server) = start_test_server().await;
    let response = reqwest::get(format!("http://{}/health", addr))
        .await
        .expect("request failed");
    assert_eq!(response.status(), 200);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn test_discover_device_id_is_eight_uppercase_hex() {
    let (addr, _server) = start_test_server().await;
    let body: serde_json::Value = reqwest::get(format!("http://{}/discover.json", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let device_id = body["DeviceID"].as_str().expect("DeviceID present");
    assert_eq!(device_id.len(), 8);
    assert!(device_id
        .chars()
        .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    assert_eq!(body["TunerCount"], 4);
    assert!(body["LineupURL"].as_str().unwrap().ends_with("/lineup.json"));
}

#[tokio::test]
async fn test_lineup_unique_numbers_and_nonempty_urls() {
    let (addr, _server) = start_test_server().await;
    let lineup: Vec<serde_json::Value> = reqwest::get(format!("http://{}/lineup.json", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    // Enabled channels only: the disabled one is absent
    assert_eq!(lineup.len(), 2);

    let mut numbers: Vec<&str> = lineup
        .iter()
        .map(|entry| entry["GuideNumber"].as_str().unwrap())
        .collect();
    for entry in &lineup {
        assert!(!entry["URL"].as_str().unwrap().is_empty());
        assert!(!entry["GuideName"].as_str().unwrap().is_empty());
    }
    let total = numbers.len();
    numbers.sort_unstable();
    numbers.dedup();
    assert_eq!(numbers.len(), total, "guide numbers must be unique");
    assert!(numbers.contains(&"1984.1"));
}

#[tokio::test]
async fn test_lineup_and_epg_channel_sets_agree() {
    let (addr, _server) = start_test_server().await;

    let lineup: Vec<serde_json::Value> = reqwest::get(format!("http://{}/lineup.json", addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let epg = reqwest::get(format!("http://{}/epg.xml", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    for entry in &lineup {
        let number = entry["GuideNumber"].as_str().unwrap();
        assert!(
            epg.contains(&format!("<channel id=\"{}\">", number)),
            "lineup channel {} missing from EPG",
            number
        );
    }
}

#[tokio::test]
async fn test_unknown_channel_is_404() {
    let (addr, _server) = start_test_server().await;
    let response = reqwest::get(format!("http://{}/iptv/channel/404.ts", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_disabled_channel_is_403() {
    let (addr, _server) = start_test_server().await;
    let response = reqwest::get(format!("http://{}/iptv/channel/9.ts", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn test_tune_resolves_decimal_numbers_with_whitespace() {
    let (addr, _server) = start_test_server().await;
    // The tuner path: whitespace-padded auto:v target against a decimal
    // channel number. 200 with an MPEG-TS content type proves resolution.
    let response = reqwest::get(format!(
        "http://{}/tune/tuner0?channel=auto%3Av%201984.1%20",
        addr
    ))
    .await
    .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "video/mp2t"
    );
}

#[tokio::test]
async fn test_tuned_body_starts_with_ts_sync_byte() {
    let (addr, _server) = start_test_server().await;
    let response = reqwest::get(format!("http://{}/iptv/channel/7.ts", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The keepalive preload means the first chunk is valid MPEG-TS even
    // with no transcoder behind it
    let mut stream = response;
    let chunk = tokio::time::timeout(Duration::from_secs(2), stream.chunk())
        .await
        .expect("first chunk within deadline")
        .expect("chunk read")
        .expect("non-empty body");
    assert_eq!(chunk[0], 0x47);
    assert_eq!(chunk.len() % 188, 0);
}

#[tokio::test]
async fn test_playlist_matches_lineup() {
    let (addr, _server) = start_test_server().await;
    let playlist = reqwest::get(format!("http://{}/iptv/playlist.m3u", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(playlist.starts_with("#EXTM3U"));
    assert!(playlist.contains("tvg-id=\"7\""));
    assert!(playlist.contains("/iptv/channel/1984.1.ts"));
    assert!(!playlist.contains("Dark Channel"));
}

#[tokio::test]
async fn test_metrics_exposition() {
    let (addr, _server) = start_test_server().await;
    let body = reqwest::get(format!("http://{}/metrics", addr))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(body.contains("ffmpeg_processes_active"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (addr, _server) = start_test_server().await;
    let response = reqwest::get(format!("http://{}/definitely/not/here", addr))
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
