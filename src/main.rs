//! Telecast server entrypoint: wire the engine together and serve.

use std::sync::Arc;

use diesel::prelude::*;
use tracing_subscriber::EnvFilter;

use telecast::broadcast::{
    prewarm_channels, BroadcastShared, BroadcasterRegistry, HealthSupervisor, RestartGate,
};
use telecast::config::Config;
use telecast::credentials::CredentialManager;
use telecast::db::{self, DbConnection};
use telecast::epg::{EpgCache, EpgGenerator};
use telecast::library::{build_resolvers, UrlResolver};
use telecast::metadata::MetadataPipeline;
use telecast::playout::PlayoutEngine;
use telecast::scheduler::EpgRefreshScheduler;
use telecast::server::{start_server, AppState};
use telecast::transcode::{check_transcoder_available, AcceleratorSelection, ProcessPool};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::from_env());
    tracing::info!(
        port = config.port,
        db = %config.database_path.display(),
        "telecast starting"
    );

    // The external toolchain is a hard requirement; fail loudly now rather
    // than on the first tune
    check_transcoder_available()?;

    // Database: create, migrate, size the pool from the channel count
    let db_path = db::prepare_db_path(&config.database_path)?;
    let database_url = db_path.to_string_lossy().to_string();
    {
        let mut conn = db::establish_connection(&database_url)
            .map_err(|e| format!("Failed to connect to database: {}", e))?;
        db::run_migrations(&mut conn)
            .map_err(|e| format!("Failed to run migrations: {}", e))?;
    }
    let enabled_channels = count_enabled_channels(&database_url)?;
    let db = DbConnection::new(&database_url, enabled_channels)?;

    // Engine plumbing
    let credentials = CredentialManager::new(config.data_dir.clone())?;
    let resolvers = {
        let mut conn = db.get_connection()?;
        build_resolvers(&mut conn, &credentials)
    };
    let resolver = Arc::new(UrlResolver::new(resolvers));

    let process_pool = Arc::new(ProcessPool::new(config.pool.clone()));
    let reaper = process_pool.clone().spawn_reaper();

    let engine = Arc::new(PlayoutEngine::new(db.clone_pool()));
    let gate = Arc::new(RestartGate::new(config.health.clone()));
    let accelerator = Arc::new(AcceleratorSelection::platform_default());
    // Prove the encoder now so the first tune skips the probe
    let selected = accelerator.get().await;
    tracing::info!(encoder = selected.h264_encoder(), "transcode encoder ready");

    let shared = Arc::new(BroadcastShared {
        db: db.clone_pool(),
        pool: process_pool.clone(),
        engine: engine.clone(),
        resolver: resolver.clone(),
        accelerator: accelerator.clone(),
        gate: gate.clone(),
        config: config.clone(),
    });
    let registry = BroadcasterRegistry::new(shared);

    // Health supervision
    let supervisor = HealthSupervisor::new(registry.clone(), gate.clone(), config.health.clone());
    let supervisor_task = supervisor.spawn();

    // EPG generation with last-good caching and a scheduled refresh
    let epg = Arc::new(EpgGenerator::new(
        db.clone_pool(),
        engine.clone(),
        config.epg_horizon,
    ));
    let epg_cache = Arc::new(EpgCache::new());
    let pipeline = Arc::new(MetadataPipeline::new(
        std::env::var("TELECAST_TVDB_TOKEN").ok(),
        std::env::var("TELECAST_TMDB_API_KEY").ok(),
    ));
    let epg_scheduler = EpgRefreshScheduler::new(epg.clone(), epg_cache.clone(), pipeline.clone());
    if let Err(e) = epg_scheduler.start().await {
        tracing::error!("EPG refresh scheduler failed to start: {}", e);
    }

    // Bounded agent, off unless explicitly enabled
    if config.agent.enabled {
        let agent = Arc::new(telecast::agent::BoundedAgent::new(
            config.agent.clone(),
            telecast::agent::AgentDeps {
                gate: gate.clone(),
                pool: process_pool.clone(),
                registry: registry.clone(),
                pipeline: pipeline.clone(),
                engine: engine.clone(),
                epg: epg.clone(),
                epg_cache: epg_cache.clone(),
            },
        ));
        let agent_task = agent.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                agent_task.sample_rss();
                let report = agent_task.run(None).await;
                if !report.executed.is_empty() {
                    tracing::info!(tools = ?report.executed, "agent loop finished");
                }
            }
        });
        tracing::info!("bounded remediation agent enabled");
    }

    // LAN discovery
    tokio::spawn(telecast::server::ssdp::run_announcer(
        config.port,
        config.device_id.clone(),
    ));

    // Event-loop lag: how late a 1s tick actually fires
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            let before = std::time::Instant::now();
            ticker.tick().await;
            let lag = before.elapsed().as_secs_f64() - 1.0;
            if lag > 0.0 {
                telecast::metrics::system::EVENT_LOOP_LAG.observe(lag);
            }
        }
    });

    // Always-on channels start staggered; everything else starts on first
    // tune
    prewarm_channels(&registry, &config).await;

    let state = AppState::new(
        db.clone_pool(),
        config.clone(),
        registry.clone(),
        epg,
        epg_cache,
        gate,
        process_pool.clone(),
    );

    let result = tokio::select! {
        served = start_server(state) => served.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    // Graceful teardown: stop broadcasters, then close the pool so every
    // transcoder dies with us
    registry.shutdown().await;
    process_pool.close();
    reaper.abort();
    supervisor_task.abort();
    let _ = epg_scheduler.stop().await;

    result
}

fn count_enabled_channels(
    database_url: &str,
) -> Result<u32, Box<dyn std::error::Error + Send + Sync>> {
    use telecast::db::schema::channels::dsl;
    let mut conn = db::establish_connection(database_url)
        .map_err(|e| format!("Failed to connect to database: {}", e))?;
    let count: i64 = dsl::channels
        .filter(dsl::enabled.eq(1))
        .count()
        .get_result(&mut conn)?;
    Ok(count.max(0) as u32)
}
