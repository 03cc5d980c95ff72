use std::sync::Arc;

use crate::broadcast::{BroadcasterRegistry, RestartGate};
use crate::config::Config;
use crate::db::{DbPool, DbPooledConnection};
use crate::epg::{EpgCache, EpgGenerator};
use crate::transcode::ProcessPool;

/// Application state for the HTTP surface
///
/// Everything the handlers need: the database pool, the broadcaster
/// registry, the EPG generator with its last-good cache, and the
/// supervision handles.
#[derive(Clone)]
pub struct AppState {
    pool: DbPool,
    pub config: Arc<Config>,
    pub registry: Arc<BroadcasterRegistry>,
    pub epg: Arc<EpgGenerator>,
    pub epg_cache: Arc<EpgCache>,
    pub gate: Arc<RestartGate>,
    pub process_pool: Arc<ProcessPool>,
}

impl AppState {
    pub fn new(
        pool: DbPool,
        config: Arc<Config>,
        registry: Arc<BroadcasterRegistry>,
        epg: Arc<EpgGenerator>,
        epg_cache: Arc<EpgCache>,
        gate: Arc<RestartGate>,
        process_pool: Arc<ProcessPool>,
    ) -> Self {
        Self {
            pool,
            config,
            registry,
            epg,
            epg_cache,
            gate,
            process_pool,
        }
    }

    /// Get a database connection from the pool
    pub fn get_connection(&self) -> Result<DbPooledConnection, r2d2::Error> {
        self.pool.get()
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }
}
