use std::path::{Path, PathBuf};

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, CustomizeConnection, Pool, PooledConnection};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

use crate::metrics;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

pub type DbPool = Pool<ConnectionManager<SqliteConnection>>;
pub type DbPooledConnection = PooledConnection<ConnectionManager<SqliteConnection>>;

/// Per-connection pragmas for a server workload.
///
/// WAL keeps readers (EPG, lineup) unblocked while the playout engine
/// advances anchors; the busy timeout absorbs writer contention instead of
/// surfacing SQLITE_BUSY to handlers.
#[derive(Debug, Clone, Copy)]
struct ConnectionPragmas;

impl CustomizeConnection<SqliteConnection, diesel::r2d2::Error> for ConnectionPragmas {
    fn on_acquire(&self, conn: &mut SqliteConnection) -> Result<(), diesel::r2d2::Error> {
        diesel::sql_query("PRAGMA journal_mode = WAL")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA busy_timeout = 5000")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        diesel::sql_query("PRAGMA foreign_keys = ON")
            .execute(conn)
            .map_err(diesel::r2d2::Error::QueryError)?;
        Ok(())
    }
}

/// Size the pool from the enabled channel count.
///
/// Every broadcaster touches the store on item advance, so the pool scales
/// with channels: `max(20, ceil(2.5 x enabled) + 10)`.
pub fn pool_size_for(enabled_channels: u32) -> u32 {
    let scaled = (enabled_channels as f64 * 2.5).ceil() as u32 + 10;
    scaled.max(20)
}

/// Database connection pool wrapper
pub struct DbConnection {
    pool: DbPool,
}

impl DbConnection {
    /// Create a new database connection pool sized for the channel count
    pub fn new(
        database_url: &str,
        enabled_channels: u32,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let size = pool_size_for(enabled_channels);
        let manager = ConnectionManager::<SqliteConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(size)
            .connection_customizer(Box::new(ConnectionPragmas))
            .test_on_check_out(true)
            .max_lifetime(Some(std::time::Duration::from_secs(3600)))
            .build(manager)
            .map_err(|e| format!("Failed to create connection pool: {}", e))?;

        metrics::system::DB_POOL_SIZE.set(size as i64);

        Ok(Self { pool })
    }

    /// Get a pooled connection from the pool
    pub fn get_connection(
        &self,
    ) -> Result<DbPooledConnection, Box<dyn std::error::Error + Send + Sync>> {
        let conn = self
            .pool
            .get()
            .map_err(|e| format!("Failed to get connection from pool: {}", e))?;
        let state = self.pool.state();
        metrics::system::DB_POOL_CHECKED_OUT
            .set((state.connections - state.idle_connections) as i64);
        Ok(conn)
    }

    /// Get a clone of the underlying pool for sharing with spawned tasks
    pub fn clone_pool(&self) -> DbPool {
        self.pool.clone()
    }
}

/// Resolve the database path, creating parent directories as needed
pub fn prepare_db_path(path: &Path) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| {
            format!(
                "Cannot create database directory at '{}': {}. Please check folder permissions.",
                parent.display(),
                e
            )
        })?;
    }
    Ok(path.to_path_buf())
}

/// Establish a single connection to the SQLite database with busy timeout
pub fn establish_connection(
    database_url: &str,
) -> Result<SqliteConnection, diesel::ConnectionError> {
    let mut conn = SqliteConnection::establish(database_url)?;

    diesel::sql_query("PRAGMA busy_timeout = 5000")
        .execute(&mut conn)
        .map_err(|e| {
            diesel::ConnectionError::BadConnection(format!("Failed to set busy_timeout: {}", e))
        })?;

    Ok(conn)
}

/// Run all pending migrations
pub fn run_migrations(
    conn: &mut SqliteConnection,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    conn.run_pending_migrations(MIGRATIONS)?;
    Ok(())
}
