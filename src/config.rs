//! Runtime configuration
//!
//! All tunables are environment-derived with documented defaults and read
//! once at startup. The resulting [`Config`] is passed through constructors
//! rather than consulted globally, so every component's knobs are visible at
//! its construction site.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Environment prefix for all Telecast settings
const ENV_PREFIX: &str = "TELECAST_";

fn env_var(key: &str) -> Option<String> {
    env::var(format!("{}{}", ENV_PREFIX, key)).ok()
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Process pool limits and guard watermarks
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Hard cap on concurrent transcoder processes
    pub max_processes: usize,
    /// Estimated RSS per transcoder process, used to derive the cap
    pub per_process_rss_estimate: u64,
    /// Estimated file descriptors per transcoder process
    pub per_process_fd_estimate: u64,
    /// Reject spawns while system free memory is below this many bytes
    pub free_memory_watermark: u64,
    /// Reject spawns while open FDs exceed this fraction of the soft limit
    pub fd_usage_watermark: f64,
    /// Token bucket capacity for spawn rate limiting
    pub rate_limit_capacity: u32,
    /// Tokens refilled per second
    pub rate_limit_refill_per_sec: u32,
    /// First-byte deadline for a newly spawned transcoder
    pub cold_start_timeout: Duration,
    /// First-byte deadline override for Plex-resolved URLs
    pub cold_start_timeout_plex: Duration,
    /// Processes running longer than this are reaped
    pub long_run_max: Duration,
    /// Cadence of the zombie/long-runner reaper
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 16,
            per_process_rss_estimate: 256 * 1024 * 1024,
            per_process_fd_estimate: 32,
            free_memory_watermark: 512 * 1024 * 1024,
            fd_usage_watermark: 0.9,
            rate_limit_capacity: 5,
            rate_limit_refill_per_sec: 5,
            cold_start_timeout: Duration::from_secs(90),
            cold_start_timeout_plex: Duration::from_secs(120),
            long_run_max: Duration::from_secs(24 * 3600),
            reap_interval: Duration::from_secs(60),
        }
    }
}

/// Health supervision and restart-gate tunables
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Cadence of the staleness scan
    pub check_interval: Duration,
    /// A channel whose output is older than this is unhealthy
    pub unhealthy_threshold: Duration,
    /// Rolling window for the global restart storm throttle
    pub storm_window: Duration,
    /// Maximum restarts allowed inside the storm window
    pub storm_max: usize,
    /// Minimum spacing between restarts of the same channel
    pub restart_cooldown: Duration,
    /// Failures inside the window that open the circuit
    pub circuit_failure_threshold: usize,
    /// Failure-counting window for the circuit breaker
    pub circuit_failure_window: Duration,
    /// Time the circuit stays open before probing half-open
    pub circuit_open_duration: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            unhealthy_threshold: Duration::from_secs(180),
            storm_window: Duration::from_secs(60),
            storm_max: 10,
            restart_cooldown: Duration::from_secs(30),
            circuit_failure_threshold: 5,
            circuit_failure_window: Duration::from_secs(300),
            circuit_open_duration: Duration::from_secs(120),
        }
    }
}

/// Bounded-agent feature flags and cooldowns
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Master switch; the agent never runs while false
    pub enabled: bool,
    /// Whether metadata self-resolution tools may run at all
    pub metadata_self_resolution_enabled: bool,
    /// Cooldown between metadata self-resolution attempts
    pub metadata_self_resolution_cooldown: Duration,
    /// Hard step cap per loop
    pub max_steps: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            metadata_self_resolution_enabled: false,
            metadata_self_resolution_cooldown: Duration::from_secs(300),
            max_steps: 3,
        }
    }
}

/// Top-level runtime configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen port for the tuner/IPTV surface
    pub port: u16,
    /// Bind address; defaults to all interfaces so Plex on the LAN can tune
    pub bind_address: String,
    /// SQLite database path
    pub database_path: PathBuf,
    /// Directory for derived state (credential salt, slate cache)
    pub data_dir: PathBuf,
    /// Advertised tuner count
    pub tuner_count: u32,
    /// Configured DeviceID; normalized to 8 uppercase hex at the surface
    pub device_id: Option<String>,
    /// Client queues are removed after this much inactivity
    pub session_idle_timeout: Duration,
    /// Maximum channels started concurrently during prewarm
    pub prewarm_max_concurrent: usize,
    /// Delay between prewarm starts
    pub prewarm_stagger: Duration,
    /// EPG horizon into the future
    pub epg_horizon: Duration,
    pub pool: PoolConfig,
    pub health: HealthConfig,
    pub agent: AgentConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("telecast");
        Self {
            port: 5004,
            bind_address: "0.0.0.0".to_string(),
            database_path: data_dir.join("telecast.db"),
            data_dir,
            tuner_count: 4,
            device_id: None,
            session_idle_timeout: Duration::from_secs(300),
            prewarm_max_concurrent: 5,
            prewarm_stagger: Duration::from_secs(1),
            epg_horizon: Duration::from_secs(48 * 3600),
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            agent: AgentConfig::default(),
        }
    }
}

impl Config {
    /// Build the configuration from the environment.
    ///
    /// Missing or unparseable values fall back to the documented defaults;
    /// a bad value never aborts startup.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        let data_dir = env_var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir.clone());
        let database_path = env_var("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("telecast.db"));

        Self {
            port: env_parse("PORT", defaults.port),
            bind_address: env_var("BIND_ADDRESS").unwrap_or(defaults.bind_address),
            database_path,
            data_dir,
            tuner_count: env_parse("TUNER_COUNT", defaults.tuner_count),
            device_id: env_var("DEVICE_ID"),
            session_idle_timeout: Duration::from_secs(env_parse(
                "SESSION_IDLE_TIMEOUT_SECONDS",
                defaults.session_idle_timeout.as_secs(),
            )),
            prewarm_max_concurrent: env_parse(
                "PREWARM_MAX_CONCURRENT",
                defaults.prewarm_max_concurrent,
            ),
            prewarm_stagger: Duration::from_secs(env_parse(
                "PREWARM_STAGGER_SECONDS",
                defaults.prewarm_stagger.as_secs(),
            )),
            epg_horizon: Duration::from_secs(
                env_parse("EPG_HORIZON_HOURS", 48u64) * 3600,
            ),
            pool: PoolConfig {
                max_processes: env_parse("MAX_PROCESSES", defaults.pool.max_processes),
                cold_start_timeout: Duration::from_secs(env_parse(
                    "COLD_START_TIMEOUT_SECONDS",
                    defaults.pool.cold_start_timeout.as_secs(),
                )),
                cold_start_timeout_plex: Duration::from_secs(env_parse(
                    "COLD_START_TIMEOUT_PLEX_SECONDS",
                    defaults.pool.cold_start_timeout_plex.as_secs(),
                )),
                ..defaults.pool
            },
            health: HealthConfig {
                check_interval: Duration::from_secs(env_parse(
                    "HEALTH_CHECK_INTERVAL_SECONDS",
                    defaults.health.check_interval.as_secs(),
                )),
                unhealthy_threshold: Duration::from_secs(env_parse(
                    "UNHEALTHY_THRESHOLD_SECONDS",
                    defaults.health.unhealthy_threshold.as_secs(),
                )),
                storm_window: Duration::from_secs(env_parse(
                    "RESTART_STORM_WINDOW_SECONDS",
                    defaults.health.storm_window.as_secs(),
                )),
                storm_max: env_parse("RESTART_STORM_MAX", defaults.health.storm_max),
                restart_cooldown: Duration::from_secs(env_parse(
                    "RESTART_COOLDOWN_SECONDS",
                    defaults.health.restart_cooldown.as_secs(),
                )),
                circuit_failure_threshold: env_parse(
                    "CIRCUIT_FAILURE_THRESHOLD",
                    defaults.health.circuit_failure_threshold,
                ),
                circuit_failure_window: Duration::from_secs(env_parse(
                    "CIRCUIT_FAILURE_WINDOW_SECONDS",
                    defaults.health.circuit_failure_window.as_secs(),
                )),
                circuit_open_duration: Duration::from_secs(env_parse(
                    "CIRCUIT_OPEN_SECONDS",
                    defaults.health.circuit_open_duration.as_secs(),
                )),
            },
            agent: AgentConfig {
                enabled: env_parse("BOUNDED_AGENT_ENABLED", false),
                metadata_self_resolution_enabled: env_parse(
                    "METADATA_SELF_RESOLUTION_ENABLED",
                    false,
                ),
                metadata_self_resolution_cooldown: Duration::from_secs(env_parse(
                    "METADATA_SELF_RESOLUTION_COOLDOWN_SEC",
                    defaults.agent.metadata_self_resolution_cooldown.as_secs(),
                )),
                max_steps: env_parse("AGENT_MAX_STEPS", defaults.agent.max_steps),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.port, 5004);
        assert_eq!(config.tuner_count, 4);
        assert_eq!(config.session_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.prewarm_max_concurrent, 5);
        assert_eq!(config.prewarm_stagger, Duration::from_secs(1));
    }

    #[test]
    fn test_pool_defaults() {
        let pool = PoolConfig::default();
        assert_eq!(pool.rate_limit_capacity, 5);
        assert_eq!(pool.rate_limit_refill_per_sec, 5);
        assert_eq!(pool.cold_start_timeout, Duration::from_secs(90));
        assert_eq!(pool.cold_start_timeout_plex, Duration::from_secs(120));
        assert_eq!(pool.long_run_max, Duration::from_secs(86400));
    }

    #[test]
    fn test_health_defaults() {
        let health = HealthConfig::default();
        assert_eq!(health.check_interval, Duration::from_secs(30));
        assert_eq!(health.unhealthy_threshold, Duration::from_secs(180));
        assert_eq!(health.storm_max, 10);
        assert_eq!(health.storm_window, Duration::from_secs(60));
        assert_eq!(health.restart_cooldown, Duration::from_secs(30));
        assert_eq!(health.circuit_failure_threshold, 5);
        assert_eq!(health.circuit_failure_window, Duration::from_secs(300));
        assert_eq!(health.circuit_open_duration, Duration::from_secs(120));
    }

    #[test]
    fn test_agent_disabled_by_default() {
        let agent = AgentConfig::default();
        assert!(!agent.enabled);
        assert!(!agent.metadata_self_resolution_enabled);
        assert_eq!(agent.max_steps, 3);
    }
}
