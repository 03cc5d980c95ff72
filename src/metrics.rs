//! Prometheus metrics for the broadcast engine
//!
//! All series are registered against a process-wide [`Registry`] and exposed
//! as text exposition via `GET /metrics`. Counter and gauge updates are
//! lock-free; readers get best-effort snapshots.

use prometheus::{
    register_histogram_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_vec_with_registry,
    register_int_gauge_with_registry, Encoder, Histogram, HistogramOpts, IntCounter,
    IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::LazyLock;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Process pool metrics
pub mod pool {
    use super::*;

    /// Currently running transcoder processes.
    pub static PROCESSES_ACTIVE: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "ffmpeg_processes_active",
            "Number of currently running transcoder processes",
            REGISTRY.clone()
        )
        .expect("Failed to register ffmpeg_processes_active")
    });

    /// Spawns currently in flight (acquired but no first byte yet).
    pub static SPAWN_PENDING: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "ffmpeg_spawn_pending",
            "Number of transcoder spawns awaiting first output",
            REGISTRY.clone()
        )
        .expect("Failed to register ffmpeg_spawn_pending")
    });

    /// Rejected acquisitions, labeled by guard reason.
    pub static SPAWN_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new(
                "ffmpeg_spawn_rejected_total",
                "Transcoder acquisitions rejected before spawn"
            ),
            &["reason"],
            REGISTRY.clone()
        )
        .expect("Failed to register ffmpeg_spawn_rejected_total")
    });

    /// Spawns that never produced a first byte within the deadline.
    pub static SPAWN_TIMEOUTS: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "ffmpeg_spawn_timeout_total",
            "Transcoder spawns terminated at the cold-start deadline",
            REGISTRY.clone()
        )
        .expect("Failed to register ffmpeg_spawn_timeout_total")
    });

    /// Times the pool crossed the 80% pressure threshold.
    pub static POOL_PRESSURE_EVENTS: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "ffmpeg_pool_pressure_events_total",
            "Times active processes reached 80% of the pool cap",
            REGISTRY.clone()
        )
        .expect("Failed to register ffmpeg_pool_pressure_events_total")
    });

    /// Latency of pool acquisition including rate-limit sleeps.
    pub static ACQUISITION_LATENCY: LazyLock<Histogram> = LazyLock::new(|| {
        register_histogram_with_registry!(
            HistogramOpts::new(
                "pool_acquisition_latency_seconds",
                "Pool acquisition latency including rate-limit waits"
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.0, 5.0, 15.0, 30.0, 60.0, 120.0]),
            REGISTRY.clone()
        )
        .expect("Failed to register pool_acquisition_latency_seconds")
    });
}

/// Per-channel metrics
pub mod channel {
    use super::*;

    /// Restarts performed through the restart gate, per channel.
    pub static RESTART_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new("channel_restart_total", "Channel restarts performed"),
            &["channel_id"],
            REGISTRY.clone()
        )
        .expect("Failed to register channel_restart_total")
    });

    /// Items streamed to completion, per channel.
    pub static STREAM_SUCCESS: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new("stream_success_total", "Items streamed to a clean end"),
            &["channel_id"],
            REGISTRY.clone()
        )
        .expect("Failed to register stream_success_total")
    });

    /// Stream failures (transcoder errors, pool rejections), per channel.
    pub static STREAM_FAILURE: LazyLock<IntCounterVec> = LazyLock::new(|| {
        register_int_counter_vec_with_registry!(
            Opts::new("stream_failure_total", "Stream failures"),
            &["channel_id"],
            REGISTRY.clone()
        )
        .expect("Failed to register stream_failure_total")
    });

    /// RSS of the channel's transcoder process.
    pub static MEMORY_BYTES: LazyLock<IntGaugeVec> = LazyLock::new(|| {
        register_int_gauge_vec_with_registry!(
            Opts::new("channel_memory_bytes", "Transcoder RSS per channel"),
            &["channel_id"],
            REGISTRY.clone()
        )
        .expect("Failed to register channel_memory_bytes")
    });

    /// Circuit breaker state per channel: 0 closed, 1 open, 2 half-open.
    pub static CIRCUIT_BREAKER_STATE: LazyLock<IntGaugeVec> = LazyLock::new(|| {
        register_int_gauge_vec_with_registry!(
            Opts::new(
                "circuit_breaker_state",
                "Circuit breaker state (0=closed, 1=open, 2=half-open)"
            ),
            &["channel_id"],
            REGISTRY.clone()
        )
        .expect("Failed to register circuit_breaker_state")
    });
}

/// System-level metrics
pub mod system {
    use super::*;

    /// Resident set size of this process.
    pub static RSS_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "system_rss_bytes",
            "Resident set size of the telecast process",
            REGISTRY.clone()
        )
        .expect("Failed to register system_rss_bytes")
    });

    /// Open file descriptors of this process.
    pub static FD_USAGE: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "fd_usage",
            "Open file descriptors of the telecast process",
            REGISTRY.clone()
        )
        .expect("Failed to register fd_usage")
    });

    /// Measured event-loop lag of the runtime.
    pub static EVENT_LOOP_LAG: LazyLock<Histogram> = LazyLock::new(|| {
        register_histogram_with_registry!(
            HistogramOpts::new("event_loop_lag_seconds", "Scheduler tick lag")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            REGISTRY.clone()
        )
        .expect("Failed to register event_loop_lag_seconds")
    });

    /// Database connections currently checked out.
    pub static DB_POOL_CHECKED_OUT: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "db_pool_checked_out",
            "Database connections currently checked out",
            REGISTRY.clone()
        )
        .expect("Failed to register db_pool_checked_out")
    });

    /// Configured database pool size.
    pub static DB_POOL_SIZE: LazyLock<IntGauge> = LazyLock::new(|| {
        register_int_gauge_with_registry!(
            "db_pool_size",
            "Configured database pool size",
            REGISTRY.clone()
        )
        .expect("Failed to register db_pool_size")
    });
}

/// Metadata and EPG metrics
pub mod epg {
    use super::*;

    /// Successful metadata provider lookups.
    pub static METADATA_LOOKUP_SUCCESS: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "metadata_lookup_success_total",
            "Successful metadata provider lookups",
            REGISTRY.clone()
        )
        .expect("Failed to register metadata_lookup_success_total")
    });

    /// Failed metadata provider lookups.
    pub static METADATA_LOOKUP_FAILURE: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "metadata_lookup_failure_total",
            "Failed metadata provider lookups",
            REGISTRY.clone()
        )
        .expect("Failed to register metadata_lookup_failure_total")
    });

    /// Programmes that fell through to a generated placeholder title.
    pub static PLACEHOLDER_TITLES: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "placeholder_title_generated_total",
            "Programmes emitted with a generated fallback title",
            REGISTRY.clone()
        )
        .expect("Failed to register placeholder_title_generated_total")
    });

    /// XMLTV documents rejected by the pre-emit validator.
    pub static XMLTV_VALIDATION_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "xmltv_validation_error_total",
            "XMLTV documents rejected by validation",
            REGISTRY.clone()
        )
        .expect("Failed to register xmltv_validation_error_total")
    });

    /// Lineup/EPG cross-check mismatches.
    pub static XMLTV_LINEUP_MISMATCH: LazyLock<IntCounter> = LazyLock::new(|| {
        register_int_counter_with_registry!(
            "xmltv_lineup_mismatch_total",
            "Channels present in XMLTV but not the lineup (or vice versa)",
            REGISTRY.clone()
        )
        .expect("Failed to register xmltv_lineup_mismatch_total")
    });
}

/// Force every series to register.
///
/// Lazy statics only reach the registry on first touch; a scrape before any
/// traffic must still see the full series set.
pub fn register_all() {
    pool::PROCESSES_ACTIVE.get();
    pool::SPAWN_PENDING.get();
    pool::SPAWN_REJECTED.with_label_values(&["capacity"]).get();
    pool::SPAWN_TIMEOUTS.get();
    pool::POOL_PRESSURE_EVENTS.get();
    let _ = &*pool::ACQUISITION_LATENCY;
    let _ = &*channel::RESTART_TOTAL;
    let _ = &*channel::STREAM_SUCCESS;
    let _ = &*channel::STREAM_FAILURE;
    let _ = &*channel::MEMORY_BYTES;
    let _ = &*channel::CIRCUIT_BREAKER_STATE;
    system::RSS_BYTES.get();
    system::FD_USAGE.get();
    let _ = &*system::EVENT_LOOP_LAG;
    system::DB_POOL_CHECKED_OUT.get();
    system::DB_POOL_SIZE.get();
    epg::METADATA_LOOKUP_SUCCESS.get();
    epg::METADATA_LOOKUP_FAILURE.get();
    epg::PLACEHOLDER_TITLES.get();
    epg::XMLTV_VALIDATION_ERRORS.get();
    epg::XMLTV_LINEUP_MISMATCH.get();
}

/// Render the registry as Prometheus text exposition.
pub fn gather_text() -> String {
    register_all();
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Refresh the process-level gauges from /proc.
///
/// Called on each /metrics scrape; failures leave the prior values in place.
pub fn refresh_system_gauges() {
    if let Some(rss) = read_self_rss_bytes() {
        system::RSS_BYTES.set(rss as i64);
    }
    if let Some(fds) = count_open_fds() {
        system::FD_USAGE.set(fds as i64);
    }
}

/// Read this process's RSS in bytes from /proc/self/statm.
pub fn read_self_rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

/// Count this process's open file descriptors.
pub fn count_open_fds() -> Option<u64> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.count() as u64)
}

/// Read system free (available) memory in bytes from /proc/meminfo.
pub fn read_free_memory_bytes() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemAvailable:") {
            let kb: u64 = rest.trim().trim_end_matches(" kB").trim().parse().ok()?;
            return Some(kb * 1024);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_registered_series() {
        // Touch a few series so they materialize in the registry
        pool::PROCESSES_ACTIVE.set(0);
        pool::SPAWN_REJECTED.with_label_values(&["capacity"]).inc_by(0);
        channel::RESTART_TOTAL.with_label_values(&["1"]).inc_by(0);
        epg::XMLTV_VALIDATION_ERRORS.inc_by(0);

        let text = gather_text();
        assert!(text.contains("ffmpeg_processes_active"));
        assert!(text.contains("ffmpeg_spawn_rejected_total"));
        assert!(text.contains("channel_restart_total"));
        assert!(text.contains("xmltv_validation_error_total"));
    }

    #[test]
    fn test_rejection_reasons_are_labeled() {
        pool::SPAWN_REJECTED.with_label_values(&["rate_limited"]).inc();
        let text = gather_text();
        assert!(text.contains("reason=\"rate_limited\""));
    }

    #[test]
    fn test_circuit_breaker_state_encoding() {
        channel::CIRCUIT_BREAKER_STATE
            .with_label_values(&["42"])
            .set(2);
        let text = gather_text();
        assert!(text.contains("circuit_breaker_state{channel_id=\"42\"} 2"));
    }
}
