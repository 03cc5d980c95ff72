//! Transcoder process pool
//!
//! The only place in the codebase that spawns ffmpeg. Acquisition runs a
//! fail-fast guard chain (capacity, memory, file descriptors, rate limit)
//! before the spawn, then holds the request until the process produces its
//! first stdout byte or the cold-start deadline expires.
//!
//! Locking rules: the registry mutex is never held across an await, and the
//! token bucket sleeps happen after its lock is released.

use bytes::Bytes;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};

use crate::config::PoolConfig;
use crate::metrics;

/// Read size for the first-byte wait, matched to the broadcast chunk size
const FIRST_READ_BYTES: usize = 64 * 1024;

/// Acquisition failures, in guard order
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    #[error("pool at capacity")]
    Capacity,

    #[error("system memory below watermark")]
    MemoryGuard,

    #[error("file descriptors above watermark")]
    FdGuard,

    #[error("spawn rate limited")]
    RateLimited,

    #[error("no output before cold-start deadline")]
    SpawnTimeout,

    #[error("spawn failed")]
    SpawnFailed,

    #[error("pool is shut down")]
    PoolClosed,
}

impl AcquireError {
    /// Label used on the rejection counter
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Capacity => "capacity",
            Self::MemoryGuard => "memory",
            Self::FdGuard => "fd",
            Self::RateLimited => "rate_limited",
            Self::SpawnTimeout => "spawn_timeout",
            Self::SpawnFailed => "spawn_failed",
            Self::PoolClosed => "pool_closed",
        }
    }
}

/// A borrowed transcoder process: stdout/stderr plus the first chunk that
/// proved the process alive. Valid until `release` is called for the
/// channel.
#[derive(Debug)]
pub struct ProcessHandle {
    pub channel_id: i32,
    pub pid: Option<u32>,
    pub started_at: Instant,
    pub stdout: ChildStdout,
    pub stderr: Option<ChildStderr>,
    /// Bytes read while waiting out the cold start; the broadcaster must
    /// deliver these before reading more
    pub first_chunk: Bytes,
    child: Arc<Mutex<Child>>,
}

impl ProcessHandle {
    /// Exit status if the process has already terminated.
    ///
    /// Lets the broadcaster distinguish a clean end-of-item from a crash
    /// after stdout reaches EOF.
    pub fn try_exit_status(&self) -> Option<std::process::ExitStatus> {
        self.child.lock().ok()?.try_wait().ok().flatten()
    }
}

struct RegisteredProcess {
    pid: Option<u32>,
    started_at: Instant,
    child: Arc<Mutex<Child>>,
}

struct Registry {
    processes: HashMap<i32, RegisteredProcess>,
    pending: usize,
    closed: bool,
    pressure_logged: bool,
}

/// Explicit token bucket; refill happens on observation, sleeps happen
/// outside the lock
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Take one token, or say how long until one is available
    fn try_take(&mut self, capacity: u32, refill_per_sec: u32) -> Result<(), Duration> {
        let elapsed = self.last_refill.elapsed();
        self.last_refill = Instant::now();
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * refill_per_sec as f64).min(capacity as f64);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / refill_per_sec as f64))
        }
    }
}

/// Pool metrics snapshot
#[derive(Debug, Clone, Default)]
pub struct PoolStatus {
    pub active: usize,
    pub pending: usize,
    pub max_processes: usize,
    pub rejected_total: u64,
    pub spawn_timeouts: u64,
    pub pressure_events: u64,
}

impl PoolStatus {
    /// Active as a fraction of the cap
    pub fn pressure(&self) -> f64 {
        if self.max_processes == 0 {
            return 0.0;
        }
        self.active as f64 / self.max_processes as f64
    }
}

type ResourceProbe = Box<dyn Fn() -> Option<u64> + Send + Sync>;

/// The supervisor; all spawns flow through [`acquire`](Self::acquire)
pub struct ProcessPool {
    config: PoolConfig,
    registry: Mutex<Registry>,
    bucket: Mutex<TokenBucket>,
    transcoder_bin: String,
    free_memory_probe: ResourceProbe,
    fd_count_probe: ResourceProbe,
    fd_soft_limit: u64,
    rejected_total: AtomicU64,
    spawn_timeouts: AtomicU64,
    pressure_events: AtomicU64,
}

impl ProcessPool {
    pub fn new(config: PoolConfig) -> Self {
        Self::with_probes(
            config,
            "ffmpeg".to_string(),
            Box::new(metrics::read_free_memory_bytes),
            Box::new(metrics::count_open_fds),
        )
    }

    pub fn with_probes(
        config: PoolConfig,
        transcoder_bin: String,
        free_memory_probe: ResourceProbe,
        fd_count_probe: ResourceProbe,
    ) -> Self {
        Self {
            config,
            registry: Mutex::new(Registry {
                processes: HashMap::new(),
                pending: 0,
                closed: false,
                pressure_logged: false,
            }),
            bucket: Mutex::new(TokenBucket {
                tokens: 5.0,
                last_refill: Instant::now(),
            }),
            transcoder_bin,
            free_memory_probe,
            fd_count_probe,
            fd_soft_limit: soft_fd_limit(),
            rejected_total: AtomicU64::new(0),
            spawn_timeouts: AtomicU64::new(0),
            pressure_events: AtomicU64::new(0),
        }
    }

    /// Effective process cap: the configured cap bounded by what memory and
    /// descriptor estimates allow
    pub fn max_processes(&self) -> usize {
        let mut cap = self.config.max_processes;
        if let Some(free) = (self.free_memory_probe)() {
            let by_memory = (free / self.config.per_process_rss_estimate.max(1)) as usize;
            cap = cap.min(by_memory.max(1));
        }
        let by_fd = (self.fd_soft_limit / self.config.per_process_fd_estimate.max(1)) as usize;
        cap.min(by_fd.max(1))
    }

    /// Acquire a transcoder for a channel, running the full guard chain.
    pub async fn acquire(
        &self,
        channel_id: i32,
        args: &[String],
        cold_start_timeout: Duration,
    ) -> Result<ProcessHandle, AcquireError> {
        let acquire_started = Instant::now();
        let result = self
            .acquire_inner(channel_id, args, cold_start_timeout)
            .await;
        metrics::pool::ACQUISITION_LATENCY.observe(acquire_started.elapsed().as_secs_f64());

        if let Err(e) = &result {
            self.rejected_total.fetch_add(1, Ordering::Relaxed);
            metrics::pool::SPAWN_REJECTED
                .with_label_values(&[e.reason()])
                .inc();
        }
        result
    }

    async fn acquire_inner(
        &self,
        channel_id: i32,
        args: &[String],
        cold_start_timeout: Duration,
    ) -> Result<ProcessHandle, AcquireError> {
        let max = self.max_processes();

        // Guard 1: capacity. Registered as pending so concurrent acquires
        // cannot oversubscribe while we sleep on later guards.
        {
            let mut registry = self.registry.lock().expect("pool registry poisoned");
            if registry.closed {
                return Err(AcquireError::PoolClosed);
            }
            if registry.processes.len() + registry.pending >= max {
                return Err(AcquireError::Capacity);
            }
            registry.pending += 1;
            metrics::pool::SPAWN_PENDING.set(registry.pending as i64);
        }

        let result = self
            .guarded_spawn(channel_id, args, cold_start_timeout, max)
            .await;

        {
            let mut registry = self.registry.lock().expect("pool registry poisoned");
            registry.pending = registry.pending.saturating_sub(1);
            metrics::pool::SPAWN_PENDING.set(registry.pending as i64);
        }

        result
    }

    async fn guarded_spawn(
        &self,
        channel_id: i32,
        args: &[String],
        cold_start_timeout: Duration,
        max: usize,
    ) -> Result<ProcessHandle, AcquireError> {
        // Guard 2: system memory watermark
        if let Some(free) = (self.free_memory_probe)() {
            if free < self.config.free_memory_watermark {
                return Err(AcquireError::MemoryGuard);
            }
        }

        // Guard 3: descriptor watermark
        if let Some(fds) = (self.fd_count_probe)() {
            if (fds as f64) > (self.fd_soft_limit as f64) * self.config.fd_usage_watermark {
                return Err(AcquireError::FdGuard);
            }
        }

        // Guard 4: token bucket. Sleeping happens with the bucket lock
        // released; the loop never recurses.
        let rate_deadline = Instant::now() + cold_start_timeout;
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("token bucket poisoned");
                match bucket.try_take(
                    self.config.rate_limit_capacity,
                    self.config.rate_limit_refill_per_sec,
                ) {
                    Ok(()) => None,
                    Err(wait) => Some(wait),
                }
            };
            match wait {
                None => break,
                Some(wait) => {
                    if Instant::now() + wait > rate_deadline {
                        return Err(AcquireError::RateLimited);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }

        // Guard 5: spawn, and hold until first byte
        let mut child = Command::new(&self.transcoder_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                tracing::error!(channel_id, "transcoder spawn failed: {}", e);
                AcquireError::SpawnFailed
            })?;

        let mut stdout = match child.stdout.take() {
            Some(s) => s,
            None => {
                let _ = child.start_kill();
                return Err(AcquireError::SpawnFailed);
            }
        };
        let stderr = child.stderr.take();
        let pid = child.id();

        let mut first = vec![0u8; FIRST_READ_BYTES];
        let first_len = match tokio::time::timeout(cold_start_timeout, stdout.read(&mut first))
            .await
        {
            Ok(Ok(n)) if n > 0 => n,
            Ok(_) => {
                // EOF or read error before any output
                let _ = child.start_kill();
                self.spawn_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::pool::SPAWN_TIMEOUTS.inc();
                return Err(AcquireError::SpawnTimeout);
            }
            Err(_) => {
                tracing::warn!(
                    channel_id,
                    timeout_secs = cold_start_timeout.as_secs(),
                    "transcoder produced no output before cold-start deadline"
                );
                let _ = child.start_kill();
                self.spawn_timeouts.fetch_add(1, Ordering::Relaxed);
                metrics::pool::SPAWN_TIMEOUTS.inc();
                return Err(AcquireError::SpawnTimeout);
            }
        };
        first.truncate(first_len);

        let started_at = Instant::now();
        let shared_child = Arc::new(Mutex::new(child));
        let stale = {
            let mut registry = self.registry.lock().expect("pool registry poisoned");
            if registry.closed {
                if let Ok(mut child) = shared_child.lock() {
                    let _ = child.start_kill();
                }
                return Err(AcquireError::PoolClosed);
            }
            let stale = registry.processes.remove(&channel_id);
            registry.processes.insert(
                channel_id,
                RegisteredProcess {
                    pid,
                    started_at,
                    child: shared_child.clone(),
                },
            );
            let active = registry.processes.len();
            metrics::pool::PROCESSES_ACTIVE.set(active as i64);

            // Pool-pressure early warning, logged once per episode
            if active as f64 >= max as f64 * 0.8 {
                if !registry.pressure_logged {
                    registry.pressure_logged = true;
                    self.pressure_events.fetch_add(1, Ordering::Relaxed);
                    metrics::pool::POOL_PRESSURE_EVENTS.inc();
                    tracing::warn!(active, max, "transcoder pool approaching capacity");
                }
            } else {
                registry.pressure_logged = false;
            }
            stale
        };

        if let Some(stale) = stale {
            // A channel may own one process at a time; a leftover means the
            // previous stream was not released cleanly
            tracing::warn!(channel_id, "replacing unreleased transcoder process");
            if let Ok(mut old) = stale.child.lock() {
                let _ = old.start_kill();
            }
        }

        Ok(ProcessHandle {
            channel_id,
            pid,
            started_at,
            stdout,
            stderr,
            first_chunk: Bytes::from(first),
            child: shared_child,
        })
    }

    /// Release a channel's process. Idempotent; safe to call after the
    /// process already exited.
    pub fn release(&self, channel_id: i32) {
        let removed = {
            let mut registry = self.registry.lock().expect("pool registry poisoned");
            let removed = registry.processes.remove(&channel_id);
            metrics::pool::PROCESSES_ACTIVE.set(registry.processes.len() as i64);
            removed
        };
        if let Some(process) = removed {
            if let Ok(mut child) = process.child.lock() {
                let _ = child.start_kill();
            }
        }
    }

    /// Current pool status snapshot
    pub fn status(&self) -> PoolStatus {
        let registry = self.registry.lock().expect("pool registry poisoned");
        PoolStatus {
            active: registry.processes.len(),
            pending: registry.pending,
            max_processes: self.max_processes(),
            rejected_total: self.rejected_total.load(Ordering::Relaxed),
            spawn_timeouts: self.spawn_timeouts.load(Ordering::Relaxed),
            pressure_events: self.pressure_events.load(Ordering::Relaxed),
        }
    }

    /// Reap zombies (exited but unreleased) and long-runners.
    pub fn reap(&self) {
        let mut evicted = 0usize;
        let mut registry = self.registry.lock().expect("pool registry poisoned");
        let long_run_max = self.config.long_run_max;

        registry.processes.retain(|channel_id, process| {
            let mut child = match process.child.lock() {
                Ok(c) => c,
                Err(_) => return false,
            };
            if let Ok(Some(status)) = child.try_wait() {
                tracing::debug!(channel_id, ?status, "reaping exited transcoder");
                evicted += 1;
                return false;
            }
            if process.started_at.elapsed() > long_run_max {
                tracing::warn!(
                    channel_id,
                    pid = process.pid,
                    "terminating long-running transcoder"
                );
                let _ = child.start_kill();
                evicted += 1;
                return false;
            }
            if let Some(rss) = process.pid.and_then(read_process_rss) {
                metrics::channel::MEMORY_BYTES
                    .with_label_values(&[&channel_id.to_string()])
                    .set(rss as i64);
            }
            true
        });

        if evicted > 0 {
            metrics::pool::PROCESSES_ACTIVE.set(registry.processes.len() as i64);
        }
    }

    /// Start the background reaper task
    pub fn spawn_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval = self.config.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                self.reap();
            }
        })
    }

    /// Close the pool: all subsequent acquires fail with `PoolClosed` and
    /// running processes are terminated.
    pub fn close(&self) {
        let processes = {
            let mut registry = self.registry.lock().expect("pool registry poisoned");
            registry.closed = true;
            std::mem::take(&mut registry.processes)
        };
        for (channel_id, process) in processes {
            tracing::debug!(channel_id, "terminating transcoder on shutdown");
            if let Ok(mut child) = process.child.lock() {
                let _ = child.start_kill();
            }
        }
        metrics::pool::PROCESSES_ACTIVE.set(0);
    }
}

/// RSS of a child process in bytes, read from /proc on Linux
fn read_process_rss(pid: u32) -> Option<u64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(rss_pages * 4096)
}

/// Soft RLIMIT_NOFILE, read from /proc on Linux
fn soft_fd_limit() -> u64 {
    if let Ok(limits) = std::fs::read_to_string("/proc/self/limits") {
        for line in limits.lines() {
            if line.starts_with("Max open files") {
                if let Some(value) = line.split_whitespace().nth(3) {
                    if let Ok(parsed) = value.parse() {
                        return parsed;
                    }
                }
            }
        }
    }
    1024
}
