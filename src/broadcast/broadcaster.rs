//! Per-channel broadcaster
//!
//! Owns exactly one transcoder process at a time and fans its MPEG-TS
//! stdout to every attached client queue. The loop advances the playout
//! anchor between items without tearing anything down; on stream failure it
//! records the error and exits, leaving recovery to the health supervisor's
//! restart gate.

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use diesel::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::sync::watch;

use super::fanout::{ClientQueue, ClientStream, DEFAULT_QUEUE_CHUNKS};
use super::supervisor::RestartGate;
use crate::config::Config;
use crate::db::{schema, Channel, DbPool, IdleBehavior, SourceKind, TranscodeMode};
use crate::library::UrlResolver;
use crate::metrics;
use crate::playout::schedule::PlannedItem;
use crate::playout::PlayoutEngine;
use crate::transcode::{
    build_slate_command, build_stream_command, AcceleratorSelection, AcquireError,
    ChannelEncoding, ProcessHandle, ProcessPool,
};

/// Read size for the transcoder's stdout
const READ_CHUNK_BYTES: usize = 64 * 1024;

/// Pause between attempts when the schedule yields nothing
const EMPTY_SCHEDULE_PAUSE: Duration = Duration::from_secs(5);

/// Grace period before an idle stop_on_disconnect channel winds down
const IDLE_STOP_GRACE: Duration = Duration::from_secs(15);

/// Slate length in seconds
const SLATE_SECONDS: u32 = 4;

/// Null packets preloaded into a fresh client queue as cold-start keepalive
const KEEPALIVE_PACKETS: usize = 7;

/// A null MPEG-TS packet: sync byte, null PID 0x1FFF, payload counter 0,
/// stuffing. Demuxers discard these, so they are safe mid-stream too.
fn null_ts_packet() -> Bytes {
    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x1F;
    packet[2] = 0xFF;
    packet[3] = 0x10;
    Bytes::copy_from_slice(&packet)
}

/// Dependencies shared by every broadcaster
pub struct BroadcastShared {
    pub db: DbPool,
    pub pool: Arc<ProcessPool>,
    pub engine: Arc<PlayoutEngine>,
    pub resolver: Arc<UrlResolver>,
    pub accelerator: Arc<AcceleratorSelection>,
    pub gate: Arc<RestartGate>,
    pub config: Arc<Config>,
}

/// Snapshot of a broadcaster's runtime state
#[derive(Debug, Clone)]
pub struct BroadcasterState {
    pub is_running: bool,
    pub last_output_age: Duration,
    pub client_count: usize,
    pub restart_count: u32,
    pub error_count: u32,
}

/// How one item's playback ended
enum ItemOutcome {
    Completed,
    Failed,
    Stopped,
}

/// One live channel: a single producer fanning out to many clients
pub struct ChannelBroadcaster {
    channel_id: i32,
    shared: Arc<BroadcastShared>,
    clients: DashMap<String, Arc<ClientQueue>>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    last_output: Mutex<Instant>,
    restart_count: AtomicU32,
    error_count: AtomicU32,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ChannelBroadcaster {
    pub fn new(channel_id: i32, shared: Arc<BroadcastShared>) -> Arc<Self> {
        let (stop_tx, _) = watch::channel(false);
        Arc::new(Self {
            channel_id,
            shared,
            clients: DashMap::new(),
            running: AtomicBool::new(false),
            stop_tx,
            last_output: Mutex::new(Instant::now()),
            restart_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            task: Mutex::new(None),
        })
    }

    pub fn channel_id(&self) -> i32 {
        self.channel_id
    }

    /// Start the broadcast loop. Idempotent: a running channel is a no-op.
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.stop_tx.send(false);
        *self.last_output.lock().expect("last_output poisoned") = Instant::now();

        let this = self.clone();
        let handle = tokio::spawn(async move {
            this.run_loop().await;
            this.shared.pool.release(this.channel_id);
            this.running.store(false, Ordering::SeqCst);
            tracing::info!(channel_id = this.channel_id, "broadcast loop ended");
        });
        *self.task.lock().expect("task slot poisoned") = Some(handle);
    }

    /// Stop gracefully: signal the loop, then release the process.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);
        let handle = self.task.lock().expect("task slot poisoned").take();
        if let Some(handle) = handle {
            // The loop notices the signal at its next suspension point
            if tokio::time::timeout(Duration::from_secs(10), handle)
                .await
                .is_err()
            {
                tracing::warn!(channel_id = self.channel_id, "broadcast loop forced down");
            }
        }
        self.shared.pool.release(self.channel_id);
        self.running.store(false, Ordering::SeqCst);
    }

    /// Attach a new client queue; the stream half feeds an HTTP body.
    ///
    /// The queue is preloaded with null transport packets so the client
    /// reads valid MPEG-TS immediately even while the transcoder is still
    /// cold-starting.
    pub fn attach_client(&self) -> (ClientStream, String) {
        let queue = ClientQueue::new(DEFAULT_QUEUE_CHUNKS);
        for _ in 0..KEEPALIVE_PACKETS {
            queue.offer(null_ts_packet());
        }
        let session_id = queue.session_id().to_string();
        self.clients.insert(session_id.clone(), queue.clone());
        tracing::debug!(
            channel_id = self.channel_id,
            session_id = %session_id,
            clients = self.clients.len(),
            "client attached"
        );
        (ClientStream::new(queue), session_id)
    }

    /// Detach a client; idempotent.
    pub fn detach_client(&self, session_id: &str) {
        if let Some((_, queue)) = self.clients.remove(session_id) {
            queue.close();
        }
    }

    pub fn state(&self) -> BroadcasterState {
        BroadcasterState {
            is_running: self.running.load(Ordering::SeqCst),
            last_output_age: self
                .last_output
                .lock()
                .expect("last_output poisoned")
                .elapsed(),
            client_count: self.clients.len(),
            restart_count: self.restart_count.load(Ordering::SeqCst),
            error_count: self.error_count.load(Ordering::SeqCst),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Called by the health supervisor when a gated restart is performed
    pub fn note_restart(&self) {
        self.restart_count.fetch_add(1, Ordering::SeqCst);
        metrics::channel::RESTART_TOTAL
            .with_label_values(&[&self.channel_id.to_string()])
            .inc();
    }

    async fn run_loop(&self) {
        let mut stop_rx = self.stop_tx.subscribe();
        let mut idle_since: Option<Instant> = None;

        loop {
            if *stop_rx.borrow() {
                break;
            }

            self.sweep_sessions();

            // Idle behavior: stop_on_disconnect channels wind down after a
            // grace period with no clients
            if self.clients.is_empty() {
                if self.idle_behavior().await == IdleBehavior::StopOnDisconnect {
                    match idle_since {
                        None => idle_since = Some(Instant::now()),
                        Some(since) if since.elapsed() > IDLE_STOP_GRACE => {
                            tracing::info!(
                                channel_id = self.channel_id,
                                "last client gone, stopping idle channel"
                            );
                            break;
                        }
                        Some(_) => {}
                    }
                }
            } else {
                idle_since = None;
            }

            let planned = match self.shared.engine.checkout_next(self.channel_id, Utc::now()).await
            {
                Ok(Some(planned)) => planned,
                Ok(None) => {
                    self.emit_slate("No programming", &mut stop_rx).await;
                    if pause_or_stop(&mut stop_rx, EMPTY_SCHEDULE_PAUSE).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::warn!(channel_id = self.channel_id, "playout lookup failed: {}", e);
                    self.emit_slate("No programming", &mut stop_rx).await;
                    if pause_or_stop(&mut stop_rx, EMPTY_SCHEDULE_PAUSE).await {
                        break;
                    }
                    continue;
                }
            };

            match self.play_item(&planned, &mut stop_rx).await {
                ItemOutcome::Completed => {
                    metrics::channel::STREAM_SUCCESS
                        .with_label_values(&[&self.channel_id.to_string()])
                        .inc();
                    self.shared
                        .gate
                        .record_success(self.channel_id, Instant::now());
                    // Next item continues on the same loop without teardown
                }
                ItemOutcome::Failed => {
                    self.error_count.fetch_add(1, Ordering::SeqCst);
                    metrics::channel::STREAM_FAILURE
                        .with_label_values(&[&self.channel_id.to_string()])
                        .inc();
                    self.shared
                        .gate
                        .record_failure(self.channel_id, Instant::now());
                    // A failure may mean the resolved URL expired upstream;
                    // dropping the cache entry makes the next attempt
                    // re-resolve instead of replaying a dead token URL
                    self.shared.resolver.cache().invalidate(
                        &planned.media_item.source,
                        &planned.media_item.source_id,
                    );
                    self.emit_slate("Technical difficulties", &mut stop_rx).await;
                    // Recovery is the health supervisor's job, not ours
                    break;
                }
                ItemOutcome::Stopped => break,
            }
        }
    }

    async fn play_item(
        &self,
        planned: &PlannedItem,
        stop_rx: &mut watch::Receiver<bool>,
    ) -> ItemOutcome {
        let item = &planned.media_item;
        let source = item.source_kind();

        let url = match self.shared.resolver.resolve_playable(item).await {
            Ok(url) => url,
            Err(e) => {
                tracing::warn!(
                    channel_id = self.channel_id,
                    item = item.id,
                    "URL resolution failed: {}",
                    e
                );
                return ItemOutcome::Failed;
            }
        };

        let probe = match crate::transcode::probe_input(&url).await {
            Ok(probe) => probe,
            Err(e) => {
                // An unprobeable input still gets a chance on the encode
                // path, which tolerates more
                tracing::debug!(channel_id = self.channel_id, "probe failed: {}", e);
                Default::default()
            }
        };

        let encoding = self.load_encoding().await;
        let accelerator = self.shared.accelerator.get().await;
        let plan = build_stream_command(&url, source, &probe, &encoding, accelerator);

        let cold_start = if source == SourceKind::Plex {
            self.shared.config.pool.cold_start_timeout_plex
        } else {
            self.shared.config.pool.cold_start_timeout
        };

        let mut handle = match self
            .shared
            .pool
            .acquire(self.channel_id, &plan.args, cold_start)
            .await
        {
            Ok(handle) => handle,
            Err(AcquireError::PoolClosed) => return ItemOutcome::Stopped,
            Err(e) => {
                tracing::warn!(
                    channel_id = self.channel_id,
                    reason = e.reason(),
                    "transcoder acquisition failed"
                );
                return ItemOutcome::Failed;
            }
        };

        tracing::info!(
            channel_id = self.channel_id,
            title = %planned.media_item.title,
            mode = ?plan.mode,
            "item playing"
        );

        // First output already arrived during the cold-start wait
        self.shared
            .gate
            .record_success(self.channel_id, Instant::now());
        self.note_output(handle.first_chunk.clone());

        let stderr_task = handle.stderr.take().map(|stderr| {
            let channel_id = self.channel_id;
            tokio::spawn(async move {
                drain_stderr(stderr, channel_id).await;
            })
        });

        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        let outcome = loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break ItemOutcome::Stopped;
                    }
                }
                read = handle.stdout.read(&mut buf) => match read {
                    Ok(0) => {
                        break self.end_of_stream(&handle);
                    }
                    Ok(n) => {
                        self.note_output(Bytes::copy_from_slice(&buf[..n]));
                    }
                    Err(e) => {
                        tracing::warn!(
                            channel_id = self.channel_id,
                            "transcoder read error: {}",
                            e
                        );
                        break ItemOutcome::Failed;
                    }
                }
            }
        };

        if let Some(task) = stderr_task {
            task.abort();
        }
        self.shared.pool.release(self.channel_id);
        outcome
    }

    /// EOF: a zero exit is end-of-item, anything else is a failure
    fn end_of_stream(&self, handle: &ProcessHandle) -> ItemOutcome {
        match handle.try_exit_status() {
            Some(status) if status.success() => ItemOutcome::Completed,
            Some(status) => {
                tracing::warn!(
                    channel_id = self.channel_id,
                    ?status,
                    "transcoder exited abnormally"
                );
                ItemOutcome::Failed
            }
            // Still winding down; EOF with no error reads as completion
            None => ItemOutcome::Completed,
        }
    }

    /// Record output and fan a chunk to every attached client
    fn note_output(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        *self.last_output.lock().expect("last_output poisoned") = Instant::now();

        let mut detached = Vec::new();
        for entry in self.clients.iter() {
            if !entry.value().offer(chunk.clone()) {
                detached.push(entry.key().clone());
            }
        }
        for session_id in detached {
            self.clients.remove(&session_id);
            tracing::debug!(
                channel_id = self.channel_id,
                session_id = %session_id,
                "client detached"
            );
        }
    }

    /// Close and remove sessions idle past the configured timeout
    fn sweep_sessions(&self) {
        let timeout = self.shared.config.session_idle_timeout;
        let mut expired = Vec::new();
        for entry in self.clients.iter() {
            if entry.value().idle_for() > timeout {
                expired.push(entry.key().clone());
            }
        }
        for session_id in expired {
            if let Some((_, queue)) = self.clients.remove(&session_id) {
                queue.close();
                tracing::info!(
                    channel_id = self.channel_id,
                    session_id = %session_id,
                    "session idle timeout"
                );
            }
        }
    }

    /// Generate a short titled slate through the transcoder and fan it out.
    ///
    /// Acquisition failures are swallowed; a saturated pool just means the
    /// clients wait silently.
    async fn emit_slate(&self, message: &str, stop_rx: &mut watch::Receiver<bool>) {
        if self.clients.is_empty() {
            return;
        }
        let args = build_slate_command(message, SLATE_SECONDS);
        let mut handle = match self
            .shared
            .pool
            .acquire(self.channel_id, &args, Duration::from_secs(10))
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                tracing::debug!(channel_id = self.channel_id, "slate unavailable: {}", e);
                return;
            }
        };

        self.note_output(handle.first_chunk.clone());
        let mut buf = vec![0u8; READ_CHUNK_BYTES];
        loop {
            tokio::select! {
                _ = stop_rx.changed() => break,
                read = handle.stdout.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => self.note_output(Bytes::copy_from_slice(&buf[..n])),
                }
            }
        }
        self.shared.pool.release(self.channel_id);
    }

    async fn idle_behavior(&self) -> IdleBehavior {
        self.load_channel()
            .await
            .map(|c| c.idle_behavior())
            .unwrap_or(IdleBehavior::StopOnDisconnect)
    }

    async fn load_channel(&self) -> Option<Channel> {
        let pool = self.shared.db.clone();
        let channel_id = self.channel_id;
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().ok()?;
            use schema::channels::dsl;
            dsl::channels
                .filter(dsl::id.eq(channel_id))
                .first::<Channel>(&mut conn)
                .optional()
                .ok()
                .flatten()
        })
        .await
        .ok()
        .flatten()
    }

    /// Channel encoding knobs: transcode mode, profile, watermark, language
    async fn load_encoding(&self) -> ChannelEncoding {
        let channel = match self.load_channel().await {
            Some(channel) => channel,
            None => return ChannelEncoding::default(),
        };

        let pool = self.shared.db.clone();
        let profile_id = channel.ffmpeg_profile_id;
        let watermark_id = channel.watermark_id;
        let (profile, watermark) = tokio::task::spawn_blocking(move || {
            let mut conn = match pool.get() {
                Ok(conn) => conn,
                Err(_) => return (None, None),
            };
            let profile = profile_id.and_then(|id| {
                use schema::ffmpeg_profiles::dsl;
                dsl::ffmpeg_profiles
                    .filter(dsl::id.eq(id))
                    .first::<crate::db::FfmpegProfile>(&mut conn)
                    .optional()
                    .ok()
                    .flatten()
            });
            let watermark = watermark_id.and_then(|id| {
                use schema::watermarks::dsl;
                dsl::watermarks
                    .filter(dsl::id.eq(id))
                    .first::<crate::db::Watermark>(&mut conn)
                    .optional()
                    .ok()
                    .flatten()
            });
            (profile, watermark)
        })
        .await
        .unwrap_or((None, None));

        ChannelEncoding {
            transcode_mode: channel.transcode_mode.parse::<TranscodeMode>().ok(),
            profile,
            watermark,
            preferred_audio_language: channel.preferred_audio_language.clone(),
            burn_subtitles: channel.subtitle_mode == "burn",
        }
    }
}

/// Park until the pause elapses or a stop arrives; true means stop
async fn pause_or_stop(stop_rx: &mut watch::Receiver<bool>, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        changed = stop_rx.changed() => changed.is_err() || *stop_rx.borrow(),
    }
}

/// Log transcoder diagnostics with the channel for context.
///
/// ffmpeg writes arbitrary bytes here; decoding is always lossy, never
/// strict.
async fn drain_stderr(stderr: tokio::process::ChildStderr, channel_id: i32) {
    let mut reader = BufReader::new(stderr);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end();
                if text.is_empty() || text.contains("Last message repeated") {
                    continue;
                }
                tracing::debug!(channel_id, "ffmpeg: {}", text);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_packet_shape() {
        let packet = null_ts_packet();
        assert_eq!(packet.len(), 188);
        assert_eq!(packet[0], 0x47);
        // Null PID is 0x1FFF
        assert_eq!(packet[1] & 0x1F, 0x1F);
        assert_eq!(packet[2], 0xFF);
    }

    #[test]
    fn test_stderr_decoding_tolerates_invalid_utf8() {
        // The lossy path must never panic on arbitrary bytes
        let raw: &[u8] = &[0x66, 0x66, 0xFF, 0xFE, 0x6D, 0x70, 0x65, 0x67];
        let decoded = String::from_utf8_lossy(raw);
        assert!(decoded.contains('\u{FFFD}'));
        assert!(decoded.starts_with("ff"));
    }

    #[tokio::test]
    async fn test_pause_or_stop_honors_stop_signal() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).unwrap();
        assert!(pause_or_stop(&mut rx, Duration::from_secs(30)).await);
    }

    #[tokio::test]
    async fn test_pause_or_stop_elapses_without_signal() {
        let (_tx, mut rx) = watch::channel(false);
        assert!(!pause_or_stop(&mut rx, Duration::from_millis(10)).await);
    }
}
