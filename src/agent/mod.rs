//! Bounded remediation agent
//!
//! A deterministic, step-capped loop that observes engine health and runs
//! narrow allow-listed tools. It never recurses, tools never call tools,
//! restarts only go through the supervisor's gate, and process spawning
//! stays behind the pool. The loop disables itself (containment) whenever
//! the engine looks unstable, because a remediation pass must never make a
//! bad situation worse.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::broadcast::{BroadcasterRegistry, CircuitState, RestartDecision, RestartGate};
use crate::config::AgentConfig;
use crate::epg::{EpgCache, EpgGenerator};
use crate::metadata::MetadataPipeline;
use crate::metrics;
use crate::playout::PlayoutEngine;
use crate::transcode::ProcessPool;

/// Containment: restarts per storm window at or above this
const CONTAIN_RESTART_VELOCITY: usize = 10;

/// Containment: pool pressure at or above this fraction
const CONTAIN_POOL_PRESSURE: f64 = 0.9;

/// Containment: RSS growth beyond this over the sample window
const CONTAIN_RSS_GROWTH: u64 = 100 * 1024 * 1024;

/// RSS growth observation window
const RSS_WINDOW: Duration = Duration::from_secs(600);

/// Consecutive metadata-tool failures that abort the loop
const METADATA_FAILURE_ABORT: u32 = 3;

/// Tool risk classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Risk {
    Low,
    Medium,
    High,
}

/// One allow-list entry
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub tag: &'static str,
    pub risk: Risk,
    pub cooldown: Duration,
    pub retry_cap: u32,
    pub idempotent: bool,
    pub is_metadata: bool,
}

/// The static tool allow-list; built at startup, no runtime registration
pub const TOOL_REGISTRY: &[ToolSpec] = &[
    ToolSpec { tag: "fetch_recent_logs", risk: Risk::Low, cooldown: Duration::from_secs(5), retry_cap: 1, idempotent: true, is_metadata: false },
    ToolSpec { tag: "inspect_pool_status", risk: Risk::Low, cooldown: Duration::from_secs(10), retry_cap: 1, idempotent: true, is_metadata: false },
    ToolSpec { tag: "get_channel_health", risk: Risk::Low, cooldown: Duration::from_secs(5), retry_cap: 1, idempotent: true, is_metadata: false },
    ToolSpec { tag: "re_enrich_metadata", risk: Risk::Low, cooldown: Duration::from_secs(30), retry_cap: 1, idempotent: true, is_metadata: true },
    ToolSpec { tag: "refresh_plex_metadata", risk: Risk::Low, cooldown: Duration::from_secs(30), retry_cap: 1, idempotent: true, is_metadata: true },
    ToolSpec { tag: "rebuild_xmltv", risk: Risk::Low, cooldown: Duration::from_secs(30), retry_cap: 1, idempotent: true, is_metadata: false },
    ToolSpec { tag: "reparse_filename_metadata", risk: Risk::Low, cooldown: Duration::from_secs(30), retry_cap: 1, idempotent: true, is_metadata: true },
    ToolSpec { tag: "rebuild_playout", risk: Risk::Medium, cooldown: Duration::from_secs(120), retry_cap: 1, idempotent: false, is_metadata: false },
    ToolSpec { tag: "restart_channel", risk: Risk::High, cooldown: Duration::from_secs(30), retry_cap: 1, idempotent: false, is_metadata: false },
];

pub fn tool_spec(tag: &str) -> Option<&'static ToolSpec> {
    TOOL_REGISTRY.iter().find(|spec| spec.tag == tag)
}

/// Diagnostic snapshot the loop plans against
#[derive(Debug, Clone)]
pub struct Envelope {
    pub channel_id: Option<i32>,
    pub failure_classification: Option<String>,
    pub restart_velocity: f64,
    pub pool_pressure: f64,
    pub metadata_failure_ratio: f64,
    pub placeholder_ratio: f64,
    pub circuit_state: CircuitState,
    pub containment_mode: bool,
    pub confidence: f64,
    pub channel_stale: bool,
}

/// Why the loop refused to run a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolRefusal {
    NotAllowListed,
    OnCooldown,
    AlreadyRanThisLoop,
    HighRiskBudgetSpent,
    ConfidenceTooLow,
    StepCapReached,
}

/// Per-loop constraint tracking, separated out so the rules are testable
/// without the full dependency set
pub struct LoopState {
    max_steps: usize,
    steps_taken: usize,
    executed: Vec<&'static str>,
    high_risk_used: bool,
    confidence: f64,
    metadata_allowed: bool,
}

impl LoopState {
    pub fn new(max_steps: usize, confidence: f64, metadata_allowed: bool) -> Self {
        Self {
            max_steps,
            steps_taken: 0,
            executed: Vec::new(),
            high_risk_used: false,
            confidence,
            metadata_allowed,
        }
    }

    /// Check every per-loop constraint for a tool; recording happens only
    /// when the check passes
    pub fn admit(
        &mut self,
        tag: &str,
        cooldowns: &DashMap<&'static str, Instant>,
    ) -> Result<&'static ToolSpec, ToolRefusal> {
        let spec = tool_spec(tag).ok_or(ToolRefusal::NotAllowListed)?;

        if self.steps_taken >= self.max_steps {
            return Err(ToolRefusal::StepCapReached);
        }
        if self.executed.contains(&spec.tag) {
            return Err(ToolRefusal::AlreadyRanThisLoop);
        }
        if spec.risk == Risk::High && self.high_risk_used {
            return Err(ToolRefusal::HighRiskBudgetSpent);
        }
        if spec.is_metadata && !self.metadata_allowed && self.confidence < 0.3 {
            return Err(ToolRefusal::ConfidenceTooLow);
        }
        if let Some(last_run) = cooldowns.get(spec.tag) {
            if last_run.elapsed() < spec.cooldown {
                return Err(ToolRefusal::OnCooldown);
            }
        }

        self.steps_taken += 1;
        self.executed.push(spec.tag);
        if spec.risk == Risk::High {
            self.high_risk_used = true;
        }
        cooldowns.insert(spec.tag, Instant::now());
        Ok(spec)
    }
}

/// Plan the tool sequence for an envelope. Pure and deterministic: the same
/// envelope always yields the same plan.
pub fn plan_steps(envelope: &Envelope) -> Vec<&'static str> {
    let mut plan = Vec::new();

    // Always look before touching anything
    if envelope.channel_id.is_some() {
        plan.push("get_channel_health");
    } else {
        plan.push("inspect_pool_status");
    }

    let metadata_trouble =
        envelope.metadata_failure_ratio > 0.3 || envelope.placeholder_ratio > 0.1;

    if metadata_trouble {
        if envelope.confidence >= 0.3 {
            plan.push("re_enrich_metadata");
        } else {
            plan.push("reparse_filename_metadata");
        }
        plan.push("rebuild_xmltv");
    } else if envelope.channel_stale && envelope.circuit_state == CircuitState::Closed {
        plan.push("restart_channel");
    }

    plan
}

/// What a finished loop reports upward
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub executed: Vec<&'static str>,
    pub aborted: Option<String>,
    pub contained: bool,
}

/// Shared dependencies of the remediation loop
pub struct AgentDeps {
    pub gate: Arc<RestartGate>,
    pub pool: Arc<ProcessPool>,
    pub registry: Arc<BroadcasterRegistry>,
    pub pipeline: Arc<MetadataPipeline>,
    pub engine: Arc<PlayoutEngine>,
    pub epg: Arc<EpgGenerator>,
    pub epg_cache: Arc<EpgCache>,
}

/// The bounded agent itself
pub struct BoundedAgent {
    config: AgentConfig,
    deps: AgentDeps,
    cooldowns: DashMap<&'static str, Instant>,
    consecutive_metadata_failures: AtomicU32,
    rss_samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl BoundedAgent {
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Self {
        Self {
            config,
            deps,
            cooldowns: DashMap::new(),
            consecutive_metadata_failures: AtomicU32::new(0),
            rss_samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Record an RSS sample for the growth trigger; called on a timer by
    /// the host
    pub fn sample_rss(&self) {
        if let Some(rss) = metrics::read_self_rss_bytes() {
            let mut samples = self.rss_samples.lock().expect("rss samples poisoned");
            let now = Instant::now();
            samples.push_back((now, rss));
            while let Some((at, _)) = samples.front() {
                if now.duration_since(*at) > RSS_WINDOW {
                    samples.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    fn rss_growth(&self) -> u64 {
        let samples = self.rss_samples.lock().expect("rss samples poisoned");
        match (samples.front(), samples.back()) {
            (Some((_, oldest)), Some((_, newest))) => newest.saturating_sub(*oldest),
            _ => 0,
        }
    }

    /// Build the diagnostic envelope for a target channel
    pub fn build_envelope(&self, channel_id: Option<i32>) -> Envelope {
        let now = Instant::now();
        let pool_status = self.deps.pool.status();
        let velocity = self.deps.gate.restart_velocity(now);

        let (circuit_state, channel_stale, confidence) = match channel_id {
            Some(id) => {
                let stale = self
                    .deps
                    .registry
                    .get(id)
                    .map(|b| {
                        let state = b.state();
                        state.last_output_age > Duration::from_secs(180)
                    })
                    .unwrap_or(false);
                (
                    self.deps.gate.circuit_state(id, now),
                    stale,
                    self.deps.pipeline.confidence(id),
                )
            }
            None => (CircuitState::Closed, false, 0.5),
        };

        // Placeholder pressure relative to overall lookup volume; coarse,
        // but enough to route the loop toward metadata remediation
        let lookups = metrics::epg::METADATA_LOOKUP_SUCCESS.get()
            + metrics::epg::METADATA_LOOKUP_FAILURE.get();
        let placeholder_ratio =
            metrics::epg::PLACEHOLDER_TITLES.get() as f64 / lookups.max(1) as f64;

        Envelope {
            channel_id,
            failure_classification: None,
            restart_velocity: velocity as f64,
            pool_pressure: pool_status.pressure(),
            metadata_failure_ratio: self.deps.pipeline.failure_ratio(),
            placeholder_ratio,
            circuit_state,
            containment_mode: self.deps.gate.containment(),
            confidence,
            channel_stale,
        }
    }

    /// Whether the envelope demands containment
    pub fn containment_triggered(&self, envelope: &Envelope) -> bool {
        envelope.restart_velocity >= CONTAIN_RESTART_VELOCITY as f64
            || envelope.pool_pressure >= CONTAIN_POOL_PRESSURE
            || envelope.circuit_state == CircuitState::Open
            || self.rss_growth() > CONTAIN_RSS_GROWTH
    }

    /// Run one bounded remediation loop for an optional target channel.
    pub async fn run(&self, channel_id: Option<i32>) -> AgentReport {
        if !self.config.enabled {
            return AgentReport {
                executed: Vec::new(),
                aborted: Some("agent disabled".to_string()),
                contained: false,
            };
        }

        let envelope = self.build_envelope(channel_id);

        if self.containment_triggered(&envelope) {
            self.deps.gate.set_containment(true);
            tracing::warn!(?channel_id, "agent containment engaged, loop suppressed");
            return AgentReport {
                executed: Vec::new(),
                aborted: Some("containment".to_string()),
                contained: true,
            };
        }
        // A clean envelope clears a previous containment episode
        if envelope.containment_mode {
            self.deps.gate.set_containment(false);
            tracing::info!("agent containment cleared");
        }

        let ratio_before = envelope.metadata_failure_ratio;
        let mut state = LoopState::new(
            self.config.max_steps,
            envelope.confidence,
            self.config.metadata_self_resolution_enabled,
        );
        let mut executed = Vec::new();
        let mut aborted = None;

        for tag in plan_steps(&envelope) {
            let spec = match state.admit(tag, &self.cooldowns) {
                Ok(spec) => spec,
                Err(refusal) => {
                    tracing::debug!(tool = tag, ?refusal, "tool refused");
                    continue;
                }
            };

            let result = self.execute(spec, &envelope).await;
            executed.push(spec.tag);

            match result {
                Ok(()) => {
                    if spec.is_metadata {
                        self.consecutive_metadata_failures.store(0, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    tracing::warn!(tool = spec.tag, "agent tool failed: {}", e);
                    if spec.is_metadata {
                        let failures = self
                            .consecutive_metadata_failures
                            .fetch_add(1, Ordering::Relaxed)
                            + 1;
                        if failures >= METADATA_FAILURE_ABORT {
                            aborted =
                                Some("three consecutive metadata tool failures".to_string());
                            break;
                        }
                    }
                }
            }
        }

        // A self-resolution attempt that worsened the failure ratio aborts
        // and escalates
        let ratio_after = self.deps.pipeline.failure_ratio();
        if ratio_after - ratio_before > 0.1 {
            aborted = Some(format!(
                "self-resolution worsened failure ratio ({:.2} -> {:.2})",
                ratio_before, ratio_after
            ));
        }

        if let Some(reason) = &aborted {
            tracing::error!(?channel_id, reason, "agent loop aborted, escalating");
        }

        AgentReport {
            executed,
            aborted,
            contained: false,
        }
    }

    async fn execute(&self, spec: &ToolSpec, envelope: &Envelope) -> Result<(), String> {
        match spec.tag {
            "fetch_recent_logs" | "inspect_pool_status" => {
                let status = self.deps.pool.status();
                tracing::info!(
                    active = status.active,
                    pending = status.pending,
                    rejected = status.rejected_total,
                    "pool status inspected"
                );
                Ok(())
            }
            "get_channel_health" => {
                if let Some(id) = envelope.channel_id {
                    if let Some(broadcaster) = self.deps.registry.get(id) {
                        let state = broadcaster.state();
                        tracing::info!(
                            channel_id = id,
                            running = state.is_running,
                            age_secs = state.last_output_age.as_secs(),
                            clients = state.client_count,
                            "channel health inspected"
                        );
                    }
                }
                Ok(())
            }
            "re_enrich_metadata" | "reparse_filename_metadata" | "refresh_plex_metadata" => {
                // The pipeline's own writes are idempotent null-filling;
                // the agent adds nothing beyond invoking it
                self.reenrich_placeholder_items().await
            }
            "rebuild_xmltv" => {
                match self.deps.epg.generate(Utc::now()).await {
                    Ok(document) => {
                        self.deps.epg_cache.store(document);
                        Ok(())
                    }
                    Err(e) => Err(e.to_string()),
                }
            }
            "rebuild_playout" => match envelope.channel_id {
                Some(id) => self
                    .deps
                    .engine
                    .rebuild(id, Utc::now())
                    .await
                    .map_err(|e| e.to_string()),
                None => Err("rebuild_playout needs a target channel".to_string()),
            },
            "restart_channel" => match envelope.channel_id {
                Some(id) => match self.deps.gate.request(id, Instant::now()) {
                    RestartDecision::Allowed => {
                        if let Some(broadcaster) = self.deps.registry.get(id) {
                            broadcaster.note_restart();
                            broadcaster.stop().await;
                            broadcaster.start();
                        }
                        Ok(())
                    }
                    RestartDecision::Blocked(reason) => {
                        Err(format!("restart blocked: {}", reason.as_str()))
                    }
                },
                None => Err("restart_channel needs a target channel".to_string()),
            },
            other => Err(format!("tool {} has no executor", other)),
        }
    }

    /// Re-run enrichment for items carrying placeholder titles, filling
    /// only missing fields
    async fn reenrich_placeholder_items(&self) -> Result<(), String> {
        use diesel::prelude::*;

        let pool = self.deps.registry.db_pool();
        let items = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().map_err(|e| e.to_string())?;
            use crate::db::schema::media_items::dsl;
            dsl::media_items
                .filter(dsl::title.like("Item %").or(dsl::year.is_null()))
                .limit(50)
                .load::<crate::db::MediaItem>(&mut conn)
                .map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())??;

        let mut patched = 0usize;
        for item in &items {
            let patch = self.deps.pipeline.enrich(item).await;
            if patch.is_empty() {
                continue;
            }
            let pool = self.deps.registry.db_pool();
            let item_id = item.id;
            let apply = patch.clone();
            let updated = tokio::task::spawn_blocking(move || {
                let mut conn = pool.get().map_err(|e| e.to_string())?;
                use crate::db::schema::media_items::dsl;
                let Some(item_id) = item_id else { return Ok::<_, String>(0) };

                let mut count = 0;
                if let Some(year) = apply.year {
                    count += diesel::update(
                        dsl::media_items.filter(dsl::id.eq(item_id)).filter(dsl::year.is_null()),
                    )
                    .set(dsl::year.eq(year))
                    .execute(&mut conn)
                    .map_err(|e| e.to_string())?;
                }
                if let Some(title) = apply.title {
                    count += diesel::update(
                        dsl::media_items
                            .filter(dsl::id.eq(item_id))
                            .filter(dsl::title.like("Item %")),
                    )
                    .set(dsl::title.eq(title))
                    .execute(&mut conn)
                    .map_err(|e| e.to_string())?;
                }
                if let Some(season) = apply.season {
                    count += diesel::update(
                        dsl::media_items.filter(dsl::id.eq(item_id)).filter(dsl::season.is_null()),
                    )
                    .set(dsl::season.eq(season))
                    .execute(&mut conn)
                    .map_err(|e| e.to_string())?;
                }
                if let Some(episode) = apply.episode {
                    count += diesel::update(
                        dsl::media_items
                            .filter(dsl::id.eq(item_id))
                            .filter(dsl::episode.is_null()),
                    )
                    .set(dsl::episode.eq(episode))
                    .execute(&mut conn)
                    .map_err(|e| e.to_string())?;
                }
                Ok(count)
            })
            .await
            .map_err(|e| e.to_string())??;
            patched += updated;
        }

        tracing::info!(items = items.len(), fields = patched, "re-enrichment pass complete");
        Ok(())
    }
}
