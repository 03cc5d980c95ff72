//! Health supervision and restart gating
//!
//! A periodic task watches every enabled channel's `last_output_time` and
//! requests a restart for stale ones. `request_channel_restart` is the
//! single gate for recovery restarts; nothing else may stop+start a channel
//! to heal it. The gate stacks four guards: a global storm throttle, a
//! per-channel cooldown, a per-channel circuit breaker, and agent
//! containment.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::config::HealthConfig;
use crate::metrics;

/// Circuit breaker states, encoded 0/1/2 on the metrics gauge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::Open => 1,
            Self::HalfOpen => 2,
        }
    }
}

/// Per-channel restart-safety state machine.
///
/// CLOSED opens after enough failures inside the window; OPEN probes
/// HALF_OPEN after the open interval; HALF_OPEN closes on a success and
/// reopens on a failure.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    failure_window: VecDeque<Instant>,
    opened_at: Option<Instant>,
    failure_threshold: usize,
    window: Duration,
    open_duration: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_window: VecDeque::new(),
            opened_at: None,
            failure_threshold: config.circuit_failure_threshold,
            window: config.circuit_failure_window,
            open_duration: config.circuit_open_duration,
        }
    }

    /// Current state, applying the OPEN to HALF_OPEN timer
    pub fn state(&mut self, now: Instant) -> CircuitState {
        if self.state == CircuitState::Open {
            if let Some(opened_at) = self.opened_at {
                if now.duration_since(opened_at) >= self.open_duration {
                    self.state = CircuitState::HalfOpen;
                }
            }
        }
        self.state
    }

    pub fn record_failure(&mut self, now: Instant) {
        match self.state(now) {
            CircuitState::HalfOpen => {
                // The probe failed; reopen
                self.state = CircuitState::Open;
                self.opened_at = Some(now);
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                self.failure_window.push_back(now);
                while let Some(front) = self.failure_window.front() {
                    if now.duration_since(*front) > self.window {
                        self.failure_window.pop_front();
                    } else {
                        break;
                    }
                }
                if self.failure_window.len() >= self.failure_threshold {
                    self.state = CircuitState::Open;
                    self.opened_at = Some(now);
                    self.failure_window.clear();
                }
            }
        }
    }

    pub fn record_success(&mut self, now: Instant) {
        if self.state(now) == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            self.opened_at = None;
        }
        self.failure_window.clear();
    }
}

/// Why the gate refused a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    Storm,
    Cooldown,
    CircuitOpen,
    Containment,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Storm => "storm",
            Self::Cooldown => "cooldown",
            Self::CircuitOpen => "circuit_open",
            Self::Containment => "containment",
        }
    }
}

/// Outcome of a restart request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Allowed,
    Blocked(BlockReason),
}

struct ChannelGuard {
    last_restart: Option<Instant>,
    breaker: CircuitBreaker,
}

/// The single gate for recovery restarts
pub struct RestartGate {
    config: HealthConfig,
    /// Timestamps of allowed restarts inside the rolling storm window
    global_window: Mutex<VecDeque<Instant>>,
    channels: DashMap<i32, Mutex<ChannelGuard>>,
    containment: AtomicBool,
}

impl RestartGate {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            global_window: Mutex::new(VecDeque::new()),
            channels: DashMap::new(),
            containment: AtomicBool::new(false),
        }
    }

    fn guard_for(&self, channel_id: i32) -> dashmap::mapref::one::Ref<'_, i32, Mutex<ChannelGuard>> {
        self.channels
            .entry(channel_id)
            .or_insert_with(|| {
                Mutex::new(ChannelGuard {
                    last_restart: None,
                    breaker: CircuitBreaker::new(&self.config),
                })
            })
            .downgrade()
    }

    /// Evaluate all guards for a restart of `channel_id` at `now`.
    ///
    /// An `Allowed` result reserves a slot in the storm window and stamps
    /// the channel cooldown; the caller is expected to perform the restart.
    pub fn request(&self, channel_id: i32, now: Instant) -> RestartDecision {
        // R4: containment blocks everything
        if self.containment.load(Ordering::Relaxed) {
            return RestartDecision::Blocked(BlockReason::Containment);
        }

        let guard_ref = self.guard_for(channel_id);
        let mut guard = guard_ref.lock().expect("channel guard poisoned");

        // R2: per-channel cooldown
        if let Some(last) = guard.last_restart {
            if now.duration_since(last) < self.config.restart_cooldown {
                return RestartDecision::Blocked(BlockReason::Cooldown);
            }
        }

        // R3: circuit breaker
        let state = guard.breaker.state(now);
        metrics::channel::CIRCUIT_BREAKER_STATE
            .with_label_values(&[&channel_id.to_string()])
            .set(state.as_gauge());
        if state == CircuitState::Open {
            return RestartDecision::Blocked(BlockReason::CircuitOpen);
        }

        // R1: global storm throttle over a rolling window
        {
            let mut window = self.global_window.lock().expect("storm window poisoned");
            while let Some(front) = window.front() {
                if now.duration_since(*front) > self.config.storm_window {
                    window.pop_front();
                } else {
                    break;
                }
            }
            if window.len() >= self.config.storm_max {
                return RestartDecision::Blocked(BlockReason::Storm);
            }
            window.push_back(now);
        }

        guard.last_restart = Some(now);
        RestartDecision::Allowed
    }

    /// Feed a channel failure (stream error, hard decode failure) into its
    /// breaker
    pub fn record_failure(&self, channel_id: i32, now: Instant) {
        let guard_ref = self.guard_for(channel_id);
        let mut guard = guard_ref.lock().expect("channel guard poisoned");
        guard.breaker.record_failure(now);
        let state = guard.breaker.state(now);
        metrics::channel::CIRCUIT_BREAKER_STATE
            .with_label_values(&[&channel_id.to_string()])
            .set(state.as_gauge());
    }

    /// Feed a channel success (output flowing after a start)
    pub fn record_success(&self, channel_id: i32, now: Instant) {
        let guard_ref = self.guard_for(channel_id);
        let mut guard = guard_ref.lock().expect("channel guard poisoned");
        guard.breaker.record_success(now);
        metrics::channel::CIRCUIT_BREAKER_STATE
            .with_label_values(&[&channel_id.to_string()])
            .set(guard.breaker.state(now).as_gauge());
    }

    /// Circuit state for diagnostics (agent envelope, status surfaces)
    pub fn circuit_state(&self, channel_id: i32, now: Instant) -> CircuitState {
        let guard_ref = self.guard_for(channel_id);
        let mut guard = guard_ref.lock().expect("channel guard poisoned");
        guard.breaker.state(now)
    }

    /// Restarts performed within the storm window ending at `now`
    pub fn restart_velocity(&self, now: Instant) -> usize {
        let window = self.global_window.lock().expect("storm window poisoned");
        window
            .iter()
            .filter(|t| now.duration_since(**t) <= self.config.storm_window)
            .count()
    }

    /// Enter or leave containment mode (agent-driven, §R4)
    pub fn set_containment(&self, contained: bool) {
        self.containment.store(contained, Ordering::Relaxed);
    }

    pub fn containment(&self) -> bool {
        self.containment.load(Ordering::Relaxed)
    }
}

/// Channel health as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
    Restarting,
}
