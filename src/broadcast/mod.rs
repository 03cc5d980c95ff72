//! Channel broadcasting: fan-out, per-channel loops, health supervision

pub mod broadcaster;
pub mod fanout;
pub mod supervisor;

pub use broadcaster::{BroadcastShared, BroadcasterState, ChannelBroadcaster};
pub use fanout::{ClientQueue, ClientStream};
pub use supervisor::{
    BlockReason, CircuitBreaker, CircuitState, HealthState, RestartDecision, RestartGate,
};

use dashmap::DashMap;
use diesel::prelude::*;
use std::sync::Arc;
use std::time::Instant;

use crate::db::{schema, Channel};

/// All live broadcasters, keyed by channel id
pub struct BroadcasterRegistry {
    broadcasters: DashMap<i32, Arc<ChannelBroadcaster>>,
    shared: Arc<BroadcastShared>,
    health: DashMap<i32, HealthState>,
}

impl BroadcasterRegistry {
    pub fn new(shared: Arc<BroadcastShared>) -> Arc<Self> {
        Arc::new(Self {
            broadcasters: DashMap::new(),
            shared,
            health: DashMap::new(),
        })
    }

    /// The broadcaster for a channel, created (but not started) on demand
    pub fn get_or_create(&self, channel_id: i32) -> Arc<ChannelBroadcaster> {
        self.broadcasters
            .entry(channel_id)
            .or_insert_with(|| ChannelBroadcaster::new(channel_id, self.shared.clone()))
            .clone()
    }

    pub fn get(&self, channel_id: i32) -> Option<Arc<ChannelBroadcaster>> {
        self.broadcasters.get(&channel_id).map(|b| b.clone())
    }

    pub fn db_pool(&self) -> crate::db::DbPool {
        self.shared.db.clone()
    }

    pub fn all(&self) -> Vec<Arc<ChannelBroadcaster>> {
        self.broadcasters.iter().map(|b| b.clone()).collect()
    }

    pub fn health_state(&self, channel_id: i32) -> HealthState {
        self.health
            .get(&channel_id)
            .map(|h| *h)
            .unwrap_or(HealthState::Healthy)
    }

    fn set_health(&self, channel_id: i32, state: HealthState) {
        self.health.insert(channel_id, state);
    }

    /// User-initiated disable path: distinct from supervised recovery
    pub async fn stop_channel(&self, channel_id: i32) {
        if let Some((_, broadcaster)) = self.broadcasters.remove(&channel_id) {
            broadcaster.stop().await;
        }
        self.health.remove(&channel_id);
    }

    /// Graceful shutdown of every broadcaster
    pub async fn shutdown(&self) {
        for entry in self.broadcasters.iter() {
            entry.value().stop().await;
        }
        self.broadcasters.clear();
    }
}

/// Periodic staleness scan routing restarts through the gate
pub struct HealthSupervisor {
    registry: Arc<BroadcasterRegistry>,
    gate: Arc<RestartGate>,
    config: crate::config::HealthConfig,
}

impl HealthSupervisor {
    pub fn new(
        registry: Arc<BroadcasterRegistry>,
        gate: Arc<RestartGate>,
        config: crate::config::HealthConfig,
    ) -> Self {
        Self {
            registry,
            gate,
            config,
        }
    }

    /// Run the scan loop forever
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.scan().await;
            }
        })
    }

    /// One pass over every live broadcaster
    pub async fn scan(&self) {
        for broadcaster in self.registry.all() {
            let channel_id = broadcaster.channel_id();
            let state = broadcaster.state();

            // A stopped loop with waiting clients is as stale as a wedged
            // one; both route through the same gate
            let stale = (state.is_running && state.last_output_age > self.config.unhealthy_threshold)
                || (!state.is_running
                    && state.client_count > 0
                    && state.last_output_age > self.config.unhealthy_threshold);

            if !stale {
                self.registry.set_health(channel_id, HealthState::Healthy);
                continue;
            }

            self.registry.set_health(channel_id, HealthState::Unhealthy);

            // Channels opted out of supervised recovery stay unhealthy
            // until someone disables/enables them by hand
            if !self.channel_eligible(channel_id).await {
                tracing::info!(
                    channel_id,
                    age_secs = state.last_output_age.as_secs(),
                    "stale channel is not auto-restart eligible, leaving it alone"
                );
                continue;
            }

            match self.gate.request(channel_id, Instant::now()) {
                RestartDecision::Allowed => {
                    tracing::warn!(
                        channel_id,
                        age_secs = state.last_output_age.as_secs(),
                        "restarting stale channel"
                    );
                    self.registry.set_health(channel_id, HealthState::Restarting);
                    broadcaster.note_restart();
                    broadcaster.stop().await;
                    broadcaster.start();
                }
                RestartDecision::Blocked(reason) => {
                    tracing::info!(
                        channel_id,
                        reason = reason.as_str(),
                        "restart blocked, retrying next tick"
                    );
                }
            }
        }
    }

    /// Whether a channel's `auto_restart_eligible` flag permits supervised
    /// recovery. A channel that cannot be loaded is treated as ineligible:
    /// restarting something we cannot see is worse than waiting a tick.
    async fn channel_eligible(&self, channel_id: i32) -> bool {
        let pool = self.registry.db_pool();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().ok()?;
            use schema::channels::dsl;
            dsl::channels
                .filter(dsl::id.eq(channel_id))
                .first::<Channel>(&mut conn)
                .optional()
                .ok()
                .flatten()
                .map(|channel| channel.is_auto_restart_eligible())
        })
        .await
        .ok()
        .flatten()
        .unwrap_or(false)
    }
}

/// Start prewarm-flagged channels with a stagger so a boot does not slam
/// the process pool.
pub async fn prewarm_channels(registry: &Arc<BroadcasterRegistry>, config: &crate::config::Config) {
    let pool = registry.shared.db.clone();
    let channels: Vec<Channel> = match tokio::task::spawn_blocking(move || {
        let mut conn = pool.get().ok()?;
        use schema::channels::dsl;
        dsl::channels
            .filter(dsl::enabled.eq(1))
            .filter(dsl::prewarm.eq(1))
            .load::<Channel>(&mut conn)
            .ok()
    })
    .await
    {
        Ok(Some(channels)) => channels,
        _ => return,
    };

    if channels.is_empty() {
        return;
    }
    tracing::info!(count = channels.len(), "prewarming always-on channels");

    let semaphore = Arc::new(tokio::sync::Semaphore::new(
        config.prewarm_max_concurrent.max(1),
    ));
    for channel in channels {
        let Some(channel_id) = channel.id else { continue };
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let broadcaster = registry.get_or_create(channel_id);
        broadcaster.start();
        // The slot is held through the typical cold start so no more than
        // prewarm_max_concurrent channels are spinning up at once
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_secs(10)).await;
            drop(permit);
        });
        tokio::time::sleep(config.prewarm_stagger).await;
    }
}
