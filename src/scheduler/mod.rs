//! Scheduled EPG refresh
//!
//! A cron-driven background job keeps the XMLTV cache warm and runs the
//! once-per-cycle metadata checks (drift, early-warning signals) off the
//! request path. Uses tokio-cron-scheduler for robust cron-based job
//! scheduling.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::epg::{EpgCache, EpgGenerator};
use crate::metadata::MetadataPipeline;
use crate::metrics;

/// Default refresh cadence: every 30 minutes
const DEFAULT_CRON: &str = "0 */30 * * * *";

/// Error types for scheduler operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::SchedulerError(err.to_string())
    }
}

/// EPG refresh scheduler wrapping one cron job
#[derive(Clone)]
pub struct EpgRefreshScheduler {
    scheduler: Arc<RwLock<Option<JobScheduler>>>,
    job_uuid: Arc<RwLock<Option<Uuid>>>,
    generator: Arc<EpgGenerator>,
    cache: Arc<EpgCache>,
    pipeline: Arc<MetadataPipeline>,
}

impl EpgRefreshScheduler {
    pub fn new(
        generator: Arc<EpgGenerator>,
        cache: Arc<EpgCache>,
        pipeline: Arc<MetadataPipeline>,
    ) -> Self {
        Self {
            scheduler: Arc::new(RwLock::new(None)),
            job_uuid: Arc::new(RwLock::new(None)),
            generator,
            cache,
            pipeline,
        }
    }

    /// Start the scheduler and install the refresh job
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let sched = JobScheduler::new().await?;
        sched.start().await?;

        {
            let mut scheduler = self.scheduler.write().await;
            *scheduler = Some(sched);
        }
        self.install_job(DEFAULT_CRON).await?;

        tracing::info!("EPG refresh scheduler started");
        Ok(())
    }

    /// Replace the refresh schedule with a new cron expression
    pub async fn install_job(&self, cron_expr: &str) -> Result<(), SchedulerError> {
        let scheduler_guard = self.scheduler.read().await;
        let sched = scheduler_guard
            .as_ref()
            .ok_or_else(|| SchedulerError::SchedulerError("Scheduler not started".to_string()))?;

        if let Some(uuid) = *self.job_uuid.read().await {
            let _ = sched.remove(&uuid).await;
        }

        let generator = self.generator.clone();
        let cache = self.cache.clone();
        let pipeline = self.pipeline.clone();

        let job = Job::new_async(cron_expr, move |_uuid, _lock| {
            let generator = generator.clone();
            let cache = cache.clone();
            let pipeline = pipeline.clone();
            Box::pin(async move {
                run_refresh_cycle(&generator, &cache, &pipeline).await;
            })
        })
        .map_err(|e| SchedulerError::InvalidSchedule(e.to_string()))?;

        let uuid = sched.add(job).await?;
        {
            let mut job_uuid = self.job_uuid.write().await;
            *job_uuid = Some(uuid);
        }

        tracing::info!(cron = cron_expr, "EPG refresh job scheduled");
        Ok(())
    }

    /// Stop the scheduler gracefully
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if let Some(uuid) = *self.job_uuid.read().await {
            if let Some(ref sched) = *self.scheduler.read().await {
                let _ = sched.remove(&uuid).await;
            }
        }
        if let Some(ref mut sched) = *self.scheduler.write().await {
            sched.shutdown().await?;
        }
        {
            let mut scheduler = self.scheduler.write().await;
            *scheduler = None;
        }
        {
            let mut job_uuid = self.job_uuid.write().await;
            *job_uuid = None;
        }
        tracing::info!("EPG refresh scheduler stopped");
        Ok(())
    }
}

/// One refresh cycle: regenerate, cache on success, and run the per-cycle
/// metadata checks.
pub async fn run_refresh_cycle(
    generator: &EpgGenerator,
    cache: &EpgCache,
    pipeline: &MetadataPipeline,
) {
    match generator.generate(Utc::now()).await {
        Ok(document) => {
            cache.store(document);
            tracing::debug!("scheduled EPG refresh complete");
        }
        Err(e) => {
            metrics::epg::XMLTV_VALIDATION_ERRORS.inc();
            tracing::error!("scheduled EPG refresh failed, keeping prior document: {}", e);
        }
    }

    // Once per cycle, not per programme
    pipeline.check_drift();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_cron_is_parseable() {
        // tokio-cron-scheduler accepts 6-field cron with seconds
        let parts: Vec<&str> = DEFAULT_CRON.split_whitespace().collect();
        assert_eq!(parts.len(), 6);
        assert_eq!(parts[0], "0");
    }
}
