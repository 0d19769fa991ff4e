//! The scheduling loop.
//!
//! While this instance is leader, each tick runs three fenced steps in
//! order: promote due schedules into tasks, start ready tasks within their
//! group caps, and expire tasks that overstayed a timeout. Every step is
//! idempotent, so a cycle cut short by a leadership flap is simply re-run
//! by whichever instance leads next.

use std::time::Instant;

use chrono::Utc;
use conduit_db::repositories::{ScheduleRepo, TaskRepo};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::leader::{LeaderElector, LeaderState};

/// Maximum terminal tasks deleted per prune pass.
const PRUNE_BATCH_SIZE: i64 = 1000;

/// What one leader cycle did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub promoted: usize,
    pub dispatched: usize,
    pub expired: usize,
}

/// Leader-elected scheduling loop.
pub struct Scheduler {
    pool: PgPool,
    config: SchedulerConfig,
    elector: LeaderElector,
    last_prune: Option<Instant>,
}

impl Scheduler {
    pub fn new(pool: PgPool, config: SchedulerConfig) -> Self {
        let elector = LeaderElector::new(pool.clone(), config.lease_key.clone(), config.lease_ttl);
        Self::with_elector(pool, config, elector)
    }

    pub fn with_elector(pool: PgPool, config: SchedulerConfig, elector: LeaderElector) -> Self {
        Self {
            pool,
            config,
            elector,
            last_prune: None,
        }
    }

    pub fn elector(&self) -> &LeaderElector {
        &self.elector
    }

    /// Run until cancelled, then release the lease if held.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        tracing::info!(
            key = %self.config.lease_key,
            holder_id = %self.elector.holder_id(),
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Scheduler started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        self.elector.release().await;
    }

    /// Renew the lease and run one cycle if leader.
    pub async fn tick(&mut self) -> Option<CycleReport> {
        if self.elector.tick().await != LeaderState::Leader {
            return None;
        }

        match self.cycle().await {
            Ok(report) => {
                if report != CycleReport::default() {
                    tracing::debug!(
                        promoted = report.promoted,
                        dispatched = report.dispatched,
                        expired = report.expired,
                        "Scheduling cycle complete",
                    );
                }
                self.maybe_prune().await;
                Some(report)
            }
            Err(SchedulerError::LeadershipLost(key)) => {
                tracing::warn!(%key, "Lease lost mid-cycle, stopping leader work");
                self.elector.demote();
                None
            }
            Err(e) => {
                tracing::error!(error = %e, "Scheduling cycle failed");
                None
            }
        }
    }

    /// One promote → dispatch → expire pass under the current lease.
    pub async fn cycle(&self) -> Result<CycleReport, SchedulerError> {
        let fence = self
            .elector
            .fence()
            .ok_or_else(|| SchedulerError::LeadershipLost(self.config.lease_key.clone()))?;

        let promotions = ScheduleRepo::promote_due(
            &self.pool,
            Utc::now(),
            self.config.promotion_batch_size,
            Some(fence),
        )
        .await?;
        for p in &promotions {
            tracing::info!(
                schedule_id = p.schedule.id,
                task_id = p.task.id,
                next_execution_at = %p.schedule.next_execution_at,
                "Schedule promoted",
            );
        }

        let started = TaskRepo::dispatch_ready(
            &self.pool,
            Utc::now(),
            self.config.dispatch_batch_size,
            Some(fence),
        )
        .await?;
        for task in &started {
            tracing::debug!(task_id = task.id, group_key = %task.group_key, "Task started");
        }

        let expired = TaskRepo::expire_stale(
            &self.pool,
            Utc::now(),
            self.config.heartbeat_timeout,
            self.config.dispatch_batch_size,
            &self.config.task_defaults.retry_backoff,
            Some(fence),
        )
        .await?;
        for e in &expired {
            tracing::warn!(
                task_id = e.task.id,
                group_key = %e.task.group_key,
                reason = e.reason.as_str(),
                successor_id = e.successor.as_ref().map(|s| s.id),
                "Task expired",
            );
        }

        Ok(CycleReport {
            promoted: promotions.len(),
            dispatched: started.len(),
            expired: expired.len(),
        })
    }

    async fn maybe_prune(&mut self) {
        let due = self
            .last_prune
            .map_or(true, |at| at.elapsed() >= self.config.prune_interval);
        if !due {
            return;
        }
        self.last_prune = Some(Instant::now());

        let Ok(retention) = chrono::TimeDelta::from_std(self.config.task_retention) else {
            return;
        };
        match TaskRepo::prune_terminated(&self.pool, Utc::now() - retention, PRUNE_BATCH_SIZE).await {
            Ok(0) => {}
            Ok(pruned) => tracing::info!(pruned, "Pruned terminated tasks"),
            Err(e) => tracing::error!(error = %e, "Task pruning failed"),
        }
    }
}
