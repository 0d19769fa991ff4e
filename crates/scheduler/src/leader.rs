//! Lease-based leader election.
//!
//! [`LeaderElector`] is a two-state machine driven by the scheduling loop:
//! every tick calls [`LeaderElector::tick`], which tries to acquire the
//! lease as a CANDIDATE or renews it as LEADER. Failing to renew, or any
//! fenced write reporting the lease gone, demotes back to CANDIDATE.

use std::time::Duration;

use conduit_db::repositories::{LeaderFence, LeaderLockRepo};
use sqlx::PgPool;

/// Lease ownership as seen by this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    Candidate,
    Leader,
}

/// Acquires, renews and releases one lease key.
pub struct LeaderElector {
    pool: PgPool,
    fence: LeaderFence,
    ttl: Duration,
    state: LeaderState,
}

impl LeaderElector {
    /// Elector with a random holder identity.
    pub fn new(pool: PgPool, key: impl Into<String>, ttl: Duration) -> Self {
        Self::with_holder(pool, key, new_holder_id(), ttl)
    }

    pub fn with_holder(
        pool: PgPool,
        key: impl Into<String>,
        holder_id: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            pool,
            fence: LeaderFence {
                key: key.into(),
                holder_id: holder_id.into(),
            },
            ttl,
            state: LeaderState::Candidate,
        }
    }

    pub fn state(&self) -> LeaderState {
        self.state
    }

    pub fn is_leader(&self) -> bool {
        self.state == LeaderState::Leader
    }

    pub fn holder_id(&self) -> &str {
        &self.fence.holder_id
    }

    /// Fence to pass to leader-only writes, or `None` while a candidate.
    pub fn fence(&self) -> Option<&LeaderFence> {
        self.is_leader().then_some(&self.fence)
    }

    /// Try to acquire or renew the lease and return the resulting state.
    ///
    /// A database error while renewing demotes: another instance may take
    /// over once the TTL lapses, so this one must stop leader work now.
    pub async fn tick(&mut self) -> LeaderState {
        let acquired = LeaderLockRepo::try_acquire(
            &self.pool,
            &self.fence.key,
            &self.fence.holder_id,
            self.ttl,
        )
        .await;

        let next = match acquired {
            Ok(Some(_)) => LeaderState::Leader,
            Ok(None) => LeaderState::Candidate,
            Err(e) => {
                tracing::error!(key = %self.fence.key, error = %e, "Leader lease renewal failed");
                LeaderState::Candidate
            }
        };
        self.set_state(next);
        next
    }

    /// Drop to CANDIDATE after a fenced write reported the lease lost.
    pub fn demote(&mut self) {
        self.set_state(LeaderState::Candidate);
    }

    /// Give up the lease so another instance can take over without waiting
    /// for the TTL.
    pub async fn release(&mut self) {
        if !self.is_leader() {
            return;
        }
        match LeaderLockRepo::release(&self.pool, &self.fence.key, &self.fence.holder_id).await {
            Ok(_) => tracing::info!(key = %self.fence.key, "Leader lease released"),
            Err(e) => tracing::warn!(key = %self.fence.key, error = %e, "Failed to release leader lease"),
        }
        self.state = LeaderState::Candidate;
    }

    fn set_state(&mut self, next: LeaderState) {
        if self.state == next {
            return;
        }
        match next {
            LeaderState::Leader => tracing::info!(
                key = %self.fence.key,
                holder_id = %self.fence.holder_id,
                "Became leader",
            ),
            LeaderState::Candidate => tracing::warn!(
                key = %self.fence.key,
                holder_id = %self.fence.holder_id,
                "Lost leadership",
            ),
        }
        self.state = next;
    }
}

/// Unique identity of this process for lease ownership.
pub fn new_holder_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
    format!("{host}-{}", uuid::Uuid::new_v4())
}
