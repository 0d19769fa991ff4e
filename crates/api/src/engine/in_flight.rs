//! Per-process registry of tasks this orchestrator is pushing to a node.
//!
//! An entry lives only while the invoke call (and its retries) is running,
//! so a cancel can cut it short. Once a runner has accepted the task, or
//! the call gave up, the entry is gone; cancelling an accepted task goes
//! through the task row and a direct runner RPC.

use std::collections::HashMap;
use std::sync::Mutex;

use conduit_core::types::DbId;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct InFlightRegistry {
    tokens: Mutex<HashMap<DbId, CancellationToken>>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task and return its abort token. Re-registering replaces
    /// (and cancels) a stale entry.
    pub fn register(&self, task_id: DbId) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(stale) = self.lock().insert(task_id, token.clone()) {
            stale.cancel();
        }
        token
    }

    /// Drop a finished task. Returns `false` if it was not registered here.
    pub fn complete(&self, task_id: DbId) -> bool {
        self.lock().remove(&task_id).is_some()
    }

    /// Abort and drop a task. Returns `false` if it was not registered here.
    pub fn cancel(&self, task_id: DbId) -> bool {
        match self.lock().remove(&task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, task_id: DbId) -> bool {
        self.lock().contains_key(&task_id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel everything, used at shutdown.
    pub fn cancel_all(&self) {
        for (_, token) in self.lock().drain() {
            token.cancel();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<DbId, CancellationToken>> {
        // Poisoning cannot leave the map half-updated.
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}
