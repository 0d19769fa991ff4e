//! Runner Client: pushes task execution onto a node and requests aborts.
//!
//! The orchestrator owns transport retries; the runner owns execution
//! semantics. Clients are cached per node in a [`RunnerRegistry`] owned by
//! the process that created them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::types::DbId;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::FleetError;

/// Metadata sent with every invocation so the runner can report back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub task_id: DbId,
    pub task_name: String,
    pub group_key: String,
    /// 1-based attempt number (`retry_count + 1`).
    pub attempt: i32,
    pub node_id: DbId,
}

/// RPC surface of a runner node.
#[async_trait]
pub trait RunnerClient: Send + Sync {
    /// Start executing `code` for a task. `Ok(false)` means the runner
    /// refused the task.
    async fn invoke(
        &self,
        task_id: DbId,
        context: &ExecutionContext,
        code: &str,
        code_params: &serde_json::Value,
    ) -> Result<bool, FleetError>;

    /// Ask the runner to abort a task. `Ok(false)` if it was not running it.
    async fn cancel(&self, task_id: DbId, context: &ExecutionContext) -> Result<bool, FleetError>;

    /// Ask the runner to call back `POST /notifyWhenIdle` once it has no
    /// in-flight work.
    async fn notify_when_idle(&self, node_id: DbId) -> Result<(), FleetError>;
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InvokeRequest<'a> {
    task_id: DbId,
    context: &'a ExecutionContext,
    code: &'a str,
    code_params: &'a serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CancelRequest<'a> {
    task_id: DbId,
    context: &'a ExecutionContext,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default = "default_ack")]
    ok: bool,
}

fn default_ack() -> bool {
    true
}

/// JSON-over-HTTP runner client bound to one node URL.
pub struct HttpRunnerClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRunnerClient {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Ack, FleetError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| FleetError::Runner(format!("{url}: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FleetError::Runner(format!("{url}: HTTP {}", status.as_u16())));
        }
        // An empty body counts as an acknowledgement.
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FleetError::Runner(format!("{url}: {e}")))?;
        if bytes.is_empty() {
            return Ok(Ack { ok: true });
        }
        serde_json::from_slice(&bytes).map_err(|e| FleetError::Runner(format!("{url}: {e}")))
    }
}

#[async_trait]
impl RunnerClient for HttpRunnerClient {
    async fn invoke(
        &self,
        task_id: DbId,
        context: &ExecutionContext,
        code: &str,
        code_params: &serde_json::Value,
    ) -> Result<bool, FleetError> {
        let body = InvokeRequest {
            task_id,
            context,
            code,
            code_params,
        };
        Ok(self.post("/invoke", &body).await?.ok)
    }

    async fn cancel(&self, task_id: DbId, context: &ExecutionContext) -> Result<bool, FleetError> {
        let body = CancelRequest { task_id, context };
        Ok(self.post("/abort", &body).await?.ok)
    }

    async fn notify_when_idle(&self, node_id: DbId) -> Result<(), FleetError> {
        self.post("/notifyWhenIdle", &serde_json::json!({ "nodeId": node_id }))
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Builds a client for a node URL.
pub type RunnerFactory = Arc<dyn Fn(&str) -> Arc<dyn RunnerClient> + Send + Sync>;

/// Per-process cache of runner clients keyed by node id.
pub struct RunnerRegistry {
    clients: RwLock<HashMap<DbId, (String, Arc<dyn RunnerClient>)>>,
    factory: RunnerFactory,
}

impl RunnerRegistry {
    pub fn new(factory: RunnerFactory) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            factory,
        }
    }

    /// Registry producing [`HttpRunnerClient`]s.
    pub fn http(request_timeout: Duration) -> Self {
        Self::new(Arc::new(move |url: &str| {
            Arc::new(HttpRunnerClient::new(url, request_timeout)) as Arc<dyn RunnerClient>
        }))
    }

    /// Cached client for `node_id`, rebuilt if the node's URL changed.
    pub async fn client_for(&self, node_id: DbId, url: &str) -> Arc<dyn RunnerClient> {
        if let Some((cached_url, client)) = self.clients.read().await.get(&node_id) {
            if cached_url == url {
                return Arc::clone(client);
            }
        }

        let client = (self.factory)(url);
        self.clients
            .write()
            .await
            .insert(node_id, (url.to_string(), Arc::clone(&client)));
        client
    }

    /// Drop the cached client of a node that left the fleet.
    pub async fn evict(&self, node_id: DbId) {
        self.clients.write().await.remove(&node_id);
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopRunner;

    #[async_trait]
    impl RunnerClient for NoopRunner {
        async fn invoke(
            &self,
            _: DbId,
            _: &ExecutionContext,
            _: &str,
            _: &serde_json::Value,
        ) -> Result<bool, FleetError> {
            Ok(true)
        }
        async fn cancel(&self, _: DbId, _: &ExecutionContext) -> Result<bool, FleetError> {
            Ok(true)
        }
        async fn notify_when_idle(&self, _: DbId) -> Result<(), FleetError> {
            Ok(())
        }
    }

    fn registry() -> (RunnerRegistry, Arc<std::sync::atomic::AtomicUsize>) {
        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let registry = RunnerRegistry::new(Arc::new(move |_url: &str| {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Arc::new(NoopRunner) as Arc<dyn RunnerClient>
        }));
        (registry, built)
    }

    #[tokio::test]
    async fn clients_are_cached_per_node() {
        let (registry, built) = registry();
        registry.client_for(1, "http://a").await;
        registry.client_for(1, "http://a").await;
        registry.client_for(2, "http://b").await;
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(registry.len().await, 2);
    }

    #[tokio::test]
    async fn url_change_rebuilds_and_evict_drops() {
        let (registry, built) = registry();
        registry.client_for(1, "http://a").await;
        registry.client_for(1, "http://a2").await;
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 2);

        registry.evict(1).await;
        assert_eq!(registry.len().await, 0);
    }

    #[test]
    fn context_serializes_camel_case() {
        let ctx = ExecutionContext {
            task_id: 7,
            task_name: "sync".into(),
            group_key: "g1".into(),
            attempt: 2,
            node_id: 3,
        };
        let json = serde_json::to_value(&ctx).unwrap();
        assert_eq!(json["taskId"], 7);
        assert_eq!(json["groupKey"], "g1");
    }
}
