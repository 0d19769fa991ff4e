//! Runs each node as a child process on the local host.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use super::{http_client, check_runner, Health, NodeConfig, NodeHandle, NodeProvider, ProviderError};

/// Local-process provider for development.
///
/// The runner listens on `base_port + node_id % 1000`, so node rows map
/// to stable ports across restarts of the orchestrator.
pub struct LocalProvider {
    command: String,
    base_port: u16,
    client: reqwest::Client,
    children: Mutex<HashMap<String, Child>>,
}

impl LocalProvider {
    pub fn new(command: String, base_port: u16, request_timeout: Duration) -> Self {
        Self {
            command,
            base_port,
            client: http_client(request_timeout),
            children: Mutex::new(HashMap::new()),
        }
    }

    fn port_for(&self, config: &NodeConfig) -> u16 {
        self.base_port
            .saturating_add((config.node_id.rem_euclid(1000)) as u16)
    }
}

#[async_trait]
impl NodeProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn create(&self, config: &NodeConfig) -> Result<NodeHandle, ProviderError> {
        let port = self.port_for(config);
        let child = Command::new(&self.command)
            .env("PORT", port.to_string())
            .env("NODE_ID", config.node_id.to_string())
            .env("FLEET_ID", &config.fleet_id)
            .env("IDLE_TIMEOUT_SECS", config.idle_timeout_secs.to_string())
            .env("RUNNER_IMAGE", &config.image)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let id = child
            .id()
            .map(|pid| format!("pid-{pid}"))
            .unwrap_or_else(|| config.instance_name());
        tracing::info!(node_id = config.node_id, handle = %id, port, "Spawned local runner");

        self.children.lock().await.insert(id.clone(), child);
        Ok(NodeHandle {
            id,
            url: format!("http://127.0.0.1:{port}"),
        })
    }

    async fn destroy(&self, handle: &NodeHandle) -> Result<(), ProviderError> {
        let child = self.children.lock().await.remove(&handle.id);
        match child {
            Some(mut child) => {
                child.kill().await?;
                tracing::info!(handle = %handle.id, "Stopped local runner");
            }
            None => {
                tracing::debug!(handle = %handle.id, "Local runner already gone");
            }
        }
        Ok(())
    }

    async fn health_check(&self, handle: &NodeHandle) -> Health {
        {
            let mut children = self.children.lock().await;
            match children.get_mut(&handle.id) {
                None => return Health::Unhealthy("process not tracked".into()),
                Some(child) => {
                    if let Ok(Some(status)) = child.try_wait() {
                        return Health::Unhealthy(format!("process exited: {status}"));
                    }
                }
            }
        }
        check_runner(&self.client, &handle.url).await
    }
}
