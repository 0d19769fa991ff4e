//! Pluggable infrastructure backends that create and destroy nodes.
//!
//! One implementation is selected at startup from [`ProviderKind`]; the
//! supervisor only ever talks to the [`NodeProvider`] trait object.

pub mod local;
pub mod platform;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::types::DbId;

use crate::config::{FleetConfig, ProviderKind};

pub use local::LocalProvider;
pub use platform::PlatformProvider;

/// Everything a provider needs to start one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub node_id: DbId,
    pub fleet_id: String,
    pub image: String,
    pub cpu_milli: i32,
    pub memory_mb: i32,
    pub storage_mb: i32,
    pub idle_timeout_secs: i32,
}

impl NodeConfig {
    /// Stable instance name used by providers that need one.
    pub fn instance_name(&self) -> String {
        format!("conduit-runner-{}-{}", self.fleet_id, self.node_id)
    }
}

/// Provider-side identity of a created instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeHandle {
    /// Opaque provider id (process id, service id, ...).
    pub id: String,
    /// Base URL of the runner listening on the instance.
    pub url: String,
}

/// Result of a provider health check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Health {
    Healthy,
    Unhealthy(String),
}

/// Error type for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Provider returned HTTP {0}")]
    HttpStatus(u16),

    #[error("Failed to spawn runner process: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),
}

/// Creates, destroys and health-checks execution nodes.
///
/// `create` and `destroy` are not retried by callers beyond the
/// supervisor's bounded provisioning attempts; `destroy` must tolerate an
/// instance that is already gone.
#[async_trait]
pub trait NodeProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, config: &NodeConfig) -> Result<NodeHandle, ProviderError>;

    async fn destroy(&self, handle: &NodeHandle) -> Result<(), ProviderError>;

    async fn health_check(&self, handle: &NodeHandle) -> Health;
}

/// Build the provider selected by configuration.
pub fn build_provider(config: &FleetConfig) -> Arc<dyn NodeProvider> {
    let timeout = config.runner_request_timeout;
    match &config.provider {
        ProviderKind::Local { command, base_port } => {
            Arc::new(LocalProvider::new(command.clone(), *base_port, timeout))
        }
        ProviderKind::Platform { api_url, api_token } => {
            Arc::new(PlatformProvider::new(api_url.clone(), api_token.clone(), timeout))
        }
    }
}

/// GET `{url}/health` and map any 2xx to [`Health::Healthy`].
pub(crate) async fn check_runner(client: &reqwest::Client, url: &str) -> Health {
    match client.get(format!("{url}/health")).send().await {
        Ok(resp) if resp.status().is_success() => Health::Healthy,
        Ok(resp) => Health::Unhealthy(format!("health endpoint returned {}", resp.status())),
        Err(e) => Health::Unhealthy(e.to_string()),
    }
}

pub(crate) fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}
