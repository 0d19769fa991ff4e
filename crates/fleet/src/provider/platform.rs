//! Managed-compute platform provider driven over a REST API.
//!
//! - `POST   {api}/services`      create a service from an image
//! - `GET    {api}/services/{id}` read its status
//! - `DELETE {api}/services/{id}` tear it down (404 counts as done)

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{http_client, check_runner, Health, NodeConfig, NodeHandle, NodeProvider, ProviderError};

#[derive(Debug, Serialize)]
struct CreateServiceRequest<'a> {
    name: String,
    image: &'a str,
    cpu_milli: i32,
    memory_mb: i32,
    storage_mb: i32,
    env: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct ServiceResponse {
    id: String,
    url: Option<String>,
    status: Option<String>,
}

pub struct PlatformProvider {
    api_url: String,
    api_token: String,
    client: reqwest::Client,
}

impl PlatformProvider {
    pub fn new(api_url: String, api_token: String, request_timeout: Duration) -> Self {
        Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_token,
            client: http_client(request_timeout),
        }
    }

    async fn service(&self, id: &str) -> Result<ServiceResponse, ProviderError> {
        let resp = self
            .client
            .get(format!("{}/services/{id}", self.api_url))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ProviderError::HttpStatus(resp.status().as_u16()));
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl NodeProvider for PlatformProvider {
    fn name(&self) -> &'static str {
        "platform"
    }

    async fn create(&self, config: &NodeConfig) -> Result<NodeHandle, ProviderError> {
        let body = CreateServiceRequest {
            name: config.instance_name(),
            image: &config.image,
            cpu_milli: config.cpu_milli,
            memory_mb: config.memory_mb,
            storage_mb: config.storage_mb,
            env: serde_json::json!({
                "NODE_ID": config.node_id.to_string(),
                "FLEET_ID": config.fleet_id,
                "IDLE_TIMEOUT_SECS": config.idle_timeout_secs.to_string(),
            }),
        };

        let resp = self
            .client
            .post(format!("{}/services", self.api_url))
            .bearer_auth(&self.api_token)
            .json(&body)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ProviderError::HttpStatus(resp.status().as_u16()));
        }

        let service: ServiceResponse = resp.json().await?;
        let url = service.url.ok_or_else(|| {
            ProviderError::InvalidResponse(format!("service {} has no url", service.id))
        })?;
        tracing::info!(node_id = config.node_id, service_id = %service.id, "Platform service created");

        Ok(NodeHandle {
            id: service.id,
            url: url.trim_end_matches('/').to_string(),
        })
    }

    async fn destroy(&self, handle: &NodeHandle) -> Result<(), ProviderError> {
        let resp = self
            .client
            .delete(format!("{}/services/{}", self.api_url, handle.id))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(ProviderError::HttpStatus(status.as_u16()))
    }

    async fn health_check(&self, handle: &NodeHandle) -> Health {
        match self.service(&handle.id).await {
            Ok(service) => match service.status.as_deref() {
                Some("live") | Some("running") | None => {
                    check_runner(&self.client, &handle.url).await
                }
                Some(other) => Health::Unhealthy(format!("service status {other}")),
            },
            Err(e) => Health::Unhealthy(e.to_string()),
        }
    }
}
