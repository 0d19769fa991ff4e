#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request};
use axum::response::Response;
use axum::Router;
use conduit_core::types::DbId;
use conduit_fleet::error::FleetError;
use conduit_fleet::runner::{ExecutionContext, RunnerClient, RunnerRegistry};
use conduit_fleet::{FleetConfig, FleetManager};
use conduit_scheduler::{LeaderElector, Scheduler, SchedulerConfig, TaskDefaults};
use http_body_util::BodyExt;
use sqlx::PgPool;
use tower::ServiceExt;

use conduit_api::config::ServerConfig;
use conduit_api::engine::in_flight::InFlightRegistry;
use conduit_api::router::build_app_router;
use conduit_api::state::AppState;

/// Build a test `ServerConfig` with safe defaults.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        request_timeout_secs: 30,
        shutdown_timeout_secs: 5,
    }
}

/// Runner double that records what the orchestrator asked of it.
#[derive(Default)]
pub struct FakeRunner {
    pub refuse: AtomicBool,
    pub fail: AtomicBool,
    pub invoked: Mutex<Vec<(DbId, ExecutionContext, String, serde_json::Value)>>,
    pub cancelled: Mutex<Vec<DbId>>,
}

impl FakeRunner {
    pub fn invoked_ids(&self) -> Vec<DbId> {
        self.invoked.lock().unwrap().iter().map(|(id, ..)| *id).collect()
    }
}

#[async_trait]
impl RunnerClient for FakeRunner {
    async fn invoke(
        &self,
        task_id: DbId,
        context: &ExecutionContext,
        code: &str,
        code_params: &serde_json::Value,
    ) -> Result<bool, FleetError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(FleetError::Runner("connection refused".into()));
        }
        self.invoked.lock().unwrap().push((
            task_id,
            context.clone(),
            code.to_string(),
            code_params.clone(),
        ));
        Ok(!self.refuse.load(Ordering::SeqCst))
    }

    async fn cancel(&self, task_id: DbId, _: &ExecutionContext) -> Result<bool, FleetError> {
        self.cancelled.lock().unwrap().push(task_id);
        Ok(true)
    }

    async fn notify_when_idle(&self, _: DbId) -> Result<(), FleetError> {
        Ok(())
    }
}

/// Application state wired to a [`FakeRunner`].
pub struct TestApp {
    pub state: AppState,
    pub runner: Arc<FakeRunner>,
}

impl TestApp {
    pub fn new(pool: PgPool) -> Self {
        let runner = Arc::new(FakeRunner::default());
        let shared = Arc::clone(&runner);
        let runners = Arc::new(RunnerRegistry::new(Arc::new(move |_url: &str| {
            Arc::clone(&shared) as Arc<dyn RunnerClient>
        })));

        let fleet = Arc::new(FleetManager::new(
            pool.clone(),
            FleetConfig::default(),
            runners,
        ));
        let state = AppState {
            pool,
            config: Arc::new(test_config()),
            task_defaults: Arc::new(TaskDefaults::default()),
            fleet,
            in_flight: Arc::new(InFlightRegistry::new()),
        };
        Self { state, runner }
    }

    /// The full router, with the same middleware stack as production.
    pub fn router(&self) -> Router {
        build_app_router(self.state.clone(), &test_config())
    }
}

/// Build the full application router using the given database pool.
pub fn build_test_app(pool: PgPool) -> Router {
    TestApp::new(pool).router()
}

/// Run one scheduling cycle. Every call uses the same holder, so later
/// calls renew the lease instead of waiting for it to expire.
pub async fn run_cycle(pool: &PgPool) {
    let config = SchedulerConfig::default();
    let elector = LeaderElector::with_holder(
        pool.clone(),
        config.lease_key.clone(),
        "api-tests",
        config.lease_ttl,
    );
    let mut scheduler = Scheduler::with_elector(pool.clone(), config, elector);
    assert!(scheduler.tick().await.is_some(), "scheduler should lead");
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response {
    send(app, Method::GET, uri, None).await
}

pub async fn delete(app: Router, uri: &str) -> Response {
    send(app, Method::DELETE, uri, None).await
}

pub async fn post(app: Router, uri: &str) -> Response {
    send(app, Method::POST, uri, None).await
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    send(app, Method::POST, uri, Some(body)).await
}

pub async fn put_json(app: Router, uri: &str, body: serde_json::Value) -> Response {
    send(app, Method::PUT, uri, Some(body)).await
}

async fn send(app: Router, method: Method, uri: &str, body: Option<serde_json::Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&json).unwrap())),
        None => builder.body(Body::empty()),
    }
    .unwrap();
    app.oneshot(request).await.unwrap()
}

/// Collect a response body and parse it as JSON.
pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}
