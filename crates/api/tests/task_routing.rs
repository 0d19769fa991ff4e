//! Integration tests for the task router: STARTED tasks are pushed to a
//! RUNNING node, and node callbacks close the loop.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, post, post_json, put_json, run_cycle, TestApp};
use conduit_api::engine::task_router::TaskRouter;
use conduit_core::backoff::RetryPolicy;
use conduit_core::types::DbId;
use conduit_db::models::deployment::CreateDeployment;
use conduit_db::models::node::NodeTransition;
use conduit_db::models::status::{NodeStatus, TaskStatus};
use conduit_db::repositories::{NodeRepo, RetryBackoff, TaskRepo};
use serde_json::{json, Value};
use sqlx::PgPool;

fn router(app: &TestApp) -> TaskRouter {
    TaskRouter::new(
        app.state.pool.clone(),
        Arc::clone(&app.state.fleet),
        Arc::clone(&app.state.in_flight),
        RetryBackoff::immediate(),
    )
    .with_invoke_retry(RetryPolicy {
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        multiplier: 2.0,
        max_attempts: 2,
    })
}

/// Roll out a deployment and bring its node to RUNNING.
async fn running_node(app: &TestApp) -> DbId {
    let rollout = app
        .state
        .fleet
        .rollout(&CreateDeployment {
            commit_hash: "abc123".into(),
            image: "runner:abc123".into(),
        })
        .await
        .unwrap();
    let node_id = rollout.nodes[0].id;
    let changes = NodeTransition {
        url: Some("http://node-1".into()),
        provider_handle: Some("handle-1".into()),
        error: None,
    };
    let pool = &app.state.pool;
    NodeRepo::transition(pool, node_id, NodeStatus::Pending, NodeStatus::Starting, &changes)
        .await
        .unwrap()
        .unwrap();
    NodeRepo::transition(pool, node_id, NodeStatus::Starting, NodeStatus::Running, &changes)
        .await
        .unwrap()
        .unwrap();
    node_id
}

/// Enqueue a task through the API and start it with one scheduling cycle.
async fn started_task(app: &TestApp, body: Value) -> DbId {
    let response = post_json(app.router(), "/api/v1/tasks", body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let id = body_json(response).await["data"]["id"].as_i64().unwrap();
    run_cycle(&app.state.pool).await;
    id
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn started_task_is_invoked_on_running_node(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    let node_id = running_node(&app).await;
    let task_id = started_task(
        &app,
        json!({
            "name": "sync",
            "group_key": "acme",
            "payload": { "code": "sync()", "codeParams": { "since": 1 } },
        }),
    )
    .await;

    assert_eq!(router(&app).route_pending().await.unwrap(), 1);

    let invoked = app.runner.invoked.lock().unwrap().clone();
    assert_eq!(invoked.len(), 1);
    let (id, context, code, params) = &invoked[0];
    assert_eq!(*id, task_id);
    assert_eq!(context.node_id, node_id);
    assert_eq!(context.attempt, 1);
    assert_eq!(context.group_key, "acme");
    assert_eq!(code, "sync()");
    assert_eq!(params, &json!({ "since": 1 }));

    let task = TaskRepo::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.node_id, Some(node_id));
    assert!(app.state.in_flight.is_empty());

    let node = NodeRepo::find_by_id(&pool, node_id).await.unwrap().unwrap();
    assert!(node.last_dispatched_at.is_some());

    // Routed tasks are not routed twice.
    assert_eq!(router(&app).route_pending().await.unwrap(), 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn node_with_work_is_busy_until_output_arrives(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    let node_id = running_node(&app).await;
    let task_id = started_task(&app, json!({ "name": "sync", "group_key": "acme" })).await;
    router(&app).route_pending().await.unwrap();

    let response = post_json(app.router(), "/notifyWhenIdle", json!({ "nodeId": node_id })).await;
    assert_eq!(body_json(response).await["data"]["outcome"], "busy");

    let uri = format!("/api/v1/tasks/{task_id}/output");
    let response = put_json(app.router(), &uri, json!({ "state": "succeeded" })).await;
    assert_eq!(body_json(response).await["data"]["recorded"], true);

    let response = post_json(app.router(), "/notifyWhenIdle", json!({ "nodeId": node_id })).await;
    assert_eq!(body_json(response).await["data"]["outcome"], "idle_since");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn expired_routed_task_leaves_no_registry_entry(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    running_node(&app).await;
    let task_id = started_task(
        &app,
        json!({ "name": "sync", "group_key": "acme", "retry_max": 0 }),
    )
    .await;
    assert_eq!(router(&app).route_pending().await.unwrap(), 1);

    // The runner went silent: no heartbeat, no output.
    sqlx::query(
        "UPDATE tasks SET started_at = NOW() - INTERVAL '1 hour', last_heartbeat_at = NULL, \
         last_state_transition_at = NOW() - INTERVAL '1 hour' WHERE id = $1",
    )
    .bind(task_id)
    .execute(&pool)
    .await
    .unwrap();
    run_cycle(&pool).await;

    let task = TaskRepo::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status_id, TaskStatus::Expired.id());
    assert!(app.state.in_flight.is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn without_capacity_task_stays_queued(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    let task_id = started_task(&app, json!({ "name": "sync", "group_key": "acme" })).await;

    assert_eq!(router(&app).route_pending().await.unwrap(), 0);

    let task = TaskRepo::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status_id, TaskStatus::Started.id());
    assert_eq!(task.node_id, None);
    assert!(app.runner.invoked_ids().is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn refused_task_is_released_for_rerouting(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    running_node(&app).await;
    let task_id = started_task(&app, json!({ "name": "sync", "group_key": "acme" })).await;
    app.runner.refuse.store(true, Ordering::SeqCst);

    assert_eq!(router(&app).route_pending().await.unwrap(), 0);

    let task = TaskRepo::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status_id, TaskStatus::Started.id());
    assert_eq!(task.node_id, None);

    app.runner.refuse.store(false, Ordering::SeqCst);
    assert_eq!(router(&app).route_pending().await.unwrap(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn unreachable_runner_fails_the_task(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    running_node(&app).await;
    let task_id = started_task(
        &app,
        json!({ "name": "sync", "group_key": "acme", "retry_max": 0 }),
    )
    .await;
    app.runner.fail.store(true, Ordering::SeqCst);

    assert_eq!(router(&app).route_pending().await.unwrap(), 0);

    let task = TaskRepo::find_by_id(&pool, task_id).await.unwrap().unwrap();
    assert_eq!(task.status_id, TaskStatus::Failed.id());
    let error = task.output.unwrap()["error"].as_str().unwrap().to_string();
    assert!(error.starts_with("invoke failed"), "{error}");
    assert!(!app.state.in_flight.contains(task_id));
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn cancelling_a_routed_task_aborts_it_on_the_node(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    running_node(&app).await;
    let task_id = started_task(&app, json!({ "name": "sync", "group_key": "acme" })).await;
    router(&app).route_pending().await.unwrap();

    let response = post(app.router(), &format!("/api/v1/tasks/{task_id}/cancel")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["data"]["status_id"],
        TaskStatus::Cancelled.id()
    );
    assert!(!app.state.in_flight.contains(task_id));

    // The abort request is sent in the background.
    for _ in 0..50 {
        if !app.runner.cancelled.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(*app.runner.cancelled.lock().unwrap(), vec![task_id]);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn cancel_succeeds_when_node_lookup_fails(pool: PgPool) {
    let app = TestApp::new(pool.clone());
    running_node(&app).await;
    let task_id = started_task(&app, json!({ "name": "sync", "group_key": "acme" })).await;
    router(&app).route_pending().await.unwrap();

    // Break node reads only; the task row is untouched.
    sqlx::query("ALTER TABLE nodes RENAME COLUMN url TO url_moved")
        .execute(&pool)
        .await
        .unwrap();

    let response = post(app.router(), &format!("/api/v1/tasks/{task_id}/cancel")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["data"]["status_id"],
        TaskStatus::Cancelled.id()
    );
    assert!(app.runner.cancelled.lock().unwrap().is_empty());
}
