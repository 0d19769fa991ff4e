//! Integration tests for the `/api/v1/tasks` resource.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, post, post_json, put_json, run_cycle};
use conduit_db::models::status::TaskStatus;
use serde_json::{json, Value};
use sqlx::PgPool;

async fn enqueue(pool: &PgPool, body: Value) -> Value {
    let response = post_json(common::build_test_app(pool.clone()), "/api/v1/tasks", body).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    body_json(response).await["data"].clone()
}

async fn start_one(pool: &PgPool, body: Value) -> i64 {
    let task = enqueue(pool, body).await;
    run_cycle(pool).await;
    task["id"].as_i64().unwrap()
}

// ---------------------------------------------------------------------------
// Enqueue + dispatch
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn enqueue_returns_created_task_with_defaults(pool: PgPool) {
    let task = enqueue(&pool, json!({ "name": "sync", "group_key": "acme" })).await;

    assert_eq!(task["status_id"], TaskStatus::Created.id());
    assert_eq!(task["retry_count"], 0);
    assert_eq!(task["retry_max"], 3);
    assert_eq!(task["group_max_concurrency"], 0);
    assert_eq!(task["payload"], json!({}));
    assert!(task["node_id"].is_null());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn group_cap_limits_started_tasks(pool: PgPool) {
    for i in 0..5 {
        enqueue(
            &pool,
            json!({ "name": format!("job-{i}"), "group_key": "g1", "group_max_concurrency": 2 }),
        )
        .await;
    }

    run_cycle(&pool).await;

    let app = common::build_test_app(pool.clone());
    let json = body_json(get(app, "/api/v1/tasks?group_key=g1&status=started").await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 2);

    let app = common::build_test_app(pool);
    let json = body_json(get(app, "/api/v1/tasks?group_key=g1&status=created").await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 3);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn invalid_task_is_rejected(pool: PgPool) {
    let cases = [
        json!({ "name": "", "group_key": "acme" }),
        json!({ "name": "sync", "group_key": "acme", "group_max_concurrency": -1 }),
        json!({ "name": "sync", "group_key": "acme", "retry_max": 1000 }),
        json!({ "name": "sync", "group_key": "acme", "heartbeat_timeout_secs": 0 }),
    ];
    for body in cases {
        let response = post_json(common::build_test_app(pool.clone()), "/api/v1/tasks", body).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn search_rejects_unknown_status(pool: PgPool) {
    let app = common::build_test_app(pool);
    let response = get(app, "/api/v1/tasks?status=bogus").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn get_unknown_task_returns_404(pool: PgPool) {
    let app = common::build_test_app(pool);
    let response = get(app, "/api/v1/tasks/999999").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Cancel
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn cancel_is_idempotent_on_terminal_tasks(pool: PgPool) {
    let task = enqueue(&pool, json!({ "name": "sync", "group_key": "acme" })).await;
    let uri = format!("/api/v1/tasks/{}/cancel", task["id"]);

    let response = post(common::build_test_app(pool.clone()), &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let cancelled = body_json(response).await["data"].clone();
    assert_eq!(cancelled["status_id"], TaskStatus::Cancelled.id());

    let response = post(common::build_test_app(pool.clone()), &uri).await;
    assert_eq!(response.status(), StatusCode::OK);
    let again = body_json(response).await["data"].clone();
    assert_eq!(again["terminated_at"], cancelled["terminated_at"]);

    let response = post(common::build_test_app(pool), "/api/v1/tasks/999999/cancel").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Node callbacks
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../db/migrations")]
async fn heartbeat_requires_a_started_task(pool: PgPool) {
    let task = enqueue(
        &pool,
        json!({ "name": "sync", "group_key": "acme", "starting_at": "2999-01-01T00:00:00Z" }),
    )
    .await;
    let uri = format!("/api/v1/tasks/{}/heartbeat", task["id"]);
    let response = post(common::build_test_app(pool.clone()), &uri).await;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let id = start_one(&pool, json!({ "name": "run", "group_key": "acme" })).await;
    let uri = format!("/api/v1/tasks/{id}/heartbeat");
    let response = post(common::build_test_app(pool.clone()), &uri).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let json = body_json(get(common::build_test_app(pool), &format!("/api/v1/tasks/{id}")).await).await;
    assert!(json["data"]["last_heartbeat_at"].is_string());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn success_is_recorded_once(pool: PgPool) {
    let id = start_one(&pool, json!({ "name": "sync", "group_key": "acme" })).await;
    let uri = format!("/api/v1/tasks/{id}/output");
    let body = json!({ "state": "succeeded", "output": { "rows": 10 } });

    let json = body_json(put_json(common::build_test_app(pool.clone()), &uri, body.clone()).await).await;
    assert_eq!(json["data"]["recorded"], true);
    assert_eq!(json["data"]["task"]["status_id"], TaskStatus::Succeeded.id());
    assert_eq!(json["data"]["task"]["output"], json!({ "rows": 10 }));
    assert!(json["data"]["successor"].is_null());

    let late = json!({ "state": "failed", "output": { "error": "late" } });
    let response = put_json(common::build_test_app(pool), &uri, late).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["recorded"], false);
    assert_eq!(json["data"]["task"]["status_id"], TaskStatus::Succeeded.id());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn failure_with_retries_left_creates_successor(pool: PgPool) {
    let id = start_one(
        &pool,
        json!({ "name": "sync", "group_key": "acme", "retry_max": 1 }),
    )
    .await;
    let uri = format!("/api/v1/tasks/{id}/output");

    let body = json!({ "state": "failed", "output": { "error": "boom" } });
    let json = body_json(put_json(common::build_test_app(pool.clone()), &uri, body).await).await;

    let data = &json["data"];
    assert_eq!(data["task"]["status_id"], TaskStatus::Failed.id());
    assert_eq!(data["successor"]["status_id"], TaskStatus::Created.id());
    assert_eq!(data["successor"]["retry_count"], 1);
    assert_eq!(data["successor"]["retry_of_task_id"], id);
    assert_eq!(data["successor"]["name"], "sync");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn output_for_unknown_task_returns_404(pool: PgPool) {
    let body = json!({ "state": "succeeded" });
    let response = put_json(common::build_test_app(pool), "/api/v1/tasks/999999/output", body).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
