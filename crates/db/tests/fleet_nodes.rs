use chrono::{TimeDelta, Utc};
use conduit_db::models::deployment::CreateDeployment;
use conduit_db::models::node::{CreateNode, NodeSearch, NodeTransition};
use conduit_db::models::node_config_override::UpsertNodeConfigOverride;
use conduit_db::models::status::NodeStatus;
use conduit_db::repositories::{DeploymentRepo, NodeConfigOverrideRepo, NodeRepo};
use sqlx::PgPool;

const FLEET: &str = "default";

fn deployment(commit: &str) -> CreateDeployment {
    CreateDeployment {
        commit_hash: commit.to_string(),
        image: format!("runner:{commit}"),
    }
}

fn node(deployment_id: i64) -> CreateNode {
    CreateNode {
        fleet_id: FLEET.to_string(),
        deployment_id,
        image: "runner:abc".to_string(),
        cpu_milli: 500,
        memory_mb: 512,
        storage_mb: 1024,
        idle_timeout_secs: 300,
    }
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_activation_supersedes_previous(pool: PgPool) {
    let first = DeploymentRepo::activate(&pool, FLEET, &deployment("d1")).await.unwrap();
    assert!(first.superseded.is_none());
    assert!(first.deployment.is_active());

    let second = DeploymentRepo::activate(&pool, FLEET, &deployment("d2")).await.unwrap();
    let superseded = second.superseded.unwrap();
    assert_eq!(superseded.id, first.deployment.id);
    assert!(superseded.superseded_at.is_some());

    let active = DeploymentRepo::find_active(&pool, FLEET).await.unwrap().unwrap();
    assert_eq!(active.id, second.deployment.id);

    let (count,): (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM deployments WHERE fleet_id = $1 AND superseded_at IS NULL",
    )
    .bind(FLEET)
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(count, 1);

    let history = DeploymentRepo::list(&pool, FLEET, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second.deployment.id);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_node_lifecycle_transitions(pool: PgPool) {
    let d = DeploymentRepo::activate(&pool, FLEET, &deployment("d1")).await.unwrap();
    let n = NodeRepo::create(&pool, &node(d.deployment.id)).await.unwrap();
    assert_eq!(n.status_id, NodeStatus::Pending.id());

    let starting = NodeRepo::transition(
        &pool,
        n.id,
        NodeStatus::Pending,
        NodeStatus::Starting,
        &NodeTransition {
            url: Some("http://127.0.0.1:3100".into()),
            provider_handle: Some("pid-42".into()),
            error: None,
        },
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(starting.url.as_deref(), Some("http://127.0.0.1:3100"));
    assert_eq!(starting.provider_handle.as_deref(), Some("pid-42"));

    // Stale expectation: the node is no longer PENDING.
    let stale = NodeRepo::transition(
        &pool,
        n.id,
        NodeStatus::Pending,
        NodeStatus::Starting,
        &NodeTransition::default(),
    )
    .await
    .unwrap();
    assert!(stale.is_none());

    // Not a lifecycle edge.
    let skipped = NodeRepo::transition(
        &pool,
        n.id,
        NodeStatus::Starting,
        NodeStatus::Terminated,
        &NodeTransition::default(),
    )
    .await
    .unwrap();
    assert!(skipped.is_none());

    let running = NodeRepo::transition(
        &pool,
        n.id,
        NodeStatus::Starting,
        NodeStatus::Running,
        &NodeTransition::default(),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(running.url.as_deref(), Some("http://127.0.0.1:3100"), "url is kept");

    let loads = NodeRepo::running_loads(&pool, FLEET).await.unwrap();
    assert_eq!(loads.len(), 1);
    assert_eq!(loads[0].node_id, n.id);
    assert_eq!(loads[0].active_tasks, 0);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_idle_stamp_and_dispatch_reset(pool: PgPool) {
    let d = DeploymentRepo::activate(&pool, FLEET, &deployment("d1")).await.unwrap();
    let n = NodeRepo::create(&pool, &node(d.deployment.id)).await.unwrap();
    assert!(!NodeRepo::mark_idle_since(&pool, n.id).await.unwrap(), "only RUNNING nodes idle");

    for (from, to) in [
        (NodeStatus::Pending, NodeStatus::Starting),
        (NodeStatus::Starting, NodeStatus::Running),
    ] {
        NodeRepo::transition(&pool, n.id, from, to, &NodeTransition::default())
            .await
            .unwrap()
            .unwrap();
    }

    assert!(NodeRepo::mark_idle_since(&pool, n.id).await.unwrap());
    let first = NodeRepo::find_by_id(&pool, n.id).await.unwrap().unwrap().idle_since;
    assert!(first.is_some());
    NodeRepo::mark_idle_since(&pool, n.id).await.unwrap();
    let second = NodeRepo::find_by_id(&pool, n.id).await.unwrap().unwrap().idle_since;
    assert_eq!(first, second, "existing idle stamp is kept");

    NodeRepo::record_dispatch(&pool, n.id).await.unwrap();
    let after = NodeRepo::find_by_id(&pool, n.id).await.unwrap().unwrap();
    assert!(after.idle_since.is_none());
    assert!(after.last_dispatched_at.is_some());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_remove_terminated_respects_retention(pool: PgPool) {
    let d = DeploymentRepo::activate(&pool, FLEET, &deployment("d1")).await.unwrap();
    let n = NodeRepo::create(&pool, &node(d.deployment.id)).await.unwrap();
    NodeRepo::transition(&pool, n.id, NodeStatus::Pending, NodeStatus::Error, &NodeTransition {
        error: Some("provision failed".into()),
        ..Default::default()
    })
    .await
    .unwrap()
    .unwrap();
    NodeRepo::transition(
        &pool,
        n.id,
        NodeStatus::Error,
        NodeStatus::Terminated,
        &NodeTransition::default(),
    )
    .await
    .unwrap()
    .unwrap();

    let kept = NodeRepo::remove_terminated(&pool, FLEET, Utc::now() - TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(kept, 0);
    let removed = NodeRepo::remove_terminated(&pool, FLEET, Utc::now() + TimeDelta::seconds(1))
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let left = NodeRepo::search(&pool, FLEET, &NodeSearch::default()).await.unwrap();
    assert!(left.is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_config_override_upsert(pool: PgPool) {
    assert!(NodeConfigOverrideRepo::find(&pool, FLEET).await.unwrap().is_none());

    let first = NodeConfigOverrideRepo::upsert(
        &pool,
        FLEET,
        &UpsertNodeConfigOverride {
            cpu_milli: Some(1000),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(first.cpu_milli, Some(1000));

    let second = NodeConfigOverrideRepo::upsert(
        &pool,
        FLEET,
        &UpsertNodeConfigOverride {
            memory_mb: Some(2048),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(second.id, first.id);
    assert_eq!(second.cpu_milli, None);
    assert_eq!(second.memory_mb, Some(2048));

    assert!(NodeConfigOverrideRepo::delete(&pool, FLEET).await.unwrap());
    assert!(!NodeConfigOverrideRepo::delete(&pool, FLEET).await.unwrap());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_config_override_rejects_non_positive_idle_timeout(pool: PgPool) {
    let err = NodeConfigOverrideRepo::upsert(
        &pool,
        FLEET,
        &UpsertNodeConfigOverride {
            idle_timeout_secs: Some(0),
            ..Default::default()
        },
    )
    .await
    .unwrap_err();
    let constraint = err.as_database_error().and_then(|e| e.constraint());
    assert_eq!(constraint, Some("ck_node_config_overrides_idle_timeout"));
    assert!(NodeConfigOverrideRepo::find(&pool, FLEET).await.unwrap().is_none());
}
