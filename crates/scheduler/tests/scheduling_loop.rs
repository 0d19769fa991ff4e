use std::time::Duration;

use assert_matches::assert_matches;
use conduit_db::models::schedule::CreateSchedule;
use conduit_db::models::status::TaskStatus;
use conduit_db::models::task::{CreateTask, TaskOutcome, TaskSearch};
use conduit_db::repositories::{LeaderLockRepo, RetryBackoff, ScheduleRepo, TaskRepo};
use conduit_scheduler::{
    CycleReport, LeaderElector, LeaderState, Scheduler, SchedulerConfig, SchedulerError,
};
use sqlx::PgPool;

fn config() -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: Duration::from_millis(50),
        ..SchedulerConfig::default()
    }
}

fn scheduler(pool: &PgPool, holder: &str) -> Scheduler {
    let config = config();
    let elector =
        LeaderElector::with_holder(pool.clone(), config.lease_key.clone(), holder, config.lease_ttl);
    Scheduler::with_elector(pool.clone(), config, elector)
}

fn task(name: &str, group: &str, cap: i32) -> CreateTask {
    CreateTask {
        name: name.to_string(),
        group_key: group.to_string(),
        group_max_concurrency: cap,
        payload: serde_json::json!({}),
        starting_at: None,
        retry_max: Some(0),
        heartbeat_timeout_secs: None,
        created_to_started_timeout_secs: None,
        started_to_completed_timeout_secs: None,
        schedule_id: None,
    }
}

async fn count_in(pool: &PgPool, status: TaskStatus) -> usize {
    TaskRepo::search(
        pool,
        &TaskSearch {
            status_ids: Some(vec![status.id()]),
            ..Default::default()
        },
    )
    .await
    .unwrap()
    .len()
}

async fn expire_lease(pool: &PgPool) {
    sqlx::query("UPDATE leader_locks SET expires_at = NOW() - INTERVAL '1 second'")
        .execute(pool)
        .await
        .unwrap();
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_only_one_instance_runs_the_cycle(pool: PgPool) {
    let mut a = scheduler(&pool, "a");
    let mut b = scheduler(&pool, "b");

    assert!(a.tick().await.is_some());
    assert!(b.tick().await.is_none());
    assert_eq!(a.elector().state(), LeaderState::Leader);
    assert_eq!(b.elector().state(), LeaderState::Candidate);

    // Renewal keeps the same leader.
    assert!(a.tick().await.is_some());
    assert!(b.tick().await.is_none());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_new_leader_after_crash_and_old_one_is_fenced(pool: PgPool) {
    let mut a = scheduler(&pool, "a");
    let mut b = scheduler(&pool, "b");
    a.tick().await.unwrap();

    // `a` stops renewing; its lease lapses and `b` takes over.
    expire_lease(&pool).await;
    assert!(b.tick().await.is_some());

    // `a` still believes it leads, but its fenced writes are rejected.
    assert!(a.elector().is_leader());
    assert_matches!(a.cycle().await, Err(SchedulerError::LeadershipLost(key)) if key == "scheduler");

    // Its next tick fails to renew and demotes it.
    assert!(a.tick().await.is_none());
    assert_eq!(a.elector().state(), LeaderState::Candidate);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_group_cap_across_cycles(pool: PgPool) {
    for i in 0..5 {
        TaskRepo::create(&pool, &task(&format!("t{i}"), "g1", 2)).await.unwrap();
    }
    let mut s = scheduler(&pool, "a");

    let report = s.tick().await.unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(count_in(&pool, TaskStatus::Started).await, 2);
    assert_eq!(count_in(&pool, TaskStatus::Created).await, 3);

    // Nothing more starts while both slots are taken.
    assert_eq!(s.tick().await.unwrap().dispatched, 0);

    let started = TaskRepo::search(
        &pool,
        &TaskSearch {
            status_ids: Some(vec![TaskStatus::Started.id()]),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    TaskRepo::report_result(
        &pool,
        started[0].id,
        TaskOutcome::Succeeded,
        None,
        &RetryBackoff::immediate(),
    )
    .await
    .unwrap();

    assert_eq!(s.tick().await.unwrap().dispatched, 1);
    assert_eq!(count_in(&pool, TaskStatus::Started).await, 2);
    assert_eq!(count_in(&pool, TaskStatus::Created).await, 2);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_schedule_promoted_and_started_in_one_cycle(pool: PgPool) {
    let input = CreateSchedule {
        name: "contacts".into(),
        group_key: "contacts".into(),
        group_max_concurrency: 1,
        frequency: "60s".into(),
        payload: serde_json::json!({ "code": "sync()" }),
        retry_max: Some(1),
        heartbeat_timeout_secs: None,
        created_to_started_timeout_secs: None,
        started_to_completed_timeout_secs: None,
        allow_overlap: false,
        starts_at: None,
    };
    let schedule = ScheduleRepo::create(&pool, &input, Duration::from_secs(60)).await.unwrap();
    let mut s = scheduler(&pool, "a");

    let report = s.tick().await.unwrap();
    assert_eq!(
        report,
        CycleReport {
            promoted: 1,
            dispatched: 1,
            expired: 0
        }
    );

    let second = s.tick().await.unwrap();
    assert_eq!(second.promoted, 0);

    let schedule = ScheduleRepo::find_by_id(&pool, schedule.id).await.unwrap().unwrap();
    let task = TaskRepo::find_by_id(&pool, schedule.last_scheduled_task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status_id, TaskStatus::Started.id());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_stale_task_expires_and_frees_slot(pool: PgPool) {
    let first = TaskRepo::create(&pool, &task("first", "g", 1)).await.unwrap();
    TaskRepo::create(&pool, &task("second", "g", 1)).await.unwrap();
    let mut s = scheduler(&pool, "a");
    assert_eq!(s.tick().await.unwrap().dispatched, 1);

    sqlx::query("UPDATE tasks SET last_heartbeat_at = NOW() - INTERVAL '10 minutes' WHERE id = $1")
        .bind(first.id)
        .execute(&pool)
        .await
        .unwrap();

    let report = s.tick().await.unwrap();
    assert_eq!(report.expired, 1);
    let first = TaskRepo::find_by_id(&pool, first.id).await.unwrap().unwrap();
    assert_eq!(first.status_id, TaskStatus::Expired.id());

    // The freed slot is taken on the following cycle.
    assert_eq!(s.tick().await.unwrap().dispatched, 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_run_releases_lease_on_shutdown(pool: PgPool) {
    let s = scheduler(&pool, "a");
    let cancel = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(s.run(cancel.clone()));

    let mut held = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(25)).await;
        if LeaderLockRepo::find(&pool, "scheduler").await.unwrap().is_some() {
            held = true;
            break;
        }
    }
    assert!(held, "scheduler never acquired the lease");

    cancel.cancel();
    handle.await.unwrap();
    assert!(LeaderLockRepo::find(&pool, "scheduler").await.unwrap().is_none());
}
