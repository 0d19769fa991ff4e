use std::time::Duration;

use assert_matches::assert_matches;
use chrono::{TimeDelta, Utc};
use conduit_db::models::schedule::{CreateSchedule, ScheduleSearch, UpdateSchedule};
use conduit_db::models::status::{ScheduleStatus, TaskStatus};
use conduit_db::models::task::TaskOutcome;
use conduit_db::repositories::{RetryBackoff, ReportOutcome, ScheduleChange, ScheduleRepo, TaskRepo};
use sqlx::PgPool;

fn new_schedule(name: &str) -> CreateSchedule {
    CreateSchedule {
        name: name.to_string(),
        group_key: format!("{name}-group"),
        group_max_concurrency: 1,
        frequency: "60s".to_string(),
        payload: serde_json::json!({ "sync": name }),
        retry_max: Some(0),
        heartbeat_timeout_secs: None,
        created_to_started_timeout_secs: None,
        started_to_completed_timeout_secs: None,
        allow_overlap: false,
        starts_at: None,
    }
}

const MINUTE: Duration = Duration::from_secs(60);

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_promotion_creates_task_and_advances(pool: PgPool) {
    let schedule = ScheduleRepo::create(&pool, &new_schedule("contacts"), MINUTE).await.unwrap();
    let t0 = Utc::now();

    let promoted = ScheduleRepo::promote_due(&pool, t0, 100, None).await.unwrap();
    assert_eq!(promoted.len(), 1);
    let p = &promoted[0];
    assert_eq!(p.task.schedule_id, Some(schedule.id));
    assert_eq!(p.task.group_key, schedule.group_key);
    assert_eq!(p.task.status_id, TaskStatus::Created.id());
    assert_eq!(p.schedule.last_scheduled_task_id, Some(p.task.id));
    assert!(p.schedule.next_execution_at > t0);
    assert!(p.schedule.next_execution_at <= t0 + TimeDelta::seconds(60));

    // Not due again until the cadence elapses.
    let none = ScheduleRepo::promote_due(&pool, t0, 100, None).await.unwrap();
    assert!(none.is_empty());
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_overlap_guard_holds_while_task_outstanding(pool: PgPool) {
    let schedule = ScheduleRepo::create(&pool, &new_schedule("contacts"), MINUTE).await.unwrap();
    let t0 = Utc::now();

    let promoted = ScheduleRepo::promote_due(&pool, t0, 100, None).await.unwrap();
    let task_id = promoted[0].task.id;
    let started = TaskRepo::dispatch_ready(&pool, t0 + TimeDelta::seconds(1), 10, None)
        .await
        .unwrap();
    assert_eq!(started.len(), 1);
    assert!(ScheduleRepo::has_outstanding_task(&pool, schedule.id).await.unwrap());

    // t = 61s: previous task still running, no second task.
    let t61 = t0 + TimeDelta::seconds(61);
    let none = ScheduleRepo::promote_due(&pool, t61, 100, None).await.unwrap();
    assert!(none.is_empty());

    TaskRepo::report_result(&pool, task_id, TaskOutcome::Succeeded, None, &RetryBackoff::default())
        .await
        .unwrap();

    let again = ScheduleRepo::promote_due(&pool, t61, 100, None).await.unwrap();
    assert_eq!(again.len(), 1);
    assert_ne!(again[0].task.id, task_id);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_allow_overlap_fires_regardless(pool: PgPool) {
    let mut input = new_schedule("webhooks");
    input.allow_overlap = true;
    ScheduleRepo::create(&pool, &input, MINUTE).await.unwrap();
    let t0 = Utc::now();

    ScheduleRepo::promote_due(&pool, t0, 100, None).await.unwrap();
    let second = ScheduleRepo::promote_due(&pool, t0 + TimeDelta::seconds(61), 100, None)
        .await
        .unwrap();
    assert_eq!(second.len(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_missed_slots_are_skipped(pool: PgPool) {
    let mut input = new_schedule("hourly");
    let t0 = Utc::now() - TimeDelta::hours(5);
    input.starts_at = Some(t0);
    ScheduleRepo::create(&pool, &input, Duration::from_secs(3600)).await.unwrap();

    let now = Utc::now();
    let promoted = ScheduleRepo::promote_due(&pool, now, 100, None).await.unwrap();
    assert_eq!(promoted.len(), 1, "one task, not one per missed slot");
    let next = promoted[0].schedule.next_execution_at;
    assert!(next > now);
    assert!(next <= now + TimeDelta::hours(1));
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_retry_successor_keeps_overlap_guard(pool: PgPool) {
    let mut input = new_schedule("flaky");
    input.retry_max = Some(1);
    let schedule = ScheduleRepo::create(&pool, &input, MINUTE).await.unwrap();
    let t0 = Utc::now();

    let promoted = ScheduleRepo::promote_due(&pool, t0, 100, None).await.unwrap();
    TaskRepo::dispatch_ready(&pool, t0 + TimeDelta::seconds(1), 10, None).await.unwrap();
    let outcome = TaskRepo::report_result(
        &pool,
        promoted[0].task.id,
        TaskOutcome::Failed,
        None,
        &RetryBackoff::default(),
    )
    .await
    .unwrap();
    let ReportOutcome::Recorded { successor: Some(successor), .. } = outcome else {
        panic!("expected a retry successor");
    };

    let schedule = ScheduleRepo::find_by_id(&pool, schedule.id).await.unwrap().unwrap();
    assert_eq!(schedule.last_scheduled_task_id, Some(successor.id));

    let none = ScheduleRepo::promote_due(&pool, t0 + TimeDelta::seconds(61), 100, None)
        .await
        .unwrap();
    assert!(none.is_empty(), "retry still outstanding");
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_pause_resume_delete(pool: PgPool) {
    let schedule = ScheduleRepo::create(&pool, &new_schedule("contacts"), MINUTE).await.unwrap();

    let paused = ScheduleRepo::pause(&pool, schedule.id).await.unwrap();
    assert_matches!(paused, ScheduleChange::Applied(s) if s.status_id == ScheduleStatus::Paused.id());
    assert_matches!(ScheduleRepo::pause(&pool, schedule.id).await.unwrap(), ScheduleChange::Rejected(_));

    let none = ScheduleRepo::promote_due(&pool, Utc::now(), 100, None).await.unwrap();
    assert!(none.is_empty(), "paused schedules do not fire");
    assert_matches!(ScheduleRepo::trigger(&pool, schedule.id).await.unwrap(), ScheduleChange::Rejected(_));

    let resumed = ScheduleRepo::resume(&pool, schedule.id).await.unwrap();
    assert_matches!(resumed, ScheduleChange::Applied(s) if s.status_id == ScheduleStatus::Started.id());

    let deleted = ScheduleRepo::delete(&pool, schedule.id).await.unwrap();
    assert_matches!(deleted, ScheduleChange::Applied(s) if s.deleted_at.is_some());
    assert!(ScheduleRepo::find_by_id(&pool, schedule.id).await.unwrap().is_none());
    assert_matches!(ScheduleRepo::resume(&pool, schedule.id).await.unwrap(), ScheduleChange::NotFound);

    // The name is free again once deleted.
    ScheduleRepo::create(&pool, &new_schedule("contacts"), MINUTE).await.unwrap();
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_trigger_makes_schedule_due(pool: PgPool) {
    let mut input = new_schedule("daily");
    input.starts_at = Some(Utc::now() + TimeDelta::hours(12));
    let schedule = ScheduleRepo::create(&pool, &input, Duration::from_secs(86_400)).await.unwrap();
    assert!(ScheduleRepo::promote_due(&pool, Utc::now(), 100, None).await.unwrap().is_empty());

    assert_matches!(ScheduleRepo::trigger(&pool, schedule.id).await.unwrap(), ScheduleChange::Applied(_));
    let promoted = ScheduleRepo::promote_due(&pool, Utc::now(), 100, None).await.unwrap();
    assert_eq!(promoted.len(), 1);
}

#[sqlx::test(migrations = "../../db/migrations")]
async fn test_update_and_search(pool: PgPool) {
    let a = ScheduleRepo::create(&pool, &new_schedule("a"), MINUTE).await.unwrap();
    ScheduleRepo::create(&pool, &new_schedule("b"), MINUTE).await.unwrap();

    let updated = ScheduleRepo::update(
        &pool,
        a.id,
        &UpdateSchedule {
            payload: Some(serde_json::json!({ "v": 2 })),
            ..Default::default()
        },
        Some(Duration::from_secs(120)),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(updated.frequency_ms, 120_000);
    assert_eq!(updated.payload, serde_json::json!({ "v": 2 }));
    assert_eq!(
        updated.next_execution_at - a.next_execution_at,
        TimeDelta::seconds(60)
    );

    let found = ScheduleRepo::search(
        &pool,
        &ScheduleSearch {
            names: Some(vec!["b".into()]),
            ..Default::default()
        },
    )
    .await
    .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "b");
}
