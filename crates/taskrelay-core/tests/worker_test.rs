//! Integration tests for the worker loop's registration and shutdown
//! behavior, and its end-to-end handling of an owned task.

use chrono::Utc;

use taskrelay_core::executor::ExecutorRegistry;
use taskrelay_core::retry::RetryConfig;
use taskrelay_core::worker::{self, WorkerConfig};
use taskrelay_db::models::{TaskStatus, TaskType};
use taskrelay_db::queries::{heartbeats as heartbeats_db, tasks as tasks_db};
use taskrelay_test_utils::{create_test_db, drop_test_db};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn run_registers_a_heartbeat_and_shuts_down_on_cancel() {
    let (pool, db_name) = create_test_db().await;

    let registry = ExecutorRegistry::new();
    let config = WorkerConfig {
        heartbeat_interval_ms: 20,
        processing_interval_ms: 20,
    };
    let retry_config = RetryConfig::default();
    let cancel = CancellationToken::new();

    let worker_pool = pool.clone();
    let worker_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        worker::run(&worker_pool, &registry, &config, &retry_config, worker_cancel).await
    });

    // Give the loop a couple of ticks to register and touch its heartbeat.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let active = heartbeats_db::find_active_workers(&pool, Utc::now() - chrono::Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(active.len(), 1, "worker should have registered exactly one heartbeat row");

    cancel.cancel();
    handle.await.unwrap().unwrap();

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn worker_processes_its_own_claimed_tasks_to_completion() {
    let (pool, db_name) = create_test_db().await;

    let task = tasks_db::insert_task(
        &pool,
        TaskType::Dummy,
        &serde_json::json!({"log_message": "done"}),
        Utc::now(),
        3,
    )
    .await
    .unwrap();

    // Claim the task the way the scheduler would, under a fixed worker id so
    // the test can target the same worker's processing loop.
    let worker_id = "test-worker-fixed";
    tasks_db::claim(&pool, task.id, TaskStatus::Pending, TaskStatus::Running, worker_id, Utc::now())
        .await
        .unwrap();
    heartbeats_db::upsert_heartbeat(&pool, worker_id, Utc::now(), None).await.unwrap();

    let registry = taskrelay_core::default_executor_registry();
    let owned = tasks_db::find_by_worker_and_status(&pool, worker_id, TaskStatus::Running).await.unwrap();
    assert_eq!(owned.len(), 1);

    let outcome = taskrelay_core::coordinator::run(&pool, &registry, &owned[0], worker_id, Utc::now())
        .await
        .unwrap();
    assert_eq!(outcome, taskrelay_core::coordinator::CoordinatorOutcome::Success);

    let finished = tasks_db::get_task(&pool, task.id).await.unwrap().unwrap();
    assert_eq!(finished.status, TaskStatus::Success);
    assert_eq!(finished.execution_output.as_deref(), Some("done"));

    pool.close().await;
    drop_test_db(&db_name).await;
}
