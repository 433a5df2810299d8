//! Integration tests for the `worker_heartbeats` table.

use chrono::Utc;

use taskrelay_db::queries::heartbeats as db;
use taskrelay_test_utils::{create_test_db, drop_test_db};

#[tokio::test]
async fn upsert_then_touch_bumps_version() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    let registered = db::upsert_heartbeat(&pool, "worker-a", now, None).await.unwrap();
    assert_eq!(registered.version, 0);

    let touched_rows = db::touch_heartbeat(&pool, "worker-a", now + chrono::Duration::seconds(1)).await.unwrap();
    assert_eq!(touched_rows, 1);

    let [refreshed] = db::find_active_workers(&pool, now).await.unwrap().try_into().unwrap_or_else(|v: Vec<_>| {
        panic!("expected exactly one active worker, found {}", v.len())
    });
    assert_eq!(refreshed.version, 1);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn touch_heartbeat_on_missing_worker_returns_zero_rows() {
    let (pool, db_name) = create_test_db().await;

    let touched = db::touch_heartbeat(&pool, "never-registered", Utc::now()).await.unwrap();
    assert_eq!(touched, 0);

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn find_stale_workers_excludes_fresh_ones() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    db::upsert_heartbeat(&pool, "stale", now - chrono::Duration::minutes(5), None).await.unwrap();
    db::upsert_heartbeat(&pool, "fresh", now, None).await.unwrap();

    let cutoff = now - chrono::Duration::minutes(1);
    let stale = db::find_stale_workers(&pool, cutoff).await.unwrap();
    let stale_ids: Vec<_> = stale.iter().map(|w| w.worker_id.clone()).collect();

    assert!(stale_ids.contains(&"stale".to_string()));
    assert!(!stale_ids.contains(&"fresh".to_string()));

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cleanup_stale_heartbeats_removes_only_old_rows() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    db::upsert_heartbeat(&pool, "ancient", now - chrono::Duration::days(2), None).await.unwrap();
    db::upsert_heartbeat(&pool, "recent", now, None).await.unwrap();

    let removed = db::cleanup_stale_heartbeats(&pool, now - chrono::Duration::days(1)).await.unwrap();
    assert_eq!(removed, 1);

    let remaining = db::find_active_workers(&pool, now - chrono::Duration::days(3)).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].worker_id, "recent");

    pool.close().await;
    drop_test_db(&db_name).await;
}

#[tokio::test]
async fn delete_all_heartbeats_clears_table() {
    let (pool, db_name) = create_test_db().await;
    let now = Utc::now();

    db::upsert_heartbeat(&pool, "a", now, None).await.unwrap();
    db::upsert_heartbeat(&pool, "b", now, None).await.unwrap();

    let removed = db::delete_all_heartbeats(&pool).await.unwrap();
    assert_eq!(removed, 2);

    let remaining = db::find_active_workers(&pool, now - chrono::Duration::days(1)).await.unwrap();
    assert!(remaining.is_empty());

    pool.close().await;
    drop_test_db(&db_name).await;
}
