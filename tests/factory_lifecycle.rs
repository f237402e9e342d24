//! End-to-end lifecycle tests for the factory: handle sharing, grace-period
//! eviction, delete routing and teardown.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use originstore::callbacks::{CollectedCallbacks, CollectedConnection, DataLoss, SuccessValue};
use originstore::storage::MockBackend;
use originstore::Factory;

const ORIGIN: &str = "http://a.example";
const DIR: &str = "/tmp/origin-data";

fn factory() -> (Factory, MockBackend) {
    static TRACING: std::sync::Once = std::sync::Once::new();
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
    let backend = MockBackend::new();
    let factory = Factory::new(Arc::new(backend.clone()));
    (factory, backend)
}

fn open_db(factory: &Factory, name: &str) -> (CollectedCallbacks, Arc<CollectedConnection>) {
    let callbacks = CollectedCallbacks::new();
    let connection = Arc::new(CollectedConnection::new());
    factory.open(
        name,
        1,
        1,
        &callbacks,
        connection.clone(),
        ORIGIN,
        Some(Path::new(DIR)),
    );
    (callbacks, connection)
}

/// Let spawned timer tasks run after the clock moved.
async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_opens_for_same_origin_share_one_backing_store() {
    let (factory, backend) = factory();
    let (cb1, _conn1) = open_db(&factory, "db1");
    let (cb2, _conn2) = open_db(&factory, "db2");

    assert!(matches!(cb1.success(), Some(SuccessValue::Opened { .. })));
    assert!(matches!(cb2.success(), Some(SuccessValue::Opened { .. })));
    assert_eq!(backend.open_count(), 1, "second open must reuse the store");
    assert_eq!(factory.open_databases_for_origin(ORIGIN).len(), 2);
    assert!(!factory.is_grace_timer_armed_for_testing(ORIGIN));
}

#[tokio::test(start_paused = true)]
async fn test_grace_period_eviction_after_last_release() {
    let (factory, _backend) = factory();
    open_db(&factory, "db1");
    open_db(&factory, "db2");

    // Simulate every connection going away, without forcing.
    for database in factory.open_databases_for_origin(ORIGIN) {
        database.close_connection(false);
    }
    assert!(factory.open_databases_for_origin(ORIGIN).is_empty());
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));
    assert!(factory.is_grace_timer_armed_for_testing(ORIGIN));

    // Let the sleeper task register its deadline before moving the clock.
    settle().await;
    tokio::time::advance(Duration::from_millis(1999)).await;
    settle().await;
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));

    tokio::time::advance(Duration::from_millis(2)).await;
    settle().await;
    assert!(!factory.is_backing_store_open_for_testing(ORIGIN));
}

#[tokio::test(start_paused = true)]
async fn test_reopen_within_grace_period_keeps_handle() {
    let (factory, backend) = factory();
    open_db(&factory, "db1");
    factory.open_databases_for_origin(ORIGIN)[0].close_connection(false);
    assert!(factory.is_grace_timer_armed_for_testing(ORIGIN));

    tokio::time::advance(Duration::from_millis(1000)).await;
    settle().await;

    let (_cb, _conn) = open_db(&factory, "db1");
    assert_eq!(backend.open_count(), 1, "reopen within grace must be a cache hit");
    assert!(!factory.is_grace_timer_armed_for_testing(ORIGIN));

    // The stale expiry must never close the handle out from under the
    // new connection.
    tokio::time::advance(Duration::from_millis(5000)).await;
    settle().await;
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));
}

#[tokio::test]
async fn test_forced_close_releases_without_grace() {
    let (factory, _backend) = factory();
    let (_cb, connection) = open_db(&factory, "db1");

    factory.open_databases_for_origin(ORIGIN)[0].forced_close();
    assert_eq!(connection.forced_close_count(), 1);
    assert!(factory.open_databases_for_origin(ORIGIN).is_empty());
    assert!(
        !factory.is_backing_store_open_for_testing(ORIGIN),
        "forced close must not wait out the grace period"
    );
}

#[tokio::test(start_paused = true)]
async fn test_delete_database_leaves_no_residual_entry() {
    let (factory, _backend) = factory();
    let callbacks = CollectedCallbacks::new();
    factory.delete_database("db1", &callbacks, ORIGIN, Some(Path::new(DIR)));

    assert_eq!(callbacks.success(), Some(SuccessValue::Deleted));
    assert!(factory.open_databases_for_origin(ORIGIN).is_empty());

    // The scratch entry released its store with the usual grace period.
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));
    // Let the sleeper task register its deadline before moving the clock.
    settle().await;
    tokio::time::advance(Duration::from_millis(2001)).await;
    settle().await;
    assert!(!factory.is_backing_store_open_for_testing(ORIGIN));
}

#[tokio::test]
async fn test_delete_database_routes_to_live_database() {
    let (factory, backend) = factory();
    let (_cb, _conn) = open_db(&factory, "db1");

    let callbacks = CollectedCallbacks::new();
    factory.delete_database("db1", &callbacks, ORIGIN, Some(Path::new(DIR)));
    assert_eq!(callbacks.success(), Some(SuccessValue::Deleted));
    assert_eq!(backend.open_count(), 1, "delete must not open a duplicate store");

    // The open-created entry persists while its connection lives.
    assert_eq!(factory.open_databases_for_origin(ORIGIN).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_teardown_stops_pending_timers() {
    let (factory, backend) = factory();
    open_db(&factory, "db1");
    factory.open_databases_for_origin(ORIGIN)[0].close_connection(false);
    assert!(factory.is_grace_timer_armed_for_testing(ORIGIN));

    factory.teardown();
    assert!(!factory.is_backing_store_open_for_testing(ORIGIN));

    // A fresh open after teardown must not be affected by the cancelled
    // expiry, no matter how far the clock moves.
    open_db(&factory, "db1");
    assert_eq!(backend.open_count(), 2);
    tokio::time::advance(Duration::from_millis(10_000)).await;
    settle().await;
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));
}

#[tokio::test]
async fn test_disk_full_surfaces_quota_error() {
    let (factory, backend) = factory();
    backend.set_disk_full(true);

    let (callbacks, _conn) = open_db(&factory, "db1");
    let message = callbacks.error().expect("open should fail");
    assert!(message.contains("disk full"), "got: {message}");
    assert!(!factory.is_backing_store_open_for_testing(ORIGIN));
}

#[tokio::test]
async fn test_generic_open_failure_reported_for_every_operation() {
    let (factory, backend) = factory();
    backend.fail_opens(true);

    let (open_cb, _conn) = open_db(&factory, "db1");
    assert!(open_cb.error().expect("open fails").contains("backing store"));

    let delete_cb = CollectedCallbacks::new();
    factory.delete_database("db1", &delete_cb, ORIGIN, Some(Path::new(DIR)));
    assert!(delete_cb.error().expect("delete fails").contains("backing store"));

    let names_cb = CollectedCallbacks::new();
    factory.database_names(&names_cb, ORIGIN, Some(Path::new(DIR)));
    assert!(names_cb.error().expect("names fails").contains("backing store"));

    assert!(factory.open_databases_for_origin(ORIGIN).is_empty());
}

#[tokio::test]
async fn test_database_create_failure_keeps_store_cached() {
    let (factory, backend) = factory();
    backend.fail_creates(true);

    let (callbacks, _conn) = open_db(&factory, "db1");
    let message = callbacks.error().expect("open should fail");
    assert!(message.contains("creating database backend"), "got: {message}");
    assert!(factory.open_databases_for_origin(ORIGIN).is_empty());

    // The store opened fine and stays cached for the next attempt.
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));
    assert!(!factory.is_grace_timer_armed_for_testing(ORIGIN));

    backend.fail_creates(false);
    let (retry_cb, _retry_conn) = open_db(&factory, "db1");
    assert!(matches!(retry_cb.success(), Some(SuccessValue::Opened { .. })));
    assert_eq!(backend.open_count(), 1, "retry must be a cache hit");
}

#[tokio::test]
async fn test_data_loss_is_plumbed_to_open_callbacks() {
    let (factory, backend) = factory();
    backend.set_data_loss(true);

    let (callbacks, _conn) = open_db(&factory, "db1");
    match callbacks.success() {
        Some(SuccessValue::Opened { data_loss, .. }) => {
            assert_eq!(data_loss, DataLoss::Total);
        }
        other => panic!("expected opened, got {other:?}"),
    }
}

#[tokio::test]
async fn test_database_names_reflect_opens_and_deletes() {
    let (factory, backend) = factory();
    open_db(&factory, "db1");
    open_db(&factory, "db2");

    let names_cb = CollectedCallbacks::new();
    factory.database_names(&names_cb, ORIGIN, Some(Path::new(DIR)));
    assert_eq!(
        names_cb.success(),
        Some(SuccessValue::DatabaseNames(vec![
            "db1".to_string(),
            "db2".to_string()
        ]))
    );
    assert_eq!(backend.open_count(), 1);

    for database in factory.open_databases_for_origin(ORIGIN) {
        database.close_connection(true);
    }
    let delete_cb = CollectedCallbacks::new();
    factory.delete_database("db1", &delete_cb, ORIGIN, Some(Path::new(DIR)));
    assert_eq!(delete_cb.success(), Some(SuccessValue::Deleted));

    let names_cb = CollectedCallbacks::new();
    factory.database_names(&names_cb, ORIGIN, Some(Path::new(DIR)));
    assert_eq!(
        names_cb.success(),
        Some(SuccessValue::DatabaseNames(vec!["db2".to_string()]))
    );
}

#[tokio::test(start_paused = true)]
async fn test_in_memory_store_lives_and_dies_with_session() {
    let (factory, _backend) = factory();
    let callbacks = CollectedCallbacks::new();
    let connection = Arc::new(CollectedConnection::new());
    // No directory: session-only, in-memory store.
    factory.open("db1", 1, 1, &callbacks, connection, ORIGIN, None);
    assert!(matches!(callbacks.success(), Some(SuccessValue::Opened { .. })));
    assert!(factory.is_backing_store_open_for_testing(ORIGIN));

    factory.open_databases_for_origin(ORIGIN)[0].close_connection(false);
    // Let the sleeper task register its deadline before moving the clock.
    settle().await;
    tokio::time::advance(Duration::from_millis(2001)).await;
    settle().await;
    assert!(!factory.is_backing_store_open_for_testing(ORIGIN));

    // A fresh in-memory open starts empty: nothing survived eviction.
    let names_cb = CollectedCallbacks::new();
    factory.database_names(&names_cb, ORIGIN, None);
    assert_eq!(
        names_cb.success(),
        Some(SuccessValue::DatabaseNames(Vec::new()))
    );
}

#[tokio::test]
async fn test_open_databases_are_listed_per_origin_in_name_order() {
    let (factory, _backend) = factory();
    for name in ["zeta", "alpha", "mid"] {
        open_db(&factory, name);
    }
    let other_cb = CollectedCallbacks::new();
    let other_conn = Arc::new(CollectedConnection::new());
    factory.open(
        "elsewhere",
        1,
        1,
        &other_cb,
        other_conn,
        "http://b.example",
        Some(Path::new(DIR)),
    );

    let names: Vec<_> = factory
        .open_databases_for_origin(ORIGIN)
        .iter()
        .map(|db| db.identifier().name().to_string())
        .collect();
    assert_eq!(names, vec!["alpha", "mid", "zeta"]);
}
