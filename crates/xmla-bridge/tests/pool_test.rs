//! Tests for xmla-bridge pool module

mod common;

use common::*;
use proptest::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use xmla_bridge::prelude::*;

const MINUTE: Duration = Duration::from_secs(60);

fn pool_with_clock(
    backend: &Arc<MockBackend>,
    config: PoolConfig,
    clock: Arc<ManualClock>,
) -> Arc<ConnectionPool> {
    ConnectionPool::with_clock(options(), config, MockFactory::new(backend.clone()), clock)
        .unwrap()
}

fn pool(backend: &Arc<MockBackend>, config: PoolConfig) -> Arc<ConnectionPool> {
    ConnectionPool::new(options(), config, MockFactory::new(backend.clone())).unwrap()
}

fn assert_accounted(pool: &ConnectionPool) {
    let stats = pool.stats();
    assert_eq!(
        stats.connections_created,
        (pool.idle() + pool.in_use()) as u64 + stats.connections_disposed,
        "created connections must be idle, checked out or disposed: {:?}",
        stats
    );
    assert_eq!(pool.size(), pool.idle() + pool.in_use());
}

// ==================== Construction ====================

#[tokio::test]
async fn test_relative_endpoint_fails_fast() {
    let backend = MockBackend::new();
    let mut options = options();
    options.endpoint = "myorg/Sales".to_string();

    let err = ConnectionPool::new(
        options,
        PoolConfig::default(),
        MockFactory::new(backend.clone()),
    )
    .err()
    .unwrap();

    assert!(err.is_startup());
    tokio::task::yield_now().await;
    assert_eq!(backend.opened(), 0);
}

#[tokio::test]
async fn test_missing_dataset_fails_fast() {
    let backend = MockBackend::new();
    let mut options = options();
    options.dataset_name = String::new();

    let err = ConnectionPool::new(
        options,
        PoolConfig::default(),
        MockFactory::new(backend.clone()),
    )
    .err()
    .unwrap();

    assert!(matches!(err, Error::Configuration { .. }));
    tokio::task::yield_now().await;
    assert_eq!(backend.opened(), 0);
}

#[test]
fn test_inverted_thresholds_fail_fast() {
    let backend = MockBackend::new();
    let config = quiet_config().with_session_thresholds(40 * MINUTE, 45 * MINUTE);

    let err = ConnectionPool::new(options(), config, MockFactory::new(backend.clone()))
        .err()
        .unwrap();
    assert!(err.is_startup());
    assert_eq!(backend.opened(), 0);
}

#[test]
fn test_construction_without_runtime_skips_warm_up() {
    let backend = MockBackend::new();
    let pool = pool(&backend, PoolConfig::default().with_warm_up(5));

    assert_eq!(pool.idle(), 0);
    assert_eq!(backend.opened(), 0);
}

// ==================== Warm-up ====================

#[tokio::test]
async fn test_warm_up_fills_free_list() {
    common::init_tracing();
    let backend = MockBackend::new();
    let pool = pool(&backend, PoolConfig::default().with_warm_up(3));

    let report = pool.wait_for_warm_up().await.unwrap();
    assert_eq!(report.requested, 3);
    assert_eq!(report.opened, 3);
    assert_eq!(report.failed, 0);

    assert_eq!(pool.idle(), 3);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(backend.opened(), 3);

    // Only reported once
    assert!(pool.wait_for_warm_up().await.is_none());
}

#[tokio::test]
async fn test_warm_up_failures_are_not_fatal() {
    let backend = MockBackend::new();
    backend.fail_connects(2);
    let pool = pool(
        &backend,
        PoolConfig::default()
            .with_warm_up(4)
            .with_warm_up_concurrency(1),
    );

    let report = pool.wait_for_warm_up().await.unwrap();
    assert_eq!(report.opened, 2);
    assert_eq!(report.failed, 2);
    assert_eq!(pool.idle(), 2);

    let conn = pool.checkout().await.unwrap();
    pool.checkin(conn).await;
}

#[tokio::test]
async fn test_warm_up_capped_by_max_idle() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        PoolConfig::default().with_warm_up(10).with_max_idle(2),
    );

    let report = pool.wait_for_warm_up().await.unwrap();
    assert_eq!(report.requested, 2);
    assert_eq!(pool.idle(), 2);
}

// ==================== Checkout / Checkin ====================

#[tokio::test]
async fn test_checkout_reuses_idle_connection() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config());

    let conn = pool.checkout().await.unwrap();
    let first = conn.session_id().to_string();
    assert_eq!(pool.in_use(), 1);
    pool.checkin(conn).await;
    assert_eq!(pool.idle(), 1);

    let conn = pool.checkout().await.unwrap();
    assert_eq!(conn.session_id(), first);
    pool.checkin(conn).await;

    assert_eq!(backend.opened(), 1);
    let stats = pool.stats();
    assert_eq!(stats.checkouts, 2);
    assert_eq!(stats.checkins, 2);
}

#[tokio::test]
async fn test_checkin_none_is_noop() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config());

    pool.checkin(None::<PooledConnection>).await;

    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats(), PoolStats::default());
}

#[tokio::test]
async fn test_checkin_closed_connection_is_disposed() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config());

    let conn = pool.checkout().await.unwrap();
    conn.close().await.unwrap();
    pool.checkin(conn).await;

    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats().discarded_on_checkin, 1);
    assert_accounted(&pool);
}

#[tokio::test]
async fn test_checkin_past_threshold_never_reappears() {
    let backend = MockBackend::new();
    let clock = Arc::new(ManualClock::new());
    let pool = pool_with_clock(&backend, quiet_config(), clock.clone());

    let conn = pool.checkout().await.unwrap();
    let old = conn.session_id().to_string();

    clock.advance(46 * MINUTE);
    // Still inside the checkout window, past the checkin window
    assert!(pool.tracker().valid_for_checkout(conn.session()));
    pool.checkin(conn).await;

    assert_eq!(pool.idle(), 0);
    assert_eq!(backend.closed(), 1);

    for _ in 0..3 {
        let conn = pool.checkout().await.unwrap();
        assert_ne!(conn.session_id(), old);
        pool.checkin(conn).await;
    }
    assert_accounted(&pool);
}

#[tokio::test]
async fn test_checkout_skips_stale_idle_connection() {
    let backend = MockBackend::new();
    let clock = Arc::new(ManualClock::new());
    let pool = pool_with_clock(&backend, quiet_config(), clock.clone());

    let conn = pool.checkout().await.unwrap();
    let first = conn.session_id().to_string();
    pool.checkin(conn).await;

    clock.advance(48 * MINUTE);
    let conn = pool.checkout().await.unwrap();
    assert_eq!(conn.session_id(), first);
    pool.checkin(conn).await;
    // Retired by the checkin threshold on the way back
    assert_eq!(pool.idle(), 0);

    let conn = pool.checkout().await.unwrap();
    pool.checkin(conn).await;
    assert_eq!(pool.idle(), 1);

    clock.advance(51 * MINUTE);
    let conn = pool.checkout().await.unwrap();
    assert_eq!(pool.stats().discarded_on_checkout, 1);
    assert!(pool.tracker().age(conn.session()) < MINUTE);
    pool.checkin(conn).await;

    assert_accounted(&pool);
}

#[tokio::test]
async fn test_credential_expiry_retires_connection() {
    let backend = MockBackend::new();
    *backend.credential_lifetime.lock() = Some(20 * MINUTE);
    let clock = Arc::new(ManualClock::new());
    let pool = pool_with_clock(&backend, quiet_config(), clock.clone());

    let conn = pool.checkout().await.unwrap();
    clock.advance(16 * MINUTE);
    pool.checkin(conn).await;

    assert_eq!(pool.idle(), 0);
    assert_eq!(pool.stats().discarded_on_checkin, 1);
}

#[tokio::test]
async fn test_max_idle_disposes_surplus() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config().with_max_idle(1));

    let a = pool.checkout().await.unwrap();
    let b = pool.checkout().await.unwrap();
    pool.checkin(a).await;
    pool.checkin(b).await;

    assert_eq!(pool.idle(), 1);
    assert_eq!(pool.stats().connections_disposed, 1);
    assert_accounted(&pool);
}

#[tokio::test]
async fn test_pool_exhausted_after_timeout() {
    let backend = MockBackend::new();
    let pool = pool(
        &backend,
        quiet_config()
            .with_max_size(1)
            .with_acquire_timeout(Duration::from_millis(50)),
    );

    let held = pool.checkout().await.unwrap();
    let err = pool.checkout().await.unwrap_err();
    assert!(matches!(err, Error::PoolExhausted { .. }));
    assert_eq!(pool.stats().exhausted_count, 1);

    pool.checkin(held).await;
    let conn = pool.checkout().await.unwrap();
    pool.checkin(conn).await;
}

#[tokio::test]
async fn test_waiter_gets_returned_connection() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config().with_max_size(1));

    let held = pool.checkout().await.unwrap();
    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move {
            let conn = pool.checkout().await.unwrap();
            let id = conn.session_id().to_string();
            pool.checkin(conn).await;
            id
        })
    };

    tokio::task::yield_now().await;
    let id = held.session_id().to_string();
    pool.checkin(held).await;

    assert_eq!(waiter.await.unwrap(), id);
    assert_eq!(backend.opened(), 1);
}

#[tokio::test]
async fn test_dropped_connection_is_accounted() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config());

    let conn = pool.checkout().await.unwrap();
    drop(conn);

    assert_eq!(pool.in_use(), 0);
    assert_accounted(&pool);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_accounting() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config().with_max_size(8).with_max_idle(4));

    let tasks: Vec<_> = (0..16)
        .map(|task| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    let conn = pool.checkout().await.unwrap();
                    tokio::task::yield_now().await;
                    if (task + i) % 7 == 0 {
                        pool.discard(conn).await;
                    } else {
                        pool.checkin(conn).await;
                    }
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(pool.in_use(), 0);
    assert!(pool.idle() <= 4);
    assert_accounted(&pool);

    let stats = pool.stats();
    assert_eq!(stats.checkouts, 16 * 25);
    assert_eq!(backend.opened() as u64, stats.connections_created);
    assert_eq!(backend.closed() as u64, stats.connections_disposed);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_discard_still_closes_connection() {
    let backend = MockBackend::new();
    *backend.close_delay.lock() = Some(Duration::from_secs(1));
    let pool = pool(&backend, quiet_config());

    let conn = pool.checkout().await.unwrap();
    let discard = pool.discard(conn);
    assert!(tokio::time::timeout(Duration::from_millis(100), discard)
        .await
        .is_err());

    assert_eq!(pool.stats().connections_disposed, 1);
    assert_eq!(pool.in_use(), 0);
    assert_accounted(&pool);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(backend.closed(), 1);
}

// ==================== Validation ====================

#[tokio::test]
async fn test_validated_connection_replaces_failures() {
    let backend = MockBackend::new();
    backend.fail_validations(2);
    let pool = pool(&backend, quiet_config());

    let conn = pool.get_validated_connection().await.unwrap();
    assert_eq!(conn.session_id(), "session-3");
    pool.checkin(conn).await;

    let stats = pool.stats();
    assert_eq!(stats.validation_failures, 2);
    assert_eq!(backend.closed(), 2);
    assert_eq!(backend.validation_queries(), 3);
    assert_accounted(&pool);
}

#[tokio::test]
async fn test_validation_is_bounded() {
    let backend = MockBackend::new();
    backend.fail_validations(usize::MAX);
    let pool = pool(&backend, quiet_config().with_validation_attempts(3));

    let err = pool.get_validated_connection().await.unwrap_err();
    match err {
        Error::RetryExhausted { attempts, source } => {
            assert_eq!(attempts, 3);
            assert!(source.is_connection_failure());
        }
        other => panic!("expected RetryExhausted, got {:?}", other),
    }
    assert_eq!(backend.opened(), 3);
    assert_eq!(pool.in_use(), 0);
    assert_accounted(&pool);
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_close_disposes_idle_and_refuses_checkout() {
    let backend = MockBackend::new();
    let pool = pool(&backend, quiet_config());

    let idle = pool.checkout().await.unwrap();
    let held = pool.checkout().await.unwrap();
    pool.checkin(idle).await;

    pool.close().await;
    assert_eq!(pool.idle(), 0);
    assert_eq!(backend.closed(), 1);
    assert!(matches!(pool.checkout().await, Err(Error::PoolClosed)));

    pool.checkin(held).await;
    assert_eq!(backend.closed(), 2);
    assert_accounted(&pool);
}

// ==================== Properties ====================

#[derive(Debug, Clone)]
enum Op {
    Advance(u32),
    Checkout,
    Checkin(usize),
    Discard(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u32..30).prop_map(Op::Advance),
        Just(Op::Checkout),
        (0usize..8).prop_map(Op::Checkin),
        (0usize..8).prop_map(Op::Discard),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_checkout_respects_threshold(ops in proptest::collection::vec(op(), 1..60)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();

        runtime.block_on(async {
            let backend = MockBackend::new();
            let clock = Arc::new(ManualClock::new());
            let pool = pool_with_clock(&backend, quiet_config().with_max_idle(4), clock.clone());
            let threshold = pool.config().checkout_threshold;
            let mut held: Vec<PooledConnection> = Vec::new();

            for op in ops {
                match op {
                    Op::Advance(minutes) => clock.advance(minutes * MINUTE),
                    Op::Checkout => {
                        if held.len() < 8 {
                            let conn = pool.checkout().await.unwrap();
                            assert!(pool.tracker().age(conn.session()) <= threshold);
                            assert!(conn.is_open());
                            held.push(conn);
                        }
                    }
                    Op::Checkin(idx) if !held.is_empty() => {
                        let conn = held.remove(idx % held.len());
                        pool.checkin(conn).await;
                    }
                    Op::Discard(idx) if !held.is_empty() => {
                        let conn = held.remove(idx % held.len());
                        pool.discard(conn).await;
                    }
                    _ => {}
                }
                assert_accounted(&pool);
            }

            for conn in held {
                pool.checkin(conn).await;
            }
            assert_accounted(&pool);
        });
    }
}
