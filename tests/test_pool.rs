//! Tests for per-worker connection pools

mod common;

use common::{Behavior, MockConnector, wait_until};
use sentinel_lb::error::AcquireError;
use sentinel_lb::proxy::pool::{ConnectionPool, PoolConfig};
use sentinel_lb::proxy::transport::TransportConfig;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const ADDRESS: &str = "backend:8080";
const WAIT: Duration = Duration::from_secs(10);

fn pool_with(connector: Arc<MockConnector>, config: PoolConfig) -> ConnectionPool {
    ConnectionPool::new(ADDRESS, TransportConfig::default(), connector, config)
}

fn single_connection_pool(connector: Arc<MockConnector>) -> ConnectionPool {
    pool_with(
        connector,
        PoolConfig {
            max_connections: 1,
            ..PoolConfig::default()
        },
    )
}

#[tokio::test]
async fn test_released_connection_is_reused() {
    let connector = MockConnector::new();
    let pool = single_connection_pool(connector.clone());

    let first = pool.acquire(WAIT).await.unwrap();
    let id = first.id();
    pool.release(first);

    let second = pool.acquire(WAIT).await.unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(connector.backend(ADDRESS).connects(), 1);

    let stats = pool.stats();
    assert_eq!(stats.open, 1);
    assert_eq!(stats.in_flight, 1);
}

#[tokio::test]
async fn test_lease_reports_reuse_and_idle_can_be_closed() {
    let connector = MockConnector::new();
    let pool = single_connection_pool(connector.clone());

    let first = pool.acquire(WAIT).await.unwrap();
    assert!(!first.is_reused());
    pool.release(first);

    let second = pool.acquire(WAIT).await.unwrap();
    assert!(second.is_reused());
    pool.release(second);

    assert_eq!(pool.close_idle(), 1);
    assert_eq!(pool.stats().open, 0);
    let third = pool.acquire(WAIT).await.unwrap();
    assert!(!third.is_reused());
    assert_eq!(connector.backend(ADDRESS).connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_checked_out_connection_is_exclusive() {
    let pool = single_connection_pool(MockConnector::new());

    let held = pool.acquire(WAIT).await.unwrap();
    let result = pool.acquire(Duration::from_millis(50)).await;

    assert!(matches!(result, Err(AcquireError::TimedOut(_))));
    // The timed-out waiter left the queue
    assert_eq!(pool.stats().queued, 0);
    pool.release(held);
    assert_eq!(pool.stats().idle, 1);
}

#[tokio::test]
async fn test_waiters_are_served_fifo() {
    let pool = single_connection_pool(MockConnector::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let held = pool.acquire(WAIT).await.unwrap();

    let mut tasks = Vec::new();
    for (queued, name) in ["A", "B", "C"].into_iter().enumerate() {
        let task_pool = pool.clone();
        let order = Arc::clone(&order);
        tasks.push(tokio::spawn(async move {
            let lease = task_pool.acquire(WAIT).await.unwrap();
            order.lock().unwrap().push(name);
            lease.release();
        }));
        wait_until(|| pool.stats().queued == queued + 1).await;
    }

    pool.release(held);
    for task in tasks {
        task.await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec!["A", "B", "C"]);
    assert_eq!(pool.stats().open, 1);
}

#[tokio::test]
async fn test_new_caller_does_not_jump_the_queue() {
    let pool = single_connection_pool(MockConnector::new());
    let held = pool.acquire(WAIT).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(WAIT).await })
    };
    wait_until(|| pool.stats().queued == 1).await;

    // The released connection goes straight to the queued waiter
    pool.release(held);
    assert_eq!(pool.stats().idle, 0);

    let late = pool.acquire(Duration::from_millis(1)).await;
    assert!(matches!(late, Err(AcquireError::TimedOut(_))));
    assert!(waiter.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_full_queue_is_rejected() {
    let pool = pool_with(
        MockConnector::new(),
        PoolConfig {
            max_connections: 1,
            max_queued: 1,
            ..PoolConfig::default()
        },
    );
    let _held = pool.acquire(WAIT).await.unwrap();

    let queued = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(WAIT).await.is_ok() })
    };
    wait_until(|| pool.stats().queued == 1).await;

    let result = pool.acquire(WAIT).await;
    assert!(matches!(result, Err(AcquireError::PoolExhausted)));
    assert!(result.unwrap_err().is_unavailable());
    assert!(!pool.has_capacity());

    queued.abort();
}

#[tokio::test]
async fn test_discard_lets_waiter_open_replacement() {
    let connector = MockConnector::new();
    let pool = single_connection_pool(connector.clone());
    let held = pool.acquire(WAIT).await.unwrap();
    let broken_id = held.id();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(WAIT).await.map(|lease| lease.id()) })
    };
    wait_until(|| pool.stats().queued == 1).await;

    pool.discard(held);
    let replacement = waiter.await.unwrap().unwrap();

    assert_ne!(replacement, broken_id);
    assert_eq!(connector.backend(ADDRESS).connects(), 2);
}

#[tokio::test]
async fn test_dropped_lease_is_discarded_not_leaked() {
    let connector = MockConnector::new();
    let pool = single_connection_pool(connector.clone());

    let lease = pool.acquire(WAIT).await.unwrap();
    drop(lease);

    let stats = pool.stats();
    assert_eq!(stats.in_flight, 0);
    assert_eq!(stats.open, 0);

    // Capacity came back: a fresh connection can be opened
    let again = pool.acquire(Duration::from_millis(10)).await.unwrap();
    assert_eq!(again.address(), ADDRESS);
    assert_eq!(connector.backend(ADDRESS).connects(), 2);
}

#[tokio::test]
async fn test_cancelled_waiter_leaves_no_trace() {
    let pool = single_connection_pool(MockConnector::new());
    let held = pool.acquire(WAIT).await.unwrap();

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(WAIT).await.is_ok() })
    };
    wait_until(|| pool.stats().queued == 1).await;
    waiter.abort();
    let _ = waiter.await;

    pool.release(held);
    let stats = pool.stats();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.in_flight, 0);
    assert!(pool.acquire(Duration::from_millis(1)).await.is_ok());
}

#[tokio::test]
async fn test_shutdown_is_idempotent_and_fails_waiters() {
    let pool = pool_with(
        MockConnector::new(),
        PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        },
    );

    let idle = pool.acquire(WAIT).await.unwrap();
    let busy = pool.acquire(WAIT).await.unwrap();
    pool.release(idle);

    let waiter = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.acquire(WAIT).await })
    };
    // Idle connection is available, so occupy it to force queueing
    let idle_again = pool.acquire(WAIT).await.unwrap();
    wait_until(|| pool.stats().queued == 1 || waiter.is_finished()).await;

    pool.shutdown();
    pool.shutdown();

    assert!(pool.is_shutdown());
    assert!(matches!(waiter.await.unwrap(), Err(AcquireError::Shutdown)));
    assert!(matches!(pool.acquire(WAIT).await, Err(AcquireError::Shutdown)));

    // Checked-out connections close as they come back
    pool.release(busy);
    pool.release(idle_again);
    let stats = pool.stats();
    assert_eq!(stats.open, 0);
    assert!(stats.shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_idle_connections_expire() {
    let pool = pool_with(
        MockConnector::new(),
        PoolConfig {
            idle_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        },
    );

    let lease = pool.acquire(WAIT).await.unwrap();
    pool.release(lease);
    assert_eq!(pool.purge_expired(), 0);

    tokio::time::advance(Duration::from_secs(31)).await;
    assert_eq!(pool.purge_expired(), 1);
    assert_eq!(pool.stats().open, 0);
}

#[tokio::test]
async fn test_multiplexed_connection_is_shared_up_to_its_limit() {
    let connector = MockConnector::multiplexed(5);
    let pool = ConnectionPool::new(
        ADDRESS,
        TransportConfig {
            multiplexed: true,
            max_concurrent_streams: 2,
            ..TransportConfig::default()
        },
        connector.clone(),
        PoolConfig {
            max_connections: 2,
            ..PoolConfig::default()
        },
    );

    let a = pool.acquire(WAIT).await.unwrap();
    let b = pool.acquire(WAIT).await.unwrap();
    assert_eq!(a.id(), b.id());
    assert_eq!(connector.backend(ADDRESS).connects(), 1);

    // Stream limit reached, so the third exchange needs a new connection
    let c = pool.acquire(WAIT).await.unwrap();
    assert_ne!(c.id(), a.id());
    assert_eq!(pool.in_flight(), 3);

    pool.release(a);
    pool.release(b);
    pool.release(c);
    assert_eq!(pool.stats().idle, 2);
}

#[tokio::test]
async fn test_connect_failure_returns_capacity() {
    let connector = MockConnector::new();
    connector.backend(ADDRESS).set_behavior(Behavior::RefuseConnect);
    let pool = single_connection_pool(connector.clone());

    let result = pool.acquire(WAIT).await;
    assert!(matches!(result, Err(AcquireError::Connect { .. })));
    assert_eq!(pool.stats().opening, 0);

    connector.backend(ADDRESS).set_behavior(Behavior::Stall);
    assert!(pool.acquire(WAIT).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_connect_timeout() {
    let connector = MockConnector::new();
    connector
        .backend(ADDRESS)
        .set_connect_delay(Duration::from_secs(30));
    let pool = pool_with(
        connector,
        PoolConfig {
            connect_timeout: Duration::from_secs(1),
            ..PoolConfig::default()
        },
    );

    let result = pool.acquire(WAIT).await;
    assert!(matches!(result, Err(AcquireError::ConnectTimeout { .. })));
    assert_eq!(pool.stats().opening, 0);
}
