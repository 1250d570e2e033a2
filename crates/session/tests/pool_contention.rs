//! Pool-mode contention through the public manager API only.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use drill_domain::config::{SessionMode, SessionPolicyConfig, VersionPolicy};
use drill_domain::error::Error;
use drill_session::SessionManager;
use drill_transport::testing::MockAdapter;
use drill_transport::TransportConfig;

fn transport_config() -> TransportConfig {
    TransportConfig {
        url: "http://target.test/rpc".into(),
        request_timeout: Duration::from_secs(5),
        protocol_version: "2025-03-26".into(),
        version_policy: VersionPolicy::Compatible,
        redirect: None,
        headers: vec![],
    }
}

fn pool_manager(adapter: Arc<MockAdapter>, size: usize) -> Arc<SessionManager> {
    let manager = Arc::new(SessionManager::new(
        adapter,
        transport_config(),
        &SessionPolicyConfig {
            mode: SessionMode::Pool,
            pool_max_size: size,
            ..SessionPolicyConfig::default()
        },
    ));
    manager.start();
    manager
}

#[tokio::test(start_paused = true)]
async fn pool_exhaustion_with_timeout_then_recovery() {
    let adapter = Arc::new(MockAdapter::new());
    let manager = pool_manager(adapter, 3);
    let cancel = CancellationToken::new();

    // Three concurrent acquires fill the pool.
    let mut held = Vec::new();
    for i in 0..3 {
        held.push(manager.acquire(&format!("vu_{i}"), &cancel).await.unwrap());
    }
    assert_eq!(manager.metrics().active, 3);

    // A fourth with a 100 ms deadline gets PoolTimeout promptly.
    let deadline = CancellationToken::new();
    let waiter = {
        let manager = manager.clone();
        let deadline = deadline.clone();
        tokio::spawn(async move { manager.acquire("vu_3", &deadline).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    deadline.cancel();
    assert!(matches!(waiter.await.unwrap(), Err(Error::PoolTimeout)));

    // Release one; a fifth acquire succeeds quickly with the freed session.
    manager.release(&held[0]).await;
    let fifth = manager.acquire("vu_4", &cancel).await.unwrap();
    assert_eq!(fifth.id(), held[0].id());

    manager.close().await;
}

#[tokio::test(start_paused = true)]
async fn contended_acquires_each_get_a_distinct_session() {
    let adapter = Arc::new(MockAdapter::new());
    let manager = pool_manager(adapter.clone(), 4);
    let cancel = CancellationToken::new();

    // 16 workers cycling acquire → release over a pool of 4: no session is
    // ever held by two workers at once.
    let mut tasks = Vec::new();
    for i in 0..16 {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            let mut ids = Vec::new();
            for _ in 0..5 {
                let session = manager.acquire(&format!("vu_{i}"), &cancel).await.unwrap();
                ids.push(session.id().to_owned());
                tokio::time::sleep(Duration::from_millis(2)).await;
                manager.release(&session).await;
            }
            ids
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    // Never more than the pool size of connections were created.
    assert!(adapter.stats().connects() <= 4);
    let metrics = manager.metrics();
    assert_eq!(metrics.active, 0);
    assert_eq!(metrics.idle as u32, adapter.stats().connects());

    manager.close().await;
    assert_eq!(adapter.stats().closes(), adapter.stats().connects());
}

#[tokio::test(start_paused = true)]
async fn manager_close_wakes_pool_waiters() {
    let adapter = Arc::new(MockAdapter::new());
    let manager = pool_manager(adapter, 1);
    let cancel = CancellationToken::new();

    let _held = manager.acquire("vu_0", &cancel).await.unwrap();
    let waiter = {
        let manager = manager.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { manager.acquire("vu_1", &cancel).await })
    };
    tokio::task::yield_now().await;

    manager.close().await;
    assert!(matches!(waiter.await.unwrap(), Err(Error::ManagerClosed)));
}
