//! Connection registry behaviour against a fake opener and a mock panel

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;

use xk_broker::NodeRegistry;
use xk_core::types::ConnectionStatus;

use common::{spawn_panel, test_node, test_settings, wait_for, FakeOpener};

#[tokio::test]
async fn test_concurrent_ensure_opens_one_tunnel() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::new(port));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    let clients = join_all((0..8).map(|_| registry.ensure(&node))).await;
    let clients: Vec<_> = clients.into_iter().map(|c| c.unwrap()).collect();

    assert_eq!(opener.opens(), 1);
    assert!(clients.iter().all(|c| Arc::ptr_eq(c, &clients[0])));

    registry.close_all().await;
}

#[tokio::test]
async fn test_ensure_reuses_connection() {
    let (panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::new(port));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    let first = registry.ensure(&node).await.unwrap();
    let second = registry.ensure(&node).await.unwrap();

    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(opener.opens(), 1);
    // Validation logged in once; reuse does not log in again
    assert_eq!(panel.logins.load(Ordering::SeqCst), 1);
    assert_eq!(registry.status(node.id).await, ConnectionStatus::Connected);
    assert_eq!(registry.get(node.id).await.unwrap().local_port(), port);

    registry.close_all().await;
}

#[tokio::test]
async fn test_different_nodes_get_separate_connections() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::new(port));
    let registry = NodeRegistry::new(opener.clone(), test_settings());

    let a = test_node(1, None);
    let b = test_node(2, None);
    let (ca, cb) = tokio::join!(registry.ensure(&a), registry.ensure(&b));

    assert!(!Arc::ptr_eq(&ca.unwrap(), &cb.unwrap()));
    assert_eq!(opener.opens(), 2);
    assert_eq!(registry.connected().await, vec![a.id, b.id]);

    registry.close_all().await;
}

#[tokio::test]
async fn test_close_all_then_ensure_rebuilds() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::new(port));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    let before = registry.ensure(&node).await.unwrap();
    let tunnel = opener.last_tunnel();

    registry.close_all().await;
    assert!(tunnel.closed.load(Ordering::SeqCst));
    assert!(registry.get(node.id).await.is_none());
    assert_eq!(registry.status(node.id).await, ConnectionStatus::Disconnected);

    // The monitor is gone, so nothing reconnects behind our back
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(opener.opens(), 1);

    let after = registry.ensure(&node).await.unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(opener.opens(), 2);

    registry.close_all().await;
}

#[tokio::test]
async fn test_health_monitor_replaces_dead_tunnel() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::new(port));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    let old_client = registry.ensure(&node).await.unwrap();
    let old_conn = registry.get(node.id).await.unwrap();
    let old_generation = old_conn.generation;
    let old_tunnel = opener.last_tunnel();

    old_tunnel.alive.store(false, Ordering::SeqCst);

    let replaced = wait_for(Duration::from_secs(5), || async {
        registry
            .get(node.id)
            .await
            .is_some_and(|conn| conn.generation != old_generation)
    })
    .await;
    assert!(replaced, "monitor did not replace the dead tunnel");

    assert_eq!(opener.opens(), 2);
    assert!(old_tunnel.closed.load(Ordering::SeqCst));
    let new_conn = registry.get(node.id).await.unwrap();
    assert!(new_conn.connected_at > old_conn.connected_at);

    let new_client = registry.ensure(&node).await.unwrap();
    assert!(!Arc::ptr_eq(&old_client, &new_client));

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_node_reconnects_in_background() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::failing(port, 3));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    assert!(registry.ensure(&node).await.is_err());
    assert_eq!(registry.status(node.id).await, ConnectionStatus::Reconnecting);

    let connected = wait_for(Duration::from_secs(5), || async {
        registry.status(node.id).await == ConnectionStatus::Connected
    })
    .await;
    assert!(connected, "background reconnect never succeeded");
    assert_eq!(opener.opens(), 1);

    let attempts = opener.attempts.lock().unwrap().clone();
    assert_eq!(attempts.len(), 4);
    let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    assert!(gaps[1] > gaps[0], "gaps did not grow: {:?}", gaps);
    assert!(gaps[2] > gaps[1], "gaps did not grow: {:?}", gaps);

    registry.close_all().await;
}

#[tokio::test]
async fn test_failed_ensure_schedules_one_reconnect_loop() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::failing(port, usize::MAX));
    let mut settings = test_settings();
    settings.backoff.initial = Duration::from_millis(300);
    settings.backoff.max = Duration::from_secs(5);
    let registry = NodeRegistry::new(opener.clone(), settings);
    let node = test_node(1, None);

    // Several failing callers must not stack reconnect loops
    for _ in 0..3 {
        assert!(registry.ensure(&node).await.is_err());
    }
    let first_wave = opener.attempts.lock().unwrap().len();
    assert_eq!(first_wave, 3);

    // A single loop retries once after 300ms, then waits 600ms
    tokio::time::sleep(Duration::from_millis(450)).await;
    let retries = opener.attempts.lock().unwrap().len() - first_wave;
    assert_eq!(retries, 1);

    registry.close_all().await;
}

#[tokio::test]
async fn test_close_all_stops_reconnect_loop() {
    let (_panel, port) = spawn_panel().await;
    let opener = Arc::new(FakeOpener::failing(port, usize::MAX));
    let registry = NodeRegistry::new(opener.clone(), test_settings());
    let node = test_node(1, None);

    assert!(registry.ensure(&node).await.is_err());
    assert_eq!(registry.status(node.id).await, ConnectionStatus::Reconnecting);

    registry.close_all().await;
    assert_eq!(registry.status(node.id).await, ConnectionStatus::Disconnected);

    let stopped_at = opener.attempts.lock().unwrap().len();
    tokio::time::sleep(Duration::from_millis(400)).await;
    // At most an attempt that was already past its cancellation check
    assert!(opener.attempts.lock().unwrap().len() <= stopped_at + 1);
}
