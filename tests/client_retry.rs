//! Retry and timeout behavior tests.

mod common;

use async_jip::{Client, Error, Retry, UdpTransport, Value};
use common::{LAMP, LossyProxy, SilentNode, TestServer, lamp_schema};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

async fn client(border_router: SocketAddr, timeout: Duration, retry: Retry) -> Client<UdpTransport> {
    let client = Client::builder()
        .border_router(border_router.to_string())
        .timeout(timeout)
        .retry(retry)
        .connect()
        .await
        .unwrap();
    client.network().with_cache(|cache| cache.insert_node(lamp_schema()));
    client
}

/// A silent node sees exactly one send per attempt, then the client gives up.
#[tokio::test]
async fn client_fails_after_max_retries() {
    let silent = SilentNode::new().await;
    let client = client(
        silent.addr(),
        Duration::from_millis(50),
        Retry::fixed(2, Duration::ZERO),
    )
    .await;

    let mut node = client.add_node(silent.addr(), LAMP).await.unwrap();
    let name = node.find_var("Node", "DescriptiveName").unwrap();

    let start = Instant::now();
    let err = client.get_var(&mut node, name).await.unwrap_err();
    let elapsed = start.elapsed();

    match &*err {
        Error::Timeout { target, retries, .. } => {
            assert_eq!(*target, silent.addr());
            assert_eq!(*retries, 3);
        }
        other => panic!("expected timeout, got {}", other),
    }
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(silent.received(), 3);

    // Should have taken ~150ms (3 attempts * 50ms timeout)
    assert!(elapsed >= Duration::from_millis(140));
    assert!(elapsed < Duration::from_millis(1000));
    drop(node);
    client.shutdown().await;
}

/// No retries means a single send.
#[tokio::test]
async fn zero_retries_single_attempt() {
    let silent = SilentNode::new().await;
    let client = client(silent.addr(), Duration::from_millis(50), Retry::none()).await;

    let mut node = client.add_node(silent.addr(), LAMP).await.unwrap();
    let mode = node.find_var("BulbControl", "Mode").unwrap();
    let err = client
        .set_var(&mut node, mode, Value::U8(1))
        .await
        .unwrap_err();
    assert!(matches!(*err, Error::Timeout { retries: 1, .. }));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(silent.received(), 1);
    drop(node);
    client.shutdown().await;
}

/// Lost requests are resent until one gets through.
#[tokio::test]
async fn client_retries_lost_requests() {
    let server = TestServer::lamp().await;
    let proxy = LossyProxy::drop_first(server.addr(), 2).await;
    let client = client(
        proxy.addr(),
        Duration::from_millis(100),
        Retry::fixed(2, Duration::from_millis(10)),
    )
    .await;

    let mut node = client.add_node(proxy.addr(), LAMP).await.unwrap();
    let name = node.find_var("Node", "DescriptiveName").unwrap();
    client.get_var(&mut node, name).await.unwrap();
    assert_eq!(node.var(name).unwrap().value, Some(Value::from("Lamp")));
    assert_eq!(proxy.forwarded(), 1);
    drop(node);
    client.shutdown().await;
}

/// Exponential backoff adds its delays to the per-send timeout.
#[tokio::test]
async fn exponential_backoff_delays_resends() {
    let silent = SilentNode::new().await;
    let retry = Retry::exponential(2)
        .initial_delay(Duration::from_millis(40))
        .max_delay(Duration::from_millis(80))
        .jitter(0.0)
        .build();
    let client = client(silent.addr(), Duration::from_millis(20), retry).await;

    let mut node = client.add_node(silent.addr(), LAMP).await.unwrap();
    let name = node.find_var("Node", "DescriptiveName").unwrap();

    let start = Instant::now();
    assert!(client.get_var(&mut node, name).await.is_err());
    // 3 * 20ms waiting plus 40ms and 80ms pauses
    assert!(start.elapsed() >= Duration::from_millis(170));
    drop(node);
    client.shutdown().await;
}
