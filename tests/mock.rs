//! Client protocol tests using MockTransport.
//!
//! The mock answers by running the server's request dispatcher against an
//! in-memory node, so no sockets are involved.
//!
//! Run with: `cargo test --features testing --test mock`

mod common;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_jip::server::dispatch;
use async_jip::testing::MockTransport;
use async_jip::wire::{Command, Header, decode_packet, encode_packet};
use async_jip::{Client, ClientConfig, Error, Node, Retry, Table, Value};
use bytes::Bytes;
use common::{LAMP, lamp_schema};
use proptest::prelude::*;

fn address() -> SocketAddr {
    "[fd04::2]:1873".parse().unwrap()
}

/// A lamp as the server side would hold it, everything enabled.
fn served_lamp() -> Node {
    let mut node = Node::new(address(), LAMP);
    let mut cache = async_jip::SchemaCache::new();
    cache.insert_node(lamp_schema());
    assert!(cache.populate_node(&mut node));
    for var in node.mibs.iter_mut().flat_map(|mib| mib.vars.iter_mut()) {
        var.enabled = true;
    }
    node
}

/// Answer every request by dispatching it against `node`.
fn serve(mock: &MockTransport, node: Arc<Mutex<Node>>) {
    mock.set_responder(Arc::new(move |request: &[u8], target: SocketAddr| {
        let Ok((header, body)) = decode_packet(Bytes::copy_from_slice(request), target) else {
            return Vec::new();
        };
        let mut node = node.lock().unwrap();
        let source: SocketAddr = "[fd04::1]:49152".parse().unwrap();
        let dispatched = dispatch(&mut node, header.command, body, source, None);
        match dispatched.reply {
            Some((command, reply)) => {
                vec![(encode_packet(Header::new(command, header.handle), &reply), target)]
            }
            None => Vec::new(),
        }
    }));
}

fn client(mock: MockTransport, table_page_size: u8) -> Client<MockTransport> {
    let config = ClientConfig {
        border_router: "[fd04::1]:1873".parse().unwrap(),
        timeout: Duration::from_millis(100),
        retry: Retry::none(),
        table_page_size,
        ..ClientConfig::default()
    };
    Client::new(mock, config)
}

// ============================================================================
// Discovery
// ============================================================================

#[tokio::test]
async fn discovery_against_dispatcher() {
    let mock = MockTransport::new();
    serve(&mock, Arc::new(Mutex::new(served_lamp())));
    let client = client(mock.clone(), 1);

    let node = client.add_node(address(), LAMP).await.unwrap();
    let expected = served_lamp();
    assert_eq!(node.mibs.len(), expected.mibs.len());
    for (got, want) in node.mibs.iter().zip(&expected.mibs) {
        assert_eq!(got.id, want.id);
        assert_eq!(got.name, want.name);
        let names: Vec<_> = got.vars.iter().map(|v| (&v.name, v.var_type, v.access)).collect();
        let wanted: Vec<_> = want.vars.iter().map(|v| (&v.name, v.var_type, v.access)).collect();
        assert_eq!(names, wanted);
    }
    drop(node);

    // Same device type again: cached, no traffic
    mock.clear_requests();
    let other: SocketAddr = "[fd04::3]:1873".parse().unwrap();
    drop(client.add_node(other, LAMP).await.unwrap());
    assert!(mock.requests().is_empty());
    client.shutdown().await;
}

// ============================================================================
// Exchange behavior
// ============================================================================

#[tokio::test]
async fn silent_node_gets_every_send() {
    let mock = MockTransport::new();
    let config = ClientConfig {
        timeout: Duration::from_millis(20),
        retry: Retry::fixed(2, Duration::ZERO),
        ..ClientConfig::default()
    };
    let client = Client::new(mock.clone(), config);
    client.network().with_cache(|cache| cache.insert_node(lamp_schema()));

    let mut node = client.add_node(address(), LAMP).await.unwrap();
    let mode = node.find_var("BulbControl", "Mode").unwrap();
    let err = client.get_var(&mut node, mode).await.unwrap_err();
    assert!(matches!(*err, Error::Timeout { retries: 3, .. }));

    let requests = mock.requests();
    assert_eq!(requests.len(), 3);
    // Retransmissions reuse the handle
    assert!(requests.iter().all(|r| r.handle() == requests[0].handle()));
    assert!(requests.iter().all(|r| r.command() == Some(Command::GetMibRequest.as_u8())));
    drop(node);
    client.shutdown().await;
}

#[tokio::test]
async fn set_through_dispatcher_updates_both_sides() {
    let mock = MockTransport::new();
    let served = Arc::new(Mutex::new(served_lamp()));
    serve(&mock, served.clone());
    let client = client(mock, 1);
    client.network().with_cache(|cache| cache.insert_node(lamp_schema()));

    let mut node = client.add_node(address(), LAMP).await.unwrap();
    let name = node.find_var("Node", "DescriptiveName").unwrap();
    client
        .set_var(&mut node, name, Value::from("Hall"))
        .await
        .unwrap();
    assert_eq!(node.var(name).unwrap().value, Some(Value::from("Hall")));

    let served = served.lock().unwrap();
    let var = served.find_var("Node", "DescriptiveName").unwrap();
    assert_eq!(served.var(var).unwrap().value, Some(Value::from("Hall")));
    drop(served);
    drop(node);
    client.shutdown().await;
}

// ============================================================================
// Tables
// ============================================================================

async fn fetch_rows(rows: &[(u16, Vec<u8>)], page_size: u8) -> Vec<(u16, Vec<u8>)> {
    let mut served = served_lamp();
    let var = served.find_var("BulbScenes", "Scenes").unwrap();
    let mut table = Table::new();
    for (index, data) in rows {
        table.update_row(*index, data.clone()).unwrap();
    }
    served.var_mut(var).unwrap().value = Some(Value::Table(table));

    let mock = MockTransport::new();
    serve(&mock, Arc::new(Mutex::new(served)));
    let client = client(mock, page_size);
    client.network().with_cache(|cache| cache.insert_node(lamp_schema()));

    let mut node = client.add_node(address(), LAMP).await.unwrap();
    client.get_var(&mut node, var).await.unwrap();
    let fetched = match &node.var(var).unwrap().value {
        Some(Value::Table(table)) => table.rows().map(|(i, row)| (i, row.to_vec())).collect(),
        other => panic!("expected a table, got {:?}", other),
    };
    drop(node);
    client.shutdown().await;
    fetched
}

#[tokio::test]
async fn sparse_rows_reproduce() {
    let rows = vec![(0, b"zero".to_vec()), (2, b"two".to_vec()), (5, b"five".to_vec())];
    for page_size in 1..=6 {
        assert_eq!(fetch_rows(&rows, page_size).await, rows, "page size {}", page_size);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn any_table_reproduces(
        rows in prop::collection::btree_map(0u16..40, prop::collection::vec(any::<u8>(), 1..60), 0..12),
        page_size in 1u8..8,
    ) {
        let rows: Vec<(u16, Vec<u8>)> = rows.into_iter().collect();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fetched = runtime.block_on(fetch_rows(&rows, page_size));
        prop_assert_eq!(fetched, rows);
    }
}
