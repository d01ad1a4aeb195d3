use crate::utils::{setup_tracing, MockNode, Received, Reply};
use assert_matches::assert_matches;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::errors::NewClientError;
use cassandra_driver::network::SystemPeersDiscovery;
use cassandra_driver::{ColumnType, CqlValue};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::mpsc;

fn inet(a: u8, b: u8, c: u8, d: u8) -> CqlValue {
    CqlValue::Inet(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
}

fn peer(address: CqlValue, data_center: &str, rpc_address: CqlValue) -> Vec<CqlValue> {
    vec![address, CqlValue::Text(data_center.to_owned()), rpc_address]
}

// A node in dc1 whose peers are itself, an unreachable node of dc1 and a
// node of dc2.
fn system_tables(request: &Received) -> Option<Reply> {
    let text = request.query_text()?;
    if text.contains("system.local") {
        Some(Reply::text_rows("data_center", &["dc1"]))
    } else if text.contains("system.peers") {
        Some(Reply::Rows {
            columns: vec![
                ("peer", ColumnType::Inet),
                ("data_center", ColumnType::Text),
                ("rpc_address", ColumnType::Inet),
            ],
            rows: vec![
                peer(inet(127, 0, 0, 1), "dc1", inet(0, 0, 0, 0)),
                peer(inet(127, 0, 0, 2), "dc1", inet(127, 0, 0, 2)),
                peer(inet(10, 255, 255, 1), "dc2", inet(10, 255, 255, 1)),
            ],
        })
    } else {
        None
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn peers_are_discovered_through_the_seed() {
    setup_tracing();
    let node = MockNode::with_handler(system_tables).await;
    let client = node
        .client_builder()
        .peer_discovery(Arc::new(SystemPeersDiscovery))
        .build()
        .await
        .unwrap();

    let queries: Vec<String> = node
        .received()
        .iter()
        .filter_map(Received::query_text)
        .collect();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].contains("system.local"));
    assert!(queries[1].contains("system.peers"));

    // The seed itself is already known, 127.0.0.2 refuses connections and
    // dc2 is skipped, so the seed stays alone.
    let manager = client.connection_manager();
    assert_eq!(manager.nodes(), vec![node.address()]);
    assert_eq!(manager.connection_count(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn failing_discovery_fails_the_connect() {
    setup_tracing();
    let node = MockNode::with_handler(|request| {
        let text = request.query_text()?;
        text.contains("system.local")
            .then(|| Reply::error(0x2200, "unconfigured table local"))
    })
    .await;

    assert_matches!(
        node.client_builder()
            .peer_discovery(Arc::new(SystemPeersDiscovery))
            .build()
            .await,
        Err(NewClientError::Query(_))
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unreachable_seeds_are_skipped() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node
        .client_builder()
        .hosts(["127.0.0.1", "127.0.0.3"])
        .build()
        .await
        .unwrap();

    assert_eq!(client.connection_manager().nodes(), vec![node.address()]);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn event_channel_opens_a_registered_connection() {
    setup_tracing();
    let node = MockNode::start().await;
    let (events, _receiver) = mpsc::channel(16);
    let _client = node
        .client_builder()
        .event_channel(events)
        .build()
        .await
        .unwrap();

    let registers = node.received_of(RequestOpcode::Register);
    assert_eq!(registers.len(), 1);
    assert_eq!(node.accepted_connections(), 2);
    assert_ne!(
        registers[0].connection,
        node.received_of(RequestOpcode::Startup)[0].connection
    );
}
