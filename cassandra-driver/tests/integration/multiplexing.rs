use crate::utils::{setup_tracing, MockNode, Reply};
use assert_matches::assert_matches;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::errors::QueryError;
use cassandra_driver::network::ConnectionSelection;
use cassandra_driver::{CqlValue, ExecuteOptions, QueryResult};
use std::sync::Arc;
use std::time::Duration;

fn answer_text(result: &QueryResult) -> Option<&str> {
    result.first_row()?.columns.first()?.as_ref()?.as_text()
}

// "SELECT slow" is answered after everything sent behind it.
fn slow_and_fast(request: &crate::utils::Received) -> Option<Reply> {
    match request.query_text()?.as_str() {
        "SELECT slow" => Some(Reply::Delayed(
            Duration::from_millis(500),
            Box::new(Reply::text_rows("v", &["slow"])),
        )),
        "SELECT fast" => Some(Reply::text_rows("v", &["fast"])),
        "SELECT never" => Some(Reply::NoReply),
        _ => None,
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn responses_are_matched_out_of_order() {
    setup_tracing();
    let node = MockNode::with_handler(slow_and_fast).await;
    let client = Arc::new(node.client_builder().build().await.unwrap());

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .execute("SELECT slow", &[], &ExecuteOptions::default())
                .await
        })
    };
    node.wait_for_query("SELECT slow").await;

    let fast = client
        .execute("SELECT fast", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(answer_text(&fast), Some("fast"));
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(answer_text(&slow), Some("slow"));

    // Both went over the only connection, on different streams.
    let queries = node.received_of(RequestOpcode::Query);
    assert_eq!(queries.len(), 2);
    assert_eq!(queries[0].connection, queries[1].connection);
    assert_ne!(queries[0].stream, queries[1].stream);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn least_busy_selection_avoids_loaded_connection() {
    setup_tracing();
    let node = MockNode::with_handler(slow_and_fast).await;
    let client = Arc::new(
        node.client_builder()
            .connections_per_node(2)
            .connection_selection(ConnectionSelection::LeastBusy)
            .build()
            .await
            .unwrap(),
    );
    assert_eq!(client.connection_manager().connection_count(), 2);

    let slow = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .execute("SELECT slow", &[], &ExecuteOptions::default())
                .await
        })
    };
    node.wait_for_query("SELECT slow").await;

    client
        .execute("SELECT fast", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    slow.await.unwrap().unwrap();

    let queries = node.received_of(RequestOpcode::Query);
    assert_eq!(queries.len(), 2);
    assert_ne!(queries[0].connection, queries[1].connection);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn unanswered_request_times_out_without_breaking_the_connection() {
    setup_tracing();
    let node = MockNode::with_handler(slow_and_fast).await;
    let client = node.client_builder().build().await.unwrap();

    assert_matches!(
        client
            .execute(
                "SELECT never",
                &[],
                &ExecuteOptions::new().timeout(Duration::from_millis(100))
            )
            .await,
        Err(QueryError::RequestTimeout(_))
    );

    let fast = client
        .execute("SELECT fast", &[CqlValue::Null], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(answer_text(&fast), Some("fast"));
    assert_eq!(node.accepted_connections(), 1);
}
