use crate::utils::{setup_tracing, MockNode, Received, Reply};
use assert_matches::assert_matches;
use bytes::Bytes;
use cassandra_cql::frame::request::batch::BatchStatement;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::errors::{DbError, QueryError};
use cassandra_driver::{
    BatchType, ColumnType, Consistency, CqlValue, ExecuteOptions, SerialConsistency,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const INSERT: &str = "INSERT INTO ks.t (id, v) VALUES (?, ?)";
const DELETE: &str = "DELETE FROM ks.t WHERE id = 7";
const STATEMENT_ID: &[u8] = b"\x5e\x11";

fn answer_prepare(request: &Received) -> Option<Reply> {
    (request.opcode == RequestOpcode::Prepare).then(|| Reply::Prepared {
        id: Bytes::from_static(STATEMENT_ID),
        columns: vec![("id", ColumnType::Int), ("v", ColumnType::Text)],
    })
}

fn row(id: i32, v: &str) -> Vec<CqlValue> {
    vec![CqlValue::Int(id), CqlValue::Text(v.to_owned())]
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn batch_is_sent_in_order_and_emptied() {
    setup_tracing();
    let node = MockNode::with_handler(answer_prepare).await;
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    let mut batch = client.batch(BatchType::Logged, ExecuteOptions::default());
    batch
        .add_prepared(&insert, row(9, "qux"))
        .add_query(DELETE, vec![])
        .add_prepared(&insert, row(8, "baz"));
    assert_eq!(batch.len(), 3);

    batch.execute(&client, &ExecuteOptions::default()).await.unwrap();
    assert!(batch.is_empty());

    let batches = node.received_of(RequestOpcode::Batch);
    assert_eq!(batches.len(), 1);
    let sent = batches[0].batch();
    assert_eq!(sent.batch_type(), BatchType::Logged);
    assert_eq!(sent.consistency, Consistency::Quorum);

    let statements: Vec<_> = sent.statements().map(|(statement, _)| statement.clone()).collect();
    assert_eq!(
        statements,
        vec![
            BatchStatement::Prepared {
                id: Bytes::from_static(STATEMENT_ID)
            },
            BatchStatement::Query {
                text: DELETE.to_owned()
            },
            BatchStatement::Prepared {
                id: Bytes::from_static(STATEMENT_ID)
            },
        ]
    );
    let value_counts: Vec<u16> = sent.statements().map(|(_, values)| values.element_count()).collect();
    assert_eq!(value_counts, vec![2, 0, 2]);

    // The emptied batch can be filled again.
    batch.add_prepared(&insert, row(7, "foo"));
    batch.execute(&client, &ExecuteOptions::default()).await.unwrap();
    assert_eq!(node.received_of(RequestOpcode::Batch).len(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn failed_batch_keeps_its_parts() {
    setup_tracing();
    let node = MockNode::with_handler(|request| match request.opcode {
        RequestOpcode::Batch => Some(Reply::error(0x1001, "Too many in flight")),
        _ => answer_prepare(request),
    })
    .await;
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    let mut batch = client.batch(BatchType::Unlogged, ExecuteOptions::default());
    batch.add_prepared(&insert, row(1, "a")).add_query(DELETE, vec![]);

    assert_matches!(
        batch.execute(&client, &ExecuteOptions::default()).await,
        Err(QueryError::DbError(DbError::Overloaded, message)) if message == "Too many in flight"
    );
    assert_eq!(batch.len(), 2);
    assert_eq!(batch.batch_type(), BatchType::Unlogged);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn batch_parts_unknown_to_the_server_are_prepared_again() {
    setup_tracing();
    let rejected = Arc::new(AtomicBool::new(false));
    let node = {
        let rejected = rejected.clone();
        MockNode::with_handler(move |request| match request.opcode {
            RequestOpcode::Batch if !rejected.swap(true, Ordering::SeqCst) => {
                Some(Reply::Unprepared(Bytes::from_static(STATEMENT_ID)))
            }
            _ => answer_prepare(request),
        })
        .await
    };
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    let mut batch = client.batch(BatchType::Logged, ExecuteOptions::default());
    batch.add_prepared(&insert, row(9, "qux"));
    client
        .execute_batch(&mut batch, &ExecuteOptions::default())
        .await
        .unwrap();

    assert!(batch.is_empty());
    assert_eq!(node.received_of(RequestOpcode::Prepare).len(), 2);
    assert_eq!(node.received_of(RequestOpcode::Batch).len(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn call_options_win_over_batch_options() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node.client_builder().build().await.unwrap();

    let mut batch = client.batch(
        BatchType::Counter,
        ExecuteOptions::new()
            .consistency(Consistency::One)
            .timestamp(42),
    );
    batch.add_query("UPDATE ks.c SET n = n + 1 WHERE id = 1", vec![]);
    batch
        .execute(
            &client,
            &ExecuteOptions::new()
                .serial_consistency(SerialConsistency::LocalSerial)
                .timestamp(43),
        )
        .await
        .unwrap();

    let sent = node.received_of(RequestOpcode::Batch)[0].batch();
    assert_eq!(sent.batch_type(), BatchType::Counter);
    assert_eq!(sent.consistency, Consistency::One);
    assert_eq!(sent.serial_consistency, Some(SerialConsistency::LocalSerial));
    assert_eq!(sent.timestamp, Some(43));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn batch_type_is_parsed_from_its_name() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node.client_builder().build().await.unwrap();

    let mut batch =
        cassandra_driver::Batch::named("unlogged", ExecuteOptions::default()).unwrap();
    batch.add_query(DELETE, vec![]);
    client
        .execute_batch(&mut batch, &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(
        node.received_of(RequestOpcode::Batch)[0].batch().batch_type(),
        BatchType::Unlogged
    );

    assert!(cassandra_driver::Batch::named("sideways", ExecuteOptions::default()).is_err());
}
