use crate::utils::{prepared_metadata, setup_tracing, MockNode, Received, Reply};
use assert_matches::assert_matches;
use bytes::Bytes;
use cassandra_cql::frame::request::execute::Execute;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::errors::{DbError, QueryError};
use cassandra_driver::{ColumnType, Consistency, CqlValue, ExecuteOptions};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const INSERT: &str = "INSERT INTO ks.t (id, v) VALUES (?, ?)";
const STATEMENT_ID: &[u8] = b"\x0a\x0b";

fn insert_columns() -> Vec<(&'static str, ColumnType)> {
    vec![("id", ColumnType::BigInt), ("v", ColumnType::Text)]
}

fn answer_prepare(request: &Received) -> Option<Reply> {
    (request.opcode == RequestOpcode::Prepare).then(|| Reply::Prepared {
        id: Bytes::from_static(STATEMENT_ID),
        columns: insert_columns(),
    })
}

fn raw_values(execute: &Execute<'_>) -> Vec<Vec<u8>> {
    execute
        .parameters
        .values
        .iter()
        .map(|value| value.unwrap().as_value().unwrap().to_vec())
        .collect()
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn prepared_statement_is_executed_by_id() {
    setup_tracing();
    let node = MockNode::with_handler(answer_prepare).await;
    let client = node.client_builder().build().await.unwrap();

    let insert = client.prepare(INSERT).await.unwrap();
    assert_eq!(insert.cql(), INSERT);
    assert_eq!(insert.metadata(), &prepared_metadata(&insert_columns()));

    for (id, v) in [(9, "qux"), (8, "baz")] {
        client
            .execute_prepared(
                &insert,
                &[CqlValue::Int(id), CqlValue::Text(v.to_owned())],
                &ExecuteOptions::default(),
            )
            .await
            .unwrap();
    }

    let prepares = node.received_of(RequestOpcode::Prepare);
    assert_eq!(prepares.len(), 1);
    assert_eq!(prepares[0].prepare().query, INSERT);

    let executes: Vec<_> = node
        .received_of(RequestOpcode::Execute)
        .iter()
        .map(Received::execute)
        .collect();
    assert_eq!(executes.len(), 2);
    for execute in &executes {
        assert_eq!(&execute.id[..], STATEMENT_ID);
        assert_eq!(execute.parameters.consistency, Consistency::Quorum);
    }
    // Int values are widened to the bigint the server reported.
    assert_eq!(
        raw_values(&executes[0]),
        vec![9i64.to_be_bytes().to_vec(), b"qux".to_vec()]
    );
    assert_eq!(
        raw_values(&executes[1]),
        vec![8i64.to_be_bytes().to_vec(), b"baz".to_vec()]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn call_options_override_client_defaults() {
    setup_tracing();
    let node = MockNode::with_handler(answer_prepare).await;
    let client = node
        .client_builder()
        .default_consistency(Consistency::LocalOne)
        .build()
        .await
        .unwrap();
    let insert = client.prepare(INSERT).await.unwrap();
    let values = [CqlValue::Int(1), CqlValue::Text("a".to_owned())];

    client
        .execute_prepared(&insert, &values, &ExecuteOptions::default())
        .await
        .unwrap();
    client
        .execute_prepared(
            &insert,
            &values,
            &ExecuteOptions::new()
                .consistency(Consistency::Two)
                .timestamp(1_700_000_000_000_000),
        )
        .await
        .unwrap();

    let executes: Vec<_> = node
        .received_of(RequestOpcode::Execute)
        .iter()
        .map(Received::execute)
        .collect();
    assert_eq!(executes[0].parameters.consistency, Consistency::LocalOne);
    assert_eq!(executes[0].parameters.timestamp, None);
    assert_eq!(executes[1].parameters.consistency, Consistency::Two);
    assert_eq!(executes[1].parameters.timestamp, Some(1_700_000_000_000_000));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn wrong_number_of_values_is_refused_locally() {
    setup_tracing();
    let node = MockNode::with_handler(answer_prepare).await;
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    assert_matches!(
        client
            .execute_prepared(&insert, &[CqlValue::Int(1)], &ExecuteOptions::default())
            .await,
        Err(QueryError::BadQuery(_))
    );
    assert!(node.received_of(RequestOpcode::Execute).is_empty());
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn statement_unknown_to_the_server_is_prepared_again() {
    setup_tracing();
    let forgotten = Arc::new(AtomicBool::new(false));
    let node = {
        let forgotten = forgotten.clone();
        MockNode::with_handler(move |request| match request.opcode {
            RequestOpcode::Execute if !forgotten.swap(true, Ordering::SeqCst) => {
                Some(Reply::Unprepared(Bytes::from_static(STATEMENT_ID)))
            }
            _ => answer_prepare(request),
        })
        .await
    };
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    client
        .execute_prepared(
            &insert,
            &[CqlValue::Int(9), CqlValue::Text("qux".to_owned())],
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let opcodes: Vec<RequestOpcode> = node
        .received()
        .iter()
        .map(|request| request.opcode)
        .filter(|opcode| matches!(opcode, RequestOpcode::Prepare | RequestOpcode::Execute))
        .collect();
    assert_eq!(
        opcodes,
        vec![
            RequestOpcode::Prepare,
            RequestOpcode::Execute,
            RequestOpcode::Prepare,
            RequestOpcode::Execute,
        ]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn statement_is_prepared_again_only_once() {
    setup_tracing();
    let node = MockNode::with_handler(|request| match request.opcode {
        RequestOpcode::Execute => Some(Reply::Unprepared(Bytes::from_static(STATEMENT_ID))),
        _ => answer_prepare(request),
    })
    .await;
    let client = node.client_builder().build().await.unwrap();
    let insert = client.prepare(INSERT).await.unwrap();

    let result = client
        .execute_prepared(
            &insert,
            &[CqlValue::Int(9), CqlValue::Text("qux".to_owned())],
            &ExecuteOptions::default(),
        )
        .await;
    assert_matches!(result, Err(QueryError::DbError(DbError::Unprepared { statement_id }, _)) if &statement_id[..] == STATEMENT_ID);
    assert_eq!(node.received_of(RequestOpcode::Execute).len(), 2);
}
