use crate::utils::{setup_tracing, MockNode, Reply};
use bytes::Bytes;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::client::blocking::Client;
use cassandra_driver::{BatchType, ColumnType, CqlValue, ExecuteOptions};

#[test]
#[ntest::timeout(20000)]
fn blocking_client_runs_statements() {
    setup_tracing();
    // The node needs a runtime of its own, the facade brings another one.
    let server_runtime = tokio::runtime::Runtime::new().unwrap();
    let node = server_runtime.block_on(MockNode::with_handler(|request| {
        (request.opcode == RequestOpcode::Prepare).then(|| Reply::Prepared {
            id: Bytes::from_static(b"\x01"),
            columns: vec![("id", ColumnType::Int), ("v", ColumnType::Text)],
        })
    }));

    let client = Client::connect(node.client_builder().config).unwrap();
    client
        .execute("SELECT * FROM ks.t", &[], &ExecuteOptions::default())
        .unwrap();

    let insert = client
        .prepare("INSERT INTO ks.t (id, v) VALUES (?, ?)")
        .unwrap();
    client
        .execute_prepared(
            &insert,
            &[CqlValue::Int(9), CqlValue::Text("qux".to_owned())],
            &ExecuteOptions::default(),
        )
        .unwrap();

    let mut batch = client.batch(BatchType::Logged, ExecuteOptions::default());
    batch.add_prepared(&insert, vec![CqlValue::Int(8), CqlValue::Text("baz".to_owned())]);
    client
        .execute_batch(&mut batch, &ExecuteOptions::default())
        .unwrap();
    assert!(batch.is_empty());

    client.use_keyspace("ks").unwrap();
    assert_eq!(client.connection_manager().connection_count(), 1);
    client.close();

    for opcode in [
        RequestOpcode::Query,
        RequestOpcode::Prepare,
        RequestOpcode::Execute,
        RequestOpcode::Batch,
    ] {
        assert!(!node.received_of(opcode).is_empty(), "no {opcode} received");
    }
    drop(client);
    drop(node);
}
