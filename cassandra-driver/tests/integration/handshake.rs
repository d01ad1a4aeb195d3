use crate::utils::{setup_tracing, MockNode, Received, Reply};
use assert_matches::assert_matches;
use cassandra_cql::frame::request::RequestOpcode;
use cassandra_driver::errors::{BadQuery, ConnectionError, NewClientError, QueryError};
use cassandra_driver::{Compression, CqlValue, ExecuteOptions, ProtocolVersion};

const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

fn protocol_error() -> Reply {
    Reply::error(0x000A, "Invalid or unsupported protocol version")
}

// Asks for credentials and only accepts cassandra/secret.
fn password_node(request: &Received) -> Option<Reply> {
    match request.opcode {
        RequestOpcode::Startup => Some(Reply::Authenticate(PASSWORD_AUTHENTICATOR.to_owned())),
        RequestOpcode::AuthResponse => {
            if request.auth_token() == Some(b"\0cassandra\0secret".to_vec()) {
                Some(Reply::AuthSuccess)
            } else {
                Some(Reply::error(0x0100, "Provided username and/or password are incorrect"))
            }
        }
        _ => None,
    }
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn startup_announces_the_driver() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node
        .client_builder()
        .compression(Some(Compression::Lz4))
        .build()
        .await
        .unwrap();

    let opcodes: Vec<RequestOpcode> = node.received().iter().map(|r| r.opcode).collect();
    assert_eq!(opcodes, vec![RequestOpcode::Options, RequestOpcode::Startup]);

    let startup = node.received_of(RequestOpcode::Startup)[0].startup();
    assert_eq!(
        startup.options.get("CQL_VERSION").map(|v| v.to_string()),
        Some("3.0.0".to_owned())
    );
    assert!(startup.options.contains_key("DRIVER_NAME"));
    assert!(startup.options.contains_key("DRIVER_VERSION"));
    // The node offers no compression, so none is asked for.
    assert!(!startup.options.contains_key("COMPRESSION"));

    client
        .execute("SELECT * FROM ks.t", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(node.accepted_connections(), 1);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn password_authentication() {
    setup_tracing();
    let node = MockNode::with_handler(password_node).await;

    let client = node
        .client_builder()
        .user("cassandra", "secret")
        .build()
        .await
        .unwrap();
    client
        .execute("SELECT * FROM ks.t", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(node.received_of(RequestOpcode::AuthResponse).len(), 1);

    assert_matches!(
        node.client_builder().user("cassandra", "guess").build().await,
        Err(NewClientError::Connection(_))
    );

    assert_matches!(
        node.client_builder().build().await,
        Err(NewClientError::Connection(ConnectionError::MissingAuthentication(name)))
            if name == PASSWORD_AUTHENTICATOR
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn rejected_protocol_version_is_downgraded() {
    setup_tracing();
    let node = MockNode::with_handler(|request| {
        (request.version == ProtocolVersion::V4).then(protocol_error)
    })
    .await;

    let client = node.client_builder().build().await.unwrap();
    let connections = client.connection_manager().connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].protocol_version(), ProtocolVersion::V3);

    client
        .execute(
            "SELECT * FROM ks.t WHERE id = ?",
            &[CqlValue::Int(1)],
            &ExecuteOptions::default(),
        )
        .await
        .unwrap();

    let queries = node.received_of(RequestOpcode::Query);
    assert_eq!(queries.len(), 1);
    assert_eq!(queries[0].version, ProtocolVersion::V3);
    assert_eq!(node.accepted_connections(), 2);
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn every_version_rejected() {
    setup_tracing();
    let node = MockNode::with_handler(|request| {
        (request.opcode == RequestOpcode::Options).then(protocol_error)
    })
    .await;

    assert_matches!(
        node.client_builder().build().await,
        Err(NewClientError::Connection(ConnectionError::ProtocolVersionRejected(
            ProtocolVersion::V2
        )))
    );
    let versions: Vec<ProtocolVersion> = node
        .received_of(RequestOpcode::Options)
        .iter()
        .map(|request| request.version)
        .collect();
    assert_eq!(
        versions,
        vec![ProtocolVersion::V4, ProtocolVersion::V3, ProtocolVersion::V2]
    );
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn protocol_version_can_be_capped() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node
        .client_builder()
        .protocol_version(ProtocolVersion::V2)
        .build()
        .await
        .unwrap();

    client
        .execute("SELECT * FROM ks.t", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert!(node
        .received()
        .iter()
        .all(|request| request.version == ProtocolVersion::V2));
}

#[tokio::test]
#[ntest::timeout(20000)]
async fn keyspace_is_used_on_connect_and_on_request() {
    setup_tracing();
    let node = MockNode::start().await;
    let client = node
        .client_builder()
        .use_keyspace("ks1")
        .build()
        .await
        .unwrap();

    let queries = |node: &MockNode| -> Vec<String> {
        node.received()
            .iter()
            .filter_map(Received::query_text)
            .collect()
    };
    assert_eq!(queries(&node), vec!["USE ks1".to_owned()]);

    let result = client
        .execute("use ks2;", &[], &ExecuteOptions::default())
        .await
        .unwrap();
    assert_eq!(result.set_keyspace.as_deref(), Some("ks2"));
    assert_eq!(
        queries(&node),
        vec!["USE ks1".to_owned(), "USE ks2".to_owned()]
    );

    assert_matches!(
        client
            .execute("USE \"bad-name\"", &[], &ExecuteOptions::default())
            .await,
        Err(QueryError::BadQuery(BadQuery::BadKeyspaceName(_)))
    );
}
