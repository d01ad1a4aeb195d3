use bytes::Bytes;
use cassandra_cql::frame::request::{
    Batch, DeserializableRequest, Execute, Prepare, Query, RequestOpcode, Startup,
};
use cassandra_cql::frame::response::result::{ColumnSpec, PreparedMetadata, TableSpec};
use cassandra_cql::frame::response::ResponseOpcode;
use cassandra_cql::frame::types;
use cassandra_cql::frame::value::serialize_value;
use cassandra_cql::{ColumnType, CqlValue, ProtocolVersion};
use cassandra_driver::network::NoPeerDiscovery;
use cassandra_driver::ClientBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(tracing_subscriber::fmt::TestWriter::new())
        .try_init();
}

/// A request frame as seen by the mock node.
#[derive(Debug, Clone)]
pub(crate) struct Received {
    pub(crate) connection: usize,
    pub(crate) version: ProtocolVersion,
    pub(crate) opcode: RequestOpcode,
    pub(crate) stream: i16,
    pub(crate) body: Bytes,
}

impl Received {
    pub(crate) fn query(&self) -> Query<'static> {
        Query::deserialize(self.version, &mut &self.body[..]).unwrap()
    }

    pub(crate) fn query_text(&self) -> Option<String> {
        (self.opcode == RequestOpcode::Query).then(|| self.query().contents.into_owned())
    }

    pub(crate) fn prepare(&self) -> Prepare<'static> {
        Prepare::deserialize(self.version, &mut &self.body[..]).unwrap()
    }

    pub(crate) fn execute(&self) -> Execute<'static> {
        Execute::deserialize(self.version, &mut &self.body[..]).unwrap()
    }

    pub(crate) fn batch(&self) -> Batch {
        Batch::deserialize(self.version, &mut &self.body[..]).unwrap()
    }

    pub(crate) fn startup(&self) -> Startup<'static> {
        Startup::deserialize(self.version, &mut &self.body[..]).unwrap()
    }

    pub(crate) fn auth_token(&self) -> Option<Vec<u8>> {
        types::read_bytes_opt(&mut &self.body[..])
            .unwrap()
            .map(<[u8]>::to_vec)
    }
}

/// What the mock node answers with.
#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Ready,
    Supported(Vec<(String, Vec<String>)>),
    Authenticate(String),
    AuthSuccess,
    Void,
    SetKeyspace(String),
    Prepared {
        id: Bytes,
        columns: Vec<(&'static str, ColumnType)>,
    },
    Rows {
        columns: Vec<(&'static str, ColumnType)>,
        rows: Vec<Vec<CqlValue>>,
    },
    Error {
        code: i32,
        message: String,
    },
    Unprepared(Bytes),
    Delayed(Duration, Box<Reply>),
    NoReply,
}

impl Reply {
    pub(crate) fn error(code: i32, message: &str) -> Self {
        Reply::Error {
            code,
            message: message.to_owned(),
        }
    }

    pub(crate) fn text_rows(column: &'static str, values: &[&str]) -> Self {
        Reply::Rows {
            columns: vec![(column, ColumnType::Text)],
            rows: values
                .iter()
                .map(|v| vec![CqlValue::Text((*v).to_owned())])
                .collect(),
        }
    }

    /// The answer of a well-behaved node that has nothing special to say.
    pub(crate) fn default_for(request: &Received) -> Self {
        match request.opcode {
            RequestOpcode::Options => Reply::Supported(vec![
                ("CQL_VERSION".to_owned(), vec!["3.4.5".to_owned()]),
                ("COMPRESSION".to_owned(), vec![]),
            ]),
            RequestOpcode::Startup | RequestOpcode::Register => Reply::Ready,
            RequestOpcode::AuthResponse => Reply::AuthSuccess,
            RequestOpcode::Query => {
                let text = request.query_text().unwrap_or_default();
                match text.strip_prefix("USE ") {
                    Some(keyspace) => Reply::SetKeyspace(keyspace.trim_matches('"').to_owned()),
                    None => Reply::Void,
                }
            }
            RequestOpcode::Prepare => Reply::Prepared {
                id: Bytes::from_static(b"\x00\x01"),
                columns: Vec::new(),
            },
            RequestOpcode::Execute | RequestOpcode::Batch => Reply::Void,
        }
    }

    fn opcode(&self) -> ResponseOpcode {
        match self {
            Reply::Ready => ResponseOpcode::Ready,
            Reply::Supported(_) => ResponseOpcode::Supported,
            Reply::Authenticate(_) => ResponseOpcode::Authenticate,
            Reply::AuthSuccess => ResponseOpcode::AuthSuccess,
            Reply::Error { .. } | Reply::Unprepared(_) => ResponseOpcode::Error,
            _ => ResponseOpcode::Result,
        }
    }

    fn body(&self, version: ProtocolVersion) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            Reply::Ready => {}
            Reply::Supported(options) => types::write_string_multimap(options, &mut body).unwrap(),
            Reply::Authenticate(authenticator) => types::write_string(authenticator, &mut body).unwrap(),
            Reply::AuthSuccess => types::write_int(-1, &mut body),
            Reply::Void => types::write_int(0x0001, &mut body),
            Reply::SetKeyspace(keyspace) => {
                types::write_int(0x0003, &mut body);
                types::write_string(keyspace, &mut body).unwrap();
            }
            Reply::Prepared { id, columns } => {
                types::write_int(0x0004, &mut body);
                types::write_short_bytes(id, &mut body).unwrap();
                types::write_int(0x0001, &mut body);
                types::write_int(columns.len() as i32, &mut body);
                if version >= ProtocolVersion::V4 {
                    types::write_int(0, &mut body);
                }
                write_table_spec(&mut body);
                write_columns(columns, &mut body);
                // No result columns.
                types::write_int(0, &mut body);
                types::write_int(0, &mut body);
            }
            Reply::Rows { columns, rows } => {
                types::write_int(0x0002, &mut body);
                types::write_int(0x0001, &mut body);
                types::write_int(columns.len() as i32, &mut body);
                write_table_spec(&mut body);
                write_columns(columns, &mut body);
                types::write_int(rows.len() as i32, &mut body);
                for row in rows {
                    for (value, (_, typ)) in row.iter().zip(columns) {
                        serialize_value(value, Some(typ), version, &mut body).unwrap();
                    }
                }
            }
            Reply::Error { code, message } => {
                types::write_int(*code, &mut body);
                types::write_string(message, &mut body).unwrap();
            }
            Reply::Unprepared(id) => {
                types::write_int(0x2500, &mut body);
                types::write_string("Prepared statement not found", &mut body).unwrap();
                types::write_short_bytes(id, &mut body).unwrap();
            }
            Reply::Delayed(_, reply) => return reply.body(version),
            Reply::NoReply => {}
        }
        body
    }

    fn frame(&self, version: ProtocolVersion, stream: i16) -> Vec<u8> {
        let body = self.body(version);
        let mut frame = vec![0x80 | version as u8, 0x00];
        match version.stream_id_len() {
            1 => frame.push(stream as i8 as u8),
            _ => frame.extend_from_slice(&stream.to_be_bytes()),
        }
        frame.push(self.opcode() as u8);
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        frame
    }
}

fn write_table_spec(body: &mut Vec<u8>) {
    types::write_string("ks", body).unwrap();
    types::write_string("t", body).unwrap();
}

fn write_columns(columns: &[(&'static str, ColumnType)], body: &mut Vec<u8>) {
    for (name, typ) in columns {
        types::write_string(name, body).unwrap();
        types::write_short(type_id(typ), body);
    }
}

fn type_id(typ: &ColumnType) -> u16 {
    match typ {
        ColumnType::BigInt => 0x0002,
        ColumnType::Blob => 0x0003,
        ColumnType::Boolean => 0x0004,
        ColumnType::Int => 0x0009,
        ColumnType::Uuid => 0x000C,
        ColumnType::Text => 0x000D,
        ColumnType::Inet => 0x0010,
        other => panic!("the mock node cannot describe {other:?}"),
    }
}

/// Metadata the mock node reports for `columns`, for comparing with what the
/// driver decoded.
pub(crate) fn prepared_metadata(columns: &[(&'static str, ColumnType)]) -> PreparedMetadata {
    PreparedMetadata {
        col_count: columns.len(),
        pk_indexes: Vec::new(),
        col_specs: columns
            .iter()
            .map(|(name, typ)| ColumnSpec {
                table_spec: TableSpec {
                    ks_name: "ks".to_owned(),
                    table_name: "t".to_owned(),
                },
                name: (*name).to_owned(),
                typ: typ.clone(),
            })
            .collect(),
    }
}

type Handler = dyn Fn(&Received) -> Option<Reply> + Send + Sync;

/// A single CQL node listening on 127.0.0.1. Requests the handler returns
/// `None` for get [`Reply::default_for`].
pub(crate) struct MockNode {
    address: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    accepted: Arc<AtomicUsize>,
    acceptor: JoinHandle<()>,
}

impl MockNode {
    pub(crate) async fn start() -> Self {
        Self::with_handler(|_| None).await
    }

    pub(crate) async fn with_handler(
        handler: impl Fn(&Received) -> Option<Reply> + Send + Sync + 'static,
    ) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);

        let acceptor = {
            let received = received.clone();
            let accepted = accepted.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let connection = accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        connection,
                        socket,
                        handler.clone(),
                        received.clone(),
                    ));
                }
            })
        };

        MockNode {
            address,
            received,
            accepted,
            acceptor,
        }
    }

    pub(crate) fn port(&self) -> u16 {
        self.address.port()
    }

    pub(crate) fn address(&self) -> SocketAddr {
        self.address
    }

    /// A builder pointed at this node only.
    pub(crate) fn client_builder(&self) -> ClientBuilder {
        ClientBuilder::new()
            .host("127.0.0.1")
            .port(self.port())
            .connection_timeout(Duration::from_secs(2))
            .peer_discovery(Arc::new(NoPeerDiscovery))
    }

    pub(crate) fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub(crate) fn received_of(&self, opcode: RequestOpcode) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|request| request.opcode == opcode)
            .collect()
    }

    pub(crate) fn accepted_connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Waits until some QUERY carrying `text` has arrived.
    pub(crate) async fn wait_for_query(&self, text: &str) {
        loop {
            let arrived = self
                .received()
                .iter()
                .any(|request| request.query_text().as_deref() == Some(text));
            if arrived {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn serve(
    connection: usize,
    socket: TcpStream,
    handler: Arc<Handler>,
    received: Arc<Mutex<Vec<Received>>>,
) {
    let (mut read_half, mut write_half) = socket.into_split();
    let (frames, mut outgoing) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    while let Some((version, stream, opcode, body)) = read_frame(&mut read_half).await {
        let request = Received {
            connection,
            version,
            opcode,
            stream,
            body,
        };
        received.lock().unwrap().push(request.clone());

        let reply = (*handler)(&request).unwrap_or_else(|| Reply::default_for(&request));
        match reply {
            Reply::NoReply => {}
            Reply::Delayed(delay, reply) => {
                let frames = frames.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = frames.send(reply.frame(version, stream));
                });
            }
            reply => {
                let _ = frames.send(reply.frame(version, stream));
            }
        }
    }

    drop(frames);
    let _ = writer.await;
}

async fn read_frame(
    read_half: &mut OwnedReadHalf,
) -> Option<(ProtocolVersion, i16, RequestOpcode, Bytes)> {
    let raw_version = read_half.read_u8().await.ok()?;
    let version = ProtocolVersion::try_from(raw_version & 0x7F).ok()?;
    let _flags = read_half.read_u8().await.ok()?;
    let stream = match version.stream_id_len() {
        1 => i16::from(read_half.read_i8().await.ok()?),
        _ => read_half.read_i16().await.ok()?,
    };
    let opcode = RequestOpcode::try_from(read_half.read_u8().await.ok()?).ok()?;
    let length = read_half.read_u32().await.ok()? as usize;
    let mut body = vec![0u8; length];
    read_half.read_exact(&mut body).await.ok()?;
    Some((version, stream, opcode, body.into()))
}
