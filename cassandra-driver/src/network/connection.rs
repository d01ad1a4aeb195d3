use bytes::Bytes;
use cassandra_cql::frame::compression::Compressor;
use cassandra_cql::frame::frame_errors::CqlRequestSerializationError;
use cassandra_cql::frame::request::startup::{
    COMPRESSION, CQL_VERSION, DEFAULT_CQL_PROTOCOL_VERSION, DEFAULT_DRIVER_NAME,
    DEFAULT_DRIVER_VERSION, DRIVER_NAME, DRIVER_VERSION,
};
use cassandra_cql::frame::request::{
    self, AuthResponse, Execute, Options, Prepare, Query, Register, RequestOpcode,
    SerializableRequest, Startup,
};
use cassandra_cql::frame::response::event::{Event, EventType};
use cassandra_cql::frame::response::result::{self, Prepared};
use cassandra_cql::frame::response::{
    authenticate, NonErrorResponse, Response, ResponseOpcode, Supported,
};
use cassandra_cql::frame::{self, FrameParams, ProtocolVersion, SerializedRequest};
use futures::{future::RemoteHandle, FutureExt};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, ConnectionError, DbError, QueryError,
};
use crate::response::{QueryResponse, QueryResult};

/// Requests allowed in flight on one connection unless configured otherwise.
pub(crate) const DEFAULT_MAX_REQUESTS: usize = 128;

// An orphan is a stream id whose request nobody waits for anymore, because the
// caller timed out or dropped the future. The id stays reserved until the late
// response arrives. A connection holding more than OLD_ORPHAN_COUNT_THRESHOLD
// ids orphaned for longer than OLD_AGE_ORPHAN_THRESHOLD is shut down.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier of a connection. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a connection. `Closed` and `Failed` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closing,
    Closed,
    Failed,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Failed)
    }
}

/// Receives the error that broke the connection, exactly once.
pub(crate) type ErrorReceiver = oneshot::Receiver<BrokenConnectionError>;

type SharedCompressor = Arc<StdMutex<Option<Arc<dyn Compressor>>>>;

#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) connect_timeout: Duration,
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
    pub(crate) cql_version: String,
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) max_requests: usize,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) keyspace: Option<VerifiedKeyspaceName>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) write_coalescing: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            compressor: None,
            cql_version: DEFAULT_CQL_PROTOCOL_VERSION.to_owned(),
            protocol_version: ProtocolVersion::default(),
            max_requests: DEFAULT_MAX_REQUESTS,
            authenticator: None,
            event_sender: None,
            keyspace: None,
            tcp_nodelay: true,
            write_coalescing: true,
        }
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("compressor", &self.compressor)
            .field("cql_version", &self.cql_version)
            .field("protocol_version", &self.protocol_version)
            .field("max_requests", &self.max_requests)
            .field("authenticator", &self.authenticator.is_some())
            .field("event_sender", &self.event_sender.is_some())
            .field("keyspace", &self.keyspace)
            .field("tcp_nodelay", &self.tcp_nodelay)
            .finish()
    }
}

/// One multiplexed CQL connection to a node.
///
/// Requests are handed to a router task which assigns stream ids, writes
/// frames and routes responses back by stream id, so responses may complete
/// in any order. Dropping the `Connection` stops the router.
pub struct Connection {
    _worker_handle: RemoteHandle<()>,

    id: ConnectionId,
    connect_address: SocketAddr,
    version: ProtocolVersion,
    capacity: usize,
    config: ConnectionConfig,
    compressor: SharedCompressor,
    router_handle: Arc<RouterHandle>,
    state: Arc<watch::Sender<ConnectionState>>,
    close_signal: Arc<Notify>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connect_address", &self.connect_address)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

type RequestId = u64;

#[derive(Debug)]
struct ResponseHandler {
    response_sender: oneshot::Sender<Result<QueryResponse, RequestError>>,
    request_id: RequestId,
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

/// Failure of a single request inside the router.
#[derive(Debug)]
enum RequestError {
    Serialization(CqlRequestSerializationError),
    UnableToAllocStreamId,
    BrokenConnection(BrokenConnectionError),
}

// Used to notify `Connection::orphaner` that a `RouterHandle::send_request`
// future was dropped before its response arrived.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(request_id: RequestId, notification_sender: &'a mpsc::UnboundedSender<RequestId>) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    request_id_generator: AtomicU64,
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
    in_flight: AtomicUsize,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, AtomicOrdering::Relaxed);
        InFlightGuard(counter)
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, AtomicOrdering::Relaxed);
    }
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, AtomicOrdering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compressor: Option<&dyn Compressor>,
        version: ProtocolVersion,
        tracing: bool,
    ) -> Result<QueryResponse, RequestError> {
        let serialized_request = SerializedRequest::make(request, version, compressor, tracing)
            .map_err(RequestError::Serialization)?;
        let request_id = self.allocate_request_id();

        let (sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender: sender,
            request_id,
        };

        // Dropping this future orphans the stream id instead of freeing it.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| RequestError::BrokenConnection(BrokenConnectionError::Closed))?;

        let task_response = receiver
            .await
            .map_err(|_| RequestError::BrokenConnection(BrokenConnectionError::Closed))?;

        notifier.disable();

        task_response
    }
}

enum NonErrorStartupResponse {
    Ready,
    Authenticate(authenticate::Authenticate),
}

enum NonErrorAuthResponse {
    AuthChallenge(authenticate::AuthChallenge),
    AuthSuccess(authenticate::AuthSuccess),
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn setup_error(request: RequestOpcode) -> impl FnOnce(QueryError) -> ConnectionError {
    move |error| ConnectionError::Setup { request, error }
}

fn unexpected_response(response: &NonErrorResponse, expected: &str) -> QueryError {
    QueryError::ProtocolError(format!(
        "Unexpected response, expected {}, got {}",
        expected,
        response.name()
    ))
}

impl Connection {
    async fn new(
        addr: SocketAddr,
        config: ConnectionConfig,
        version: ProtocolVersion,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream_connector = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr));
        let stream = match stream_connector.await {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectionError::ConnectTimeout),
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        Ok(Self::from_stream(stream, addr, config, version))
    }

    /// Starts the router over an already established transport.
    pub(crate) fn from_stream(
        stream: impl AsyncRead + AsyncWrite + Send + 'static,
        connect_address: SocketAddr,
        config: ConnectionConfig,
        version: ProtocolVersion,
    ) -> (Self, ErrorReceiver) {
        let id = ConnectionId::next();
        let capacity = config.max_requests.clamp(1, version.max_stream_count());

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        // Unbounded, because the Drop of `OrphanhoodNotifier` can't await.
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            in_flight: AtomicUsize::new(0),
        });
        let compressor: SharedCompressor = Arc::new(StdMutex::new(None));
        let state = Arc::new(watch::Sender::new(ConnectionState::Connecting));
        let close_signal = Arc::new(Notify::new());

        let router = Self::router(RouterParams {
            id,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            capacity,
            compressor: compressor.clone(),
            event_sender: config.event_sender.clone(),
            state: state.clone(),
            close_signal: close_signal.clone(),
            write_coalescing: config.write_coalescing,
        });
        let (task, worker_handle) = router.remote_handle();
        tokio::task::spawn(task);

        debug!(
            connection = %id,
            address = %connect_address,
            %version,
            capacity,
            "Opened connection"
        );

        let connection = Connection {
            _worker_handle: worker_handle,
            id,
            connect_address,
            version,
            capacity,
            config,
            compressor,
            router_handle,
            state,
            close_signal,
        };

        (connection, error_receiver)
    }

    /// A connection over an in-memory pipe, already marked ready.
    #[cfg(test)]
    pub(crate) fn new_for_test(
        config: ConnectionConfig,
        connect_address: SocketAddr,
    ) -> (Self, ErrorReceiver, tokio::io::DuplexStream) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (connection, error_receiver) =
            Self::from_stream(client, connect_address, config, ProtocolVersion::V4);
        connection.state.send_replace(ConnectionState::Ready);
        (connection, error_receiver, server)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.version
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Number of requests that may be in flight at once.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of requests currently waiting for a response.
    pub fn in_flight(&self) -> usize {
        self.router_handle.in_flight.load(AtomicOrdering::Relaxed)
    }

    pub(crate) fn is_compressed(&self) -> bool {
        lock(&self.compressor).is_some()
    }

    /// Sends one request and waits for its response.
    ///
    /// When `timeout` elapses the call fails with [`QueryError::RequestTimeout`].
    /// The stream id stays reserved until the late response arrives, and that
    /// response is dropped.
    pub(crate) async fn send_request<R: SerializableRequest>(
        &self,
        request: &R,
        compress: bool,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResponse, QueryError> {
        match self.state() {
            ConnectionState::Handshaking | ConnectionState::Ready => {}
            state => {
                trace!(connection = %self.id, ?state, "Request refused, connection is not usable");
                return Err(QueryError::BrokenConnection(BrokenConnectionError::Closed));
            }
        }

        let compressor = if compress {
            lock(&self.compressor).clone()
        } else {
            None
        };

        let _in_flight = InFlightGuard::enter(&self.router_handle.in_flight);
        let response_future = self.router_handle.send_request(
            request,
            compressor.as_deref(),
            self.version,
            tracing,
        );

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, response_future).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(
                        connection = %self.id,
                        opcode = %R::OPCODE,
                        ?timeout,
                        "Request timed out, a late response will be discarded"
                    );
                    return Err(QueryError::RequestTimeout(timeout));
                }
            },
            None => response_future.await,
        };

        outcome.map_err(|err| match err {
            RequestError::Serialization(e) => e.into(),
            RequestError::UnableToAllocStreamId => QueryError::ConnectionBusy(self.capacity),
            RequestError::BrokenConnection(e) => QueryError::BrokenConnection(e),
        })
    }

    /// Runs an unprepared statement.
    pub(crate) async fn query(
        &self,
        cql: &str,
        parameters: request::query::QueryParameters<'_>,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, QueryError> {
        let query = Query {
            contents: Cow::Borrowed(cql),
            parameters,
        };
        self.send_request(&query, true, tracing, timeout)
            .await?
            .into_query_result()
    }

    /// Runs `cql` without values, paging or tracing, at the default consistency.
    pub async fn query_unpaged(&self, cql: &str) -> Result<QueryResult, QueryError> {
        self.query(
            cql,
            request::query::QueryParameters::default(),
            false,
            Some(self.config.connect_timeout),
        )
        .await
    }

    /// Prepares `cql` on this connection only.
    pub(crate) async fn prepare(
        &self,
        cql: &str,
        timeout: Option<Duration>,
    ) -> Result<Prepared, QueryError> {
        let response = self
            .send_request(
                &Prepare {
                    query: Cow::Borrowed(cql),
                },
                true,
                false,
                timeout,
            )
            .await?
            .into_non_error_query_response()?;

        match response.response {
            NonErrorResponse::Result(result::Result::Prepared(prepared)) => {
                trace!(connection = %self.id, cql, "Statement prepared");
                Ok(prepared)
            }
            other => Err(unexpected_response(&other, "RESULT::Prepared")),
        }
    }

    pub(crate) async fn execute(
        &self,
        id: Bytes,
        parameters: request::query::QueryParameters<'_>,
        tracing: bool,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, QueryError> {
        let execute = Execute { id, parameters };
        self.send_request(&execute, true, tracing, timeout)
            .await?
            .into_query_result()
    }

    pub(crate) async fn batch(
        &self,
        batch: &request::Batch,
        timeout: Option<Duration>,
    ) -> Result<QueryResult, QueryError> {
        self.send_request(batch, true, batch.trace, timeout)
            .await?
            .into_query_result()
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), QueryError> {
        // Bound values are not accepted in USE
        let contents = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        };
        let response = self
            .send_request(
                &Query {
                    contents: Cow::Owned(contents),
                    parameters: Default::default(),
                },
                true,
                false,
                Some(self.config.connect_timeout),
            )
            .await?
            .into_non_error_query_response()?;

        match response.as_set_keyspace() {
            Some(set_keyspace)
                if keyspace_name.matches(&set_keyspace.keyspace_name) =>
            {
                Ok(())
            }
            Some(set_keyspace) => Err(QueryError::ProtocolError(format!(
                "USE {} answered with keyspace {}",
                keyspace_name.as_str(),
                set_keyspace.keyspace_name
            ))),
            None => Err(unexpected_response(&response.response, "RESULT::SetKeyspace")),
        }
    }

    /// Shuts the connection down and waits for the router to stop. Pending
    /// requests fail with [`BrokenConnectionError::Closed`].
    pub async fn close(&self) {
        let closing = self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == ConnectionState::Closing {
                false
            } else {
                *state = ConnectionState::Closing;
                true
            }
        });
        if closing {
            debug!(connection = %self.id, "Closing connection");
            self.close_signal.notify_one();
        }

        let mut state = self.state.subscribe();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    async fn get_options(&self) -> Result<Supported, ConnectionError> {
        let response = self
            .send_request(&Options, false, false, Some(self.config.connect_timeout))
            .await
            .and_then(QueryResponse::into_non_error_query_response)
            .map_err(setup_error(RequestOpcode::Options))?;

        match response.response {
            NonErrorResponse::Supported(supported) => Ok(supported),
            other => Err(setup_error(RequestOpcode::Options)(unexpected_response(
                &other,
                "SUPPORTED",
            ))),
        }
    }

    async fn startup(
        &self,
        options: HashMap<Cow<'_, str>, Cow<'_, str>>,
    ) -> Result<NonErrorStartupResponse, ConnectionError> {
        let response = self
            .send_request(&Startup { options }, false, false, Some(self.config.connect_timeout))
            .await
            .and_then(QueryResponse::into_non_error_query_response)
            .map_err(setup_error(RequestOpcode::Startup))?;

        match response.response {
            NonErrorResponse::Ready => Ok(NonErrorStartupResponse::Ready),
            NonErrorResponse::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            other => Err(setup_error(RequestOpcode::Startup)(unexpected_response(
                &other,
                "READY or AUTHENTICATE",
            ))),
        }
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionError> {
        let response = self
            .send_request(
                &AuthResponse { response },
                false,
                false,
                Some(self.config.connect_timeout),
            )
            .await
            .and_then(QueryResponse::into_non_error_query_response)
            .map_err(setup_error(RequestOpcode::AuthResponse))?;

        match response.response {
            NonErrorResponse::AuthSuccess(s) => Ok(NonErrorAuthResponse::AuthSuccess(s)),
            NonErrorResponse::AuthChallenge(c) => Ok(NonErrorAuthResponse::AuthChallenge(c)),
            other => Err(setup_error(RequestOpcode::AuthResponse)(unexpected_response(
                &other,
                "AUTH_CHALLENGE or AUTH_SUCCESS",
            ))),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &authenticate::Authenticate,
    ) -> Result<(), ConnectionError> {
        let authenticator = &authenticate.authenticator_name;
        let provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| ConnectionError::MissingAuthentication(authenticator.clone()))?;

        let (mut response, mut auth_session) = provider
            .start_authentication_session(authenticator)
            .await
            .map_err(ConnectionError::AuthenticationFailed)?;

        loop {
            match self.authenticate_response(response).await? {
                NonErrorAuthResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                }
                NonErrorAuthResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionError::AuthenticationFailed)?;
                    debug!(connection = %self.id, authenticator, "Authenticated");
                    return Ok(());
                }
            }
        }
    }

    async fn register(&self, event_types_to_register_for: Vec<EventType>) -> Result<(), ConnectionError> {
        let response = self
            .send_request(
                &Register {
                    event_types_to_register_for,
                },
                true,
                false,
                Some(self.config.connect_timeout),
            )
            .await
            .and_then(QueryResponse::into_non_error_query_response)
            .map_err(setup_error(RequestOpcode::Register))?;

        match response.response {
            NonErrorResponse::Ready => Ok(()),
            other => Err(setup_error(RequestOpcode::Register)(unexpected_response(
                &other, "READY",
            ))),
        }
    }

    /// OPTIONS, STARTUP, authentication, then the optional REGISTER and USE.
    async fn handshake(&self) -> Result<(), ConnectionError> {
        self.state.send_replace(ConnectionState::Handshaking);

        let supported = self.get_options().await?;

        let mut options = HashMap::new();
        options.insert(
            Cow::Borrowed(CQL_VERSION),
            Cow::Borrowed(self.config.cql_version.as_str()),
        );
        options.insert(Cow::Borrowed(DRIVER_NAME), Cow::Borrowed(DEFAULT_DRIVER_NAME));
        options.insert(
            Cow::Borrowed(DRIVER_VERSION),
            Cow::Borrowed(DEFAULT_DRIVER_VERSION),
        );

        let negotiated = match &self.config.compressor {
            Some(compressor) if supported.supports_compression(compressor.algorithm()) => {
                options.insert(
                    Cow::Borrowed(COMPRESSION),
                    Cow::Borrowed(compressor.algorithm()),
                );
                Some(compressor.clone())
            }
            Some(compressor) => {
                warn!(
                    connection = %self.id,
                    algorithm = compressor.algorithm(),
                    %supported,
                    "Compression is not supported by the server, continuing uncompressed"
                );
                None
            }
            None => None,
        };
        let compression_name = negotiated.as_ref().map(|c| c.algorithm().to_owned());

        let startup_response = self.startup(options).await?;
        // Every frame after STARTUP may be compressed.
        *lock(&self.compressor) = negotiated;

        match startup_response {
            NonErrorStartupResponse::Ready => {}
            NonErrorStartupResponse::Authenticate(authenticate) => {
                self.perform_authenticate(&authenticate).await?;
            }
        }

        if self.config.event_sender.is_some() {
            self.register(vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ])
            .await?;
        }

        if let Some(keyspace) = &self.config.keyspace {
            self.use_keyspace(keyspace)
                .await
                .map_err(setup_error(RequestOpcode::Query))?;
        }

        self.state.send_replace(ConnectionState::Ready);
        info!(
            connection = %self.id,
            address = %self.connect_address,
            version = %self.version,
            compression = compression_name.as_deref().unwrap_or("none"),
            "Connection ready"
        );
        Ok(())
    }

    async fn router(params: RouterParams<impl AsyncRead + AsyncWrite>) {
        let RouterParams {
            id,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            capacity,
            compressor,
            event_sender,
            state,
            close_signal,
            write_coalescing,
        } = params;

        let (read_half, write_half) = split(stream);
        // Reader, writer and orphaner run on one task and never hold the lock
        // across an await, so it is uncontended.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(capacity));

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            event_sender,
            &compressor,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
            write_coalescing,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver);
        let c = async {
            close_signal.notified().await;
            Err::<(), _>(BrokenConnectionError::Closed)
        };

        let error = match futures::try_join!(r, w, o, c) {
            Ok(_) => BrokenConnectionError::Closed,
            Err(err) => err,
        };

        let response_handlers = handler_map
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_handlers();
        let pending = response_handlers.len();
        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler
                .response_sender
                .send(Err(RequestError::BrokenConnection(error.clone())));
        }

        let final_state = match error {
            BrokenConnectionError::Closed => {
                debug!(connection = %id, pending, "Connection closed");
                ConnectionState::Closed
            }
            ref err => {
                warn!(connection = %id, pending, error = %err, "Connection broken");
                ConnectionState::Failed
            }
        };
        state.send_replace(final_state);

        // If someone is listening for connection errors notify them
        let _ = error_sender.send(error);
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        event_sender: Option<mpsc::Sender<Event>>,
        compressor: &SharedCompressor,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half).await?;
            let frame_compressor = lock(compressor).clone();

            match params.stream.cmp(&-1) {
                Ordering::Less => {
                    // Only -1 carries events, other negative streams are unused.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(params, opcode, body, frame_compressor.as_deref(), event_sender)
                            .await?;
                    }
                    continue;
                }
                _ => {}
            }

            let handler_lookup_res = lock(handler_map).lookup(params.stream);

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    match parse_response(params, opcode, body, frame_compressor.as_deref()) {
                        Ok(response) => {
                            // The receiver may already be gone, that's fine.
                            let _ = handler.response_sender.send(Ok(response));
                        }
                        Err(err) => {
                            error!(stream = params.stream, error = %err, "Malformed response");
                            let _ = handler
                                .response_sender
                                .send(Err(RequestError::BrokenConnection(err.clone())));
                            return Err(err);
                        }
                    }
                }
                HandlerLookupResult::Missing => {
                    // Unsolicited frame, a bug in the driver or the database
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(BrokenConnectionError::UnexpectedStreamId(params.stream));
                }
                HandlerLookupResult::Orphaned => {
                    trace!(
                        stream = params.stream,
                        ?opcode,
                        "Discarding late response of an abandoned request"
                    );
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        match lock(handler_map).allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                debug!("Could not allocate stream id, connection is busy");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
        write_coalescing: bool,
    ) -> Result<(), BrokenConnectionError> {
        // Returns once every `RouterHandle` sender is gone.
        while let Some(task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            let mut next = Some(task);
            while let Some(task) = next.take() {
                if let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    let req_data: &[u8] = req.get_data();
                    total_sent += req_data.len();
                    num_requests += 1;
                    write_half
                        .write_all(req_data)
                        .await
                        .map_err(|e| BrokenConnectionError::WriteError(Arc::new(e)))?;
                }
                next = match task_receiver.try_recv() {
                    Ok(t) => Some(t),
                    Err(_) if write_coalescing => {
                        tokio::task::yield_now().await;
                        task_receiver.try_recv().ok()
                    }
                    Err(_) => None,
                };
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(|e| BrokenConnectionError::WriteError(Arc::new(e)))?;
        }

        Ok(())
    }

    // Receives notifications from `OrphanhoodNotifier`s and marks streams as
    // orphaned. Breaks the connection once too many orphans got old.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = lock(handler_map).old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!("Too many old orphaned stream ids: {}", old_orphan_count);
                        return Err(BrokenConnectionError::TooManyOrphanedStreamIds(
                            u16::try_from(old_orphan_count).unwrap_or(u16::MAX),
                        ));
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!("Trying to orphan stream id associated with request_id = {}", request_id);
                    lock(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn handle_event(
        params: FrameParams,
        opcode: ResponseOpcode,
        body: Bytes,
        compressor: Option<&dyn Compressor>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), BrokenConnectionError> {
        let response = parse_response(params, opcode, body, compressor)?;
        let event = match response.response {
            Response::Event(event) => event,
            other => {
                error!("Expected to receive Event response, got {}", other.name());
                return Err(BrokenConnectionError::UnexpectedEventResponse(other.name()));
            }
        };

        trace!(?event, "Received event");
        event_sender
            .send(event)
            .await
            .map_err(|_| BrokenConnectionError::EventChannelClosed)
    }
}

struct RouterParams<S> {
    id: ConnectionId,
    stream: S,
    receiver: mpsc::Receiver<Task>,
    error_sender: oneshot::Sender<BrokenConnectionError>,
    orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
    capacity: usize,
    compressor: SharedCompressor,
    event_sender: Option<mpsc::Sender<Event>>,
    state: Arc<watch::Sender<ConnectionState>>,
    close_signal: Arc<Notify>,
    write_coalescing: bool,
}

/// Strips the frame extensions and decodes the body. Failures are fatal to
/// the connection.
fn parse_response(
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
    compressor: Option<&dyn Compressor>,
) -> Result<QueryResponse, BrokenConnectionError> {
    let body_with_ext = frame::parse_response_body_extensions(params.flags, compressor, body)?;

    for warn_description in &body_with_ext.warnings {
        warn!(
            warning = warn_description.as_str(),
            "Response from the database contains a warning",
        );
    }

    let response = Response::deserialize(params.version, opcode, &mut &body_with_ext.body[..])
        .map_err(|error| BrokenConnectionError::ResponseParseError {
            stream: params.stream,
            opcode,
            error,
        })?;

    Ok(QueryResponse {
        response,
        tracing_id: body_with_ext.trace_id,
        warnings: body_with_ext.warnings,
    })
}

fn is_version_rejection(err: &ConnectionError) -> bool {
    matches!(
        err,
        ConnectionError::Setup {
            request: RequestOpcode::Options | RequestOpcode::Startup,
            error: QueryError::DbError(DbError::ProtocolError, _),
        }
    )
}

/// Connects to `addr` and performs the handshake.
///
/// A protocol error in answer to the first requests is taken as a rejection of
/// the protocol version, and the connection is retried with the next lower
/// version.
pub(crate) async fn open_connection(
    addr: SocketAddr,
    config: ConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let mut version = config.protocol_version;
    loop {
        let (connection, error_receiver) = Connection::new(addr, config.clone(), version).await?;
        let err = match connection.handshake().await {
            Ok(()) => return Ok((connection, error_receiver)),
            Err(err) => err,
        };
        connection.close().await;

        if !is_version_rejection(&err) {
            warn!(address = %addr, error = %err, "Connection setup failed");
            return Err(err);
        }
        match version.downgrade() {
            Some(lower) => {
                info!(address = %addr, rejected = %version, retrying = %lower, "Server rejected protocol version");
                version = lower;
            }
            None => return Err(ConnectionError::ProtocolVersionRejected(version)),
        }
    }
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) -> bool {
        match self.orphans.remove(&stream_id) {
            Some(time) => {
                self.by_orphaning_times.remove(&(time, stream_id));
                true
            }
            None => false,
        }
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        match Instant::now().checked_sub(age) {
            Some(minimal_age) => self
                .by_orphaning_times
                .range(..(minimal_age, i16::MAX))
                .count(),
            None => 0,
        }
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
}

#[derive(Debug)]
enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(capacity: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(capacity),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Moves the stream of `request_id` to the orphanage and drops its handler.
    // The stream id is freed only when its response shows up.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphanage_tracker.remove(stream_id) {
            self.stream_set.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        match self.handlers.remove(&stream_id) {
            Some(handler) => {
                // A late orphan notification must not hit a reused stream id.
                self.request_to_stream.remove(&handler.request_id);
                self.stream_set.free(stream_id);
                HandlerLookupResult::Handler(handler)
            }
            None => HandlerLookupResult::Missing,
        }
    }

    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of the stream ids in `0..capacity`.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    capacity: usize,
}

impl StreamIdSet {
    fn new(capacity: usize) -> Self {
        Self {
            used_bitmap: vec![0; capacity.div_ceil(64)].into_boxed_slice(),
            capacity,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                if stream_id >= self.capacity {
                    return None;
                }
                *block |= 1u64 << off;
                return i16::try_from(stream_id).ok();
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let Ok(stream_id) = usize::try_from(stream_id) else {
            return;
        };
        let Some(block) = self.used_bitmap.get_mut(stream_id / 64) else {
            return;
        };
        *block &= !(1u64 << (stream_id % 64));
    }
}

/// A keyspace name checked to be valid in `USE`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(keyspace_name: String, case_sensitive: bool) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Unquoted names are folded to lower case by the server.
    fn matches(&self, reported: &str) -> bool {
        match self.is_case_sensitive {
            true => reported == self.as_str(),
            false => reported.eq_ignore_ascii_case(self.as_str()),
        }
    }

    // Up to 48 alphanumeric characters or underscores.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let keyspace_name_len: usize = keyspace_name.chars().count();
        if keyspace_name_len > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name_len,
            ));
        }

        for character in keyspace_name.chars() {
            match character {
                'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => {}
                _ => {
                    return Err(BadKeyspaceName::IllegalCharacter(
                        keyspace_name.to_string(),
                        character,
                    ))
                }
            };
        }

        Ok(())
    }
}
