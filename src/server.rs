/// Implementation of the PostgreSQL server (database) protocol.
/// Here we are pretending to be a Postgres client.
use bytes::{Buf, BufMut, BytesMut};
use log::{error, info, warn};
use once_cell::sync::Lazy;
use std::collections::{HashMap, HashSet};
use std::mem;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufStream};
use tokio::net::{TcpStream, UnixStream};
use tokio_native_tls::TlsStream;

use crate::auth::scram::ScramSha256;
use crate::config::VERSION;
use crate::constants::*;
use crate::errors::{Error, ServerIdentifier};
use crate::messages::*;
use crate::pool::{RouteKey, RouteSettings};
use crate::stats::{RouteStats, ServerStats};
use pin_project_lite::pin_project;

const COMMAND_COMPLETE_BY_SET: &[u8; 4] = b"SET\0";
const COMMAND_COMPLETE_BY_DECLARE: &[u8; 15] = b"DECLARE CURSOR\0";
const COMMAND_COMPLETE_BY_DISCARD_ALL: &[u8; 12] = b"DISCARD ALL\0";

static NEXT_SERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Ids are never reused for the life of the process.
pub fn next_server_id() -> u64 {
    NEXT_SERVER_ID.fetch_add(1, Ordering::Relaxed)
}

pin_project! {
    #[project = StreamInnerProj]
    #[derive(Debug)]
    pub enum StreamInner {
        TCPPlain {
            #[pin]
            stream: TcpStream,
        },
        TCPTls {
            #[pin]
            stream: TlsStream<TcpStream>,
        },
        UnixSocket {
            #[pin]
            stream: UnixStream,
        },
    }
}

impl AsyncWrite for StreamInner {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<Result<usize, std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::TCPTls { stream } => stream.poll_write(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_flush(cx),
            StreamInnerProj::TCPTls { stream } => stream.poll_flush(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), std::io::Error>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::TCPTls { stream } => stream.poll_shutdown(cx),
            StreamInnerProj::UnixSocket { stream } => stream.poll_shutdown(cx),
        }
    }
}

impl AsyncRead for StreamInner {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.project() {
            StreamInnerProj::TCPPlain { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::TCPTls { stream } => stream.poll_read(cx, buf),
            StreamInnerProj::UnixSocket { stream } => stream.poll_read(cx, buf),
        }
    }
}

impl StreamInner {
    /// Non-blocking write, used from Drop. A TLS stream cannot be written
    /// to without polling.
    pub fn try_write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            StreamInner::TCPPlain { stream } => stream.try_write(buf),
            StreamInner::TCPTls { .. } => Err(std::io::Error::from(
                std::io::ErrorKind::Unsupported,
            )),
            StreamInner::UnixSocket { stream } => stream.try_write(buf),
        }
    }

    fn is_tls(&self) -> bool {
        matches!(self, StreamInner::TCPTls { .. })
    }
}

/// Lifecycle of a backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Connecting,
    Authenticating,
    Idle,
    Active,
    Expired,
    Closed,
}

impl std::fmt::Display for BackendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match self {
            BackendState::Connecting => "connecting",
            BackendState::Authenticating => "authenticating",
            BackendState::Idle => "idle",
            BackendState::Active => "active",
            BackendState::Expired => "expired",
            BackendState::Closed => "closed",
        };
        write!(f, "{state}")
    }
}

#[derive(Copy, Clone, Debug, Default)]
struct CleanupState {
    /// RESET ALL is needed because of a SET statement.
    needs_cleanup_set: bool,

    /// CLOSE ALL is needed because of a DECLARE statement.
    needs_cleanup_declare: bool,
}

impl CleanupState {
    #[inline(always)]
    fn needs_cleanup(&self) -> bool {
        self.needs_cleanup_set || self.needs_cleanup_declare
    }

    #[inline(always)]
    fn set_true(&mut self) {
        self.needs_cleanup_set = true;
        self.needs_cleanup_declare = true;
    }

    #[inline(always)]
    fn reset(&mut self) {
        self.needs_cleanup_set = false;
        self.needs_cleanup_declare = false;
    }
}

impl std::fmt::Display for CleanupState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SET: {}, DECLARE: {}",
            self.needs_cleanup_set, self.needs_cleanup_declare
        )
    }
}

static TRACKED_PARAMETERS: Lazy<HashSet<String>> = Lazy::new(|| {
    let mut set = HashSet::new();
    set.insert("client_encoding".to_string());
    set.insert("DateStyle".to_string());
    set.insert("TimeZone".to_string());
    set.insert("standard_conforming_strings".to_string());
    set.insert("application_name".to_string());
    set
});

#[derive(Debug, Clone, Default)]
pub struct ServerParameters {
    parameters: HashMap<String, String>,
}

impl ServerParameters {
    pub fn new() -> Self {
        ServerParameters {
            parameters: HashMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }

    /// Parameters reported to console sessions.
    pub fn admin() -> Self {
        let mut server_parameters = ServerParameters::new();

        server_parameters.set_param("client_encoding".to_string(), "UTF8".to_string(), false);
        server_parameters.set_param("DateStyle".to_string(), "ISO, MDY".to_string(), false);
        server_parameters.set_param("TimeZone".to_string(), "Etc/UTC".to_string(), false);
        server_parameters.set_param("server_version".to_string(), VERSION.to_string(), true);
        server_parameters.set_param("server_encoding".to_string(), "UTF-8".to_string(), true);
        server_parameters.set_param(
            "standard_conforming_strings".to_string(),
            "on".to_string(),
            false,
        );
        server_parameters.set_param("integer_datetimes".to_string(), "on".to_string(), false);
        server_parameters.set_param(
            "application_name".to_string(),
            "pg_router".to_string(),
            false,
        );

        server_parameters
    }

    /// Outside of startup only tracked parameters are kept.
    pub fn set_param(&mut self, mut key: String, value: String, startup: bool) {
        // The startup parameter will send uncapitalized keys but parameter status packets will send capitalized keys
        if key == "timezone" {
            key = "TimeZone".to_string();
        } else if key == "datestyle" {
            key = "DateStyle".to_string();
        };

        if TRACKED_PARAMETERS.contains(&key) || startup {
            self.parameters.insert(key, value);
        }
    }

    pub fn set_from_hashmap(&mut self, parameters: HashMap<String, String>, startup: bool) {
        for (key, value) in parameters {
            self.set_param(key, value, startup);
        }
    }

    /// Tracked parameters whose incoming value differs from ours.
    #[inline(always)]
    fn compare_params(&self, incoming_parameters: &ServerParameters) -> HashMap<String, String> {
        let mut diff = HashMap::new();

        for key in TRACKED_PARAMETERS.iter() {
            if let Some(incoming_value) = incoming_parameters.parameters.get(key) {
                if let Some(value) = self.parameters.get(key) {
                    if value != incoming_value {
                        diff.insert(key.to_string(), incoming_value.to_string());
                    }
                }
            }
        }

        diff
    }

    pub fn get_application_name(&self) -> &str {
        self.parameters
            .get("application_name")
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn as_pairs(&self) -> Vec<(String, String)> {
        self.parameters
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// One session to the real database.
#[derive(Debug)]
pub struct Server {
    id: u64,

    route: RouteKey,
    host: String,
    port: u16,

    stream: BufStream<StreamInner>,

    /// Our server response buffer. We buffer data before we give it to the client.
    buffer: BytesMut,

    /// Server information the server sent us over on startup.
    server_parameters: ServerParameters,

    /// Backend id and secret key used for query cancellation.
    process_id: i32,
    secret_key: i32,

    /// Status byte of the last ReadyForQuery.
    transaction_status: TransactionStatus,

    /// Is there more data for the client to read.
    data_available: bool,

    /// Replies still owed for messages sent with Flush instead of Sync.
    /// None while waiting for ReadyForQuery.
    flush_replies: Option<usize>,

    in_copy_mode: bool,

    /// Is the server broken? We'll remove it from the pool if so.
    bad: bool,

    state: BackendState,

    /// Message of the last ErrorResponse in the current exchange.
    last_error: Option<String>,

    cleanup_state: CleanupState,

    connected_at: chrono::NaiveDateTime,
    created_at: Instant,

    /// Last time that a successful server send or response happened
    last_activity: Instant,

    pub stats: Arc<ServerStats>,

    application_name: String,

    /// Should clean up dirty connections?
    cleanup_connections: bool,

    reset_query: Option<String>,

    /// DataRows larger than this are streamed straight to the client.
    max_message_size: i32,
    proxy_copy_data_timeout: Duration,
}

impl std::fmt::Display for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "[#{}][{}]-{}@{}:{}/{}",
            self.id,
            self.process_id,
            self.route.user,
            self.host,
            self.port,
            self.route.database
        )
    }
}

impl Server {
    /// Execute an arbitrary query against the server with the simple query protocol.
    /// Result rows are discarded, an ErrorResponse turns into `ServerResetError`.
    pub async fn small_simple_query(&mut self, query: &str) -> Result<(), Error> {
        let query = simple_query(query);

        self.send_and_flush(&query).await?;

        let mut noop = tokio::io::sink();
        loop {
            self.recv(&mut noop, None).await?;

            if !self.data_available {
                break;
            }
        }

        match self.last_error.take() {
            Some(message) => Err(Error::ServerResetError(message)),
            None => Ok(()),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline(always)]
    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    #[inline(always)]
    pub fn get_process_id(&self) -> i32 {
        self.process_id
    }

    #[inline(always)]
    pub fn secret_key(&self) -> i32 {
        self.secret_key
    }

    #[inline(always)]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline(always)]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline(always)]
    pub fn server_parameters_as_hashmap(&self) -> HashMap<String, String> {
        self.server_parameters.parameters.clone()
    }

    #[inline(always)]
    pub fn state(&self) -> BackendState {
        self.state
    }

    pub fn set_state(&mut self, state: BackendState) {
        self.state = state;
    }

    /// Receive data from the server in response to a client request.
    /// This method must be called multiple times while `self.is_data_available()` is true
    /// in order to receive all data the server has to offer.
    pub async fn recv<C>(
        &mut self,
        mut client_stream: C,
        mut client_server_parameters: Option<&mut ServerParameters>,
    ) -> Result<BytesMut, Error>
    where
        C: tokio::io::AsyncWrite + std::marker::Unpin,
    {
        loop {
            self.stats.wait_reading();
            let (code_u8, message_len) = match read_message_header(&mut self.stream).await {
                Ok(header) => header,
                Err(err) => {
                    self.mark_bad(err.to_string().as_str());
                    return Err(err);
                }
            };

            // Big rows go straight to the client.
            if self.max_message_size > 0
                && message_len > self.max_message_size
                && code_u8 as char == 'D'
            {
                self.buffer.put_u8(code_u8);
                self.buffer.put_i32(message_len);
                if let Err(err) = write_all_flush(&mut client_stream, &self.buffer).await {
                    self.mark_bad("write to client while streaming a row");
                    return Err(err);
                }
                if let Err(err) = proxy_copy_data_with_timeout(
                    self.proxy_copy_data_timeout,
                    &mut self.stream,
                    &mut client_stream,
                    message_len as usize - mem::size_of::<i32>(),
                )
                .await
                {
                    self.mark_bad(err.to_string().as_str());
                    return Err(err);
                }
                self.stats
                    .data_received(self.buffer.len() + message_len as usize);
                self.last_activity = Instant::now();
                self.data_available = true;
                self.buffer.clear();
                self.stats.wait_idle();
                return Ok(BytesMut::new());
            }
            if message_len > MAX_MESSAGE_SIZE {
                error!(
                    "Terminating server {} because of: {:?}",
                    self,
                    Error::MaxMessageSize
                );
                self.mark_bad("by MAX_MESSAGE_SIZE");
                return Err(Error::MaxMessageSize);
            }

            let mut message = match read_message_data(&mut self.stream, code_u8, message_len).await
            {
                Ok(message) => {
                    self.stats.wait_idle();
                    message
                }
                Err(err) => {
                    error!("Terminating server {} because of: {:?}", self, err);
                    self.mark_bad(err.to_string().as_str());
                    return Err(err);
                }
            };

            // Buffer the message we'll forward to the client later.
            self.buffer.put(&message[..]);

            let code = message.get_u8() as char;
            let _len = message.get_i32();

            match code {
                // ReadyForQuery
                'Z' => {
                    let status = if message.has_remaining() {
                        message.get_u8()
                    } else {
                        0
                    };
                    match TransactionStatus::from_byte(status) {
                        Ok(status) => self.transaction_status = status,
                        Err(err) => {
                            self.mark_bad(err.to_string().as_str());
                            return Err(err);
                        }
                    }

                    // There is no more data available from the server.
                    self.data_available = false;
                    self.flush_replies = None;
                    break;
                }

                // ErrorResponse
                'E' => {
                    match PgErrorMsg::parse(&message) {
                        Ok(msg) => {
                            warn!(
                                "Server {}: {} ({}) - {}",
                                self, msg.severity, msg.code, msg.message
                            );
                            self.last_error = Some(msg.to_string());
                        }
                        Err(_) => self.last_error = Some("unparsed error".to_string()),
                    }
                    self.stats.error();
                    self.in_copy_mode = false;
                }

                // CommandComplete
                'C' => {
                    self.in_copy_mode = false;
                    // SET and SET LOCAL look the same here, both need a reset.
                    if message.len() == 4 && message[..] == COMMAND_COMPLETE_BY_SET[..] {
                        self.cleanup_state.needs_cleanup_set = true;
                    }
                    if message.len() == 15 && message[..] == COMMAND_COMPLETE_BY_DECLARE[..] {
                        self.cleanup_state.needs_cleanup_declare = true;
                    }
                    if message.len() == 12 && message[..] == COMMAND_COMPLETE_BY_DISCARD_ALL[..]
                    {
                        self.cleanup_state.reset();
                    }
                }

                // ParameterStatus
                'S' => {
                    let key = message.read_string()?;
                    let value = message.read_string()?;

                    if let Some(client_server_parameters) = client_server_parameters.as_mut() {
                        client_server_parameters.set_param(key.clone(), value.clone(), false);
                    }

                    self.server_parameters.set_param(key, value, false);
                }

                // DataRow
                'D' => {
                    // More data is available after this message, this is not the end of the reply.
                    self.data_available = true;

                    // Don't flush yet, the more we buffer, the faster this goes...up to a limit.
                    if self.buffer.len() >= 8196 {
                        break;
                    }
                }

                // CopyInResponse: copy is starting from client to server.
                'G' => {
                    self.in_copy_mode = true;
                    break;
                }

                // CopyOutResponse: copy is starting from the server to the client.
                'H' => {
                    self.in_copy_mode = true;
                    self.data_available = true;
                    break;
                }

                // CopyData
                'd' => {
                    if self.buffer.len() >= 8196 {
                        break;
                    }
                }

                // CopyDone, notices, row descriptions and the rest:
                // keep buffering until ReadyForQuery shows up.
                _ => (),
            };

            // After a Flush there is no ReadyForQuery: stop once every
            // flushed message got its reply. An error skips the rest.
            if let Some(pending) = self.flush_replies {
                let pending = match code {
                    'E' => 0,
                    '1' | '2' | '3' | 'T' | 'n' | 'C' | 'I' | 's' => pending.saturating_sub(1),
                    _ => pending,
                };
                if pending == 0 {
                    self.flush_replies = None;
                    self.data_available = false;
                    break;
                }
                self.flush_replies = Some(pending);
            }
        }

        let bytes = self.buffer.split();

        self.stats.data_received(bytes.len());

        if self.buffer.capacity() > 4 * 8196 {
            self.buffer = BytesMut::with_capacity(8196);
        }

        self.last_activity = Instant::now();

        Ok(bytes)
    }

    pub async fn send_and_flush(&mut self, messages: &[u8]) -> Result<(), Error> {
        if !self.data_available {
            self.last_error = None;
        }
        self.stats.data_sent(messages.len());
        self.stats.wait_writing();

        match write_all_flush(&mut self.stream, messages).await {
            Ok(_) => {
                self.stats.wait_idle();
                self.last_activity = Instant::now();
                Ok(())
            }
            Err(err) => {
                self.stats.wait_idle();
                error!("Terminating server {} because of: {:?}", self, err);
                self.mark_bad("flush to server error");
                Err(err)
            }
        }
    }

    /// The next `recv` calls return once `replies` extended protocol replies
    /// arrived instead of waiting for ReadyForQuery.
    pub fn expect_flush_replies(&mut self, replies: usize) {
        self.flush_replies = (replies > 0).then_some(replies);
    }

    /// Drain whatever the server still has for the current exchange.
    pub async fn wait_available(&mut self) {
        if !self.is_data_available() {
            self.stats.wait_idle();
            return;
        }
        warn!("Reading available data from server: {}", self);
        while self.is_data_available() {
            if let Err(err) = self.recv(&mut tokio::io::sink(), None).await {
                error!("Server {} while reading available data: {:?}", self, err);
                break;
            }
        }
        self.stats.wait_idle();
    }

    /// Indicate that this server connection cannot be re-used and must be discarded.
    pub fn mark_bad(&mut self, reason: &str) {
        if !self.bad {
            error!("Server {} marked bad, reason: {}", self, reason);
        }
        self.bad = true;
        self.state = BackendState::Expired;
    }

    #[inline(always)]
    pub fn is_bad(&self) -> bool {
        self.bad
    }

    #[inline(always)]
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// If the server is still inside a transaction.
    #[inline(always)]
    pub fn in_transaction(&self) -> bool {
        self.transaction_status.in_transaction()
    }

    #[inline(always)]
    pub fn in_copy_mode(&self) -> bool {
        self.in_copy_mode
    }

    /// We don't buffer all of server responses, e.g. COPY OUT produces too much data.
    /// The client is responsible to call `self.recv()` while this method returns true.
    #[inline(always)]
    pub fn is_data_available(&self) -> bool {
        self.data_available
    }

    /// Marks a connection as needing cleanup at checkin
    pub fn mark_dirty(&mut self) {
        self.cleanup_state.set_true();
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }

    /// Perform any necessary cleanup before putting the server
    /// connection back in the pool. Any failure leaves the server marked bad.
    pub async fn checkin_cleanup(&mut self) -> Result<(), Error> {
        if self.bad {
            return Err(Error::BackendExpired);
        }
        if self.in_copy_mode() {
            self.mark_bad("returned in copy-mode");
            return Err(Error::ProtocolSyncError(format!(
                "server {self} returned in copy-mode"
            )));
        }
        if self.is_data_available() {
            self.mark_bad("returned with data available");
            return Err(Error::ProtocolSyncError(format!(
                "server {self} returned with data available"
            )));
        }

        // The client left with an open transaction: roll it back
        // instead of closing the connection.
        if self.in_transaction() {
            warn!(
                "Server {} returned while still in transaction, rolling back transaction",
                self
            );
            if let Err(err) = self.small_simple_query("ROLLBACK").await {
                self.mark_bad("rollback failed");
                return Err(Error::ServerResetError(err.to_string()));
            }
            if self.in_transaction() {
                self.mark_bad("still in transaction after rollback");
                return Err(Error::ServerResetError(
                    "transaction is still open after ROLLBACK".to_string(),
                ));
            }
        }

        // Session-altering statements were seen, clear them so they do not
        // leak to the next client.
        if self.cleanup_state.needs_cleanup() && self.cleanup_connections {
            info!(
                "Server {} returned with session state altered, discarding state ({}) for application {}",
                self, self.cleanup_state, self.application_name
            );
            let mut reset_string = String::from("RESET ROLE;");

            if self.cleanup_state.needs_cleanup_set {
                reset_string.push_str("RESET ALL;");
            };

            if self.cleanup_state.needs_cleanup_declare {
                reset_string.push_str("CLOSE ALL;");
            };

            if let Err(err) = self.small_simple_query(&reset_string).await {
                self.mark_bad("session reset failed");
                return Err(Error::ServerResetError(err.to_string()));
            }
            self.cleanup_state.reset();
        }

        if let Some(reset_query) = self.reset_query.clone() {
            if let Err(err) = self.small_simple_query(&reset_query).await {
                self.mark_bad("reset query failed");
                return Err(Error::ServerResetError(err.to_string()));
            }
            self.cleanup_state.reset();
        }

        Ok(())
    }

    /// Apply the client's tracked parameters (client_encoding, TimeZone, ...)
    /// that differ from what this server has.
    pub async fn sync_parameters(&mut self, parameters: &ServerParameters) -> Result<(), Error> {
        let parameter_diff = self.server_parameters.compare_params(parameters);

        if parameter_diff.is_empty() {
            return Ok(());
        }

        let mut query = String::from("");

        for (key, value) in parameter_diff {
            query.push_str(&format!("SET {} TO '{}';", key, value.replace('\'', "''")));
        }

        let res = self.small_simple_query(&query).await;

        self.cleanup_state.reset();

        res
    }

    /// Issue a query cancellation request to the server.
    /// Uses a separate connection that's not part of the connection pool.
    pub async fn cancel(
        host: &str,
        port: u16,
        process_id: i32,
        secret_key: i32,
    ) -> Result<(), Error> {
        let mut stream = if host.starts_with('/') {
            create_unix_stream_inner(host, port).await?
        } else {
            let stream = create_tcp_stream(host, port).await?;
            StreamInner::TCPPlain { stream }
        };

        warn!("Sending CancelRequest to [{process_id}] {host}:{port}");

        write_all_flush(&mut stream, &cancel_request(process_id, secret_key)).await
    }

    /// Pretend to be the Postgres client and connect to the server of the route.
    /// Perform the authentication and return the server in a ready for query state.
    pub async fn startup(
        id: u64,
        route: &RouteKey,
        settings: &RouteSettings,
        server_password: Option<String>,
        route_stats: Arc<RouteStats>,
    ) -> Result<Server, Error> {
        let server_identifier =
            ServerIdentifier::new(settings.server_username.clone(), &settings.server_database);

        let (mut stream, local_addr) = if settings.server_host.starts_with('/') {
            (
                create_unix_stream_inner(&settings.server_host, settings.server_port).await?,
                None,
            )
        } else {
            create_tcp_stream_inner(
                &settings.server_host,
                settings.server_port,
                settings.server_tls,
            )
            .await?
        };

        // StartupMessage
        startup(
            &mut stream,
            &settings.server_username,
            &settings.server_database,
            &settings.application_name,
        )
        .await?;

        let mut process_id: i32 = 0;
        let mut secret_key: i32 = 0;
        let mut scram_client_auth: Option<ScramSha256> = None;
        let mut server_parameters = ServerParameters::new();

        loop {
            let code = match stream.read_u8().await {
                Ok(code) => code as char,
                Err(err) => {
                    return Err(Error::ServerStartupError(
                        format!("couldn't read message code on startup from server backend: {err:?}"),
                        server_identifier,
                    ));
                }
            };

            let len = match stream.read_i32().await {
                Ok(len) => len,
                Err(err) => {
                    return Err(Error::ServerStartupError(
                        format!("couldn't read length on startup from server backend: {err:?}"),
                        server_identifier,
                    ));
                }
            };

            let mut body =
                read_startup_body(&mut stream, len, code, &server_identifier).await?;

            match code {
                // Authentication
                'R' => {
                    if body.len() < mem::size_of::<i32>() {
                        return Err(Error::ServerStartupError(
                            "auth code".into(),
                            server_identifier,
                        ));
                    }
                    let auth_code = body.get_i32();
                    match auth_code {
                        AUTHENTICATION_SUCCESSFUL => (),

                        MD5_ENCRYPTED_PASSWORD => {
                            let password = match &server_password {
                                Some(password) => password,
                                None => {
                                    return Err(Error::ServerAuthError(
                                        "server wants md5 authentication, but no password is configured".into(),
                                        server_identifier,
                                    ));
                                }
                            };
                            if body.len() < 4 {
                                return Err(Error::ServerStartupError(
                                    "md5 salt".into(),
                                    server_identifier,
                                ));
                            }
                            md5_password(
                                &mut stream,
                                &settings.server_username,
                                password,
                                &body[..4],
                            )
                            .await?;
                        }

                        AUTHENTICATION_CLEAR_PASSWORD => {
                            let password = match &server_password {
                                Some(password) if !password.starts_with(MD5_PASSWORD_PREFIX) => {
                                    password
                                }
                                _ => {
                                    return Err(Error::ServerAuthError(
                                        "server wants a clear text password, but none is configured".into(),
                                        server_identifier,
                                    ));
                                }
                            };
                            let mut password_body = BytesMut::from(password.as_bytes());
                            password_body.put_u8(0);
                            write_all_flush(&mut stream, &password_message(&password_body))
                                .await?;
                        }

                        SASL => {
                            let password = match &server_password {
                                Some(password) if !password.starts_with(MD5_PASSWORD_PREFIX) => {
                                    password
                                }
                                _ => {
                                    return Err(Error::ServerAuthError(
                                        "server wants sasl auth, but no plain password is configured".into(),
                                        server_identifier,
                                    ));
                                }
                            };
                            if !offers_scram_sha_256(&body) {
                                error!(
                                    "Unsupported SASL mechanisms: {}",
                                    String::from_utf8_lossy(&body)
                                );
                                return Err(Error::ServerAuthError(
                                    "no supported SASL mechanism".into(),
                                    server_identifier,
                                ));
                            }
                            let scram = ScramSha256::new(password);
                            write_all_flush(
                                &mut stream,
                                &sasl_initial_response(SCRAM_SHA_256, &scram.message()),
                            )
                            .await?;
                            scram_client_auth = Some(scram);
                        }

                        SASL_CONTINUE => {
                            let response = match scram_client_auth.as_mut() {
                                Some(scram) => scram.update(&body)?,
                                None => {
                                    return Err(Error::ServerAuthError(
                                        "SASLContinue before SASL".into(),
                                        server_identifier,
                                    ))
                                }
                            };
                            write_all_flush(&mut stream, &password_message(&response)).await?;
                        }

                        SASL_FINAL => match scram_client_auth.as_mut() {
                            Some(scram) => scram.finish(&body)?,
                            None => {
                                return Err(Error::ServerAuthError(
                                    "SASLFinal before SASL".into(),
                                    server_identifier,
                                ))
                            }
                        },

                        _ => {
                            error!(
                                "this type of authentication on the server {}@{} is not supported, auth code: {}",
                                server_identifier.username, server_identifier.database, auth_code
                            );
                            return Err(Error::ServerAuthError(
                                "authentication on the server is not supported".into(),
                                server_identifier,
                            ));
                        }
                    }
                }

                // ErrorResponse
                'E' => {
                    return match PgErrorMsg::parse(&body) {
                        Ok(f) => {
                            error!(
                                "Get server error - {} {}: {}",
                                f.severity, f.code, f.message
                            );
                            if f.code.starts_with("28") {
                                Err(Error::ServerAuthError(f.message, server_identifier))
                            } else {
                                Err(Error::ServerStartupError(f.message, server_identifier))
                            }
                        }
                        Err(err) => Err(Error::ServerStartupError(
                            format!("while creating a new connection received an unreadable error: {err:?}"),
                            server_identifier,
                        )),
                    };
                }

                // Notice
                'N' => {
                    if let Ok(msg) = PgErrorMsg::parse(&body) {
                        warn!(
                            "Server startup messages (severity: {} code: {} message: {})",
                            msg.severity, msg.code, msg.message
                        )
                    };
                }

                // ParameterStatus
                'S' => {
                    let key = body.read_string()?;
                    let value = body.read_string()?;

                    // Save the parameter so we can pass it to the client later.
                    server_parameters.set_param(key, value, true);
                }

                // BackendKeyData
                'K' => {
                    if body.len() < 8 {
                        return Err(Error::ServerStartupError(
                            "backend key data".into(),
                            server_identifier,
                        ));
                    }
                    process_id = body.get_i32();
                    secret_key = body.get_i32();
                }

                // ReadyForQuery
                'Z' => {
                    let stats = Arc::new(ServerStats::new(
                        id,
                        route.clone(),
                        &settings.server_host,
                        settings.server_port,
                        local_addr,
                        stream.is_tls(),
                        route_stats,
                    ));
                    stats.register(stats.clone());
                    stats.update_process_id(process_id);

                    let server = Server {
                        id,
                        route: route.clone(),
                        host: settings.server_host.clone(),
                        port: settings.server_port,
                        stream: BufStream::new(stream),
                        buffer: BytesMut::with_capacity(8196),
                        server_parameters,
                        process_id,
                        secret_key,
                        transaction_status: TransactionStatus::Idle,
                        data_available: false,
                        flush_replies: None,
                        in_copy_mode: false,
                        bad: false,
                        state: BackendState::Idle,
                        last_error: None,
                        cleanup_state: CleanupState::default(),
                        connected_at: chrono::offset::Utc::now().naive_utc(),
                        created_at: Instant::now(),
                        last_activity: Instant::now(),
                        stats,
                        application_name: settings.application_name.clone(),
                        cleanup_connections: settings.cleanup_server_connections,
                        reset_query: settings.reset_query.clone(),
                        max_message_size: settings.message_size_to_be_stream as i32,
                        proxy_copy_data_timeout: Duration::from_millis(
                            settings.proxy_copy_data_timeout,
                        ),
                    };
                    info!("Server connection established {server}");

                    return Ok(server);
                }

                // We have an unexpected message from the server during this exchange.
                _ => {
                    error!("An unprocessed message code from server backend while startup: {code}");
                    return Err(Error::ProtocolSyncError(format!(
                        "An unprocessed message code from server backend while startup: {code}"
                    )));
                }
            };
        }
    }
}

impl Drop for Server {
    /// Try to do a clean shut down. Best effort because
    /// the socket is in non-blocking mode, so it may not be ready
    /// for a write.
    fn drop(&mut self) {
        self.stats.disconnect();
        self.state = BackendState::Closed;

        if !self.is_bad() {
            let bytes = terminate();
            match self.stream.get_mut().try_write(&bytes) {
                Ok(5) => (),
                Err(err) if err.kind() == std::io::ErrorKind::Unsupported => (),
                Err(err) => warn!("Dirty server {} shutdown: {}", self, err),
                _ => warn!("Dirty server {} shutdown", self),
            };
        }

        let now = chrono::offset::Utc::now().naive_utc();
        let duration = now - self.connected_at;

        let message = if self.bad {
            "Server connection terminated"
        } else {
            "Server connection closed"
        };

        info!(
            "{} {}, session duration: {}",
            message,
            self,
            crate::format_duration(&duration)
        );
    }
}

/// Whether the null-separated SASL mechanism list includes SCRAM-SHA-256.
fn offers_scram_sha_256(mechanisms: &[u8]) -> bool {
    mechanisms
        .split(|byte| *byte == 0)
        .any(|mechanism| mechanism == SCRAM_SHA_256.as_bytes())
}

async fn read_startup_body(
    stream: &mut StreamInner,
    len: i32,
    code: char,
    server_identifier: &ServerIdentifier,
) -> Result<BytesMut, Error> {
    if len < mem::size_of::<i32>() as i32 || len > MAX_MESSAGE_SIZE {
        return Err(Error::ServerStartupError(
            format!("message '{code}' has invalid length {len}"),
            server_identifier.clone(),
        ));
    }
    let mut body = BytesMut::zeroed(len as usize - mem::size_of::<i32>());
    match stream.read_exact(&mut body[..]).await {
        Ok(_) => Ok(body),
        Err(err) => Err(Error::ServerStartupError(
            format!("couldn't read message '{code}' on startup: {err:?}"),
            server_identifier.clone(),
        )),
    }
}

async fn create_unix_stream_inner(host: &str, port: u16) -> Result<StreamInner, Error> {
    match UnixStream::connect(&format!("{host}/.s.PGSQL.{port}")).await {
        Ok(stream) => Ok(StreamInner::UnixSocket { stream }),
        Err(err) => {
            error!("Could not connect to server: {err}");
            Err(Error::SocketError(format!(
                "Could not connect to server: {err}"
            )))
        }
    }
}

async fn create_tcp_stream(host: &str, port: u16) -> Result<TcpStream, Error> {
    let stream = match TcpStream::connect(&format!("{host}:{port}")).await {
        Ok(stream) => stream,
        Err(err) => {
            error!("Could not connect to server {host}:{port}: {err}");
            return Err(Error::SocketError(format!(
                "Could not connect to server: {err}"
            )));
        }
    };

    // TCP timeouts.
    configure_tcp_socket(&stream);
    Ok(stream)
}

async fn create_tcp_stream_inner(
    host: &str,
    port: u16,
    tls: bool,
) -> Result<(StreamInner, Option<SocketAddr>), Error> {
    let mut stream = create_tcp_stream(host, port).await?;
    let local_addr = stream.local_addr().ok();

    if !tls {
        return Ok((StreamInner::TCPPlain { stream }, local_addr));
    }

    // Request a TLS connection
    ssl_request(&mut stream).await?;

    let response = match stream.read_u8().await {
        Ok(response) => response as char,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Server socket error: {err:?}"
            )));
        }
    };

    match response {
        // Server supports TLS
        'S' => {
            let connector = crate::tls::build_connector()?;
            match connector.connect(host, stream).await {
                Ok(stream) => Ok((StreamInner::TCPTls { stream }, local_addr)),
                Err(err) => {
                    error!("TLS handshake with server {host}:{port} failed: {err}");
                    Err(Error::SocketError(format!("TLS handshake failed: {err}")))
                }
            }
        }

        // Server does not support TLS
        'N' => Err(Error::SocketError(format!(
            "server {host}:{port} does not support TLS"
        ))),

        m => Err(Error::SocketError(format!("Unknown message: {m}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sasl_mechanism_list() {
        assert!(offers_scram_sha_256(b"SCRAM-SHA-256-PLUS\0SCRAM-SHA-256\0\0"));
        assert!(offers_scram_sha_256(b"SCRAM-SHA-256\0\0"));
        assert!(!offers_scram_sha_256(b"SCRAM-SHA-256-PLUS\0\0"));
        assert!(!offers_scram_sha_256(b""));
    }

    #[test]
    fn test_server_parameters_tracking() {
        let mut params = ServerParameters::new();
        params.set_param("server_version".into(), "16.2".into(), false);
        assert!(params.is_empty());

        params.set_param("server_version".into(), "16.2".into(), true);
        params.set_param("timezone".into(), "UTC".into(), true);
        params.set_param("application_name".into(), "app".into(), false);
        assert_eq!(params.get_application_name(), "app");
        assert!(params
            .as_pairs()
            .contains(&("TimeZone".to_string(), "UTC".to_string())));

        let mut other = params.clone();
        other.set_param("TimeZone".into(), "Europe/Berlin".into(), false);
        other.set_param("server_version".into(), "17".into(), true);
        let diff = params.compare_params(&other);
        assert_eq!(diff.len(), 1);
        assert_eq!(diff.get("TimeZone").map(String::as_str), Some("Europe/Berlin"));
    }

    #[test]
    fn test_admin_parameters() {
        let params = ServerParameters::admin();
        assert_eq!(params.get_application_name(), "pg_router");
        assert!(params
            .as_pairs()
            .contains(&("server_version".to_string(), VERSION.to_string())));
    }

    #[test]
    fn test_server_ids_are_unique() {
        let first = next_server_id();
        let second = next_server_id();
        assert!(second > first);
    }

    #[test]
    fn test_backend_state_display() {
        assert_eq!(BackendState::Expired.to_string(), "expired");
        assert_eq!(BackendState::Idle.to_string(), "idle");
    }
}
