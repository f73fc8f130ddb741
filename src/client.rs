/// Handle clients by pretending to be a PostgreSQL server.
use bytes::{Buf, BytesMut};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::io::{split, AsyncReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::broadcast::Receiver;
use tokio::sync::mpsc::Sender;

use crate::admin::Console;
use crate::auth::{authenticate, Authenticated};
use crate::config::{addr_in_hba, get_config};
use crate::constants::*;
use crate::errors::{ClientIdentifier, Error, ErrorClass};
use crate::messages::*;
use crate::pool::{Route, CLIENT_SERVER_MAP};
use crate::relay::{Relay, RelayOutcome};
use crate::router::{self, ClientHandle};
use crate::server::{Server, ServerParameters};
use crate::stats::ClientStats;

/// Process ids handed to clients in BackendKeyData. Also the client id
/// used by the pools and the stats.
static NEXT_CLIENT_ID: AtomicI32 = AtomicI32::new(1);

/// Type of connection received from client.
enum ClientConnectionType {
    Startup,
    Tls,
    CancelQuery,
}

/// Everything a client task needs from the process.
#[derive(Clone)]
pub struct ClientContext {
    pub console: Console,
    pub drain: Sender<i32>,
    pub admin_only: bool,
    pub tls_acceptor: Option<tokio_native_tls::TlsAcceptor>,
}

/// The client state. One of these is created per client.
pub struct Client<S, T> {
    /// The reads are buffered (8K by default).
    read: BufReader<S>,

    write: T,

    addr: std::net::SocketAddr,

    /// Pooler-side identity of the client: id, cancel secret and stats.
    handle: ClientHandle,

    /// None for console sessions.
    route: Option<Arc<Route>>,

    console: Console,

    /// Parameters the client wants on whatever server it gets.
    server_parameters: ServerParameters,

    /// Used to notify clients about an impending shutdown
    shutdown: Receiver<()>,

    max_memory_usage: u64,
    attach_retries: u32,
}

/// Answer a client we have no room for.
pub async fn client_entrypoint_too_many_clients_already(mut stream: TcpStream) -> Result<(), Error> {
    match get_startup::<TcpStream>(&mut stream).await {
        Ok((ClientConnectionType::Tls, _)) => {
            // Refuse TLS, the client retries in plain text and gets the error there.
            write_all_flush(&mut stream, b"N").await?;
            match get_startup::<TcpStream>(&mut stream).await {
                Ok((ClientConnectionType::Startup, _)) => (),
                Ok(_) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
        Ok((ClientConnectionType::Startup, _)) => (),
        Ok((ClientConnectionType::CancelQuery, bytes)) => return cancel(bytes).await,
        Err(err) => return Err(err),
    }
    error_response_terminal(&mut stream, "sorry, too many clients already", "53300").await
}

/// Client entrypoint.
pub async fn client_entrypoint(
    mut stream: TcpStream,
    context: ClientContext,
    shutdown: Receiver<()>,
) -> Result<(), Error> {
    let addr = match stream.peer_addr() {
        Ok(addr) => addr,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to get peer address: {err:?}"
            )));
        }
    };

    match get_startup::<TcpStream>(&mut stream).await? {
        // Client requested a TLS connection.
        (ClientConnectionType::Tls, _) => match context.tls_acceptor.clone() {
            Some(acceptor) => {
                write_all_flush(&mut stream, b"S").await?;
                let mut stream = match acceptor.accept(stream).await {
                    Ok(stream) => stream,
                    Err(err) => {
                        error!("TLS negotiation with {addr} failed: {err:?}");
                        return Err(Error::TlsError);
                    }
                };
                match get_startup(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        let (read, write) = split(stream);
                        run_client(read, write, addr, bytes, context, shutdown, true).await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => cancel(bytes).await,
                    (ClientConnectionType::Tls, _) => {
                        Err(Error::ProtocolSyncError("Bad postgres client (tls)".into()))
                    }
                }
            }
            // TLS is not configured, we cannot offer it.
            None => {
                write_all_flush(&mut stream, b"N").await?;
                match get_startup::<TcpStream>(&mut stream).await? {
                    (ClientConnectionType::Startup, bytes) => {
                        let (read, write) = split(stream);
                        run_client(read, write, addr, bytes, context, shutdown, false).await
                    }
                    (ClientConnectionType::CancelQuery, bytes) => cancel(bytes).await,
                    (ClientConnectionType::Tls, _) => {
                        Err(Error::ProtocolSyncError("Bad postgres client (plain)".into()))
                    }
                }
            }
        },

        // Client wants to use plain connection without encryption.
        (ClientConnectionType::Startup, bytes) => {
            let (read, write) = split(stream);
            run_client(read, write, addr, bytes, context, shutdown, false).await
        }

        // Client wants to cancel a query.
        (ClientConnectionType::CancelQuery, bytes) => {
            debug!("Client {addr} issued a cancel request");
            cancel(bytes).await
        }
    }
}

/// Startup, then serve the client until it leaves. Route clients are
/// counted on `drain` so a graceful shutdown knows when they are gone.
async fn run_client<S, T>(
    read: S,
    write: T,
    addr: std::net::SocketAddr,
    bytes: BytesMut,
    context: ClientContext,
    shutdown: Receiver<()>,
    use_tls: bool,
) -> Result<(), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut client = Client::startup(
        read,
        write,
        addr,
        bytes,
        context.console,
        shutdown,
        context.admin_only,
        use_tls,
    )
    .await?;

    if get_config().general.log_client_connections {
        info!(
            "Client {} connected ({})",
            addr,
            if use_tls { "TLS" } else { "plain" }
        );
    }

    if !client.is_admin() {
        let _ = context.drain.send(1).await;
    }
    let result = client.handle().await;
    if !client.is_admin() {
        let _ = context.drain.send(-1).await;
    }
    result
}

/// Handle the first message the client sends. GSSENC requests are refused
/// and the next message is read instead.
async fn get_startup<S>(stream: &mut S) -> Result<(ClientConnectionType, BytesMut), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin + tokio::io::AsyncWrite,
{
    loop {
        let len = match stream.read_i32().await {
            Ok(len) => len,
            Err(_) => return Err(Error::ClientBadStartup),
        };
        if !(8..=10_000).contains(&len) {
            return Err(Error::ClientBadStartup);
        }

        let mut startup = vec![0u8; len as usize - 4];
        if stream.read_exact(&mut startup).await.is_err() {
            return Err(Error::ClientBadStartup);
        }

        let mut bytes = BytesMut::from(&startup[..]);
        let code = bytes.get_i32();

        match code {
            SSL_REQUEST_CODE => return Ok((ClientConnectionType::Tls, bytes)),
            PROTOCOL_VERSION_NUMBER => return Ok((ClientConnectionType::Startup, bytes)),
            CANCEL_REQUEST_CODE => return Ok((ClientConnectionType::CancelQuery, bytes)),
            REQUEST_GSSENCMODE_CODE => {
                write_all_flush(stream, b"N").await?;
            }
            _ => {
                return Err(Error::ProtocolSyncError(format!(
                    "Unexpected startup code: {code}"
                )))
            }
        }
    }
}

/// Forward a CancelRequest to the server the client is attached to. Unknown
/// keys are ignored.
async fn cancel(mut bytes: BytesMut) -> Result<(), Error> {
    if bytes.remaining() < 8 {
        return Err(Error::ClientBadStartup);
    }
    let process_id = bytes.get_i32();
    let secret_key = bytes.get_i32();

    let target = CLIENT_SERVER_MAP
        .lock()
        .get(&(process_id, secret_key))
        .cloned();

    match target {
        Some((server_pid, server_secret, host, port)) => {
            Server::cancel(&host, port, server_pid, server_secret).await
        }
        None => {
            debug!("Cancel request for unknown client {process_id}");
            Ok(())
        }
    }
}

/// Whether `code` belongs to an extended protocol batch that ends with Sync.
fn is_extended(code: u8) -> bool {
    matches!(code, b'P' | b'B' | b'D' | b'E' | b'C' | b'H')
}

impl<S, T> Client<S, T>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
    T: tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub fn is_admin(&self) -> bool {
        self.route.is_none()
    }

    /// Handle Postgres client startup after TLS negotiation is complete
    /// or over plain text.
    #[allow(clippy::too_many_arguments)]
    pub async fn startup(
        read: S,
        mut write: T,
        addr: std::net::SocketAddr,
        bytes: BytesMut, // The rest of the startup message.
        console: Console,
        shutdown: Receiver<()>,
        admin_only: bool,
        use_tls: bool,
    ) -> Result<Client<S, T>, Error> {
        let mut read = read;
        let parameters = parse_startup(bytes)?;

        // This parameter is mandatory by the protocol.
        let username = match parameters.get("user") {
            Some(user) => user.clone(),
            None => {
                error_response_terminal(&mut write, "no PostgreSQL user name specified", "08P01")
                    .await?;
                return Err(Error::ClientError(
                    "Missing user parameter on client startup".into(),
                ));
            }
        };
        let database = parameters
            .get("database")
            .cloned()
            .unwrap_or_else(|| username.clone());
        let application_name = parameters
            .get("application_name")
            .cloned()
            .unwrap_or_else(|| String::from("pg_router"));

        let client_identifier = ClientIdentifier::new(
            &application_name,
            &username,
            &database,
            addr.to_string().as_str(),
        );

        let admin = CONSOLE_DATABASES.contains(&database.as_str());

        // Kick any client that's not admin while we're shutting down.
        if !admin && admin_only {
            error_response_terminal(&mut write, "pooler is shutting down", "58006").await?;
            return Err(Error::ShuttingDown);
        }

        let config = get_config();
        if !addr_in_hba(&config.general.hba, addr.ip()) {
            error_response_terminal(
                &mut write,
                "no hba entry allows this address",
                "28000",
            )
            .await?;
            return Err(Error::HbaForbiddenError(format!(
                "client {client_identifier} from address {}",
                addr.ip()
            )));
        }

        let Authenticated {
            route,
            mut server_parameters,
        } = authenticate(
            &mut read,
            &mut write,
            admin,
            &client_identifier,
            &database,
            &username,
        )
        .await?;

        // What the application sent wins over what the server reported.
        server_parameters.set_from_hashmap(parameters, false);

        let process_id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
        let secret_key: i32 = rand::random();

        send_login_ok(
            &mut write,
            &server_parameters.as_pairs(),
            process_id,
            secret_key,
        )
        .await?;

        let stats = Arc::new(ClientStats::new(
            process_id,
            &application_name,
            &username,
            &database,
            addr.to_string().as_str(),
            tokio::time::Instant::now(),
            use_tls,
        ));
        let handle = ClientHandle::new(process_id, secret_key, &application_name, stats);

        Ok(Client::new(
            read,
            write,
            addr,
            handle,
            route,
            console,
            server_parameters,
            shutdown,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        read: S,
        write: T,
        addr: std::net::SocketAddr,
        handle: ClientHandle,
        route: Option<Arc<Route>>,
        console: Console,
        server_parameters: ServerParameters,
        shutdown: Receiver<()>,
    ) -> Client<S, T> {
        let config = get_config();
        handle.stats.register(handle.stats.clone());
        if let Some(route) = &route {
            route.clients.register(handle.id, handle.stats.clone());
        }
        Client {
            read: BufReader::new(read),
            write,
            addr,
            handle,
            route,
            console,
            server_parameters,
            shutdown,
            max_memory_usage: config.general.max_memory_usage,
            attach_retries: config.general.attach_retries,
        }
    }

    /// Handle a connected and authenticated client.
    pub async fn handle(&mut self) -> Result<(), Error> {
        loop {
            // Read a complete message from the client, which normally would be
            // either a `Q` (query) or `P` (prepare, extended protocol).
            self.handle.stats.idle_read();
            let message = match read_message(&mut self.read, self.max_memory_usage).await {
                Ok(message) => message,
                Err(err) => return self.process_error(err).await,
            };
            let code = message[0];
            if code == b'X' {
                return Ok(());
            }

            // Shutdown is only noticed between requests.
            if !self.is_admin() && self.shutdown.try_recv().is_ok() {
                warn!("Dropping client {} because of shutdown", self.addr);
                error_response_terminal(&mut self.write, "pooler is shutting down", "58006")
                    .await?;
                return Ok(());
            }

            let route = match &self.route {
                Some(route) => route.clone(),
                None => {
                    self.console_query(message).await?;
                    continue;
                }
            };

            let mut server = match router::attach(&self.handle, &route, self.attach_retries).await
            {
                Ok(server) => server,
                Err(err) => {
                    warn!(
                        "{} Client {} could not get a server: {err}",
                        route.key, self.addr
                    );
                    self.fail_request(code, &err).await?;
                    continue;
                }
            };

            if let Err(err) = server.sync_parameters(&self.server_parameters).await {
                server.mark_bad("failed to sync parameters");
                router::release(&self.handle, &route, server).await;
                self.fail_request(code, &err).await?;
                continue;
            }

            let outcome = Relay::new(
                &mut self.read,
                &mut self.write,
                &self.handle,
                route.pool_mode(),
                &mut self.server_parameters,
                self.max_memory_usage,
            )
            .run(&mut server, message)
            .await;

            if let Ok(RelayOutcome::BackendLost(_)) = &outcome {
                route.servers.mark_expired(server.id());
            }
            router::release(&self.handle, &route, server).await;

            match outcome {
                Ok(RelayOutcome::Detach) => (),
                Ok(RelayOutcome::Terminated) => return Ok(()),
                Ok(RelayOutcome::BackendLost(err)) => {
                    self.handle.stats.error();
                    error_response(
                        &mut self.write,
                        "server conn crashed?",
                        err.sqlstate(),
                    )
                    .await?;
                }
                Err(err) => return self.process_error(err).await,
            }
        }
    }

    async fn console_query(&mut self, message: BytesMut) -> Result<(), Error> {
        match self.console.execute(message).await {
            Ok(response) => write_all_flush(&mut self.write, &response).await,
            Err(err) => {
                warn!("Console query from {} failed: {err}", self.addr);
                error_response(&mut self.write, &err.to_string(), err.sqlstate()).await
            }
        }
    }

    /// Report `err` for the request starting with `code`. The rest of an
    /// extended protocol batch is read and dropped up to Sync. A Flush in the
    /// batch gets the ErrorResponse right away, ReadyForQuery follows on Sync.
    async fn fail_request(&mut self, code: u8, err: &Error) -> Result<(), Error> {
        self.handle.stats.error();
        if !is_extended(code) {
            return error_response(&mut self.write, &err.to_string(), err.sqlstate()).await;
        }

        let mut reported = false;
        let mut code = code;
        loop {
            match code {
                b'S' => break,
                b'X' => return Err(Error::ClientError("terminated mid-batch".into())),
                b'H' if !reported => {
                    write_all_flush(
                        &mut self.write,
                        &error_message(&err.to_string(), err.sqlstate()),
                    )
                    .await?;
                    reported = true;
                }
                _ => (),
            }
            code = read_message(&mut self.read, self.max_memory_usage).await?[0];
        }

        if reported {
            write_all_flush(&mut self.write, &ready_for_query(TransactionStatus::Idle)).await
        } else {
            error_response(&mut self.write, &err.to_string(), err.sqlstate()).await
        }
    }

    /// Close the session after `err`. Protocol violations are answered with a
    /// FATAL ErrorResponse; a failed socket gets nothing.
    async fn process_error(&mut self, err: Error) -> Result<(), Error> {
        if err.class() == ErrorClass::ClientProtocol {
            warn!("Client {} protocol error: {err}", self.addr);
            error_response_terminal(
                &mut self.write,
                format!("could not process message: {err}").as_str(),
                err.sqlstate(),
            )
            .await?;
        }
        Err(err)
    }
}

impl<S, T> Drop for Client<S, T> {
    fn drop(&mut self) {
        CLIENT_SERVER_MAP
            .lock()
            .remove(&(self.handle.id, self.handle.secret));
        if let Some(route) = &self.route {
            route.clients.unregister(self.handle.id);
        }
        self.handle.stats.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::tests::split_messages;
    use crate::pool::test_backend::{settings_for, FakeBackend};
    use crate::pool::RouteKey;
    use bytes::BufMut;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::broadcast;

    /// Reads backend messages until ReadyForQuery and returns them.
    async fn until_ready(stream: &mut DuplexStream) -> Vec<(u8, Vec<u8>)> {
        let mut bytes = Vec::new();
        loop {
            let code = stream.read_u8().await.unwrap();
            let len = stream.read_i32().await.unwrap();
            let mut body = vec![0u8; len as usize - 4];
            stream.read_exact(&mut body).await.unwrap();
            bytes.push(code);
            bytes.extend_from_slice(&len.to_be_bytes());
            bytes.extend_from_slice(&body);
            if code == b'Z' {
                return split_messages(&bytes);
            }
        }
    }

    fn spawn_client(
        route: Arc<Route>,
    ) -> (
        DuplexStream,
        tokio::task::JoinHandle<Result<(), Error>>,
        broadcast::Sender<()>,
    ) {
        let (ours, theirs) = duplex(64 * 1024);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
            let stats = Arc::new(ClientStats::new(
                id,
                "test",
                &route.key.user,
                &route.key.database,
                "127.0.0.1:5000",
                tokio::time::Instant::now(),
                false,
            ));
            let (read, write) = split(theirs);
            let mut client = Client::new(
                read,
                write,
                "127.0.0.1:5000".parse().unwrap(),
                ClientHandle::new(id, 99, "test", stats),
                Some(route),
                Console::start(),
                ServerParameters::new(),
                shutdown_rx,
            );
            client.handle().await
        });
        (ours, task, shutdown_tx)
    }

    #[tokio::test]
    async fn test_transaction_then_terminate() {
        let backend = FakeBackend::start().await;
        let route = Arc::new(Route::new(
            RouteKey::new("app", "alice"),
            settings_for(&backend),
        ));
        let (mut stream, task, _shutdown) = spawn_client(route.clone());

        for query in ["BEGIN", "select 1", "COMMIT"] {
            stream.write_all(&simple_query(query)).await.unwrap();
            let reply = until_ready(&mut stream).await;
            assert_eq!(reply.last().unwrap().0, b'Z');
        }
        // Back in the pool after COMMIT.
        assert_eq!(route.servers.status().idle, 1);
        assert_eq!(route.clients.status().active, 0);

        stream.write_all(&terminate()).await.unwrap();
        assert!(task.await.unwrap().is_ok());
        assert_eq!(route.clients.status().total, 0);
    }

    #[tokio::test]
    async fn test_pool_timeout_keeps_session() {
        let backend = FakeBackend::start().await;
        let mut settings = settings_for(&backend);
        settings.pool_size = 1;
        settings.query_wait_timeout = 50;
        let route = Arc::new(Route::new(RouteKey::new("app", "alice"), settings));
        let held = route.servers.checkout().await.unwrap();

        let (mut stream, task, _shutdown) = spawn_client(route.clone());
        stream.write_all(&simple_query("select 1")).await.unwrap();
        let reply = until_ready(&mut stream).await;
        assert_eq!(reply[0].0, b'E');
        assert!(String::from_utf8_lossy(&reply[0].1).contains("53300"));

        // Capacity comes back, and the same session can go on.
        route.servers.release(held).await;
        stream.write_all(&simple_query("select 1")).await.unwrap();
        let reply = until_ready(&mut stream).await;
        assert_eq!(reply[0].0, b'D');

        drop(stream);
        assert!(task.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_unknown_message_gets_fatal_error() {
        let backend = FakeBackend::start().await;
        let route = Arc::new(Route::new(
            RouteKey::new("app", "alice"),
            settings_for(&backend),
        ));
        let (mut stream, task, _shutdown) = spawn_client(route.clone());

        let mut junk = BytesMut::new();
        junk.put_u8(b'z');
        junk.put_i32(8);
        junk.put_slice(b"junk");
        stream.write_all(&junk).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(Error::ProtocolSyncError(_))));

        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.unwrap();
        let messages = split_messages(&received);
        assert_eq!(messages[0].0, b'E');
        let body = String::from_utf8_lossy(&messages[0].1);
        assert!(body.contains("FATAL"));
        assert!(body.contains("08P01"));

        // Nothing was in flight, the server is reusable.
        assert_eq!(route.servers.status().idle, 1);
    }

    #[tokio::test]
    async fn test_pool_timeout_answers_flush() {
        let backend = FakeBackend::start().await;
        let mut settings = settings_for(&backend);
        settings.pool_size = 1;
        settings.query_wait_timeout = 50;
        let route = Arc::new(Route::new(RouteKey::new("app", "alice"), settings));
        let held = route.servers.checkout().await.unwrap();

        let (mut stream, task, _shutdown) = spawn_client(route.clone());
        let mut batch = parse_message("select 1");
        batch.put(flush());
        stream.write_all(&batch).await.unwrap();

        // The error comes without waiting for Sync.
        let code = tokio::time::timeout(std::time::Duration::from_secs(2), stream.read_u8())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(code, b'E');
        let len = stream.read_i32().await.unwrap();
        let mut body = vec![0u8; len as usize - 4];
        stream.read_exact(&mut body).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("53300"));

        stream.write_all(&sync()).await.unwrap();
        let reply = until_ready(&mut stream).await;
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].0, b'Z');

        route.servers.release(held).await;
        stream.write_all(&terminate()).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_backend_lost_reports_08006() {
        let backend = FakeBackend::start().await;
        let route = Arc::new(Route::new(
            RouteKey::new("app", "alice"),
            settings_for(&backend),
        ));
        let (mut stream, task, _shutdown) = spawn_client(route.clone());

        stream.write_all(&simple_query("DROP")).await.unwrap();
        let reply = until_ready(&mut stream).await;
        assert_eq!(reply[0].0, b'E');
        assert!(String::from_utf8_lossy(&reply[0].1).contains("08006"));
        assert_eq!(route.servers.status().total(), 0);

        stream.write_all(&terminate()).await.unwrap();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_gssenc_is_refused_then_startup_read() {
        let (mut ours, mut theirs) = duplex(1024);
        let mut request = BytesMut::new();
        request.put_i32(8);
        request.put_i32(REQUEST_GSSENCMODE_CODE);
        request.put_i32(8);
        request.put_i32(CANCEL_REQUEST_CODE);
        ours.write_all(&request).await.unwrap();

        let result = get_startup(&mut theirs).await.unwrap();
        assert!(matches!(result.0, ClientConnectionType::CancelQuery));
        assert_eq!(ours.read_u8().await.unwrap(), b'N');
    }

    #[tokio::test]
    async fn test_bad_startup_length() {
        let (mut ours, mut theirs) = duplex(1024);
        ours.write_all(&3i32.to_be_bytes()).await.unwrap();
        assert!(matches!(
            get_startup(&mut theirs).await,
            Err(Error::ClientBadStartup)
        ));
    }

    #[tokio::test]
    async fn test_cancel_unknown_key_is_ignored() {
        let mut bytes = BytesMut::new();
        bytes.put_i32(-77);
        bytes.put_i32(-77);
        assert!(cancel(bytes).await.is_ok());
    }
}
