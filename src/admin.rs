//! Administrative console. Queries from console sessions are parsed into a
//! [`ConsoleCommand`] and executed by a single handler task; every session
//! talks to it over an mpsc channel and gets its answer on a oneshot.

// Standard library imports
use std::sync::atomic::Ordering;

// External crate imports
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, error, info};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

// Internal crate imports
use crate::config::{get_config, reload_config, VERSION};
use crate::errors::Error;
use crate::messages::{
    command_complete, data_row, ready_for_query, row_description, DataType, TransactionStatus,
};
use crate::pool::{enumerate_active_backends, enumerate_routes, get_all_routes};
use crate::stats::get_client_stats;

/// Commands understood by the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    ShowStats,
    ShowServers,
    ShowPools,
    ShowClients,
    ShowVersion,
    ShowConfig,
    Reload,
    Shutdown,
}

impl ConsoleCommand {
    /// Keywords are case-insensitive, a trailing `;` is ignored.
    pub fn parse(query: &str) -> Result<ConsoleCommand, Error> {
        let query = query.trim().trim_end_matches(';').to_ascii_uppercase();
        let parts: Vec<&str> = query.split_whitespace().collect();

        match parts.as_slice() {
            ["RELOAD"] => Ok(ConsoleCommand::Reload),
            ["SHUTDOWN"] => Ok(ConsoleCommand::Shutdown),
            ["SHOW", what] => match *what {
                "STATS" => Ok(ConsoleCommand::ShowStats),
                "SERVERS" => Ok(ConsoleCommand::ShowServers),
                "POOLS" => Ok(ConsoleCommand::ShowPools),
                "CLIENTS" => Ok(ConsoleCommand::ShowClients),
                "VERSION" => Ok(ConsoleCommand::ShowVersion),
                "CONFIG" => Ok(ConsoleCommand::ShowConfig),
                _ => Err(Error::ConsoleError(format!("unsupported SHOW {what}"))),
            },
            [] => Err(Error::ConsoleError("empty query".to_string())),
            _ => Err(Error::ConsoleError(format!("unsupported command: {query}"))),
        }
    }
}

/// One console query and where to send the answer.
pub struct ConsoleRequest {
    pub query: String,
    pub reply: oneshot::Sender<Result<BytesMut, Error>>,
}

/// Handle to the console handler task.
#[derive(Clone, Debug)]
pub struct Console {
    sender: mpsc::Sender<ConsoleRequest>,
}

impl Console {
    /// Spawns the handler task.
    pub fn start() -> Console {
        let (sender, receiver) = mpsc::channel(64);
        tokio::task::spawn(console_handler(receiver));
        Console { sender }
    }

    /// Runs the simple query `message` ('Q') and returns the encoded response,
    /// ReadyForQuery included.
    pub async fn execute(&self, mut message: BytesMut) -> Result<BytesMut, Error> {
        if message.len() < 5 || message.get_u8() != b'Q' {
            return Err(Error::ConsoleError(
                "only simple queries are supported".to_string(),
            ));
        }
        let _len = message.get_i32();
        let end = message.iter().position(|b| *b == 0).unwrap_or(message.len());
        let query = String::from_utf8_lossy(&message[..end]).to_string();

        let (reply, response) = oneshot::channel();
        if self.sender.send(ConsoleRequest { query, reply }).await.is_err() {
            return Err(Error::ConsoleError("console is not running".to_string()));
        }
        match response.await {
            Ok(result) => result,
            Err(_) => Err(Error::ConsoleError("console dropped the request".to_string())),
        }
    }
}

/// Serves console requests one at a time until every sender is gone.
pub async fn console_handler(mut receiver: mpsc::Receiver<ConsoleRequest>) {
    while let Some(request) = receiver.recv().await {
        debug!("Console query: {}", request.query);
        let result = match ConsoleCommand::parse(&request.query) {
            Ok(command) => run(command).await,
            Err(err) => Err(err),
        };
        if let Err(err) = &result {
            error!("Console query {:?} failed: {err}", request.query);
        }
        let _ = request.reply.send(result);
    }
}

async fn run(command: ConsoleCommand) -> Result<BytesMut, Error> {
    let mut res = match command {
        ConsoleCommand::ShowStats => show_stats(),
        ConsoleCommand::ShowServers => show_servers(),
        ConsoleCommand::ShowPools => show_pools(),
        ConsoleCommand::ShowClients => show_clients(),
        ConsoleCommand::ShowVersion => show_version(),
        ConsoleCommand::ShowConfig => show_config()?,
        ConsoleCommand::Reload => reload().await?,
        ConsoleCommand::Shutdown => shutdown(),
    };
    res.put(ready_for_query(TransactionStatus::Idle));
    Ok(res)
}

/// Per-route totals and averages.
fn show_stats() -> BytesMut {
    let columns = [
        ("database", DataType::Text),
        ("user", DataType::Text),
        ("total_requests", DataType::Text),
        ("total_received", DataType::Text),
        ("total_sent", DataType::Text),
        ("total_query_time", DataType::Text),
        ("avg_req", DataType::Text),
        ("avg_recv", DataType::Text),
        ("avg_sent", DataType::Text),
        ("avg_query", DataType::Text),
    ];

    let mut res = BytesMut::new();
    res.put(row_description(&columns));
    for (key, total, averages) in enumerate_routes() {
        res.put(data_row(&[
            key.database,
            key.user,
            total.query_count.to_string(),
            total.bytes_received.to_string(),
            total.bytes_sent.to_string(),
            total.query_time_microseconds.to_string(),
            averages.query_count.to_string(),
            averages.bytes_received.to_string(),
            averages.bytes_sent.to_string(),
            averages.query_time_microseconds.to_string(),
        ]));
    }
    res.put(command_complete("SHOW"));
    res
}

/// Every pooled backend connection.
fn show_servers() -> BytesMut {
    let columns = [
        ("type", DataType::Text),
        ("user", DataType::Text),
        ("database", DataType::Text),
        ("state", DataType::Text),
        ("addr", DataType::Text),
        ("port", DataType::Int4),
        ("local_addr", DataType::Text),
        ("local_port", DataType::Int4),
        ("connect_time", DataType::Text),
        ("request_time", DataType::Text),
        ("ptr", DataType::Text),
        ("link", DataType::Text),
        ("remote_pid", DataType::Int4),
        ("tls", DataType::Text),
    ];

    let mut res = BytesMut::new();
    res.put(row_description(&columns));
    for backend in enumerate_active_backends() {
        res.put(data_row(&[
            backend.kind.to_string(),
            backend.user,
            backend.database,
            backend.state.to_string(),
            backend.addr,
            backend.port.to_string(),
            backend.local_addr.unwrap_or_default(),
            backend
                .local_port
                .map(|port| port.to_string())
                .unwrap_or_default(),
            backend.connect_time.format("%Y-%m-%d %H:%M:%S").to_string(),
            backend
                .request_time
                .map(|time| time.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_default(),
            backend.server_id.to_string(),
            backend.link.map(|id| id.to_string()).unwrap_or_default(),
            backend.remote_pid.to_string(),
            backend.tls.to_string(),
        ]));
    }
    res.put(command_complete("SHOW"));
    res
}

/// Client and server counts of every route.
fn show_pools() -> BytesMut {
    let columns = [
        ("database", DataType::Text),
        ("user", DataType::Text),
        ("cl_active", DataType::Int4),
        ("cl_waiting", DataType::Int4),
        ("sv_active", DataType::Int4),
        ("sv_idle", DataType::Int4),
        ("sv_connecting", DataType::Int4),
        ("maxwait", DataType::Int4),
        ("maxwait_us", DataType::Int4),
        ("pool_mode", DataType::Text),
        ("pool_size", DataType::Int4),
    ];

    let routes = get_all_routes();
    let mut keys: Vec<_> = routes.keys().collect();
    keys.sort();

    let mut res = BytesMut::new();
    res.put(row_description(&columns));
    for key in keys {
        let route = &routes[key];
        let clients = route.clients.status();
        let servers = route.servers.status();
        res.put(data_row(&[
            key.database.clone(),
            key.user.clone(),
            clients.active.to_string(),
            clients.waiting.to_string(),
            servers.active.to_string(),
            servers.idle.to_string(),
            servers.connecting.to_string(),
            (clients.maxwait_us / 1_000_000).to_string(),
            (clients.maxwait_us % 1_000_000).to_string(),
            route.pool_mode().to_string(),
            servers.max_size.to_string(),
        ]));
    }
    res.put(command_complete("SHOW"));
    res
}

/// Currently connected clients.
fn show_clients() -> BytesMut {
    let columns = [
        ("client_id", DataType::Text),
        ("database", DataType::Text),
        ("user", DataType::Text),
        ("application_name", DataType::Text),
        ("addr", DataType::Text),
        ("tls", DataType::Text),
        ("state", DataType::Text),
        ("wait", DataType::Text),
        ("transaction_count", DataType::Int8),
        ("query_count", DataType::Int8),
        ("error_count", DataType::Int8),
        ("age_seconds", DataType::Int8),
    ];

    let mut clients: Vec<_> = get_client_stats().into_values().collect();
    clients.sort_by_key(|client| client.client_id());

    let mut res = BytesMut::new();
    res.put(row_description(&columns));
    for client in clients {
        res.put(data_row(&[
            format!("{:#010X}", client.client_id()),
            client.database(),
            client.username(),
            client.application_name(),
            client.ipaddr(),
            client.tls().to_string(),
            client.state_to_string(),
            client.wait_to_string(),
            client.transaction_count.load(Ordering::Relaxed).to_string(),
            client.query_count.load(Ordering::Relaxed).to_string(),
            client.error_count.load(Ordering::Relaxed).to_string(),
            Instant::now()
                .duration_since(client.connect_time())
                .as_secs()
                .to_string(),
        ]));
    }
    res.put(command_complete("SHOW"));
    res
}

fn show_version() -> BytesMut {
    let mut res = BytesMut::new();
    res.put(row_description(&[("version", DataType::Text)]));
    res.put(data_row(&[format!("pg_router {VERSION}")]));
    res.put(command_complete("SHOW"));
    res
}

/// The `[general]` section, one row per key.
fn show_config() -> Result<BytesMut, Error> {
    let config = get_config();
    let general = match serde_json::to_value(&config.general) {
        Ok(serde_json::Value::Object(general)) => general,
        Ok(_) | Err(_) => {
            return Err(Error::ConsoleError(
                "could not serialize the configuration".to_string(),
            ))
        }
    };

    // Settings only read at startup.
    let immutables = ["host", "port", "worker_threads", "backlog"];

    let columns = [
        ("key", DataType::Text),
        ("value", DataType::Text),
        ("changeable", DataType::Text),
    ];
    let mut res = BytesMut::new();
    res.put(row_description(&columns));
    for (key, value) in general {
        let value = match (key.as_str(), value) {
            ("admin_password", _) => "********".to_string(),
            (_, serde_json::Value::String(value)) => value,
            (_, serde_json::Value::Null) => String::new(),
            (_, value) => value.to_string(),
        };
        let changeable = if immutables.contains(&key.as_str()) {
            "no"
        } else {
            "yes"
        };
        res.put(data_row(&[key, value, changeable.to_string()]));
    }
    res.put(command_complete("SHOW"));
    Ok(res)
}

/// Re-read the configuration file; only routes created afterwards see it.
async fn reload() -> Result<BytesMut, Error> {
    info!("Reloading config");
    match reload_config().await {
        Ok(changed) => {
            if changed {
                get_config().show();
            }
        }
        Err(err) => return Err(Error::ConsoleError(format!("reload failed: {err}"))),
    }
    let mut res = BytesMut::new();
    res.put(command_complete("RELOAD"));
    Ok(res)
}

/// Starts a graceful shutdown by sending SIGINT to ourselves.
fn shutdown() -> BytesMut {
    let mut res = BytesMut::new();
    res.put(row_description(&[("success", DataType::Text)]));

    let pid = std::process::id() as i32;
    let success = match signal::kill(Pid::from_raw(pid), Signal::SIGINT) {
        Ok(()) => "t",
        Err(err) => {
            error!("Unable to send SIGINT to PID {pid}: {err}");
            "f"
        }
    };

    res.put(data_row(&[success.to_string()]));
    res.put(command_complete("SHUTDOWN"));
    res
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::simple_query;
    use crate::messages::tests::split_messages;
    use crate::pool::resolve_with;
    use crate::pool::test_backend::FakeBackend;

    fn codes(bytes: &[u8]) -> Vec<u8> {
        split_messages(bytes).into_iter().map(|(code, _)| code).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            ConsoleCommand::parse("show stats;").unwrap(),
            ConsoleCommand::ShowStats
        );
        assert_eq!(
            ConsoleCommand::parse("  SHOW   Servers ").unwrap(),
            ConsoleCommand::ShowServers
        );
        assert_eq!(
            ConsoleCommand::parse("reload").unwrap(),
            ConsoleCommand::Reload
        );
        for bad in ["", "SHOW", "SHOW NOTHING", "SELECT 1", "SHOW STATS EXTRA"] {
            assert!(matches!(
                ConsoleCommand::parse(bad),
                Err(Error::ConsoleError(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_show_version() {
        let console = Console::start();
        let res = console.execute(simple_query("SHOW VERSION")).await.unwrap();
        assert_eq!(codes(&res), vec![b'T', b'D', b'C', b'Z']);
        assert!(String::from_utf8_lossy(&res).contains(VERSION));
    }

    #[tokio::test]
    async fn test_bad_command_is_a_console_error() {
        let console = Console::start();
        let before = get_all_routes().len();

        let err = console.execute(simple_query("DROP POOLS")).await.unwrap_err();
        assert!(matches!(err, Error::ConsoleError(_)));
        assert_eq!(err.sqlstate(), "42601");

        let err = console.execute(BytesMut::from(&b"P\0\0\0\x04"[..])).await.unwrap_err();
        assert!(matches!(err, Error::ConsoleError(_)));

        // The handler keeps serving and pools are untouched.
        assert!(console.execute(simple_query("SHOW CONFIG")).await.is_ok());
        assert_eq!(get_all_routes().len(), before);
    }

    #[tokio::test]
    async fn test_show_pools_and_servers() {
        let backend = FakeBackend::start().await;
        let config = crate::pool::tests::config_for(&backend, "console_db", &["alice"]);
        let route = resolve_with(&config, "console_db", "alice").unwrap();
        let server = route.servers.checkout().await.unwrap();
        let server_id = server.id().to_string();

        let console = Console::start();
        let pools = console.execute(simple_query("SHOW POOLS")).await.unwrap();
        assert!(String::from_utf8_lossy(&pools).contains("console_db"));

        let servers = console.execute(simple_query("show servers")).await.unwrap();
        let rows = split_messages(&servers);
        assert!(rows
            .iter()
            .any(|(code, body)| *code == b'D' && String::from_utf8_lossy(body).contains(&server_id)));

        route.servers.release(server).await;
        let stats = console.execute(simple_query("SHOW STATS")).await.unwrap();
        assert_eq!(*codes(&stats).last().unwrap(), b'Z');
    }
}
