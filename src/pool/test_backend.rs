//! Scripted PostgreSQL backend for pool, router and relay tests.
//!
//! Startup is answered with AuthenticationOk, a few parameters,
//! BackendKeyData and `Z I`. Simple queries are scripted:
//! `BEGIN` opens a transaction, `COMMIT`/`ROLLBACK` close it, `FAIL` answers
//! an ErrorResponse and `DROP` closes the socket. The extended protocol
//! serves the auth query from a table of users; replies go out on Sync or
//! Flush.
use bytes::{Buf, BufMut, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::PoolMode;
use crate::messages::*;

use super::route::{ClientAuth, RouteSettings};

#[derive(Debug, Default)]
struct Shared {
    connections: AtomicUsize,
    next_pid: AtomicI32,
    queries: Mutex<Vec<String>>,
    /// Rows of the auth query: user -> password hash (None is SQL NULL).
    shadow: Mutex<HashMap<String, Vec<Option<String>>>>,
}

#[derive(Debug, Clone)]
pub(crate) struct FakeBackend {
    pub port: u16,
    shared: Arc<Shared>,
}

impl FakeBackend {
    pub async fn start() -> FakeBackend {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Shared::default());
        shared.next_pid.store(1000, Ordering::Relaxed);

        let accept_shared = shared.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.connections.fetch_add(1, Ordering::Relaxed);
                let shared = accept_shared.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, shared).await;
                });
            }
        });

        FakeBackend { port, shared }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::Relaxed)
    }

    /// Every simple query received, in order.
    pub fn queries(&self) -> Vec<String> {
        self.shared.queries.lock().clone()
    }

    pub fn add_shadow_row(&self, user: &str, hash: Option<&str>) {
        self.shared
            .shadow
            .lock()
            .entry(user.to_string())
            .or_default()
            .push(hash.map(str::to_string));
    }

    /// A port nobody listens on.
    pub fn unused_port(&self) -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }
}

pub(crate) fn settings_for(backend: &FakeBackend) -> RouteSettings {
    RouteSettings {
        pool_mode: PoolMode::Transaction,
        pool_size: 2,
        server_host: "127.0.0.1".to_string(),
        server_port: backend.port,
        server_database: "app".to_string(),
        server_tls: false,
        server_username: "alice".to_string(),
        server_password: None,
        application_name: "pg_router".to_string(),
        client_auth: ClientAuth::Password("secret".to_string()),
        auth_query: None,
        auth_query_user: None,
        connect_timeout: 1_000,
        query_wait_timeout: 5_000,
        idle_timeout: 0,
        server_lifetime: 0,
        proxy_copy_data_timeout: 1_000,
        cleanup_server_connections: true,
        reset_query: None,
        message_size_to_be_stream: 1024 * 1024,
    }
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<(u8, BytesMut)> {
    let code = stream.read_u8().await?;
    let len = stream.read_i32().await?;
    let mut body = BytesMut::zeroed(len as usize - 4);
    stream.read_exact(&mut body).await?;
    Ok((code, body))
}

fn null_terminated(body: &mut BytesMut) -> String {
    let end = body.iter().position(|b| *b == 0).unwrap_or(body.len());
    let value = String::from_utf8_lossy(&body[..end]).to_string();
    body.advance((end + 1).min(body.len()));
    value
}

fn shadow_row(user: &str, hash: &Option<String>) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_i16(2);
    body.put_i32(user.len() as i32);
    body.put_slice(user.as_bytes());
    match hash {
        Some(hash) => {
            body.put_i32(hash.len() as i32);
            body.put_slice(hash.as_bytes());
        }
        None => body.put_i32(-1),
    }
    let mut row = BytesMut::new();
    row.put_u8(b'D');
    row.put_i32(body.len() as i32 + 4);
    row.put(body);
    row
}

fn message(code: u8, body: &[u8]) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(code);
    res.put_i32(body.len() as i32 + 4);
    res.put_slice(body);
    res
}

async fn serve(mut stream: TcpStream, shared: Arc<Shared>) -> std::io::Result<()> {
    // StartupMessage has no code byte.
    let len = stream.read_i32().await?;
    let mut startup = vec![0u8; len as usize - 4];
    stream.read_exact(&mut startup).await?;

    let pid = shared.next_pid.fetch_add(1, Ordering::Relaxed);
    let mut res = auth_ok();
    res.put(server_parameter_message("server_version", "16.0"));
    res.put(server_parameter_message("client_encoding", "UTF8"));
    res.put(backend_key_data(pid, 4242));
    res.put(ready_for_query(TransactionStatus::Idle));
    stream.write_all(&res).await?;

    let mut status = TransactionStatus::Idle;
    let mut bound_user = String::new();
    let mut pending = BytesMut::new();

    loop {
        let (code, mut body) = read_frame(&mut stream).await?;
        match code {
            b'Q' => {
                let query = null_terminated(&mut body);
                shared.queries.lock().push(query.clone());
                let mut res = BytesMut::new();
                match query.trim_end_matches(';').to_uppercase().as_str() {
                    "BEGIN" => {
                        status = TransactionStatus::InTransaction;
                        res.put(command_complete("BEGIN"));
                    }
                    "COMMIT" => {
                        status = TransactionStatus::Idle;
                        res.put(command_complete("COMMIT"));
                    }
                    "ROLLBACK" => {
                        status = TransactionStatus::Idle;
                        res.put(command_complete("ROLLBACK"));
                    }
                    "FAIL" => {
                        if status == TransactionStatus::InTransaction {
                            status = TransactionStatus::Failed;
                        }
                        res.put(error_message("scripted failure", "XX000"));
                    }
                    "DROP" => return Ok(()),
                    "SET" => res.put(command_complete("SET")),
                    _ => {
                        res.put(data_row(&[query.clone()]));
                        res.put(command_complete("SELECT 1"));
                    }
                }
                res.put(ready_for_query(status));
                stream.write_all(&res).await?;
            }
            b'P' => pending.put(message(b'1', &[])),
            b'B' => {
                // portal, statement, format codes, then the first parameter.
                null_terminated(&mut body);
                null_terminated(&mut body);
                let formats = body.get_i16();
                body.advance(formats as usize * 2);
                let params = body.get_i16();
                if params > 0 {
                    let len = body.get_i32();
                    bound_user = String::from_utf8_lossy(&body[..len as usize]).to_string();
                }
                pending.put(message(b'2', &[]));
            }
            b'E' => {
                let rows = shared
                    .shadow
                    .lock()
                    .get(&bound_user)
                    .cloned()
                    .unwrap_or_default();
                for hash in rows.iter() {
                    pending.put(shadow_row(&bound_user, hash));
                }
                pending.put(command_complete(&format!("SELECT {}", rows.len())));
            }
            b'H' => stream.write_all(&pending.split()).await?,
            b'S' => {
                pending.put(ready_for_query(status));
                stream.write_all(&pending.split()).await?;
            }
            b'X' => return Ok(()),
            _ => (),
        }
    }
}
