//! Router: binds clients to backends of their route and takes them back.
use log::{error, info, warn};
use std::sync::Arc;
use tokio::time::Instant;

use crate::errors::{Error, ErrorClass};
use crate::pool::{resolve, PooledServer, Route, CLIENT_SERVER_MAP};
use crate::stats::ClientStats;

/// What the router knows about a client connection.
#[derive(Clone)]
pub struct ClientHandle {
    /// Pooler-assigned id, also the pid the client sees in BackendKeyData.
    pub id: i32,
    pub secret: i32,
    pub application_name: String,
    pub stats: Arc<ClientStats>,
}

impl ClientHandle {
    pub fn new(id: i32, secret: i32, application_name: &str, stats: Arc<ClientStats>) -> Self {
        ClientHandle {
            id,
            secret,
            application_name: application_name.to_string(),
            stats,
        }
    }
}

/// Outcome of [`try_attach`].
#[derive(Debug)]
pub enum Attach {
    Attached(PooledServer),
    /// Every server of the route is taken; queue with [`attach`].
    Wait,
}

/// Attaches an idle or new server without queueing.
pub async fn try_attach(client: &ClientHandle, route: &Route) -> Result<Attach, Error> {
    let started = Instant::now();
    match route.servers.try_checkout().await {
        Ok(Some(server)) => bind(client, route, server, started).map(Attach::Attached),
        Ok(None) => Ok(Attach::Wait),
        Err(err) => {
            client.stats.checkout_error();
            Err(err)
        }
    }
}

/// Attaches a server to the client, waiting in FIFO order when the route is
/// exhausted. Transient backend failures are retried up to `retries` times.
pub async fn attach(
    client: &ClientHandle,
    route: &Route,
    retries: u32,
) -> Result<PooledServer, Error> {
    let started = Instant::now();
    let mut attempt = 0;

    loop {
        let checkout = match route.servers.try_checkout().await {
            Ok(Some(server)) => Ok(server),
            Ok(None) => {
                route.clients.set_waiting(client.id);
                info!(
                    "{} Client {} is waiting for a server",
                    route.key, client.id
                );
                let result = route.servers.checkout().await;
                if result.is_err() {
                    route.clients.stop_waiting(client.id);
                }
                result
            }
            Err(err) => Err(err),
        };

        match checkout {
            Ok(server) => return bind(client, route, server, started),
            Err(err) if err.class() == ErrorClass::TransientBackend && attempt < retries => {
                attempt += 1;
                warn!(
                    "{} Attach attempt {} of client {} failed: {}, retrying",
                    route.key, attempt, client.id, err
                );
            }
            Err(err) => {
                client.stats.checkout_error();
                return Err(err);
            }
        }
    }
}

/// Resolves the route of `(database, user)` and attaches to it.
pub async fn attach_by_key(
    client: &ClientHandle,
    database: &str,
    user: &str,
    retries: u32,
) -> Result<(Arc<Route>, PooledServer), Error> {
    let route = resolve(database, user)?;
    let server = attach(client, &route, retries).await?;
    Ok((route, server))
}

fn bind(
    client: &ClientHandle,
    route: &Route,
    mut server: PooledServer,
    started: Instant,
) -> Result<PooledServer, Error> {
    if !route.clients.set_attached(client.id, server.id()) {
        error!(
            "{} Server {} is already attached to another client",
            route.key, *server
        );
        server.mark_bad("attached twice");
        return Err(Error::ServerError);
    }

    let wait_us = started.elapsed().as_micros() as u64;
    server.stats.active(client.id, client.application_name.clone());
    server
        .stats
        .checkout_time(wait_us, client.application_name.clone());
    client.stats.checkout_success(server.id(), wait_us);

    CLIENT_SERVER_MAP.lock().insert(
        (client.id, client.secret),
        (
            server.get_process_id(),
            server.secret_key(),
            server.host().to_string(),
            server.port(),
        ),
    );

    Ok(server)
}

/// Detaches the server from the client and returns it to the route.
pub async fn release(client: &ClientHandle, route: &Route, server: PooledServer) {
    route.clients.detach(client.id);
    CLIENT_SERVER_MAP.lock().remove(&(client.id, client.secret));
    client.stats.checkin();
    route.servers.release(server).await;
}
