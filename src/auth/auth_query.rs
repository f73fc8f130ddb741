//! Password lookup in the backend for users missing from the config.
use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

use crate::config::get_config;
use crate::errors::Error;
use crate::messages::{bind_message, execute_message, parse_message, read_data_row, sync};
use crate::pool::{resolve_with, Route};
use crate::router::{self, ClientHandle};
use crate::server::Server;
use crate::stats::ClientStats;

/// Ids of the internal clients running auth queries. Negative so they never
/// collide with the ids handed out to real clients.
static NEXT_AUTH_CLIENT_ID: AtomicI32 = AtomicI32::new(-1);

/// Runs the pool's `auth_query` for `user` and returns the password hash it finds.
pub async fn fetch_password_hash(database: &str, user: &str) -> Result<String, Error> {
    let config = get_config();
    let pool = config
        .pools
        .get(database)
        .ok_or_else(|| Error::NoRoute(format!("database \"{database}\" does not exist")))?;
    let (query, auth_user) = match (&pool.auth_query, &pool.auth_query_user) {
        (Some(query), Some(auth_user)) => (query.clone(), auth_user.clone()),
        _ => {
            return Err(Error::AuthError(format!(
                "no auth query configured for database \"{database}\""
            )))
        }
    };

    let route = resolve_with(&config, database, &auth_user)?;
    fetch_from_route(&route, &query, user, config.general.attach_retries).await
}

/// Same as [`fetch_password_hash`] against an already resolved route.
pub async fn fetch_from_route(
    route: &Route,
    query: &str,
    user: &str,
    retries: u32,
) -> Result<String, Error> {
    let client = auth_client(route);
    route.clients.register(client.id, client.stats.clone());

    let result = match router::attach(&client, route, retries).await {
        Ok(mut server) => {
            let result = run_auth_query(&mut server, query, user).await;
            router::release(&client, route, server).await;
            result
        }
        Err(err) => Err(err),
    };

    route.clients.unregister(client.id);
    match &result {
        Ok(_) => debug!("{} Auth query found a password for {user}", route.key),
        Err(err) => warn!("{} Auth query for {user} failed: {err}", route.key),
    }
    result
}

fn auth_client(route: &Route) -> ClientHandle {
    let id = NEXT_AUTH_CLIENT_ID.fetch_sub(1, Ordering::Relaxed);
    let stats = Arc::new(ClientStats::new(
        id,
        "auth_query",
        &route.key.user,
        &route.key.database,
        "internal",
        Instant::now(),
        false,
    ));
    ClientHandle::new(id, 0, "auth_query", stats)
}

async fn run_auth_query(server: &mut Server, query: &str, user: &str) -> Result<String, Error> {
    let mut request = BytesMut::new();
    request.put(parse_message(query));
    request.put(bind_message(&[user]));
    request.put(execute_message());
    request.put(sync());
    server.send_and_flush(&request).await?;

    let mut rows = Vec::new();
    let mut failure = None;
    loop {
        let mut reply = server.recv(tokio::io::sink(), None).await?;
        while reply.remaining() >= 5 {
            let code = reply.get_u8();
            let len = reply.get_i32() as usize;
            if len < 4 || reply.remaining() < len - 4 {
                return Err(Error::ServerMessageParserError(
                    "truncated auth query reply".to_string(),
                ));
            }
            let body = reply.split_to(len - 4);
            match code {
                b'D' => rows.push(read_data_row(body)?),
                b'E' => failure = Some(String::from_utf8_lossy(&body).to_string()),
                _ => (),
            }
        }
        if !server.is_data_available() {
            break;
        }
    }

    if let Some(failure) = failure {
        return Err(Error::AuthError(format!(
            "auth query failed for user \"{user}\": {}",
            failure.replace('\0', " ").trim()
        )));
    }
    password_from_rows(user, rows)
}

fn password_from_rows(user: &str, mut rows: Vec<Vec<Option<String>>>) -> Result<String, Error> {
    match rows.len() {
        0 => Err(Error::AuthError(format!("no password found for user \"{user}\""))),
        1 => match rows.pop().and_then(|mut row| {
            if row.len() >= 2 {
                row.swap_remove(1)
            } else {
                None
            }
        }) {
            Some(hash) => Ok(hash),
            None => Err(Error::AuthError(format!("password of user \"{user}\" is NULL"))),
        },
        n => Err(Error::AuthError(format!(
            "auth query returned {n} rows for user \"{user}\""
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_backend::{settings_for, FakeBackend};
    use crate::pool::RouteKey;

    const QUERY: &str = "SELECT usename, passwd FROM pg_shadow WHERE usename = $1";

    fn route(backend: &FakeBackend) -> Route {
        Route::new(RouteKey::new("app", "alice"), settings_for(backend))
    }

    #[tokio::test]
    async fn test_fetch_single_row() {
        let backend = FakeBackend::start().await;
        backend.add_shadow_row("carol", Some("md5c0ffee"));
        let route = route(&backend);

        let hash = fetch_from_route(&route, QUERY, "carol", 0).await.unwrap();
        assert_eq!(hash, "md5c0ffee");

        // The backend went back to the pool and no client is left behind.
        let status = route.servers.status();
        assert_eq!(status.idle, 1);
        assert_eq!(status.active, 0);
        assert_eq!(route.clients.status().total, 0);
    }

    #[tokio::test]
    async fn test_fetch_errors() {
        let backend = FakeBackend::start().await;
        backend.add_shadow_row("nullpw", None);
        backend.add_shadow_row("twice", Some("md5a"));
        backend.add_shadow_row("twice", Some("md5b"));
        let route = route(&backend);

        for user in ["nobody", "nullpw", "twice"] {
            let err = fetch_from_route(&route, QUERY, user, 0).await.unwrap_err();
            assert!(matches!(err, Error::AuthError(_)), "{user}: {err:?}");
        }
        assert_eq!(route.servers.status().idle, 1);
        assert_eq!(backend.connections(), 1);
    }

    #[test]
    fn test_password_from_rows() {
        let row = |hash: Option<&str>| vec![Some("u".to_string()), hash.map(str::to_string)];
        assert_eq!(
            password_from_rows("u", vec![row(Some("md5x"))]).unwrap(),
            "md5x"
        );
        assert!(password_from_rows("u", vec![vec![Some("u".to_string())]]).is_err());
    }
}
