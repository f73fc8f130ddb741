use arc_swap::ArcSwap;
use chrono::{DateTime, Local};
use log::{debug, info};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{get_config, Config};
use crate::errors::Error;
use crate::server::BackendState;
use crate::stats::{RouteStatValues, ServerStats};

pub mod client_pool;
pub mod route;
pub mod server_pool;

#[cfg(test)]
pub(crate) mod test_backend;

pub use client_pool::{ClientPool, ClientPoolStatus};
pub use route::{ClientAuth, Route, RouteKey, RouteSettings};
pub use server_pool::{PooledServer, ServerPool, ServerPoolStatus};

pub type ProcessId = i32;
pub type SecretKey = i32;
pub type ServerHost = String;
pub type ServerPort = u16;

pub type ClientServerMap =
    Arc<Mutex<HashMap<(ProcessId, SecretKey), (ProcessId, SecretKey, ServerHost, ServerPort)>>>;
pub type RouteMap = HashMap<RouteKey, Arc<Route>>;

/// Every route created so far. Lookups load the map without locking,
/// creation swaps in a copy with the new route.
static ROUTES: Lazy<ArcSwap<RouteMap>> = Lazy::new(|| ArcSwap::from_pointee(HashMap::default()));

/// Serializes route creation so a key is created exactly once.
static ROUTES_CREATE: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Client (pid, secret) handed out by the pooler -> the backend currently serving it.
pub static CLIENT_SERVER_MAP: Lazy<ClientServerMap> =
    Lazy::new(|| Arc::new(Mutex::new(HashMap::new())));

/// One row of `enumerate_active_backends`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSummary {
    pub kind: &'static str,
    pub user: String,
    pub database: String,
    pub state: BackendState,
    pub addr: String,
    pub port: u16,
    pub local_addr: Option<String>,
    pub local_port: Option<u16>,
    pub connect_time: DateTime<Local>,
    pub request_time: Option<DateTime<Local>>,
    pub server_id: u64,
    pub link: Option<i32>,
    pub remote_pid: i32,
    pub tls: bool,
}

impl BackendSummary {
    pub fn new(stats: &ServerStats, state: BackendState) -> BackendSummary {
        let route = stats.route();
        BackendSummary {
            kind: "S",
            user: route.user.clone(),
            database: route.database.clone(),
            state,
            addr: stats.host().to_string(),
            port: stats.port(),
            local_addr: stats.local_addr().map(|addr| addr.ip().to_string()),
            local_port: stats.local_addr().map(|addr| addr.port()),
            connect_time: stats.connect_time(),
            request_time: stats.request_time(),
            server_id: stats.server_id(),
            link: stats.link(),
            remote_pid: stats.process_id(),
            tls: stats.tls(),
        }
    }
}

/// The route for `(database, user)`, created from the current config on first use.
pub fn resolve(database: &str, user: &str) -> Result<Arc<Route>, Error> {
    if let Some(route) = get_route(database, user) {
        return Ok(route);
    }
    resolve_with(&get_config(), database, user)
}

/// Same as [`resolve`] with an explicit config. Concurrent first calls for
/// one key all get the same route.
pub fn resolve_with(config: &Config, database: &str, user: &str) -> Result<Arc<Route>, Error> {
    let key = RouteKey::new(database, user);
    if let Some(route) = ROUTES.load().get(&key) {
        return Ok(route.clone());
    }

    let _create = ROUTES_CREATE.lock();
    if let Some(route) = ROUTES.load().get(&key) {
        return Ok(route.clone());
    }

    let settings = RouteSettings::from_config(config, &key)?;
    let route = Arc::new(Route::new(key.clone(), settings));

    let mut routes = (**ROUTES.load()).clone();
    routes.insert(key, route.clone());
    ROUTES.store(Arc::new(routes));

    Ok(route)
}

pub fn get_route(database: &str, user: &str) -> Option<Arc<Route>> {
    ROUTES.load().get(&RouteKey::new(database, user)).cloned()
}

pub fn get_all_routes() -> Arc<RouteMap> {
    ROUTES.load_full()
}

/// (key, totals, averages) of every route, ordered by key.
pub fn enumerate_routes() -> Vec<(RouteKey, RouteStatValues, RouteStatValues)> {
    let routes = get_all_routes();
    let mut rows: Vec<_> = routes
        .values()
        .map(|route| {
            (
                route.key.clone(),
                route.stats.total.snapshot(),
                route.stats.averages.snapshot(),
            )
        })
        .collect();
    rows.sort_by(|a, b| a.0.cmp(&b.0));
    rows
}

/// Every pooled backend of every route, idle and attached.
pub fn enumerate_active_backends() -> Vec<BackendSummary> {
    let routes = get_all_routes();
    let mut rows = Vec::new();
    for route in routes.values() {
        for (stats, state) in route.servers.members() {
            rows.push(BackendSummary::new(&stats, state));
        }
    }
    rows.sort_by_key(|row| row.server_id);
    rows
}

/// Closes idle servers past their idle timeout or lifetime, forever.
pub async fn retain_connections(interval_ms: u64) {
    info!("Retaining connections every {interval_ms}ms");
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(100)));
    loop {
        interval.tick().await;
        let mut closed = 0;
        for route in get_all_routes().values() {
            closed += route.servers.retain();
        }
        if closed > 0 {
            debug!("Retain closed {closed} servers");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::{Pool, User};
    use test_backend::FakeBackend;

    pub(crate) fn config_for(backend: &FakeBackend, database: &str, users: &[&str]) -> Config {
        let mut pool = Pool {
            server_host: "127.0.0.1".to_string(),
            server_port: backend.port,
            pool_size: 1,
            ..Pool::default()
        };
        for (i, user) in users.iter().enumerate() {
            pool.users.insert(
                i.to_string(),
                User {
                    username: user.to_string(),
                    password: "secret".to_string(),
                    pool_size: 1,
                    ..User::default()
                },
            );
        }
        let mut config = Config::default();
        config.pools.insert(database.to_string(), pool);
        config
    }

    #[tokio::test]
    async fn test_resolve_is_reference_stable() {
        let backend = FakeBackend::start().await;
        let config = Arc::new(config_for(&backend, "resolve_db", &["alice"]));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let config = config.clone();
            tasks.push(tokio::spawn(async move {
                resolve_with(&config, "resolve_db", "alice").unwrap()
            }));
        }
        let mut routes = Vec::new();
        for task in tasks {
            routes.push(task.await.unwrap());
        }
        let first = resolve_with(&config, "resolve_db", "alice").unwrap();
        assert!(routes.iter().all(|route| Arc::ptr_eq(route, &first)));
        assert!(Arc::ptr_eq(
            &get_route("resolve_db", "alice").unwrap(),
            &first
        ));
    }

    #[tokio::test]
    async fn test_resolve_unknown_route() {
        let backend = FakeBackend::start().await;
        let config = config_for(&backend, "known_db", &["alice"]);
        assert!(matches!(
            resolve_with(&config, "known_db", "mallory"),
            Err(Error::NoRoute(_))
        ));
        assert!(get_route("known_db", "mallory").is_none());
    }

    #[tokio::test]
    async fn test_enumerate_backends_and_routes() {
        let backend = FakeBackend::start().await;
        let config = config_for(&backend, "enum_db", &["alice"]);
        let route = resolve_with(&config, "enum_db", "alice").unwrap();

        let server = route.servers.checkout().await.unwrap();
        let id = server.id();
        let row = enumerate_active_backends()
            .into_iter()
            .find(|row| row.server_id == id)
            .unwrap();
        assert_eq!(row.kind, "S");
        assert_eq!(row.database, "enum_db");
        assert_eq!(row.state, BackendState::Active);
        assert_eq!(row.port, backend.port);
        assert!(row.remote_pid >= 1000);

        route.servers.release(server).await;
        let row = enumerate_active_backends()
            .into_iter()
            .find(|row| row.server_id == id)
            .unwrap();
        assert_eq!(row.state, BackendState::Idle);

        route.stats.query_count_add();
        let (_, total, _) = enumerate_routes()
            .into_iter()
            .find(|(key, _, _)| key == &route.key)
            .unwrap();
        assert_eq!(total.query_count, 1);
    }
}
