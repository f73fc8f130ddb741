/// Statistics for the connection pooler.
///
/// Per-connection state lives in [`ClientStats`] and [`ServerStats`], kept in
/// global registries that the console reads for SHOW CLIENTS and SHOW SERVERS.
/// Per-route aggregates live in [`RouteStats`]; the [`Collector`] turns the
/// current window of every route into moving averages once per `stats_period`.
use arc_swap::ArcSwap;
use log::{debug, info, warn};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Statistics for client connections
pub mod client;
/// Per-route aggregates
pub mod route;
/// Statistics for server connections
pub mod server;

pub use client::ClientStats;
pub use route::{RouteStatValues, RouteStats};
pub use server::ServerStats;

/// Maps pooler-assigned client ids to their statistics.
type ClientStatesLookup = HashMap<i32, Arc<ClientStats>>;

/// Maps server ids to their statistics.
type ServerStatesLookup = HashMap<u64, Arc<ServerStats>>;

static CLIENT_STATS: Lazy<Arc<RwLock<ClientStatesLookup>>> =
    Lazy::new(|| Arc::new(RwLock::new(ClientStatesLookup::default())));

static SERVER_STATS: Lazy<Arc<RwLock<ServerStatesLookup>>> =
    Lazy::new(|| Arc::new(RwLock::new(ServerStatesLookup::default())));

pub static REPORTER: Lazy<ArcSwap<Reporter>> =
    Lazy::new(|| ArcSwap::from_pointee(Reporter::default()));

/// Registers and unregisters statistics sources.
///
/// An instance of this reporter is given to each client and server.
#[derive(Clone, Debug, Default)]
pub struct Reporter {}

impl Reporter {
    /// If a client with the same id is already registered the call is ignored.
    fn client_register(&self, client_id: i32, stats: Arc<ClientStats>) {
        if CLIENT_STATS.read().get(&client_id).is_some() {
            warn!("Client {client_id:?} was double registered!");
            return;
        }

        CLIENT_STATS.write().insert(client_id, stats);
    }

    fn client_disconnecting(&self, client_id: i32) {
        CLIENT_STATS.write().remove(&client_id);
    }

    fn server_register(&self, server_id: u64, stats: Arc<ServerStats>) {
        SERVER_STATS.write().insert(server_id, stats);
    }

    fn server_disconnecting(&self, server_id: u64) {
        SERVER_STATS.write().remove(&server_id);
    }
}

/// Periodically folds the current window of every route into averages.
#[derive(Default)]
pub struct Collector {}

impl Collector {
    /// Spawns the collector task and returns.
    pub async fn collect(&mut self, stats_period: u64) {
        info!("Stats collector started, period {stats_period}ms");

        tokio::task::spawn(async move {
            let mut interval = tokio::time::interval(tokio::time::Duration::from_millis(
                stats_period.max(1_000),
            ));

            loop {
                interval.tick().await;
                collect_once(stats_period);
            }
        });
    }
}

/// One collection step over every route.
pub fn collect_once(stats_period: u64) {
    let routes = crate::pool::get_all_routes();
    for route in routes.values() {
        route.stats.update_averages(stats_period);
        route.stats.reset_current_counts();
    }
    debug!(
        "Stats collected: {} routes, {} clients, {} servers",
        routes.len(),
        CLIENT_STATS.read().len(),
        SERVER_STATS.read().len()
    );
}

pub fn get_client_stats() -> ClientStatesLookup {
    CLIENT_STATS.read().clone()
}

pub fn get_server_stats() -> ServerStatesLookup {
    SERVER_STATS.read().clone()
}

pub fn get_reporter() -> Reporter {
    (*(*REPORTER.load())).clone()
}
