use super::RouteStats;
use super::{get_reporter, Reporter};
use crate::pool::RouteKey;
use chrono::{DateTime, Local, TimeZone};
use iota::iota;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::atomic::*;
use std::sync::Arc;

// Server state constants used to track the current activity state of a server connection.
//
// - LOGIN: connecting or authenticating
// - ACTIVE: attached to a client
// - IDLE: parked in the server pool
iota! {
    pub const SERVER_STATE_LOGIN: u8 = 30 << iota;
        , SERVER_STATE_ACTIVE
        , SERVER_STATE_IDLE
}

// What the server connection is blocked on.
iota! {
    pub const SERVER_WAIT_IDLE: u8 = 40 << iota;
        , SERVER_WAIT_READ
        , SERVER_WAIT_WRITE
}

/// Statistics and state information for a server connection.
///
/// Backs the SHOW SERVERS console command and feeds the per-route
/// aggregates in [`RouteStats`].
#[derive(Debug, Clone)]
pub struct ServerStats {
    /// Pool-wide unique id of the backend connection, shown as `ptr`.
    server_id: u64,
    /// PostgreSQL backend process ID
    process_id: Arc<AtomicI32>,

    /// Connection context information
    /// ------------------------------------------------------------------------------------------
    route: RouteKey,
    host: String,
    port: u16,
    local_addr: Option<SocketAddr>,
    tls: bool,
    connect_time: DateTime<Local>,

    /// Aggregates of the route this connection belongs to.
    route_stats: Arc<RouteStats>,

    /// Reporter instance used to register/unregister this server with the stats system
    reporter: Reporter,

    /// Server state and activity data
    /// ------------------------------------------------------------------------------------------
    pub application_name: Arc<RwLock<String>>,
    pub state: Arc<AtomicU8>,
    pub wait: Arc<AtomicU8>,
    /// Pooler id of the attached client, 0 when none.
    pub link: Arc<AtomicI32>,
    /// Unix time in milliseconds of the last request, 0 before the first one.
    pub request_time: Arc<AtomicI64>,

    /// Network traffic counters
    /// ------------------------------------------------------------------------------------------
    pub bytes_sent: Arc<AtomicU64>,
    pub bytes_received: Arc<AtomicU64>,

    /// Query and transaction counters
    /// ------------------------------------------------------------------------------------------
    pub transaction_count: Arc<AtomicU64>,
    pub query_count: Arc<AtomicU64>,
    pub error_count: Arc<AtomicU64>,
}

impl Default for ServerStats {
    fn default() -> Self {
        ServerStats {
            server_id: 0,
            process_id: Arc::new(AtomicI32::new(0)),
            route: RouteKey::new("database", "username"),
            host: String::from("127.0.0.1"),
            port: 5432,
            local_addr: None,
            tls: false,
            connect_time: Local::now(),
            route_stats: Arc::new(RouteStats::default()),
            reporter: get_reporter(),
            application_name: Arc::new(RwLock::new(String::new())),
            state: Arc::new(AtomicU8::new(SERVER_STATE_LOGIN)),
            wait: Arc::new(AtomicU8::new(SERVER_WAIT_IDLE)),
            link: Arc::new(AtomicI32::new(0)),
            request_time: Arc::new(AtomicI64::new(0)),
            bytes_sent: Arc::new(AtomicU64::new(0)),
            bytes_received: Arc::new(AtomicU64::new(0)),
            transaction_count: Arc::new(AtomicU64::new(0)),
            query_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ServerStats {
    /// Creates the stats of a freshly connected backend.
    pub fn new(
        server_id: u64,
        route: RouteKey,
        host: &str,
        port: u16,
        local_addr: Option<SocketAddr>,
        tls: bool,
        route_stats: Arc<RouteStats>,
    ) -> Self {
        Self {
            server_id,
            route,
            host: host.to_string(),
            port,
            local_addr,
            tls,
            route_stats,
            connect_time: Local::now(),
            ..Default::default()
        }
    }

    //
    // Basic accessors
    // ------------------------------------------------------------------------------------------

    pub fn server_id(&self) -> u64 {
        self.server_id
    }

    pub fn process_id(&self) -> i32 {
        self.process_id.load(Ordering::Relaxed)
    }

    pub fn update_process_id(&self, id: i32) {
        self.process_id.store(id, Ordering::Relaxed);
    }

    //
    // Server lifecycle management
    // ------------------------------------------------------------------------------------------

    /// Registers the server connection with the stats system.
    pub fn register(&self, stats: Arc<ServerStats>) {
        self.reporter.server_register(self.server_id, stats);
        self.login();
    }

    /// Removes the server connection from the stats system.
    #[inline(always)]
    pub fn disconnect(&self) {
        self.reporter.server_disconnecting(self.server_id);
    }

    //
    // Server state management
    // ------------------------------------------------------------------------------------------

    pub fn login(&self) {
        self.state.store(SERVER_STATE_LOGIN, Ordering::Relaxed);
        self.set_undefined_application();
    }

    /// The server was handed to the client `client_id`.
    pub fn active(&self, client_id: i32, application_name: String) {
        self.state.store(SERVER_STATE_ACTIVE, Ordering::Relaxed);
        self.link.store(client_id, Ordering::Relaxed);
        self.set_application(application_name);
    }

    /// The server went back to the idle set.
    #[inline(always)]
    pub fn idle(&self) {
        self.link.store(0, Ordering::Relaxed);
        self.state.store(SERVER_STATE_IDLE, Ordering::Relaxed);
    }

    /// Records how long the server was attached and sets it IDLE.
    #[inline(always)]
    pub fn add_xact_time_and_idle(&self, microseconds: u64) {
        self.idle();
        self.route_stats.xact_time_add(microseconds);
    }

    //
    // Wait state management
    // ------------------------------------------------------------------------------------------

    #[inline]
    pub fn wait_reading(&self) {
        self.wait.store(SERVER_WAIT_READ, Ordering::Relaxed);
    }

    #[inline]
    pub fn wait_writing(&self) {
        self.wait.store(SERVER_WAIT_WRITE, Ordering::Relaxed);
    }

    #[inline]
    pub fn wait_idle(&self) {
        self.wait.store(SERVER_WAIT_IDLE, Ordering::Relaxed);
    }

    //
    // State conversion utilities
    // ------------------------------------------------------------------------------------------

    pub fn state_to_string(&self) -> String {
        match self.state.load(Ordering::Relaxed) {
            SERVER_STATE_ACTIVE => "active".to_string(),
            SERVER_STATE_IDLE => "idle".to_string(),
            SERVER_STATE_LOGIN => "login".to_string(),
            _ => "unknown".to_string(),
        }
    }

    pub fn wait_to_string(&self) -> String {
        match self.wait.load(Ordering::Relaxed) {
            SERVER_WAIT_IDLE => "idle".to_string(),
            SERVER_WAIT_READ => "read".to_string(),
            SERVER_WAIT_WRITE => "write".to_string(),
            _ => "unknown".to_string(),
        }
    }

    //
    // Application name management
    // ------------------------------------------------------------------------------------------

    fn set_application(&self, name: String) {
        let mut application_name = self.application_name.write();
        *application_name = name;
    }

    #[inline(always)]
    fn set_undefined_application(&self) {
        self.set_application(String::from("Undefined"))
    }

    //
    // Activity tracking
    // ------------------------------------------------------------------------------------------

    pub fn route_stats(&self) -> Arc<RouteStats> {
        self.route_stats.clone()
    }

    /// Records the time the client waited for this server.
    #[inline(always)]
    pub fn checkout_time(&self, microseconds: u64, application_name: String) {
        self.set_application(application_name);
        self.route_stats.wait_time_add(microseconds);
    }

    /// Records one request/response exchange.
    #[inline(always)]
    pub fn query(&self, microseconds: u64, application_name: &str) {
        self.set_application(application_name.to_string());
        self.request_time
            .store(Local::now().timestamp_millis(), Ordering::Relaxed);
        self.route_stats.query_count_add();
        self.route_stats.query_time_add_microseconds(microseconds);
        self.query_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed transaction. A statement outside of a transaction
    /// counts as one.
    #[inline(always)]
    pub fn transaction(&self, application_name: &str) {
        self.set_application(application_name.to_string());
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
        self.route_stats.xact_count_add();
    }

    #[inline(always)]
    pub fn error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.route_stats.error();
    }

    /// Bytes written to the server, i.e. received from the client.
    #[inline(always)]
    pub fn data_sent(&self, amount_bytes: usize) {
        self.bytes_sent
            .fetch_add(amount_bytes as u64, Ordering::Relaxed);
        self.route_stats.bytes_received_add(amount_bytes as u64);
    }

    /// Bytes read from the server, i.e. sent to the client.
    #[inline(always)]
    pub fn data_received(&self, amount_bytes: usize) {
        self.bytes_received
            .fetch_add(amount_bytes as u64, Ordering::Relaxed);
        self.route_stats.bytes_sent_add(amount_bytes as u64);
    }

    //
    // Accessor methods for SHOW SERVERS command
    // ------------------------------------------------------------------------------------------

    pub fn route(&self) -> &RouteKey {
        &self.route
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn connect_time(&self) -> DateTime<Local> {
        self.connect_time
    }

    pub fn link(&self) -> Option<i32> {
        match self.link.load(Ordering::Relaxed) {
            0 => None,
            client_id => Some(client_id),
        }
    }

    pub fn request_time(&self) -> Option<DateTime<Local>> {
        match self.request_time.load(Ordering::Relaxed) {
            0 => None,
            millis => Local.timestamp_millis_opt(millis).single(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::get_server_stats;

    fn create_test_server_stats(server_id: u64) -> ServerStats {
        ServerStats::new(
            server_id,
            RouteKey::new("stats_db", "stats_user"),
            "10.0.0.1",
            6543,
            Some("127.0.0.1:40000".parse().unwrap()),
            true,
            Arc::new(RouteStats::default()),
        )
    }

    #[test]
    fn test_server_stats_new() {
        let stats = create_test_server_stats(7);
        assert_eq!(stats.server_id(), 7);
        assert_eq!(stats.route().database, "stats_db");
        assert_eq!(stats.route().user, "stats_user");
        assert_eq!(stats.host(), "10.0.0.1");
        assert_eq!(stats.port(), 6543);
        assert!(stats.tls());
        assert_eq!(stats.process_id(), 0);
        assert_eq!(stats.state.load(Ordering::Relaxed), SERVER_STATE_LOGIN);
        assert_eq!(stats.link(), None);
        assert_eq!(stats.request_time(), None);
    }

    #[test]
    fn test_register_and_disconnect() {
        let stats = Arc::new(create_test_server_stats(u64::MAX - 11));
        stats.register(stats.clone());
        assert!(get_server_stats().contains_key(&stats.server_id()));
        assert_eq!(*stats.application_name.read(), "Undefined");

        stats.disconnect();
        assert!(!get_server_stats().contains_key(&stats.server_id()));
    }

    #[test]
    fn test_state_transitions() {
        let stats = create_test_server_stats(8);
        stats.active(42, "app".to_string());
        assert_eq!(stats.state_to_string(), "active");
        assert_eq!(stats.link(), Some(42));
        assert_eq!(*stats.application_name.read(), "app");

        stats.add_xact_time_and_idle(250);
        assert_eq!(stats.state_to_string(), "idle");
        assert_eq!(stats.link(), None);
        assert_eq!(
            stats
                .route_stats()
                .total
                .xact_time_microseconds
                .load(Ordering::Relaxed),
            250
        );

        stats.wait_reading();
        assert_eq!(stats.wait_to_string(), "read");
        stats.wait_writing();
        assert_eq!(stats.wait_to_string(), "write");
        stats.wait_idle();
        assert_eq!(stats.wait_to_string(), "idle");
    }

    #[test]
    fn test_activity_feeds_route_stats() {
        let stats = create_test_server_stats(9);
        stats.query(1_000, "app");
        stats.transaction("app");
        stats.data_sent(10);
        stats.data_received(20);
        stats.error();

        let totals = stats.route_stats().total.snapshot();
        assert_eq!(totals.query_count, 1);
        assert_eq!(totals.query_time_microseconds, 1_000);
        assert_eq!(totals.xact_count, 1);
        assert_eq!(totals.bytes_received, 10);
        assert_eq!(totals.bytes_sent, 20);
        assert_eq!(totals.errors, 1);
        assert!(stats.request_time().is_some());
        assert_eq!(stats.query_count.load(Ordering::Relaxed), 1);
    }
}
