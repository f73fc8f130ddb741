use arc_swap::ArcSwap;
use ipnet::IpNet;
use log::{error, info};
use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::errors::Error;
use crate::tls::load_identity;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Globally available configuration.
static CONFIG: Lazy<ArcSwap<Config>> = Lazy::new(|| ArcSwap::from_pointee(Config::default()));

/// Pool mode:
/// - session: server is attached to the client until it disconnects,
/// - transaction: server serves one transaction,
/// - statement: server serves one request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Copy, Hash)]
pub enum PoolMode {
    #[serde(alias = "session", alias = "Session")]
    Session,

    #[serde(alias = "transaction", alias = "Transaction")]
    Transaction,

    #[serde(alias = "statement", alias = "Statement")]
    Statement,
}

impl Display for PoolMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match *self {
            PoolMode::Session => "session",
            PoolMode::Transaction => "transaction",
            PoolMode::Statement => "statement",
        };
        write!(f, "{str}")
    }
}

/// PostgreSQL user.
#[derive(Clone, PartialEq, Hash, Eq, Serialize, Deserialize, Debug)]
pub struct User {
    pub username: String,
    pub password: String,
    pub pool_size: u32,
    pub pool_mode: Option<PoolMode>,
    pub server_lifetime: Option<u64>,
    // If the server_username parameter is specified,
    // authorization on the server will be performed using the credentials
    // of THIS server_user and server_password.
    pub server_username: Option<String>,
    pub server_password: Option<String>,
}

impl Default for User {
    fn default() -> User {
        User {
            username: String::from("postgres"),
            password: String::from(""),
            pool_size: 40,
            pool_mode: None,
            server_lifetime: None,
            server_username: None,
            server_password: None,
        }
    }
}

impl User {
    fn validate(&self, pool_name: &str) -> Result<(), Error> {
        if self.server_password.is_some() && self.server_username.is_none() {
            return Err(Error::BadConfig(format!(
                "[pool: {pool_name}][user: {}] server_password requires server_username",
                self.username
            )));
        }
        if self.pool_size == 0 {
            return Err(Error::BadConfig(format!(
                "[pool: {pool_name}][user: {}] pool_size must be greater than 0",
                self.username
            )));
        }
        if self.password.is_empty() {
            return Err(Error::BadConfig(format!(
                "[pool: {pool_name}][user: {}] password is required",
                self.username
            )));
        }
        Ok(())
    }
}

/// General configuration.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct General {
    #[serde(default = "General::default_host")]
    pub host: String,

    #[serde(default = "General::default_port")]
    pub port: u16,

    #[serde(default = "General::default_connect_timeout")]
    pub connect_timeout: u64,

    // How long a client may wait for a server connection, 0 waits forever.
    #[serde(default = "General::default_query_wait_timeout")]
    pub query_wait_timeout: u64,

    #[serde(default = "General::default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "General::default_server_lifetime")]
    pub server_lifetime: u64,

    #[serde(default = "General::default_retain_connections_interval")]
    pub retain_connections_interval: u64,

    #[serde(default = "General::default_attach_retries")]
    pub attach_retries: u32,

    #[serde(default = "General::default_tcp_keepalives_idle")]
    pub tcp_keepalives_idle: u64,
    #[serde(default = "General::default_tcp_keepalives_count")]
    pub tcp_keepalives_count: u32,
    #[serde(default = "General::default_tcp_keepalives_interval")]
    pub tcp_keepalives_interval: u64,
    #[serde(default = "General::default_tcp_so_linger")]
    pub tcp_so_linger: u64,
    #[serde(default = "General::default_tcp_no_delay")]
    pub tcp_no_delay: bool,

    #[serde(default = "General::default_true")]
    pub log_client_connections: bool,

    #[serde(default = "General::default_true")]
    pub log_client_disconnections: bool,

    #[serde(default = "General::default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    #[serde(default = "General::default_max_memory_usage")]
    pub max_memory_usage: u64,

    // Messages larger than this are streamed to the client instead of buffered.
    #[serde(default = "General::default_message_size_to_be_stream")]
    pub message_size_to_be_stream: u32,

    #[serde(default = "General::default_proxy_copy_data_timeout")]
    pub proxy_copy_data_timeout: u64,

    #[serde(default = "General::default_max_connections")]
    pub max_connections: u64,

    #[serde(default = "General::default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default = "General::default_backlog")]
    pub backlog: u32,

    #[serde(default = "General::default_stats_period")]
    pub stats_period: u64,

    pub tls_certificate: Option<String>,
    pub tls_private_key: Option<String>,

    #[serde(default = "General::default_admin_username")]
    pub admin_username: String,
    #[serde(default = "General::default_admin_password")]
    pub admin_password: String,

    pub syslog_prog_name: Option<String>,

    #[serde(default = "General::default_hba")]
    pub hba: Vec<IpNet>,
}

impl General {
    pub fn default_host() -> String {
        "0.0.0.0".into()
    }

    pub fn default_port() -> u16 {
        6432
    }

    pub fn default_connect_timeout() -> u64 {
        3_000
    }

    pub fn default_query_wait_timeout() -> u64 {
        5_000
    }

    pub fn default_idle_timeout() -> u64 {
        300_000 // 5 minutes
    }

    pub fn default_server_lifetime() -> u64 {
        1000 * 60 * 60 // 1 hour
    }

    pub fn default_retain_connections_interval() -> u64 {
        60_000
    }

    pub fn default_attach_retries() -> u32 {
        3
    }

    // These keepalive defaults should detect a dead connection within 30 seconds.
    pub fn default_tcp_keepalives_idle() -> u64 {
        5
    }

    pub fn default_tcp_keepalives_count() -> u32 {
        5
    }

    pub fn default_tcp_keepalives_interval() -> u64 {
        5
    }

    pub fn default_tcp_so_linger() -> u64 {
        0
    }

    pub fn default_tcp_no_delay() -> bool {
        true
    }

    pub fn default_true() -> bool {
        true
    }

    pub fn default_shutdown_timeout() -> u64 {
        10_000
    }

    pub fn default_max_memory_usage() -> u64 {
        256 * 1024 * 1024
    }

    pub fn default_message_size_to_be_stream() -> u32 {
        1024 * 1024
    }

    pub fn default_proxy_copy_data_timeout() -> u64 {
        15_000
    }

    pub fn default_max_connections() -> u64 {
        8 * 1024
    }

    pub fn default_worker_threads() -> usize {
        4
    }

    pub fn default_backlog() -> u32 {
        0
    }

    pub fn default_stats_period() -> u64 {
        15_000
    }

    pub fn default_admin_username() -> String {
        "admin".to_string()
    }

    pub fn default_admin_password() -> String {
        "admin".to_string()
    }

    pub fn default_hba() -> Vec<IpNet> {
        vec![]
    }

    pub fn default_include_files() -> Vec<String> {
        vec![]
    }

    pub fn default_include() -> Include {
        Include {
            files: Self::default_include_files(),
        }
    }
}

impl Default for General {
    fn default() -> General {
        General {
            host: Self::default_host(),
            port: Self::default_port(),
            connect_timeout: Self::default_connect_timeout(),
            query_wait_timeout: Self::default_query_wait_timeout(),
            idle_timeout: Self::default_idle_timeout(),
            server_lifetime: Self::default_server_lifetime(),
            retain_connections_interval: Self::default_retain_connections_interval(),
            attach_retries: Self::default_attach_retries(),
            tcp_keepalives_idle: Self::default_tcp_keepalives_idle(),
            tcp_keepalives_count: Self::default_tcp_keepalives_count(),
            tcp_keepalives_interval: Self::default_tcp_keepalives_interval(),
            tcp_so_linger: Self::default_tcp_so_linger(),
            tcp_no_delay: Self::default_tcp_no_delay(),
            log_client_connections: true,
            log_client_disconnections: true,
            shutdown_timeout: Self::default_shutdown_timeout(),
            max_memory_usage: Self::default_max_memory_usage(),
            message_size_to_be_stream: Self::default_message_size_to_be_stream(),
            proxy_copy_data_timeout: Self::default_proxy_copy_data_timeout(),
            max_connections: Self::default_max_connections(),
            worker_threads: Self::default_worker_threads(),
            backlog: Self::default_backlog(),
            stats_period: Self::default_stats_period(),
            tls_certificate: None,
            tls_private_key: None,
            admin_username: Self::default_admin_username(),
            admin_password: Self::default_admin_password(),
            syslog_prog_name: None,
            hba: Self::default_hba(),
        }
    }
}

/// Scheme of one database as seen by clients.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pool {
    /// Mode for routes whose user does not set one.
    #[serde(default = "Pool::default_pool_mode")]
    pub pool_mode: PoolMode,

    /// Pool size for routes of users that are not listed (auth query users).
    #[serde(default = "Pool::default_pool_size")]
    pub pool_size: u32,

    /// Maximum time to allow for establishing a new server connection.
    pub connect_timeout: Option<u64>,

    /// Maximum time a client waits for a server connection.
    pub query_wait_timeout: Option<u64>,

    /// Close idle connections that have been opened for longer than this.
    pub idle_timeout: Option<u64>,

    /// Close server connections that have been opened for longer than this.
    /// Only applied to idle connections.
    pub server_lifetime: Option<u64>,

    /// Rollback and RESET ALL on checkin when the session was dirtied.
    #[serde(default = "Pool::default_cleanup_server_connections")]
    pub cleanup_server_connections: bool,

    /// Query run on every checkin in transaction and statement mode, e.g. "DISCARD ALL".
    pub reset_query: Option<String>,

    pub application_name: Option<String>,

    #[serde(default = "Pool::default_server_host")]
    pub server_host: String,

    #[serde(default = "Pool::default_server_port")]
    pub server_port: u16,

    // The real name of the database on the server. If it is not specified, the pool name is used.
    pub server_database: Option<String>,

    #[serde(default)] // false
    pub server_tls: bool,

    /// Query returning (usename, passwd) for the user given as $1.
    pub auth_query: Option<String>,
    pub auth_query_user: Option<String>,
    pub auth_query_password: Option<String>,

    #[serde(default)]
    pub users: BTreeMap<String, User>,
    // Note, don't put simple fields below this map, TOML cannot serialize
    // plain values after tables.
}

impl Pool {
    pub fn default_pool_mode() -> PoolMode {
        PoolMode::Transaction
    }

    pub fn default_pool_size() -> u32 {
        20
    }

    pub fn default_server_port() -> u16 {
        5432
    }

    pub fn default_server_host() -> String {
        String::from("127.0.0.1")
    }

    pub fn default_cleanup_server_connections() -> bool {
        true
    }

    pub fn user(&self, username: &str) -> Option<&User> {
        self.users.values().find(|user| user.username == username)
    }

    fn validate(&self, pool_name: &str) -> Result<(), Error> {
        if self.pool_size == 0 {
            return Err(Error::BadConfig(format!(
                "[pool: {pool_name}] pool_size must be greater than 0"
            )));
        }
        let mut seen = std::collections::HashSet::new();
        for user in self.users.values() {
            user.validate(pool_name)?;
            if !seen.insert(user.username.as_str()) {
                return Err(Error::BadConfig(format!(
                    "[pool: {pool_name}] user {} is configured twice",
                    user.username
                )));
            }
        }
        if self.auth_query.is_some() && self.auth_query_user.is_none() {
            return Err(Error::BadConfig(format!(
                "[pool: {pool_name}] auth_query requires auth_query_user"
            )));
        }
        if let Some(reset_query) = &self.reset_query {
            if reset_query.trim().is_empty() {
                return Err(Error::BadConfig(format!(
                    "[pool: {pool_name}] reset_query must not be empty"
                )));
            }
        }
        Ok(())
    }
}

impl Default for Pool {
    fn default() -> Pool {
        Pool {
            pool_mode: Self::default_pool_mode(),
            pool_size: Self::default_pool_size(),
            connect_timeout: None,
            query_wait_timeout: None,
            idle_timeout: None,
            server_lifetime: None,
            cleanup_server_connections: true,
            reset_query: None,
            application_name: None,
            server_host: Self::default_server_host(),
            server_port: Self::default_server_port(),
            server_database: None,
            server_tls: false,
            auth_query: None,
            auth_query_user: None,
            auth_query_password: None,
            users: BTreeMap::default(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Include {
    #[serde(default = "General::default_include_files")]
    pub files: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct GeneralWithInclude {
    #[serde(default = "General::default_include")]
    pub include: Include,
}

/// Configuration wrapper.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    // Simple fields go before nested tables, otherwise the TOML
    // serializer fails with ValueAfterTable.
    #[serde(default = "Config::default_path")]
    pub path: String,

    // General and global settings.
    #[serde(default)]
    pub general: General,

    // Connection pools.
    #[serde(default)]
    pub pools: HashMap<String, Pool>,

    // Include files.
    #[serde(default = "General::default_include")]
    pub include: Include,
}

impl Config {
    pub fn default_path() -> String {
        String::from("pg_router.toml")
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            path: Self::default_path(),
            general: General::default(),
            pools: HashMap::default(),
            include: Include { files: Vec::new() },
        }
    }
}

impl Config {
    /// Print current configuration.
    pub fn show(&self) {
        info!("Worker threads: {}", self.general.worker_threads);
        info!("Connection timeout: {}ms", self.general.connect_timeout);
        info!("Query wait timeout: {}ms", self.general.query_wait_timeout);
        info!("Idle timeout: {}ms", self.general.idle_timeout);
        info!(
            "Default max server lifetime: {}ms",
            self.general.server_lifetime
        );
        info!("Attach retries: {}", self.general.attach_retries);
        info!("Shutdown timeout: {}ms", self.general.shutdown_timeout);
        info!(
            "Max memory usage for processing messages: {}",
            self.general.max_memory_usage
        );
        info!("Max connections: {}", self.general.max_connections);
        info!("Stats period: {}ms", self.general.stats_period);
        info!("HBA config: {:?}", self.general.hba);
        match &self.general.tls_certificate {
            Some(tls_certificate) => {
                info!("TLS certificate: {tls_certificate}");
                info!("TLS support is enabled");
            }
            None => info!("TLS support is disabled"),
        };

        for (pool_name, pool_config) in &self.pools {
            info!(
                "[pool: {}] Server: {}:{}/{}",
                pool_name,
                pool_config.server_host,
                pool_config.server_port,
                pool_config
                    .server_database
                    .as_deref()
                    .unwrap_or(pool_name.as_str())
            );
            info!(
                "[pool: {}] Default pool mode: {}",
                pool_name, pool_config.pool_mode
            );
            info!(
                "[pool: {}] Default pool size: {}",
                pool_name, pool_config.pool_size
            );
            info!(
                "[pool: {}] Reset query: {}",
                pool_name,
                pool_config.reset_query.as_deref().unwrap_or("none")
            );
            if let Some(auth_query_user) = &pool_config.auth_query_user {
                info!("[pool: {pool_name}] Auth query user: {auth_query_user}");
            }

            for user in pool_config.users.values() {
                info!(
                    "[pool: {}][user: {}] Pool size: {}, pool mode: {}",
                    pool_name,
                    user.username,
                    user.pool_size,
                    user.pool_mode.unwrap_or(pool_config.pool_mode)
                );
            }
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        match (&self.general.tls_certificate, &self.general.tls_private_key) {
            (Some(tls_certificate), Some(tls_private_key)) => {
                if let Err(err) =
                    load_identity(Path::new(tls_certificate), Path::new(tls_private_key))
                {
                    return Err(Error::BadConfig(format!(
                        "tls is incorrectly configured: {err:?}"
                    )));
                }
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(Error::BadConfig(
                    "tls_certificate and tls_private_key must be set together".to_string(),
                ));
            }
            (None, None) => {}
        }

        if self.general.worker_threads == 0 {
            return Err(Error::BadConfig(
                "worker_threads must be greater than 0".to_string(),
            ));
        }

        for (name, pool) in self.pools.iter() {
            pool.validate(name)?;
        }

        Ok(())
    }
}

/// Get a read-only instance of the configuration
/// from anywhere in the app.
/// ArcSwap makes this cheap and quick.
pub fn get_config() -> Config {
    (*(*CONFIG.load())).clone()
}

async fn load_file(path: &str) -> Result<String, Error> {
    let mut contents = String::new();
    let mut file = match File::open(path).await {
        Ok(file) => file,
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not open '{path}': {err}")));
        }
    };
    if let Err(err) = file.read_to_string(&mut contents).await {
        return Err(Error::BadConfig(format!(
            "Could not read config file: {err}"
        )));
    };
    Ok(contents)
}

/// Read the file and its includes and build a validated configuration.
pub async fn load(path: &str) -> Result<Config, Error> {
    let contents = load_file(path).await?;

    // parse only include.files = ["./path/to/file",...]
    let include_config: GeneralWithInclude = match toml::from_str(&contents) {
        Ok(config) => config,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not parse config file {path}: {err}"
            )));
        }
    };

    // merge main with include files via serde-toml-merge.
    let mut config_merged: toml::Value = match contents.parse() {
        Ok(value) => value,
        Err(err) => {
            return Err(Error::BadConfig(format!(
                "Could not toml parse file {path}: {err:?}"
            )));
        }
    };
    for file in include_config.include.files {
        info!("Merge config with include file: {file}");
        let include_file_content = load_file(file.as_str()).await?;
        let include_file_value = match include_file_content.parse() {
            Ok(value) => value,
            Err(err) => {
                return Err(Error::BadConfig(format!(
                    "Could not toml parse file {file}: {err:?}"
                )));
            }
        };
        config_merged = match serde_toml_merge::merge(config_merged, include_file_value) {
            Ok(value) => value,
            Err(err) => {
                return Err(Error::BadConfig(format!(
                    "Could not merge config file {file}: {err:?}"
                )));
            }
        };
    }

    let mut config: Config = match config_merged.try_into() {
        Ok(config) => config,
        Err(err) => {
            return Err(Error::BadConfig(format!("Could not merge config: {err:?}")));
        }
    };

    config.validate()?;
    config.path = path.to_string();

    Ok(config)
}

/// Parse the configuration file located at the path and publish it globally.
pub async fn parse(path: &str) -> Result<(), Error> {
    let config = load(path).await?;
    CONFIG.store(Arc::new(config));
    Ok(())
}

/// Re-read the configuration. Routes already created keep their settings,
/// keys resolved afterwards see the new scheme.
pub async fn reload_config() -> Result<bool, Error> {
    let old_config = get_config();

    if let Err(err) = parse(&old_config.path).await {
        error!("Config reload error: {err:?}");
        return Err(err);
    };

    let new_config = get_config();

    if old_config != new_config {
        info!("Config changed, new routes will use it");
        Ok(true)
    } else {
        Ok(false)
    }
}

pub fn addr_in_hba(hba: &[IpNet], addr: IpAddr) -> bool {
    if hba.is_empty() {
        return true;
    }
    hba.iter().any(|net| net.contains(&addr))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::Ipv4Addr;
    use std::path::PathBuf;

    fn tests_toml() -> String {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("tests.toml")
            .to_string_lossy()
            .to_string()
    }

    #[tokio::test]
    async fn test_config() {
        let config = load(&tests_toml()).await.unwrap();

        assert_eq!(config.general.port, 6433);
        assert_eq!(config.general.query_wait_timeout, 2000);
        assert_eq!(config.general.idle_timeout, General::default_idle_timeout());
        assert_eq!(config.pools.len(), 2);

        let example = &config.pools["example_db"];
        assert_eq!(example.idle_timeout, Some(40000));
        assert_eq!(example.users.len(), 2);
        assert_eq!(example.users["0"].username, "example_user_1");
        assert_eq!(example.users["0"].pool_size, 40);
        assert_eq!(example.users["0"].pool_mode, Some(PoolMode::Session));
        assert_eq!(example.users["1"].pool_mode, None);
        assert_eq!(example.pool_mode, PoolMode::Transaction);
        assert_eq!(example.reset_query.as_deref(), Some("DISCARD ALL"));
        assert_eq!(
            example.user("example_user_2").map(|user| user.pool_size),
            Some(20)
        );

        let stmt = &config.pools["stmt_db"];
        assert_eq!(stmt.pool_mode, PoolMode::Statement);
        assert_eq!(stmt.auth_query_user.as_deref(), Some("pooler"));
        assert_eq!(stmt.server_database.as_deref(), Some("postgres"));

        let hba = &config.general.hba;
        assert!(addr_in_hba(hba, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(!addr_in_hba(hba, IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
        assert!(addr_in_hba(hba, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1))));
        assert!(addr_in_hba(&[], IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))));
    }

    #[tokio::test]
    async fn test_serialize_configs() {
        let config = load(&tests_toml()).await.unwrap();
        let serialized = toml::to_string(&config).unwrap();
        let reparsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(reparsed.pools, config.pools);
    }

    #[test]
    fn test_validate_rejects_bad_pools() {
        let mut config = Config::default();
        let mut pool = Pool::default();
        pool.auth_query = Some("SELECT usename, passwd FROM pg_shadow WHERE usename = $1".into());
        config.pools.insert("db".into(), pool);
        assert!(matches!(config.validate(), Err(Error::BadConfig(_))));

        let mut config = Config::default();
        let mut pool = Pool::default();
        for key in ["0", "1"] {
            pool.users.insert(
                key.into(),
                User {
                    username: "dup".into(),
                    password: "secret".into(),
                    ..User::default()
                },
            );
        }
        config.pools.insert("db".into(), pool);
        assert!(matches!(config.validate(), Err(Error::BadConfig(_))));

        let mut config = Config::default();
        config.general.tls_certificate = Some("cert.pem".into());
        assert!(matches!(config.validate(), Err(Error::BadConfig(_))));
    }
}
