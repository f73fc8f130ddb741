use log::info;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use crate::config::{Config, PoolMode};
use crate::constants::{MD5_PASSWORD_PREFIX, SCRAM_SHA_256};
use crate::errors::Error;
use crate::server::ServerParameters;
use crate::stats::RouteStats;

use super::client_pool::ClientPool;
use super::server_pool::ServerPool;

/// Identifies a route: the database and the user a client asked for.
#[derive(Hash, Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct RouteKey {
    pub database: String,
    pub user: String,
}

impl RouteKey {
    pub fn new(database: &str, user: &str) -> RouteKey {
        RouteKey {
            database: database.to_string(),
            user: user.to_string(),
        }
    }
}

impl Display for RouteKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[pool: {}][user: {}]", self.database, self.user)
    }
}

/// Where client credentials come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAuth {
    /// Plain, `md5...` or `SCRAM-SHA-256$...` secret from the config.
    Password(String),
    /// Fetched with the pool's auth query when the client logs in.
    AuthQuery,
}

/// Everything a route needs, read once from the config when it is created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSettings {
    pub pool_mode: PoolMode,
    pub pool_size: u32,

    pub server_host: String,
    pub server_port: u16,
    pub server_database: String,
    pub server_tls: bool,
    pub server_username: String,
    /// None until the auth query hands over a hash, or when only trust works.
    pub server_password: Option<String>,
    pub application_name: String,

    pub client_auth: ClientAuth,
    pub auth_query: Option<String>,
    pub auth_query_user: Option<String>,

    // Milliseconds.
    pub connect_timeout: u64,
    pub query_wait_timeout: u64,
    pub idle_timeout: u64,
    pub server_lifetime: u64,
    pub proxy_copy_data_timeout: u64,

    pub cleanup_server_connections: bool,
    /// Runs on every checkin before the server goes back to idle.
    pub reset_query: Option<String>,
    pub message_size_to_be_stream: u32,
}

impl RouteSettings {
    /// Derive the settings of `key` from the scheme. Fails with `NoRoute`
    /// when neither the user list nor an auth query covers the user.
    pub fn from_config(config: &Config, key: &RouteKey) -> Result<RouteSettings, Error> {
        let general = &config.general;
        let pool = match config.pools.get(&key.database) {
            Some(pool) => pool,
            None => {
                return Err(Error::NoRoute(format!(
                    "database \"{}\" does not exist",
                    key.database
                )))
            }
        };

        let auth_query_user = pool.auth_query_user.as_deref();
        let (pool_mode, pool_size, server_username, server_password, server_lifetime, client_auth) =
            match pool.user(&key.user) {
                Some(user) => {
                    let server_username = user
                        .server_username
                        .clone()
                        .unwrap_or_else(|| user.username.clone());
                    // A SCRAM secret cannot be replayed to the server.
                    let server_password = match &user.server_password {
                        Some(password) => Some(password.clone()),
                        None if user.password.starts_with(SCRAM_SHA_256) => None,
                        None => Some(user.password.clone()),
                    };
                    (
                        user.pool_mode.unwrap_or(pool.pool_mode),
                        user.pool_size,
                        server_username,
                        server_password,
                        user.server_lifetime,
                        ClientAuth::Password(user.password.clone()),
                    )
                }
                None if auth_query_user == Some(key.user.as_str()) => (
                    pool.pool_mode,
                    pool.pool_size,
                    key.user.clone(),
                    pool.auth_query_password.clone(),
                    None,
                    match &pool.auth_query_password {
                        Some(password) => ClientAuth::Password(password.clone()),
                        None => ClientAuth::AuthQuery,
                    },
                ),
                None if pool.auth_query.is_some() => (
                    pool.pool_mode,
                    pool.pool_size,
                    key.user.clone(),
                    None,
                    None,
                    ClientAuth::AuthQuery,
                ),
                None => {
                    return Err(Error::NoRoute(format!(
                        "no such user \"{}\" in database \"{}\"",
                        key.user, key.database
                    )))
                }
            };

        Ok(RouteSettings {
            pool_mode,
            pool_size,
            server_host: pool.server_host.clone(),
            server_port: pool.server_port,
            server_database: pool
                .server_database
                .clone()
                .unwrap_or_else(|| key.database.clone()),
            server_tls: pool.server_tls,
            server_username,
            server_password,
            application_name: pool
                .application_name
                .clone()
                .unwrap_or_else(|| String::from("pg_router")),
            client_auth,
            auth_query: pool.auth_query.clone(),
            auth_query_user: pool.auth_query_user.clone(),
            connect_timeout: pool.connect_timeout.unwrap_or(general.connect_timeout),
            query_wait_timeout: pool
                .query_wait_timeout
                .unwrap_or(general.query_wait_timeout),
            idle_timeout: pool.idle_timeout.unwrap_or(general.idle_timeout),
            server_lifetime: server_lifetime
                .or(pool.server_lifetime)
                .unwrap_or(general.server_lifetime),
            proxy_copy_data_timeout: general.proxy_copy_data_timeout,
            cleanup_server_connections: pool.cleanup_server_connections,
            reset_query: pool.reset_query.clone(),
            message_size_to_be_stream: general.message_size_to_be_stream,
        })
    }

    /// The client secret is an md5 hash or plain text, i.e. md5 auth works.
    pub fn client_password_is_md5_compatible(&self) -> bool {
        match &self.client_auth {
            ClientAuth::Password(password) => !password.starts_with(SCRAM_SHA_256),
            ClientAuth::AuthQuery => true,
        }
    }

    pub fn server_password_is_hash(&self) -> bool {
        self.server_password
            .as_deref()
            .is_some_and(|password| password.starts_with(MD5_PASSWORD_PREFIX))
    }
}

/// Unit of multiplexing: one server pool and one client pool per key.
#[derive(Debug)]
pub struct Route {
    pub key: RouteKey,
    pub settings: RouteSettings,
    pub servers: ServerPool,
    pub clients: ClientPool,
    pub stats: Arc<RouteStats>,

    /// Parameters sent to clients at login, captured from the first server.
    server_parameters: tokio::sync::Mutex<ServerParameters>,
}

impl Route {
    pub fn new(key: RouteKey, settings: RouteSettings) -> Route {
        let stats = Arc::new(RouteStats::default());
        info!(
            "{} Creating route to {}:{}/{}, mode: {}, size: {}",
            key,
            settings.server_host,
            settings.server_port,
            settings.server_database,
            settings.pool_mode,
            settings.pool_size
        );
        Route {
            servers: ServerPool::new(key.clone(), settings.clone(), stats.clone()),
            clients: ClientPool::default(),
            key,
            settings,
            stats,
            server_parameters: tokio::sync::Mutex::new(ServerParameters::new()),
        }
    }

    #[inline(always)]
    pub fn pool_mode(&self) -> PoolMode {
        self.settings.pool_mode
    }

    /// Hand the password found by the auth query to the server pool.
    pub fn set_server_password(&self, password: &str) {
        self.servers.set_password(password);
    }

    /// Startup parameters of the backend, fetched with a server checkout
    /// the first time and cached afterwards.
    pub async fn get_server_parameters(&self) -> Result<ServerParameters, Error> {
        let mut guard = self.server_parameters.lock().await;
        if !guard.is_empty() {
            return Ok(guard.clone());
        }
        info!("{} Fetching server parameters", self.key);
        let server = self.servers.checkout().await?;
        guard.set_from_hashmap(server.server_parameters_as_hashmap(), true);
        self.servers.release(server).await;
        Ok(guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Pool, User};

    fn config_with(pool: Pool) -> Config {
        let mut config = Config::default();
        config.pools.insert("app".to_string(), pool);
        config
    }

    #[test]
    fn test_listed_user_settings() {
        let mut pool = Pool {
            pool_mode: PoolMode::Session,
            idle_timeout: Some(1_000),
            server_database: Some("real_app".into()),
            ..Pool::default()
        };
        pool.users.insert(
            "0".into(),
            User {
                username: "alice".into(),
                password: "md5a3556571e93b0d20722ba62be61e8c2d".into(),
                pool_size: 3,
                pool_mode: Some(PoolMode::Statement),
                server_lifetime: Some(42),
                ..User::default()
            },
        );
        let config = config_with(pool);

        let settings = RouteSettings::from_config(&config, &RouteKey::new("app", "alice")).unwrap();
        assert_eq!(settings.pool_mode, PoolMode::Statement);
        assert_eq!(settings.pool_size, 3);
        assert_eq!(settings.server_username, "alice");
        assert_eq!(settings.server_database, "real_app");
        assert!(settings.server_password_is_hash());
        assert_eq!(settings.idle_timeout, 1_000);
        assert_eq!(settings.server_lifetime, 42);
        assert_eq!(
            settings.query_wait_timeout,
            config.general.query_wait_timeout
        );
        assert!(settings.client_password_is_md5_compatible());
    }

    #[test]
    fn test_scram_secret_is_not_sent_to_server() {
        let mut pool = Pool::default();
        pool.users.insert(
            "0".into(),
            User {
                username: "bob".into(),
                password: "SCRAM-SHA-256$4096:c2FsdA==$a2V5:a2V5".into(),
                ..User::default()
            },
        );
        let settings =
            RouteSettings::from_config(&config_with(pool), &RouteKey::new("app", "bob")).unwrap();
        assert_eq!(settings.server_password, None);
        assert_eq!(settings.pool_mode, PoolMode::Transaction);
        assert!(!settings.client_password_is_md5_compatible());
    }

    #[test]
    fn test_auth_query_users() {
        let pool = Pool {
            auth_query: Some("SELECT usename, passwd FROM pg_shadow WHERE usename = $1".into()),
            auth_query_user: Some("pooler".into()),
            auth_query_password: Some("pooler_secret".into()),
            pool_size: 7,
            ..Pool::default()
        };
        let config = config_with(pool);

        let pooler = RouteSettings::from_config(&config, &RouteKey::new("app", "pooler")).unwrap();
        assert_eq!(pooler.server_password.as_deref(), Some("pooler_secret"));
        assert_eq!(pooler.pool_size, 7);

        let carol = RouteSettings::from_config(&config, &RouteKey::new("app", "carol")).unwrap();
        assert_eq!(carol.client_auth, ClientAuth::AuthQuery);
        assert_eq!(carol.server_username, "carol");
        assert_eq!(carol.server_password, None);
    }

    #[test]
    fn test_unknown_routes() {
        let config = config_with(Pool::default());
        assert!(matches!(
            RouteSettings::from_config(&config, &RouteKey::new("missing", "alice")),
            Err(Error::NoRoute(_))
        ));
        assert!(matches!(
            RouteSettings::from_config(&config, &RouteKey::new("app", "nobody")),
            Err(Error::NoRoute(_))
        ));
    }
}
