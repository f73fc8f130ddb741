//! Errors.

/// Various errors.
#[derive(Debug, PartialEq, Clone)]
pub enum Error {
    SocketError(String),
    ClientBadStartup,
    ProtocolSyncError(String),
    ServerError,
    ServerMessageParserError(String),
    ServerStartupError(String, ServerIdentifier),
    ServerAuthError(String, ServerIdentifier),
    ServerResetError(String),
    BackendExpired,
    BadConfig(String),
    NoRoute(String),
    PoolTimeout,
    ClientError(String),
    TlsError,
    ShuttingDown,
    ParseBytesError(String),
    AuthError(String),
    ScramClientError(String),
    ScramServerError(String),
    HbaForbiddenError(String),
    ConsoleError(String),
    MaxMessageSize,
    CurrentMemoryUsage,
    ProxyTimeout,
}

/// Error classes as seen by the pooler: what happens to the backend
/// and what the client is told depends only on the class.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorClass {
    /// Connect refused, auth rejected, reset failure. The backend is
    /// expired, capacity returns to the pool and the attach may be retried.
    TransientBackend,
    /// Malformed message from the client. The session is closed.
    ClientProtocol,
    /// The bounded wait for a backend ran out.
    PoolTimeout,
    /// Bad console command. Pool state is untouched.
    Console,
    /// Startup-time resource failure.
    Fatal,
}

impl Error {
    pub fn class(&self) -> ErrorClass {
        match self {
            Error::SocketError(_)
            | Error::ServerError
            | Error::ServerMessageParserError(_)
            | Error::ServerStartupError(_, _)
            | Error::ServerAuthError(_, _)
            | Error::ServerResetError(_)
            | Error::BackendExpired
            | Error::ScramClientError(_)
            | Error::ProxyTimeout => ErrorClass::TransientBackend,
            Error::PoolTimeout => ErrorClass::PoolTimeout,
            Error::ConsoleError(_) => ErrorClass::Console,
            Error::BadConfig(_) => ErrorClass::Fatal,
            Error::ClientBadStartup
            | Error::ProtocolSyncError(_)
            | Error::NoRoute(_)
            | Error::ClientError(_)
            | Error::TlsError
            | Error::ShuttingDown
            | Error::ParseBytesError(_)
            | Error::AuthError(_)
            | Error::ScramServerError(_)
            | Error::HbaForbiddenError(_)
            | Error::MaxMessageSize
            | Error::CurrentMemoryUsage => ErrorClass::ClientProtocol,
        }
    }

    /// SQLSTATE reported to the client for this error.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            Error::PoolTimeout => "53300",
            Error::NoRoute(_) => "3D000",
            Error::AuthError(_) | Error::ScramServerError(_) => "28P01",
            Error::HbaForbiddenError(_) => "28000",
            Error::ShuttingDown => "58006",
            Error::ConsoleError(_) => "42601",
            Error::CurrentMemoryUsage => "53200",
            _ => match self.class() {
                ErrorClass::TransientBackend => "08006",
                ErrorClass::ClientProtocol => "08P01",
                _ => "58000",
            },
        }
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ClientIdentifier {
    pub addr: String,
    pub application_name: String,
    pub username: String,
    pub pool_name: String,
}

impl ClientIdentifier {
    pub fn new(
        application_name: &str,
        username: &str,
        pool_name: &str,
        addr: &str,
    ) -> ClientIdentifier {
        ClientIdentifier {
            addr: addr.into(),
            application_name: application_name.into(),
            username: username.into(),
            pool_name: pool_name.into(),
        }
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{{ {}@{}/{}?application_name={} }}",
            self.username, self.addr, self.pool_name, self.application_name
        )
    }
}

#[derive(Clone, PartialEq, Debug)]
pub struct ServerIdentifier {
    pub username: String,
    pub database: String,
}

impl ServerIdentifier {
    pub fn new(username: String, database: &str) -> ServerIdentifier {
        ServerIdentifier {
            username,
            database: database.into(),
        }
    }
}

impl std::fmt::Display for ServerIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{{ username: {}, database: {} }}",
            self.username, self.database
        )
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self {
            Error::SocketError(msg) => write!(f, "Socket connection error: {msg}"),
            Error::ClientBadStartup => write!(f, "Client sent an invalid startup message"),
            Error::ProtocolSyncError(msg) => write!(f, "Protocol synchronization error: {msg}"),
            Error::ServerError => write!(f, "Server encountered an error"),
            Error::ServerMessageParserError(msg) => {
                write!(f, "Failed to parse server message: {msg}")
            }
            Error::ServerStartupError(error, server_identifier) => write!(
                f,
                "Error reading {error} on server startup {server_identifier}"
            ),
            Error::ServerAuthError(error, server_identifier) => {
                write!(f, "{error} for {server_identifier}")
            }
            Error::ServerResetError(msg) => write!(f, "Server reset failed: {msg}"),
            Error::BackendExpired => write!(f, "Server connection was reset"),
            Error::BadConfig(msg) => write!(f, "Configuration error: {msg}"),
            Error::NoRoute(msg) => write!(f, "No route: {msg}"),
            Error::PoolTimeout => write!(f, "Timed out waiting for a server connection"),
            Error::ClientError(msg) => write!(f, "Client error: {msg}"),
            Error::TlsError => write!(f, "TLS connection error"),
            Error::ShuttingDown => write!(f, "Connection pooler is shutting down"),
            Error::ParseBytesError(msg) => write!(f, "Failed to parse bytes: {msg}"),
            Error::AuthError(msg) => write!(f, "Authentication failed: {msg}"),
            Error::ScramClientError(msg) => write!(f, "SCRAM client error: {msg}"),
            Error::ScramServerError(msg) => write!(f, "SCRAM server error: {msg}"),
            Error::HbaForbiddenError(msg) => {
                write!(f, "Connection rejected by HBA configuration: {msg}")
            }
            Error::ConsoleError(msg) => write!(f, "bad console command: {msg}"),
            Error::MaxMessageSize => write!(f, "Message exceeds maximum allowed size"),
            Error::CurrentMemoryUsage => write!(f, "Operation would exceed memory limits"),
            Error::ProxyTimeout => write!(f, "Proxy operation timed out"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_its_own_class() {
        assert_eq!(Error::PoolTimeout.class(), ErrorClass::PoolTimeout);
        assert_eq!(Error::PoolTimeout.sqlstate(), "53300");
        assert_ne!(
            Error::PoolTimeout.sqlstate(),
            Error::SocketError("reset".into()).sqlstate()
        );
    }

    #[test]
    fn backend_failures_are_transient() {
        let id = ServerIdentifier::new("alice".into(), "db");
        assert_eq!(
            Error::ServerAuthError("bad password".into(), id).class(),
            ErrorClass::TransientBackend
        );
        assert_eq!(Error::BackendExpired.sqlstate(), "08006");
        assert_eq!(Error::ProtocolSyncError("x".into()).sqlstate(), "08P01");
        assert_eq!(Error::ConsoleError("x".into()).sqlstate(), "42601");
    }
}
