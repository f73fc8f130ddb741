// TLS for client connections (acceptor) and server connections (connector).
use std::io::{self, Read};
use std::path::Path;

use crate::errors::Error;
use native_tls::{Identity, Protocol};

fn read_file(path: impl AsRef<Path>) -> io::Result<Vec<u8>> {
    let mut content = Vec::new();
    let mut file = std::fs::File::open(path)?;
    file.read_to_end(&mut content)?;
    Ok(content)
}

/// Load identity from PEM certificate and PKCS#8 key files.
pub fn load_identity(cert: &Path, key: &Path) -> io::Result<Identity> {
    let cert_body = read_file(cert)?;
    let key_body = read_file(key)?;

    Identity::from_pkcs8(&cert_body, &key_body).map_err(|err| io::Error::other(err.to_string()))
}

/// Build the acceptor used when a client sends SSLRequest.
pub fn build_acceptor(cert: &Path, key: &Path) -> Result<tokio_native_tls::TlsAcceptor, Error> {
    let identity = load_identity(cert, key).map_err(|err| {
        Error::BadConfig(format!(
            "Failed to load TLS identity from cert {} and key {}: {}",
            cert.display(),
            key.display(),
            err
        ))
    })?;

    let mut builder = native_tls::TlsAcceptor::builder(identity);
    builder.min_protocol_version(Some(Protocol::Tlsv12));

    builder
        .build()
        .map(tokio_native_tls::TlsAcceptor::from)
        .map_err(|err| Error::BadConfig(format!("Failed to create TLS acceptor: {err}")))
}

/// Build the connector for `server_tls` pools. Like sslmode=require,
/// the server certificate is not verified.
pub fn build_connector() -> Result<tokio_native_tls::TlsConnector, Error> {
    native_tls::TlsConnector::builder()
        .min_protocol_version(Some(Protocol::Tlsv12))
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .build()
        .map(tokio_native_tls::TlsConnector::from)
        .map_err(|err| Error::SocketError(format!("Failed to create TLS connector: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_read_file_nonexistent() {
        assert!(read_file(PathBuf::from("/nonexistent/file")).is_err());
    }

    #[test]
    fn test_build_acceptor_missing_files() {
        match build_acceptor(
            Path::new("/nonexistent/server.crt"),
            Path::new("/nonexistent/server.key"),
        ) {
            Err(Error::BadConfig(msg)) => assert!(msg.contains("server.crt")),
            Err(other) => panic!("unexpected error {other:?}"),
            Ok(_) => panic!("acceptor built without certificate"),
        }
    }

    #[test]
    fn test_build_connector() {
        assert!(build_connector().is_ok());
    }
}
