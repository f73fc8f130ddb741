// Standard library imports
use std::collections::HashMap;

// External crate imports
use bytes::{Buf, BufMut, BytesMut};
use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

// Internal crate imports
use crate::constants::{
    AUTHENTICATION_SUCCESSFUL, CANCEL_REQUEST_CODE, MD5_ENCRYPTED_PASSWORD,
    PROTOCOL_VERSION_NUMBER, SASL, SCRAM_SHA_256, SSL_REQUEST_CODE,
};
use crate::errors::Error;
use crate::messages::socket::{write_all_flush, write_all_half};
use crate::messages::types::DataType;

/// Transaction status carried by ReadyForQuery ('Z').
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// 'I': not in a transaction block.
    Idle,
    /// 'T': in a transaction block.
    InTransaction,
    /// 'E': in a failed transaction block, queries rejected until the block ends.
    Failed,
}

impl TransactionStatus {
    pub fn from_byte(status: u8) -> Result<TransactionStatus, Error> {
        match status {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(Error::ProtocolSyncError(format!(
                "Unknown transaction status in ReadyForQuery: {}",
                other as char
            ))),
        }
    }

    pub fn as_byte(&self) -> u8 {
        match self {
            TransactionStatus::Idle => b'I',
            TransactionStatus::InTransaction => b'T',
            TransactionStatus::Failed => b'E',
        }
    }

    /// A failed block still holds session state that must be rolled back.
    pub fn in_transaction(&self) -> bool {
        !matches!(self, TransactionStatus::Idle)
    }
}

/// Generate md5 password challenge.
pub async fn md5_challenge<S>(stream: &mut S) -> Result<[u8; 4], Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let salt: [u8; 4] = rand::random();

    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(12);
    res.put_i32(MD5_ENCRYPTED_PASSWORD);
    res.put_slice(&salt[..]);

    write_all_flush(stream, &res).await?;
    Ok(salt)
}

/// Generate SCRAM-SHA-256 challenge.
pub async fn scram_start_challenge<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(4 + 4 + SCRAM_SHA_256.len() as i32 + 2);
    res.put_i32(SASL);
    res.put_slice(SCRAM_SHA_256.as_bytes());
    res.put_u8(0);
    res.put_u8(0);

    write_all_flush(stream, &res).await
}

/// Send SCRAM-SHA-256 server response (SASLContinue or SASLFinal).
pub async fn scram_server_response<S>(stream: &mut S, code: i32, data: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = BytesMut::new();
    res.put_u8(b'R');
    res.put_i32(4 + 4 + data.len() as i32);
    res.put_i32(code);
    res.put_slice(data.as_bytes());

    write_all_flush(stream, &res).await
}

/// Read a PasswordMessage ('p') from the client and return its body.
pub async fn read_password<S>(stream: &mut S) -> Result<Vec<u8>, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read password message type identifier: {err}"
            )))
        }
    };

    if code != b'p' {
        return Err(Error::ProtocolSyncError(format!(
            "Expected password message (p), received '{}' instead",
            code as char
        )));
    }

    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Failed to read password message length: {err}"
            )))
        }
    };
    if !(4..=8192).contains(&len) {
        return Err(Error::ProtocolSyncError(format!(
            "Invalid password message length: {len}"
        )));
    }

    let mut password = vec![0u8; (len - 4) as usize];
    match stream.read_exact(&mut password).await {
        Ok(_) => Ok(password),
        Err(err) => Err(Error::SocketError(format!(
            "Failed to read password message content: {err}"
        ))),
    }
}

/// Create a simple query message.
pub fn simple_query(query: &str) -> BytesMut {
    let mut bytes = BytesMut::new();
    bytes.put_u8(b'Q');
    bytes.put_i32(4 + query.len() as i32 + 1);
    bytes.put_slice(query.as_bytes());
    bytes.put_u8(0);
    bytes
}

/// Send startup message to the server.
pub async fn startup<S>(
    stream: &mut S,
    user: &str,
    database: &str,
    application_name: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::new();

    bytes.put_i32(PROTOCOL_VERSION_NUMBER);

    for (key, value) in [
        ("user", user),
        ("application_name", application_name),
        ("database", database),
    ] {
        bytes.put_slice(key.as_bytes());
        bytes.put_u8(0);
        bytes.put_slice(value.as_bytes());
        bytes.put_u8(0);
    }
    bytes.put_u8(0);

    let mut startup = BytesMut::with_capacity(bytes.len() + 4);
    startup.put_i32(bytes.len() as i32 + 4);
    startup.put(bytes);

    write_all_flush(stream, &startup).await
}

/// Send SSLRequest to the server.
pub async fn ssl_request<S>(stream: &mut S) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut bytes = BytesMut::with_capacity(8);
    bytes.put_i32(8);
    bytes.put_i32(SSL_REQUEST_CODE);
    write_all_flush(stream, &bytes).await
}

/// Build a CancelRequest for the given backend.
pub fn cancel_request(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(16);
    bytes.put_i32(16);
    bytes.put_i32(CANCEL_REQUEST_CODE);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Parse the params the client sends as a key/value format.
pub fn parse_params(mut bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let mut result = HashMap::new();
    let mut buf = Vec::new();
    let mut tmp = Vec::new();

    while bytes.has_remaining() {
        let c = bytes.get_u8();
        if c != 0 {
            tmp.push(c);
            continue;
        }
        if !tmp.is_empty() {
            buf.push(String::from_utf8_lossy(&tmp).to_string());
            tmp.clear();
        }
    }

    // Expect pairs of name and value
    // and at least one pair to be present.
    if buf.len() % 2 != 0 || buf.len() < 2 {
        return Err(Error::ClientBadStartup);
    }

    let mut pairs = buf.into_iter();
    while let (Some(name), Some(value)) = (pairs.next(), pairs.next()) {
        result.insert(name, value);
    }

    Ok(result)
}

/// Parse StartupMessage parameters.
/// e.g. user, database, application_name, etc.
pub fn parse_startup(bytes: BytesMut) -> Result<HashMap<String, String>, Error> {
    let result = parse_params(bytes)?;

    if !result.contains_key("user") {
        return Err(Error::ClientBadStartup);
    }

    Ok(result)
}

/// Create md5 password hash given a salt.
pub fn md5_hash_password(user: &str, password: &str, salt: &[u8]) -> Vec<u8> {
    md5_hash_second_pass(&md5_first_pass(user, password), salt)
}

/// `md5(password || user)` as stored in pg_authid, without the "md5" prefix.
pub fn md5_first_pass(user: &str, password: &str) -> String {
    let mut md5 = Md5::new();
    md5.update(password.as_bytes());
    md5.update(user.as_bytes());
    format!("{:x}", md5.finalize())
}

pub fn md5_hash_second_pass(hash: &str, salt: &[u8]) -> Vec<u8> {
    let mut md5 = Md5::new();
    md5.update(hash);
    md5.update(salt);

    let mut password = format!("md5{:x}", md5.finalize()).into_bytes();
    password.push(0);

    password
}

/// Answer the server's MD5 challenge. A password already stored as an
/// `md5...` hash is used for the second pass directly.
pub async fn md5_password<S>(
    stream: &mut S,
    user: &str,
    password: &str,
    salt: &[u8],
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let password = match password.strip_prefix("md5") {
        Some(hash) if hash.len() == 32 => md5_hash_second_pass(hash, salt),
        _ => md5_hash_password(user, password, salt),
    };
    write_all_flush(stream, &password_message(&password)).await
}

/// PasswordMessage ('p') with the given body.
pub fn password_message(body: &[u8]) -> BytesMut {
    let mut message = BytesMut::with_capacity(body.len() + 5);
    message.put_u8(b'p');
    message.put_i32(body.len() as i32 + 4);
    message.put_slice(body);
    message
}

/// SASLInitialResponse: mechanism name followed by the client-first-message.
pub fn sasl_initial_response(mechanism: &str, data: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_slice(mechanism.as_bytes());
    body.put_u8(0);
    body.put_i32(data.len() as i32);
    body.put_slice(data);
    password_message(&body)
}

/// Send ErrorResponse followed by ReadyForQuery. The session stays usable.
pub async fn error_response<S>(stream: &mut S, message: &str, code: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut buf = error_message(message, code);
    buf.put(ready_for_query(TransactionStatus::Idle));
    write_all_flush(stream, &buf).await
}

/// ErrorResponse with severity ERROR.
pub fn error_message(message: &str, code: &str) -> BytesMut {
    error_message_with_severity("ERROR", message, code)
}

fn error_message_with_severity(severity: &str, message: &str, code: &str) -> BytesMut {
    let mut error = BytesMut::new();
    for (field, value) in [(b'S', severity), (b'V', severity), (b'C', code), (b'M', message)] {
        error.put_u8(field);
        error.put_slice(value.as_bytes());
        error.put_u8(0);
    }
    // No more fields follow.
    error.put_u8(0);

    let mut res = BytesMut::with_capacity(error.len() + 5);
    res.put_u8(b'E');
    res.put_i32(error.len() as i32 + 4);
    res.put(error);
    res
}

/// Send a FATAL ErrorResponse; the caller closes the connection afterwards.
pub async fn error_response_terminal<S>(
    stream: &mut S,
    message: &str,
    code: &str,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let res = error_message_with_severity("FATAL", message, code);
    write_all_flush(stream, &res).await
}

pub async fn wrong_password<S>(stream: &mut S, user: &str) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    error_response_terminal(
        stream,
        &format!("password authentication failed for user \"{user}\""),
        "28P01",
    )
    .await
}

/// AuthenticationOk.
pub fn auth_ok() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(9);
    bytes.put_u8(b'R');
    bytes.put_i32(8);
    bytes.put_i32(AUTHENTICATION_SUCCESSFUL);
    bytes
}

/// BackendKeyData with the pooler-issued process id and secret.
pub fn backend_key_data(process_id: i32, secret_key: i32) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(13);
    bytes.put_u8(b'K');
    bytes.put_i32(12);
    bytes.put_i32(process_id);
    bytes.put_i32(secret_key);
    bytes
}

/// Create a row description message.
pub fn row_description(columns: &[(&str, DataType)]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut row_desc = BytesMut::new();

    row_desc.put_i16(columns.len() as i16);

    for (name, data_type) in columns {
        row_desc.put_slice(name.as_bytes());
        row_desc.put_u8(0);

        // Doesn't belong to any table
        row_desc.put_i32(0);
        row_desc.put_i16(0);

        row_desc.put_i32(data_type.into());

        let type_size = match data_type {
            DataType::Text => -1,
            DataType::Int4 => 4,
            DataType::Int8 => 8,
            DataType::Bool => 1,
        };
        row_desc.put_i16(type_size);

        // Type modifier
        row_desc.put_i32(-1);

        // Text format code = 0
        row_desc.put_i16(0);
    }

    res.put_u8(b'T');
    res.put_i32(row_desc.len() as i32 + 4);
    res.put(row_desc);

    res
}

/// Create a data row message.
pub fn data_row(row: &[String]) -> BytesMut {
    let mut res = BytesMut::new();
    let mut data_row = BytesMut::new();

    data_row.put_i16(row.len() as i16);

    for value in row {
        data_row.put_i32(value.len() as i32);
        data_row.put_slice(value.as_bytes());
    }

    res.put_u8(b'D');
    res.put_i32(data_row.len() as i32 + 4);
    res.put(data_row);

    res
}

/// Create a command complete message.
pub fn command_complete(command: &str) -> BytesMut {
    let mut res = BytesMut::new();
    res.put_u8(b'C');
    res.put_i32(command.len() as i32 + 4 + 1);
    res.put_slice(command.as_bytes());
    res.put_u8(0);
    res
}

/// Parse ('P') of an unnamed statement with untyped parameters.
pub fn parse_message(query: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0); // unnamed statement
    body.put_slice(query.as_bytes());
    body.put_u8(0);
    body.put_i16(0); // parameter types inferred

    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(b'P');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Bind ('B') text parameters to the unnamed statement and portal.
pub fn bind_message(params: &[&str]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u8(0); // unnamed portal
    body.put_u8(0); // unnamed statement
    body.put_i16(0); // all parameters in text format
    body.put_i16(params.len() as i16);
    for param in params {
        body.put_i32(param.len() as i32);
        body.put_slice(param.as_bytes());
    }
    body.put_i16(0); // all results in text format

    let mut res = BytesMut::with_capacity(body.len() + 5);
    res.put_u8(b'B');
    res.put_i32(body.len() as i32 + 4);
    res.put(body);
    res
}

/// Execute ('E') the unnamed portal without a row limit.
pub fn execute_message() -> BytesMut {
    let mut res = BytesMut::with_capacity(10);
    res.put_u8(b'E');
    res.put_i32(9);
    res.put_u8(0);
    res.put_i32(0);
    res
}

/// Create a sync message.
pub fn sync() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'S');
    bytes.put_i32(4);
    bytes
}

pub fn flush() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'H');
    bytes.put_i32(4);
    bytes
}

/// Create a terminate message.
pub fn terminate() -> BytesMut {
    let mut bytes = BytesMut::with_capacity(5);
    bytes.put_u8(b'X');
    bytes.put_i32(4);
    bytes
}

/// Create a ready for query message.
pub fn ready_for_query(status: TransactionStatus) -> BytesMut {
    let mut bytes = BytesMut::with_capacity(6);
    bytes.put_u8(b'Z');
    bytes.put_i32(5);
    bytes.put_u8(status.as_byte());
    bytes
}

/// Create a server parameter message.
pub fn server_parameter_message(key: &str, value: &str) -> BytesMut {
    let mut server_info = BytesMut::new();
    server_info.put_u8(b'S');
    server_info.put_i32(4 + key.len() as i32 + 1 + value.len() as i32 + 1);
    server_info.put_slice(key.as_bytes());
    server_info.put_u8(0);
    server_info.put_slice(value.as_bytes());
    server_info.put_u8(0);

    server_info
}

/// Send the tail of a successful login: AuthenticationOk, the parameters,
/// BackendKeyData and ReadyForQuery.
pub async fn send_login_ok<S>(
    stream: &mut S,
    parameters: &[(String, String)],
    process_id: i32,
    secret_key: i32,
) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    let mut res = auth_ok();
    for (key, value) in parameters {
        res.put(server_parameter_message(key, value));
    }
    res.put(backend_key_data(process_id, secret_key));
    res.put(ready_for_query(TransactionStatus::Idle));
    write_all_half(stream, &res).await?;
    write_all_flush(stream, &[]).await
}
