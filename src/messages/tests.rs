// Tests for the messages module

// Standard library imports
use std::io::{Error as IoError, ErrorKind};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

// External crate imports
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

// Internal crate imports
use crate::errors::Error;
use crate::messages::{
    bind_message, data_row, error_message, parse_startup, proxy_copy_data, read_data_row,
    read_message, read_password, ready_for_query, row_description, send_login_ok, DataType,
    PgErrorMsg, TransactionStatus,
};

/// Serves the given chunks one read call at a time, then EOF.
pub(crate) struct MockReader {
    data: Vec<Vec<u8>>,
    current_index: usize,
    offset: usize,
}

impl MockReader {
    pub(crate) fn new(data: Vec<Vec<u8>>) -> Self {
        Self {
            data,
            current_index: 0,
            offset: 0,
        }
    }
}

impl AsyncRead for MockReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), IoError>> {
        if self.current_index >= self.data.len() {
            return Poll::Ready(Err(IoError::new(ErrorKind::UnexpectedEof, "No more data")));
        }

        let offset = self.offset;
        let chunk_len = self.data[self.current_index].len();
        let to_copy = std::cmp::min(buf.remaining(), chunk_len - offset);
        buf.put_slice(&self.data[self.current_index][offset..offset + to_copy]);
        if offset + to_copy == chunk_len {
            self.current_index += 1;
            self.offset = 0;
        } else {
            self.offset += to_copy;
        }

        Poll::Ready(Ok(()))
    }
}

/// Collects everything written to it.
#[derive(Clone, Default)]
pub(crate) struct MockWriter {
    pub(crate) written: Arc<Mutex<Vec<u8>>>,
}

impl MockWriter {
    pub(crate) fn bytes(&self) -> Vec<u8> {
        self.written.lock().unwrap().clone()
    }
}

impl AsyncWrite for MockWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, IoError>> {
        self.written.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), IoError>> {
        Poll::Ready(Ok(()))
    }
}

/// Split a byte stream of backend messages into (code, body) pairs.
pub(crate) fn split_messages(mut bytes: &[u8]) -> Vec<(u8, Vec<u8>)> {
    let mut out = Vec::new();
    while bytes.len() >= 5 {
        let code = bytes[0];
        let len = i32::from_be_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]) as usize;
        out.push((code, bytes[5..1 + len].to_vec()));
        bytes = &bytes[1 + len..];
    }
    out
}

#[test]
fn test_parse_startup_success() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"user\0testuser\0");
    bytes.put_slice(b"database\0testdb\0");
    bytes.put_slice(b"application_name\0testapp\0");
    bytes.put_u8(0);

    let params = parse_startup(bytes).unwrap();

    assert_eq!(params.len(), 3);
    assert_eq!(params.get("user"), Some(&"testuser".to_string()));
    assert_eq!(params.get("database"), Some(&"testdb".to_string()));
    assert_eq!(params.get("application_name"), Some(&"testapp".to_string()));
}

#[test]
fn test_parse_startup_missing_user() {
    let mut bytes = BytesMut::new();
    bytes.put_slice(b"database\0testdb\0");
    bytes.put_u8(0);

    match parse_startup(bytes) {
        Err(Error::ClientBadStartup) => {}
        other => panic!("Expected ClientBadStartup error, got {other:?}"),
    }
}

#[test]
fn test_error_message_round_trips_through_parser() {
    let result = error_message("timed out waiting for a server", "53300");
    assert_eq!(result[0], b'E');

    let parsed = PgErrorMsg::parse(&result[5..]).unwrap();
    assert_eq!(parsed.severity, "ERROR");
    assert_eq!(parsed.code, "53300");
    assert_eq!(parsed.message, "timed out waiting for a server");
}

#[test]
fn test_pg_error_msg_optional_fields() {
    let mut body = BytesMut::new();
    body.put_slice(b"SERROR\0VERROR\0C42P01\0Mrelation \"t\" does not exist\0P15\0Rparser\0\0");
    let parsed = PgErrorMsg::parse(&body).unwrap();
    assert_eq!(parsed.code, "42P01");
    assert_eq!(parsed.position, Some(15));
    assert_eq!(parsed.routine.as_deref(), Some("parser"));
    assert_eq!(parsed.detail, None);
    assert!(parsed.to_string().contains("[42P01]"));
}

#[test]
fn test_row_description_and_data_row() {
    let desc = row_description(&[("database", DataType::Text), ("port", DataType::Int4)]);
    assert_eq!(desc[0], b'T');
    assert_eq!(i16::from_be_bytes([desc[5], desc[6]]), 2);

    let row = data_row(&["db".to_string(), "5432".to_string()]);
    assert_eq!(row[0], b'D');
    let values = read_data_row(BytesMut::from(&row[5..])).unwrap();
    assert_eq!(values, vec![Some("db".to_string()), Some("5432".to_string())]);
}

#[test]
fn test_ready_for_query_status() {
    for status in [
        TransactionStatus::Idle,
        TransactionStatus::InTransaction,
        TransactionStatus::Failed,
    ] {
        let msg = ready_for_query(status);
        assert_eq!(&msg[..5], &[b'Z', 0, 0, 0, 5]);
        assert_eq!(TransactionStatus::from_byte(msg[5]).unwrap(), status);
    }
    assert!(TransactionStatus::Failed.in_transaction());
    assert!(!TransactionStatus::Idle.in_transaction());
    assert!(TransactionStatus::from_byte(b'X').is_err());
}

#[test]
fn test_bind_message_layout() {
    let msg = bind_message(&["alice"]);
    assert_eq!(msg[0], b'B');
    let len = i32::from_be_bytes([msg[1], msg[2], msg[3], msg[4]]) as usize;
    assert_eq!(len + 1, msg.len());
    assert!(msg.windows(5).any(|w| w == b"alice"));
}

#[tokio::test]
async fn test_read_message_across_partial_reads() {
    let mut reader = MockReader::new(vec![vec![b'Z', 0, 0], vec![0, 5], vec![b'T']]);
    let msg = read_message(&mut reader, u64::MAX).await.unwrap();
    assert_eq!(&msg[..], &[b'Z', 0, 0, 0, 5, b'T']);
}

#[tokio::test]
async fn test_read_message_rejects_short_length() {
    let mut reader = MockReader::new(vec![vec![b'Q', 0, 0, 0, 2]]);
    match read_message(&mut reader, u64::MAX).await {
        Err(Error::ProtocolSyncError(_)) => {}
        other => panic!("Expected ProtocolSyncError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_read_password_requires_p() {
    let mut reader = MockReader::new(vec![vec![b'Q', 0, 0, 0, 5, 0]]);
    assert!(matches!(
        read_password(&mut reader).await,
        Err(Error::ProtocolSyncError(_))
    ));
}

#[tokio::test]
async fn test_proxy_copy_data_exact_length() {
    let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    let mut reader = MockReader::new(vec![payload.clone(), b"trailing".to_vec()]);
    let mut writer = MockWriter::default();
    let copied = proxy_copy_data(&mut reader, &mut writer, payload.len())
        .await
        .unwrap();
    assert_eq!(copied, payload.len());
    assert_eq!(writer.bytes(), payload);
}

#[tokio::test]
async fn test_send_login_ok_sequence() {
    let mut writer = MockWriter::default();
    send_login_ok(
        &mut writer,
        &[("server_version".to_string(), "16.2".to_string())],
        42,
        7,
    )
    .await
    .unwrap();
    let codes: Vec<u8> = split_messages(&writer.bytes())
        .into_iter()
        .map(|(code, _)| code)
        .collect();
    assert_eq!(codes, vec![b'R', b'S', b'K', b'Z']);
}
