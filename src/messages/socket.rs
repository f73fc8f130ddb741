// Standard library imports
use std::sync::atomic::Ordering;

// External crate imports
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

// Internal crate imports
use crate::errors::Error;
use crate::messages::{CURRENT_MEMORY, MAX_MESSAGE_SIZE};

/// Write all the data in the buffer to the stream.
pub async fn write_all_half<S>(stream: &mut S, buf: &BytesMut) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => Ok(()),
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Write all the data in the buffer to the stream and flush it.
pub async fn write_all_flush<S>(stream: &mut S, buf: &[u8]) -> Result<(), Error>
where
    S: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match stream.write_all(buf).await {
        Ok(_) => match stream.flush().await {
            Ok(_) => Ok(()),
            Err(err) => Err(Error::SocketError(format!(
                "Error flushing socket: {err:?}"
            ))),
        },
        Err(err) => Err(Error::SocketError(format!(
            "Error writing to socket: {err:?}"
        ))),
    }
}

/// Read message header: one byte code and the i32 length (which includes itself).
pub async fn read_message_header<S>(stream: &mut S) -> Result<(u8, i32), Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let code = match stream.read_u8().await {
        Ok(code) => code,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message code from socket - Error {err:?}"
            )))
        }
    };
    let len = match stream.read_i32().await {
        Ok(len) => len,
        Err(err) => {
            return Err(Error::SocketError(format!(
                "Error reading message len from socket - Code: {code:?}, Error: {err:?}"
            )))
        }
    };

    Ok((code, len))
}

/// Read message data. The returned buffer contains the header as well.
pub async fn read_message_data<S>(stream: &mut S, code: u8, len: i32) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    if len < 4 {
        return Err(Error::ProtocolSyncError(format!(
            "Message length is too small: {len}"
        )));
    }

    if len > MAX_MESSAGE_SIZE {
        return Err(Error::MaxMessageSize);
    }

    let mut buf = BytesMut::with_capacity(len as usize + 1);
    buf.put_u8(code);
    buf.put_i32(len);
    buf.resize(len as usize + 1, 0);

    match stream.read_exact(&mut buf[5..]).await {
        Ok(_) => Ok(buf),
        Err(err) => Err(Error::SocketError(format!(
            "Error reading message data from socket - Code: {code:?}, Error: {err:?}"
        ))),
    }
}

/// Read a complete message from the stream.
pub async fn read_message<S>(stream: &mut S, max_memory_usage: u64) -> Result<BytesMut, Error>
where
    S: tokio::io::AsyncRead + std::marker::Unpin,
{
    let (code, len) = read_message_header(stream).await?;

    if CURRENT_MEMORY.load(Ordering::Relaxed) as u64 > max_memory_usage {
        return Err(Error::CurrentMemoryUsage);
    }
    CURRENT_MEMORY.fetch_add(len as i64, Ordering::Relaxed);
    let result = read_message_data(stream, code, len).await;
    CURRENT_MEMORY.fetch_add(-len as i64, Ordering::Relaxed);
    result
}

/// Copy `len` bytes from one stream to another with a timeout.
pub async fn proxy_copy_data_with_timeout<R, W>(
    duration: tokio::time::Duration,
    read: &mut R,
    write: &mut W,
    len: usize,
) -> Result<usize, Error>
where
    R: tokio::io::AsyncRead + std::marker::Unpin,
    W: tokio::io::AsyncWrite + std::marker::Unpin,
{
    match timeout(duration, proxy_copy_data(read, write, len)).await {
        Ok(Ok(len)) => Ok(len),
        Ok(Err(err)) => Err(err),
        Err(_) => Err(Error::ProxyTimeout),
    }
}

/// Copy `len` bytes from one stream to another through a fixed stack buffer.
pub async fn proxy_copy_data<R, W>(read: &mut R, write: &mut W, len: usize) -> Result<usize, Error>
where
    R: tokio::io::AsyncRead + std::marker::Unpin,
    W: tokio::io::AsyncWrite + std::marker::Unpin,
{
    const MAX_BUFFER_CHUNK: usize = 4096;
    let mut buffer = [0; MAX_BUFFER_CHUNK];
    let mut bytes_remained = len;

    while bytes_remained > 0 {
        let chunk = bytes_remained.min(MAX_BUFFER_CHUNK);
        let bytes_read = match read.read(&mut buffer[..chunk]).await {
            Ok(0) => {
                return Err(Error::SocketError(
                    "Error reading from socket: connection closed".to_string(),
                ))
            }
            Ok(n) => n,
            Err(err) => {
                return Err(Error::SocketError(format!(
                    "Error reading from socket: {err:?}"
                )))
            }
        };

        if let Err(err) = write.write_all(&buffer[..bytes_read]).await {
            return Err(Error::SocketError(format!(
                "Error writing to socket: {err:?}"
            )));
        }

        bytes_remained -= bytes_read;
    }

    Ok(len)
}
