//! Relay: forwards messages between an attached client and its server
//! until the pooling mode says the server goes back to the pool.
use bytes::{BufMut, BytesMut};
use log::{debug, error, warn};
use tokio::time::Instant;

use crate::config::PoolMode;
use crate::errors::Error;
use crate::messages::{read_message, write_all_flush, TransactionStatus};
use crate::router::ClientHandle;
use crate::server::{Server, ServerParameters};

/// Whether a server is released after an exchange that ended with `status`.
#[inline(always)]
pub fn should_detach(mode: PoolMode, status: TransactionStatus) -> bool {
    match mode {
        PoolMode::Session => false,
        PoolMode::Transaction => status == TransactionStatus::Idle,
        PoolMode::Statement => true,
    }
}

/// Why the relay handed control back.
#[derive(Debug, PartialEq)]
pub enum RelayOutcome {
    /// The exchange is over and the server can go back to the pool.
    Detach,
    /// The client sent Terminate.
    Terminated,
    /// The server failed mid-exchange and is marked bad.
    BackendLost(Error),
}

enum Fault {
    Backend(Error),
    Client(Error),
}

pub struct Relay<'a, R, W> {
    read: &'a mut R,
    write: &'a mut W,
    client: &'a ClientHandle,
    mode: PoolMode,
    server_parameters: &'a mut ServerParameters,
    max_memory_usage: u64,
    /// Extended protocol and copy messages not sent yet.
    buffer: BytesMut,
}

impl<'a, R, W> Relay<'a, R, W>
where
    R: tokio::io::AsyncRead + std::marker::Unpin,
    W: tokio::io::AsyncWrite + std::marker::Unpin,
{
    pub fn new(
        read: &'a mut R,
        write: &'a mut W,
        client: &'a ClientHandle,
        mode: PoolMode,
        server_parameters: &'a mut ServerParameters,
        max_memory_usage: u64,
    ) -> Self {
        Relay {
            read,
            write,
            client,
            mode,
            server_parameters,
            max_memory_usage,
            buffer: BytesMut::with_capacity(8196),
        }
    }

    /// Relays `first` and whatever follows it. Returns `Err` only when the
    /// client side failed; the server is marked bad if it was mid-transaction.
    pub async fn run(
        &mut self,
        server: &mut Server,
        first: BytesMut,
    ) -> Result<RelayOutcome, Error> {
        let mut next = Some(first);

        loop {
            let message = match next.take() {
                Some(message) => message,
                None => {
                    self.client.stats.active_read();
                    match read_message(&mut *self.read, self.max_memory_usage).await {
                        Ok(message) => message,
                        Err(err) => {
                            self.client_gone(server, &err);
                            return Err(err);
                        }
                    }
                }
            };
            self.client.stats.active_idle();

            let code = match message.first() {
                Some(code) => *code as char,
                None => {
                    return Err(Error::ProtocolSyncError(
                        "empty message from client".to_string(),
                    ))
                }
            };
            let started = Instant::now();

            match code {
                // Query, FunctionCall
                'Q' | 'F' => {
                    if let Some(outcome) = self.exchange(server, &message, started).await? {
                        return Ok(outcome);
                    }
                }

                // Terminate
                'X' => return Ok(RelayOutcome::Terminated),

                // Parse, Bind, Describe, Execute, Close: held until Sync or Flush.
                'P' | 'B' | 'D' | 'E' | 'C' => {
                    if code == 'P' && message.get(5).is_some_and(|name| *name != 0) {
                        // Named statements outlive the transaction.
                        server.mark_dirty();
                    }
                    self.buffer.put(&message[..]);
                }

                // Flush: the client waits for the replies so far. The
                // exchange stays open until Sync.
                'H' => {
                    self.buffer.put(&message[..]);
                    let pending = self.buffer.split();
                    if let Some(outcome) = self.flush(server, &pending).await? {
                        return Ok(outcome);
                    }
                }

                // Sync
                'S' => {
                    self.buffer.put(&message[..]);
                    let pending = self.buffer.split();
                    if let Some(outcome) = self.exchange(server, &pending, started).await? {
                        return Ok(outcome);
                    }
                }

                // CopyData
                'd' => {
                    self.buffer.put(&message[..]);
                    if self.buffer.len() > 8196 {
                        let pending = self.buffer.split();
                        if let Err(err) = server.send_and_flush(&pending).await {
                            return Ok(RelayOutcome::BackendLost(err));
                        }
                    }
                }

                // CopyDone, CopyFail
                'c' | 'f' => {
                    self.buffer.put(&message[..]);
                    let pending = self.buffer.split();
                    if let Some(outcome) = self.exchange(server, &pending, started).await? {
                        return Ok(outcome);
                    }
                }

                _ => {
                    error!(
                        "Unexpected code {} from client {}",
                        code, self.client.id
                    );
                    let err =
                        Error::ProtocolSyncError(format!("unexpected message code '{code}'"));
                    self.client_gone(server, &err);
                    return Err(err);
                }
            }
        }
    }

    /// Sends `message`, relays the whole reply and decides about the server.
    async fn exchange(
        &mut self,
        server: &mut Server,
        message: &[u8],
        started: Instant,
    ) -> Result<Option<RelayOutcome>, Error> {
        match self.forward(server, message).await {
            Ok(()) => (),
            Err(Fault::Backend(err)) => {
                server.mark_bad(&format!("relay with client {}: {}", self.client.id, err));
                return Ok(Some(RelayOutcome::BackendLost(err)));
            }
            Err(Fault::Client(err)) => {
                self.client_gone(server, &err);
                return Err(err);
            }
        }

        let application_name = self.client.application_name.as_str();
        self.client.stats.query();
        server
            .stats
            .query(started.elapsed().as_micros() as u64, application_name);

        if !server.in_transaction() {
            self.client.stats.transaction();
            server.stats.transaction(application_name);
        }

        if !server.in_copy_mode() && should_detach(self.mode, server.transaction_status()) {
            debug!(
                "Client {} detaching from server {} ({:?})",
                self.client.id,
                server,
                server.transaction_status()
            );
            return Ok(Some(RelayOutcome::Detach));
        }
        Ok(None)
    }

    /// Sends `message` and relays the replies to the extended protocol
    /// messages in it. The server stays attached.
    async fn flush(
        &mut self,
        server: &mut Server,
        message: &[u8],
    ) -> Result<Option<RelayOutcome>, Error> {
        let replies = expected_replies(message);
        server.expect_flush_replies(replies);

        let result = if replies == 0 {
            server.send_and_flush(message).await.map_err(Fault::Backend)
        } else {
            self.forward(server, message).await
        };

        match result {
            Ok(()) => Ok(None),
            Err(Fault::Backend(err)) => {
                server.mark_bad(&format!("relay with client {}: {}", self.client.id, err));
                Ok(Some(RelayOutcome::BackendLost(err)))
            }
            Err(Fault::Client(err)) => {
                self.client_gone(server, &err);
                Err(err)
            }
        }
    }

    async fn forward(&mut self, server: &mut Server, message: &[u8]) -> Result<(), Fault> {
        server.send_and_flush(message).await.map_err(Fault::Backend)?;

        // The reply may come in several chunks.
        loop {
            let response = server
                .recv(&mut *self.write, Some(&mut *self.server_parameters))
                .await
                .map_err(Fault::Backend)?;

            self.client.stats.active_write();
            if let Err(err) = write_all_flush(&mut *self.write, &response).await {
                server.wait_available().await;
                return Err(Fault::Client(err));
            }
            self.client.stats.active_idle();

            if !server.is_data_available() {
                break;
            }
        }

        Ok(())
    }

    /// The client went away while attached. A server in a transaction or
    /// a copy has state no other client may see.
    fn client_gone(&self, server: &mut Server, err: &Error) {
        if server.in_transaction() || server.in_copy_mode() {
            warn!(
                "Client {} gone while server {} is {:?}: {}",
                self.client.id,
                server,
                server.transaction_status(),
                err
            );
            server.mark_bad("client disconnected mid-transaction");
        }
    }
}

/// Number of extended protocol messages in `batch` that the server
/// answers with a reply of their own.
fn expected_replies(batch: &[u8]) -> usize {
    let mut replies = 0;
    let mut offset = 0;
    while offset + 5 <= batch.len() {
        let code = batch[offset];
        let len = i32::from_be_bytes([
            batch[offset + 1],
            batch[offset + 2],
            batch[offset + 3],
            batch[offset + 4],
        ]) as usize;
        if matches!(code, b'P' | b'B' | b'D' | b'E' | b'C') {
            replies += 1;
        }
        offset += 1 + len.max(4);
    }
    replies
}
