use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::stats::ClientStats;

#[derive(Clone)]
struct ClientEntry {
    stats: Arc<ClientStats>,
    attached: Option<u64>,
    waiting_since: Option<Instant>,
}

/// Counts of one client pool at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientPoolStatus {
    pub total: usize,
    pub active: usize,
    pub waiting: usize,
    /// Longest current wait, in microseconds.
    pub maxwait_us: u64,
}

/// Clients of one route and the server each one holds, if any.
#[derive(Default)]
pub struct ClientPool {
    clients: Mutex<HashMap<i32, ClientEntry>>,
}

impl std::fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("clients", &self.clients.lock().len())
            .finish()
    }
}

impl ClientPool {
    pub fn register(&self, client_id: i32, stats: Arc<ClientStats>) {
        self.clients.lock().insert(
            client_id,
            ClientEntry {
                stats,
                attached: None,
                waiting_since: None,
            },
        );
    }

    pub fn unregister(&self, client_id: i32) {
        self.clients.lock().remove(&client_id);
    }

    pub fn set_waiting(&self, client_id: i32) {
        if let Some(entry) = self.clients.lock().get_mut(&client_id) {
            entry.waiting_since = Some(Instant::now());
            entry.stats.waiting();
        }
    }

    /// Clears the waiting mark without attaching, e.g. after a pool timeout.
    pub fn stop_waiting(&self, client_id: i32) {
        if let Some(entry) = self.clients.lock().get_mut(&client_id) {
            entry.waiting_since = None;
        }
    }

    /// Returns false when `server_id` is already attached to another client.
    pub fn set_attached(&self, client_id: i32, server_id: u64) -> bool {
        let mut clients = self.clients.lock();
        let taken = clients
            .iter()
            .any(|(id, entry)| *id != client_id && entry.attached == Some(server_id));
        if taken {
            return false;
        }
        if let Some(entry) = clients.get_mut(&client_id) {
            entry.attached = Some(server_id);
            entry.waiting_since = None;
        }
        true
    }

    pub fn detach(&self, client_id: i32) -> Option<u64> {
        self.clients
            .lock()
            .get_mut(&client_id)
            .and_then(|entry| entry.attached.take())
    }

    pub fn attached(&self, client_id: i32) -> Option<u64> {
        self.clients
            .lock()
            .get(&client_id)
            .and_then(|entry| entry.attached)
    }

    pub fn status(&self) -> ClientPoolStatus {
        let clients = self.clients.lock();
        let mut status = ClientPoolStatus {
            total: clients.len(),
            ..ClientPoolStatus::default()
        };
        for entry in clients.values() {
            if entry.attached.is_some() {
                status.active += 1;
            }
            if let Some(since) = entry.waiting_since {
                status.waiting += 1;
                status.maxwait_us = status.maxwait_us.max(since.elapsed().as_micros() as u64);
            }
        }
        status
    }

    pub fn stats(&self) -> Vec<Arc<ClientStats>> {
        self.clients
            .lock()
            .values()
            .map(|entry| entry.stats.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(id: i32) -> Arc<ClientStats> {
        Arc::new(ClientStats::new(
            id,
            "app",
            "alice",
            "db",
            "127.0.0.1:5555",
            tokio::time::Instant::now(),
            false,
        ))
    }

    #[test]
    fn test_server_is_attached_to_one_client() {
        let pool = ClientPool::default();
        pool.register(1, stats(1));
        pool.register(2, stats(2));

        assert!(pool.set_attached(1, 77));
        assert!(!pool.set_attached(2, 77));
        assert_eq!(pool.attached(2), None);

        assert_eq!(pool.detach(1), Some(77));
        assert!(pool.set_attached(2, 77));
        assert_eq!(pool.status().active, 1);
    }

    #[test]
    fn test_waiting_counts() {
        let pool = ClientPool::default();
        pool.register(1, stats(1));
        pool.register(2, stats(2));
        pool.set_waiting(1);
        pool.set_waiting(2);
        assert_eq!(pool.status().waiting, 2);

        pool.set_attached(1, 5);
        pool.stop_waiting(2);
        let status = pool.status();
        assert_eq!(status.waiting, 0);
        assert_eq!(status.active, 1);

        pool.unregister(1);
        pool.unregister(2);
        assert_eq!(pool.status(), ClientPoolStatus::default());
    }
}
