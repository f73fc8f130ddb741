use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::time::timeout;

use crate::errors::{Error, ServerIdentifier};
use crate::server::{next_server_id, BackendState, Server};
use crate::stats::{RouteStats, ServerStats};

use super::route::{RouteKey, RouteSettings};

/// Counts of one server pool at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerPoolStatus {
    pub idle: usize,
    pub active: usize,
    pub connecting: usize,
    pub waiting: usize,
    pub max_size: usize,
}

impl ServerPoolStatus {
    #[inline(always)]
    pub fn total(&self) -> usize {
        self.idle + self.active + self.connecting
    }
}

#[derive(Debug, Default)]
struct Slots {
    /// Most recently used at the back.
    idle: VecDeque<Server>,
    active: HashMap<u64, Arc<ServerStats>>,
    connecting: usize,
    /// Active servers that must be closed instead of returned to idle.
    expired: HashSet<u64>,
}

#[derive(Debug)]
struct Inner {
    key: RouteKey,
    settings: RouteSettings,
    route_stats: Arc<RouteStats>,
    /// Set once the auth query has found the user's hash.
    password: RwLock<Option<String>>,
    /// One permit per server a client may hold or be connecting.
    /// Waiters are served FIFO and a dropped waiter leaves the queue.
    semaphore: Arc<Semaphore>,
    slots: Mutex<Slots>,
    waiting: AtomicUsize,
}

/// Backend connections of one route.
#[derive(Debug, Clone)]
pub struct ServerPool {
    inner: Arc<Inner>,
}

/// Holds the active slot of a checked out server. Dropped without
/// `disarm`, the slot is freed and the server is not pooled again.
#[derive(Debug)]
struct ActiveTicket {
    inner: Arc<Inner>,
    id: u64,
    armed: bool,
}

impl ActiveTicket {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for ActiveTicket {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.inner.slots.lock();
            slots.active.remove(&self.id);
            slots.expired.remove(&self.id);
            warn!(
                "{} Server #{} dropped while checked out, closing it",
                self.inner.key, self.id
            );
        }
    }
}

/// Reserves a connecting slot until the new server shows up or fails.
struct ConnectingTicket {
    inner: Arc<Inner>,
    armed: bool,
}

impl ConnectingTicket {
    /// Moves the slot from connecting to active in one step.
    fn complete(mut self, server: &Server) {
        let mut slots = self.inner.slots.lock();
        slots.connecting = slots.connecting.saturating_sub(1);
        slots.active.insert(server.id(), server.stats.clone());
        self.armed = false;
    }
}

impl Drop for ConnectingTicket {
    fn drop(&mut self) {
        if self.armed {
            let mut slots = self.inner.slots.lock();
            slots.connecting = slots.connecting.saturating_sub(1);
        }
    }
}

/// Decrements the waiting counter when the wait ends or is cancelled.
struct WaitingGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl<'a> WaitingGuard<'a> {
    fn new(waiting: &'a AtomicUsize) -> WaitingGuard<'a> {
        waiting.fetch_add(1, Ordering::Relaxed);
        WaitingGuard { waiting }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A server checked out of the pool. Give it back with [`ServerPool::release`].
#[derive(Debug)]
pub struct PooledServer {
    server: Server,
    ticket: ActiveTicket,
    permit: OwnedSemaphorePermit,
}

impl Deref for PooledServer {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl DerefMut for PooledServer {
    fn deref_mut(&mut self) -> &mut Server {
        &mut self.server
    }
}

enum Claim {
    Idle(Server),
    Connect(ConnectingTicket),
}

impl ServerPool {
    pub fn new(key: RouteKey, settings: RouteSettings, route_stats: Arc<RouteStats>) -> ServerPool {
        let max_size = settings.pool_size.max(1) as usize;
        ServerPool {
            inner: Arc::new(Inner {
                password: RwLock::new(settings.server_password.clone()),
                semaphore: Arc::new(Semaphore::new(max_size)),
                slots: Mutex::new(Slots::default()),
                waiting: AtomicUsize::new(0),
                key,
                settings,
                route_stats,
            }),
        }
    }

    pub fn key(&self) -> &RouteKey {
        &self.inner.key
    }

    pub fn max_size(&self) -> usize {
        self.inner.settings.pool_size.max(1) as usize
    }

    pub fn set_password(&self, password: &str) {
        let mut guard = self.inner.password.write();
        if guard.as_deref() != Some(password) {
            *guard = Some(password.to_string());
        }
    }

    pub fn has_password(&self) -> bool {
        self.inner.password.read().is_some()
    }

    /// Checks out a server without waiting. `Ok(None)` means the pool is
    /// exhausted and the caller has to queue with [`ServerPool::checkout`].
    pub async fn try_checkout(&self) -> Result<Option<PooledServer>, Error> {
        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => return Ok(None),
            Err(TryAcquireError::Closed) => return Err(Error::ShuttingDown),
        };
        self.claim(permit).await.map(Some)
    }

    /// Checks out a server, queueing behind earlier callers when the pool
    /// is exhausted. Fails with `PoolTimeout` after `query_wait_timeout`.
    pub async fn checkout(&self) -> Result<PooledServer, Error> {
        let permit = match self.inner.semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => self.wait_for_permit().await?,
            Err(TryAcquireError::Closed) => return Err(Error::ShuttingDown),
        };
        self.claim(permit).await
    }

    async fn wait_for_permit(&self) -> Result<OwnedSemaphorePermit, Error> {
        let _waiting = WaitingGuard::new(&self.inner.waiting);
        let acquire = self.inner.semaphore.clone().acquire_owned();

        let query_wait_timeout = self.inner.settings.query_wait_timeout;
        let result = if query_wait_timeout == 0 {
            acquire.await
        } else {
            match timeout(Duration::from_millis(query_wait_timeout), acquire).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        "{} Pool timeout after {}ms waiting for a server",
                        self.inner.key, query_wait_timeout
                    );
                    return Err(Error::PoolTimeout);
                }
            }
        };

        result.map_err(|_| Error::ShuttingDown)
    }

    /// Turns a permit into a server: the newest idle one, or a new connection.
    async fn claim(&self, permit: OwnedSemaphorePermit) -> Result<PooledServer, Error> {
        let mut stale = Vec::new();
        let claim = {
            let mut slots = self.inner.slots.lock();
            loop {
                match slots.idle.pop_back() {
                    Some(server) if self.is_recyclable(&server) => {
                        slots.active.insert(server.id(), server.stats.clone());
                        break Claim::Idle(server);
                    }
                    Some(server) => stale.push(server),
                    None => {
                        slots.connecting += 1;
                        break Claim::Connect(ConnectingTicket {
                            inner: self.inner.clone(),
                            armed: true,
                        });
                    }
                }
            }
        };
        for server in &stale {
            info!("{} Closing stale idle server {}", self.inner.key, server);
        }
        drop(stale);

        let mut server = match claim {
            Claim::Idle(server) => server,
            Claim::Connect(ticket) => {
                let server = self.connect().await?;
                ticket.complete(&server);
                server
            }
        };
        server.set_state(BackendState::Active);

        Ok(PooledServer {
            ticket: ActiveTicket {
                inner: self.inner.clone(),
                id: server.id(),
                armed: true,
            },
            server,
            permit,
        })
    }

    async fn connect(&self) -> Result<Server, Error> {
        let id = next_server_id();
        let password = self.inner.password.read().clone();
        let startup = Server::startup(
            id,
            &self.inner.key,
            &self.inner.settings,
            password,
            self.inner.route_stats.clone(),
        );

        let connect_timeout = self.inner.settings.connect_timeout;
        let result = if connect_timeout == 0 {
            startup.await
        } else {
            match timeout(Duration::from_millis(connect_timeout), startup).await {
                Ok(result) => result,
                Err(_) => Err(Error::ServerStartupError(
                    format!("connect timeout {connect_timeout}ms"),
                    ServerIdentifier::new(
                        self.inner.settings.server_username.clone(),
                        &self.inner.settings.server_database,
                    ),
                )),
            }
        };

        if let Err(err) = &result {
            self.inner.route_stats.error();
            warn!("{} Failed to connect server #{}: {}", self.inner.key, id, err);
        }
        result
    }

    /// Returns a server to the pool. The server is cleaned up first; a server
    /// that is bad, expired, too old or fails cleanup is closed instead.
    /// The capacity goes back to the pool either way.
    pub async fn release(&self, guard: PooledServer) {
        let PooledServer {
            mut server,
            ticket,
            permit,
        } = guard;

        let cleanup = server.checkin_cleanup().await;
        if let Err(err) = &cleanup {
            warn!("{} Server {} failed cleanup: {}", self.inner.key, server, err);
        }

        let id = server.id();
        let mut closing = None;
        {
            let mut slots = self.inner.slots.lock();
            slots.active.remove(&id);
            let expired = slots.expired.remove(&id);
            ticket.disarm();

            if cleanup.is_ok() && !expired && self.is_recyclable(&server) {
                server.set_state(BackendState::Idle);
                server.stats.idle();
                slots.idle.push_back(server);
            } else {
                server.set_state(BackendState::Expired);
                closing = Some(server);
            }
        }

        if let Some(server) = closing {
            info!("{} Expiring server {}", self.inner.key, server);
            drop(server);
        }
        drop(permit);
    }

    /// The server will be closed instead of pooled. Idle servers close now.
    pub fn mark_expired(&self, id: u64) -> bool {
        let mut slots = self.inner.slots.lock();
        if slots.active.contains_key(&id) {
            slots.expired.insert(id);
            return true;
        }
        let position = slots.idle.iter().position(|server| server.id() == id);
        let removed = position.and_then(|position| slots.idle.remove(position));
        drop(slots);
        removed.is_some()
    }

    /// Closes idle servers past `idle_timeout` or `server_lifetime`.
    pub fn retain(&self) -> usize {
        let closing: Vec<Server> = {
            let mut slots = self.inner.slots.lock();
            let mut kept = VecDeque::with_capacity(slots.idle.len());
            let mut closing = Vec::new();
            for server in slots.idle.drain(..) {
                if self.is_recyclable(&server) && !self.idle_too_long(&server) {
                    kept.push_back(server);
                } else {
                    closing.push(server);
                }
            }
            slots.idle = kept;
            closing
        };
        if !closing.is_empty() {
            debug!(
                "{} Retain closed {} idle servers",
                self.inner.key,
                closing.len()
            );
        }
        closing.len()
    }

    pub fn status(&self) -> ServerPoolStatus {
        let slots = self.inner.slots.lock();
        ServerPoolStatus {
            idle: slots.idle.len(),
            active: slots.active.len(),
            connecting: slots.connecting,
            waiting: self.inner.waiting.load(Ordering::Relaxed),
            max_size: self.max_size(),
        }
    }

    /// Ids of the servers in the idle set and in the active set.
    pub fn membership(&self) -> (Vec<u64>, Vec<u64>) {
        let slots = self.inner.slots.lock();
        (
            slots.idle.iter().map(|server| server.id()).collect(),
            slots.active.keys().copied().collect(),
        )
    }

    /// Stats of every pooled server with the state it is in.
    pub fn members(&self) -> Vec<(Arc<ServerStats>, BackendState)> {
        let slots = self.inner.slots.lock();
        let mut members = Vec::with_capacity(slots.idle.len() + slots.active.len());
        for server in slots.idle.iter() {
            members.push((server.stats.clone(), BackendState::Idle));
        }
        for (id, stats) in slots.active.iter() {
            let state = if slots.expired.contains(id) {
                BackendState::Expired
            } else {
                BackendState::Active
            };
            members.push((stats.clone(), state));
        }
        members
    }

    fn is_recyclable(&self, server: &Server) -> bool {
        if server.is_bad() {
            return false;
        }
        let lifetime = self.inner.settings.server_lifetime;
        lifetime == 0 || server.age() < Duration::from_millis(lifetime)
    }

    fn idle_too_long(&self, server: &Server) -> bool {
        let idle_timeout = self.inner.settings.idle_timeout;
        idle_timeout > 0 && server.idle_time() >= Duration::from_millis(idle_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_backend::{settings_for, FakeBackend};

    fn pool(backend: &FakeBackend, size: u32) -> ServerPool {
        let key = RouteKey::new("app", "alice");
        let mut settings = settings_for(backend);
        settings.pool_size = size;
        ServerPool::new(key, settings, Arc::new(RouteStats::default()))
    }

    fn assert_invariants(pool: &ServerPool) {
        let status = pool.status();
        assert!(status.total() <= status.max_size, "{status:?}");
        let (idle, active) = pool.membership();
        assert!(idle.iter().all(|id| !active.contains(id)));
    }

    #[tokio::test]
    async fn test_checkout_reuses_idle_server() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 2);

        let server = pool.checkout().await.unwrap();
        let id = server.id();
        assert_eq!(server.state(), BackendState::Active);
        assert_eq!(pool.status().active, 1);
        assert_invariants(&pool);

        pool.release(server).await;
        assert_eq!(pool.status().idle, 1);
        assert_eq!(pool.status().active, 0);

        let server = pool.checkout().await.unwrap();
        assert_eq!(server.id(), id);
        pool.release(server).await;
        assert_eq!(backend.connections(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_pool_waits() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 1);

        let first = pool.try_checkout().await.unwrap().unwrap();
        assert!(pool.try_checkout().await.unwrap().is_none());

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|server| server.id()) })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }
        assert_invariants(&pool);

        let id = first.id();
        pool.release(first).await;
        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test]
    async fn test_pool_timeout() {
        let backend = FakeBackend::start().await;
        let key = RouteKey::new("app", "alice");
        let mut settings = settings_for(&backend);
        settings.pool_size = 1;
        settings.query_wait_timeout = 50;
        let pool = ServerPool::new(key, settings, Arc::new(RouteStats::default()));

        let held = pool.checkout().await.unwrap();
        let err = pool.checkout().await.unwrap_err();
        assert_eq!(err, Error::PoolTimeout);
        assert_eq!(pool.status().waiting, 0);
        pool.release(held).await;
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 1);
        let held = pool.checkout().await.unwrap();

        let cancelled = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.checkout().await.map(|server| server.id()) })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }
        cancelled.abort();
        let _ = cancelled.await;
        assert_eq!(pool.status().waiting, 0);

        pool.release(held).await;
        let server = pool.try_checkout().await.unwrap().unwrap();
        pool.release(server).await;
    }

    #[tokio::test]
    async fn test_bad_server_is_never_idle() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 1);

        let mut server = pool.checkout().await.unwrap();
        let id = server.id();
        server.mark_bad("test");
        pool.release(server).await;

        let status = pool.status();
        assert_eq!(status.idle, 0);
        assert_eq!(status.total(), 0);

        let server = pool.checkout().await.unwrap();
        assert_ne!(server.id(), id);
        pool.release(server).await;
        assert_eq!(backend.connections(), 2);
    }

    #[tokio::test]
    async fn test_mark_expired_closes_on_release() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 2);

        let server = pool.checkout().await.unwrap();
        assert!(pool.mark_expired(server.id()));
        assert!(pool
            .members()
            .iter()
            .any(|(_, state)| *state == BackendState::Expired));
        pool.release(server).await;
        assert_eq!(pool.status().total(), 0);
    }

    #[tokio::test]
    async fn test_failed_reset_query_closes_server() {
        let backend = FakeBackend::start().await;
        let key = RouteKey::new("app", "alice");
        let mut settings = settings_for(&backend);
        settings.pool_size = 1;
        settings.reset_query = Some("FAIL".to_string());
        let pool = ServerPool::new(key, settings, Arc::new(RouteStats::default()));

        let server = pool.checkout().await.unwrap();
        let id = server.id();
        pool.release(server).await;
        assert_eq!(backend.queries(), vec!["FAIL".to_string()]);
        assert_eq!(pool.status().idle, 0);
        assert_eq!(pool.status().total(), 0);

        // The capacity came back and the next checkout connects again.
        let server = pool.try_checkout().await.unwrap().unwrap();
        assert_ne!(server.id(), id);
        assert_eq!(backend.connections(), 2);
        drop(server);
    }

    #[tokio::test]
    async fn test_dropped_checkout_frees_capacity() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 1);

        let server = pool.checkout().await.unwrap();
        drop(server);
        assert_eq!(pool.status().total(), 0);
        let server = pool.try_checkout().await.unwrap().unwrap();
        pool.release(server).await;
    }

    #[tokio::test]
    async fn test_failed_connect_returns_capacity() {
        let backend = FakeBackend::start().await;
        let key = RouteKey::new("app", "alice");
        let mut settings = settings_for(&backend);
        settings.pool_size = 1;
        settings.server_port = backend.unused_port();
        let pool = ServerPool::new(key, settings, Arc::new(RouteStats::default()));

        assert!(pool.checkout().await.is_err());
        let status = pool.status();
        assert_eq!(status.connecting, 0);
        assert_eq!(status.total(), 0);
        assert!(matches!(pool.try_checkout().await, Err(_)));
    }

    #[tokio::test]
    async fn test_retain_closes_idle_servers() {
        let backend = FakeBackend::start().await;
        let key = RouteKey::new("app", "alice");
        let mut settings = settings_for(&backend);
        settings.idle_timeout = 1;
        let pool = ServerPool::new(key, settings, Arc::new(RouteStats::default()));

        let server = pool.checkout().await.unwrap();
        pool.release(server).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.retain(), 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test]
    async fn test_concurrent_checkouts_respect_max_size() {
        let backend = FakeBackend::start().await;
        let pool = pool(&backend, 3);

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..5 {
                    let server = pool.checkout().await.unwrap();
                    assert_invariants(&pool);
                    tokio::task::yield_now().await;
                    pool.release(server).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_invariants(&pool);
        assert!(backend.connections() <= 3);
    }
}
