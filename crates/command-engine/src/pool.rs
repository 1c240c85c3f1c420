//! Keyed pool of reusable transport connections
//!
//! The pool bounds how many live connections exist per key, hands idle ones
//! back out, and queues callers FIFO once the bound is reached. All state lives
//! behind one mutex that is never held across an await, so two callers can
//! never race to create the same connection or release one twice.
//!
//! A connection is handed out as a [`Lease`]; dropping the lease releases it.
//! Idle connections are closed after `idle_timeout` and probed every
//! `keep_alive_interval` until then.

use async_trait::async_trait;
use futures::channel::oneshot;
use futures_lite::future;
use smol::{Task, Timer};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::{Error, Result};

const DRAIN_POLL: Duration = Duration::from_millis(10);

/// A transport connection the pool can manage
#[async_trait]
pub trait PooledConnection: Send + Sync + 'static {
    /// Cheap liveness probe used for keep-alive
    async fn is_alive(&self) -> bool;

    /// Tear down the transport; called exactly once by the pool
    async fn close(&self);
}

/// Identifies interchangeable connections
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    /// Remote host
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Login user
    pub username: String,
    /// Distinguishes credentials for the same endpoint
    pub auth: Option<String>,
}

impl PoolKey {
    /// Key without an auth fingerprint
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            auth: None,
        }
    }

    /// `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Lifecycle of a pooled connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open with no users
    Idle,
    /// In use by at least one lease
    Acquired,
    /// Suspect; closed once its last lease is released
    Closing,
    /// Torn down
    Closed,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Open connections across all keys
    pub live: usize,
    /// Connections with no users
    pub idle: usize,
    /// Connections with at least one user
    pub active: usize,
    /// Connections being established
    pub connecting: usize,
    /// Callers queued for a connection
    pub waiters: usize,
    /// Connections created over the pool's lifetime
    pub created: u64,
    /// Highest number of simultaneously open connections seen
    pub peak_live: usize,
}

enum Wake {
    Retry,
    Failed(String),
}

struct Entry<C> {
    id: u64,
    conn: Arc<C>,
    refs: usize,
    state: ConnectionState,
    last_used: Instant,
    // bumped on every state change so stale idle watchers stand down
    epoch: u64,
    // dropped, and so cancelled, when the entry leaves the idle state
    watcher: Option<Task<()>>,
}

struct Slot<C> {
    entries: Vec<Entry<C>>,
    connecting: usize,
    waiters: VecDeque<oneshot::Sender<Wake>>,
}

impl<C> Default for Slot<C> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            connecting: 0,
            waiters: VecDeque::new(),
        }
    }
}

impl<C> Slot<C> {
    fn wake_one(&mut self) {
        while let Some(tx) = self.waiters.pop_front() {
            if tx.send(Wake::Retry).is_ok() {
                break;
            }
        }
    }

    fn fail_waiters(&mut self, reason: &str) {
        for tx in self.waiters.drain(..) {
            let _ = tx.send(Wake::Failed(reason.to_string()));
        }
    }

    fn is_unused(&self) -> bool {
        self.entries.is_empty() && self.connecting == 0 && self.waiters.is_empty()
    }
}

struct Inner<C> {
    slots: HashMap<PoolKey, Slot<C>>,
    // keys refusing new acquires, with the number of drains in progress
    draining: HashMap<PoolKey, usize>,
    next_id: u64,
    disposed: bool,
    created: u64,
    peak_live: usize,
}

impl<C> Inner<C> {
    fn live(&self) -> usize {
        self.slots.values().map(|s| s.entries.len()).sum()
    }
}

struct Shared<C> {
    config: PoolConfig,
    inner: Mutex<Inner<C>>,
}

enum Step<C: PooledConnection> {
    Ready(Lease<C>),
    Connect,
    Wait(oneshot::Receiver<Wake>),
}

/// Bounded, keyed connection pool
pub struct ConnectionPool<C: PooledConnection> {
    shared: Arc<Shared<C>>,
}

impl<C: PooledConnection> Clone for ConnectionPool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<C: PooledConnection> fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<C: PooledConnection> ConnectionPool<C> {
    /// Create an empty pool
    pub fn new(config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(Inner {
                    slots: HashMap::new(),
                    draining: HashMap::new(),
                    next_id: 1,
                    disposed: false,
                    created: 0,
                    peak_live: 0,
                }),
            }),
        }
    }

    /// Pool limits
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Get a connection for `key`, creating one with `connect` if allowed
    ///
    /// Waits in FIFO order while `max_connections` connections exist for the
    /// key and all of them are fully used. If creating a connection fails,
    /// every caller queued for the key receives the error too.
    pub async fn acquire<F, Fut>(&self, key: &PoolKey, mut connect: F) -> Result<Lease<C>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut woken = false;
        loop {
            match self.shared.try_acquire(key, woken)? {
                Step::Ready(lease) => return Ok(lease),
                Step::Connect => return self.connect(key, &mut connect).await,
                Step::Wait(rx) => {
                    debug!(%key, "connection pool exhausted, waiting");
                    let mut waiting = Waiting {
                        shared: &self.shared,
                        key,
                        rx,
                        done: false,
                    };
                    let wake = (&mut waiting.rx).await;
                    waiting.done = true;
                    match wake {
                        Ok(Wake::Failed(reason)) => return Err(Error::connection(key, reason)),
                        // a dropped sender means the slot was cleared; look again
                        Ok(Wake::Retry) | Err(_) => woken = true,
                    }
                }
            }
        }
    }

    async fn connect<F, Fut>(&self, key: &PoolKey, connect: &mut F) -> Result<Lease<C>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        let mut guard = Connecting {
            shared: &self.shared,
            key,
            armed: true,
        };
        let timeout = self.shared.config.connect_timeout();
        let made = future::or(connect(), async {
            Timer::after(timeout).await;
            Err(Error::connection(
                key,
                format!("timed out connecting after {}ms", timeout.as_millis()),
            ))
        })
        .await;
        guard.armed = false;

        match made {
            Ok(conn) => self.shared.register(key, conn),
            Err(e) => {
                warn!(%key, error = %e, "failed to open connection");
                let mut inner = self.shared.lock();
                if let Some(slot) = inner.slots.get_mut(key) {
                    slot.connecting = slot.connecting.saturating_sub(1);
                    slot.fail_waiters(&e.to_string());
                    if slot.is_unused() {
                        inner.slots.remove(key);
                    }
                }
                Err(e)
            }
        }
    }

    /// Close idle connections whose idle timeout has passed; returns how many
    pub async fn evict_idle(&self) -> usize {
        let idle_timeout = self.shared.config.idle_timeout();
        let expired = {
            let mut inner = self.shared.lock();
            let mut expired = Vec::new();
            for slot in inner.slots.values_mut() {
                let mut i = 0;
                while i < slot.entries.len() {
                    let entry = &slot.entries[i];
                    if entry.state == ConnectionState::Idle
                        && entry.last_used.elapsed() >= idle_timeout
                    {
                        expired.push(slot.entries.remove(i).conn);
                        slot.wake_one();
                    } else {
                        i += 1;
                    }
                }
            }
            inner.slots.retain(|_, slot| !slot.is_unused());
            expired
        };
        let count = expired.len();
        close_all(expired).await;
        if count > 0 {
            debug!(count, "evicted idle connections");
        }
        count
    }

    /// Close every connection for `key` and fail its queued callers
    ///
    /// New acquires for the key fail until the drain finishes. Leases still
    /// in use get up to `drain_grace` to be released before their connections
    /// are closed under them.
    pub async fn drain_key(&self, key: &PoolKey) {
        {
            let mut inner = self.shared.lock();
            if !inner.slots.contains_key(key) {
                return;
            }
            *inner.draining.entry(key.clone()).or_default() += 1;
            if let Some(slot) = inner.slots.get_mut(key) {
                slot.fail_waiters("connection pool drained");
                for entry in slot.entries.iter_mut().filter(|e| e.refs > 0) {
                    entry.state = ConnectionState::Closing;
                }
            }
        }
        let _draining = Draining {
            shared: &self.shared,
            key,
        };

        let closed = self.close_where(|k| k == key).await;
        debug!(%key, closed, "drained connections");
    }

    /// Close everything; idempotent
    ///
    /// Queued callers fail at once. In-flight leases get up to `drain_grace`
    /// to finish before their connections are closed under them.
    pub async fn dispose(&self) {
        let first = {
            let mut inner = self.shared.lock();
            let first = !inner.disposed;
            inner.disposed = true;
            for slot in inner.slots.values_mut() {
                slot.fail_waiters("connection pool disposed");
                for entry in slot.entries.iter_mut().filter(|e| e.refs > 0) {
                    entry.state = ConnectionState::Closing;
                }
            }
            first
        };
        if first {
            info!("disposing connection pool");
        }
        self.close_where(|_| true).await;
    }

    /// Close connections of matching keys as their leases come back
    ///
    /// Whatever is still in use once `drain_grace` has passed is closed
    /// anyway. Returns how many connections were closed here.
    async fn close_where(&self, matches: impl Fn(&PoolKey) -> bool) -> usize {
        let deadline = Instant::now() + self.shared.config.drain_grace();
        let mut closed = 0;
        loop {
            let (idle, busy) = {
                let mut inner = self.shared.lock();
                let mut idle = Vec::new();
                let mut busy = 0;
                for (_, slot) in inner.slots.iter_mut().filter(|(k, _)| matches(k)) {
                    let mut i = 0;
                    while i < slot.entries.len() {
                        if slot.entries[i].refs == 0 {
                            idle.push(slot.entries.remove(i).conn);
                        } else {
                            i += 1;
                        }
                    }
                    busy += slot.entries.len() + slot.connecting;
                }
                inner.slots.retain(|k, slot| !matches(k) || !slot.is_unused());
                (idle, busy)
            };
            closed += idle.len();
            close_all(idle).await;

            if busy == 0 {
                return closed;
            }
            if Instant::now() >= deadline {
                let forced: Vec<Arc<C>> = {
                    let mut inner = self.shared.lock();
                    let forced = inner
                        .slots
                        .iter_mut()
                        .filter(|(k, _)| matches(k))
                        .flat_map(|(_, slot)| slot.entries.drain(..).map(|e| e.conn))
                        .collect();
                    inner.slots.retain(|k, slot| !matches(k) || !slot.is_unused());
                    forced
                };
                warn!(count = forced.len(), "drain grace expired, closing busy connections");
                closed += forced.len();
                close_all(forced).await;
                return closed;
            }
            Timer::after(DRAIN_POLL).await;
        }
    }

    /// Current counters
    pub fn stats(&self) -> PoolStats {
        let inner = self.shared.lock();
        let mut stats = PoolStats {
            created: inner.created,
            peak_live: inner.peak_live,
            ..PoolStats::default()
        };
        for slot in inner.slots.values() {
            stats.live += slot.entries.len();
            stats.connecting += slot.connecting;
            stats.waiters += slot.waiters.iter().filter(|tx| !tx.is_canceled()).count();
            for entry in &slot.entries {
                if entry.refs == 0 {
                    stats.idle += 1;
                } else {
                    stats.active += 1;
                }
            }
        }
        stats
    }

    /// Returns true once `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }
}

impl<C: PooledConnection> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, Inner<C>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(self: &Arc<Self>, key: &PoolKey, woken: bool) -> Result<Step<C>> {
        let max_channels = self.config.max_channels_per_connection;
        let max_connections = self.config.max_connections;

        let mut inner = self.lock();
        if inner.disposed {
            return Err(Error::connection(key, "connection pool is disposed"));
        }
        if inner.draining.contains_key(key) {
            return Err(Error::connection(key, "connections are draining"));
        }
        let slot = inner.slots.entry(key.clone()).or_default();

        let usable = slot.entries.iter_mut().find(|e| match e.state {
            ConnectionState::Idle => true,
            ConnectionState::Acquired => e.refs < max_channels,
            ConnectionState::Closing | ConnectionState::Closed => false,
        });
        if let Some(entry) = usable {
            entry.refs += 1;
            entry.state = ConnectionState::Acquired;
            entry.epoch += 1;
            entry.watcher = None;
            let lease = Lease {
                shared: self.clone(),
                key: key.clone(),
                id: entry.id,
                conn: entry.conn.clone(),
                failed: false,
            };
            if entry.refs < max_channels {
                slot.wake_one();
            }
            debug!(%key, id = lease.id, "reusing pooled connection");
            return Ok(Step::Ready(lease));
        }

        if slot.entries.len() + slot.connecting < max_connections {
            slot.connecting += 1;
            return Ok(Step::Connect);
        }

        let (tx, rx) = oneshot::channel();
        if woken {
            slot.waiters.push_front(tx);
        } else {
            slot.waiters.push_back(tx);
        }
        Ok(Step::Wait(rx))
    }

    fn register(self: &Arc<Self>, key: &PoolKey, conn: C) -> Result<Lease<C>> {
        let conn = Arc::new(conn);
        let mut inner = self.lock();
        let id = inner.next_id;
        inner.next_id += 1;

        let refused = if inner.disposed {
            Some("connection pool is disposed")
        } else if inner.draining.contains_key(key) {
            Some("connections are draining")
        } else {
            None
        };
        let slot = inner.slots.entry(key.clone()).or_default();
        slot.connecting = slot.connecting.saturating_sub(1);
        if let Some(reason) = refused {
            drop(inner);
            spawn_close(conn);
            return Err(Error::connection(key, reason));
        }

        slot.entries.push(Entry {
            id,
            conn: conn.clone(),
            refs: 1,
            state: ConnectionState::Acquired,
            last_used: Instant::now(),
            epoch: 0,
            watcher: None,
        });
        if self.config.max_channels_per_connection > 1 {
            slot.wake_one();
        }
        inner.created += 1;
        let live = inner.live();
        inner.peak_live = inner.peak_live.max(live);
        debug!(%key, id, live, "opened pooled connection");

        Ok(Lease {
            shared: self.clone(),
            key: key.clone(),
            id,
            conn,
            failed: false,
        })
    }

    fn release(self: &Arc<Self>, key: &PoolKey, id: u64, failed: bool) {
        let mut to_close = None;
        {
            let mut inner = self.lock();
            let disposed = inner.disposed;
            let Some(slot) = inner.slots.get_mut(key) else {
                return;
            };
            if let Some(pos) = slot.entries.iter().position(|e| e.id == id) {
                let entry = &mut slot.entries[pos];
                entry.refs = entry.refs.saturating_sub(1);
                if failed {
                    entry.state = ConnectionState::Closing;
                }
                if entry.refs == 0 {
                    if entry.state == ConnectionState::Closing || disposed {
                        to_close = Some(slot.entries.remove(pos).conn);
                    } else {
                        entry.state = ConnectionState::Idle;
                        entry.last_used = Instant::now();
                        entry.epoch += 1;
                        entry.watcher = Some(self.watch_idle(key.clone(), id, entry.epoch));
                    }
                }
            }
            slot.wake_one();
        }

        if let Some(conn) = to_close {
            debug!(%key, id, "closing released connection");
            spawn_close(conn);
        }
    }

    /// Evict or probe an idle connection until it is used again
    fn watch_idle(self: &Arc<Self>, key: PoolKey, id: u64, epoch: u64) -> Task<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout();
        let keep_alive = self.config.keep_alive_interval();

        smol::spawn(async move {
            let idle_since = Instant::now();
            loop {
                let remaining = idle_timeout.saturating_sub(idle_since.elapsed());
                let wait = keep_alive.map_or(remaining, |k| k.min(remaining));
                Timer::after(wait).await;

                let Some(shared) = weak.upgrade() else {
                    return;
                };
                if idle_since.elapsed() >= idle_timeout {
                    shared.evict_if_idle(&key, id, epoch, "idle timeout");
                    return;
                }
                let Some(conn) = shared.idle_conn(&key, id, epoch) else {
                    return;
                };
                if !conn.is_alive().await {
                    shared.evict_if_idle(&key, id, epoch, "keep-alive probe failed");
                    return;
                }
            }
        })
    }

    fn idle_conn(&self, key: &PoolKey, id: u64, epoch: u64) -> Option<Arc<C>> {
        let inner = self.lock();
        inner
            .slots
            .get(key)?
            .entries
            .iter()
            .find(|e| e.id == id && e.epoch == epoch && e.state == ConnectionState::Idle)
            .map(|e| e.conn.clone())
    }

    fn evict_if_idle(&self, key: &PoolKey, id: u64, epoch: u64, reason: &str) {
        let evicted = {
            let mut inner = self.lock();
            let Some(slot) = inner.slots.get_mut(key) else {
                return;
            };
            let pos = slot
                .entries
                .iter()
                .position(|e| e.id == id && e.epoch == epoch && e.state == ConnectionState::Idle);
            let evicted = pos.map(|pos| {
                let mut entry = slot.entries.remove(pos);
                // called from the watcher itself
                if let Some(watcher) = entry.watcher.take() {
                    watcher.detach();
                }
                entry.conn
            });
            if evicted.is_some() {
                slot.wake_one();
            }
            if slot.is_unused() {
                inner.slots.remove(key);
            }
            evicted
        };
        if let Some(conn) = evicted {
            debug!(%key, id, reason, "evicting idle connection");
            spawn_close(conn);
        }
    }
}

/// A connection checked out of the pool; released on drop
pub struct Lease<C: PooledConnection> {
    shared: Arc<Shared<C>>,
    key: PoolKey,
    id: u64,
    conn: Arc<C>,
    failed: bool,
}

impl<C: PooledConnection> Lease<C> {
    /// Mark the connection broken so it is closed instead of reused
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    /// Key this lease was acquired for
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// Pool-assigned connection id
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<C: PooledConnection> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C: PooledConnection> fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("failed", &self.failed)
            .finish()
    }
}

impl<C: PooledConnection> Drop for Lease<C> {
    fn drop(&mut self) {
        self.shared.release(&self.key, self.id, self.failed);
    }
}

/// Gives back a connect slot if the connecting caller goes away
struct Connecting<'a, C: PooledConnection> {
    shared: &'a Arc<Shared<C>>,
    key: &'a PoolKey,
    armed: bool,
}

impl<C: PooledConnection> Drop for Connecting<'_, C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.shared.lock();
        if let Some(slot) = inner.slots.get_mut(self.key) {
            slot.connecting = slot.connecting.saturating_sub(1);
            slot.wake_one();
        }
    }
}

/// Lets new acquires for a drained key through again once the drain ends
struct Draining<'a, C: PooledConnection> {
    shared: &'a Arc<Shared<C>>,
    key: &'a PoolKey,
}

impl<C: PooledConnection> Drop for Draining<'_, C> {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if let Some(count) = inner.draining.get_mut(self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.draining.remove(self.key);
            }
        }
    }
}

/// Passes a wake-up on if the waiting caller goes away after receiving it
struct Waiting<'a, C: PooledConnection> {
    shared: &'a Arc<Shared<C>>,
    key: &'a PoolKey,
    rx: oneshot::Receiver<Wake>,
    done: bool,
}

impl<C: PooledConnection> Drop for Waiting<'_, C> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(Some(Wake::Retry)) = self.rx.try_recv() {
            let mut inner = self.shared.lock();
            if let Some(slot) = inner.slots.get_mut(self.key) {
                slot.wake_one();
            }
        }
    }
}

fn spawn_close<C: PooledConnection>(conn: Arc<C>) {
    smol::spawn(async move { conn.close().await }).detach();
}

async fn close_all<C: PooledConnection>(conns: Vec<Arc<C>>) {
    futures::future::join_all(conns.iter().map(|c| c.close())).await;
}
