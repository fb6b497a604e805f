//! # Driftmail Core - Connection Pool
//!
//! Owns the live IMAP sessions. Per user: a small bounded set of worker
//! sessions for on-demand read/search/fetch work, plus at most one
//! long-lived listener session for mailbox watch.
//!
//! Locking is two-level. The registry (users map, per-user worker vec) is
//! guarded by short-held std mutexes that only cover structural changes.
//! Each session additionally carries its own tokio mutex that a lease
//! holds for the full duration of a command/response exchange, so
//! different users and sibling sessions of one user proceed fully in
//! parallel.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex as TokioMutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::mail::{MailError, MailTransport, SessionFactory};
use crate::store::UserId;

/// Pool tuning knobs
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Worker sessions per user; over-cap acquires wait, never overflow
    pub max_workers_per_user: usize,
    /// How long an acquire may wait on the per-user gate
    pub acquire_timeout: Duration,
    /// Idle age after which a session gets a NOOP probe before reuse
    pub probe_after: Duration,
    /// Idle age after which the sweeper closes a worker session
    pub reap_after: Duration,
    /// Sweeper period
    pub sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers_per_user: 3,
            acquire_timeout: Duration::from_secs(30),
            probe_after: Duration::from_secs(60),
            reap_after: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
        }
    }
}

/// Pool errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("Timed out waiting for a free connection")]
    AcquireTimeout,

    #[error(transparent)]
    Mail(#[from] MailError),
}

pub type PoolResult<T> = Result<T, PoolError>;

/// Connection role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Worker,
    Listener,
}

/// One pooled protocol session
struct PooledConn {
    user_id: UserId,
    role: ConnRole,
    session: Arc<TokioMutex<Box<dyn MailTransport>>>,
    /// Unix seconds of the last completed lease
    last_used: AtomicI64,
}

impl PooledConn {
    fn new(user_id: UserId, role: ConnRole, transport: Box<dyn MailTransport>) -> Self {
        Self {
            user_id,
            role,
            session: Arc::new(TokioMutex::new(transport)),
            last_used: AtomicI64::new(now_ts()),
        }
    }

    fn touch(&self) {
        self.last_used.store(now_ts(), Ordering::Relaxed);
    }

    fn idle_secs(&self) -> i64 {
        now_ts() - self.last_used.load(Ordering::Relaxed)
    }
}

/// Per-user pool entry
struct UserSlot {
    /// Counting admission gate for worker leases
    gate: Arc<Semaphore>,
    workers: StdMutex<Vec<Arc<PooledConn>>>,
    /// Listener slot; its async mutex doubles as the creation lock, so
    /// concurrent first acquires produce exactly one session
    listener: TokioMutex<Option<Arc<PooledConn>>>,
}

/// An exclusively leased worker session.
///
/// Dropping the lease returns the session to the pool (idle) and refreshes
/// its last-used timestamp.
pub struct WorkerLease {
    conn: Arc<PooledConn>,
    guard: OwnedMutexGuard<Box<dyn MailTransport>>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for WorkerLease {
    type Target = Box<dyn MailTransport>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for WorkerLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.conn.touch();
    }
}

/// The user's single long-lived listener session. Never returned to an
/// idle worker pool and never reaped; it persists until explicitly
/// evicted.
pub struct ListenerLease {
    conn: Arc<PooledConn>,
    guard: OwnedMutexGuard<Box<dyn MailTransport>>,
}

impl Deref for ListenerLease {
    type Target = Box<dyn MailTransport>;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for ListenerLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

/// Per-user IMAP connection pool
pub struct ConnectionPool {
    factory: Arc<dyn SessionFactory>,
    config: PoolConfig,
    users: StdMutex<HashMap<UserId, Arc<UserSlot>>>,
    sweeping: AtomicBool,
    sweep_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    pub fn new(factory: Arc<dyn SessionFactory>, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            users: StdMutex::new(HashMap::new()),
            sweeping: AtomicBool::new(false),
            sweep_handle: StdMutex::new(None),
        }
    }

    /// Lease a worker session for the user.
    ///
    /// Waits (bounded by `acquire_timeout`) when all workers are leased.
    /// Reuses an idle session when one exists, probing it first if it has
    /// been idle long enough to be suspect; otherwise dials a fresh one.
    /// The per-user worker count never exceeds `max_workers_per_user`.
    pub async fn acquire_worker(&self, user_id: UserId) -> PoolResult<WorkerLease> {
        let slot = self.slot(user_id);

        let permit = tokio::time::timeout(
            self.config.acquire_timeout,
            slot.gate.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::AcquireTimeout)?
        .expect("connection gate closed");

        loop {
            let candidate = {
                let workers = slot.workers.lock().unwrap_or_else(|e| e.into_inner());
                workers.iter().find_map(|conn| {
                    conn.session
                        .clone()
                        .try_lock_owned()
                        .ok()
                        .map(|guard| (conn.clone(), guard))
                })
            };

            match candidate {
                Some((conn, mut guard)) => {
                    if conn.idle_secs() >= self.config.probe_after.as_secs() as i64 {
                        log::debug!("Probing idle connection for user {}", user_id);
                        if let Err(e) = guard.noop().await {
                            log::warn!(
                                "Keepalive probe failed for user {}, evicting: {}",
                                user_id,
                                e
                            );
                            self.remove_worker(&slot, &conn);
                            drop(guard);
                            continue;
                        }
                        conn.touch();
                    }
                    return Ok(WorkerLease {
                        conn,
                        guard,
                        _permit: permit,
                    });
                }
                None => {
                    // Holding a gate permit with every pooled session busy
                    // implies the worker count is below cap, but the sweeper
                    // briefly locks sessions too, so re-check before dialing.
                    let below_cap = {
                        let workers = slot.workers.lock().unwrap_or_else(|e| e.into_inner());
                        workers.len() < self.config.max_workers_per_user
                    };
                    if !below_cap {
                        tokio::task::yield_now().await;
                        continue;
                    }

                    let transport = self.factory.connect(user_id).await.map_err(PoolError::Mail)?;
                    let conn = Arc::new(PooledConn::new(user_id, ConnRole::Worker, transport));
                    let guard = conn
                        .session
                        .clone()
                        .try_lock_owned()
                        .expect("fresh session already locked");

                    let open = {
                        let mut workers = slot.workers.lock().unwrap_or_else(|e| e.into_inner());
                        workers.push(conn.clone());
                        workers.len()
                    };
                    log::info!("Created worker connection for user {} ({} open)", user_id, open);

                    return Ok(WorkerLease {
                        conn,
                        guard,
                        _permit: permit,
                    });
                }
            }
        }
    }

    /// Lease the user's listener session, creating it on first use.
    ///
    /// Creation is serialized on the listener slot's own lock: two
    /// concurrent first-time acquires produce one session, the loser
    /// adopts the winner's.
    pub async fn acquire_listener(&self, user_id: UserId) -> PoolResult<ListenerLease> {
        let slot = self.slot(user_id);

        let conn = {
            let mut listener = slot.listener.lock().await;
            if let Some(conn) = listener.as_ref() {
                conn.clone()
            } else {
                let transport = self.factory.connect(user_id).await.map_err(PoolError::Mail)?;
                let conn = Arc::new(PooledConn::new(user_id, ConnRole::Listener, transport));
                *listener = Some(conn.clone());
                log::info!("Created listener connection for user {}", user_id);
                conn
            }
        };

        let guard = conn.session.clone().lock_owned().await;
        conn.touch();
        Ok(ListenerLease { conn, guard })
    }

    /// Remove a leased worker from the pool after a transport error.
    /// The next acquire dials a replacement.
    pub async fn evict_worker(&self, mut lease: WorkerLease) {
        let slot = self.slot(lease.conn.user_id);
        self.remove_worker(&slot, &lease.conn);
        log::warn!("Evicted worker connection for user {}", lease.conn.user_id);
        let _ = lease.guard.logout().await;
    }

    /// Remove the user's listener session outright.
    pub async fn evict_listener(&self, mut lease: ListenerLease) {
        let slot = self.slot(lease.conn.user_id);
        {
            let mut listener = slot.listener.lock().await;
            if let Some(current) = listener.as_ref() {
                if Arc::ptr_eq(current, &lease.conn) {
                    *listener = None;
                }
            }
        }
        log::warn!("Evicted listener connection for user {}", lease.conn.user_id);
        let _ = lease.guard.logout().await;
    }

    /// Start the periodic sweep that closes long-idle worker sessions.
    /// Leased sessions and listeners are never touched.
    pub fn start_sweeper(self: &Arc<Self>) {
        if self.sweeping.swap(true, Ordering::Relaxed) {
            return;
        }

        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick has nothing to do
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(pool) = pool.upgrade() else { break };
                if !pool.sweeping.load(Ordering::Relaxed) {
                    break;
                }
                pool.sweep().await;
            }
        });

        *self.sweep_handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        log::info!(
            "Connection sweeper started (interval: {:?}, reap after: {:?})",
            self.config.sweep_interval,
            self.config.reap_after
        );
    }

    /// Stop the sweep task
    pub fn stop_sweeper(&self) {
        self.sweeping.store(false, Ordering::Relaxed);
        if let Some(handle) = self
            .sweep_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        log::info!("Connection sweeper stopped");
    }

    /// One sweep pass over all users
    async fn sweep(&self) {
        let slots: Vec<Arc<UserSlot>> = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            users.values().cloned().collect()
        };

        let reap_after = self.config.reap_after.as_secs() as i64;
        let mut reaped = 0usize;

        for slot in slots {
            let victims = {
                let mut workers = slot.workers.lock().unwrap_or_else(|e| e.into_inner());
                let mut victims = Vec::new();
                workers.retain(|conn| {
                    if conn.idle_secs() < reap_after {
                        return true;
                    }
                    // A session we cannot lock is leased right now
                    match conn.session.clone().try_lock_owned() {
                        Ok(guard) => {
                            victims.push((conn.clone(), guard));
                            false
                        }
                        Err(_) => true,
                    }
                });
                victims
            };

            for (conn, mut guard) in victims {
                log::info!(
                    "Reaping idle {:?} connection for user {}",
                    conn.role,
                    conn.user_id
                );
                let _ = guard.logout().await;
                reaped += 1;
            }
        }

        if reaped > 0 {
            log::debug!("Sweep closed {} idle connections", reaped);
        }
    }

    fn slot(&self, user_id: UserId) -> Arc<UserSlot> {
        let mut users = self.users.lock().unwrap_or_else(|e| e.into_inner());
        users
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(UserSlot {
                    gate: Arc::new(Semaphore::new(self.config.max_workers_per_user)),
                    workers: StdMutex::new(Vec::new()),
                    listener: TokioMutex::new(None),
                })
            })
            .clone()
    }

    fn remove_worker(&self, slot: &UserSlot, conn: &Arc<PooledConn>) {
        let mut workers = slot.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.retain(|c| !Arc::ptr_eq(c, conn));
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::{Folder, MailResult, MessageBody, MessageHeader, ServerCaps, ThreadNode};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    /// Scripted in-process session
    struct TestTransport {
        noop_fails: Arc<AtomicBool>,
        noops: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MailTransport for TestTransport {
        fn capabilities(&self) -> ServerCaps {
            ServerCaps {
                supports_thread: true,
                supports_special_use: true,
                supports_idle: true,
            }
        }

        async fn list_folders(&mut self) -> MailResult<Vec<Folder>> {
            Ok(Vec::new())
        }

        async fn uid_thread(&mut self, _folder: &str) -> MailResult<Vec<ThreadNode>> {
            Ok(Vec::new())
        }

        async fn uid_search(&mut self, _folder: &str, _query: &str) -> MailResult<Vec<u32>> {
            // Track how many sessions run commands at the same instant
            let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(active, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn fetch_headers(
            &mut self,
            _folder: &str,
            _uids: &[u32],
        ) -> MailResult<Vec<MessageHeader>> {
            Ok(Vec::new())
        }

        async fn fetch_bodies(
            &mut self,
            _folder: &str,
            _uids: &[u32],
        ) -> MailResult<Vec<MessageBody>> {
            Ok(Vec::new())
        }

        async fn noop(&mut self) -> MailResult<()> {
            self.noops.fetch_add(1, Ordering::SeqCst);
            if self.noop_fails.load(Ordering::SeqCst) {
                Err(MailError::Connection("probe failed".to_string()))
            } else {
                Ok(())
            }
        }

        async fn idle_wait(&mut self, _folder: &str, _timeout: Duration) -> MailResult<bool> {
            Ok(false)
        }

        async fn logout(&mut self) -> MailResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct TestFactory {
        connects: AtomicUsize,
        noop_fails: Arc<AtomicBool>,
        noops: Arc<AtomicUsize>,
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SessionFactory for TestFactory {
        async fn connect(&self, _user_id: UserId) -> MailResult<Box<dyn MailTransport>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(TestTransport {
                noop_fails: self.noop_fails.clone(),
                noops: self.noops.clone(),
                active: self.active.clone(),
                max_active: self.max_active.clone(),
            }))
        }
    }

    fn test_pool(config: PoolConfig) -> (Arc<ConnectionPool>, Arc<TestFactory>) {
        let factory = Arc::new(TestFactory::default());
        let pool = Arc::new(ConnectionPool::new(factory.clone(), config));
        (pool, factory)
    }

    #[tokio::test]
    async fn test_worker_cap_is_never_exceeded() {
        let (pool, factory) = test_pool(PoolConfig {
            max_workers_per_user: 3,
            ..Default::default()
        });

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let mut lease = pool.acquire_worker(1).await.unwrap();
                lease.uid_search("INBOX", "ALL").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(factory.max_active.load(Ordering::SeqCst) <= 3);
        assert!(factory.connects.load(Ordering::SeqCst) <= 3);

        let slot = pool.slot(1);
        let open = slot.workers.lock().unwrap().len();
        assert!(open <= 3);
    }

    #[tokio::test]
    async fn test_fresh_connection_skips_probe() {
        let (pool, factory) = test_pool(PoolConfig::default());

        let lease = pool.acquire_worker(1).await.unwrap();
        drop(lease);
        let lease = pool.acquire_worker(1).await.unwrap();
        drop(lease);

        // Reused immediately, no probe issued
        assert_eq!(factory.noops.load(Ordering::SeqCst), 0);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_connection_gets_probe_before_reuse() {
        let (pool, factory) = test_pool(PoolConfig::default());

        let lease = pool.acquire_worker(1).await.unwrap();
        let conn = lease.conn.clone();
        drop(lease);

        // Age the connection past the probe threshold
        conn.last_used.store(now_ts() - 120, Ordering::Relaxed);

        let lease = pool.acquire_worker(1).await.unwrap();
        drop(lease);

        assert_eq!(factory.noops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_probe_evicts_and_redials() {
        let (pool, factory) = test_pool(PoolConfig::default());

        let lease = pool.acquire_worker(1).await.unwrap();
        let conn = lease.conn.clone();
        drop(lease);

        conn.last_used.store(now_ts() - 120, Ordering::Relaxed);
        factory.noop_fails.store(true, Ordering::SeqCst);

        let lease = pool.acquire_worker(1).await.unwrap();
        // The stale session was probed, failed, and was replaced
        assert_eq!(factory.noops.load(Ordering::SeqCst), 1);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(&lease.conn, &conn));
        drop(lease);

        let slot = pool.slot(1);
        assert_eq!(slot.workers.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_evicted_worker_is_replaced_on_next_acquire() {
        let (pool, factory) = test_pool(PoolConfig::default());

        let lease = pool.acquire_worker(1).await.unwrap();
        pool.evict_worker(lease).await;

        let slot = pool.slot(1);
        assert_eq!(slot.workers.lock().unwrap().len(), 0);

        let _lease = pool.acquire_worker(1).await.unwrap();
        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_acquire_times_out_when_saturated() {
        let (pool, _factory) = test_pool(PoolConfig {
            max_workers_per_user: 1,
            acquire_timeout: Duration::from_millis(50),
            ..Default::default()
        });

        let _held = pool.acquire_worker(1).await.unwrap();
        let result = pool.acquire_worker(1).await;
        assert!(matches!(result, Err(PoolError::AcquireTimeout)));
    }

    #[tokio::test]
    async fn test_listener_created_once() {
        let (pool, factory) = test_pool(PoolConfig::default());

        // Two concurrent first-time acquires race to create; each drops its
        // lease as soon as it has one so the other can proceed
        let p1 = pool.clone();
        let p2 = pool.clone();
        let t1 = tokio::spawn(async move { drop(p1.acquire_listener(1).await.unwrap()) });
        let t2 = tokio::spawn(async move { drop(p2.acquire_listener(1).await.unwrap()) });
        t1.await.unwrap();
        t2.await.unwrap();

        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);

        let again = pool.acquire_listener(1).await.unwrap();
        drop(again);
        assert_eq!(factory.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweep_reaps_idle_workers_only() {
        let (pool, _factory) = test_pool(PoolConfig {
            reap_after: Duration::from_secs(60),
            ..Default::default()
        });

        // One idle-too-long worker, one freshly used, one listener
        let lease = pool.acquire_worker(1).await.unwrap();
        let old_conn = lease.conn.clone();
        drop(lease);
        old_conn.last_used.store(now_ts() - 3600, Ordering::Relaxed);

        let lease = pool.acquire_worker(2).await.unwrap();
        drop(lease);

        let listener = pool.acquire_listener(1).await.unwrap();
        let listener_conn = listener.conn.clone();
        drop(listener);
        listener_conn.last_used.store(now_ts() - 3600, Ordering::Relaxed);

        pool.sweep().await;

        assert_eq!(pool.slot(1).workers.lock().unwrap().len(), 0);
        assert_eq!(pool.slot(2).workers.lock().unwrap().len(), 1);
        let slot = pool.slot(1);
        assert!(slot.listener.lock().await.is_some());
    }

    #[tokio::test]
    async fn test_sweep_skips_leased_workers() {
        let (pool, _factory) = test_pool(PoolConfig {
            reap_after: Duration::from_secs(60),
            ..Default::default()
        });

        let lease = pool.acquire_worker(1).await.unwrap();
        lease.conn.last_used.store(now_ts() - 3600, Ordering::Relaxed);

        pool.sweep().await;

        // Still pooled; the lease holds its lock
        assert_eq!(pool.slot(1).workers.lock().unwrap().len(), 1);
        drop(lease);
    }

    #[tokio::test]
    async fn test_users_are_independent() {
        let (pool, factory) = test_pool(PoolConfig {
            max_workers_per_user: 1,
            acquire_timeout: Duration::from_millis(200),
            ..Default::default()
        });

        // User 1 saturated; user 2 must still get a lease promptly
        let _held = pool.acquire_worker(1).await.unwrap();
        let other = pool.acquire_worker(2).await.unwrap();
        drop(other);

        assert_eq!(factory.connects.load(Ordering::SeqCst), 2);
    }
}
