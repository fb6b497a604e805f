//! Mailbox watcher - near-real-time new-mail notification
//!
//! Runs one background task per watched user that parks the user's
//! listener connection in IDLE and emits events over a channel when the
//! server signals activity. The listener session is exempt from idle
//! reaping and is never touched by worker-path code; on transport failure
//! it is evicted, the loop backs off and re-establishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::mail::MailTransport;
use crate::pool::ConnectionPool;
use crate::store::UserId;

/// Watcher configuration
#[derive(Debug, Clone)]
pub struct WatchConfig {
    /// Folder to watch for activity
    pub folder: String,
    /// How long one IDLE round may sit quiet before it is re-issued
    /// (servers and NATs drop connections idle near the 30-minute mark)
    pub idle_timeout: Duration,
    /// Initial delay before re-establishing a failed listener
    pub retry_backoff: Duration,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            folder: "INBOX".to_string(),
            idle_timeout: Duration::from_secs(25 * 60),
            retry_backoff: Duration::from_secs(5),
        }
    }
}

/// Events emitted by the watch loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The server signalled mailbox activity; a sync is in order
    NewMail { user_id: UserId, folder: String },
    /// The listener failed; the loop is backing off and re-establishing
    WatchFailed { user_id: UserId, error: String },
}

/// Watcher errors
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Watcher is already running")]
    AlreadyRunning,

    #[error("Watcher is not running")]
    NotRunning,
}

/// Per-user background watcher over the listener connection
pub struct MailboxWatcher {
    pool: Arc<ConnectionPool>,
    config: WatchConfig,
    running: Arc<AtomicBool>,
    task_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl MailboxWatcher {
    pub fn new(pool: Arc<ConnectionPool>, config: WatchConfig) -> Self {
        Self {
            pool,
            config,
            running: Arc::new(AtomicBool::new(false)),
            task_handle: StdMutex::new(None),
        }
    }

    /// Start watching for the user; events arrive on the given channel
    pub fn start(
        &self,
        user_id: UserId,
        events: mpsc::Sender<WatchEvent>,
    ) -> Result<(), WatchError> {
        if self.running.swap(true, Ordering::Relaxed) {
            return Err(WatchError::AlreadyRunning);
        }

        let pool = self.pool.clone();
        let config = self.config.clone();
        let running = self.running.clone();

        let handle = tokio::spawn(async move {
            watch_loop(pool, config, running, user_id, events).await;
        });

        *self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        log::info!("Mailbox watcher started for user {}", user_id);
        Ok(())
    }

    /// Stop the watch task
    pub fn stop(&self) -> Result<(), WatchError> {
        if !self.running.swap(false, Ordering::Relaxed) {
            return Err(WatchError::NotRunning);
        }

        if let Some(handle) = self
            .task_handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        log::info!("Mailbox watcher stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

impl Drop for MailboxWatcher {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

async fn watch_loop(
    pool: Arc<ConnectionPool>,
    config: WatchConfig,
    running: Arc<AtomicBool>,
    user_id: UserId,
    events: mpsc::Sender<WatchEvent>,
) {
    let mut backoff = config.retry_backoff;

    while running.load(Ordering::Relaxed) {
        let mut lease = match pool.acquire_listener(user_id).await {
            Ok(lease) => lease,
            Err(e) => {
                log::warn!("Listener for user {} unavailable: {}", user_id, e);
                events
                    .send(WatchEvent::WatchFailed {
                        user_id,
                        error: e.to_string(),
                    })
                    .await
                    .ok();
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
                continue;
            }
        };

        match lease.idle_wait(&config.folder, config.idle_timeout).await {
            Ok(true) => {
                backoff = config.retry_backoff;
                log::debug!("Mailbox activity for user {} in {}", user_id, config.folder);
                drop(lease);
                if events
                    .send(WatchEvent::NewMail {
                        user_id,
                        folder: config.folder.clone(),
                    })
                    .await
                    .is_err()
                {
                    // Receiver gone; nobody is listening anymore
                    log::info!("Watch channel closed for user {}, stopping", user_id);
                    running.store(false, Ordering::Relaxed);
                    break;
                }
            }
            Ok(false) => {
                // Quiet interval; re-issue IDLE on the next turn
                backoff = config.retry_backoff;
            }
            Err(e) => {
                log::warn!(
                    "Listener IDLE failed for user {}, evicting and re-establishing: {}",
                    user_id,
                    e
                );
                events
                    .send(WatchEvent::WatchFailed {
                        user_id,
                        error: e.to_string(),
                    })
                    .await
                    .ok();
                pool.evict_listener(lease).await;
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(Duration::from_secs(60));
            }
        }
    }

    log::info!("Watch loop exited for user {}", user_id);
}
