//! # Driftmail Core - Synchronization Module
//!
//! Orchestrates the protocol side of the product:
//! - Full and incremental folder synchronization into the cache
//! - Thread reconstruction from the server's THREAD response
//! - Search execution against the remote server
//! - Lazy, batched body loading when a thread is opened
//! - The listener-connection watch loop for near-real-time new mail
//!
//! All network work runs on worker sessions leased from the
//! [`ConnectionPool`](crate::pool::ConnectionPool); all persistence goes
//! through the [`MailStore`](crate::store::MailStore) collaborator.

pub mod models;
pub mod service;
pub mod threads;
pub mod watch;


// Re-export commonly used types
pub use models::{BodySyncReport, SyncOutcome, SyncPolicy, ThreadView};
pub use service::SyncService;
pub use threads::{build_threads, ThreadSet};
pub use watch::{MailboxWatcher, WatchConfig, WatchEvent, WatchError};

use crate::mail::MailError;
use crate::pool::PoolError;
use crate::search::QueryError;
use crate::store::StoreError;

/// Result type alias for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

/// Unified error type for sync operations
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Query(#[from] QueryError),
}

impl SyncError {
    /// Transport-class failures are retried once on a fresh connection
    pub fn is_transport(&self) -> bool {
        match self {
            SyncError::Mail(e) => e.is_transport(),
            SyncError::Pool(PoolError::Mail(e)) => e.is_transport(),
            _ => false,
        }
    }
}
