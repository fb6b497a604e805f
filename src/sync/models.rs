//! Sync Data Models

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::store::{AttachmentRecord, MessageRecord, MessageRef, ThreadRecord};

/// Sync service tuning knobs
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    /// Cursor age below which a folder counts as fresh and is not re-synced
    pub freshness: Duration,

    /// Deadline applied around every protocol command the service issues.
    /// Connection establishment carries its own shorter timeout inside the
    /// session factory.
    pub command_timeout: Duration,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(300),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of one sync pass over a folder
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOutcome {
    pub folder: String,
    pub full_sync: bool,
    /// Messages whose headers were fetched this pass
    pub fetched_messages: usize,
    pub thread_count: u32,
    pub last_uid: u32,
}

/// Result of a batched body sync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BodySyncReport {
    /// The requested messages, re-read from the cache after the pass
    pub messages: Vec<MessageRecord>,
    pub synced: usize,
    /// Messages whose body could not be synced this pass; they stay
    /// header-only and do not block the rest
    pub failed: Vec<MessageRef>,
}

/// One opened conversation: thread anchor, its messages (bodies synced
/// where possible), and the batched attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadView {
    pub thread: ThreadRecord,
    pub messages: Vec<MessageRecord>,
    pub attachments: Vec<AttachmentRecord>,
}
