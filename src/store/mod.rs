//! # Driftmail Core - Store Module
//!
//! The seam to the cache/persistence collaborator. The relational schema
//! and its CRUD accessors live in the backend repository; this crate only
//! depends on the [`MailStore`] capability trait so the synchronization
//! core can be exercised against a fake. [`memory::MemoryStore`] is the
//! HashMap-backed reference implementation used by the test suite and by
//! small single-node deployments.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use memory::MemoryStore;

/// User identifier, assigned by the account service
pub type UserId = i64;

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Store error types
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),
}

/// Reference to one cached message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    pub folder: String,
    pub uid: u32,
}

impl MessageRef {
    pub fn new(folder: impl Into<String>, uid: u32) -> Self {
        Self {
            folder: folder.into(),
            uid,
        }
    }
}

/// Conversation anchor. `thread_key` is the Message-ID of the thread's
/// root message and is unique per user regardless of folders.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadRecord {
    pub user_id: UserId,
    pub thread_key: String,
    pub subject: String,
    pub message_count: u32,
    pub last_date: Option<DateTime<Utc>>,
}

/// One cached message, keyed by (user, folder, uid)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub user_id: UserId,
    pub folder: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub thread_key: Option<String>,
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub is_starred: bool,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    /// false after header sync, true once the body was mirrored
    pub body_synced: bool,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub has_attachments: bool,
}

/// Per (user, folder) sync bookmark
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCursor {
    pub user_id: UserId,
    pub folder: String,
    /// Highest UID seen by the last successful sync
    pub last_uid: u32,
    pub last_synced_at: DateTime<Utc>,
    pub thread_count: u32,
}

/// Cached attachment metadata for one message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentRecord {
    pub user_id: UserId,
    pub folder: String,
    pub uid: u32,
    pub filename: String,
    pub content_type: String,
    pub size: u32,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

/// Capability interface over the cache collaborator.
///
/// Upserts are idempotent by natural key, so a retried sync pass is safe.
/// The collaborator owns its own consistency; this core only relies on
/// `set_sync_cursor` being all-or-nothing.
#[async_trait]
pub trait MailStore: Send + Sync {
    /// Upsert a thread by (user, thread_key)
    async fn save_thread(&self, thread: &ThreadRecord) -> StoreResult<()>;

    /// Upsert a message by (user, folder, uid)
    async fn save_message(&self, message: &MessageRecord) -> StoreResult<()>;

    async fn get_message(
        &self,
        user_id: UserId,
        message: &MessageRef,
    ) -> StoreResult<Option<MessageRecord>>;

    async fn get_thread(
        &self,
        user_id: UserId,
        thread_key: &str,
    ) -> StoreResult<Option<ThreadRecord>>;

    async fn get_messages_for_thread(
        &self,
        user_id: UserId,
        thread_key: &str,
    ) -> StoreResult<Vec<MessageRecord>>;

    /// Number of distinct threads with at least one message in the folder
    async fn count_threads_in_folder(&self, user_id: UserId, folder: &str) -> StoreResult<u32>;

    async fn get_sync_cursor(
        &self,
        user_id: UserId,
        folder: &str,
    ) -> StoreResult<Option<SyncCursor>>;

    /// Replace the cursor in one atomic write
    async fn set_sync_cursor(&self, cursor: &SyncCursor) -> StoreResult<()>;

    /// Replace the attachment metadata of one message
    async fn save_attachments(
        &self,
        user_id: UserId,
        message: &MessageRef,
        attachments: &[AttachmentRecord],
    ) -> StoreResult<()>;

    /// Batched attachment lookup for any number of messages in one call
    async fn get_attachments_for_messages(
        &self,
        user_id: UserId,
        messages: &[MessageRef],
    ) -> StoreResult<Vec<AttachmentRecord>>;
}
