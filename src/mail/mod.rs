//! # Driftmail Core - Mail Module
//!
//! IMAP session handling: configuration, the transport capability trait,
//! and the async-imap implementation behind it.

pub mod config;
pub mod imap;
pub mod transport;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use config::{ImapConfig, SecurityType};
pub use imap::ImapSession;
pub use transport::{MailTransport, ServerCaps, SessionFactory, ThreadNode};

/// Result type alias for mail operations
pub type MailResult<T> = Result<T, MailError>;

/// Unified error type for mail operations
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("IMAP error: {0}")]
    Imap(String),

    #[error("Server is missing required capability: {0}")]
    MissingCapability(String),

    #[error("Command timed out: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MailError {
    /// Whether the underlying session should be considered dead.
    ///
    /// Transport-class failures evict the pooled connection and are retried
    /// once on a fresh one; everything else propagates as-is. A timed-out
    /// command counts: its response may still arrive and desync the stream.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            MailError::Connection(_)
                | MailError::Io(_)
                | MailError::NotConnected
                | MailError::Timeout(_)
        )
    }
}

/// Email folder representation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Folder {
    pub name: String,
    pub path: String,
    pub folder_type: FolderType,
    pub delimiter: String,
    pub is_selectable: bool,
    pub unread_count: u32,
    pub total_count: u32,
}

/// Folder types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum FolderType {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    #[default]
    Custom,
}

impl FolderType {
    /// Name-based fallback for servers without SPECIAL-USE.
    pub fn from_name(name: &str) -> Self {
        let lower = name.to_lowercase();
        if lower == "inbox" || lower.ends_with("/inbox") {
            FolderType::Inbox
        } else if lower.contains("sent") {
            FolderType::Sent
        } else if lower.contains("draft") {
            FolderType::Drafts
        } else if lower.contains("trash") || lower.contains("deleted") {
            FolderType::Trash
        } else if lower.contains("junk") || lower.contains("spam") {
            FolderType::Junk
        } else if lower.contains("archive") {
            FolderType::Archive
        } else {
            FolderType::Custom
        }
    }
}

/// Message header view, as mirrored into the cache during header sync
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageHeader {
    pub uid: u32,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Message-IDs from the References header, oldest (root) first
    pub references: Vec<String>,
    pub from: String,
    pub from_name: Option<String>,
    pub to: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub is_read: bool,
    pub is_starred: bool,
}

/// Full message body, fetched lazily when a thread is opened
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageBody {
    pub uid: u32,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentMeta>,
}

/// Email attachment metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentMeta {
    pub filename: String,
    pub content_type: String,
    pub size: u32,
    pub index: usize,
    pub content_id: Option<String>,
    pub is_inline: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_type_detection() {
        assert_eq!(FolderType::from_name("INBOX"), FolderType::Inbox);
        assert_eq!(FolderType::from_name("Sent Items"), FolderType::Sent);
        assert_eq!(FolderType::from_name("[Gmail]/Spam"), FolderType::Junk);
        assert_eq!(FolderType::from_name("Receipts"), FolderType::Custom);
    }

    #[test]
    fn test_transport_error_classification() {
        assert!(MailError::Connection("reset".into()).is_transport());
        assert!(MailError::NotConnected.is_transport());
        assert!(!MailError::MissingCapability("THREAD".into()).is_transport());
        assert!(!MailError::Imap("BAD".into()).is_transport());
    }

    #[test]
    fn test_header_serializes_camel_case() {
        let header = MessageHeader {
            uid: 7,
            message_id: Some("<a@x>".into()),
            in_reply_to: None,
            references: vec![],
            from: "a@x".into(),
            from_name: None,
            to: vec!["b@y".into()],
            subject: "Hi".into(),
            date: None,
            is_read: true,
            is_starred: false,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert_eq!(json["isRead"], true);
        assert!(json.get("messageId").is_some());
    }
}
