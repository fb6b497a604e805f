//! Transport capability traits
//!
//! Narrow seams over the stateful IMAP session so the pool and the sync
//! service can be exercised against fakes without a network-speaking
//! server. [`ImapSession`](super::ImapSession) is the production
//! implementation.

use std::time::Duration;

use async_trait::async_trait;

use super::{Folder, MailResult, MessageBody, MessageHeader};
use crate::store::UserId;

/// Server capabilities this core depends on, probed once per session
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerCaps {
    /// THREAD=REFERENCES (or THREAD=ORDEREDSUBJECT) extension
    pub supports_thread: bool,
    /// SPECIAL-USE folder attributes (RFC 6154)
    pub supports_special_use: bool,
    /// IDLE for the listener connection
    pub supports_idle: bool,
}

/// One node of the server's THREAD response forest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadNode {
    pub uid: u32,
    pub children: Vec<ThreadNode>,
}

impl ThreadNode {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            children: Vec::new(),
        }
    }

    /// All UIDs in this subtree, root first
    pub fn flatten(&self) -> Vec<u32> {
        let mut uids = vec![self.uid];
        for child in &self.children {
            uids.extend(child.flatten());
        }
        uids
    }
}

/// One live, stateful protocol session.
///
/// Implementations are NOT safe for concurrent use; the pool wraps each
/// session in an exclusive lock and hands out one lease at a time. Every
/// method is one logical command/response exchange.
#[async_trait]
pub trait MailTransport: Send {
    /// Capabilities negotiated when the session was established
    fn capabilities(&self) -> ServerCaps;

    async fn list_folders(&mut self) -> MailResult<Vec<Folder>>;

    /// Run the server-side thread-listing command over the whole folder,
    /// returning the conversation forest as UID references.
    async fn uid_thread(&mut self, folder: &str) -> MailResult<Vec<ThreadNode>>;

    /// UID SEARCH with a raw (already translated) query, ascending UIDs
    async fn uid_search(&mut self, folder: &str, query: &str) -> MailResult<Vec<u32>>;

    /// Fetch envelopes/flags/threading headers for the whole UID set in a
    /// single round trip.
    async fn fetch_headers(&mut self, folder: &str, uids: &[u32]) -> MailResult<Vec<MessageHeader>>;

    /// Fetch full bodies for the whole UID set in a single round trip.
    /// UIDs the server does not return are simply absent from the result.
    async fn fetch_bodies(&mut self, folder: &str, uids: &[u32]) -> MailResult<Vec<MessageBody>>;

    /// Keepalive probe
    async fn noop(&mut self) -> MailResult<()>;

    /// Long-poll for mailbox activity on the given folder (listener
    /// connections only). Returns `true` when the server signalled new
    /// activity, `false` on a quiet timeout.
    async fn idle_wait(&mut self, folder: &str, timeout: Duration) -> MailResult<bool>;

    /// Best-effort LOGOUT before the session is dropped
    async fn logout(&mut self) -> MailResult<()>;
}

/// Creates authenticated sessions for a user on demand.
///
/// The production factory looks up the user's decrypted IMAP credentials
/// and dials out with the configured connect timeout; tests substitute a
/// scripted fake.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn connect(&self, user_id: UserId) -> MailResult<Box<dyn MailTransport>>;
}
