//! # Driftmail Core
//!
//! The IMAP synchronization core of the Driftmail webmail client.
//!
//! This crate owns the protocol side of the product: a per-user pool of
//! live IMAP sessions, the full/incremental folder synchronization that
//! mirrors remote mailbox state into the local cache, server-side thread
//! reconstruction, search-query translation, and batched header/body
//! fetching. HTTP routing, authentication, the relational cache and the
//! SMTP send path live in sibling repositories and reach this crate only
//! through [`sync::SyncService`] and the [`store::MailStore`] seam.

pub mod mail;
pub mod pool;
pub mod search;
pub mod store;
pub mod sync;

pub use mail::{Folder, FolderType, MailError, MailResult, MessageBody, MessageHeader};
pub use pool::{ConnectionPool, PoolConfig, PoolError};
pub use search::{QueryError, SearchFilter};
pub use store::{MailStore, MessageRef, SyncCursor, UserId};
pub use sync::{SyncError, SyncOutcome, SyncPolicy, SyncService};
