//! In-memory reference implementation of [`MailStore`]
//!
//! Backs the test suite and small single-node deployments. Keeps lookup
//! and write counters so callers can assert batching behavior.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{
    AttachmentRecord, MailStore, MessageRecord, MessageRef, StoreResult, SyncCursor, ThreadRecord,
    UserId,
};

#[derive(Default)]
struct Inner {
    threads: HashMap<(UserId, String), ThreadRecord>,
    messages: HashMap<(UserId, String, u32), MessageRecord>,
    cursors: HashMap<(UserId, String), SyncCursor>,
    attachments: HashMap<(UserId, String, u32), Vec<AttachmentRecord>>,
}

/// HashMap-backed store
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    attachment_lookups: AtomicU64,
    cursor_writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many batched attachment lookups were issued
    pub fn attachment_lookups(&self) -> u64 {
        self.attachment_lookups.load(Ordering::Relaxed)
    }

    /// How many cursor writes were issued
    pub fn cursor_writes(&self) -> u64 {
        self.cursor_writes.load(Ordering::Relaxed)
    }

    /// All messages of one user's folder, ascending by UID
    pub fn messages_in_folder(&self, user_id: UserId, folder: &str) -> Vec<MessageRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.user_id == user_id && m.folder == folder)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.uid);
        messages
    }

    /// All threads of one user
    pub fn threads_for_user(&self, user_id: UserId) -> Vec<ThreadRecord> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut threads: Vec<ThreadRecord> = inner
            .threads
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        threads.sort_by(|a, b| a.thread_key.cmp(&b.thread_key));
        threads
    }
}

#[async_trait]
impl MailStore for MemoryStore {
    async fn save_thread(&self, thread: &ThreadRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .threads
            .insert((thread.user_id, thread.thread_key.clone()), thread.clone());
        Ok(())
    }

    async fn save_message(&self, message: &MessageRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.messages.insert(
            (message.user_id, message.folder.clone(), message.uid),
            message.clone(),
        );
        Ok(())
    }

    async fn get_message(
        &self,
        user_id: UserId,
        message: &MessageRef,
    ) -> StoreResult<Option<MessageRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner
            .messages
            .get(&(user_id, message.folder.clone(), message.uid))
            .cloned())
    }

    async fn get_thread(
        &self,
        user_id: UserId,
        thread_key: &str,
    ) -> StoreResult<Option<ThreadRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.threads.get(&(user_id, thread_key.to_string())).cloned())
    }

    async fn get_messages_for_thread(
        &self,
        user_id: UserId,
        thread_key: &str,
    ) -> StoreResult<Vec<MessageRecord>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut messages: Vec<MessageRecord> = inner
            .messages
            .values()
            .filter(|m| m.user_id == user_id && m.thread_key.as_deref() == Some(thread_key))
            .cloned()
            .collect();
        messages.sort_by_key(|m| (m.date, m.uid));
        Ok(messages)
    }

    async fn count_threads_in_folder(&self, user_id: UserId, folder: &str) -> StoreResult<u32> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let keys: std::collections::HashSet<&str> = inner
            .messages
            .values()
            .filter(|m| m.user_id == user_id && m.folder == folder)
            .filter_map(|m| m.thread_key.as_deref())
            .collect();
        Ok(keys.len() as u32)
    }

    async fn get_sync_cursor(
        &self,
        user_id: UserId,
        folder: &str,
    ) -> StoreResult<Option<SyncCursor>> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.cursors.get(&(user_id, folder.to_string())).cloned())
    }

    async fn set_sync_cursor(&self, cursor: &SyncCursor) -> StoreResult<()> {
        self.cursor_writes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .cursors
            .insert((cursor.user_id, cursor.folder.clone()), cursor.clone());
        Ok(())
    }

    async fn save_attachments(
        &self,
        user_id: UserId,
        message: &MessageRef,
        attachments: &[AttachmentRecord],
    ) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.attachments.insert(
            (user_id, message.folder.clone(), message.uid),
            attachments.to_vec(),
        );
        Ok(())
    }

    async fn get_attachments_for_messages(
        &self,
        user_id: UserId,
        messages: &[MessageRef],
    ) -> StoreResult<Vec<AttachmentRecord>> {
        // One lookup per call, however many messages are asked for
        self.attachment_lookups.fetch_add(1, Ordering::Relaxed);

        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let mut result = Vec::new();
        for message in messages {
            if let Some(attachments) =
                inner
                    .attachments
                    .get(&(user_id, message.folder.clone(), message.uid))
            {
                result.extend(attachments.iter().cloned());
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn message(user_id: UserId, folder: &str, uid: u32, thread_key: Option<&str>) -> MessageRecord {
        MessageRecord {
            user_id,
            folder: folder.to_string(),
            uid,
            message_id: Some(format!("<{}@example.com>", uid)),
            thread_key: thread_key.map(String::from),
            from: "sender@example.com".to_string(),
            from_name: None,
            to: vec!["user@example.com".to_string()],
            subject: "Test".to_string(),
            date: Some(Utc::now()),
            is_read: false,
            is_starred: false,
            in_reply_to: None,
            references: Vec::new(),
            body_synced: false,
            body_text: None,
            body_html: None,
            has_attachments: false,
        }
    }

    #[tokio::test]
    async fn test_save_message_upserts_by_natural_key() {
        let store = MemoryStore::new();

        store.save_message(&message(1, "INBOX", 5, None)).await.unwrap();
        let mut updated = message(1, "INBOX", 5, Some("<root@example.com>"));
        updated.is_read = true;
        store.save_message(&updated).await.unwrap();

        let messages = store.messages_in_folder(1, "INBOX");
        assert_eq!(messages.len(), 1);
        assert!(messages[0].is_read);
        assert_eq!(messages[0].thread_key.as_deref(), Some("<root@example.com>"));
    }

    #[tokio::test]
    async fn test_count_threads_counts_distinct_keys() {
        let store = MemoryStore::new();

        store
            .save_message(&message(1, "INBOX", 1, Some("<a@x>")))
            .await
            .unwrap();
        store
            .save_message(&message(1, "INBOX", 2, Some("<a@x>")))
            .await
            .unwrap();
        store
            .save_message(&message(1, "INBOX", 3, Some("<b@x>")))
            .await
            .unwrap();
        store.save_message(&message(1, "INBOX", 4, None)).await.unwrap();

        assert_eq!(store.count_threads_in_folder(1, "INBOX").await.unwrap(), 2);
        assert_eq!(store.count_threads_in_folder(1, "Archive").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_attachment_lookup_is_one_call_per_batch() {
        let store = MemoryStore::new();

        let refs: Vec<MessageRef> = (1..=100).map(|uid| MessageRef::new("INBOX", uid)).collect();
        for r in &refs {
            store
                .save_attachments(
                    1,
                    r,
                    &[AttachmentRecord {
                        user_id: 1,
                        folder: r.folder.clone(),
                        uid: r.uid,
                        filename: "a.pdf".to_string(),
                        content_type: "application/pdf".to_string(),
                        size: 10,
                        content_id: None,
                        is_inline: false,
                    }],
                )
                .await
                .unwrap();
        }

        let attachments = store.get_attachments_for_messages(1, &refs).await.unwrap();
        assert_eq!(attachments.len(), 100);
        assert_eq!(store.attachment_lookups(), 1);
    }

    #[tokio::test]
    async fn test_messages_are_scoped_per_user() {
        let store = MemoryStore::new();

        store
            .save_message(&message(1, "INBOX", 1, Some("<a@x>")))
            .await
            .unwrap();
        store
            .save_message(&message(2, "INBOX", 1, Some("<a@x>")))
            .await
            .unwrap();

        assert_eq!(store.messages_in_folder(1, "INBOX").len(), 1);
        assert_eq!(
            store
                .get_messages_for_thread(2, "<a@x>")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
