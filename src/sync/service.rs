//! Sync Service - Orchestrates folder synchronization
//!
//! Decides incremental vs. full sync per (user, folder), drives the
//! leased protocol session, persists results through the store
//! collaborator, and advances the sync cursor only after a fully
//! successful pass. Transport errors evict the leased connection and are
//! retried exactly once on a fresh one.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::Utc;

use super::models::{BodySyncReport, SyncOutcome, SyncPolicy, ThreadView};
use super::threads::build_threads;
use super::SyncResult;
use crate::mail::{Folder, MailError, MailResult, MailTransport, MessageBody, MessageHeader};
use crate::pool::{ConnectionPool, WorkerLease};
use crate::search::SearchFilter;
use crate::store::{
    AttachmentRecord, MailStore, MessageRecord, MessageRef, StoreError, SyncCursor, ThreadRecord,
    UserId,
};

/// Sync service - the crate's main entry point for request handlers
#[derive(Clone)]
pub struct SyncService {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn MailStore>,
    policy: SyncPolicy,
}

impl SyncService {
    /// Create a sync service with the default policy
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn MailStore>) -> Self {
        Self::with_policy(pool, store, SyncPolicy::default())
    }

    pub fn with_policy(
        pool: Arc<ConnectionPool>,
        store: Arc<dyn MailStore>,
        policy: SyncPolicy,
    ) -> Self {
        Self {
            pool,
            store,
            policy,
        }
    }

    // ========================================================================
    // Staleness
    // ========================================================================

    /// Whether a folder is due for a refresh. Pure cursor-staleness check;
    /// never touches the network.
    pub async fn should_sync(&self, user_id: UserId, folder: &str) -> SyncResult<bool> {
        match self.store.get_sync_cursor(user_id, folder).await? {
            None => Ok(true),
            Some(cursor) => {
                let age = Utc::now().signed_duration_since(cursor.last_synced_at);
                Ok(age.num_seconds() >= self.policy.freshness.as_secs() as i64)
            }
        }
    }

    // ========================================================================
    // Folder sync
    // ========================================================================

    /// Mirror a folder's remote state into the cache.
    ///
    /// Full sync when no cursor exists, incremental otherwise. On any
    /// failure the prior cursor stays untouched, so callers can fall back
    /// to cached data and a later retry is idempotent.
    pub async fn sync_folder(&self, user_id: UserId, folder: &str) -> SyncResult<SyncOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut lease = self.pool.acquire_worker(user_id).await?;
            match self.sync_folder_on(&mut lease, user_id, folder).await {
                Ok(outcome) => {
                    log::info!(
                        "Synced {} for user {}: {} fetched, {} threads (full={})",
                        folder,
                        user_id,
                        outcome.fetched_messages,
                        outcome.thread_count,
                        outcome.full_sync
                    );
                    return Ok(outcome);
                }
                Err(e) if e.is_transport() => {
                    self.pool.evict_worker(lease).await;
                    if attempt == 1 {
                        log::warn!(
                            "Transport error syncing {} for user {}, retrying on a fresh connection: {}",
                            folder,
                            user_id,
                            e
                        );
                        continue;
                    }
                    log::error!(
                        "Sync of {} failed for user {} after retry: {}",
                        folder,
                        user_id,
                        e
                    );
                    return Err(e);
                }
                Err(e) => {
                    log::error!("Sync of {} failed for user {}: {}", folder, user_id, e);
                    return Err(e);
                }
            }
        }
    }

    async fn sync_folder_on(
        &self,
        lease: &mut WorkerLease,
        user_id: UserId,
        folder: &str,
    ) -> SyncResult<SyncOutcome> {
        // Threading is delegated to the server; a server without the
        // extension is a configuration error, surfaced on first use
        if !lease.capabilities().supports_thread {
            return Err(MailError::MissingCapability("THREAD=REFERENCES".to_string()).into());
        }

        match self.store.get_sync_cursor(user_id, folder).await? {
            None => self.full_sync(lease, user_id, folder).await,
            Some(cursor) => self.incremental_sync(lease, user_id, folder, cursor).await,
        }
    }

    async fn full_sync(
        &self,
        lease: &mut WorkerLease,
        user_id: UserId,
        folder: &str,
    ) -> SyncResult<SyncOutcome> {
        log::info!("Full sync of {} for user {}", folder, user_id);

        let forest = self
            .with_deadline("thread listing", lease.uid_thread(folder))
            .await?;
        let all_uids: Vec<u32> = forest.iter().flat_map(|root| root.flatten()).collect();

        // One batched fetch for the complete UID set. Thread roots are
        // resolved by indexing into this same map, never by a second
        // fetch of the root subset.
        let headers = self
            .with_deadline("header fetch", lease.fetch_headers(folder, &all_uids))
            .await?;
        let header_map: HashMap<u32, MessageHeader> =
            headers.into_iter().map(|h| (h.uid, h)).collect();

        let threads = build_threads(&forest, &header_map);

        let mut threaded: HashSet<u32> = HashSet::new();
        for thread in &threads {
            for uid in &thread.uids {
                threaded.insert(*uid);
                if let Some(header) = header_map.get(uid) {
                    self.store
                        .save_message(&message_record(
                            user_id,
                            folder,
                            header,
                            Some(thread.thread_key.clone()),
                        ))
                        .await?;
                }
            }
        }

        // Messages outside any resolvable thread still get cached
        for (uid, header) in &header_map {
            if !threaded.contains(uid) {
                self.store
                    .save_message(&message_record(user_id, folder, header, None))
                    .await?;
            }
        }

        for thread in &threads {
            self.refresh_thread(user_id, &thread.thread_key).await?;
        }

        let last_uid = all_uids.iter().copied().max().unwrap_or(0);
        self.finish_sync(user_id, folder, last_uid, true, header_map.len())
            .await
    }

    async fn incremental_sync(
        &self,
        lease: &mut WorkerLease,
        user_id: UserId,
        folder: &str,
        cursor: SyncCursor,
    ) -> SyncResult<SyncOutcome> {
        let query = format!("UID {}:*", cursor.last_uid.saturating_add(1));
        let uids = self
            .with_deadline("uid search", lease.uid_search(folder, &query))
            .await?;

        // Servers echo the highest existing UID for n:* even when nothing
        // is new; never re-request headers at or below the cursor
        let new_uids: Vec<u32> = uids.into_iter().filter(|&uid| uid > cursor.last_uid).collect();

        if new_uids.is_empty() {
            log::debug!("No new messages in {} for user {}", folder, user_id);
            return self
                .finish_sync(user_id, folder, cursor.last_uid, false, 0)
                .await;
        }

        log::info!(
            "Incremental sync of {} for user {}: {} new messages",
            folder,
            user_id,
            new_uids.len()
        );

        let headers = self
            .with_deadline("header fetch", lease.fetch_headers(folder, &new_uids))
            .await?;

        let mut touched: Vec<String> = Vec::new();
        for header in &headers {
            match self.resolve_thread_key(user_id, header).await? {
                Some(thread_key) => {
                    self.store
                        .save_message(&message_record(
                            user_id,
                            folder,
                            header,
                            Some(thread_key.clone()),
                        ))
                        .await?;
                    if !touched.contains(&thread_key) {
                        touched.push(thread_key);
                    }
                }
                None => {
                    log::warn!(
                        "Message UID {} in {} has no resolvable thread root; storing unthreaded",
                        header.uid,
                        folder
                    );
                    self.store
                        .save_message(&message_record(user_id, folder, header, None))
                        .await?;
                }
            }
        }

        for thread_key in &touched {
            self.refresh_thread(user_id, thread_key).await?;
        }

        let last_uid = new_uids
            .iter()
            .copied()
            .max()
            .unwrap_or(cursor.last_uid)
            .max(cursor.last_uid);
        self.finish_sync(user_id, folder, last_uid, false, headers.len())
            .await
    }

    /// Attach an incoming message to a conversation.
    ///
    /// Existing threads are matched by walking References root-most first,
    /// then In-Reply-To, then the message's own Message-ID. With no match
    /// a new thread is keyed by the root candidate: the first References
    /// entry, else the message's own id. Neither present means the message
    /// stays unthreaded.
    async fn resolve_thread_key(
        &self,
        user_id: UserId,
        header: &MessageHeader,
    ) -> SyncResult<Option<String>> {
        let mut candidates: Vec<&String> = header.references.iter().collect();
        if let Some(in_reply_to) = &header.in_reply_to {
            candidates.push(in_reply_to);
        }
        if let Some(message_id) = &header.message_id {
            candidates.push(message_id);
        }

        for candidate in &candidates {
            if self.store.get_thread(user_id, candidate).await?.is_some() {
                return Ok(Some((*candidate).clone()));
            }
        }

        Ok(header
            .references
            .first()
            .cloned()
            .or_else(|| header.message_id.clone()))
    }

    /// Recompute one thread's anchor from its cached messages
    async fn refresh_thread(&self, user_id: UserId, thread_key: &str) -> SyncResult<()> {
        let messages = self.store.get_messages_for_thread(user_id, thread_key).await?;
        let Some(first) = messages.iter().min_by_key(|m| (m.date, m.uid)) else {
            return Ok(());
        };

        let subject = match self.store.get_thread(user_id, thread_key).await? {
            Some(existing) => existing.subject,
            None => first.subject.clone(),
        };

        let record = ThreadRecord {
            user_id,
            thread_key: thread_key.to_string(),
            subject,
            message_count: messages.len() as u32,
            last_date: messages.iter().filter_map(|m| m.date).max(),
        };
        Ok(self.store.save_thread(&record).await?)
    }

    /// The last step of every successful pass: write the cursor, in one
    /// atomic replace. A crash or error anywhere earlier leaves the prior
    /// cursor untouched.
    async fn finish_sync(
        &self,
        user_id: UserId,
        folder: &str,
        last_uid: u32,
        full_sync: bool,
        fetched_messages: usize,
    ) -> SyncResult<SyncOutcome> {
        let thread_count = self.store.count_threads_in_folder(user_id, folder).await?;

        let cursor = SyncCursor {
            user_id,
            folder: folder.to_string(),
            last_uid,
            last_synced_at: Utc::now(),
            thread_count,
        };
        self.store.set_sync_cursor(&cursor).await?;

        Ok(SyncOutcome {
            folder: folder.to_string(),
            full_sync,
            fetched_messages,
            thread_count,
            last_uid,
        })
    }

    // ========================================================================
    // Search
    // ========================================================================

    /// Run a parsed search against the remote server, newest first.
    ///
    /// The filter's folder predicate scopes the search (INBOX otherwise);
    /// the remaining predicates go to the server as one SEARCH command.
    pub async fn search(
        &self,
        user_id: UserId,
        filter: &SearchFilter,
        page: usize,
        page_size: usize,
    ) -> SyncResult<Vec<MessageHeader>> {
        let folder = filter.folder().unwrap_or("INBOX").to_string();
        let query = filter.to_imap_query();

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut lease = self.pool.acquire_worker(user_id).await?;
            match self
                .search_on(&mut lease, &folder, &query, page, page_size)
                .await
            {
                Ok(headers) => return Ok(headers),
                Err(e) if e.is_transport() => {
                    self.pool.evict_worker(lease).await;
                    if attempt == 1 {
                        log::warn!(
                            "Transport error searching {} for user {}, retrying: {}",
                            folder,
                            user_id,
                            e
                        );
                        continue;
                    }
                    return Err(e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn search_on(
        &self,
        lease: &mut WorkerLease,
        folder: &str,
        query: &str,
        page: usize,
        page_size: usize,
    ) -> SyncResult<Vec<MessageHeader>> {
        let mut uids = self
            .with_deadline("uid search", lease.uid_search(folder, query))
            .await?;
        uids.sort_unstable_by(|a, b| b.cmp(a));

        let page_uids: Vec<u32> = uids
            .into_iter()
            .skip(page.saturating_mul(page_size))
            .take(page_size)
            .collect();
        if page_uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut headers = self
            .with_deadline("header fetch", lease.fetch_headers(folder, &page_uids))
            .await?;
        headers.sort_by(|a, b| b.uid.cmp(&a.uid));
        Ok(headers)
    }

    // ========================================================================
    // Bodies & threads
    // ========================================================================

    /// Sync the bodies of cached messages that are still header-only.
    ///
    /// One batched fetch per folder; a message the server fails to return
    /// is reported in `failed` and never blocks the rest of the batch.
    pub async fn sync_missing_bodies(
        &self,
        user_id: UserId,
        refs: &[MessageRef],
    ) -> SyncResult<BodySyncReport> {
        let mut by_folder: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for r in refs {
            if let Some(message) = self.store.get_message(user_id, r).await? {
                if !message.body_synced {
                    by_folder.entry(r.folder.clone()).or_default().push(r.uid);
                }
            }
        }

        let mut synced = 0usize;
        let mut failed: Vec<MessageRef> = Vec::new();

        for (folder, uids) in by_folder {
            match self.fetch_bodies_with_retry(user_id, &folder, &uids).await {
                Ok(bodies) => {
                    let by_uid: HashMap<u32, &MessageBody> =
                        bodies.iter().map(|b| (b.uid, b)).collect();
                    for uid in &uids {
                        let r = MessageRef::new(folder.clone(), *uid);
                        match by_uid.get(uid) {
                            Some(body) => {
                                if self.apply_body(user_id, &r, body).await? {
                                    synced += 1;
                                }
                            }
                            None => {
                                log::warn!(
                                    "Server returned no body for UID {} in {}; leaving it header-only",
                                    uid,
                                    folder
                                );
                                failed.push(r);
                            }
                        }
                    }
                }
                Err(e) => {
                    // One folder's failure must not block the rest
                    log::error!(
                        "Body sync failed for {} ({} messages): {}",
                        folder,
                        uids.len(),
                        e
                    );
                    failed.extend(uids.iter().map(|&uid| MessageRef::new(folder.clone(), uid)));
                }
            }
        }

        let mut messages = Vec::with_capacity(refs.len());
        for r in refs {
            if let Some(message) = self.store.get_message(user_id, r).await? {
                messages.push(message);
            }
        }

        Ok(BodySyncReport {
            messages,
            synced,
            failed,
        })
    }

    async fn fetch_bodies_with_retry(
        &self,
        user_id: UserId,
        folder: &str,
        uids: &[u32],
    ) -> SyncResult<Vec<MessageBody>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut lease = self.pool.acquire_worker(user_id).await?;
            match self
                .with_deadline("body fetch", lease.fetch_bodies(folder, uids))
                .await
            {
                Ok(bodies) => return Ok(bodies),
                Err(e) if e.is_transport() => {
                    self.pool.evict_worker(lease).await;
                    if attempt == 1 {
                        log::warn!(
                            "Transport error fetching bodies in {} for user {}, retrying: {}",
                            folder,
                            user_id,
                            e
                        );
                        continue;
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn apply_body(
        &self,
        user_id: UserId,
        r: &MessageRef,
        body: &MessageBody,
    ) -> SyncResult<bool> {
        let Some(mut message) = self.store.get_message(user_id, r).await? else {
            return Ok(false);
        };

        message.body_text = body.body_text.clone();
        message.body_html = body.body_html.clone();
        message.has_attachments = !body.attachments.is_empty();
        message.body_synced = true;
        self.store.save_message(&message).await?;

        let attachments: Vec<AttachmentRecord> = body
            .attachments
            .iter()
            .map(|a| AttachmentRecord {
                user_id,
                folder: r.folder.clone(),
                uid: r.uid,
                filename: a.filename.clone(),
                content_type: a.content_type.clone(),
                size: a.size,
                content_id: a.content_id.clone(),
                is_inline: a.is_inline,
            })
            .collect();
        self.store.save_attachments(user_id, r, &attachments).await?;

        Ok(true)
    }

    /// Open a conversation: cached messages, lazily synced bodies, and
    /// attachment metadata in one batched lookup.
    pub async fn load_thread(&self, user_id: UserId, thread_key: &str) -> SyncResult<ThreadView> {
        let thread = self
            .store
            .get_thread(user_id, thread_key)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("thread {}", thread_key)))?;

        let cached = self.store.get_messages_for_thread(user_id, thread_key).await?;
        let refs: Vec<MessageRef> = cached
            .iter()
            .map(|m| MessageRef::new(m.folder.clone(), m.uid))
            .collect();

        let report = self.sync_missing_bodies(user_id, &refs).await?;
        let attachments = self
            .store
            .get_attachments_for_messages(user_id, &refs)
            .await?;

        Ok(ThreadView {
            thread,
            messages: report.messages,
            attachments,
        })
    }

    // ========================================================================
    // Folders
    // ========================================================================

    /// List the user's folders with their semantic roles
    pub async fn list_folders(&self, user_id: UserId) -> SyncResult<Vec<Folder>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut lease = self.pool.acquire_worker(user_id).await?;
            match self
                .with_deadline("folder listing", lease.list_folders())
                .await
            {
                Ok(folders) => return Ok(folders),
                Err(e) if e.is_transport() => {
                    self.pool.evict_worker(lease).await;
                    if attempt == 1 {
                        log::warn!(
                            "Transport error listing folders for user {}, retrying: {}",
                            user_id,
                            e
                        );
                        continue;
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Apply the per-command deadline to one protocol exchange
    async fn with_deadline<T, F>(&self, what: &str, fut: F) -> MailResult<T>
    where
        F: Future<Output = MailResult<T>>,
    {
        match tokio::time::timeout(self.policy.command_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(MailError::Timeout(format!(
                "{} exceeded {:?}",
                what, self.policy.command_timeout
            ))),
        }
    }
}

/// Cache record for a freshly synced header
fn message_record(
    user_id: UserId,
    folder: &str,
    header: &MessageHeader,
    thread_key: Option<String>,
) -> MessageRecord {
    MessageRecord {
        user_id,
        folder: folder.to_string(),
        uid: header.uid,
        message_id: header.message_id.clone(),
        thread_key,
        from: header.from.clone(),
        from_name: header.from_name.clone(),
        to: header.to.clone(),
        subject: header.subject.clone(),
        date: header.date,
        is_read: header.is_read,
        is_starred: header.is_starred,
        in_reply_to: header.in_reply_to.clone(),
        references: header.references.clone(),
        body_synced: false,
        body_text: None,
        body_html: None,
        has_attachments: false,
    }
}
