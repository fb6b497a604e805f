//! Thread reconstruction
//!
//! Turns the server's THREAD forest plus the already-fetched header map
//! into conversation groupings. The stable thread key is the Message-ID
//! of the thread's root message; no client-side threading heuristics
//! exist here, a server without the THREAD extension fails sync outright
//! before this code runs.

use std::collections::HashMap;

use crate::mail::{MessageHeader, ThreadNode};

/// One reconstructed conversation: root UID, stable key, member UIDs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSet {
    pub root_uid: u32,
    pub thread_key: String,
    /// Member UIDs, root first
    pub uids: Vec<u32>,
}

/// Build conversation sets from the THREAD forest.
///
/// Root Message-IDs are resolved by indexing into the header map that the
/// full-folder fetch already produced; no additional fetch happens here.
///
/// The server's forest is folder-local, so a folder root may itself be a
/// reply whose true conversation root lives elsewhere; its first
/// References entry carries that root's Message-ID and wins over the
/// folder root's own id. This keeps the key stable across folders.
///
/// A root with neither drops its whole subtree from thread attachment;
/// the messages themselves still get cached.
pub fn build_threads(
    forest: &[ThreadNode],
    headers: &HashMap<u32, MessageHeader>,
) -> Vec<ThreadSet> {
    let mut threads = Vec::with_capacity(forest.len());

    for root in forest {
        let thread_key = headers
            .get(&root.uid)
            .and_then(|h| h.references.first().cloned().or_else(|| h.message_id.clone()));

        match thread_key {
            Some(thread_key) => threads.push(ThreadSet {
                root_uid: root.uid,
                thread_key,
                uids: root.flatten(),
            }),
            None => {
                log::warn!(
                    "Thread root UID {} has no resolvable Message-ID; leaving its {} message(s) unthreaded",
                    root.uid,
                    root.flatten().len()
                );
            }
        }
    }

    threads
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(uid: u32, message_id: Option<&str>) -> MessageHeader {
        MessageHeader {
            uid,
            message_id: message_id.map(String::from),
            in_reply_to: None,
            references: Vec::new(),
            from: "sender@example.com".to_string(),
            from_name: None,
            to: vec!["user@example.com".to_string()],
            subject: format!("Message {}", uid),
            date: None,
            is_read: false,
            is_starred: false,
        }
    }

    fn header_map(uids: &[u32]) -> HashMap<u32, MessageHeader> {
        uids.iter()
            .map(|&uid| {
                let id = format!("<{}@example.com>", uid);
                (uid, header(uid, Some(&id)))
            })
            .collect()
    }

    #[test]
    fn test_forest_of_three_roots_yields_three_threads() {
        // 10 messages across 3 conversations
        let forest = vec![
            ThreadNode {
                uid: 1,
                children: vec![ThreadNode::new(2), ThreadNode::new(3)],
            },
            ThreadNode {
                uid: 4,
                children: vec![ThreadNode {
                    uid: 5,
                    children: vec![ThreadNode::new(6), ThreadNode::new(7)],
                }],
            },
            ThreadNode {
                uid: 8,
                children: vec![ThreadNode::new(9), ThreadNode::new(10)],
            },
        ];
        let headers = header_map(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);

        let threads = build_threads(&forest, &headers);

        assert_eq!(threads.len(), 3);
        assert_eq!(threads[0].uids, vec![1, 2, 3]);
        assert_eq!(threads[1].uids, vec![4, 5, 6, 7]);
        assert_eq!(threads[2].uids, vec![8, 9, 10]);
        assert_eq!(threads[0].thread_key, "<1@example.com>");
        assert_eq!(threads[1].root_uid, 4);
    }

    #[test]
    fn test_rootless_thread_is_skipped() {
        let forest = vec![
            ThreadNode {
                uid: 1,
                children: vec![ThreadNode::new(2)],
            },
            ThreadNode::new(3),
        ];
        let mut headers = header_map(&[2, 3]);
        // Root 1 exists on the server but its header carries no Message-ID
        headers.insert(1, header(1, None));

        let threads = build_threads(&forest, &headers);

        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].root_uid, 3);
    }

    #[test]
    fn test_root_missing_from_header_map_is_skipped() {
        let forest = vec![ThreadNode::new(9)];
        let threads = build_threads(&forest, &HashMap::new());
        assert!(threads.is_empty());
    }
}
