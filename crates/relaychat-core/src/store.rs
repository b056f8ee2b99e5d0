//! In-memory message store backed by the append-only log (spec §4.D).
//!
//! # Design Pattern: Mutex-guarded state, never held across `.await`
//!
//! Every mutating method here is synchronous and takes the lock for the
//! duration of one in-memory update plus one log append — both
//! non-blocking-in-practice, bounded operations. None of them call out to
//! the network. Replication fanout happens in the caller
//! ([`crate::sync::client::SyncClient`] or the session dispatcher) using
//! the `Message`/`MessageId` values each method *returns*, after the lock
//! has already been dropped. This is a deliberate fix relative to the
//! system this crate reimplements, where the equivalent lock was held
//! across the peer RPC call that replicated a mutation — a single slow or
//! unreachable peer would stall every other client connection on the
//! node.

use crate::log::{MessageLog, MessageLogError};
use crate::types::{Message, MessageId, Status};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Log(#[from] MessageLogError),
}

struct Inner {
    by_id: HashMap<MessageId, Message>,
    /// recipient -> sender -> message ids, oldest first.
    inbox: HashMap<String, HashMap<String, Vec<MessageId>>>,
}

impl Inner {
    fn empty() -> Self {
        Self {
            by_id: HashMap::new(),
            inbox: HashMap::new(),
        }
    }

    /// Rebuilds `inbox` from `by_id` in the order messages were supplied
    /// (spec P3: inbox ordering within a bucket must match arrival order,
    /// ordering across distinct buckets is unconstrained).
    fn from_replay(messages: Vec<Message>) -> Self {
        let mut inner = Self::empty();
        for msg in messages {
            inner
                .inbox
                .entry(msg.recipient.clone())
                .or_default()
                .entry(msg.sender.clone())
                .or_default()
                .push(msg.id.clone());
            inner.by_id.insert(msg.id.clone(), msg);
        }
        inner
    }

    fn insert_new(&mut self, msg: Message) {
        self.inbox
            .entry(msg.recipient.clone())
            .or_default()
            .entry(msg.sender.clone())
            .or_default()
            .push(msg.id.clone());
        self.by_id.insert(msg.id.clone(), msg);
    }

    fn remove(&mut self, id: &MessageId) -> Option<Message> {
        let msg = self.by_id.remove(id)?;
        if let Some(by_sender) = self.inbox.get_mut(&msg.recipient) {
            if let Some(ids) = by_sender.get_mut(&msg.sender) {
                ids.retain(|existing| existing != id);
                if ids.is_empty() {
                    by_sender.remove(&msg.sender);
                }
            }
            if by_sender.is_empty() {
                self.inbox.remove(&msg.recipient);
            }
        }
        Some(msg)
    }
}

/// The in-memory, log-backed message store for one node.
pub struct Store {
    log: MessageLog,
    inner: Mutex<Inner>,
}

impl Store {
    /// Opens `log_path`, replaying any existing log into memory.
    pub fn open(log_path: impl Into<std::path::PathBuf>) -> Result<Self, StoreError> {
        let log = MessageLog::new(log_path);
        let messages = log.replay()?;
        Ok(Self {
            log,
            inner: Mutex::new(Inner::from_replay(messages)),
        })
    }

    pub fn log(&self) -> &MessageLog {
        &self.log
    }

    /// Originates a new message from `sender` to `recipient`. `online` is
    /// the caller's answer to spec §4.D's `online?(recipient)` predicate
    /// (backed by [`crate::presence::Presence`]): a message to a
    /// currently-connected recipient is stored already `Read`, matching
    /// the original system's "deliver directly" behavior for an online
    /// recipient. Returns the stored `Message` (with a freshly generated
    /// id) for the caller to fan out to peers.
    pub fn send(
        &self,
        sender: impl Into<String>,
        recipient: impl Into<String>,
        content: impl Into<String>,
        timestamp: f64,
        online: bool,
    ) -> Result<Message, StoreError> {
        let status = if online { Status::Read } else { Status::Unread };
        let msg = Message::new(sender, recipient, content, timestamp, status);
        self.log.append_upsert(&msg)?;
        self.inner.lock().unwrap().insert_new(msg.clone());
        Ok(msg)
    }

    /// Returns, and marks read, every message addressed to `recipient`
    /// from `sender` (the original system's `read_messages`). Returns the
    /// messages in their pre-mutation (possibly `Unread`) form and the ids
    /// that were actually flipped to `Read`, so the caller can both answer
    /// the request and fan out an incremental-read record.
    pub fn read(&self, recipient: &str, sender: &str) -> Result<(Vec<Message>, Vec<MessageId>), StoreError> {
        let (returned, touched) = {
            let mut inner = self.inner.lock().unwrap();
            let ids = inner
                .inbox
                .get(recipient)
                .and_then(|by_sender| by_sender.get(sender))
                .cloned()
                .unwrap_or_default();

            let mut returned = Vec::with_capacity(ids.len());
            let mut touched = Vec::new();
            for id in &ids {
                if let Some(msg) = inner.by_id.get(id) {
                    returned.push(msg.clone());
                    if msg.status == Status::Unread {
                        touched.push(id.clone());
                    }
                }
            }
            for id in &touched {
                if let Some(msg) = inner.by_id.get_mut(id) {
                    msg.status = Status::Read;
                }
            }
            (returned, touched)
        };

        self.log.append_read(&touched)?;
        Ok((returned, touched))
    }

    /// Returns every message addressed to `recipient` from `sender`
    /// without mutating read state (the original system's
    /// `list_messages` peek).
    pub fn list_messages(&self, recipient: &str, sender: &str) -> Vec<Message> {
        let inner = self.inner.lock().unwrap();
        inner
            .inbox
            .get(recipient)
            .and_then(|by_sender| by_sender.get(sender))
            .map(|ids| ids.iter().filter_map(|id| inner.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Unread message counts for `recipient`, one entry per name in
    /// `known_users` (including senders with a count of zero — spec
    /// §4.D: "for each known sender").
    pub fn list_unread_counts(&self, recipient: &str, known_users: &[String]) -> HashMap<String, usize> {
        let inner = self.inner.lock().unwrap();
        known_users
            .iter()
            .map(|sender| {
                let count = inner
                    .inbox
                    .get(recipient)
                    .and_then(|by_sender| by_sender.get(sender))
                    .map(|ids| {
                        ids.iter()
                            .filter(|id| inner.by_id.get(*id).map(|m| m.status == Status::Unread).unwrap_or(false))
                            .count()
                    })
                    .unwrap_or(0);
                (sender.clone(), count)
            })
            .collect()
    }

    /// Deletes the given messages locally and returns the ids that were
    /// actually present (for fanout). Unknown ids are silently ignored.
    pub fn delete_message(&self, ids: &[MessageId]) -> Result<Vec<MessageId>, StoreError> {
        let removed: Vec<MessageId> = {
            let mut inner = self.inner.lock().unwrap();
            ids.iter().filter(|id| inner.remove(id).is_some()).cloned().collect()
        };
        self.log.append_delete(&removed)?;
        Ok(removed)
    }

    /// Deletes every message where `username` is sender or recipient.
    /// Local only — account deletion is not replicated (the source system
    /// does not replicate it either).
    pub fn delete_account(&self, username: &str) -> Result<Vec<MessageId>, StoreError> {
        let removed: Vec<MessageId> = {
            let mut inner = self.inner.lock().unwrap();
            let ids: Vec<MessageId> = inner
                .by_id
                .values()
                .filter(|m| m.sender == username || m.recipient == username)
                .map(|m| m.id.clone())
                .collect();
            ids.into_iter().filter(|id| inner.remove(id).is_some()).collect()
        };
        self.log.append_delete(&removed)?;
        Ok(removed)
    }

    /// Applies a message received from a peer (full or incremental sync).
    /// Last-writer-wins by timestamp: a remote message only overwrites a
    /// locally-known message with the same id if its timestamp is strictly
    /// newer.
    ///
    /// No tombstones are kept for deleted ids, so a peer's upsert for an
    /// id this node already deleted resurrects it. `delete_account` is
    /// local-only and never fanned out, so the same resurrection can
    /// happen via a later `GetFullData` from a peer that never heard
    /// about the account deletion. Both match the system this store
    /// replaces rather than being novel gaps.
    pub fn apply_remote_upsert(&self, msg: Message) -> Result<(), StoreError> {
        let applied = {
            let mut inner = self.inner.lock().unwrap();
            match inner.by_id.get(&msg.id) {
                Some(existing) if existing.timestamp >= msg.timestamp => false,
                Some(_) => {
                    inner.remove(&msg.id);
                    inner.insert_new(msg.clone());
                    true
                }
                None => {
                    inner.insert_new(msg.clone());
                    true
                }
            }
        };
        if applied {
            self.log.append_upsert(&msg)?;
        }
        Ok(())
    }

    /// Applies a delete received from a peer.
    pub fn apply_remote_delete(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        let removed: Vec<MessageId> = {
            let mut inner = self.inner.lock().unwrap();
            ids.iter().filter(|id| inner.remove(id).is_some()).cloned().collect()
        };
        self.log.append_delete(&removed)?;
        Ok(())
    }

    /// Applies a read-state update received from a peer.
    pub fn apply_remote_read(&self, ids: &[MessageId]) -> Result<(), StoreError> {
        let touched: Vec<MessageId> = {
            let mut inner = self.inner.lock().unwrap();
            ids.iter()
                .filter(|id| {
                    inner
                        .by_id
                        .get_mut(id)
                        .map(|m| {
                            let was_unread = m.status == Status::Unread;
                            m.status = Status::Read;
                            was_unread
                        })
                        .unwrap_or(false)
                })
                .cloned()
                .collect()
        };
        self.log.append_read(&touched)?;
        Ok(())
    }

    /// Replaces the entire dataset with `messages`, then removes
    /// `deleted_ids` (spec §4.E `FullSync`: "clears both structures,
    /// applies every message as upsert, applies every deleted_id").
    /// Unlike [`Self::apply_remote_upsert`] this does not LWW-merge
    /// against the prior state — it discards it outright. Rewrites the
    /// log as a fresh snapshot, since the whole dataset just changed at
    /// once rather than by a single appendable record.
    pub fn replace_all(&self, messages: Vec<Message>, deleted_ids: &[MessageId]) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().unwrap();
            *inner = Inner::from_replay(messages);
            for id in deleted_ids {
                inner.remove(id);
            }
        }
        let snapshot = self.snapshot();
        self.log.write_snapshot(snapshot.iter())?;
        Ok(())
    }

    /// A consistent point-in-time copy of every message currently held.
    /// Used for `GetFullData`/`FullSync` responses and for rewriting the
    /// log as a snapshot at startup (spec §4.C, §4.I).
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().unwrap().by_id.values().cloned().collect()
    }

    /// Rewrites the log file as a snapshot of the current in-memory state.
    pub fn compact(&self) -> Result<(), StoreError> {
        let snapshot = self.snapshot();
        self.log.write_snapshot(snapshot.iter())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Store) {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = Store::open(tmp.path().join("node.json")).unwrap();
        (tmp, store)
    }

    #[test]
    fn send_then_read_marks_read_once() {
        let (_tmp, store) = open_tmp();
        store.send("alice", "bob", "hi", 1.0, false).unwrap();

        let (msgs, touched) = store.read("bob", "alice").unwrap();
        assert_eq!(msgs.len(), 1);
        assert_eq!(touched.len(), 1);
        assert_eq!(msgs[0].status, Status::Unread, "returned pre-mutation status");

        let (msgs2, touched2) = store.read("bob", "alice").unwrap();
        assert_eq!(msgs2[0].status, Status::Read);
        assert!(touched2.is_empty(), "second read touches nothing new");
    }

    #[test]
    fn send_marks_unread_when_recipient_offline() {
        let (_tmp, store) = open_tmp();
        let msg = store.send("alice", "bob", "hi", 1.0, false).unwrap();
        assert_eq!(msg.status, Status::Unread);
    }

    #[test]
    fn send_marks_read_when_recipient_online() {
        let (_tmp, store) = open_tmp();
        let msg = store.send("alice", "bob", "hi", 1.0, true).unwrap();
        assert_eq!(msg.status, Status::Read);
    }

    #[test]
    fn list_messages_does_not_mutate() {
        let (_tmp, store) = open_tmp();
        store.send("alice", "bob", "hi", 1.0, false).unwrap();
        let peeked = store.list_messages("bob", "alice");
        assert_eq!(peeked[0].status, Status::Unread);
        let peeked_again = store.list_messages("bob", "alice");
        assert_eq!(peeked_again[0].status, Status::Unread);
    }

    #[test]
    fn unread_counts_report_zero_for_known_senders_with_no_unread() {
        let (_tmp, store) = open_tmp();
        store.send("alice", "bob", "hi", 1.0, false).unwrap();
        store.send("carol", "bob", "hey", 2.0, false).unwrap();
        store.read("bob", "carol").unwrap();

        let known = vec!["alice".to_string(), "carol".to_string(), "dave".to_string()];
        let counts = store.list_unread_counts("bob", &known);
        assert_eq!(counts.get("alice"), Some(&1));
        assert_eq!(counts.get("carol"), Some(&0));
        assert_eq!(counts.get("dave"), Some(&0));
    }

    #[test]
    fn delete_message_removes_from_inbox() {
        let (_tmp, store) = open_tmp();
        let msg = store.send("alice", "bob", "hi", 1.0, false).unwrap();
        let removed = store.delete_message(&[msg.id.clone()]).unwrap();
        assert_eq!(removed, vec![msg.id]);
        assert!(store.list_messages("bob", "alice").is_empty());
    }

    #[test]
    fn delete_message_ignores_unknown_ids() {
        let (_tmp, store) = open_tmp();
        let removed = store.delete_message(&[MessageId::new("nope")]).unwrap();
        assert!(removed.is_empty());
    }

    #[test]
    fn delete_account_removes_both_directions() {
        let (_tmp, store) = open_tmp();
        store.send("alice", "bob", "hi", 1.0, false).unwrap();
        store.send("bob", "alice", "yo", 2.0, false).unwrap();
        store.send("carol", "dave", "unrelated", 3.0, false).unwrap();

        let removed = store.delete_account("alice").unwrap();
        assert_eq!(removed.len(), 2);
        assert!(store.list_messages("bob", "alice").is_empty());
        assert!(store.list_messages("alice", "bob").is_empty());
        assert_eq!(store.list_messages("dave", "carol").len(), 1);
    }

    #[test]
    fn apply_remote_upsert_is_last_writer_wins() {
        let (_tmp, store) = open_tmp();
        let msg = store.send("alice", "bob", "hi", 5.0, false).unwrap();

        let mut stale = msg.clone();
        stale.content = "stale edit".to_string();
        stale.timestamp = 1.0;
        store.apply_remote_upsert(stale).unwrap();
        assert_eq!(store.list_messages("bob", "alice")[0].content, "hi");

        let mut fresher = msg.clone();
        fresher.content = "fresher edit".to_string();
        fresher.timestamp = 10.0;
        store.apply_remote_upsert(fresher).unwrap();
        assert_eq!(store.list_messages("bob", "alice")[0].content, "fresher edit");
    }

    #[test]
    fn apply_remote_upsert_of_new_message_inserts() {
        let (_tmp, store) = open_tmp();
        let msg = Message::new("alice", "bob", "from peer", 1.0, Status::Unread);
        store.apply_remote_upsert(msg.clone()).unwrap();
        assert_eq!(store.list_messages("bob", "alice"), vec![msg]);
    }

    #[test]
    fn reopen_replays_snapshot_and_log() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("node.json");
        {
            let store = Store::open(&path).unwrap();
            store.send("alice", "bob", "hi", 1.0, false).unwrap();
            store.send("alice", "bob", "again", 2.0, false).unwrap();
            store.read("bob", "alice").unwrap();
        }
        let reopened = Store::open(&path).unwrap();
        let msgs = reopened.list_messages("bob", "alice");
        assert_eq!(msgs.len(), 2);
        assert!(msgs.iter().all(|m| m.status == Status::Read));
    }

    #[test]
    fn compact_rewrites_log_to_current_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("node.json");
        let store = Store::open(&path).unwrap();
        let msg = store.send("alice", "bob", "hi", 1.0, false).unwrap();
        store.delete_message(&[msg.id]).unwrap();
        store.send("carol", "dave", "new", 2.0, false).unwrap();

        store.compact().unwrap();
        let reopened = Store::open(&path).unwrap();
        assert!(reopened.list_messages("bob", "alice").is_empty());
        assert_eq!(reopened.list_messages("dave", "carol").len(), 1);
    }

    #[test]
    fn replace_all_clears_prior_state_then_applies_deletes() {
        let (_tmp, store) = open_tmp();
        store.send("alice", "bob", "stale", 1.0, false).unwrap();

        let incoming = vec![
            Message::new("carol", "dave", "fresh", 5.0, Status::Unread),
            Message::new("erin", "frank", "keep-me", 6.0, Status::Unread),
        ];
        let deleted = vec![incoming[0].id.clone()];
        store.replace_all(incoming, &deleted).unwrap();

        assert!(store.list_messages("bob", "alice").is_empty(), "prior state was cleared");
        assert!(store.list_messages("dave", "carol").is_empty(), "deleted id was removed");
        assert_eq!(store.list_messages("frank", "erin").len(), 1);
    }

    #[test]
    fn replace_all_rewrites_log_to_new_state() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("node.json");
        let store = Store::open(&path).unwrap();
        store.send("alice", "bob", "stale", 1.0, false).unwrap();

        let incoming = vec![Message::new("carol", "dave", "fresh", 5.0, Status::Unread)];
        store.replace_all(incoming, &[]).unwrap();

        let reopened = Store::open(&path).unwrap();
        assert!(reopened.list_messages("bob", "alice").is_empty());
        assert_eq!(reopened.list_messages("dave", "carol").len(), 1);
    }
}
