// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Conversation Store
//!
//! Per-contact message history keyed by locally assigned message ids.
//! Readers snapshot under a read lock; all writes originate in the
//! client's command loop.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime};

use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Length of a conversation message id in bytes.
pub const MESSAGE_ID_LEN: usize = 16;

/// Messages older than this are garbage collected.
pub const MESSAGE_EXPIRATION: Duration = Duration::from_secs(168 * 60 * 60);

/// A locally assigned message identifier.
///
/// Uniformly random, never derived from message content. The same width is
/// used for transport-level message ids.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", hex::encode(self.0))
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl MessageId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        let mut bytes = [0u8; MESSAGE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        MessageId(bytes)
    }

    /// Builds an id carrying a spool read offset in its first four bytes.
    ///
    /// Used as the tracker value for read-inbox submissions, which have no
    /// conversation message behind them.
    pub fn from_read_offset(offset: u32) -> Self {
        let mut bytes = [0u8; MESSAGE_ID_LEN];
        bytes[..4].copy_from_slice(&offset.to_be_bytes());
        MessageId(bytes)
    }

    /// Returns the raw id bytes.
    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

/// A single conversation message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Message contents. May be empty for outbound messages whose history
    /// was trimmed.
    pub plaintext: Vec<u8>,
    /// Ratchet ciphertext, kept for retransmission and cleared once the
    /// remote spool acknowledged the append.
    pub ciphertext: Vec<u8>,
    /// Wall-clock time at enqueue or reception.
    pub timestamp: SystemTime,
    /// True for messages we authored.
    pub outbound: bool,
    /// True once the transport acknowledged submission.
    pub sent: bool,
    /// True once the remote spool acknowledged the append.
    pub delivered: bool,
}

impl Message {
    /// Creates a new outbound message awaiting encryption and submission.
    pub fn outbound(plaintext: Vec<u8>, timestamp: SystemTime) -> Self {
        Message {
            plaintext,
            ciphertext: Vec::new(),
            timestamp,
            outbound: true,
            sent: false,
            delivered: false,
        }
    }

    /// Creates an inbound message.
    pub fn inbound(plaintext: Vec<u8>, timestamp: SystemTime) -> Self {
        Message {
            plaintext,
            ciphertext: Vec::new(),
            timestamp,
            outbound: false,
            sent: false,
            delivered: false,
        }
    }

    /// Returns true when the message has outlived the retention window.
    pub fn is_expired(&self, now: SystemTime) -> bool {
        match now.duration_since(self.timestamp) {
            Ok(age) => age > MESSAGE_EXPIRATION,
            // timestamp in the future: clock skew, keep it
            Err(_) => false,
        }
    }
}

/// Conversations for all contacts, keyed by nickname.
pub type ConversationMap = HashMap<String, HashMap<MessageId, Message>>;

/// Mutex-guarded conversation registry.
///
/// The command loop is the only writer; snapshot accessors clone under the
/// read lock so callers never observe a half-applied mutation.
#[derive(Default)]
pub struct ConversationStore {
    inner: RwLock<ConversationMap>,
}

impl ConversationStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store seeded from a persisted snapshot.
    pub fn from_map(map: ConversationMap) -> Self {
        ConversationStore {
            inner: RwLock::new(map),
        }
    }

    /// Inserts a message into a conversation.
    pub fn insert(&self, nickname: &str, id: MessageId, message: Message) {
        let mut inner = self.inner.write().expect("conversation lock poisoned");
        inner
            .entry(nickname.to_string())
            .or_default()
            .insert(id, message);
    }

    /// Applies a mutation to one message. Returns false if the message is
    /// not present.
    pub fn with_message<F>(&self, nickname: &str, id: &MessageId, f: F) -> bool
    where
        F: FnOnce(&mut Message),
    {
        let mut inner = self.inner.write().expect("conversation lock poisoned");
        match inner.get_mut(nickname).and_then(|c| c.get_mut(id)) {
            Some(message) => {
                f(message);
                true
            }
            None => false,
        }
    }

    /// Snapshot of one conversation. Empty if the nickname has none.
    pub fn conversation(&self, nickname: &str) -> HashMap<MessageId, Message> {
        let inner = self.inner.read().expect("conversation lock poisoned");
        inner.get(nickname).cloned().unwrap_or_default()
    }

    /// Snapshot of all conversations.
    pub fn all(&self) -> ConversationMap {
        self.inner
            .read()
            .expect("conversation lock poisoned")
            .clone()
    }

    /// Outbound messages submitted but not yet confirmed by the remote
    /// spool, with their retransmittable ciphertexts.
    pub fn unconfirmed_outbound(&self, nickname: &str) -> Vec<(MessageId, SystemTime, Vec<u8>)> {
        let inner = self.inner.read().expect("conversation lock poisoned");
        let Some(conversation) = inner.get(nickname) else {
            return Vec::new();
        };
        conversation
            .iter()
            .filter(|(_, m)| m.outbound && m.sent && !m.delivered && !m.ciphertext.is_empty())
            .map(|(id, m)| (*id, m.timestamp, m.ciphertext.clone()))
            .collect()
    }

    /// Counts outbound messages submitted but not yet confirmed.
    pub fn unconfirmed_count(&self, nickname: &str) -> usize {
        let inner = self.inner.read().expect("conversation lock poisoned");
        inner
            .get(nickname)
            .map(|c| {
                c.values()
                    .filter(|m| m.outbound && m.sent && !m.delivered)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Removes expired messages everywhere. Returns how many were dropped.
    pub fn expire(&self, now: SystemTime) -> usize {
        let mut inner = self.inner.write().expect("conversation lock poisoned");
        let mut removed = 0;
        for conversation in inner.values_mut() {
            let before = conversation.len();
            conversation.retain(|_, m| !m.is_expired(now));
            removed += before - conversation.len();
        }
        inner.retain(|_, c| !c.is_empty());
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> SystemTime {
        SystemTime::now()
    }

    #[test]
    fn test_insert_and_snapshot() {
        let store = ConversationStore::new();
        let id = MessageId::generate();
        store.insert("peer", id, Message::outbound(b"hi".to_vec(), now()));

        let snapshot = store.conversation("peer");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&id].plaintext, b"hi");
        assert!(snapshot[&id].outbound);
        assert!(!snapshot[&id].sent);
    }

    #[test]
    fn test_snapshot_for_unknown_nickname_is_empty() {
        let store = ConversationStore::new();
        assert!(store.conversation("ghost").is_empty());
    }

    #[test]
    fn test_with_message_mutates() {
        let store = ConversationStore::new();
        let id = MessageId::generate();
        store.insert("peer", id, Message::outbound(b"hi".to_vec(), now()));

        assert!(store.with_message("peer", &id, |m| m.sent = true));
        assert!(store.conversation("peer")[&id].sent);

        let missing = MessageId::generate();
        assert!(!store.with_message("peer", &missing, |m| m.sent = true));
    }

    #[test]
    fn test_expire_removes_only_old_messages() {
        let store = ConversationStore::new();
        let now = now();
        let old = now - 2 * MESSAGE_EXPIRATION;

        let old_id = MessageId::generate();
        let fresh_id = MessageId::generate();
        store.insert("peer", old_id, Message::inbound(b"old".to_vec(), old));
        store.insert("peer", fresh_id, Message::inbound(b"new".to_vec(), now));

        assert_eq!(store.expire(now), 1);

        let snapshot = store.conversation("peer");
        assert!(!snapshot.contains_key(&old_id));
        assert!(snapshot.contains_key(&fresh_id));
    }

    #[test]
    fn test_expire_keeps_future_timestamps() {
        let store = ConversationStore::new();
        let future = now() + Duration::from_secs(3600);
        store.insert(
            "peer",
            MessageId::generate(),
            Message::inbound(b"skewed".to_vec(), future),
        );
        assert_eq!(store.expire(now()), 0);
    }

    #[test]
    fn test_unconfirmed_outbound_filters() {
        let store = ConversationStore::new();
        let ts = now();

        let sent_id = MessageId::generate();
        let mut sent = Message::outbound(b"a".to_vec(), ts);
        sent.sent = true;
        sent.ciphertext = b"ct".to_vec();
        store.insert("peer", sent_id, sent);

        let mut delivered = Message::outbound(b"b".to_vec(), ts);
        delivered.sent = true;
        delivered.delivered = true;
        store.insert("peer", MessageId::generate(), delivered);

        // never submitted
        store.insert("peer", MessageId::generate(), Message::outbound(b"c".to_vec(), ts));

        let unconfirmed = store.unconfirmed_outbound("peer");
        assert_eq!(unconfirmed.len(), 1);
        assert_eq!(unconfirmed[0].0, sent_id);
    }

    #[test]
    fn test_message_id_from_read_offset() {
        let id = MessageId::from_read_offset(0x01020304);
        assert_eq!(&id.as_bytes()[..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&id.as_bytes()[4..], &[0u8; 12]);
    }
}
