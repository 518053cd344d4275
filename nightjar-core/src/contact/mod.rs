// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Contact Registry
//!
//! Contacts are keyed by a stable random id and by nickname; the two
//! indexes always agree. A contact is pending from creation until its key
//! exchange completes, and carries everything the exchange and the message
//! pipeline need: the ratchet, the peer's spool location, the resumable
//! rendezvous state, and the in-flight counter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rand::Rng;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::crypto::ratchet::DoubleRatchet;
use crate::spool::SpoolWriteDescriptor;

/// Stable contact identifier. Non-zero, unique within a client.
pub type ContactId = u64;

/// Contact registry error types.
#[derive(Error, Debug)]
pub enum ContactError {
    #[error("Nickname already in use: {0}")]
    NicknameTaken(String),
    #[error("Nickname cannot be empty")]
    EmptyNickname,
    #[error("Contact id already in use: {0}")]
    IdTaken(ContactId),
}

/// A peer we talk to, by nickname.
pub struct Contact {
    pub(crate) id: ContactId,
    pub(crate) nickname: String,
    /// True until the key exchange completes.
    pub(crate) is_pending: bool,
    /// The ratchet session. Locked around encrypt/decrypt because the
    /// primitive mutates internal counters.
    pub(crate) ratchet: Arc<Mutex<DoubleRatchet>>,
    /// Where to append ciphertexts for this peer. None while pending.
    pub(crate) spool_write_descriptor: Option<SpoolWriteDescriptor>,
    /// Resumable rendezvous state. None once established or failed.
    pub(crate) kx_state: Option<Vec<u8>>,
    /// Cancel handle for the running rendezvous task.
    pub(crate) kx_cancel: Option<oneshot::Sender<()>>,
    /// Failure text of a terminally failed exchange.
    pub(crate) kx_result: Option<String>,
    /// Ciphertexts submitted but not yet confirmed by the remote spool.
    pub(crate) unacked_count: u32,
}

impl std::fmt::Debug for Contact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("is_pending", &self.is_pending)
            .field("unacked_count", &self.unacked_count)
            .finish()
    }
}

impl Contact {
    /// Creates a pending contact with a fresh ratchet.
    pub fn new_pending(id: ContactId, nickname: &str) -> Self {
        Contact {
            id,
            nickname: nickname.to_string(),
            is_pending: true,
            ratchet: Arc::new(Mutex::new(DoubleRatchet::new())),
            spool_write_descriptor: None,
            kx_state: None,
            kx_cancel: None,
            kx_result: None,
            unacked_count: 0,
        }
    }

    pub fn id(&self) -> ContactId {
        self.id
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_pending(&self) -> bool {
        self.is_pending
    }

    pub fn unacked_count(&self) -> u32 {
        self.unacked_count
    }

    /// Read-only view handed out by snapshot accessors.
    pub fn summary(&self) -> ContactSummary {
        ContactSummary {
            id: self.id,
            nickname: self.nickname.clone(),
            is_pending: self.is_pending,
            kx_result: self.kx_result.clone(),
            unacked_count: self.unacked_count,
        }
    }
}

/// Read-only contact view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactSummary {
    pub id: ContactId,
    pub nickname: String,
    pub is_pending: bool,
    pub kx_result: Option<String>,
    pub unacked_count: u32,
}

/// In-memory contact registry with dual indexes.
#[derive(Default)]
pub struct ContactStore {
    by_id: HashMap<ContactId, Contact>,
    nicknames: HashMap<String, ContactId>,
}

impl ContactStore {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of contacts.
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.by_id.len(), self.nicknames.len());
        self.by_id.len()
    }

    /// Returns true when the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Allocates a fresh non-zero id not currently in use.
    pub fn allocate_id(&self) -> ContactId {
        let mut rng = rand::thread_rng();
        loop {
            let id: ContactId = rng.gen();
            if id != 0 && !self.by_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Returns true when the nickname is registered.
    pub fn contains_nickname(&self, nickname: &str) -> bool {
        self.nicknames.contains_key(nickname)
    }

    /// Inserts a contact, enforcing nickname and id uniqueness.
    pub fn insert(&mut self, contact: Contact) -> Result<(), ContactError> {
        if contact.nickname.is_empty() {
            return Err(ContactError::EmptyNickname);
        }
        if self.nicknames.contains_key(&contact.nickname) {
            return Err(ContactError::NicknameTaken(contact.nickname));
        }
        if self.by_id.contains_key(&contact.id) {
            return Err(ContactError::IdTaken(contact.id));
        }

        self.nicknames.insert(contact.nickname.clone(), contact.id);
        self.by_id.insert(contact.id, contact);
        Ok(())
    }

    /// Removes a contact by nickname, returning it if present.
    pub fn remove_by_nickname(&mut self, nickname: &str) -> Option<Contact> {
        let id = self.nicknames.remove(nickname)?;
        self.by_id.remove(&id)
    }

    /// Looks up a contact by nickname.
    pub fn get_by_nickname(&self, nickname: &str) -> Option<&Contact> {
        let id = self.nicknames.get(nickname)?;
        self.by_id.get(id)
    }

    /// Mutable lookup by nickname.
    pub fn get_mut_by_nickname(&mut self, nickname: &str) -> Option<&mut Contact> {
        let id = self.nicknames.get(nickname)?;
        self.by_id.get_mut(id)
    }

    /// Looks up a contact by id.
    pub fn get_by_id(&self, id: ContactId) -> Option<&Contact> {
        self.by_id.get(&id)
    }

    /// Mutable lookup by id.
    pub fn get_mut_by_id(&mut self, id: ContactId) -> Option<&mut Contact> {
        self.by_id.get_mut(&id)
    }

    /// Iterates all contacts in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Contact> {
        self.by_id.values()
    }

    /// Mutable iteration over all contacts.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Contact> {
        self.by_id.values_mut()
    }

    /// Established contacts in ascending id order, for deterministic trial
    /// decryption.
    pub fn established_sorted(&self) -> Vec<&Contact> {
        let mut contacts: Vec<&Contact> =
            self.by_id.values().filter(|c| !c.is_pending).collect();
        contacts.sort_by_key(|c| c.id);
        contacts
    }

    /// Snapshot of all contacts as read-only summaries keyed by nickname.
    pub fn summaries(&self) -> HashMap<String, ContactSummary> {
        self.by_id
            .values()
            .map(|c| (c.nickname.clone(), c.summary()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_and_lookup_by_both_indexes() {
        let mut store = ContactStore::new();
        let contact = Contact::new_pending(42, "alice");
        store.insert(contact).unwrap();

        assert_eq!(store.get_by_nickname("alice").unwrap().id(), 42);
        assert_eq!(store.get_by_id(42).unwrap().nickname(), "alice");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_nickname_rejected() {
        let mut store = ContactStore::new();
        store.insert(Contact::new_pending(1, "alice")).unwrap();

        let result = store.insert(Contact::new_pending(2, "alice"));
        assert!(matches!(result, Err(ContactError::NicknameTaken(_))));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut store = ContactStore::new();
        store.insert(Contact::new_pending(1, "alice")).unwrap();

        let result = store.insert(Contact::new_pending(1, "bob"));
        assert!(matches!(result, Err(ContactError::IdTaken(1))));
        assert_eq!(store.len(), 1);
        assert!(!store.contains_nickname("bob"));
    }

    #[test]
    fn test_empty_nickname_rejected() {
        let mut store = ContactStore::new();
        assert!(matches!(
            store.insert(Contact::new_pending(1, "")),
            Err(ContactError::EmptyNickname)
        ));
    }

    #[test]
    fn test_remove_clears_both_indexes() {
        let mut store = ContactStore::new();
        store.insert(Contact::new_pending(7, "alice")).unwrap();

        let removed = store.remove_by_nickname("alice").unwrap();
        assert_eq!(removed.id(), 7);
        assert!(store.get_by_nickname("alice").is_none());
        assert!(store.get_by_id(7).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_unknown_is_none() {
        let mut store = ContactStore::new();
        assert!(store.remove_by_nickname("ghost").is_none());
    }

    #[test]
    fn test_allocate_id_avoids_collisions() {
        let mut store = ContactStore::new();
        store.insert(Contact::new_pending(1, "a")).unwrap();

        for _ in 0..100 {
            let id = store.allocate_id();
            assert_ne!(id, 0);
            assert!(store.get_by_id(id).is_none());
        }
    }

    #[test]
    fn test_established_sorted_orders_by_id() {
        let mut store = ContactStore::new();
        for (id, name) in [(30u64, "c"), (10, "a"), (20, "b")] {
            let mut contact = Contact::new_pending(id, name);
            contact.is_pending = false;
            store.insert(contact).unwrap();
        }
        let mut pending = Contact::new_pending(5, "pending");
        pending.is_pending = true;
        store.insert(pending).unwrap();

        let ids: Vec<ContactId> = store.established_sorted().iter().map(|c| c.id()).collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    proptest! {
        // Any add/remove sequence keeps the two indexes in agreement and
        // projecting onto the same contact set.
        #[test]
        fn prop_indexes_stay_consistent(ops in proptest::collection::vec((any::<bool>(), 0u8..8), 0..64)) {
            let mut store = ContactStore::new();

            for (add, name_idx) in ops {
                let nickname = format!("contact-{}", name_idx);
                if add {
                    let id = store.allocate_id();
                    let _ = store.insert(Contact::new_pending(id, &nickname));
                } else {
                    let _ = store.remove_by_nickname(&nickname);
                }

                prop_assert_eq!(store.by_id.len(), store.nicknames.len());
                for (nickname, id) in &store.nicknames {
                    let contact = store.by_id.get(id).expect("index points at live contact");
                    prop_assert_eq!(&contact.nickname, nickname);
                }
            }
        }
    }
}
