// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Send Tracker
//!
//! Maps transport-level message ids to the conversation message they
//! carry. Entries for read-inbox polls use the client's own nickname,
//! which is how replies are told apart from delivery confirmations.
//! Entries drain on reply or garbage collection.

use std::collections::HashMap;

use crate::conversation::MessageId;
use crate::transport::TransportId;

/// What one transport submission was for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SendEntry {
    /// Destination nickname, or our own nickname for read-inbox polls.
    pub nickname: String,
    /// The conversation message id, or the polled offset packed into an
    /// id for read-inbox polls.
    pub message_id: MessageId,
}

/// Registry of in-flight transport submissions.
#[derive(Debug, Default)]
pub(crate) struct SendTracker {
    entries: HashMap<TransportId, SendEntry>,
}

impl SendTracker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, transport_id: TransportId, entry: SendEntry) {
        self.entries.insert(transport_id, entry);
    }

    pub(crate) fn get(&self, transport_id: &TransportId) -> Option<&SendEntry> {
        self.entries.get(transport_id)
    }

    pub(crate) fn remove(&mut self, transport_id: &TransportId) -> Option<SendEntry> {
        self.entries.remove(transport_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}
