// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Operations Queue
//!
//! Every state mutation enters the command loop as one of these variants
//! through a single bounded inbox, which is what serializes the client:
//! user operations, key-exchange updates, and transport notifications all
//! take the same path.

use std::collections::HashMap;

use tokio::sync::oneshot;

use crate::contact::ContactSummary;
use crate::conversation::MessageId;
use crate::kx::KxEvent;
use crate::transport::TransportEvent;

/// Capacity of the operations inbox.
pub(crate) const OP_QUEUE_DEPTH: usize = 8;

/// An operation for the command loop.
#[derive(Debug)]
pub(crate) enum Op {
    /// Register a contact and begin its key exchange.
    AddContact {
        nickname: String,
        shared_secret: Vec<u8>,
    },

    /// Delete a contact, cancelling its exchange if still pending.
    RemoveContact { nickname: String },

    /// Snapshot the contact registry.
    GetContacts {
        reply: oneshot::Sender<HashMap<String, ContactSummary>>,
    },

    /// Encrypt and submit a message. The id was assigned by the caller
    /// and already serves as its handle.
    SendMessage {
        nickname: String,
        payload: Vec<u8>,
        message_id: MessageId,
    },

    /// Progress report from a key-exchange task.
    KeyExchange(KxEvent),

    /// Notification from the mix session.
    Transport(TransportEvent),

    /// Stop the loop after cancelling exchanges and persisting.
    Shutdown { done: oneshot::Sender<()> },
}
