// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key Exchange
//!
//! The rendezvous engine contract: one task per pending contact, driven
//! from a low-entropy shared secret (or a resumable state blob) to the
//! peer's [`ContactExchange`] payload. Tasks report progress through the
//! client's operations inbox and honor a cancel handle.
//!
//! The engine itself is external; [`MemoryRendezvous`] is the in-process
//! implementation used by tests and demos, and [`ScriptedKeyExchange`]
//! replays a fixed update sequence for supervisor edge cases.

pub mod memory;
pub mod scripted;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::contact::ContactId;
use crate::spool::SpoolWriteDescriptor;

pub use memory::MemoryRendezvous;
pub use scripted::ScriptedKeyExchange;

/// Key exchange error types.
#[derive(Error, Debug)]
pub enum KxError {
    #[error("Malformed contact exchange blob: {0}")]
    Malformed(String),
}

/// The payload exchanged through the rendezvous: our signed ratchet key
/// exchange plus the write half of our spool, so the peer knows where to
/// deposit ciphertexts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactExchange {
    pub signed_kx: Vec<u8>,
    pub spool_write_descriptor: SpoolWriteDescriptor,
}

impl ContactExchange {
    /// Encodes the exchange payload.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("contact exchange serialization cannot fail")
    }

    /// Decodes an exchange payload received from the peer.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, KxError> {
        bincode::deserialize(bytes).map_err(|e| KxError::Malformed(e.to_string()))
    }
}

/// Progress reports emitted by a key-exchange task.
#[derive(Debug, Clone)]
pub enum KxUpdate {
    /// New resumable protocol state; persisted so the exchange survives a
    /// restart.
    Progress { state: Vec<u8> },
    /// The rendezvous timed out; the supervisor restarts the task from the
    /// last persisted state.
    Timeout,
    /// The exchange failed terminally.
    Failure { error: String },
    /// The exchange completed; `result` is the peer's [`ContactExchange`].
    Success { result: Vec<u8> },
}

/// An update tagged with the contact it belongs to.
#[derive(Debug)]
pub struct KxEvent {
    pub contact_id: ContactId,
    pub update: KxUpdate,
}

/// Everything a key-exchange task needs. Deliberately free of any contact
/// or client reference: primitives only.
pub struct KxTask {
    pub contact_id: ContactId,
    /// The low-entropy secret both parties agreed on out of band.
    pub shared_secret: Vec<u8>,
    /// Resumable state from an earlier run, if any.
    pub resume_state: Option<Vec<u8>>,
    /// Our [`ContactExchange`] payload to hand to the peer.
    pub exchange_payload: Vec<u8>,
    /// Where progress reports go.
    pub updates: mpsc::Sender<KxEvent>,
    /// Resolves when the contact is removed; the task must exit without
    /// further updates.
    pub cancel: oneshot::Receiver<()>,
}

/// A rendezvous engine that runs key-exchange tasks.
pub trait KeyExchangeEngine: Send + Sync + 'static {
    /// Spawns one exchange task. Must not block.
    fn spawn(&self, task: KxTask);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spool::SpoolReadDescriptor;

    #[test]
    fn test_contact_exchange_roundtrip() {
        let descriptor = SpoolReadDescriptor::generate("svc", "provider").write_descriptor();
        let exchange = ContactExchange {
            signed_kx: vec![1, 2, 3],
            spool_write_descriptor: descriptor.clone(),
        };

        let decoded = ContactExchange::from_bytes(&exchange.to_bytes()).unwrap();
        assert_eq!(decoded.signed_kx, vec![1, 2, 3]);
        assert_eq!(decoded.spool_write_descriptor, descriptor);
    }

    #[test]
    fn test_contact_exchange_rejects_garbage() {
        assert!(ContactExchange::from_bytes(b"not bincode").is_err());
    }
}
