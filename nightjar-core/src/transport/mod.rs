// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Mix Session Interface
//!
//! The contract the client consumes from the underlying mix-network
//! session: unreliable fire-and-forget submission with asynchronous
//! sent/reply/garbage-collect notifications, plus directory lookups.
//!
//! An in-process implementation lives in [`memory`] for tests and demos.

pub mod memory;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::conversation::MessageId;

pub use memory::{MemoryMixnet, MemorySession};

/// Transport-level message identifier, assigned per submission.
///
/// Same width as conversation message ids; the two namespaces never mix.
pub type TransportId = MessageId;

/// Transport error types.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Session closed")]
    SessionClosed,
}

/// A service advertised by a provider's directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    pub name: String,
    pub provider: String,
}

/// Parameters of the rendezvous service used for key exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    /// Maximum rendezvous blob size in bytes.
    pub blob_size: usize,
    pub receiver: String,
    pub provider: String,
}

/// Asynchronous notifications from the session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The session accepted the submission onto the network.
    MessageSent { id: TransportId },
    /// A response arrived for an earlier submission.
    MessageReply { id: TransportId, payload: Vec<u8> },
    /// The session gave up waiting for a response.
    MessageGarbageCollected { id: TransportId },
}

/// The mix-network session consumed by the client.
///
/// Implementations are expected to be cheap to share; all methods take
/// `&self` and submissions are queued internally.
pub trait MixSession: Send + Sync + 'static {
    /// The provider this session is attached to.
    fn provider(&self) -> String;

    /// Looks up a service in the provider directory.
    fn get_service(&self, name: &str) -> Result<ServiceDescriptor, TransportError>;

    /// Returns the rendezvous service parameters.
    fn rendezvous_config(&self) -> Result<RendezvousConfig, TransportError>;

    /// Submits a payload with at-most-once semantics. Returns the transport
    /// id later referenced by [`TransportEvent`]s.
    fn send_unreliable(
        &self,
        receiver: &str,
        provider: &str,
        payload: Vec<u8>,
    ) -> Result<TransportId, TransportError>;

    /// Subscribes to session notifications.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;
}
