// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Nightjar Core Library
//!
//! Core of an asynchronous mix-network messaging client: end-to-end
//! encrypted conversations between named contacts over a high-latency,
//! loss-tolerant anonymity network, via remote message spools.
//!
//! A [`Client`] coordinates three machines per contact — a rendezvous key
//! exchange, a forward-secret double ratchet, and an at-least-once
//! send/retrieve loop — behind a single-writer command loop with
//! crash-consistent persistence.

pub mod api;
pub mod contact;
pub mod conversation;
pub mod crypto;
pub mod kx;
pub mod spool;
pub mod state;
pub mod transport;

pub use api::{
    Client, ClientError, ClientEvent, ClientResult, MAX_IN_FLIGHT, RETRANSMIT_BATCH,
    SUBSCRIBER_CHANNEL_CAPACITY,
};
pub use contact::{ContactError, ContactId, ContactSummary};
pub use conversation::{Message, MessageId, MESSAGE_EXPIRATION, MESSAGE_ID_LEN};
pub use crypto::{
    DoubleRatchet, RatchetError, RatchetMessage, MAX_MISSING_MESSAGES, PAYLOAD_LENGTH,
};
pub use kx::{
    ContactExchange, KeyExchangeEngine, KxEvent, KxTask, KxUpdate, MemoryRendezvous,
    ScriptedKeyExchange,
};
pub use spool::{
    SpoolError, SpoolId, SpoolReadDescriptor, SpoolRequest, SpoolResponse, SpoolStatus,
    SpoolWriteDescriptor,
};
pub use state::{
    FilePersister, LinkKey, MemoryPersister, PersistedContact, PersistedState, Persister,
    StateError, User, STATE_VERSION,
};
pub use transport::{
    MemoryMixnet, MemorySession, MixSession, RendezvousConfig, ServiceDescriptor, TransportError,
    TransportEvent, TransportId,
};
