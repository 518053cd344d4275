// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Spool Wire Codec
//!
//! Request/response blobs for the remote spool service: a server-hosted
//! append-only queue addressed by an opaque id, read by monotonically
//! increasing slot number. Read access is authenticated with an Ed25519
//! key; the spool id is derived from the read public key.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::signing::{PublicKey, Signature, SigningKeyPair};

/// Spool identifier length in bytes (truncated hash of the read key).
pub const SPOOL_ID_LEN: usize = 12;

/// Directory name of the spool service on a provider.
pub const SPOOL_SERVICE_NAME: &str = "spool";

/// Spool error types.
#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("Malformed spool blob: {0}")]
    Malformed(String),
}

/// Opaque spool identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpoolId(pub [u8; SPOOL_ID_LEN]);

impl std::fmt::Debug for SpoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SpoolId({})", hex::encode(self.0))
    }
}

impl SpoolId {
    /// Derives the spool id from the spool's read public key.
    pub fn derive(read_public: &PublicKey) -> Self {
        let digest = ring::digest::digest(&ring::digest::SHA256, read_public.as_bytes());
        let mut id = [0u8; SPOOL_ID_LEN];
        id.copy_from_slice(&digest.as_ref()[..SPOOL_ID_LEN]);
        SpoolId(id)
    }
}

/// Status of a spool operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpoolStatus {
    Ok,
    NoSuchSpool,
    NoSuchMessage,
    BadSignature,
    Malformed,
}

/// A request blob submitted to the spool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SpoolRequest {
    /// Create a spool owned by the given read key.
    Create {
        read_public: [u8; 32],
        signature: Vec<u8>,
    },
    /// Append a message to a spool.
    Append { spool_id: SpoolId, message: Vec<u8> },
    /// Read the message at a slot, proving ownership of the read key.
    Read {
        spool_id: SpoolId,
        message_id: u32,
        signature: Vec<u8>,
    },
}

impl SpoolRequest {
    /// Encodes the request for submission.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("spool request serialization cannot fail")
    }

    /// Decodes a request blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpoolError> {
        bincode::deserialize(bytes).map_err(|e| SpoolError::Malformed(e.to_string()))
    }
}

/// Signing input for an authenticated read: spool id then the BE slot.
fn read_signing_input(spool_id: &SpoolId, message_id: u32) -> Vec<u8> {
    let mut input = Vec::with_capacity(SPOOL_ID_LEN + 4);
    input.extend_from_slice(&spool_id.0);
    input.extend_from_slice(&message_id.to_be_bytes());
    input
}

/// Builds a create-spool request blob.
pub fn create(read_key: &SigningKeyPair) -> Vec<u8> {
    let public = *read_key.public_key().as_bytes();
    let signature = read_key.sign(&public);
    SpoolRequest::Create {
        read_public: public,
        signature: signature.as_bytes().to_vec(),
    }
    .to_bytes()
}

/// Builds an append request blob for a peer's spool.
pub fn append(spool_id: SpoolId, message: &[u8]) -> Vec<u8> {
    SpoolRequest::Append {
        spool_id,
        message: message.to_vec(),
    }
    .to_bytes()
}

/// Builds an authenticated read request blob for one slot.
pub fn read(spool_id: SpoolId, message_id: u32, read_key: &SigningKeyPair) -> Vec<u8> {
    let signature = read_key.sign(&read_signing_input(&spool_id, message_id));
    SpoolRequest::Read {
        spool_id,
        message_id,
        signature: signature.as_bytes().to_vec(),
    }
    .to_bytes()
}

/// Verifies the signature on a read request.
pub fn verify_read(
    read_public: &PublicKey,
    spool_id: &SpoolId,
    message_id: u32,
    signature: &[u8],
) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => read_public.verify(&read_signing_input(spool_id, message_id), &sig),
        Err(_) => false,
    }
}

/// A response blob from the spool service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpoolResponse {
    /// The slot this response refers to (0 for create/append).
    pub message_id: u32,
    /// The spool the response refers to.
    pub spool_id: SpoolId,
    /// Operation status.
    pub status: SpoolStatus,
    /// Slot contents for successful reads, empty otherwise.
    pub message: Vec<u8>,
}

impl SpoolResponse {
    /// Returns true when the operation succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == SpoolStatus::Ok
    }

    /// Encodes the response for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("spool response serialization cannot fail")
    }

    /// Decodes a response blob.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SpoolError> {
        bincode::deserialize(bytes).map_err(|e| SpoolError::Malformed(e.to_string()))
    }
}

/// Location of a peer's inbox: everything needed to append to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolWriteDescriptor {
    pub spool_id: SpoolId,
    pub receiver: String,
    pub provider: String,
}

/// Our own inbox: the write descriptor plus the read key and read cursor.
#[derive(Clone, Serialize, Deserialize)]
pub struct SpoolReadDescriptor {
    pub spool_id: SpoolId,
    pub receiver: String,
    pub provider: String,
    /// Seed of the Ed25519 read key pair.
    read_key_seed: [u8; 32],
    /// Index of the next unread slot. Never decreases.
    pub read_offset: u32,
}

impl std::fmt::Debug for SpoolReadDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpoolReadDescriptor")
            .field("spool_id", &self.spool_id)
            .field("receiver", &self.receiver)
            .field("provider", &self.provider)
            .field("read_key_seed", &"[REDACTED]")
            .field("read_offset", &self.read_offset)
            .finish()
    }
}

impl SpoolReadDescriptor {
    /// Generates a fresh descriptor homed at the given spool service.
    pub fn generate(receiver: &str, provider: &str) -> Self {
        let read_key = SigningKeyPair::generate();
        let spool_id = SpoolId::derive(read_key.public_key());
        SpoolReadDescriptor {
            spool_id,
            receiver: receiver.to_string(),
            provider: provider.to_string(),
            read_key_seed: *read_key.seed(),
            read_offset: 0,
        }
    }

    /// Returns the read key pair.
    pub fn read_key(&self) -> SigningKeyPair {
        SigningKeyPair::from_seed(self.read_key_seed)
    }

    /// Returns the write half handed to peers during key exchange.
    pub fn write_descriptor(&self) -> SpoolWriteDescriptor {
        SpoolWriteDescriptor {
            spool_id: self.spool_id,
            receiver: self.receiver.clone(),
            provider: self.provider.clone(),
        }
    }
}
