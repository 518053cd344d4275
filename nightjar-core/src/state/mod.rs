// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! State Persistence
//!
//! One crash-consistent snapshot of everything the client must not lose:
//! the identity, every contact (with its ratchet and rendezvous blobs),
//! the read spool descriptor, and the conversations. The command loop
//! rewrites the snapshot synchronously after every mutation; a write
//! failure is fatal because partial state makes forward progress unsafe.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::contact::ContactId;
use crate::conversation::ConversationMap;
use crate::crypto::ratchet::SerializedRatchet;
use crate::spool::{SpoolReadDescriptor, SpoolWriteDescriptor};

/// Snapshot format version.
pub const STATE_VERSION: u32 = 1;

/// Persistence error types.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Encoding error: {0}")]
    Encode(String),
    #[error("Decoding error: {0}")]
    Decode(String),
    #[error("Unsupported state version: {0}")]
    UnsupportedVersion(u32),
}

/// The X25519 key pair authenticating the mix session.
#[derive(Clone, Serialize, Deserialize)]
pub struct LinkKey {
    secret: [u8; 32],
}

impl std::fmt::Debug for LinkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkKey")
            .field("secret", &"[REDACTED]")
            .field("public", &hex::encode(self.public_key()))
            .finish()
    }
}

impl Drop for LinkKey {
    fn drop(&mut self) {
        self.secret.zeroize();
    }
}

impl LinkKey {
    /// Generates a fresh link key.
    pub fn generate() -> Self {
        LinkKey {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng).to_bytes(),
        }
    }

    /// Restores a link key from its secret bytes.
    pub fn from_bytes(secret: [u8; 32]) -> Self {
        LinkKey { secret }
    }

    /// Returns the public half.
    pub fn public_key(&self) -> [u8; 32] {
        DhPublicKey::from(&StaticSecret::from(self.secret)).to_bytes()
    }
}

/// The process-wide identity: who we are and where our session lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub nickname: String,
    pub provider: String,
    pub link_key: LinkKey,
}

impl User {
    /// Creates a user with a fresh link key.
    pub fn new(nickname: &str, provider: &str) -> Self {
        User {
            nickname: nickname.to_string(),
            provider: provider.to_string(),
            link_key: LinkKey::generate(),
        }
    }
}

/// Persisted form of one contact.
#[derive(Clone, Serialize, Deserialize)]
pub struct PersistedContact {
    pub id: ContactId,
    pub nickname: String,
    pub is_pending: bool,
    pub ratchet: SerializedRatchet,
    pub spool_write_descriptor: Option<SpoolWriteDescriptor>,
    pub kx_state: Option<Vec<u8>>,
    pub kx_result: Option<String>,
    pub unacked_count: u32,
}

/// The full client snapshot.
#[derive(Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub user: User,
    pub contacts: Vec<PersistedContact>,
    pub read_spool: SpoolReadDescriptor,
    pub conversations: ConversationMap,
}

impl PersistedState {
    /// Encodes the snapshot.
    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        bincode::serialize(self).map_err(|e| StateError::Encode(e.to_string()))
    }

    /// Decodes and version-checks a snapshot.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        let state: PersistedState =
            bincode::deserialize(bytes).map_err(|e| StateError::Decode(e.to_string()))?;
        if state.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(state)
    }
}

/// Destination of state snapshots.
pub trait Persister: Send + 'static {
    /// Writes one snapshot. Must leave the previous snapshot intact on
    /// failure.
    fn persist(&mut self, state: &PersistedState) -> Result<(), StateError>;
}

/// File-backed persister using write-to-temp plus atomic rename.
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Creates a persister writing to the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilePersister { path: path.into() }
    }

    /// Loads the snapshot at a path. `Ok(None)` when no file exists yet.
    pub fn load(path: impl AsRef<Path>) -> Result<Option<PersistedState>, StateError> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => Ok(Some(PersistedState::from_bytes(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StateError::Io(e)),
        }
    }
}

impl Persister for FilePersister {
    fn persist(&mut self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = state.to_bytes()?;

        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

/// In-memory persister for tests; the latest snapshot stays inspectable.
#[derive(Clone, Default)]
pub struct MemoryPersister {
    slot: Arc<Mutex<Option<Vec<u8>>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryPersister {
    /// Creates an empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the most recent snapshot, if any was written.
    pub fn latest(&self) -> Option<PersistedState> {
        let slot = self.slot.lock().expect("persister lock poisoned");
        slot.as_ref()
            .map(|bytes| PersistedState::from_bytes(bytes).expect("stored snapshot decodes"))
    }

    /// Number of snapshots written so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl Persister for MemoryPersister {
    fn persist(&mut self, state: &PersistedState) -> Result<(), StateError> {
        let bytes = state.to_bytes()?;
        *self.slot.lock().expect("persister lock poisoned") = Some(bytes);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
