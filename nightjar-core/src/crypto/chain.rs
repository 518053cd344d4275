// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chain Key Ratcheting
//!
//! Symmetric key ratcheting for the Double Ratchet. Each chain key derives
//! a message key and the next chain key.

use super::encryption::SymmetricKey;
use super::kdf::HKDF;
use super::ratchet::MAX_MISSING_MESSAGES;
use thiserror::Error;
use zeroize::Zeroize;

/// Maximum number of chain generations to prevent abuse.
const MAX_CHAIN_GENERATIONS: u32 = 2000;

/// Chain key ratcheting error types.
#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain generation limit exceeded (max {MAX_CHAIN_GENERATIONS})")]
    GenerationLimitExceeded,

    #[error("Skip limit exceeded (max {MAX_MISSING_MESSAGES} keys)")]
    SkipLimitExceeded,

    #[error("Cannot skip backwards (current: {current}, target: {target})")]
    CannotSkipBackwards { current: u32, target: u32 },
}

/// KDF info constants for domain separation.
const CHAIN_KEY_INFO: &[u8] = b"Nightjar_Chain_Key";
const MESSAGE_KEY_INFO: &[u8] = b"Nightjar_Message_Key";

/// A chain key used for symmetric ratcheting.
///
/// Chain keys are never used directly for encryption. They derive message
/// keys (for actual encryption) and the next chain key (for ratcheting
/// forward).
#[derive(Clone)]
pub struct ChainKey {
    key: [u8; 32],
    generation: u32,
}

impl std::fmt::Debug for ChainKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainKey")
            .field("key", &"[REDACTED]")
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for ChainKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

impl ChainKey {
    /// Creates a new chain key from raw bytes at generation 0.
    pub fn new(key: [u8; 32]) -> Self {
        ChainKey { key, generation: 0 }
    }

    /// Creates a chain key at a specific generation.
    pub fn with_generation(key: [u8; 32], generation: u32) -> Self {
        ChainKey { key, generation }
    }

    /// Returns the current generation number.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Advances the chain by one step, returning a message key and the next
    /// chain key.
    pub fn ratchet(&self) -> Result<(MessageKey, ChainKey), ChainError> {
        if self.generation >= MAX_CHAIN_GENERATIONS {
            return Err(ChainError::GenerationLimitExceeded);
        }

        let message_key_bytes = HKDF::derive_key(None, &self.key, MESSAGE_KEY_INFO);
        let next_chain_key_bytes = HKDF::derive_key(None, &self.key, CHAIN_KEY_INFO);

        let message_key = MessageKey {
            key: SymmetricKey::from_bytes(message_key_bytes),
            generation: self.generation,
        };

        let next_chain = ChainKey {
            key: next_chain_key_bytes,
            generation: self.generation + 1,
        };

        Ok((message_key, next_chain))
    }

    /// Skips forward to a target generation, returning all intermediate
    /// message keys.
    ///
    /// Used when receiving out-of-order messages. The skip window is capped
    /// at the ratchet's missing-message limit.
    pub fn skip_to(&self, target: u32) -> Result<(Vec<MessageKey>, ChainKey), ChainError> {
        if target < self.generation {
            return Err(ChainError::CannotSkipBackwards {
                current: self.generation,
                target,
            });
        }

        let skip_count = target - self.generation;
        if skip_count > MAX_MISSING_MESSAGES {
            return Err(ChainError::SkipLimitExceeded);
        }

        let mut keys = Vec::with_capacity(skip_count as usize);
        let mut current = self.clone();

        while current.generation < target {
            let (msg_key, next) = current.ratchet()?;
            keys.push(msg_key);
            current = next;
        }

        Ok((keys, current))
    }

    /// Returns a reference to the raw key bytes (for serialization).
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

/// A message encryption key derived from a chain key.
///
/// Message keys are single-use; dropping them after use preserves forward
/// secrecy.
pub struct MessageKey {
    key: SymmetricKey,
    generation: u32,
}

impl std::fmt::Debug for MessageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageKey")
            .field("key", &"[REDACTED]")
            .field("generation", &self.generation)
            .finish()
    }
}

impl MessageKey {
    /// Returns the generation this key was derived at.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Returns the underlying symmetric key for encryption.
    pub fn symmetric_key(&self) -> &SymmetricKey {
        &self.key
    }

    /// Creates a MessageKey from raw bytes (for deserialization).
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        MessageKey {
            key: SymmetricKey::from_bytes(bytes),
            generation: 0,
        }
    }
}
