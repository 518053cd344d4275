// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod chain;
pub mod encryption;
pub mod kdf;
pub mod ratchet;
pub mod signing;

pub use chain::{ChainError, ChainKey, MessageKey};
pub use encryption::{decrypt, encrypt, EncryptionError, SymmetricKey};
pub use kdf::HKDF;
pub use ratchet::{
    frame_payload, unframe_payload, DoubleRatchet, RatchetError, RatchetMessage,
    SerializedRatchet, MAX_MISSING_MESSAGES, PAYLOAD_LENGTH,
};
pub use signing::{PublicKey, Signature, SigningKeyPair};
