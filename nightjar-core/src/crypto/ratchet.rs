// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Double Ratchet Protocol
//!
//! Forward-secret, break-in-recoverable messaging sessions, based on the
//! Signal protocol: an X25519 DH ratchet layered over symmetric chain
//! ratchets.
//!
//! A ratchet is born unpaired. [`DoubleRatchet::key_exchange`] produces a
//! signed blob to hand to the peer (through any authenticated rendezvous);
//! [`DoubleRatchet::process_key_exchange`] consumes the peer's blob and
//! derives the initial chains. Both sides can send immediately after
//! pairing.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use x25519_dalek::{PublicKey as DhPublicKey, StaticSecret};
use zeroize::Zeroize;

use super::chain::{ChainError, ChainKey, MessageKey};
use super::encryption::{decrypt, encrypt, EncryptionError};
use super::kdf::HKDF;
use super::signing::{PublicKey, Signature, SigningKeyPair};

/// Fixed ratchet payload size in bytes. Callers frame their plaintext into
/// exactly this many bytes before encryption so ciphertexts are uniform.
pub const PAYLOAD_LENGTH: usize = 4000;

/// Length of the big-endian length prefix inside a framed payload.
const LENGTH_PREFIX_LEN: usize = 4;

/// Maximum number of undecrypted in-flight messages the ratchet tolerates
/// before it can no longer recover message keys.
pub const MAX_MISSING_MESSAGES: u32 = 17;

/// KDF info constants for domain separation.
const ROOT_RATCHET_INFO: &[u8] = b"Nightjar_Root_Ratchet";
const INITIAL_CHAINS_INFO: &[u8] = b"Nightjar_Initial_Chains";

/// Signature context for key-exchange blobs.
const KX_SIGN_CONTEXT: &[u8] = b"Nightjar_Key_Exchange_v1";

/// Double Ratchet error types.
#[derive(Error, Debug)]
pub enum RatchetError {
    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Encryption error: {0}")]
    Encryption(#[from] EncryptionError),

    #[error("Too many skipped messages")]
    TooManySkipped,

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Payload too large: {len} bytes (max {max})")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Ratchet is not paired with a peer yet")]
    NotPaired,

    #[error("Ratchet is already paired")]
    AlreadyPaired,

    #[error("Invalid key exchange: {0}")]
    InvalidKeyExchange(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),
}

/// Frames a plaintext into a fixed [`PAYLOAD_LENGTH`] buffer.
///
/// Layout: big-endian u32 length prefix, plaintext, zero padding.
pub fn frame_payload(plaintext: &[u8]) -> Result<Vec<u8>, RatchetError> {
    let max = PAYLOAD_LENGTH - LENGTH_PREFIX_LEN;
    if plaintext.len() > max {
        return Err(RatchetError::PayloadTooLarge {
            len: plaintext.len(),
            max,
        });
    }

    let mut buf = vec![0u8; PAYLOAD_LENGTH];
    buf[..LENGTH_PREFIX_LEN].copy_from_slice(&(plaintext.len() as u32).to_be_bytes());
    buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + plaintext.len()].copy_from_slice(plaintext);
    Ok(buf)
}

/// Recovers the plaintext from a framed payload.
pub fn unframe_payload(buf: &[u8]) -> Result<Vec<u8>, RatchetError> {
    if buf.len() < LENGTH_PREFIX_LEN {
        return Err(RatchetError::InvalidMessage(
            "framed payload shorter than length prefix".into(),
        ));
    }

    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_LEN]);
    let len = u32::from_be_bytes(prefix) as usize;

    if len > buf.len() - LENGTH_PREFIX_LEN {
        return Err(RatchetError::InvalidMessage(format!(
            "length prefix {} exceeds payload size {}",
            len,
            buf.len() - LENGTH_PREFIX_LEN
        )));
    }

    Ok(buf[LENGTH_PREFIX_LEN..LENGTH_PREFIX_LEN + len].to_vec())
}

/// An X25519 key pair used for the DH ratchet.
#[derive(Clone)]
struct DhKeyPair {
    secret: StaticSecret,
}

impl DhKeyPair {
    fn generate() -> Self {
        DhKeyPair {
            secret: StaticSecret::random_from_rng(rand::rngs::OsRng),
        }
    }

    fn from_bytes(bytes: [u8; 32]) -> Self {
        DhKeyPair {
            secret: StaticSecret::from(bytes),
        }
    }

    fn public(&self) -> [u8; 32] {
        DhPublicKey::from(&self.secret).to_bytes()
    }

    fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        self.secret
            .diffie_hellman(&DhPublicKey::from(*their_public))
            .to_bytes()
    }
}

/// The signed key-exchange blob exchanged through the rendezvous.
#[derive(Serialize, Deserialize)]
struct KeyExchange {
    dh_public: [u8; 32],
    signing_public: [u8; 32],
    signature: Vec<u8>,
}

fn kx_signing_input(dh_public: &[u8; 32]) -> Vec<u8> {
    let mut input = Vec::with_capacity(KX_SIGN_CONTEXT.len() + 32);
    input.extend_from_slice(KX_SIGN_CONTEXT);
    input.extend_from_slice(dh_public);
    input
}

/// A ratcheted message ready for transmission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatchetMessage {
    /// Sender's current DH public key
    pub dh_public: [u8; 32],
    /// Which DH ratchet step this message is from
    pub dh_generation: u32,
    /// Message number within this chain
    pub message_index: u32,
    /// Previous chain length (for detecting skipped messages)
    pub previous_chain_length: u32,
    /// The encrypted payload
    pub ciphertext: Vec<u8>,
}

impl RatchetMessage {
    /// Encodes the message for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("ratchet message serialization cannot fail")
    }

    /// Decodes a message from wire bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RatchetError> {
        bincode::deserialize(bytes).map_err(|e| RatchetError::Deserialization(e.to_string()))
    }
}

/// Serializable representation of a [`DoubleRatchet`].
///
/// Contains sensitive cryptographic material; zeroized on drop.
#[derive(Clone, Serialize, Deserialize)]
pub struct SerializedRatchet {
    /// Ed25519 seed for the key-exchange signing key
    pub signing_seed: [u8; 32],
    /// Long-lived X25519 pairing secret
    pub kx_secret: [u8; 32],
    /// Whether the ratchet has completed a key exchange
    pub paired: bool,
    /// Root key for deriving new chain keys
    pub root_key: [u8; 32],
    /// Our current DH ratchet secret
    pub our_dh_secret: [u8; 32],
    /// Their current DH public key
    pub their_dh: Option<[u8; 32]>,
    /// Sending chain key and generation
    pub send_chain: Option<([u8; 32], u32)>,
    /// Receiving chain key and generation
    pub recv_chain: Option<([u8; 32], u32)>,
    /// Current DH ratchet generation
    pub dh_generation: u32,
    /// Messages sent in the current sending chain
    pub send_message_count: u32,
    /// Messages received in the current receiving chain
    pub recv_message_count: u32,
    /// Previous sending chain length
    pub previous_send_chain_length: u32,
    /// Skipped message keys: (dh_gen, msg_index) -> key bytes
    pub skipped_keys: Vec<((u32, u32), [u8; 32])>,
}

impl Drop for SerializedRatchet {
    fn drop(&mut self) {
        self.signing_seed.zeroize();
        self.kx_secret.zeroize();
        self.root_key.zeroize();
        self.our_dh_secret.zeroize();
        if let Some(ref mut key) = self.their_dh {
            key.zeroize();
        }
        if let Some((ref mut key, _)) = self.send_chain {
            key.zeroize();
        }
        if let Some((ref mut key, _)) = self.recv_chain {
            key.zeroize();
        }
        for (_, ref mut key) in self.skipped_keys.iter_mut() {
            key.zeroize();
        }
    }
}

/// The Double Ratchet state machine for one peer session.
pub struct DoubleRatchet {
    /// Signing key authenticating our key-exchange blob
    signing: SigningKeyPair,
    /// Long-lived X25519 pairing key
    kx_dh: DhKeyPair,
    /// Whether a key exchange has completed
    paired: bool,
    /// Root key for deriving new chain keys
    root_key: [u8; 32],
    /// Our current DH ratchet keypair
    our_dh: DhKeyPair,
    /// Their current DH public key (None until paired)
    their_dh: Option<[u8; 32]>,
    /// Sending chain key
    send_chain: Option<ChainKey>,
    /// Receiving chain key
    recv_chain: Option<ChainKey>,
    /// Current DH ratchet generation
    dh_generation: u32,
    /// Messages sent in the current sending chain
    send_message_count: u32,
    /// Messages received in the current receiving chain
    recv_message_count: u32,
    /// Previous sending chain length (for message headers)
    previous_send_chain_length: u32,
    /// Stored skipped message keys: (dh_gen, msg_index) -> MessageKey
    skipped_keys: HashMap<(u32, u32), MessageKey>,
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("paired", &self.paired)
            .field("dh_generation", &self.dh_generation)
            .field("send_message_count", &self.send_message_count)
            .field("recv_message_count", &self.recv_message_count)
            .field("skipped_keys_count", &self.skipped_keys.len())
            .finish()
    }
}

impl Drop for DoubleRatchet {
    fn drop(&mut self) {
        self.root_key.zeroize();
        self.skipped_keys.clear();
    }
}

impl Default for DoubleRatchet {
    fn default() -> Self {
        Self::new()
    }
}

impl DoubleRatchet {
    /// Creates a new unpaired ratchet with fresh key material.
    pub fn new() -> Self {
        let kx_dh = DhKeyPair::generate();
        let our_dh = kx_dh.clone();
        DoubleRatchet {
            signing: SigningKeyPair::generate(),
            kx_dh,
            paired: false,
            root_key: [0u8; 32],
            our_dh,
            their_dh: None,
            send_chain: None,
            recv_chain: None,
            dh_generation: 0,
            send_message_count: 0,
            recv_message_count: 0,
            previous_send_chain_length: 0,
            skipped_keys: HashMap::new(),
        }
    }

    /// Returns true once a key exchange has completed.
    pub fn is_paired(&self) -> bool {
        self.paired
    }

    /// Produces our signed key-exchange blob for the peer.
    pub fn key_exchange(&self) -> Result<Vec<u8>, RatchetError> {
        let dh_public = self.kx_dh.public();
        let signature = self.signing.sign(&kx_signing_input(&dh_public));
        let kx = KeyExchange {
            dh_public,
            signing_public: *self.signing.public_key().as_bytes(),
            signature: signature.as_bytes().to_vec(),
        };
        bincode::serialize(&kx).map_err(|e| RatchetError::Deserialization(e.to_string()))
    }

    /// Consumes the peer's signed key-exchange blob and derives the initial
    /// chains. Both sides converge without a further round trip; the chain
    /// assignment is decided by public-key order.
    pub fn process_key_exchange(&mut self, blob: &[u8]) -> Result<(), RatchetError> {
        if self.paired {
            return Err(RatchetError::AlreadyPaired);
        }

        let kx: KeyExchange = bincode::deserialize(blob)
            .map_err(|e| RatchetError::InvalidKeyExchange(e.to_string()))?;

        let signature = Signature::from_slice(&kx.signature)
            .map_err(|_| RatchetError::InvalidKeyExchange("malformed signature".into()))?;
        let signing_public = PublicKey::from_bytes(kx.signing_public);
        if !signing_public.verify(&kx_signing_input(&kx.dh_public), &signature) {
            return Err(RatchetError::InvalidKeyExchange(
                "signature verification failed".into(),
            ));
        }

        let our_public = self.kx_dh.public();
        if kx.dh_public == our_public {
            return Err(RatchetError::InvalidKeyExchange(
                "peer presented our own key".into(),
            ));
        }

        let shared = self.kx_dh.diffie_hellman(&kx.dh_public);
        self.root_key = HKDF::derive_key(None, &shared, ROOT_RATCHET_INFO);

        let (chain_a, chain_b) = HKDF::derive_key_pair(None, &shared, INITIAL_CHAINS_INFO);
        let (send_key, recv_key) = if our_public < kx.dh_public {
            (chain_a, chain_b)
        } else {
            (chain_b, chain_a)
        };

        self.send_chain = Some(ChainKey::new(send_key));
        self.recv_chain = Some(ChainKey::new(recv_key));
        self.their_dh = Some(kx.dh_public);
        self.our_dh = self.kx_dh.clone();
        self.paired = true;

        Ok(())
    }

    /// Returns our current DH public key.
    pub fn our_public_key(&self) -> [u8; 32] {
        self.our_dh.public()
    }

    /// Encrypts a payload, advancing the sending chain.
    pub fn encrypt(&mut self, payload: &[u8]) -> Result<RatchetMessage, RatchetError> {
        if !self.paired {
            return Err(RatchetError::NotPaired);
        }

        let send_chain = self
            .send_chain
            .as_ref()
            .ok_or_else(|| RatchetError::InvalidMessage("no sending chain".into()))?;

        let (message_key, next_chain) = send_chain.ratchet()?;
        self.send_chain = Some(next_chain);

        let ciphertext = encrypt(message_key.symmetric_key(), payload)?;

        let message = RatchetMessage {
            dh_public: self.our_public_key(),
            dh_generation: self.dh_generation,
            message_index: self.send_message_count,
            previous_chain_length: self.previous_send_chain_length,
            ciphertext,
        };

        self.send_message_count += 1;

        Ok(message)
    }

    /// Decrypts a received message, handling DH ratchet steps and
    /// out-of-order delivery.
    ///
    /// All ratchet state is staged and committed only after the ciphertext
    /// authenticates. A failed decrypt leaves the session untouched, which
    /// is what makes trial decryption against multiple contacts safe.
    pub fn decrypt(&mut self, message: &RatchetMessage) -> Result<Vec<u8>, RatchetError> {
        if !self.paired {
            return Err(RatchetError::NotPaired);
        }

        // Skipped-key fast path. The stored key is consumed only on
        // success.
        let skipped_slot = (message.dh_generation, message.message_index);
        if let Some(key) = self.skipped_keys.get(&skipped_slot) {
            let plaintext = decrypt(key.symmetric_key(), &message.ciphertext)?;
            self.skipped_keys.remove(&skipped_slot);
            return Ok(plaintext);
        }

        // Stage every mutation in locals.
        let mut root_key = self.root_key;
        let mut our_dh = self.our_dh.clone();
        let mut their_dh = self.their_dh;
        let mut send_chain = self.send_chain.clone();
        let mut recv_chain = self.recv_chain.clone();
        let mut dh_generation = self.dh_generation;
        let mut send_message_count = self.send_message_count;
        let mut previous_send_chain_length = self.previous_send_chain_length;
        let mut staged_skipped: Vec<((u32, u32), MessageKey)> = Vec::new();

        let their_dh_changed = their_dh.map(|k| k != message.dh_public).unwrap_or(true);

        if their_dh_changed {
            // Skip any remaining messages in the receiving chain of the
            // previous DH generation
            if recv_chain.is_some() {
                let prev_gen = dh_generation.saturating_sub(1);
                self.stage_skip(
                    &mut recv_chain,
                    message.previous_chain_length,
                    prev_gen,
                    &mut staged_skipped,
                )?;
            }

            // DH ratchet: new receiving chain from their new key, then a
            // fresh keypair and a new sending chain
            their_dh = Some(message.dh_public);

            let dh_recv = our_dh.diffie_hellman(&message.dh_public);
            let (new_root, recv_chain_key) =
                HKDF::derive_key_pair(Some(&root_key), &dh_recv, ROOT_RATCHET_INFO);
            root_key = new_root;
            recv_chain = Some(ChainKey::new(recv_chain_key));

            previous_send_chain_length = send_message_count;
            our_dh = DhKeyPair::generate();

            let dh_send = our_dh.diffie_hellman(&message.dh_public);
            let (new_root, send_chain_key) =
                HKDF::derive_key_pair(Some(&root_key), &dh_send, ROOT_RATCHET_INFO);
            root_key = new_root;
            send_chain = Some(ChainKey::new(send_chain_key));
            send_message_count = 0;

            dh_generation += 1;
        }

        // Skip messages in the current chain if needed
        self.stage_skip(
            &mut recv_chain,
            message.message_index,
            message.dh_generation,
            &mut staged_skipped,
        )?;

        let chain = recv_chain
            .as_ref()
            .ok_or_else(|| RatchetError::InvalidMessage("no receiving chain".into()))?;
        let (message_key, next_chain) = chain.ratchet()?;

        // Authenticate before committing anything.
        let plaintext = decrypt(message_key.symmetric_key(), &message.ciphertext)?;

        self.root_key = root_key;
        self.our_dh = our_dh;
        self.their_dh = their_dh;
        self.send_chain = send_chain;
        self.recv_chain = Some(next_chain);
        self.dh_generation = dh_generation;
        self.send_message_count = send_message_count;
        self.previous_send_chain_length = previous_send_chain_length;
        self.recv_message_count = message.message_index + 1;
        for (slot, key) in staged_skipped {
            self.skipped_keys.insert(slot, key);
        }

        Ok(plaintext)
    }

    /// Skips a staged receiving chain forward, collecting the intermediate
    /// message keys without touching committed state.
    fn stage_skip(
        &self,
        recv_chain: &mut Option<ChainKey>,
        until: u32,
        dh_gen: u32,
        staged: &mut Vec<((u32, u32), MessageKey)>,
    ) -> Result<(), RatchetError> {
        let Some(chain) = recv_chain.as_ref() else {
            return Ok(());
        };

        let current = chain.generation();
        if until <= current {
            return Ok(());
        }

        let skip_count = (until - current) as usize;
        if self.skipped_keys.len() + staged.len() + skip_count > MAX_MISSING_MESSAGES as usize {
            return Err(RatchetError::TooManySkipped);
        }

        let (skipped, new_chain) = chain.skip_to(until)?;
        *recv_chain = Some(new_chain);

        for (i, key) in skipped.into_iter().enumerate() {
            staged.push(((dh_gen, current + i as u32), key));
        }

        Ok(())
    }

    /// Returns the number of skipped keys currently stored.
    pub fn skipped_keys_count(&self) -> usize {
        self.skipped_keys.len()
    }

    /// Serializes the ratchet state for persistence.
    pub fn serialize(&self) -> SerializedRatchet {
        SerializedRatchet {
            signing_seed: *self.signing.seed(),
            kx_secret: self.kx_dh.secret_bytes(),
            paired: self.paired,
            root_key: self.root_key,
            our_dh_secret: self.our_dh.secret_bytes(),
            their_dh: self.their_dh,
            send_chain: self
                .send_chain
                .as_ref()
                .map(|c| (*c.as_bytes(), c.generation())),
            recv_chain: self
                .recv_chain
                .as_ref()
                .map(|c| (*c.as_bytes(), c.generation())),
            dh_generation: self.dh_generation,
            send_message_count: self.send_message_count,
            recv_message_count: self.recv_message_count,
            previous_send_chain_length: self.previous_send_chain_length,
            skipped_keys: self
                .skipped_keys
                .iter()
                .map(|(k, v)| (*k, *v.symmetric_key().as_bytes()))
                .collect(),
        }
    }

    /// Restores a ratchet from its serialized form.
    pub fn deserialize(mut s: SerializedRatchet) -> Self {
        // std::mem::take leaves zeros behind for Drop
        let signing_seed = std::mem::take(&mut s.signing_seed);
        let kx_secret = std::mem::take(&mut s.kx_secret);
        let root_key = std::mem::take(&mut s.root_key);
        let our_dh_secret = std::mem::take(&mut s.our_dh_secret);
        let their_dh = s.their_dh.take();
        let send_chain_data = s.send_chain.take();
        let recv_chain_data = s.recv_chain.take();
        let skipped_keys_data = std::mem::take(&mut s.skipped_keys);

        DoubleRatchet {
            signing: SigningKeyPair::from_seed(signing_seed),
            kx_dh: DhKeyPair::from_bytes(kx_secret),
            paired: s.paired,
            root_key,
            our_dh: DhKeyPair::from_bytes(our_dh_secret),
            their_dh,
            send_chain: send_chain_data.map(|(key, gen)| ChainKey::with_generation(key, gen)),
            recv_chain: recv_chain_data.map(|(key, gen)| ChainKey::with_generation(key, gen)),
            dh_generation: s.dh_generation,
            send_message_count: s.send_message_count,
            recv_message_count: s.recv_message_count,
            previous_send_chain_length: s.previous_send_chain_length,
            skipped_keys: skipped_keys_data
                .into_iter()
                .map(|(k, v)| (k, MessageKey::from_bytes(v)))
                .collect(),
        }
    }
}
