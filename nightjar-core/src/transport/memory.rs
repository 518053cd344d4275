// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-Process Mixnet
//!
//! A shared in-memory "network" implementing the spool service semantics
//! behind [`MixSession`]. Sessions attached to the same [`MemoryMixnet`]
//! see each other's spools, so two clients can hold a real conversation
//! inside one process. Delivery knobs simulate the lossy transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use super::{
    MixSession, RendezvousConfig, ServiceDescriptor, TransportError, TransportEvent, TransportId,
};
use crate::crypto::signing::{PublicKey, Signature};
use crate::spool::{
    verify_read, SpoolId, SpoolRequest, SpoolResponse, SpoolStatus, SPOOL_SERVICE_NAME,
};

/// Rendezvous blob budget advertised by the in-memory provider.
const RENDEZVOUS_BLOB_SIZE: usize = 1000;

#[derive(Default)]
struct SpoolState {
    /// Read key, known once the owner issued a Create.
    read_public: Option<PublicKey>,
    messages: Vec<Vec<u8>>,
}

#[derive(Default)]
struct MixnetInner {
    spools: HashMap<SpoolId, SpoolState>,
}

impl MixnetInner {
    fn process(&mut self, request: SpoolRequest) -> SpoolResponse {
        match request {
            SpoolRequest::Create {
                read_public,
                signature,
            } => {
                let public = PublicKey::from_bytes(read_public);
                let valid = Signature::from_slice(&signature)
                    .map(|sig| public.verify(&read_public, &sig))
                    .unwrap_or(false);
                let spool_id = SpoolId::derive(&public);
                if !valid {
                    return SpoolResponse {
                        message_id: 0,
                        spool_id,
                        status: SpoolStatus::BadSignature,
                        message: Vec::new(),
                    };
                }
                self.spools.entry(spool_id).or_default().read_public = Some(public);
                SpoolResponse {
                    message_id: 0,
                    spool_id,
                    status: SpoolStatus::Ok,
                    message: Vec::new(),
                }
            }
            SpoolRequest::Append { spool_id, message } => {
                // spools are created on first use so writers never race the
                // owner's Create
                let spool = self.spools.entry(spool_id).or_default();
                spool.messages.push(message);
                SpoolResponse {
                    message_id: (spool.messages.len() - 1) as u32,
                    spool_id,
                    status: SpoolStatus::Ok,
                    message: Vec::new(),
                }
            }
            SpoolRequest::Read {
                spool_id,
                message_id,
                signature,
            } => {
                let Some(spool) = self.spools.get(&spool_id) else {
                    return SpoolResponse {
                        message_id,
                        spool_id,
                        status: SpoolStatus::NoSuchSpool,
                        message: Vec::new(),
                    };
                };
                let authorized = spool
                    .read_public
                    .map(|public| verify_read(&public, &spool_id, message_id, &signature))
                    .unwrap_or(false);
                if !authorized {
                    return SpoolResponse {
                        message_id,
                        spool_id,
                        status: SpoolStatus::BadSignature,
                        message: Vec::new(),
                    };
                }
                match spool.messages.get(message_id as usize) {
                    Some(message) => SpoolResponse {
                        message_id,
                        spool_id,
                        status: SpoolStatus::Ok,
                        message: message.clone(),
                    },
                    None => SpoolResponse {
                        message_id,
                        spool_id,
                        status: SpoolStatus::NoSuchMessage,
                        message: Vec::new(),
                    },
                }
            }
        }
    }
}

/// The shared in-process network.
#[derive(Clone, Default)]
pub struct MemoryMixnet {
    inner: Arc<Mutex<MixnetInner>>,
}

impl MemoryMixnet {
    /// Creates an empty mixnet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new session homed at the given provider.
    pub fn session(&self, provider: &str) -> MemorySession {
        MemorySession {
            mixnet: self.inner.clone(),
            provider: provider.to_string(),
            subscribers: Mutex::new(Vec::new()),
            deliver_replies: AtomicBool::new(true),
            duplicate_replies: AtomicBool::new(false),
            hold_replies: AtomicBool::new(false),
            held: Mutex::new(Vec::new()),
            submissions: AtomicUsize::new(0),
        }
    }
}

/// A session attached to a [`MemoryMixnet`].
pub struct MemorySession {
    mixnet: Arc<Mutex<MixnetInner>>,
    provider: String,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<TransportEvent>>>,
    deliver_replies: AtomicBool,
    duplicate_replies: AtomicBool,
    hold_replies: AtomicBool,
    held: Mutex<Vec<TransportEvent>>,
    submissions: AtomicUsize,
}

impl MemorySession {
    /// Suppresses reply delivery, leaving submissions unconfirmed.
    pub fn set_deliver_replies(&self, deliver: bool) {
        self.deliver_replies.store(deliver, Ordering::SeqCst);
    }

    /// Delivers every reply twice, simulating duplicate spool responses.
    pub fn set_duplicate_replies(&self, duplicate: bool) {
        self.duplicate_replies.store(duplicate, Ordering::SeqCst);
    }

    /// Buffers replies instead of delivering them, so several submissions
    /// can be in flight at once.
    pub fn set_hold_replies(&self, hold: bool) {
        self.hold_replies.store(hold, Ordering::SeqCst);
    }

    /// Delivers all buffered replies in submission order.
    pub fn release_held_replies(&self) {
        let held: Vec<TransportEvent> =
            self.held.lock().expect("held reply lock poisoned").drain(..).collect();
        for event in held {
            self.emit(event);
        }
    }

    /// Number of submissions accepted so far.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Pushes a raw event to subscribers.
    pub fn inject_event(&self, event: TransportEvent) {
        self.emit(event);
    }

    fn emit(&self, event: TransportEvent) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

impl MixSession for MemorySession {
    fn provider(&self) -> String {
        self.provider.clone()
    }

    fn get_service(&self, name: &str) -> Result<ServiceDescriptor, TransportError> {
        if name == SPOOL_SERVICE_NAME {
            Ok(ServiceDescriptor {
                name: SPOOL_SERVICE_NAME.to_string(),
                provider: self.provider.clone(),
            })
        } else {
            Err(TransportError::ServiceNotFound(name.to_string()))
        }
    }

    fn rendezvous_config(&self) -> Result<RendezvousConfig, TransportError> {
        Ok(RendezvousConfig {
            blob_size: RENDEZVOUS_BLOB_SIZE,
            receiver: "rendezvous".to_string(),
            provider: self.provider.clone(),
        })
    }

    fn send_unreliable(
        &self,
        _receiver: &str,
        _provider: &str,
        payload: Vec<u8>,
    ) -> Result<TransportId, TransportError> {
        let id = TransportId::generate();
        self.submissions.fetch_add(1, Ordering::SeqCst);

        let response = match SpoolRequest::from_bytes(&payload) {
            Ok(request) => self
                .mixnet
                .lock()
                .expect("mixnet lock poisoned")
                .process(request),
            Err(_) => SpoolResponse {
                message_id: 0,
                spool_id: SpoolId([0u8; crate::spool::SPOOL_ID_LEN]),
                status: SpoolStatus::Malformed,
                message: Vec::new(),
            },
        };

        self.emit(TransportEvent::MessageSent { id });

        if self.deliver_replies.load(Ordering::SeqCst) {
            let reply = TransportEvent::MessageReply {
                id,
                payload: response.to_bytes(),
            };
            if self.hold_replies.load(Ordering::SeqCst) {
                self.held
                    .lock()
                    .expect("held reply lock poisoned")
                    .push(reply);
            } else {
                self.emit(reply.clone());
                if self.duplicate_replies.load(Ordering::SeqCst) {
                    self.emit(reply);
                }
            }
        }

        Ok(id)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .push(tx);
        rx
    }
}
