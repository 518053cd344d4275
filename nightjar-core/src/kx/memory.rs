// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! In-Process Rendezvous
//!
//! A secret-keyed meeting board: the first party with a given secret
//! parks its payload, the second swaps payloads with it, and both tasks
//! report success. The serialized protocol state makes the exchange
//! resumable the way a real rendezvous round would be.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::{KeyExchangeEngine, KxEvent, KxTask, KxUpdate};

/// Resumable state of one rendezvous attempt.
#[derive(Serialize, Deserialize)]
struct RendezvousState {
    secret: Vec<u8>,
    payload: Vec<u8>,
}

impl RendezvousState {
    fn to_bytes(&self) -> Vec<u8> {
        bincode::serialize(self).expect("rendezvous state serialization cannot fail")
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bincode::deserialize(bytes).ok()
    }
}

struct Waiter {
    payload: Vec<u8>,
    reply: oneshot::Sender<Vec<u8>>,
}

type Board = Arc<Mutex<HashMap<Vec<u8>, Waiter>>>;

/// The in-process rendezvous engine.
#[derive(Clone, Default)]
pub struct MemoryRendezvous {
    board: Board,
}

impl MemoryRendezvous {
    /// Creates an empty meeting board.
    pub fn new() -> Self {
        Self::default()
    }
}

fn board_key(secret: &[u8]) -> Vec<u8> {
    ring::digest::digest(&ring::digest::SHA256, secret)
        .as_ref()
        .to_vec()
}

impl KeyExchangeEngine for MemoryRendezvous {
    fn spawn(&self, mut task: KxTask) {
        let board = self.board.clone();
        tokio::spawn(async move {
            let (state, resumed) = match &task.resume_state {
                Some(blob) => match RendezvousState::from_bytes(blob) {
                    Some(state) => (state, true),
                    None => {
                        let _ = task
                            .updates
                            .send(KxEvent {
                                contact_id: task.contact_id,
                                update: KxUpdate::Failure {
                                    error: "unreadable rendezvous state".to_string(),
                                },
                            })
                            .await;
                        return;
                    }
                },
                None => (
                    RendezvousState {
                        secret: task.shared_secret.clone(),
                        payload: task.exchange_payload.clone(),
                    },
                    false,
                ),
            };

            // A fresh attempt reports its state once so the client can
            // resume after a crash. Resumed attempts already persisted it.
            if !resumed {
                let sent = task
                    .updates
                    .send(KxEvent {
                        contact_id: task.contact_id,
                        update: KxUpdate::Progress {
                            state: state.to_bytes(),
                        },
                    })
                    .await;
                if sent.is_err() {
                    return;
                }
            }

            let key = board_key(&state.secret);
            enum Outcome {
                Matched(Vec<u8>),
                Waiting(oneshot::Receiver<Vec<u8>>),
            }

            let outcome = {
                let mut board = board.lock().expect("rendezvous board lock poisoned");
                if let Some(waiter) = board.remove(&key) {
                    let _ = waiter.reply.send(state.payload.clone());
                    Outcome::Matched(waiter.payload)
                } else {
                    let (tx, rx) = oneshot::channel();
                    board.insert(
                        key.clone(),
                        Waiter {
                            payload: state.payload.clone(),
                            reply: tx,
                        },
                    );
                    Outcome::Waiting(rx)
                }
            };

            let peer_payload = match outcome {
                Outcome::Matched(payload) => payload,
                Outcome::Waiting(rx) => {
                    tokio::select! {
                        _ = &mut task.cancel => {
                            board
                                .lock()
                                .expect("rendezvous board lock poisoned")
                                .remove(&key);
                            return;
                        }
                        result = rx => match result {
                            Ok(payload) => payload,
                            Err(_) => return,
                        },
                    }
                }
            };

            let _ = task
                .updates
                .send(KxEvent {
                    contact_id: task.contact_id,
                    update: KxUpdate::Success {
                        result: peer_payload,
                    },
                })
                .await;
        });
    }
}
