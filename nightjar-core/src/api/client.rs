// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Client Handle
//!
//! Public entry point. A `Client` owns the command loop and its helper
//! tasks; every mutating call is an operation enqueued into the loop,
//! while conversation snapshots and event subscriptions read shared
//! structures directly.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::contact::{Contact, ContactStore, ContactSummary};
use crate::conversation::{ConversationMap, ConversationStore, MessageId};
use crate::crypto::ratchet::DoubleRatchet;
use crate::kx::KeyExchangeEngine;
use crate::spool::{self, SpoolReadDescriptor, SPOOL_SERVICE_NAME};
use crate::state::{PersistedState, Persister, User};
use crate::transport::MixSession;

use super::error::{ClientError, ClientResult};
use super::events::{ClientEvent, EventBus};
use super::ops::{Op, OP_QUEUE_DEPTH};
use super::tracker::SendTracker;
use super::worker::CommandLoop;

/// Everything assembled at construction and consumed by [`Client::start`].
struct Prepared {
    command_loop: CommandLoop,
    ops_rx: mpsc::Receiver<Op>,
    events_rx: mpsc::UnboundedReceiver<ClientEvent>,
    kx_rx: mpsc::Receiver<crate::kx::KxEvent>,
}

struct Runtime {
    prepared: Option<Prepared>,
    worker: Option<JoinHandle<()>>,
}

/// An asynchronous mix-network messaging client.
///
/// # Example
///
/// ```ignore
/// use nightjar_core::{Client, MemoryMixnet, MemoryPersister, MemoryRendezvous, User};
///
/// let mixnet = MemoryMixnet::new();
/// let session = std::sync::Arc::new(mixnet.session("provider1"));
/// let engine = std::sync::Arc::new(MemoryRendezvous::new());
///
/// let client = Client::new_with_remote_spool(
///     MemoryPersister::new(),
///     session,
///     engine,
///     User::new("alice", "provider1"),
/// )?;
/// let mut events = client.subscribe();
/// client.start()?;
///
/// client.new_contact("bob", b"correct horse battery staple").await?;
/// // wait for KeyExchangeCompleted, then:
/// let mid = client.send_message("bob", b"hi").await?;
/// ```
pub struct Client {
    ops: mpsc::Sender<Op>,
    conversations: Arc<ConversationStore>,
    events: EventBus,
    fatal_rx: watch::Receiver<Option<String>>,
    session: Arc<dyn MixSession>,
    runtime: StdMutex<Runtime>,
}

impl Client {
    /// Creates a client with a fresh identity and a newly provisioned
    /// remote read spool.
    ///
    /// The spool service is looked up in the session's provider directory;
    /// the create command is submitted best-effort (providers create
    /// spools on first use).
    pub fn new_with_remote_spool(
        persister: impl Persister,
        session: Arc<dyn MixSession>,
        engine: Arc<dyn KeyExchangeEngine>,
        user: User,
    ) -> ClientResult<Self> {
        let spool_service = session.get_service(SPOOL_SERVICE_NAME)?;
        let read_spool =
            SpoolReadDescriptor::generate(&spool_service.name, &spool_service.provider);

        let create_command = spool::create(&read_spool.read_key());
        if let Err(e) = session.send_unreliable(
            &read_spool.receiver,
            &read_spool.provider,
            create_command,
        ) {
            warn!(error = %e, "remote spool creation submission failed");
        }

        Ok(Self::assemble(
            persister,
            session,
            engine,
            user,
            read_spool,
            ContactStore::new(),
            Arc::new(ConversationStore::new()),
        ))
    }

    /// Restores a client from a persisted snapshot.
    ///
    /// Pending key exchanges resume from their saved state when the client
    /// starts.
    pub fn load(
        persister: impl Persister,
        session: Arc<dyn MixSession>,
        engine: Arc<dyn KeyExchangeEngine>,
        state: PersistedState,
    ) -> ClientResult<Self> {
        let mut contacts = ContactStore::new();
        for persisted in state.contacts {
            contacts.insert(Contact {
                id: persisted.id,
                nickname: persisted.nickname,
                is_pending: persisted.is_pending,
                ratchet: Arc::new(StdMutex::new(DoubleRatchet::deserialize(persisted.ratchet))),
                spool_write_descriptor: persisted.spool_write_descriptor,
                kx_state: persisted.kx_state,
                kx_cancel: None,
                kx_result: persisted.kx_result,
                unacked_count: persisted.unacked_count,
            })?;
        }

        let conversations = Arc::new(ConversationStore::from_map(state.conversations));

        Ok(Self::assemble(
            persister,
            session,
            engine,
            state.user,
            state.read_spool,
            contacts,
            conversations,
        ))
    }

    fn assemble(
        persister: impl Persister,
        session: Arc<dyn MixSession>,
        engine: Arc<dyn KeyExchangeEngine>,
        user: User,
        read_spool: SpoolReadDescriptor,
        contacts: ContactStore,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        let (ops_tx, ops_rx) = mpsc::channel(OP_QUEUE_DEPTH);
        let (events, events_rx) = EventBus::new();
        let (kx_tx, kx_rx) = mpsc::channel(OP_QUEUE_DEPTH);
        let (fatal_tx, fatal_rx) = watch::channel(None);

        let command_loop = CommandLoop {
            user,
            session: session.clone(),
            engine,
            persister: Box::new(persister),
            contacts,
            conversations: conversations.clone(),
            tracker: SendTracker::new(),
            read_spool,
            events: events.clone(),
            kx_updates: kx_tx,
            fatal_tx,
            halted: false,
        };

        Client {
            ops: ops_tx,
            conversations,
            events,
            fatal_rx,
            session,
            runtime: StdMutex::new(Runtime {
                prepared: Some(Prepared {
                    command_loop,
                    ops_rx,
                    events_rx,
                    kx_rx,
                }),
                worker: None,
            }),
        }
    }

    /// Starts the command loop and its helper tasks. Must be called from
    /// within a tokio runtime, exactly once.
    pub fn start(&self) -> ClientResult<()> {
        let prepared = self
            .runtime
            .lock()
            .expect("runtime lock poisoned")
            .prepared
            .take()
            .ok_or(ClientError::AlreadyStarted)?;

        let Prepared {
            command_loop,
            ops_rx,
            events_rx,
            mut kx_rx,
        } = prepared;

        self.events.spawn_drain(events_rx);

        // key-exchange updates join the single operations inbox
        let ops = self.ops.clone();
        tokio::spawn(async move {
            while let Some(event) = kx_rx.recv().await {
                if ops.send(Op::KeyExchange(event)).await.is_err() {
                    break;
                }
            }
        });

        // session notifications take the same path
        let mut session_rx = self.session.subscribe();
        let ops = self.ops.clone();
        tokio::spawn(async move {
            while let Some(event) = session_rx.recv().await {
                if ops.send(Op::Transport(event)).await.is_err() {
                    break;
                }
            }
        });

        let worker = tokio::spawn(command_loop.run(ops_rx));
        self.runtime.lock().expect("runtime lock poisoned").worker = Some(worker);

        Ok(())
    }

    /// Stops the client: cancels pending key exchanges, persists, and
    /// waits for the command loop to exit.
    pub async fn shutdown(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.ops.send(Op::Shutdown { done: done_tx }).await.is_ok() {
            let _ = done_rx.await;
        }

        let worker = self.runtime.lock().expect("runtime lock poisoned").worker.take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    /// Registers a contact and starts a key exchange with the shared
    /// secret. Completion is reported by a `KeyExchangeCompleted` event.
    pub async fn new_contact(&self, nickname: &str, shared_secret: &[u8]) -> ClientResult<()> {
        self.ops
            .send(Op::AddContact {
                nickname: nickname.to_string(),
                shared_secret: shared_secret.to_vec(),
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)
    }

    /// Removes a contact, cancelling its exchange if still pending.
    pub async fn remove_contact(&self, nickname: &str) -> ClientResult<()> {
        self.ops
            .send(Op::RemoveContact {
                nickname: nickname.to_string(),
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)
    }

    /// Snapshot of all contacts keyed by nickname.
    pub async fn get_contacts(&self) -> ClientResult<HashMap<String, ContactSummary>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ops
            .send(Op::GetContacts { reply: reply_tx })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        reply_rx.await.map_err(|_| ClientError::ShuttingDown)
    }

    /// Queues a message for a contact and returns its conversation id.
    ///
    /// The id is a handle into [`Client::get_conversation`]; submission
    /// progress is reported by `MessageSent` and `MessageDelivered`
    /// events. Messages to unknown or still-pending contacts are recorded
    /// in the conversation but never transmitted.
    pub async fn send_message(&self, nickname: &str, payload: &[u8]) -> ClientResult<MessageId> {
        let message_id = MessageId::generate();
        self.ops
            .send(Op::SendMessage {
                nickname: nickname.to_string(),
                payload: payload.to_vec(),
                message_id,
            })
            .await
            .map_err(|_| ClientError::ShuttingDown)?;
        Ok(message_id)
    }

    /// Snapshot of one conversation. Empty if the nickname has none.
    pub fn get_conversation(
        &self,
        nickname: &str,
    ) -> HashMap<MessageId, crate::conversation::Message> {
        self.conversations.conversation(nickname)
    }

    /// Snapshot of all conversations.
    pub fn get_all_conversations(&self) -> ConversationMap {
        self.conversations.all()
    }

    /// Subscribes to the event stream. Subscribe before [`Client::start`]
    /// to observe every event.
    pub fn subscribe(&self) -> mpsc::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Watch channel carrying the fatal error once the client halts.
    pub fn halted(&self) -> watch::Receiver<Option<String>> {
        self.fatal_rx.clone()
    }
}
