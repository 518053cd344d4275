// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command Loop
//!
//! The single writer of all client state. One task multiplexes the
//! operations inbox with the read-inbox and garbage-collection timers;
//! every mutation is followed by a synchronous snapshot persist so the
//! on-disk state always reflects memory. A persistence failure, a
//! corrupted spool tip, or a counter underflow is fatal and halts the
//! loop through the fatal channel.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::contact::{Contact, ContactId, ContactStore};
use crate::conversation::{ConversationStore, Message, MessageId};
use crate::crypto::ratchet::{frame_payload, unframe_payload, RatchetMessage, MAX_MISSING_MESSAGES};
use crate::kx::{ContactExchange, KeyExchangeEngine, KxEvent, KxTask, KxUpdate};
use crate::spool::{self, SpoolReadDescriptor, SpoolResponse, SpoolWriteDescriptor};
use crate::state::{PersistedContact, PersistedState, Persister, User, STATE_VERSION};
use crate::transport::{MixSession, TransportEvent, TransportId};

use super::events::{ClientEvent, EventBus};
use super::ops::Op;
use super::tracker::{SendEntry, SendTracker};

/// Maximum outbound ciphertexts awaiting spool confirmation per contact,
/// bounded by what the peer's ratchet can skip over.
pub const MAX_IN_FLIGHT: u32 = MAX_MISSING_MESSAGES - 1;

/// Messages resubmitted per retransmission pass.
pub const RETRANSMIT_BATCH: usize = 4;

/// How often the read spool is polled for new mail.
pub(crate) const READ_INBOX_INTERVAL: Duration = Duration::from_secs(30);

/// How often expired conversation messages are collected.
pub(crate) const CONVERSATION_GC_INTERVAL: Duration = Duration::from_secs(300);

/// The command loop state. Owned by exactly one task.
pub(crate) struct CommandLoop {
    pub(crate) user: User,
    pub(crate) session: Arc<dyn MixSession>,
    pub(crate) engine: Arc<dyn KeyExchangeEngine>,
    pub(crate) persister: Box<dyn Persister>,
    pub(crate) contacts: ContactStore,
    pub(crate) conversations: Arc<ConversationStore>,
    pub(crate) tracker: SendTracker,
    pub(crate) read_spool: SpoolReadDescriptor,
    pub(crate) events: EventBus,
    /// Handed to every spawned key-exchange task.
    pub(crate) kx_updates: mpsc::Sender<KxEvent>,
    pub(crate) fatal_tx: watch::Sender<Option<String>>,
    pub(crate) halted: bool,
}

impl CommandLoop {
    /// Runs until shutdown, channel closure, or a fatal error.
    pub(crate) async fn run(mut self, mut ops: mpsc::Receiver<Op>) {
        self.resume_pending_exchanges();
        self.persist();

        let mut read_inbox = interval_at(
            Instant::now() + READ_INBOX_INTERVAL,
            READ_INBOX_INTERVAL,
        );
        read_inbox.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut gc = interval_at(
            Instant::now() + CONVERSATION_GC_INTERVAL,
            CONVERSATION_GC_INTERVAL,
        );
        gc.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !self.halted {
            tokio::select! {
                op = ops.recv() => match op {
                    Some(Op::Shutdown { done }) => {
                        self.handle_shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(op) => self.handle_op(op),
                    None => break,
                },
                _ = read_inbox.tick() => self.send_read_inbox(),
                _ = gc.tick() => self.collect_expired_messages(),
            }
        }
    }

    fn handle_op(&mut self, op: Op) {
        match op {
            Op::AddContact {
                nickname,
                shared_secret,
            } => self.add_contact(nickname, shared_secret),
            Op::RemoveContact { nickname } => self.remove_contact(&nickname),
            Op::GetContacts { reply } => {
                let _ = reply.send(self.contacts.summaries());
            }
            Op::SendMessage {
                nickname,
                payload,
                message_id,
            } => self.send_message(nickname, payload, message_id),
            Op::KeyExchange(event) => self.handle_kx_event(event),
            Op::Transport(event) => self.handle_transport_event(event),
            Op::Shutdown { .. } => unreachable!("shutdown is handled by the run loop"),
        }
    }

    // === Contact lifecycle ===

    fn add_contact(&mut self, nickname: String, shared_secret: Vec<u8>) {
        if self.contacts.contains_nickname(&nickname) {
            warn!(nickname = %nickname, "add contact failed: nickname already exists");
            self.events.emit(ClientEvent::KeyExchangeCompleted {
                nickname,
                error: Some("contact already exists".to_string()),
            });
            return;
        }

        let id = self.contacts.allocate_id();
        let contact = Contact::new_pending(id, &nickname);

        if let Err(e) = self.contacts.insert(contact) {
            // unreachable: nickname checked above, id freshly allocated
            self.fatal(format!("contact registry rejected new contact: {e}"));
            return;
        }

        self.spawn_exchange(id, shared_secret, None);
        self.persist();
    }

    fn remove_contact(&mut self, nickname: &str) {
        match self.contacts.remove_by_nickname(nickname) {
            Some(mut contact) => {
                if let Some(cancel) = contact.kx_cancel.take() {
                    let _ = cancel.send(());
                }
                info!(nickname = %nickname, "contact removed");
                self.persist();
            }
            None => debug!(nickname = %nickname, "remove contact: unknown nickname"),
        }
    }

    /// Spawns (or respawns) the key-exchange task for a pending contact.
    fn spawn_exchange(
        &mut self,
        id: ContactId,
        shared_secret: Vec<u8>,
        resume_state: Option<Vec<u8>>,
    ) {
        let (ratchet, nickname) = match self.contacts.get_by_id(id) {
            Some(contact) => (contact.ratchet.clone(), contact.nickname().to_string()),
            None => return,
        };

        // lock scope must end before any persist below re-locks it
        let kx_blob = ratchet.lock().expect("ratchet lock poisoned").key_exchange();
        let signed_kx = match kx_blob {
            Ok(blob) => blob,
            Err(e) => {
                self.kx_failure(id, nickname, format!("key exchange blob failed: {e}"));
                return;
            }
        };

        let exchange_payload = ContactExchange {
            signed_kx,
            spool_write_descriptor: self.read_spool.write_descriptor(),
        }
        .to_bytes();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.engine.spawn(KxTask {
            contact_id: id,
            shared_secret,
            resume_state,
            exchange_payload,
            updates: self.kx_updates.clone(),
            cancel: cancel_rx,
        });

        if let Some(contact) = self.contacts.get_mut_by_id(id) {
            contact.kx_cancel = Some(cancel_tx);
        }
    }

    /// Restarts exchanges for contacts that were pending when the state
    /// was loaded.
    fn resume_pending_exchanges(&mut self) {
        let pending: Vec<(ContactId, String, Option<Vec<u8>>)> = self
            .contacts
            .iter()
            .filter(|c| c.is_pending && c.kx_result.is_none() && c.kx_cancel.is_none())
            .map(|c| (c.id, c.nickname.clone(), c.kx_state.clone()))
            .collect();

        for (id, nickname, state) in pending {
            match state {
                Some(state) => {
                    debug!(nickname = %nickname, "resuming key exchange");
                    self.spawn_exchange(id, Vec::new(), Some(state));
                }
                None => {
                    self.kx_failure(
                        id,
                        nickname,
                        "cannot resume key exchange without saved state".to_string(),
                    );
                }
            }
        }
    }

    // === Key exchange updates ===

    fn handle_kx_event(&mut self, event: KxEvent) {
        let Some(contact) = self.contacts.get_by_id(event.contact_id) else {
            debug!(contact_id = event.contact_id, "key exchange update for unknown contact");
            return;
        };
        let nickname = contact.nickname().to_string();

        match event.update {
            KxUpdate::Progress { state } => self.kx_progress(event.contact_id, nickname, state),
            KxUpdate::Timeout => self.kx_timeout(event.contact_id, nickname),
            KxUpdate::Failure { error } => self.kx_failure(event.contact_id, nickname, error),
            KxUpdate::Success { result } => self.kx_success(event.contact_id, nickname, result),
        }
    }

    fn kx_progress(&mut self, id: ContactId, nickname: String, state: Vec<u8>) {
        if let Some(contact) = self.contacts.get_mut_by_id(id) {
            if contact.kx_state.as_deref() == Some(state.as_slice()) {
                // the engine reported the state it already reported; surface
                // it and leave the exchange running
                warn!(nickname = %nickname, "key exchange state echo");
                self.events.emit(ClientEvent::KeyExchangeCompleted {
                    nickname,
                    error: Some("state echo".to_string()),
                });
            } else {
                contact.kx_state = Some(state);
            }
        }
        self.persist();
    }

    fn kx_timeout(&mut self, id: ContactId, nickname: String) {
        let resume = self
            .contacts
            .get_by_id(id)
            .and_then(|c| c.kx_state.clone());

        match resume {
            Some(state) => {
                debug!(nickname = %nickname, "key exchange timed out, restarting");
                self.spawn_exchange(id, Vec::new(), Some(state));
                self.persist();
            }
            None => self.kx_failure(
                id,
                nickname,
                "key exchange timed out before any progress".to_string(),
            ),
        }
    }

    fn kx_failure(&mut self, id: ContactId, nickname: String, error: String) {
        if let Some(contact) = self.contacts.get_mut_by_id(id) {
            contact.kx_result = Some(error.clone());
            contact.kx_state = None;
            contact.kx_cancel = None;
        }
        warn!(nickname = %nickname, error = %error, "key exchange failed");
        self.events.emit(ClientEvent::KeyExchangeCompleted {
            nickname,
            error: Some(error),
        });
        self.persist();
    }

    fn kx_success(&mut self, id: ContactId, nickname: String, result: Vec<u8>) {
        let exchange = match ContactExchange::from_bytes(&result) {
            Ok(exchange) => exchange,
            Err(e) => {
                self.kx_failure(id, nickname, format!("malformed contact exchange: {e}"));
                return;
            }
        };

        let ratchet = match self.contacts.get_by_id(id) {
            Some(contact) => contact.ratchet.clone(),
            None => return,
        };

        let processed = ratchet
            .lock()
            .expect("ratchet lock poisoned")
            .process_key_exchange(&exchange.signed_kx);
        if let Err(e) = processed {
            self.kx_failure(id, nickname, format!("ratchet key exchange failed: {e}"));
            return;
        }

        if let Some(contact) = self.contacts.get_mut_by_id(id) {
            contact.spool_write_descriptor = Some(exchange.spool_write_descriptor);
            contact.is_pending = false;
            contact.kx_state = None;
            contact.kx_cancel = None;
            contact.kx_result = None;
        }

        info!(nickname = %nickname, "key exchange completed");
        self.events.emit(ClientEvent::KeyExchangeCompleted {
            nickname,
            error: None,
        });
        self.persist();
    }

    // === Send pipeline ===

    fn send_message(&mut self, nickname: String, payload: Vec<u8>, message_id: MessageId) {
        let timestamp = SystemTime::now();
        self.conversations.insert(
            &nickname,
            message_id,
            Message::outbound(payload.clone(), timestamp),
        );

        let (is_pending, unacked, ratchet, descriptor) =
            match self.contacts.get_by_nickname(&nickname) {
                Some(contact) => (
                    contact.is_pending,
                    contact.unacked_count,
                    contact.ratchet.clone(),
                    contact.spool_write_descriptor.clone(),
                ),
                None => {
                    warn!(nickname = %nickname, "dropping message for unknown contact");
                    self.persist();
                    return;
                }
            };

        if is_pending {
            warn!(nickname = %nickname, "dropping message: contact key exchange still pending");
            self.persist();
            return;
        }

        let Some(descriptor) = descriptor else {
            self.fatal(format!(
                "established contact {nickname} has no spool write descriptor"
            ));
            return;
        };

        if unacked + 1 >= MAX_IN_FLIGHT {
            // window saturated counting this message; prod the spool with
            // a retransmission and push on
            warn!(nickname = %nickname, "max in-flight messages reached, retransmitting");
            self.retransmit(&nickname, &descriptor);
        }

        let framed = match frame_payload(&payload) {
            Ok(framed) => framed,
            Err(e) => {
                warn!(nickname = %nickname, error = %e, "refusing to send message");
                self.persist();
                return;
            }
        };

        // lock scope must end before persist re-locks the ratchet
        let encrypted = ratchet.lock().expect("ratchet lock poisoned").encrypt(&framed);
        let ciphertext = match encrypted {
            Ok(message) => message.to_bytes(),
            Err(e) => {
                warn!(nickname = %nickname, error = %e, "ratchet encryption failed");
                self.persist();
                return;
            }
        };

        self.conversations.with_message(&nickname, &message_id, |m| {
            m.ciphertext = ciphertext.clone();
        });

        let command = spool::append(descriptor.spool_id, &ciphertext);
        match self
            .session
            .send_unreliable(&descriptor.receiver, &descriptor.provider, command)
        {
            Ok(transport_id) => {
                self.tracker.insert(
                    transport_id,
                    SendEntry {
                        nickname: nickname.clone(),
                        message_id,
                    },
                );
                if let Some(contact) = self.contacts.get_mut_by_nickname(&nickname) {
                    contact.unacked_count += 1;
                }
            }
            Err(e) => warn!(nickname = %nickname, error = %e, "session submission failed"),
        }

        self.persist();
    }

    /// Resubmits the oldest unconfirmed ciphertexts for one contact. Fresh
    /// transport ids, no change to the unacked counter; the spool tolerates
    /// the resulting duplicates.
    fn retransmit(&mut self, nickname: &str, descriptor: &SpoolWriteDescriptor) {
        let mut candidates = self.conversations.unconfirmed_outbound(nickname);
        candidates.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        for (message_id, _, ciphertext) in candidates.into_iter().take(RETRANSMIT_BATCH) {
            let command = spool::append(descriptor.spool_id, &ciphertext);
            match self
                .session
                .send_unreliable(&descriptor.receiver, &descriptor.provider, command)
            {
                Ok(transport_id) => {
                    debug!(nickname = %nickname, message_id = %message_id, "retransmitted");
                    self.tracker.insert(
                        transport_id,
                        SendEntry {
                            nickname: nickname.to_string(),
                            message_id,
                        },
                    );
                }
                Err(e) => warn!(nickname = %nickname, error = %e, "retransmission failed"),
            }
        }
    }

    // === Receive pipeline ===

    fn send_read_inbox(&mut self) {
        let command = spool::read(
            self.read_spool.spool_id,
            self.read_spool.read_offset,
            &self.read_spool.read_key(),
        );

        match self.session.send_unreliable(
            &self.read_spool.receiver,
            &self.read_spool.provider,
            command,
        ) {
            Ok(transport_id) => {
                // our own nickname marks this entry as a read poll; the
                // polled offset rides in the id
                self.tracker.insert(
                    transport_id,
                    SendEntry {
                        nickname: self.user.nickname.clone(),
                        message_id: MessageId::from_read_offset(self.read_spool.read_offset),
                    },
                );
            }
            Err(e) => debug!(error = %e, "read inbox submission failed"),
        }
    }

    fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::MessageSent { id } => self.handle_sent_ack(id),
            TransportEvent::MessageReply { id, payload } => self.handle_reply(id, payload),
            TransportEvent::MessageGarbageCollected { id } => {
                if self.tracker.remove(&id).is_none() {
                    debug!("garbage collection for unknown transport id");
                }
            }
        }
    }

    fn handle_sent_ack(&mut self, id: TransportId) {
        let Some(entry) = self.tracker.get(&id) else {
            debug!("sent ack for unknown transport id");
            return;
        };

        if entry.nickname == self.user.nickname {
            debug!("read inbox submission confirmed");
            return;
        }

        let nickname = entry.nickname.clone();
        let message_id = entry.message_id;

        let mut newly_sent = false;
        self.conversations.with_message(&nickname, &message_id, |m| {
            if !m.sent {
                m.sent = true;
                newly_sent = true;
            }
        });

        if newly_sent {
            self.persist();
            self.events.emit(ClientEvent::MessageSent {
                nickname,
                message_id,
            });
        }
    }

    fn handle_reply(&mut self, id: TransportId, payload: Vec<u8>) {
        let Some(entry) = self.tracker.remove(&id) else {
            debug!("reply for unknown transport id");
            return;
        };

        let response = match SpoolResponse::from_bytes(&payload) {
            Ok(response) => response,
            Err(e) => {
                debug!(error = %e, "malformed spool response");
                return;
            }
        };

        if !response.is_ok() {
            debug!(status = ?response.status, "spool error response");
            return;
        }

        if entry.nickname == self.user.nickname {
            self.handle_read_response(&response);
        } else {
            self.handle_delivery_confirmation(entry, &response);
        }
    }

    fn handle_read_response(&mut self, response: &SpoolResponse) {
        match response.message_id.cmp(&self.read_spool.read_offset) {
            Ordering::Less => {
                debug!(slot = response.message_id, "duplicate spool slot, dropping");
            }
            Ordering::Equal => {
                self.read_spool.read_offset += 1;
                self.decrypt_inbound(&response.message);
                self.persist();
            }
            Ordering::Greater => {
                self.fatal(format!(
                    "spool returned slot {} beyond the requested tip {}",
                    response.message_id, self.read_spool.read_offset
                ));
            }
        }
    }

    /// Trial decryption of a spool tip against every established contact,
    /// in ascending contact-id order.
    fn decrypt_inbound(&mut self, ciphertext: &[u8]) {
        let message = match RatchetMessage::from_bytes(ciphertext) {
            Ok(message) => message,
            Err(e) => {
                self.fatal(format!("undecodable message at spool tip: {e}"));
                return;
            }
        };

        let established: Vec<_> = self
            .contacts
            .established_sorted()
            .iter()
            .map(|c| (c.nickname().to_string(), c.ratchet.clone()))
            .collect();
        let contact_count = established.len();

        let mut last_error = None;
        for (nickname, ratchet) in established {
            let result = ratchet
                .lock()
                .expect("ratchet lock poisoned")
                .decrypt(&message);
            match result {
                Ok(framed) => {
                    let plaintext = match unframe_payload(&framed) {
                        Ok(plaintext) => plaintext,
                        Err(e) => {
                            warn!(nickname = %nickname, error = %e, "dropping misframed message");
                            return;
                        }
                    };

                    let timestamp = SystemTime::now();
                    self.conversations.insert(
                        &nickname,
                        MessageId::generate(),
                        Message::inbound(plaintext.clone(), timestamp),
                    );
                    self.events.emit(ClientEvent::MessageReceived {
                        nickname,
                        plaintext,
                        timestamp,
                    });
                    return;
                }
                Err(e) => last_error = Some(e),
            }
        }

        // the offset already advanced past this slot; an undecryptable tip
        // means the spool contents cannot be trusted
        self.fatal(format!(
            "tip ciphertext failed trial decryption against all {contact_count} established contacts: {last_error:?}"
        ));
    }

    fn handle_delivery_confirmation(&mut self, entry: SendEntry, _response: &SpoolResponse) {
        let SendEntry {
            nickname,
            message_id,
        } = entry;

        let mut newly_delivered = false;
        self.conversations.with_message(&nickname, &message_id, |m| {
            if !m.delivered {
                m.delivered = true;
                m.ciphertext = Vec::new();
                newly_delivered = true;
            }
        });

        if !newly_delivered {
            // a retransmission confirmed after the original already did
            debug!(nickname = %nickname, "duplicate delivery confirmation");
            return;
        }

        let mut underflow = false;
        match self.contacts.get_mut_by_nickname(&nickname) {
            Some(contact) => {
                if contact.unacked_count == 0 {
                    underflow = true;
                } else {
                    contact.unacked_count -= 1;
                }
            }
            None => debug!(nickname = %nickname, "delivery confirmation for removed contact"),
        }
        if underflow {
            self.fatal(format!("unacked counter underflow for {nickname}"));
            return;
        }

        self.persist();
        self.events.emit(ClientEvent::MessageDelivered {
            nickname,
            message_id,
        });
    }

    // === Housekeeping ===

    fn collect_expired_messages(&mut self) {
        let removed = self.conversations.expire(SystemTime::now());
        if removed > 0 {
            debug!(removed, "expired conversation messages collected");
            self.persist();
        }
    }

    fn handle_shutdown(&mut self) {
        for contact in self.contacts.iter_mut() {
            if let Some(cancel) = contact.kx_cancel.take() {
                let _ = cancel.send(());
            }
        }
        self.persist();
    }

    // === Persistence and failure ===

    fn snapshot(&self) -> PersistedState {
        PersistedState {
            version: STATE_VERSION,
            user: self.user.clone(),
            contacts: self
                .contacts
                .iter()
                .map(|c| PersistedContact {
                    id: c.id,
                    nickname: c.nickname.clone(),
                    is_pending: c.is_pending,
                    ratchet: c.ratchet.lock().expect("ratchet lock poisoned").serialize(),
                    spool_write_descriptor: c.spool_write_descriptor.clone(),
                    kx_state: c.kx_state.clone(),
                    kx_result: c.kx_result.clone(),
                    unacked_count: c.unacked_count,
                })
                .collect(),
            read_spool: self.read_spool.clone(),
            conversations: self.conversations.all(),
        }
    }

    fn persist(&mut self) {
        let state = self.snapshot();
        if let Err(e) = self.persister.persist(&state) {
            self.fatal(format!("state persistence failed: {e}"));
        }
    }

    fn fatal(&mut self, message: String) {
        error!(message = %message, "fatal error, halting");
        let _ = self.fatal_tx.send(Some(message));
        self.halted = true;
    }
}
