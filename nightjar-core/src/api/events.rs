// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Event System
//!
//! Events emitted to subscribers. The command loop pushes into an
//! unbounded internal channel so it never blocks on a slow consumer; a
//! drain task copies events out to bounded per-subscriber channels.

use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::conversation::MessageId;

/// Capacity of each subscriber's channel.
pub const SUBSCRIBER_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// A key exchange finished, successfully or not.
    KeyExchangeCompleted {
        /// The contact's nickname.
        nickname: String,
        /// Failure description, None on success.
        error: Option<String>,
    },

    /// The transport accepted an outbound message submission.
    MessageSent {
        /// The contact the message was sent to.
        nickname: String,
        /// The conversation message id.
        message_id: MessageId,
    },

    /// The remote spool acknowledged an outbound message.
    MessageDelivered {
        /// The contact the message was sent to.
        nickname: String,
        /// The conversation message id.
        message_id: MessageId,
    },

    /// An inbound message decrypted successfully.
    MessageReceived {
        /// The contact the message came from.
        nickname: String,
        /// Decrypted message contents.
        plaintext: Vec<u8>,
        /// Reception wall-clock time.
        timestamp: SystemTime,
    },
}

type SubscriberList = Arc<Mutex<Vec<mpsc::Sender<ClientEvent>>>>;

/// Event fan-out: unbounded inlet, bounded outlets.
#[derive(Clone)]
pub(crate) struct EventBus {
    inlet: mpsc::UnboundedSender<ClientEvent>,
    subscribers: SubscriberList,
}

impl EventBus {
    /// Creates the bus and its internal receiver. The receiver must be
    /// handed to [`EventBus::spawn_drain`] once a runtime is available.
    pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (inlet, internal_rx) = mpsc::unbounded_channel();
        (
            EventBus {
                inlet,
                subscribers: Arc::new(Mutex::new(Vec::new())),
            },
            internal_rx,
        )
    }

    /// Emits an event. Never blocks; if the drain task is gone the event
    /// is dropped.
    pub(crate) fn emit(&self, event: ClientEvent) {
        let _ = self.inlet.send(event);
    }

    /// Registers a new subscriber.
    pub(crate) fn subscribe(&self) -> mpsc::Receiver<ClientEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers
            .lock()
            .expect("subscriber list lock poisoned")
            .push(tx);
        rx
    }

    /// Spawns the drain task copying internal events to subscribers.
    pub(crate) fn spawn_drain(
        &self,
        mut internal_rx: mpsc::UnboundedReceiver<ClientEvent>,
    ) -> JoinHandle<()> {
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = internal_rx.recv().await {
                let targets: Vec<mpsc::Sender<ClientEvent>> = subscribers
                    .lock()
                    .expect("subscriber list lock poisoned")
                    .clone();

                let mut saw_closed = false;
                for target in targets {
                    if target.send(event.clone()).await.is_err() {
                        saw_closed = true;
                    }
                }
                if saw_closed {
                    subscribers
                        .lock()
                        .expect("subscriber list lock poisoned")
                        .retain(|t| !t.is_closed());
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_reach_all_subscribers() {
        let (bus, internal_rx) = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        bus.spawn_drain(internal_rx);

        bus.emit(ClientEvent::KeyExchangeCompleted {
            nickname: "peer".to_string(),
            error: None,
        });

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                ClientEvent::KeyExchangeCompleted { nickname, error } => {
                    assert_eq!(nickname, "peer");
                    assert!(error.is_none());
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_stall_the_bus() {
        let (bus, internal_rx) = EventBus::new();
        let dropped = bus.subscribe();
        let mut live = bus.subscribe();
        bus.spawn_drain(internal_rx);

        drop(dropped);

        for _ in 0..3 {
            bus.emit(ClientEvent::MessageSent {
                nickname: "peer".to_string(),
                message_id: MessageId::generate(),
            });
        }

        for _ in 0..3 {
            assert!(matches!(
                live.recv().await.unwrap(),
                ClientEvent::MessageSent { .. }
            ));
        }
    }
}
