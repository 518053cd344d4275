// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Scripted Key Exchange
//!
//! Test engine replaying a fixed update sequence per spawned task, then
//! idling until cancelled. Records the resume state of every spawn so
//! restart behavior can be asserted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::{KeyExchangeEngine, KxEvent, KxTask, KxUpdate};

/// A key-exchange engine driven by pre-arranged scripts.
///
/// Each [`spawn`](KeyExchangeEngine::spawn) pops the next script and plays
/// it in order. Tasks whose script runs out stay alive until their cancel
/// handle fires, mirroring a rendezvous still in flight.
#[derive(Clone, Default)]
pub struct ScriptedKeyExchange {
    scripts: Arc<Mutex<VecDeque<Vec<KxUpdate>>>>,
    spawn_log: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
}

impl ScriptedKeyExchange {
    /// Creates an engine with no scripts queued.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues the update script for the next spawned task.
    pub fn push_script(&self, updates: Vec<KxUpdate>) {
        self.scripts
            .lock()
            .expect("script lock poisoned")
            .push_back(updates);
    }

    /// Resume states observed at each spawn, in order.
    pub fn spawn_log(&self) -> Vec<Option<Vec<u8>>> {
        self.spawn_log.lock().expect("spawn log lock poisoned").clone()
    }
}

impl KeyExchangeEngine for ScriptedKeyExchange {
    fn spawn(&self, task: KxTask) {
        self.spawn_log
            .lock()
            .expect("spawn log lock poisoned")
            .push(task.resume_state.clone());

        let script = self
            .scripts
            .lock()
            .expect("script lock poisoned")
            .pop_front()
            .unwrap_or_default();

        tokio::spawn(async move {
            for update in script {
                let event = KxEvent {
                    contact_id: task.contact_id,
                    update,
                };
                if task.updates.send(event).await.is_err() {
                    return;
                }
            }
            // script exhausted: stay pending until cancelled
            let _ = task.cancel.await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn test_script_plays_in_order() {
        let engine = ScriptedKeyExchange::new();
        engine.push_script(vec![
            KxUpdate::Progress {
                state: b"s1".to_vec(),
            },
            KxUpdate::Timeout,
        ]);

        let (updates, mut rx) = mpsc::channel(8);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        engine.spawn(KxTask {
            contact_id: 9,
            shared_secret: b"secret".to_vec(),
            resume_state: None,
            exchange_payload: Vec::new(),
            updates,
            cancel: cancel_rx,
        });

        assert!(matches!(
            rx.recv().await.unwrap().update,
            KxUpdate::Progress { .. }
        ));
        assert!(matches!(rx.recv().await.unwrap().update, KxUpdate::Timeout));
        assert_eq!(engine.spawn_log(), vec![None]);
    }
}
