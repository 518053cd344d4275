// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Key-exchange supervision edge cases, driven by the scripted engine.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use nightjar_core::{
    Client, ClientEvent, KxUpdate, MemoryMixnet, MemoryPersister, ScriptedKeyExchange, User,
};

struct TestClient {
    client: Client,
    persister: MemoryPersister,
    events: mpsc::Receiver<ClientEvent>,
}

fn build_client(mixnet: &MemoryMixnet, engine: &ScriptedKeyExchange) -> TestClient {
    let session = Arc::new(mixnet.session("provider1"));
    let persister = MemoryPersister::new();
    let client = Client::new_with_remote_spool(
        persister.clone(),
        session,
        Arc::new(engine.clone()),
        User::new("alice", "provider1"),
    )
    .unwrap();
    let events = client.subscribe();
    client.start().unwrap();
    TestClient {
        client,
        persister,
        events,
    }
}

async fn next_completion(events: &mut mpsc::Receiver<ClientEvent>) -> Option<String> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for key exchange completion")
            .expect("event stream closed");
        if let ClientEvent::KeyExchangeCompleted { error, .. } = event {
            return error;
        }
    }
}

// An engine reporting the same serialized state twice surfaces a "state
// echo" error while the contact stays pending and the task keeps running.
#[tokio::test]
async fn test_progress_state_echo() {
    let mixnet = MemoryMixnet::new();
    let engine = ScriptedKeyExchange::new();
    engine.push_script(vec![
        KxUpdate::Progress {
            state: b"round one".to_vec(),
        },
        KxUpdate::Progress {
            state: b"round one".to_vec(),
        },
    ]);

    let mut harness = build_client(&mixnet, &engine);
    harness.client.new_contact("peer", b"secret").await.unwrap();

    assert_eq!(
        next_completion(&mut harness.events).await,
        Some("state echo".to_string())
    );

    let contacts = harness.client.get_contacts().await.unwrap();
    assert!(contacts["peer"].is_pending);
    assert!(contacts["peer"].kx_result.is_none());

    harness.client.shutdown().await;
}

// A timeout restarts the task from the last persisted state.
#[tokio::test]
async fn test_timeout_restarts_from_saved_state() {
    let mixnet = MemoryMixnet::new();
    let engine = ScriptedKeyExchange::new();
    engine.push_script(vec![
        KxUpdate::Progress {
            state: b"round one".to_vec(),
        },
        KxUpdate::Timeout,
    ]);
    // restarted task: no further updates, stays in flight
    engine.push_script(Vec::new());

    let harness = build_client(&mixnet, &engine);
    harness.client.new_contact("peer", b"secret").await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        engine.spawn_log(),
        vec![None, Some(b"round one".to_vec())],
        "restart must resume from the persisted state"
    );

    let contacts = harness.client.get_contacts().await.unwrap();
    assert!(contacts["peer"].is_pending);

    let state = harness.persister.latest().unwrap();
    assert_eq!(state.contacts[0].kx_state.as_deref(), Some(&b"round one"[..]));

    harness.client.shutdown().await;
}

// A terminal failure records the outcome, emits an errored completion,
// and leaves the contact pending for the caller to remove.
#[tokio::test]
async fn test_failure_is_terminal_but_contact_remains() {
    let mixnet = MemoryMixnet::new();
    let engine = ScriptedKeyExchange::new();
    engine.push_script(vec![KxUpdate::Failure {
        error: "rendezvous failed".to_string(),
    }]);

    let mut harness = build_client(&mixnet, &engine);
    harness.client.new_contact("peer", b"secret").await.unwrap();

    assert_eq!(
        next_completion(&mut harness.events).await,
        Some("rendezvous failed".to_string())
    );

    let contacts = harness.client.get_contacts().await.unwrap();
    assert!(contacts["peer"].is_pending);
    assert_eq!(
        contacts["peer"].kx_result.as_deref(),
        Some("rendezvous failed")
    );

    harness.client.shutdown().await;
}

// A success whose payload does not parse as a contact exchange takes the
// failure path.
#[tokio::test]
async fn test_malformed_success_payload_fails_exchange() {
    let mixnet = MemoryMixnet::new();
    let engine = ScriptedKeyExchange::new();
    engine.push_script(vec![KxUpdate::Success {
        result: b"garbage".to_vec(),
    }]);

    let mut harness = build_client(&mixnet, &engine);
    harness.client.new_contact("peer", b"secret").await.unwrap();

    let error = next_completion(&mut harness.events).await.unwrap();
    assert!(error.contains("malformed contact exchange"), "{error}");

    let contacts = harness.client.get_contacts().await.unwrap();
    assert!(contacts["peer"].is_pending);

    harness.client.shutdown().await;
}

// A pending exchange saved mid-flight resumes from its state blob after a
// restart.
#[tokio::test]
async fn test_pending_exchange_resumes_after_load() {
    let mixnet = MemoryMixnet::new();
    let engine = ScriptedKeyExchange::new();
    engine.push_script(vec![KxUpdate::Progress {
        state: b"halfway".to_vec(),
    }]);

    let harness = build_client(&mixnet, &engine);
    harness.client.new_contact("peer", b"secret").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.client.shutdown().await;

    let state = harness.persister.latest().unwrap();
    assert_eq!(state.contacts[0].kx_state.as_deref(), Some(&b"halfway"[..]));

    let restarted_engine = ScriptedKeyExchange::new();
    restarted_engine.push_script(Vec::new());

    let session = Arc::new(mixnet.session("provider1"));
    let restarted = Client::load(
        MemoryPersister::new(),
        session,
        Arc::new(restarted_engine.clone()),
        state,
    )
    .unwrap();
    restarted.start().unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        restarted_engine.spawn_log(),
        vec![Some(b"halfway".to_vec())]
    );

    let contacts = restarted.get_contacts().await.unwrap();
    assert!(contacts["peer"].is_pending);

    restarted.shutdown().await;
}
