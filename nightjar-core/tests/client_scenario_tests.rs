// SPDX-FileCopyrightText: 2026 Nightjar Contributors
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! End-to-end client scenarios over the in-process mixnet and rendezvous.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;

use nightjar_core::crypto::frame_payload;
use nightjar_core::{
    spool, Client, ClientEvent, DoubleRatchet, MemoryMixnet, MemoryPersister, MemoryRendezvous,
    MemorySession, Message, MessageId, MixSession, PersistedState, SpoolReadDescriptor, User,
    MAX_IN_FLIGHT, MESSAGE_EXPIRATION, STATE_VERSION,
};

const SHARED_SECRET: &[u8] = b"correct horse battery staple";

struct TestClient {
    client: Client,
    session: Arc<MemorySession>,
    persister: MemoryPersister,
    events: mpsc::Receiver<ClientEvent>,
}

fn build_client(mixnet: &MemoryMixnet, engine: &MemoryRendezvous, nickname: &str) -> TestClient {
    let session = Arc::new(mixnet.session("provider1"));
    let persister = MemoryPersister::new();
    let client = Client::new_with_remote_spool(
        persister.clone(),
        session.clone(),
        Arc::new(engine.clone()),
        User::new(nickname, "provider1"),
    )
    .unwrap();
    let events = client.subscribe();
    client.start().unwrap();
    TestClient {
        client,
        session,
        persister,
        events,
    }
}

async fn next_event(events: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(3600), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event stream closed")
}

async fn await_key_exchange(events: &mut mpsc::Receiver<ClientEvent>) -> Option<String> {
    loop {
        if let ClientEvent::KeyExchangeCompleted { error, .. } = next_event(events).await {
            return error;
        }
    }
}

async fn establish_pair(
    mixnet: &MemoryMixnet,
    engine: &MemoryRendezvous,
) -> (TestClient, TestClient) {
    let mut alice = build_client(mixnet, engine, "alice");
    let mut bob = build_client(mixnet, engine, "bob");

    alice.client.new_contact("peer", SHARED_SECRET).await.unwrap();
    bob.client.new_contact("peer", SHARED_SECRET).await.unwrap();

    assert!(await_key_exchange(&mut alice.events).await.is_none());
    assert!(await_key_exchange(&mut bob.events).await.is_none());

    (alice, bob)
}

// Alice and Bob exchange a shared secret out of band, complete the key
// exchange, and a message flows end to end with sent-then-delivered
// events on the sender side.
#[tokio::test(start_paused = true)]
async fn test_happy_path_message_flow() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let (mut alice, mut bob) = establish_pair(&mixnet, &engine).await;

    let mid = alice.client.send_message("peer", b"hi").await.unwrap();

    match next_event(&mut alice.events).await {
        ClientEvent::MessageSent {
            nickname,
            message_id,
        } => {
            assert_eq!(nickname, "peer");
            assert_eq!(message_id, mid);
        }
        other => panic!("expected MessageSent first, got {:?}", other),
    }
    match next_event(&mut alice.events).await {
        ClientEvent::MessageDelivered {
            nickname,
            message_id,
        } => {
            assert_eq!(nickname, "peer");
            assert_eq!(message_id, mid);
        }
        other => panic!("expected MessageDelivered second, got {:?}", other),
    }

    match next_event(&mut bob.events).await {
        ClientEvent::MessageReceived {
            nickname,
            plaintext,
            ..
        } => {
            assert_eq!(nickname, "peer");
            assert_eq!(plaintext, b"hi");
        }
        other => panic!("expected MessageReceived, got {:?}", other),
    }

    // sender-side bookkeeping: delivered implies sent, ciphertext cleared
    let conversation = alice.client.get_conversation("peer");
    let message = &conversation[&mid];
    assert!(message.outbound);
    assert!(message.sent);
    assert!(message.delivered);
    assert!(message.ciphertext.is_empty());

    // receiver-side conversation holds the inbound plaintext
    let bob_conversation = bob.client.get_conversation("peer");
    assert_eq!(bob_conversation.len(), 1);
    assert!(bob_conversation.values().all(|m| !m.outbound && m.plaintext == b"hi"));

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

// A message to a nickname that was never added gets a conversation entry
// and a handle, but nothing is transmitted and no events fire.
#[tokio::test]
async fn test_send_to_unknown_recipient() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let mut ghost_writer = build_client(&mixnet, &engine, "alice");

    let before = ghost_writer.session.submission_count();
    let mid = ghost_writer
        .client
        .send_message("ghost", b"hi")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(ghost_writer.session.submission_count(), before);

    let conversation = ghost_writer.client.get_conversation("ghost");
    let message = &conversation[&mid];
    assert_eq!(message.plaintext, b"hi");
    assert!(message.outbound);
    assert!(!message.sent);
    assert!(!message.delivered);

    assert!(ghost_writer.events.try_recv().is_err());

    ghost_writer.client.shutdown().await;
}

// Duplicate spool replies for the same slot advance the read offset once
// and produce exactly one MessageReceived.
#[tokio::test(start_paused = true)]
async fn test_duplicate_tip_reply_is_dropped() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let (mut alice, bob) = establish_pair(&mixnet, &engine).await;

    for i in 0..6u8 {
        bob.client.send_message("peer", &[b'm', i]).await.unwrap();
    }

    // slots 0..=4 arrive normally
    let mut received = 0;
    while received < 5 {
        if matches!(
            next_event(&mut alice.events).await,
            ClientEvent::MessageReceived { .. }
        ) {
            received += 1;
        }
    }

    // hold replies so two polls for slot 5 go out before any answer
    alice.session.set_hold_replies(true);
    tokio::time::sleep(Duration::from_secs(65)).await;
    alice.session.release_held_replies();
    alice.session.set_hold_replies(false);

    loop {
        if matches!(
            next_event(&mut alice.events).await,
            ClientEvent::MessageReceived { .. }
        ) {
            break;
        }
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(
        alice.events.try_recv().is_err(),
        "slot 5 must be received exactly once"
    );

    let state = alice.persister.latest().unwrap();
    assert_eq!(state.read_spool.read_offset, 6);
    assert!(alice.client.halted().borrow().is_none());

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

// Saturating the in-flight window triggers one retransmission batch of at
// most four resubmissions, and the unacked counter tops out at the window.
#[tokio::test]
async fn test_in_flight_saturation_triggers_retransmission() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let (alice, bob) = establish_pair(&mixnet, &engine).await;

    // spool appends succeed but confirmations never come back
    alice.session.set_deliver_replies(false);

    let baseline = alice.session.submission_count();

    for i in 0..(MAX_IN_FLIGHT - 1) {
        alice.client.send_message("peer", &[i as u8]).await.unwrap();
    }
    // let the sent acks drain so the retransmission pass sees them
    tokio::time::sleep(Duration::from_millis(200)).await;

    alice.client.send_message("peer", b"last").await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let submissions = alice.session.submission_count() - baseline;
    assert_eq!(
        submissions as u32,
        MAX_IN_FLIGHT + 4,
        "16 sends plus one batch of 4 retransmissions"
    );

    let contacts = alice.client.get_contacts().await.unwrap();
    assert_eq!(contacts["peer"].unacked_count, MAX_IN_FLIGHT);
    assert!(alice.client.halted().borrow().is_none());

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

// A well-formed ratchet message at the spool tip that no established
// contact can decrypt is fatal corruption: the client halts through the
// fatal channel instead of skipping the slot.
#[tokio::test(start_paused = true)]
async fn test_undecryptable_tip_halts_the_client() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let (mut alice, bob) = establish_pair(&mixnet, &engine).await;

    assert!(alice.client.halted().borrow().is_none());

    // a ciphertext from an unrelated ratchet session lands in alice's spool
    let mut stranger = DoubleRatchet::new();
    let mut stranger_peer = DoubleRatchet::new();
    let peer_kx = stranger_peer.key_exchange().unwrap();
    stranger.process_key_exchange(&peer_kx).unwrap();
    let framed = frame_payload(b"not for alice").unwrap();
    let ciphertext = stranger.encrypt(&framed).unwrap().to_bytes();

    let alice_spool = alice.persister.latest().unwrap().read_spool.spool_id;
    let outsider = mixnet.session("provider1");
    outsider
        .send_unreliable("spool", "provider1", spool::append(alice_spool, &ciphertext))
        .unwrap();

    // the next read poll picks up the tip, fails trial decryption against
    // every established contact, and halts
    let mut halted = alice.client.halted();
    let _ = tokio::time::timeout(Duration::from_secs(3600), halted.changed())
        .await
        .expect("timed out waiting for the client to halt");
    assert!(halted.borrow().is_some());

    // no message event came out of the corrupt tip
    assert!(alice.events.try_recv().is_err());

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

// Messages older than the retention window disappear on a GC tick while
// fresh ones stay.
#[tokio::test(start_paused = true)]
async fn test_expired_messages_are_collected() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();

    let old_id = MessageId::generate();
    let fresh_id = MessageId::generate();
    let now = SystemTime::now();

    let mut conversations = HashMap::new();
    let mut thread: HashMap<MessageId, Message> = HashMap::new();
    thread.insert(
        old_id,
        Message::inbound(b"stale".to_vec(), now - 2 * MESSAGE_EXPIRATION),
    );
    thread.insert(fresh_id, Message::inbound(b"fresh".to_vec(), now));
    conversations.insert("peer".to_string(), thread);

    let state = PersistedState {
        version: STATE_VERSION,
        user: User::new("alice", "provider1"),
        contacts: Vec::new(),
        read_spool: SpoolReadDescriptor::generate("spool", "provider1"),
        conversations,
    };

    let session = Arc::new(mixnet.session("provider1"));
    let persister = MemoryPersister::new();
    let client = Client::load(
        persister.clone(),
        session,
        Arc::new(engine.clone()),
        state,
    )
    .unwrap();
    client.start().unwrap();

    // run past a GC tick
    tokio::time::sleep(Duration::from_secs(301)).await;

    let conversation = client.get_conversation("peer");
    assert!(!conversation.contains_key(&old_id));
    assert!(conversation.contains_key(&fresh_id));

    // the trimmed conversation was persisted
    let persisted = persister.latest().unwrap();
    assert_eq!(persisted.conversations["peer"].len(), 1);

    client.shutdown().await;
}

// Removing a contact drops it from the registry; removing an unknown
// nickname is silently ignored.
#[tokio::test]
async fn test_remove_contact() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let (alice, bob) = establish_pair(&mixnet, &engine).await;

    alice.client.remove_contact("peer").await.unwrap();
    alice.client.remove_contact("nobody").await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let contacts = alice.client.get_contacts().await.unwrap();
    assert!(contacts.is_empty());

    // the removal reached the snapshot
    let state = alice.persister.latest().unwrap();
    assert!(state.contacts.is_empty());

    alice.client.shutdown().await;
    bob.client.shutdown().await;
}

// Adding a nickname twice fails with an error-bearing key exchange event.
#[tokio::test]
async fn test_duplicate_nickname_rejected() {
    let mixnet = MemoryMixnet::new();
    let engine = MemoryRendezvous::new();
    let mut alice = build_client(&mixnet, &engine, "alice");

    alice.client.new_contact("peer", b"one").await.unwrap();
    alice.client.new_contact("peer", b"two").await.unwrap();

    let mut errors = Vec::new();
    // first contact emits Progress-only (no completion); the duplicate is
    // rejected with a completion error
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(Duration::from_millis(200), alice.events.recv()).await {
            Ok(Some(ClientEvent::KeyExchangeCompleted { error, .. })) => {
                errors.push(error);
                break;
            }
            Ok(Some(_)) => continue,
            _ => break,
        }
    }

    assert_eq!(errors, vec![Some("contact already exists".to_string())]);

    let contacts = alice.client.get_contacts().await.unwrap();
    assert_eq!(contacts.len(), 1);
    assert!(contacts["peer"].is_pending);

    alice.client.shutdown().await;
}
