//! End-to-end scenarios run against the public `SessionManager`/`Invite` API
//! over a shared in-process relay, covering the basic-messaging,
//! multi-device fan-out, revocation, and replay-rejection properties.

use std::sync::Arc;

use double_ratchet::{
    AppKeys, DeviceEntry, Identity, InMemoryRelay, InMemoryStorage, Invite, RelayAdapter, SessionManager, SessionManagerEvent, Signer, StorageAdapter,
};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;

fn manager(relay: &Arc<dyn RelayAdapter>, identity: &Identity, device_id: &str) -> (Arc<SessionManager>, crossbeam_channel::Receiver<SessionManagerEvent>) {
    let signer = Signer::from_key(SigningKey::generate(&mut OsRng));
    let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
    let (tx, rx) = crossbeam_channel::unbounded();
    let manager = SessionManager::new(identity.public_key_hex(), identity.secret_bytes(), device_id, signer, Arc::clone(relay), storage, tx);
    (manager, rx)
}

fn drain_decrypted(rx: &crossbeam_channel::Receiver<SessionManagerEvent>) -> Vec<String> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SessionManagerEvent::DecryptedMessage { content, .. } = event {
            out.push(content);
        }
    }
    out
}

/// Directly perform the Invite handshake (invitee accepts, inviter
/// processes the response) and wire the two resulting sessions into two
/// already-running managers, bypassing relay-based invite discovery so the
/// test isolates post-handshake messaging behavior.
fn establish_session(
    alice: &Arc<SessionManager>,
    alice_identity: &Identity,
    alice_device: &str,
    bob: &Arc<SessionManager>,
    bob_identity: &Identity,
    bob_device: &str,
) {
    let invite = Invite::create_new(alice_identity.public_key_hex(), Some(alice_device.to_string()), None);
    let (bob_session, envelope) = invite.accept(&bob_identity.secret_bytes(), &bob_identity.public_key_hex(), Some(bob_device.to_string())).unwrap();
    let response = invite.process_invite_response(&envelope).unwrap().unwrap();

    alice.register_session(&bob_identity.public_key_hex(), bob_device, response.session);
    bob.register_session(&alice_identity.public_key_hex(), alice_device, bob_session);
}

#[test]
fn s1_basic_back_and_forth() {
    let _ = tracing_subscriber::fmt::try_init();
    let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
    let alice_identity = Identity::generate();
    let bob_identity = Identity::generate();

    let (alice, alice_rx) = manager(&relay, &alice_identity, "laptop");
    let (bob, bob_rx) = manager(&relay, &bob_identity, "phone");
    establish_session(&alice, &alice_identity, "laptop", &bob, &bob_identity, "phone");

    // Alice created the invite, so her session starts as the responder and
    // must receive before it can send; Bob (the invitee) speaks first.
    bob.send_text(&alice_identity.public_key_hex(), "Hello Alice!").unwrap();
    assert_eq!(drain_decrypted(&alice_rx), vec!["Hello Alice!"]);

    alice.send_text(&bob_identity.public_key_hex(), "Hi Bob!").unwrap();
    assert_eq!(drain_decrypted(&bob_rx), vec!["Hi Bob!"]);

    bob.send_text(&alice_identity.public_key_hex(), "How are you?").unwrap();
    assert_eq!(drain_decrypted(&alice_rx), vec!["How are you?"]);

    alice.send_text(&bob_identity.public_key_hex(), "I am fine").unwrap();
    alice.send_text(&bob_identity.public_key_hex(), "How about you?").unwrap();
    assert_eq!(drain_decrypted(&bob_rx), vec!["I am fine", "How about you?"]);
}

#[test]
fn s5_multi_device_fanout() {
    let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
    let alice_identity = Identity::generate();
    let bob_identity = Identity::generate();

    let (a1, _a1_rx) = manager(&relay, &alice_identity, "a1");
    let (a2, a2_rx) = manager(&relay, &alice_identity, "a2");
    let (b1, b1_rx) = manager(&relay, &bob_identity, "b1");
    let (b2, b2_rx) = manager(&relay, &bob_identity, "b2");

    establish_session(&a1, &alice_identity, "a1", &b1, &bob_identity, "b1");
    establish_session(&a1, &alice_identity, "a1", &b2, &bob_identity, "b2");
    establish_session(&a1, &alice_identity, "a1", &a2, &alice_identity, "a2");

    // a1's sessions all start as responder (a1 created every invite used
    // above); each invitee must speak once before a1 can send.
    b1.send_text(&alice_identity.public_key_hex(), "hi from b1").unwrap();
    b2.send_text(&alice_identity.public_key_hex(), "hi from b2").unwrap();
    a2.send_text(&alice_identity.public_key_hex(), "hi from a2").unwrap();
    drain_decrypted(&a2_rx);

    let events = a1.send_text(&bob_identity.public_key_hex(), "broadcast").unwrap();

    // One outer event per active peer-device session plus one for the
    // sibling self-device sync session.
    assert_eq!(events.len(), 3);
    assert_eq!(drain_decrypted(&b1_rx), vec!["broadcast"]);
    assert_eq!(drain_decrypted(&b2_rx), vec!["broadcast"]);
    assert_eq!(drain_decrypted(&a2_rx), vec!["broadcast"]);
}

#[test]
fn s6_device_revocation_drops_stale_recipient() {
    let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
    let alice_identity = Identity::generate();
    let bob_identity = Identity::generate();

    let (a1, _a1_rx) = manager(&relay, &alice_identity, "a1");
    let (a2, _a2_rx) = manager(&relay, &alice_identity, "a2");
    let (b1, b1_rx) = manager(&relay, &bob_identity, "b1");

    establish_session(&a1, &alice_identity, "a1", &b1, &bob_identity, "b1");
    establish_session(&a2, &alice_identity, "a2", &b1, &bob_identity, "b1");

    // Bob's UserRecord for Alice now has two active devices (a1, a2).
    let events = b1.send_text(&alice_identity.public_key_hex(), "before revocation").unwrap();
    assert_eq!(events.len(), 2);

    let app_keys = AppKeys::new(alice_identity.public_key_hex(), vec![DeviceEntry { device_pubkey: "a1".to_string(), rank: 0 }]);
    b1.apply_app_keys(&app_keys);

    let events = b1.send_text(&alice_identity.public_key_hex(), "after revocation").unwrap();
    assert_eq!(events.len(), 1, "a2 must be excluded from the sending set after revocation");

    drop(b1_rx);
}

#[test]
fn s7_replay_is_rejected_and_does_not_double_deliver() {
    let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
    let alice_identity = Identity::generate();
    let bob_identity = Identity::generate();

    let (alice, alice_rx) = manager(&relay, &alice_identity, "laptop");
    let (bob, _bob_rx) = manager(&relay, &bob_identity, "phone");
    establish_session(&alice, &alice_identity, "laptop", &bob, &bob_identity, "phone");

    // Alice created the invite, so her session starts as the responder and
    // must receive before it can send; Bob (the invitee) speaks first.
    let events = bob.send_text(&alice_identity.public_key_hex(), "once").unwrap();
    assert_eq!(drain_decrypted(&alice_rx), vec!["once"]);

    // Simulate a relay redelivering the same outer event.
    relay.publish(events[0].clone()).unwrap();
    assert!(drain_decrypted(&alice_rx).is_empty(), "a replayed event must not be delivered twice");
}
