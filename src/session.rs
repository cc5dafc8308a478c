//! The Double Ratchet session: header-encrypted, out-of-order tolerant,
//! restart-safe. Generalizes `crypto::ratchet::RatchetSession` from the
//! teacher onto the header-encryption design, with field names and control
//! flow checked against a real Rust port of the system this crate reimplements.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use ed25519_dalek::Signer as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::config::MAX_SKIP;
use crate::crypto::{
    self, aead_decrypt, aead_encrypt, derive_turn_signing_key, kdf_chain, kdf_header_key, kdf_root,
};
use crate::error::{Error, Result};
use crate::event::{Event, Rumor, MESSAGE_EVENT_KIND};

/// Opaque handle a [`crate::manager::SessionManager`] uses to address a
/// session without either side holding a pointer to the other — see the
/// cyclic-reference note in `SPEC_FULL.md` §9.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone, Serialize, Deserialize, Zeroize)]
#[zeroize(drop)]
pub struct RatchetKeyPair {
    pub public_key: [u8; 32],
    pub secret_key: [u8; 32],
}

impl RatchetKeyPair {
    fn generate() -> Self {
        let (secret_key, public_key) = crypto::x25519_generate();
        Self { public_key, secret_key }
    }

    fn from_secret(secret_key: [u8; 32]) -> Self {
        let public_key = crypto::x25519_public_from_secret(&secret_key);
        Self { public_key, secret_key }
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SkippedKeysEntry {
    pub header_keys: Vec<[u8; 32]>,
    pub message_keys: HashMap<u32, [u8; 32]>,
}

/// Header metadata, AEAD-encrypted under a DH-derived header key rather than
/// sent in the clear. See `SPEC_FULL.md` §4.1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Header {
    pub number: u32,
    pub next_public_key: String,
    pub previous_chain_length: u32,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub root_key: [u8; 32],
    pub their_current_dh_public: Option<[u8; 32]>,
    pub their_next_dh_public: Option<[u8; 32]>,
    pub our_current_dh: Option<RatchetKeyPair>,
    pub our_next_dh: RatchetKeyPair,
    pub receiving_chain_key: Option<[u8; 32]>,
    pub sending_chain_key: Option<[u8; 32]>,
    pub sending_chain_message_number: u32,
    pub receiving_chain_message_number: u32,
    pub previous_sending_chain_message_count: u32,
    pub skipped_keys: HashMap<String, SkippedKeysEntry>,
}

impl Drop for SessionState {
    fn drop(&mut self) {
        self.root_key.zeroize();
        if let Some(k) = self.sending_chain_key.as_mut() {
            k.zeroize();
        }
        if let Some(k) = self.receiving_chain_key.as_mut() {
            k.zeroize();
        }
        for entry in self.skipped_keys.values_mut() {
            for k in entry.header_keys.iter_mut() {
                k.zeroize();
            }
            for k in entry.message_keys.values_mut() {
                k.zeroize();
            }
        }
    }
}

/// One peer-device pair's ratchet. Owns no reference back to whatever
/// manages it — a `SessionManager` addresses sessions by [`SessionId`]
/// instead, so the object graph never cycles.
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
}

impl Session {
    /// `their_next_dh_public` is the peer's ephemeral/ratchet public key
    /// observed during the handshake; `our_ephemeral_secret` is ours.
    pub fn init(
        their_next_dh_public: [u8; 32],
        our_ephemeral_secret: [u8; 32],
        is_initiator: bool,
        shared_secret: [u8; 32],
    ) -> Self {
        let our_ephemeral = RatchetKeyPair::from_secret(our_ephemeral_secret);

        let (root_key, sending_chain_key, our_current_dh, our_next_dh) = if is_initiator {
            let our_next = RatchetKeyPair::generate();
            let dh = crypto::x25519_dh(&our_next.secret_key, &their_next_dh_public);
            let (root_key, sending_chain_key) = kdf_root(&shared_secret, &dh);
            (root_key, Some(sending_chain_key), Some(our_ephemeral), our_next)
        } else {
            (shared_secret, None, None, our_ephemeral)
        };

        Self {
            id: SessionId::next(),
            state: SessionState {
                root_key,
                their_current_dh_public: None,
                their_next_dh_public: Some(their_next_dh_public),
                our_current_dh,
                our_next_dh,
                receiving_chain_key: None,
                sending_chain_key,
                sending_chain_message_number: 0,
                receiving_chain_message_number: 0,
                previous_sending_chain_message_count: 0,
                skipped_keys: HashMap::new(),
            },
        }
    }

    pub fn from_state(state: SessionState) -> Self {
        Self { id: SessionId::next(), state }
    }

    pub fn can_send(&self) -> bool {
        self.state.their_next_dh_public.is_some() && self.state.our_current_dh.is_some()
    }

    /// Hex-encoded pubkeys this session should be subscribed to receive
    /// from: its current/next expected sender plus any sender it still has
    /// skipped keys outstanding for. Owned by the caller (`SessionManager`)
    /// to keep this struct free of any relay coupling.
    pub fn expected_senders(&self) -> Vec<String> {
        let mut senders = Vec::new();
        if let Some(pk) = self.state.their_current_dh_public {
            senders.push(hex::encode(pk));
        }
        if let Some(pk) = self.state.their_next_dh_public {
            senders.push(hex::encode(pk));
        }
        for sender in self.state.skipped_keys.keys() {
            if !senders.contains(sender) {
                senders.push(sender.clone());
            }
        }
        senders
    }

    /// Encrypt `rumor` and produce a fully signed outer [`Event`]. The outer
    /// event's `pubkey` is this turn's ratchet public key (needed by the
    /// receiver to pick a header key); its `sig` comes from a one-time
    /// Ed25519 key derived from that same ratchet secret (see
    /// `crypto::derive_turn_signing_key`).
    pub fn encrypt(&mut self, rumor: &Rumor) -> Result<Event> {
        if !self.can_send() {
            return Err(Error::NotInitiator);
        }

        let plaintext = serde_json::to_vec(rumor)?;
        let (header, body_ciphertext) = self.ratchet_encrypt(&plaintext)?;

        let our_current = self.state.our_current_dh.clone().expect("checked by can_send");
        let their_next = self.state.their_next_dh_public.expect("checked by can_send");

        let header_key = kdf_header_key(&crypto::x25519_dh(&our_current.secret_key, &their_next));
        let header_ciphertext = aead_encrypt(&header_key, &serde_json::to_vec(&header)?);

        let tags = vec![vec!["header".to_string(), hex::encode(header_ciphertext)]];
        let pubkey = hex::encode(our_current.public_key);
        let content = hex::encode(body_ciphertext);
        let created_at = rumor.created_at;
        let id = crate::event::event_hash(&pubkey, created_at, MESSAGE_EVENT_KIND, &tags, &content);

        let signing_key = derive_turn_signing_key(&our_current.secret_key);
        let sig = hex::encode(signing_key.sign(&hex::decode(&id).expect("hash output is always valid hex")).to_bytes());

        Ok(Event { id, pubkey, created_at, kind: MESSAGE_EVENT_KIND, tags, content, sig })
    }

    fn ratchet_encrypt(&mut self, plaintext: &[u8]) -> Result<(Header, Vec<u8>)> {
        let sending_chain_key = self.state.sending_chain_key.ok_or(Error::NotInitiator)?;
        let (next_chain_key, message_key) = kdf_chain(&sending_chain_key);
        self.state.sending_chain_key = Some(next_chain_key);

        let header = Header {
            number: self.state.sending_chain_message_number,
            next_public_key: hex::encode(self.state.our_next_dh.public_key),
            previous_chain_length: self.state.previous_sending_chain_message_count,
        };
        self.state.sending_chain_message_number += 1;

        Ok((header, aead_encrypt(&message_key, plaintext)))
    }

    /// Decrypt an inbound outer event. On any failure the session state is
    /// rolled back to exactly what it was before this call, so a replayed
    /// or malformed event can never leave the ratchet half-advanced.
    pub fn receive(&mut self, event: &Event) -> Result<Option<Rumor>> {
        let snapshot = self.state.clone();
        let result = self.receive_inner(event);
        if result.is_err() {
            self.state = snapshot;
        }
        result
    }

    fn receive_inner(&mut self, event: &Event) -> Result<Option<Rumor>> {
        let header_ct_hex = event.tag_value("header").ok_or(Error::IntegrityFailed("missing header tag".into()))?;
        let header_ct = hex::decode(header_ct_hex).map_err(|_| Error::IntegrityFailed("header tag not hex".into()))?;
        let sender_public = crypto::public_key_from_hex(&event.pubkey)?;
        let sender_bytes: [u8; 32] = *sender_public.as_bytes();
        let sender_hex = event.pubkey.clone();

        let (header, should_ratchet) = self.decrypt_header(&header_ct, &sender_bytes, &sender_hex)?;

        let their_next_hex = self.state.their_next_dh_public.map(hex::encode).unwrap_or_default();
        if header.next_public_key != their_next_hex {
            self.state.their_current_dh_public = self.state.their_next_dh_public;
            let bytes = hex::decode(&header.next_public_key).map_err(|_| Error::IntegrityFailed("next_public_key not hex".into()))?;
            let array: [u8; 32] = bytes.try_into().map_err(|_| Error::IntegrityFailed("next_public_key wrong length".into()))?;
            self.state.their_next_dh_public = Some(array);
        }

        if should_ratchet {
            if self.state.receiving_chain_key.is_some() {
                self.skip_message_keys(header.previous_chain_length, &sender_hex)?;
            }
            self.ratchet_step()?;
        }

        let plaintext = self.ratchet_decrypt(&header, &event.content, &sender_hex)?;

        let mut rumor: Rumor = serde_json::from_slice(&plaintext).map_err(|e| Error::IntegrityFailed(e.to_string()))?;
        rumor.recompute_id();
        Ok(Some(rumor))
    }

    fn decrypt_header(&self, header_ct: &[u8], sender: &[u8; 32], sender_hex: &str) -> Result<(Header, bool)> {
        if let Some(current) = &self.state.our_current_dh {
            let key = kdf_header_key(&crypto::x25519_dh(&current.secret_key, sender));
            if let Ok(plaintext) = aead_decrypt(&key, header_ct) {
                return Ok((serde_json::from_slice(&plaintext).map_err(|e| Error::IntegrityFailed(e.to_string()))?, false));
            }
        }

        let next_key = kdf_header_key(&crypto::x25519_dh(&self.state.our_next_dh.secret_key, sender));
        if let Ok(plaintext) = aead_decrypt(&next_key, header_ct) {
            return Ok((serde_json::from_slice(&plaintext).map_err(|e| Error::IntegrityFailed(e.to_string()))?, true));
        }

        if let Some(entry) = self.state.skipped_keys.get(sender_hex) {
            for key in &entry.header_keys {
                if let Ok(plaintext) = aead_decrypt(key, header_ct) {
                    return Ok((serde_json::from_slice(&plaintext).map_err(|e| Error::IntegrityFailed(e.to_string()))?, false));
                }
            }
        }

        Err(Error::HeaderDecryptionFailed)
    }

    fn ratchet_step(&mut self) -> Result<()> {
        self.state.previous_sending_chain_message_count = self.state.sending_chain_message_number;
        self.state.sending_chain_message_number = 0;
        self.state.receiving_chain_message_number = 0;

        let their_next = self.state.their_next_dh_public.ok_or(Error::NotInitiator)?;

        let dh1 = crypto::x25519_dh(&self.state.our_next_dh.secret_key, &their_next);
        let (temp_root, receiving_chain_key) = kdf_root(&self.state.root_key, &dh1);
        self.state.receiving_chain_key = Some(receiving_chain_key);

        self.state.our_current_dh = Some(self.state.our_next_dh.clone());
        self.state.our_next_dh = RatchetKeyPair::generate();

        let dh2 = crypto::x25519_dh(&self.state.our_next_dh.secret_key, &their_next);
        let (root_key, sending_chain_key) = kdf_root(&temp_root, &dh2);
        self.state.root_key = root_key;
        self.state.sending_chain_key = Some(sending_chain_key);

        Ok(())
    }

    fn skip_message_keys(&mut self, until: u32, sender_hex: &str) -> Result<()> {
        if until <= self.state.receiving_chain_message_number {
            return Ok(());
        }
        if (until - self.state.receiving_chain_message_number) > MAX_SKIP {
            return Err(Error::TooManySkipped { max: MAX_SKIP });
        }

        let is_new_sender = !self.state.skipped_keys.contains_key(sender_hex);
        let entry = self.state.skipped_keys.entry(sender_hex.to_string()).or_default();

        if is_new_sender {
            if let Some(current) = &self.state.our_current_dh {
                let sender_bytes = crypto::public_key_from_hex(sender_hex)?;
                entry.header_keys.push(kdf_header_key(&crypto::x25519_dh(&current.secret_key, sender_bytes.as_bytes())));
            }
            let sender_bytes = crypto::public_key_from_hex(sender_hex)?;
            entry.header_keys.push(kdf_header_key(&crypto::x25519_dh(&self.state.our_next_dh.secret_key, sender_bytes.as_bytes())));
        }

        while self.state.receiving_chain_message_number < until {
            let receiving_chain_key = self.state.receiving_chain_key.ok_or(Error::NotInitiator)?;
            let (next_chain_key, message_key) = kdf_chain(&receiving_chain_key);
            self.state.receiving_chain_key = Some(next_chain_key);
            entry.message_keys.insert(self.state.receiving_chain_message_number, message_key);
            self.state.receiving_chain_message_number += 1;
        }

        prune_skipped_message_keys(&mut entry.message_keys);
        Ok(())
    }

    fn try_skipped_message_key(&mut self, number: u32, sender_hex: &str) -> Option<[u8; 32]> {
        let entry = self.state.skipped_keys.get_mut(sender_hex)?;
        let key = entry.message_keys.remove(&number)?;
        if entry.message_keys.is_empty() {
            self.state.skipped_keys.remove(sender_hex);
        }
        Some(key)
    }

    fn ratchet_decrypt(&mut self, header: &Header, content_hex: &str, sender_hex: &str) -> Result<Vec<u8>> {
        let ciphertext = hex::decode(content_hex).map_err(|_| Error::BodyDecryptionFailed)?;

        if let Some(message_key) = self.try_skipped_message_key(header.number, sender_hex) {
            return aead_decrypt(&message_key, &ciphertext);
        }

        if self.state.receiving_chain_key.is_none() {
            return Err(Error::NotInitiator);
        }

        self.skip_message_keys(header.number, sender_hex)?;

        let receiving_chain_key = self.state.receiving_chain_key.ok_or(Error::NotInitiator)?;
        let (next_chain_key, message_key) = kdf_chain(&receiving_chain_key);
        self.state.receiving_chain_key = Some(next_chain_key);
        self.state.receiving_chain_message_number += 1;

        aead_decrypt(&message_key, &ciphertext)
    }
}

fn prune_skipped_message_keys(map: &mut HashMap<u32, [u8; 32]>) {
    let max = MAX_SKIP as usize;
    if map.len() <= max {
        return;
    }
    let mut keys: Vec<u32> = map.keys().copied().collect();
    keys.sort_unstable();
    for k in keys.into_iter().take(map.len() - max) {
        map.remove(&k);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Rumor;

    fn handshake() -> (Session, Session) {
        let (alice_ephemeral_secret, alice_ephemeral_public) = crypto::x25519_generate();
        let (bob_ephemeral_secret, bob_ephemeral_public) = crypto::x25519_generate();
        let shared_secret = [42u8; 32];

        // Bob accepts Alice's invite: Bob is initiator (can send first).
        let bob = Session::init(alice_ephemeral_public, bob_ephemeral_secret, true, shared_secret);
        let alice = Session::init(bob_ephemeral_public, alice_ephemeral_secret, false, shared_secret);
        (alice, bob)
    }

    fn rumor(pubkey: &str, text: &str) -> Rumor {
        Rumor::new(pubkey, 1_700_000_000, 1, vec![], text)
    }

    #[test]
    fn test_basic_back_and_forth() {
        let (mut alice, mut bob) = handshake();

        let outer = bob.encrypt(&rumor("bob", "hello from bob")).unwrap();
        let received = alice.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "hello from bob");

        let outer = alice.encrypt(&rumor("alice", "hello from alice")).unwrap();
        let received = bob.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "hello from alice");

        let outer = bob.encrypt(&rumor("bob", "how are you")).unwrap();
        let received = alice.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "how are you");
    }

    #[test]
    fn test_out_of_order_delivery() {
        let (mut alice, mut bob) = handshake();
        // Prime the channel so Alice can send (requires having received once).
        let primer = bob.encrypt(&rumor("bob", "hi")).unwrap();
        alice.receive(&primer).unwrap();

        let m1 = alice.encrypt(&rumor("alice", "m1")).unwrap();
        let m2 = alice.encrypt(&rumor("alice", "m2")).unwrap();
        let m3 = alice.encrypt(&rumor("alice", "m3")).unwrap();

        assert_eq!(bob.receive(&m1).unwrap().unwrap().content, "m1");
        assert_eq!(bob.receive(&m3).unwrap().unwrap().content, "m3");
        assert_eq!(bob.receive(&m2).unwrap().unwrap().content, "m2");

        assert_eq!(bob.state.receiving_chain_message_number, 3);
        assert!(bob.state.skipped_keys.is_empty());
    }

    #[test]
    fn test_replay_is_rejected_without_corrupting_state() {
        let (mut alice, mut bob) = handshake();
        let outer = bob.encrypt(&rumor("bob", "once")).unwrap();

        let before = serde_json::to_string(&alice.state.sending_chain_key).unwrap();
        assert!(alice.receive(&outer).unwrap().is_some());
        assert!(alice.receive(&outer).is_err());
        let after = serde_json::to_string(&alice.state.sending_chain_key).unwrap();
        assert_eq!(before, after, "failed receive must not mutate state");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let (mut alice, mut bob) = handshake();
        let outer = bob.encrypt(&rumor("bob", "hi")).unwrap();
        alice.receive(&outer).unwrap();

        let serialized = serde_json::to_string(&alice.state).unwrap();
        let restored: SessionState = serde_json::from_str(&serialized).unwrap();
        let mut alice2 = Session::from_state(restored);

        let outer = bob.encrypt(&rumor("bob", "after restart")).unwrap();
        let received = alice2.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "after restart");
    }

    #[test]
    fn test_skip_message_keys_prunes_to_max_skip() {
        let (_, mut bob) = handshake();
        bob.state.receiving_chain_key = Some([7u8; 32]);
        let sender = "a".repeat(64);

        bob.skip_message_keys(MAX_SKIP, &sender).unwrap();
        bob.skip_message_keys(MAX_SKIP * 2, &sender).unwrap();

        let entry = bob.state.skipped_keys.get(&sender).unwrap();
        assert!(entry.message_keys.len() as u32 <= MAX_SKIP);
        assert!(!entry.message_keys.contains_key(&0));
        assert!(entry.message_keys.contains_key(&(MAX_SKIP * 2 - 1)));
    }

    #[test]
    fn test_tampered_rumor_id_is_recomputed_not_rejected() {
        let (mut alice, mut bob) = handshake();

        let mut bad_rumor = rumor("bob", "tampered");
        bad_rumor.id = "not-the-real-hash".to_string();
        let outer = bob.encrypt(&bad_rumor).unwrap();

        let received = alice.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "tampered");
        assert_eq!(received.id, crate::event::event_hash(&received.pubkey, received.created_at, received.kind, &received.tags, &received.content));
    }
}
