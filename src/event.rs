//! Event/rumor shapes and the canonical id hash they share.
//!
//! A signed [`Event`] is what travels on the relay. A [`Rumor`] is the same
//! shape without a signature — the plaintext an encrypted `MESSAGE` carries.
//! Both hash the same way; see [`event_hash`].

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Reserved, parameter-replaceable advertisement of a device's current invite.
pub const INVITE_EVENT_KIND: u16 = 30078;
/// One-shot gift-wrap envelope authored by a throwaway key.
pub const INVITE_RESPONSE_EVENT_KIND: u16 = 1059;
/// Ratchet-encrypted message, header-and-body.
pub const MESSAGE_EVENT_KIND: u16 = 1060;
/// Parameter-replaceable authoritative device list used for revocation.
pub const APP_KEYS_EVENT_KIND: u16 = 30077;

pub type Tags = Vec<Vec<String>>;

/// sha256(JSON.stringify([0, pubkey, created_at, kind, tags, content])), hex-encoded.
///
/// This is the canonical event id used throughout: both for outer, signed
/// events and for the inner rumor a receiver always recomputes locally rather
/// than trusting (see [`Rumor::recompute_id`]).
pub fn event_hash(pubkey: &str, created_at: i64, kind: u16, tags: &Tags, content: &str) -> String {
    let canonical = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
    let canonical_json =
        serde_json::to_string(&canonical).expect("canonical event array always serializes");
    hex::encode(Sha256::digest(canonical_json.as_bytes()))
}

/// An unsigned inner event carried inside ratchet ciphertext.
///
/// Authenticity comes from ratchet-key possession, not a signature. `id` is
/// never trusted from the wire on receipt — see [`Self::recompute_id`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rumor {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Tags,
    pub content: String,
}

impl Rumor {
    pub fn new(pubkey: impl Into<String>, created_at: i64, kind: u16, tags: Tags, content: impl Into<String>) -> Self {
        let pubkey = pubkey.into();
        let content = content.into();
        let id = event_hash(&pubkey, created_at, kind, &tags, &content);
        Self { id, pubkey, created_at, kind, tags, content }
    }

    /// Recompute `id` from the current fields, overwriting whatever was there.
    ///
    /// Called on every rumor a `Session` decrypts; a sender that shipped a
    /// stale or tampered `id` does not get rejected, it just gets corrected.
    pub fn recompute_id(&mut self) {
        self.id = event_hash(&self.pubkey, self.created_at, self.kind, &self.tags, &self.content);
    }

    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.first().map(String::as_str) == Some(name)).and_then(|t| t.get(1)).map(String::as_str)
    }
}

/// A signed outer event as it travels on the relay.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u16,
    pub tags: Tags,
    pub content: String,
    pub sig: String,
}

impl Event {
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags.iter().find(|t| t.first().map(String::as_str) == Some(name)).and_then(|t| t.get(1)).map(String::as_str)
    }
}
