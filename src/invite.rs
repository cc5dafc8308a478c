//! The handshake: a shareable `Invite` that bootstraps a [`Session`] without
//! either side learning the other's identity from the link alone.
//!
//! Structurally follows a real Rust port of this same protocol
//! (`Invite::create_new`/`get_url`/`accept`/`process_invite_response`),
//! adapted from nostr/nip44 onto this crate's own X25519+AEAD primitives
//! since there is no secp256k1/nip44 stack in the teacher's dependency tree.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::INVITE_RESPONSE_JITTER_SECS;
use crate::crypto::{aead_decrypt, aead_encrypt, public_key_from_hex, public_key_to_hex, x25519_dh, x25519_generate};
use crate::error::{Error, Result};
use crate::event::{Event, INVITE_EVENT_KIND, INVITE_RESPONSE_EVENT_KIND};
use crate::session::Session;

/// A handshake descriptor. Holds the inviter's ephemeral private key only
/// while the inviter side is listening for responses; an invitee that
/// parses one from a URL never sees it.
#[derive(Clone, Serialize, Deserialize)]
pub struct Invite {
    pub inviter: String,
    pub ephemeral_public: [u8; 32],
    pub shared_secret: [u8; 32],
    pub ephemeral_private: Option<[u8; 32]>,
    pub device_id: Option<String>,
    pub max_uses: Option<usize>,
    pub used_by: Vec<String>,
    pub created_at: i64,
}

/// What falls out of a successfully processed `INVITE_RESPONSE`: a freshly
/// initialised responder session plus who it belongs to.
pub struct InviteResponse {
    pub session: Session,
    pub invitee_identity: String,
    pub device_id: Option<String>,
}

impl Invite {
    pub fn create_new(inviter: impl Into<String>, device_id: Option<String>, max_uses: Option<usize>) -> Self {
        let (ephemeral_private, ephemeral_public) = x25519_generate();
        Self {
            inviter: inviter.into(),
            ephemeral_public,
            shared_secret: {
                let (secret, _) = x25519_generate();
                secret
            },
            ephemeral_private: Some(ephemeral_private),
            device_id,
            max_uses,
            used_by: Vec::new(),
            created_at: now(),
        }
    }

    /// `{inviter, ephemeral_public, shared_secret}` encoded into a URL
    /// fragment, so nothing leaks to a server that only sees the path.
    pub fn get_url(&self, root: &str) -> String {
        let data = json!({
            "inviter": self.inviter,
            "ephemeralKey": hex::encode(self.ephemeral_public),
            "sharedSecret": hex::encode(self.shared_secret),
        });
        format!("{root}#{}", urlencoding_encode(&data.to_string()))
    }

    pub fn from_url(url: &str) -> Result<Self> {
        let fragment = url.split('#').nth(1).ok_or_else(|| Error::MalformedInvite("no fragment in url".into()))?;
        let decoded = urlencoding_decode(fragment);
        let data: serde_json::Value = serde_json::from_str(&decoded)?;

        let inviter = data["inviter"].as_str().ok_or_else(|| Error::MalformedInvite("missing inviter".into()))?.to_string();
        let ephemeral_public = decode_public(&data, "ephemeralKey")?;
        let shared_secret = decode_secret(&data, "sharedSecret")?;

        Ok(Self {
            inviter,
            ephemeral_public,
            shared_secret,
            ephemeral_private: None,
            device_id: None,
            max_uses: None,
            used_by: Vec::new(),
            created_at: 0,
        })
    }

    /// Parameter-replaceable advertisement: `d = "double-ratchet/invites/<device_id>"`.
    /// A later event with the same `d` tag and no key tags is a tombstone.
    /// Returns `(kind, tags, content)`, ready to be signed by the inviter's
    /// long-term identity [`crate::crypto::signer::Signer`].
    pub fn to_rumor_fields(&self) -> Result<(u16, Vec<Vec<String>>, String)> {
        let device_id = self.device_id.as_ref().ok_or_else(|| Error::MalformedInvite("device_id required to advertise an invite".into()))?;
        let tags = vec![
            vec!["ephemeralKey".to_string(), hex::encode(self.ephemeral_public)],
            vec!["sharedSecret".to_string(), hex::encode(self.shared_secret)],
            vec!["d".to_string(), format!("double-ratchet/invites/{device_id}")],
            vec!["l".to_string(), "double-ratchet/invites".to_string()],
        ];
        Ok((INVITE_EVENT_KIND, tags, String::new()))
    }

    /// A tombstone for this invite: same `d` tag, no key tags, retracting it.
    pub fn tombstone_rumor_fields(&self) -> Result<(u16, Vec<Vec<String>>, String)> {
        let device_id = self.device_id.as_ref().ok_or_else(|| Error::MalformedInvite("device_id required to advertise an invite".into()))?;
        let tags = vec![
            vec!["d".to_string(), format!("double-ratchet/invites/{device_id}")],
            vec!["l".to_string(), "double-ratchet/invites".to_string()],
        ];
        Ok((INVITE_EVENT_KIND, tags, String::new()))
    }

    pub fn from_event(event: &Event) -> Result<Self> {
        let ephemeral_public = decode_tag_public(event, "ephemeralKey")?;
        let shared_secret = decode_tag_secret(event, "sharedSecret")?;
        let device_id = event
            .tag_value("d")
            .and_then(|d| d.rsplit('/').next())
            .map(String::from);

        Ok(Self {
            inviter: event.pubkey.clone(),
            ephemeral_public,
            shared_secret,
            ephemeral_private: None,
            device_id,
            max_uses: None,
            used_by: Vec::new(),
            created_at: event.created_at,
        })
    }

    /// Invitee side. Initialises the session as *initiator* and produces the
    /// signed envelope the inviter will later process via
    /// [`Self::process_invite_response`].
    pub fn accept(&self, invitee_identity_secret: &[u8; 32], invitee_identity_public_hex: &str, device_id: Option<String>) -> Result<(Session, Event)> {
        let (session_secret, session_public) = x25519_generate();

        let session = Session::init(self.ephemeral_public, session_secret, true, self.shared_secret);

        let inner_payload = json!({
            "sessionKey": hex::encode(session_public),
            "deviceId": device_id,
        });

        let inviter_public = public_key_from_hex(&self.inviter)?;
        let identity_dh = x25519_dh(invitee_identity_secret, inviter_public.as_bytes());
        let identity_layer = aead_encrypt(&identity_dh, inner_payload.to_string().as_bytes());
        let link_layer = aead_encrypt(&self.shared_secret, &identity_layer);

        let inner_event = json!({
            "pubkey": invitee_identity_public_hex,
            "content": hex::encode(link_layer),
            "created_at": now(),
        });

        let (envelope_secret, envelope_public) = x25519_generate();
        let envelope_dh = x25519_dh(&envelope_secret, &self.ephemeral_public);
        let envelope_ciphertext = aead_encrypt(&envelope_dh, inner_event.to_string().as_bytes());

        let tags = vec![vec!["p".to_string(), hex::encode(self.ephemeral_public)]];
        let pubkey = hex::encode(envelope_public);
        let content = hex::encode(envelope_ciphertext);
        let created_at = now() - (rand::random::<i64>().rem_euclid(INVITE_RESPONSE_JITTER_SECS));

        let id = crate::event::event_hash(&pubkey, created_at, INVITE_RESPONSE_EVENT_KIND, &tags, &content);
        let signing_key = crypto_sign_envelope(&envelope_secret);
        let sig = hex::encode(signing_key.sign(&hex::decode(&id).expect("hash output is always valid hex")).to_bytes());

        let envelope = Event { id, pubkey, created_at, kind: INVITE_RESPONSE_EVENT_KIND, tags, content, sig };

        Ok((session, envelope))
    }

    /// Inviter side. Peels the envelope, then the link layer, then the
    /// identity layer, and initialises a responder [`Session`].
    pub fn process_invite_response(&self, envelope: &Event) -> Result<Option<InviteResponse>> {
        if let Some(max_uses) = self.max_uses {
            if self.used_by.len() >= max_uses {
                return Err(Error::InviteExhausted);
            }
        }

        let ephemeral_private = self.ephemeral_private.ok_or_else(|| Error::MalformedInvite("missing ephemeral private key".into()))?;
        let envelope_public = public_key_from_hex(&envelope.pubkey)?;
        let envelope_dh = x25519_dh(&ephemeral_private, envelope_public.as_bytes());

        let envelope_ciphertext = hex::decode(&envelope.content).map_err(|_| Error::MalformedInvite("envelope content not hex".into()))?;
        let inner_plaintext = aead_decrypt(&envelope_dh, &envelope_ciphertext)?;
        let inner_event: serde_json::Value = serde_json::from_slice(&inner_plaintext).map_err(|e| Error::MalformedInvite(e.to_string()))?;

        let invitee_identity = inner_event["pubkey"].as_str().ok_or_else(|| Error::MalformedInvite("missing pubkey".into()))?.to_string();
        let inner_content_hex = inner_event["content"].as_str().ok_or_else(|| Error::MalformedInvite("missing content".into()))?;
        let link_layer = hex::decode(inner_content_hex).map_err(|_| Error::MalformedInvite("inner content not hex".into()))?;

        let identity_layer = aead_decrypt(&self.shared_secret, &link_layer)?;

        let invitee_public = public_key_from_hex(&invitee_identity)?;
        let identity_dh = x25519_dh(&ephemeral_private, invitee_public.as_bytes());
        let identity_plaintext = aead_decrypt(&identity_dh, &identity_layer)?;
        let payload: serde_json::Value = serde_json::from_slice(&identity_plaintext).map_err(|e| Error::MalformedInvite(e.to_string()))?;

        let session_key_hex = payload["sessionKey"].as_str().ok_or_else(|| Error::MalformedInvite("missing sessionKey".into()))?;
        let session_public = public_key_from_hex(session_key_hex)?;
        let device_id = payload["deviceId"].as_str().map(String::from);

        let session = Session::init(*session_public.as_bytes(), ephemeral_private, false, self.shared_secret);

        Ok(Some(InviteResponse { session, invitee_identity, device_id }))
    }

    pub fn mark_used(&mut self, invitee_identity: String) {
        if !self.used_by.contains(&invitee_identity) {
            self.used_by.push(invitee_identity);
        }
    }
}

fn crypto_sign_envelope(envelope_secret: &[u8; 32]) -> ed25519_dalek::SigningKey {
    crate::crypto::derive_turn_signing_key(envelope_secret)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

fn decode_public(data: &serde_json::Value, field: &str) -> Result<[u8; 32]> {
    let hex_str = data[field].as_str().ok_or_else(|| Error::MalformedInvite(format!("missing {field}")))?;
    Ok(*public_key_from_hex(hex_str)?.as_bytes())
}

fn decode_secret(data: &serde_json::Value, field: &str) -> Result<[u8; 32]> {
    let hex_str = data[field].as_str().ok_or_else(|| Error::MalformedInvite(format!("missing {field}")))?;
    let bytes = hex::decode(hex_str).map_err(|e| Error::MalformedInvite(e.to_string()))?;
    bytes.try_into().map_err(|_| Error::MalformedInvite(format!("{field} must be 32 bytes")))
}

fn decode_tag_public(event: &Event, name: &str) -> Result<[u8; 32]> {
    let hex_str = event.tag_value(name).ok_or_else(|| Error::MalformedInvite(format!("missing {name} tag")))?;
    Ok(*public_key_from_hex(hex_str)?.as_bytes())
}

fn decode_tag_secret(event: &Event, name: &str) -> Result<[u8; 32]> {
    let hex_str = event.tag_value(name).ok_or_else(|| Error::MalformedInvite(format!("missing {name} tag")))?;
    let bytes = hex::decode(hex_str).map_err(|e| Error::MalformedInvite(e.to_string()))?;
    bytes.try_into().map_err(|_| Error::MalformedInvite(format!("{name} must be 32 bytes")))
}

fn urlencoding_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn urlencoding_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

use ed25519_dalek::Signer as _;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    #[test]
    fn test_url_roundtrip() {
        let invite = Invite::create_new("a".repeat(64), Some("laptop".to_string()), None);
        let url = invite.get_url("https://example.com/invite");
        let parsed = Invite::from_url(&url).unwrap();

        assert_eq!(parsed.inviter, invite.inviter);
        assert_eq!(parsed.ephemeral_public, invite.ephemeral_public);
        assert_eq!(parsed.shared_secret, invite.shared_secret);
        assert!(parsed.ephemeral_private.is_none(), "invitee never sees the inviter's ephemeral secret");
    }

    #[test]
    fn test_accept_then_process_establishes_matching_sessions() {
        let inviter_identity = Identity::generate();
        let invitee_identity = Identity::generate();

        let invite = Invite::create_new(inviter_identity.public_key_hex(), Some("phone".to_string()), None);

        let (mut invitee_session, envelope) = invite
            .accept(&invitee_identity.secret_bytes(), &invitee_identity.public_key_hex(), Some("phone".to_string()))
            .unwrap();

        let response = invite.process_invite_response(&envelope).unwrap().unwrap();
        assert_eq!(response.invitee_identity, invitee_identity.public_key_hex());
        assert_eq!(response.device_id.as_deref(), Some("phone"));

        let mut inviter_session = response.session;

        let rumor = crate::event::Rumor::new(invitee_identity.public_key_hex(), 1_700_000_000, 1, vec![], "hello");
        let outer = invitee_session.encrypt(&rumor).unwrap();
        let received = inviter_session.receive(&outer).unwrap().unwrap();
        assert_eq!(received.content, "hello");
    }

    #[test]
    fn test_tombstone_matches_advertisement_d_tag_but_drops_key_tags() {
        let invite = Invite::create_new("a".repeat(64), Some("laptop".to_string()), None);
        let (_, live_tags, _) = invite.to_rumor_fields().unwrap();
        let (_, tombstone_tags, _) = invite.tombstone_rumor_fields().unwrap();

        let d_tag = |tags: &[Vec<String>]| tags.iter().find(|t| t[0] == "d").cloned().unwrap();
        assert_eq!(d_tag(&live_tags), d_tag(&tombstone_tags));
        assert!(tombstone_tags.iter().all(|t| t[0] != "ephemeralKey" && t[0] != "sharedSecret"));
    }

    #[test]
    fn test_max_uses_exhausted() {
        let mut invite = Invite::create_new("a".repeat(64), None, Some(1));
        invite.mark_used("b".repeat(64));
        assert!(matches!(invite.process_invite_response(&dummy_event()), Err(Error::InviteExhausted)));
    }

    fn dummy_event() -> Event {
        Event {
            id: "0".repeat(64),
            pubkey: "0".repeat(64),
            created_at: 0,
            kind: INVITE_RESPONSE_EVENT_KIND,
            tags: vec![],
            content: String::new(),
            sig: "0".repeat(128),
        }
    }
}
