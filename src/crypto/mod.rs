//! Cryptographic primitives: identity keypairs, Diffie-Hellman, the two KDF
//! shapes the ratchet needs, AEAD encrypt/decrypt, and event signing.
//!
//! Kept close to `crypto::{Identity, encrypt_message, decrypt_message}` and
//! `crypto::ratchet::{kdf_root, kdf_chain, encrypt_with_key, decrypt_with_key}`
//! in spirit; generalized so `Session` (in `crate::session`) can call them
//! without owning a concrete relay/signature stack.

pub mod signer;

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng as AeadOsRng},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::error::{Error, Result};

/// A device's long-term X25519 identity keypair.
#[derive(Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
pub struct Identity {
    #[serde(with = "secret_serde")]
    secret_key: StaticSecret,
    #[serde(with = "public_key_serde")]
    public_key: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let secret_key = StaticSecret::random_from_rng(AeadOsRng);
        let public_key = PublicKey::from(&secret_key);
        Self { secret_key, public_key }
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret_key = StaticSecret::from(bytes);
        let public_key = PublicKey::from(&secret_key);
        Self { secret_key, public_key }
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        *self.public_key.as_bytes()
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.as_bytes())
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret_key.to_bytes()
    }

    pub fn diffie_hellman(&self, their_public: &PublicKey) -> [u8; 32] {
        *self.secret_key.diffie_hellman(their_public).as_bytes()
    }
}

/// Two-output KDF used for the root/DH-mixing step: `(root_key, dh_output) ->
/// (new_root_key, chain_key)`. HKDF-SHA256 with domain-separated info labels.
pub fn kdf_root(salt: &[u8; 32], input: &[u8]) -> ([u8; 32], [u8; 32]) {
    let hk = Hkdf::<Sha256>::new(Some(salt), input);
    let mut root = [0u8; 32];
    let mut chain = [0u8; 32];
    hk.expand(b"double-ratchet-root", &mut root).expect("hkdf expand never fails for 32-byte output");
    hk.expand(b"double-ratchet-chain", &mut chain).expect("hkdf expand never fails for 32-byte output");
    (root, chain)
}

/// Two-output KDF used for per-message chain stepping: `chain_key ->
/// (next_chain_key, message_key)`. Keyed BLAKE3, cheap enough for the hot path.
pub fn kdf_chain(chain_key: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let next = blake3::keyed_hash(chain_key, b"chain-step-next");
    let message_key = blake3::keyed_hash(chain_key, b"chain-step-message");
    (*next.as_bytes(), *message_key.as_bytes())
}

/// Derive the symmetric header key for one turn: `DH(our_priv, their_pub)`
/// passed through a single-output HKDF so header keys and message/root keys
/// never collide even if the same DH output were ever reused.
pub fn kdf_header_key(dh_output: &[u8; 32]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(None, dh_output);
    let mut key = [0u8; 32];
    hk.expand(b"double-ratchet-header-key", &mut key).expect("hkdf expand never fails for 32-byte output");
    key
}

pub fn aead_encrypt(key: &[u8; 32], plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let mut nonce_bytes = [0u8; 12];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher.encrypt(nonce, plaintext).expect("chacha20poly1305 encryption is infallible for valid keys");
    let mut out = nonce_bytes.to_vec();
    out.extend(ciphertext);
    out
}

pub fn aead_decrypt(key: &[u8; 32], ciphertext: &[u8]) -> Result<Vec<u8>> {
    if ciphertext.len() < 12 {
        return Err(Error::BodyDecryptionFailed);
    }
    let (nonce_bytes, body) = ciphertext.split_at(12);
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher.decrypt(nonce, body).map_err(|_| Error::BodyDecryptionFailed)
}

/// Generate a fresh X25519 keypair, returning `(secret, public)` as raw bytes.
pub fn x25519_generate() -> ([u8; 32], [u8; 32]) {
    let secret = StaticSecret::random_from_rng(AeadOsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), *public.as_bytes())
}

pub fn x25519_public_from_secret(secret: &[u8; 32]) -> [u8; 32] {
    *PublicKey::from(&StaticSecret::from(*secret)).as_bytes()
}

pub fn x25519_dh(secret: &[u8; 32], public: &[u8; 32]) -> [u8; 32] {
    *StaticSecret::from(*secret).diffie_hellman(&PublicKey::from(*public)).as_bytes()
}

/// Deterministically derive a one-time Ed25519 signing key from a ratchet
/// turn's X25519 secret. Every outer wire event authored under a given
/// ratchet public key is signed with the Ed25519 key derived this way, so
/// the signature is bound to the same secret that proves DH possession
/// without needing an Edwards/Montgomery curve-conversion trick.
pub fn derive_turn_signing_key(dh_secret: &[u8; 32]) -> ed25519_dalek::SigningKey {
    let hk = Hkdf::<Sha256>::new(None, dh_secret);
    let mut seed = [0u8; 32];
    hk.expand(b"double-ratchet-turn-signing-key", &mut seed).expect("hkdf expand never fails for 32-byte output");
    ed25519_dalek::SigningKey::from_bytes(&seed)
}

pub fn public_key_from_hex(hex_str: &str) -> Result<PublicKey> {
    let bytes = hex::decode(hex_str).map_err(|e| Error::InvalidKey(e.to_string()))?;
    let array: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidKey("public key must be 32 bytes".into()))?;
    Ok(PublicKey::from(array))
}

pub fn public_key_to_hex(key: &PublicKey) -> String {
    hex::encode(key.as_bytes())
}

mod secret_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(secret: &StaticSecret, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(secret.to_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<StaticSecret, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| serde::de::Error::custom("invalid secret key length"))?;
        Ok(StaticSecret::from(array))
    }
}

mod public_key_serde {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S>(public_key: &PublicKey, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(public_key.as_bytes()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> std::result::Result<PublicKey, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = serde::Deserialize::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| serde::de::Error::custom("invalid public key length"))?;
        Ok(PublicKey::from(array))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_agreement() {
        let alice = Identity::generate();
        let bob = Identity::generate();

        let alice_shared = alice.diffie_hellman(&PublicKey::from(bob.public_key_bytes()));
        let bob_shared = bob.diffie_hellman(&PublicKey::from(alice.public_key_bytes()));

        assert_eq!(alice_shared, bob_shared);
    }

    #[test]
    fn test_aead_roundtrip() {
        let key = [7u8; 32];
        let ciphertext = aead_encrypt(&key, b"hello world");
        let plaintext = aead_decrypt(&key, &ciphertext).unwrap();
        assert_eq!(plaintext, b"hello world");
    }

    #[test]
    fn test_aead_rejects_wrong_key() {
        let ciphertext = aead_encrypt(&[1u8; 32], b"secret");
        assert!(aead_decrypt(&[2u8; 32], &ciphertext).is_err());
    }

    #[test]
    fn test_kdf_root_deterministic() {
        let a = kdf_root(&[1u8; 32], b"dh-output");
        let b = kdf_root(&[1u8; 32], b"dh-output");
        assert_eq!(a, b);
    }

    #[test]
    fn test_kdf_chain_advances() {
        let (next, message_key) = kdf_chain(&[9u8; 32]);
        assert_ne!(next, message_key);
        assert_ne!(next, [9u8; 32]);
    }
}
