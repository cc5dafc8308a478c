//! Event signing, modeled as a tagged choice rather than a trait hierarchy:
//! a caller supplies either a raw signing key or a closure. The signature
//! scheme itself is an external collaborator (see module docs on [`Error`]);
//! this crate ships exactly one concrete option (Ed25519) so tests and
//! simple deployments don't need to bring their own.

use std::sync::Arc;

use ed25519_dalek::{Signer as _, SigningKey};

use crate::error::Result;
use crate::event::{Event, Rumor};

type SignFn = Arc<dyn Fn(&Rumor) -> Result<String> + Send + Sync>;

/// Produces a signature for a rumor's canonical id, either from an in-process
/// key or from an arbitrary callback (e.g. a hardware key or remote signer).
pub enum Signer {
    Key(SigningKey),
    Fn { public_key: String, sign: SignFn },
}

impl Signer {
    pub fn from_key(signing_key: SigningKey) -> Self {
        Self::Key(signing_key)
    }

    pub fn from_fn(public_key: impl Into<String>, sign: SignFn) -> Self {
        Self::Fn { public_key: public_key.into(), sign }
    }

    pub fn public_key_hex(&self) -> String {
        match self {
            Self::Key(k) => hex::encode(k.verifying_key().to_bytes()),
            Self::Fn { public_key, .. } => public_key.clone(),
        }
    }

    /// Sign a rumor's id, producing a fully signed outer [`Event`].
    ///
    /// Note this signs whatever `rumor` already is — callers that want the
    /// rumor's `pubkey` field to match the signer should set it themselves
    /// before calling; the two fields are independent here the same way the
    /// wire format keeps envelope author and inner rumor author independent.
    pub fn sign(&self, rumor: Rumor) -> Result<Event> {
        let sig = match self {
            Self::Key(key) => {
                let id_bytes = hex::decode(&rumor.id).map_err(|e| crate::error::Error::InvalidKey(e.to_string()))?;
                hex::encode(key.sign(&id_bytes).to_bytes())
            }
            Self::Fn { sign, .. } => sign(&rumor)?,
        };

        Ok(Event {
            id: rumor.id,
            pubkey: rumor.pubkey,
            created_at: rumor.created_at,
            kind: rumor.kind,
            tags: rumor.tags,
            content: rumor.content,
            sig,
        })
    }
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(_) => write!(f, "Signer::Key(..)"),
            Self::Fn { public_key, .. } => write!(f, "Signer::Fn({public_key})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_key_signer_produces_verifiable_signature() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let signer = Signer::from_key(signing_key.clone());

        let rumor = Rumor::new(signer.public_key_hex(), 1700000000, 1, vec![], "hi");
        let event = signer.sign(rumor).unwrap();

        let sig_bytes = hex::decode(&event.sig).unwrap();
        let sig = ed25519_dalek::Signature::from_slice(&sig_bytes).unwrap();
        let id_bytes = hex::decode(&event.id).unwrap();
        assert!(signing_key.verifying_key().verify_strict(&id_bytes, &sig).is_ok());
    }

    #[test]
    fn test_fn_signer() {
        let signer = Signer::from_fn("deadbeef", Arc::new(|rumor: &Rumor| Ok(format!("sig-over-{}", rumor.id))));
        let rumor = Rumor::new("deadbeef", 1, 1, vec![], "x");
        let event = signer.sign(rumor.clone()).unwrap();
        assert_eq!(event.sig, format!("sig-over-{}", rumor.id));
    }
}
