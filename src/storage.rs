//! The storage capability this crate consumes: opaque byte get/put/del/list,
//! no transactional semantics required. Grounded on the `InMemoryStorage` /
//! `StorageAdapter` pairing used for tests across the pack's reference
//! implementation of this same protocol.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Durable key/value storage for session state and device bookkeeping.
/// Implementations must be safe to call from multiple threads — the
/// manager does not serialize access on the caller's behalf.
pub trait StorageAdapter: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// An in-process `StorageAdapter` backed by a `BTreeMap`. Sufficient for
/// tests and for any deployment that doesn't need the state to survive
/// a restart.
#[derive(Default)]
pub struct InMemoryStorage {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageAdapter for InMemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = self.data.lock().map_err(|_| Error::Storage("poisoned lock".into()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| Error::Storage("poisoned lock".into()))?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        let mut data = self.data.lock().map_err(|_| Error::Storage("poisoned lock".into()))?;
        data.remove(key);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let data = self.data.lock().map_err(|_| Error::Storage("poisoned lock".into()))?;
        Ok(data.keys().filter(|k| k.starts_with(prefix)).cloned().collect())
    }
}

/// Storage key for a session's serialised state.
pub fn session_key(peer_pubkey: &str, device_id: &str) -> String {
    format!("session/{peer_pubkey}/{device_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_storage_roundtrip() {
        let storage = InMemoryStorage::new();
        storage.put("session/abc/laptop", b"state").unwrap();

        assert_eq!(storage.get("session/abc/laptop").unwrap(), Some(b"state".to_vec()));
        assert_eq!(storage.list("session/abc/").unwrap(), vec!["session/abc/laptop".to_string()]);

        storage.del("session/abc/laptop").unwrap();
        assert_eq!(storage.get("session/abc/laptop").unwrap(), None);
    }
}
