//! Per-peer bookkeeping: one [`UserRecord`] per identity, one [`DeviceRecord`]
//! per device of that identity, and the `AppKeys` revocation list shape.
//!
//! Has no direct analogue in the teacher (`whisper` only ever talks to one
//! peer at a time); modeled on how a real Rust port of this protocol keeps a
//! `Sessions` map keyed by `(pubkey, device_id)` and layers staleness on top.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::config::STALE_RECORD_GRACE;
use crate::session::{Session, SessionId};

/// One device's session history: the active session plus any superseded
/// ones kept around briefly in case a late message still needs them.
pub struct DeviceRecord {
    pub device_id: String,
    pub active_session: Option<Session>,
    pub inactive_sessions: Vec<Session>,
    pub last_activity: Instant,
    pub stale_since: Option<Instant>,
}

impl DeviceRecord {
    fn new(device_id: impl Into<String>, session: Session) -> Self {
        Self {
            device_id: device_id.into(),
            active_session: Some(session),
            inactive_sessions: Vec::new(),
            last_activity: Instant::now(),
            stale_since: None,
        }
    }

    pub fn is_stale(&self) -> bool {
        self.stale_since.is_some()
    }

    fn mark_stale(&mut self) {
        if self.stale_since.is_none() {
            self.stale_since = Some(Instant::now());
        }
    }
}

/// All known devices of one peer identity (or of ourselves, for self-sync).
#[derive(Default)]
pub struct UserRecord {
    pub devices: HashMap<String, DeviceRecord>,
    pub stale_since: Option<Instant>,
}

impl UserRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a device's active session. A pre-existing active
    /// session is pushed onto `inactive_sessions`, newest first, rather than
    /// dropped outright — a message racing the replacement may still need it.
    pub fn upsert_session(&mut self, device_id: impl Into<String>, session: Session) {
        let device_id = device_id.into();
        match self.devices.get_mut(&device_id) {
            Some(record) => {
                if let Some(previous) = record.active_session.take() {
                    record.inactive_sessions.insert(0, previous);
                }
                record.active_session = Some(session);
                record.last_activity = Instant::now();
            }
            None => {
                self.devices.insert(device_id.clone(), DeviceRecord::new(device_id, session));
            }
        }
    }

    /// Active sessions of every non-stale device, sessions that can
    /// currently send ordered ahead of responders still awaiting their
    /// first inbound turn.
    pub fn active_sessions(&self) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self
            .devices
            .values()
            .filter(|d| !d.is_stale())
            .filter_map(|d| d.active_session.as_ref())
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.can_send()));
        sessions
    }

    pub fn active_sessions_mut(&mut self) -> Vec<&mut Session> {
        let mut sessions: Vec<&mut Session> = self
            .devices
            .values_mut()
            .filter(|d| d.stale_since.is_none())
            .filter_map(|d| d.active_session.as_mut())
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.can_send()));
        sessions
    }

    pub fn mark_device_stale(&mut self, device_id: &str) {
        if let Some(record) = self.devices.get_mut(device_id) {
            record.mark_stale();
        }
    }

    pub fn mark_user_stale(&mut self) {
        if self.stale_since.is_none() {
            self.stale_since = Some(Instant::now());
        }
        for record in self.devices.values_mut() {
            record.mark_stale();
        }
    }

    /// Remove devices that have been stale for longer than `max_latency`.
    pub fn prune_stale(&mut self, max_latency: Duration) {
        self.devices.retain(|_, record| match record.stale_since {
            Some(since) => since.elapsed() < max_latency,
            None => true,
        });
    }

    pub fn remove_device(&mut self, device_id: &str) {
        self.devices.remove(device_id);
    }

    /// Apply a revocation list: any device not present in `authorised` is
    /// marked stale (not removed outright — `prune_stale` reaps it after
    /// [`STALE_RECORD_GRACE`], giving in-flight late deliveries a window).
    /// Returns the session ids of devices newly marked stale by this call, so
    /// the caller can close their relay subscriptions.
    pub fn apply_app_keys(&mut self, authorised: &[String]) -> Vec<SessionId> {
        let stale: Vec<String> = self
            .devices
            .keys()
            .filter(|device_id| !authorised.iter().any(|a| a == *device_id))
            .cloned()
            .collect();
        let mut newly_stale_sessions = Vec::new();
        for device_id in stale {
            if let Some(record) = self.devices.get_mut(&device_id) {
                if !record.is_stale() {
                    if let Some(session) = &record.active_session {
                        newly_stale_sessions.push(session.id);
                    }
                    record.mark_stale();
                }
            }
        }
        newly_stale_sessions
    }
}

/// One entry in an `AppKeys` revocation list: a device identity pubkey and
/// its rank (lowest rank wins ties when more than one device claims the
/// same role — unused by this crate's own logic but threaded through for
/// callers that need deterministic ordering).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub device_pubkey: String,
    pub rank: u32,
}

/// The parameter-replaceable, authoritative device list for one user
/// identity, carried as the content of an `APP_KEYS` event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppKeys {
    pub owner: String,
    pub devices: Vec<DeviceEntry>,
}

impl AppKeys {
    pub fn new(owner: impl Into<String>, devices: Vec<DeviceEntry>) -> Self {
        Self { owner: owner.into(), devices }
    }

    pub fn device_pubkeys(&self) -> Vec<String> {
        self.devices.iter().map(|d| d.device_pubkey.clone()).collect()
    }

    pub fn contains(&self, device_pubkey: &str) -> bool {
        self.devices.iter().any(|d| d.device_pubkey == device_pubkey)
    }

    pub fn d_tag_value() -> &'static str {
        "double-ratchet/app-keys"
    }
}

pub fn default_stale_grace() -> Duration {
    STALE_RECORD_GRACE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    fn dummy_session() -> Session {
        let (secret, _) = crate::crypto::x25519_generate();
        Session::init([1u8; 32], secret, false, [2u8; 32])
    }

    #[test]
    fn test_upsert_session_keeps_previous_as_inactive() {
        let mut record = UserRecord::new();
        record.upsert_session("laptop", dummy_session());
        record.upsert_session("laptop", dummy_session());

        let device = record.devices.get("laptop").unwrap();
        assert!(device.active_session.is_some());
        assert_eq!(device.inactive_sessions.len(), 1);
    }

    #[test]
    fn test_mark_device_stale_excludes_from_active_sessions() {
        let mut record = UserRecord::new();
        record.upsert_session("laptop", dummy_session());
        record.upsert_session("phone", dummy_session());
        record.mark_device_stale("phone");

        let active: Vec<&str> = record.devices.values().filter(|d| !d.is_stale()).map(|d| d.device_id.as_str()).collect();
        assert_eq!(active, vec!["laptop"]);
    }

    #[test]
    fn test_apply_app_keys_revokes_missing_device() {
        let mut record = UserRecord::new();
        record.upsert_session("laptop", dummy_session());
        record.upsert_session("old-phone", dummy_session());

        record.apply_app_keys(&["laptop".to_string()]);

        assert!(!record.devices.get("laptop").unwrap().is_stale());
        assert!(record.devices.get("old-phone").unwrap().is_stale());
    }

    #[test]
    fn test_app_keys_contains() {
        let keys = AppKeys::new("owner", vec![DeviceEntry { device_pubkey: "a".into(), rank: 0 }]);
        assert!(keys.contains("a"));
        assert!(!keys.contains("b"));
    }
}
