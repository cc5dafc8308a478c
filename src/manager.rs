//! Owns every session for one of our devices: keeps our own invite
//! advertised, discovers peer and sibling devices, fans outgoing rumors out
//! to every active session, and enforces revocation.
//!
//! `SessionManager::new(our_pubkey, our_identity_secret, our_device_id,
//! signer, relay, storage, event_tx)` mirrors the constructor shape of a real
//! Rust port of this protocol (`pubkey, secret_bytes, device_id_hex,
//! owner_pubkey, tx, storage`), adapted onto this crate's synchronous
//! `RelayAdapter`/`StorageAdapter` traits instead of an async pubsub client.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::config::STALE_RECORD_GRACE;
use crate::device::{AppKeys, UserRecord};
use crate::error::{Error, Result};
use crate::event::{Event, Rumor, INVITE_EVENT_KIND, INVITE_RESPONSE_EVENT_KIND, MESSAGE_EVENT_KIND};
use crate::invite::Invite;
use crate::crypto::signer::Signer;
use crate::relay::{Filter, RelayAdapter, Unsubscribe};
use crate::session::{Session, SessionId};
use crate::storage::{session_key, StorageAdapter};

/// Per-recipient rumor-shaping knobs (NIP-40-style), applied at the rumor
/// level so the relay never learns expiry of content it cannot read.
#[derive(Clone, Copy, Debug, Default)]
pub struct SendOptions {
    pub expires_at: Option<i64>,
    pub ttl_seconds: Option<i64>,
}

impl SendOptions {
    fn expiration_tag(&self, now: i64) -> Option<Vec<String>> {
        let expires_at = self.expires_at.or_else(|| self.ttl_seconds.map(|ttl| now + ttl))?;
        Some(vec!["expiration".to_string(), expires_at.to_string()])
    }
}

/// What the manager hands back to the application for every significant
/// thing that happens. Delivered over a plain `crossbeam_channel` rather
/// than a trait-object callback set, matching the eventing mechanism a real
/// Rust port of this protocol uses.
#[derive(Debug)]
pub enum SessionManagerEvent {
    /// An outer event was produced and handed to the relay; surfaced for
    /// callers that want to mirror it (logging, local echo) without a
    /// second round-trip through `send_event`'s return value.
    PublishSigned(Event),
    /// A rumor was decrypted and is ready for the application.
    DecryptedMessage { content: String, sender_pubkey: String, device_id: Option<String>, rumor: Rumor },
    /// A responder session finished the handshake for one of our invites.
    SessionEstablished { peer_pubkey: String, device_id: Option<String> },
    /// One of our own devices was dropped from our `AppKeys` list.
    SelfRevoked,
}

enum SessionLocation {
    Peer { peer_pubkey: String, device_id: String },
    Own { device_id: String },
}

pub struct SessionManager {
    our_pubkey: String,
    our_identity_secret: [u8; 32],
    our_device_id: String,
    signer: Signer,
    relay: Arc<dyn RelayAdapter>,
    storage: Arc<dyn StorageAdapter>,
    event_tx: crossbeam_channel::Sender<SessionManagerEvent>,

    users: Mutex<HashMap<String, UserRecord>>,
    own_devices: Mutex<UserRecord>,
    our_invite: Mutex<Option<Invite>>,
    send_options: Mutex<HashMap<String, SendOptions>>,
    locations: Mutex<HashMap<SessionId, SessionLocation>>,
    subscriptions: Mutex<HashMap<SessionId, Unsubscribe>>,
    revoked: AtomicBool,
}

impl SessionManager {
    pub fn new(
        our_pubkey: impl Into<String>,
        our_identity_secret: [u8; 32],
        our_device_id: impl Into<String>,
        signer: Signer,
        relay: Arc<dyn RelayAdapter>,
        storage: Arc<dyn StorageAdapter>,
        event_tx: crossbeam_channel::Sender<SessionManagerEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            our_pubkey: our_pubkey.into(),
            our_identity_secret,
            our_device_id: our_device_id.into(),
            signer,
            relay,
            storage,
            event_tx,
            users: Mutex::new(HashMap::new()),
            own_devices: Mutex::new(UserRecord::new()),
            our_invite: Mutex::new(None),
            send_options: Mutex::new(HashMap::new()),
            locations: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            revoked: AtomicBool::new(false),
        })
    }

    pub fn our_pubkey(&self) -> &str {
        &self.our_pubkey
    }

    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::SeqCst)
    }

    /// Load or create our device's invite, advertise it, start discovery of
    /// sibling devices and listen for acceptances, and hydrate any sessions
    /// persisted from a previous run.
    pub fn init(self: &Arc<Self>) -> Result<()> {
        let invite = self.load_or_create_invite()?;
        self.publish_invite(&invite)?;
        self.listen_for_invite_responses(invite.clone());
        *self.our_invite.lock().expect("lock poisoned") = Some(invite);

        self.discover_sibling_devices();
        self.hydrate_sessions()?;
        Ok(())
    }

    fn load_or_create_invite(&self) -> Result<Invite> {
        let key = format!("invite/{}", self.our_device_id);
        if let Some(bytes) = self.storage.get(&key)? {
            let invite: Invite = serde_json::from_slice(&bytes)?;
            return Ok(invite);
        }
        let invite = Invite::create_new(self.our_pubkey.clone(), Some(self.our_device_id.clone()), None);
        self.storage.put(&key, &serde_json::to_vec(&invite)?)?;
        Ok(invite)
    }

    fn publish_invite(&self, invite: &Invite) -> Result<()> {
        let (tags, content) = invite.to_rumor_fields().map(|(_, tags, content)| (tags, content))?;
        let created_at = invite.created_at;
        let rumor = Rumor::new(self.our_pubkey.clone(), created_at, INVITE_EVENT_KIND, tags, content);
        let event = self.signer.sign(rumor)?;
        self.relay.publish(event.clone())?;
        let _ = self.event_tx.send(SessionManagerEvent::PublishSigned(event));
        Ok(())
    }

    fn listen_for_invite_responses(self: &Arc<Self>, invite: Invite) {
        let manager = Arc::clone(self);
        let filter = Filter::new().kind(INVITE_RESPONSE_EVENT_KIND).tag('p', hex_encode_public(&invite.ephemeral_public));
        self.relay.subscribe(
            filter,
            Box::new(move |event| {
                manager.handle_invite_response(&invite, &event);
            }),
        );
    }

    fn handle_invite_response(self: &Arc<Self>, _invite_snapshot: &Invite, event: &Event) {
        let mut our_invite = self.our_invite.lock().expect("lock poisoned");
        let Some(invite) = our_invite.as_mut() else { return };

        match invite.process_invite_response(event) {
            Ok(Some(response)) => {
                invite.mark_used(response.invitee_identity.clone());
                let peer_pubkey = response.invitee_identity.clone();
                let device_id = response.device_id.clone().unwrap_or_default();
                drop(our_invite);

                let session = response.session;
                let session_id = session.id;
                self.users.lock().expect("lock poisoned").entry(peer_pubkey.clone()).or_default().upsert_session(device_id.clone(), session);
                self.persist_session(&peer_pubkey, &device_id);
                self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Peer { peer_pubkey: peer_pubkey.clone(), device_id: device_id.clone() });
                self.subscribe_session(session_id);

                let _ = self.event_tx.send(SessionManagerEvent::SessionEstablished { peer_pubkey, device_id: response.device_id });
            }
            Ok(None) => {}
            Err(Error::InviteExhausted) => debug!("invite response ignored: max_uses reached"),
            Err(e) => debug!(error = %e, "invite response ignored"),
        }
    }

    fn discover_sibling_devices(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let our_device_id = self.our_device_id.clone();
        let filter = Filter::new().kind(INVITE_EVENT_KIND).author(self.our_pubkey.clone());
        self.relay.subscribe(
            filter,
            Box::new(move |event| {
                let Ok(invite) = Invite::from_event(&event) else { return };
                let Some(device_id) = invite.device_id.clone() else { return };
                if device_id == our_device_id {
                    return;
                }
                manager.accept_sibling_invite(invite, device_id);
            }),
        );
    }

    fn accept_sibling_invite(self: &Arc<Self>, invite: Invite, device_id: String) {
        let (session, envelope) = match invite.accept(&self.our_identity_secret, &self.our_pubkey, Some(self.our_device_id.clone())) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, "failed to accept sibling device invite");
                return;
            }
        };

        let session_id = session.id;
        self.own_devices.lock().expect("lock poisoned").upsert_session(device_id.clone(), session);
        self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Own { device_id: device_id.clone() });
        self.persist_session_for(&Some(self.our_pubkey.clone()), &device_id);
        self.subscribe_session(session_id);

        if let Err(e) = self.relay.publish(envelope.clone()) {
            warn!(error = %e, "failed to publish invite-response envelope for sibling device");
            return;
        }
        let _ = self.event_tx.send(SessionManagerEvent::PublishSigned(envelope));
    }

    /// Register a session this manager didn't establish itself — most
    /// commonly, the initiator session an invitee gets back from
    /// `Invite::accept`, which has no inviter-side counterpart to route
    /// through `handle_invite_response`. Persists it and opens its
    /// subscriptions immediately.
    pub fn register_session(self: &Arc<Self>, peer_pubkey: &str, device_id: &str, session: Session) {
        let session_id = session.id;
        let is_own_device = peer_pubkey == self.our_pubkey;
        if is_own_device {
            self.own_devices.lock().expect("lock poisoned").upsert_session(device_id.to_string(), session);
            self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Own { device_id: device_id.to_string() });
            self.persist_session_for(&None, device_id);
        } else {
            self.users.lock().expect("lock poisoned").entry(peer_pubkey.to_string()).or_default().upsert_session(device_id.to_string(), session);
            self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Peer { peer_pubkey: peer_pubkey.to_string(), device_id: device_id.to_string() });
            self.persist_session_for(&Some(peer_pubkey.to_string()), device_id);
        }
        self.subscribe_session(session_id);
    }

    fn hydrate_sessions(self: &Arc<Self>) -> Result<()> {
        for key in self.storage.list("session/")? {
            let Some(bytes) = self.storage.get(&key)? else { continue };
            let state = match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(e) => {
                    warn!(key = %key, error = %e, "failed to deserialise persisted session, skipping");
                    continue;
                }
            };
            let session = Session::from_state(state);
            let session_id = session.id;

            let parts: Vec<&str> = key.trim_start_matches("session/").splitn(2, '/').collect();
            let (peer_pubkey, device_id) = match parts.as_slice() {
                [peer_pubkey, device_id] => (*peer_pubkey, *device_id),
                _ => continue,
            };

            if peer_pubkey == self.our_pubkey {
                self.own_devices.lock().expect("lock poisoned").upsert_session(device_id.to_string(), session);
                self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Own { device_id: device_id.to_string() });
            } else {
                self.users.lock().expect("lock poisoned").entry(peer_pubkey.to_string()).or_default().upsert_session(device_id.to_string(), session);
                self.locations.lock().expect("lock poisoned").insert(session_id, SessionLocation::Peer { peer_pubkey: peer_pubkey.to_string(), device_id: device_id.to_string() });
            }
            self.subscribe_session(session_id);
        }
        Ok(())
    }

    /// (Re)establish this session's relay subscriptions from its current
    /// expected senders, replacing any previous subscription for it.
    fn subscribe_session(self: &Arc<Self>, session_id: SessionId) {
        let expected_senders = {
            let locations = self.locations.lock().expect("lock poisoned");
            let Some(location) = locations.get(&session_id) else { return };
            self.with_session(location, |session| session.expected_senders())
        };
        let Some(expected_senders) = expected_senders else { return };
        if expected_senders.is_empty() {
            return;
        }

        if let Some(previous) = self.subscriptions.lock().expect("lock poisoned").remove(&session_id) {
            previous();
        }

        let mut filter = Filter::new().kind(MESSAGE_EVENT_KIND);
        for sender in expected_senders {
            filter = filter.author(sender);
        }

        let manager = Arc::clone(self);
        let unsubscribe = self.relay.subscribe(
            filter,
            Box::new(move |event| manager.handle_inbound_message(session_id, &event)),
        );
        self.subscriptions.lock().expect("lock poisoned").insert(session_id, unsubscribe);
    }

    fn handle_inbound_message(self: &Arc<Self>, session_id: SessionId, event: &Event) {
        let location_info = {
            let locations = self.locations.lock().expect("lock poisoned");
            match locations.get(&session_id) {
                Some(SessionLocation::Peer { peer_pubkey, device_id }) => Some((Some(peer_pubkey.clone()), device_id.clone())),
                Some(SessionLocation::Own { device_id }) => Some((None, device_id.clone())),
                None => None,
            }
        };
        let Some((peer_pubkey, device_id)) = location_info else { return };

        if self.is_device_stale(&peer_pubkey, &device_id) {
            debug!(device_id = %device_id, "dropping inbound message from revoked device");
            return;
        }

        let result = self.with_session_mut_by_id(&peer_pubkey, &device_id, |session| session.receive(event));

        match result {
            Some(Ok(Some(mut rumor))) => {
                rumor.recompute_id();
                self.persist_session_for(&peer_pubkey, &device_id);
                self.subscribe_session(session_id);
                let sender_pubkey = peer_pubkey.unwrap_or_else(|| self.our_pubkey.clone());
                let _ = self.event_tx.send(SessionManagerEvent::DecryptedMessage {
                    content: rumor.content.clone(),
                    sender_pubkey,
                    device_id: Some(device_id),
                    rumor,
                });
            }
            Some(Ok(None)) => {}
            Some(Err(Error::HeaderDecryptionFailed)) => {
                debug!("event not addressed to this session, dropping");
            }
            Some(Err(Error::BodyDecryptionFailed)) => {
                warn!(pubkey_prefix = &event.pubkey[..8.min(event.pubkey.len())], "message body failed to decrypt, dropping");
            }
            Some(Err(e)) => {
                debug!(error = %e, "inbound message dropped");
            }
            None => {}
        }
    }

    fn is_device_stale(&self, peer_pubkey: &Option<String>, device_id: &str) -> bool {
        match peer_pubkey {
            Some(peer_pubkey) => self.users.lock().expect("lock poisoned").get(peer_pubkey).and_then(|u| u.devices.get(device_id)).map(|d| d.is_stale()).unwrap_or(false),
            None => self.own_devices.lock().expect("lock poisoned").devices.get(device_id).map(|d| d.is_stale()).unwrap_or(false),
        }
    }

    fn with_session<T>(&self, location: &SessionLocation, f: impl FnOnce(&Session) -> T) -> Option<T> {
        match location {
            SessionLocation::Peer { peer_pubkey, device_id } => {
                let users = self.users.lock().expect("lock poisoned");
                let session = users.get(peer_pubkey)?.devices.get(device_id)?.active_session.as_ref()?;
                Some(f(session))
            }
            SessionLocation::Own { device_id } => {
                let own = self.own_devices.lock().expect("lock poisoned");
                let session = own.devices.get(device_id)?.active_session.as_ref()?;
                Some(f(session))
            }
        }
    }

    fn with_session_mut_by_id<T>(&self, peer_pubkey: &Option<String>, device_id: &str, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        match peer_pubkey {
            Some(peer_pubkey) => {
                let mut users = self.users.lock().expect("lock poisoned");
                let session = users.get_mut(peer_pubkey)?.devices.get_mut(device_id)?.active_session.as_mut()?;
                Some(f(session))
            }
            None => {
                let mut own = self.own_devices.lock().expect("lock poisoned");
                let session = own.devices.get_mut(device_id)?.active_session.as_mut()?;
                Some(f(session))
            }
        }
    }

    fn persist_session(&self, peer_pubkey: &str, device_id: &str) {
        self.persist_session_for(&Some(peer_pubkey.to_string()), device_id);
    }

    fn persist_session_for(&self, peer_pubkey: &Option<String>, device_id: &str) {
        let state = match peer_pubkey {
            Some(peer_pubkey) => self.users.lock().expect("lock poisoned").get(peer_pubkey).and_then(|u| u.devices.get(device_id)).and_then(|d| d.active_session.as_ref()).map(|s| serde_json::to_vec(&s.state)),
            None => self.own_devices.lock().expect("lock poisoned").devices.get(device_id).and_then(|d| d.active_session.as_ref()).map(|s| serde_json::to_vec(&s.state)),
        };
        let Some(Ok(bytes)) = state else { return };
        let key = session_key(peer_pubkey.as_deref().unwrap_or(self.our_pubkey.as_str()), device_id);
        if let Err(e) = self.storage.put(&key, &bytes) {
            warn!(key = %key, error = %e, "failed to persist session state");
        }
    }

    /// Complete and encrypt `rumor` for every active session of `recipient`
    /// plus every active session among our own sibling devices, publishing
    /// each resulting outer event.
    pub fn send_event(&self, recipient_pubkey: &str, mut rumor: Rumor) -> Result<Vec<Event>> {
        if let Some(options) = self.send_options.lock().expect("lock poisoned").get(recipient_pubkey) {
            if let Some(tag) = options.expiration_tag(rumor.created_at) {
                rumor.tags.push(tag);
            }
        }
        rumor.recompute_id();

        let mut outgoing = Vec::new();

        {
            let mut users = self.users.lock().expect("lock poisoned");
            let record = users.entry(recipient_pubkey.to_string()).or_default();
            for session in record.active_sessions_mut() {
                if let Ok(event) = session.encrypt(&rumor) {
                    outgoing.push(event);
                }
            }
        }
        self.persist_all_sessions_for_peer(recipient_pubkey);

        {
            let mut own = self.own_devices.lock().expect("lock poisoned");
            for session in own.active_sessions_mut() {
                if let Ok(event) = session.encrypt(&rumor) {
                    outgoing.push(event);
                }
            }
        }
        self.persist_all_own_sessions();

        for event in &outgoing {
            if let Err(e) = self.relay.publish(event.clone()) {
                warn!(error = %e, "failed to publish outer event");
                continue;
            }
            let _ = self.event_tx.send(SessionManagerEvent::PublishSigned(event.clone()));
        }

        Ok(outgoing)
    }

    pub fn send_text(&self, recipient_pubkey: &str, text: impl Into<String>) -> Result<Vec<Event>> {
        let rumor = Rumor::new(self.our_pubkey.clone(), now(), 1, vec![], text.into());
        self.send_event(recipient_pubkey, rumor)
    }

    pub fn set_peer_send_options(&self, peer_pubkey: &str, options: SendOptions) {
        self.send_options.lock().expect("lock poisoned").insert(peer_pubkey.to_string(), options);
    }

    fn persist_all_sessions_for_peer(&self, peer_pubkey: &str) {
        let device_ids: Vec<String> = self.users.lock().expect("lock poisoned").get(peer_pubkey).map(|u| u.devices.keys().cloned().collect()).unwrap_or_default();
        for device_id in device_ids {
            self.persist_session(peer_pubkey, &device_id);
        }
    }

    fn persist_all_own_sessions(&self) {
        let device_ids: Vec<String> = self.own_devices.lock().expect("lock poisoned").devices.keys().cloned().collect();
        for device_id in device_ids {
            self.persist_session_for(&Some(self.our_pubkey.clone()), &device_id);
        }
    }

    /// Apply a freshly observed `AppKeys` revocation list. If it concerns a
    /// peer, stale their dropped devices and close their subscriptions; if it
    /// concerns us, and our own device id is no longer listed, flag ourselves
    /// revoked.
    pub fn apply_app_keys(&self, app_keys: &AppKeys) {
        let newly_stale = if app_keys.owner == self.our_pubkey {
            if !app_keys.contains(&self.our_device_id) {
                self.revoked.store(true, Ordering::SeqCst);
                let _ = self.event_tx.send(SessionManagerEvent::SelfRevoked);
            }
            self.own_devices.lock().expect("lock poisoned").apply_app_keys(&app_keys.device_pubkeys())
        } else {
            self.users.lock().expect("lock poisoned").entry(app_keys.owner.clone()).or_default().apply_app_keys(&app_keys.device_pubkeys())
        };
        self.close_sessions(&newly_stale);
    }

    /// Release and forget the relay subscriptions for the given sessions —
    /// used when a device is revoked, so a stale device stops receiving
    /// inbound traffic even if its `active_session` is still on record.
    fn close_sessions(&self, session_ids: &[SessionId]) {
        let mut subscriptions = self.subscriptions.lock().expect("lock poisoned");
        for id in session_ids {
            if let Some(unsubscribe) = subscriptions.remove(id) {
                unsubscribe();
            }
        }
    }

    pub fn prune_stale(&self) {
        let mut users = self.users.lock().expect("lock poisoned");
        for record in users.values_mut() {
            record.prune_stale(STALE_RECORD_GRACE);
        }
        self.own_devices.lock().expect("lock poisoned").prune_stale(STALE_RECORD_GRACE);
    }

    /// Release every subscription this manager owns, cascading to every
    /// session it tracks.
    pub fn close(&self) {
        let mut subscriptions = self.subscriptions.lock().expect("lock poisoned");
        for (_, unsubscribe) in subscriptions.drain() {
            unsubscribe();
        }
    }
}

fn hex_encode_public(bytes: &[u8; 32]) -> String {
    hex::encode(bytes)
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;
    use crate::relay::InMemoryRelay;
    use crate::storage::InMemoryStorage;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn make_manager(device_id: &str, relay: &Arc<dyn RelayAdapter>) -> (Arc<SessionManager>, Identity, crossbeam_channel::Receiver<SessionManagerEvent>) {
        let identity = Identity::generate();
        let signing_key = SigningKey::generate(&mut OsRng);
        let signer = Signer::from_key(signing_key);
        let storage: Arc<dyn StorageAdapter> = Arc::new(InMemoryStorage::new());
        let (tx, rx) = crossbeam_channel::unbounded();

        let manager = SessionManager::new(identity.public_key_hex(), identity.secret_bytes(), device_id, signer, Arc::clone(relay), storage, tx);
        (manager, identity, rx)
    }

    #[test]
    fn test_init_publishes_invite() {
        let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
        let (manager, _identity, rx) = make_manager("laptop", &relay);

        manager.init().unwrap();

        let event = rx.try_recv().expect("expected an invite publish event");
        match event {
            SessionManagerEvent::PublishSigned(e) => assert_eq!(e.kind, INVITE_EVENT_KIND),
            _ => panic!("expected PublishSigned"),
        }
    }

    #[test]
    fn test_set_peer_send_options_adds_expiration_tag() {
        let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
        let (manager, _identity, _rx) = make_manager("laptop", &relay);
        manager.set_peer_send_options("peer", SendOptions { expires_at: None, ttl_seconds: Some(60) });

        let mut rumor = Rumor::new("peer", now(), 1, vec![], "hi");
        rumor.pubkey = "peer".to_string();
        let options = manager.send_options.lock().unwrap().get("peer").copied().unwrap();
        let tag = options.expiration_tag(rumor.created_at).unwrap();
        assert_eq!(tag[0], "expiration");
    }

    #[test]
    fn test_close_releases_subscriptions() {
        let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
        let (manager, identity, _rx) = make_manager("laptop", &relay);

        let their_ephemeral = crate::crypto::x25519_generate();
        let session = Session::init(their_ephemeral.1, crate::crypto::x25519_generate().0, true, [1u8; 32]);
        manager.register_session(&identity.public_key_hex(), "sibling", session);

        assert!(!manager.subscriptions.lock().unwrap().is_empty());
        manager.close();
        assert!(manager.subscriptions.lock().unwrap().is_empty());
    }

    #[test]
    fn test_apply_app_keys_self_revocation() {
        let relay: Arc<dyn RelayAdapter> = Arc::new(InMemoryRelay::new());
        let (manager, _identity, rx) = make_manager("laptop", &relay);

        let app_keys = AppKeys::new(manager.our_pubkey().to_string(), vec![crate::device::DeviceEntry { device_pubkey: "phone".to_string(), rank: 0 }]);
        manager.apply_app_keys(&app_keys);

        assert!(manager.is_revoked());
        assert!(matches!(rx.try_recv(), Ok(SessionManagerEvent::SelfRevoked)));
    }
}
