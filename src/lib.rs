//! End-to-end encrypted messaging core: a header-encrypted Double Ratchet,
//! a link-based invite handshake, and multi-device session fan-out over an
//! untrusted relay.
//!
//! The crate is transport-agnostic: embedders implement [`relay::RelayAdapter`]
//! and [`storage::StorageAdapter`] for their own network and disk layer and
//! drive everything else through [`manager::SessionManager`].

pub mod config;
pub mod crypto;
pub mod device;
pub mod error;
pub mod event;
pub mod invite;
pub mod manager;
pub mod relay;
pub mod session;
pub mod storage;

pub use crypto::signer::Signer;
pub use crypto::Identity;
pub use device::{AppKeys, DeviceEntry, DeviceRecord, UserRecord};
pub use error::{Error, Result};
pub use event::{Event, Rumor};
pub use invite::{Invite, InviteResponse};
pub use manager::{SendOptions, SessionManager, SessionManagerEvent};
pub use relay::{Filter, InMemoryRelay, RelayAdapter, Unsubscribe};
pub use session::{Session, SessionId, SessionState};
pub use storage::{InMemoryStorage, StorageAdapter};
