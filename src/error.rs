use thiserror::Error;

/// Everything that can go wrong talking to a session, an invite, or the manager.
///
/// Errors arising from untrusted relay traffic (bad headers, failed AEAD, replays)
/// are absorbed at the boundary that observed them and only logged — see the
/// module docs on `Session::receive` and `SessionManager::process_received_event`.
/// Only errors arising from a direct call the embedding application makes
/// propagate as `Err` to that caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed invite: {0}")]
    MalformedInvite(String),

    #[error("header could not be decrypted with any known key")]
    HeaderDecryptionFailed,

    #[error("message body failed to decrypt")]
    BodyDecryptionFailed,

    #[error("decrypted payload was not a well-formed rumor: {0}")]
    IntegrityFailed(String),

    #[error("sender skipped too many messages (max {max})")]
    TooManySkipped { max: u32 },

    #[error("session cannot send yet: we are the responder awaiting the first inbound message")]
    NotInitiator,

    #[error("invite has reached its maximum number of uses")]
    InviteExhausted,

    #[error("device has been revoked")]
    DeviceRevoked,

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid key material: {0}")]
    InvalidKey(String),
}

pub type Result<T> = std::result::Result<T, Error>;
