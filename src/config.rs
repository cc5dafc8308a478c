//! Named tunables. Every magic number the design calls out lives here, not
//! scattered through the modules that use it.

/// Maximum number of message keys retained per sender while waiting for a
/// skipped or out-of-order message to arrive. Exceeding this on receive is a
/// `TooManySkipped` error; exceeding it while pruning evicts the oldest
/// (lowest-counter) entries first.
pub const MAX_SKIP: u32 = 1000;

/// How long a stale `UserRecord`/`DeviceRecord` is kept around (for late
/// deliveries still in flight) before `prune_stale` removes it for good.
pub const STALE_RECORD_GRACE: std::time::Duration = std::time::Duration::from_secs(60 * 60 * 24);

/// Upper bound, in seconds, on how far into the past an `InviteResponse`
/// envelope's `created_at` is jittered to frustrate timing correlation.
pub const INVITE_RESPONSE_JITTER_SECS: i64 = 60 * 60 * 24 * 2;
