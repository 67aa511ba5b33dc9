//! Codec boundary (C2) — serializes/deserializes a record to/from bytes.
//!
//! The core only requires round-trip bytes↔record; the format itself is
//! pluggable. `tryCount`/`firstAttemptAt` are carried in a core-added
//! [`Envelope`] rather than inside the application record (see DESIGN.md),
//! so they round-trip through persistence without the application needing
//! to know about them.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{Error, Result};

/// Wall-clock timestamp stored as milliseconds since the Unix epoch, so it
/// round-trips through any codec without depending on a particular clock type.
pub type EpochMillis = u64;

/// Current wall-clock time, truncated to milliseconds since the Unix epoch.
pub fn now_millis() -> EpochMillis {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A persisted record plus the retry metadata the scheduler needs to survive
/// a restart (§3: "these may be carried inside the record or in an envelope
/// added by the core").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub record: T,
    pub try_count: u32,
    pub first_attempt_at: Option<EpochMillis>,
}

impl<T> Envelope<T> {
    pub fn fresh(record: T) -> Self {
        Self {
            record,
            try_count: 0,
            first_attempt_at: None,
        }
    }
}

/// Pluggable codec for a single record type, typed for one queue instance.
///
/// Implementations must be deterministic and lossless for every field that
/// participates in an invariant, including the envelope's retry metadata.
pub trait Codec<T>: Send + Sync + 'static {
    fn encode(&self, envelope: &Envelope<T>) -> Result<Vec<u8>>;
    fn decode(&self, bytes: &[u8]) -> Result<Envelope<T>>;
}

/// Default codec built on `bincode`, the framing format the pack's own WAL
/// crate (`ringwal`) declares a dependency on for exactly this purpose.
pub struct BincodeCodec;

impl<T> Codec<T> for BincodeCodec
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn encode(&self, envelope: &Envelope<T>) -> Result<Vec<u8>> {
        bincode::serialize(envelope).map_err(|e| Error::Io(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope<T>> {
        bincode::deserialize(bytes).map_err(|e| Error::Io(e.to_string()))
    }
}
