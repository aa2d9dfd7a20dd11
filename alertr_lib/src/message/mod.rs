//! Everything that's sent between two peers.
//!
//! - [`Envelope`]s are the application-level messages, i.e. `ping`, `sensoralert`, `option`, ...
//! - [`Frame`]s are the wire units of the handshake that carries a single envelope.
//!
//! Both are serialized as compact JSON. A frame never contains a raw newline, which allows the
//! channel adapters to use newline-delimited framing.
use std::time::{SystemTime, UNIX_EPOCH};

pub mod builder;
pub mod envelope;
pub mod frame;

pub use envelope::Envelope;
pub use frame::{Frame, FrameKind, FramePayload, TransactionResult};

/// The current time as unix timestamp in seconds.
///
/// A system clock before 1970 is treated as the epoch itself.
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}
