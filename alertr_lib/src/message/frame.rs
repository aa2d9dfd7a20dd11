use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::Envelope;
use crate::error::Error;

/// The outcome of a single handshake, as reported by the receiving side.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Deserialize, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TransactionResult {
    Ok,
    /// The envelope's timestamp was outside of the receiver's expiration window.
    Expired,
    /// The receiver couldn't process the request frame.
    Error,
}

/// The four phases of a handshake.
#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Display, EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum FrameKind {
    Rts,
    Cts,
    Request,
    Response,
}

/// The phase specific part of a [`Frame`].
///
/// All variants carry the transaction id, which is chosen by the sender of the `rts`.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FramePayload {
    /// Request to send. Announces the byte size of the upcoming envelope.
    Rts { id: u32, size: usize },
    /// Clear to send.
    Cts { id: u32 },
    Request { id: u32, envelope: Envelope },
    Response { id: u32, result: TransactionResult },
}

/// A single handshake step on the wire.
///
/// `message` repeats the type of the envelope that's being transferred.
/// It's only used for logging and sanity checks, the correlation happens via the id.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Frame {
    pub message: String,
    pub payload: FramePayload,
}

impl FramePayload {
    pub fn kind(&self) -> FrameKind {
        match self {
            FramePayload::Rts { .. } => FrameKind::Rts,
            FramePayload::Cts { .. } => FrameKind::Cts,
            FramePayload::Request { .. } => FrameKind::Request,
            FramePayload::Response { .. } => FrameKind::Response,
        }
    }

    pub fn id(&self) -> u32 {
        match self {
            FramePayload::Rts { id, .. }
            | FramePayload::Cts { id }
            | FramePayload::Request { id, .. }
            | FramePayload::Response { id, .. } => *id,
        }
    }
}

impl Frame {
    pub fn rts(message: &str, id: u32, size: usize) -> Self {
        Frame {
            message: message.to_string(),
            payload: FramePayload::Rts { id, size },
        }
    }

    pub fn cts(message: &str, id: u32) -> Self {
        Frame {
            message: message.to_string(),
            payload: FramePayload::Cts { id },
        }
    }

    pub fn request(id: u32, envelope: Envelope) -> Self {
        Frame {
            message: envelope.message_type(),
            payload: FramePayload::Request { id, envelope },
        }
    }

    pub fn response(message: &str, id: u32, result: TransactionResult) -> Self {
        Frame {
            message: message.to_string(),
            payload: FramePayload::Response { id, result },
        }
    }

    pub fn kind(&self) -> FrameKind {
        self.payload.kind()
    }

    pub fn id(&self) -> u32 {
        self.payload.id()
    }

    /// Serialize this frame into a single line of JSON (without the trailing newline).
    pub fn encode(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::MessageSerialization(err.to_string()))
    }

    /// Deserialize a frame.
    ///
    /// Invalid JSON, a missing or unknown `payload.type` and request frames with an invalid
    /// envelope all result in [`Error::MalformedFrame`].
    pub fn decode(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text.trim()).map_err(|err| Error::MalformedFrame(err.to_string()))
    }
}
