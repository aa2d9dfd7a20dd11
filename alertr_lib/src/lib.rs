#![doc = include_str!("../README.md")]

pub(crate) mod internal_prelude {
    #![allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

pub mod channel;
pub mod communication;
pub mod error;
pub mod greeting;
pub mod message;
#[cfg(feature = "settings")]
mod setting_defaults;
#[cfg(feature = "settings")]
pub mod settings;
#[cfg(feature = "tls")]
pub mod tls;
pub mod watchdog;

/// The protocol version that's exchanged during the greeting.
/// Two peers are compatible, as long as the first decimal place matches.
pub const PROTOCOL_VERSION: f64 = 0.4;
/// The revision of the protocol implementation. Purely informational.
pub const PROTOCOL_REVISION: u32 = 0;

pub use communication::{
    Communication, CommunicationConfig, MsgRequest, MsgState, Promise, PromiseState,
};
pub use error::Error;
pub use message::{Envelope, Frame};
#[cfg(feature = "settings")]
pub use settings::Settings;

pub mod prelude {
    pub use super::channel::{ByteChannel, ChannelReader, ChannelWriter};
    pub use super::communication::{
        Communication, CommunicationConfig, MsgRequest, MsgState, Promise, PromiseState,
    };
    pub use super::error::Error;
    pub use super::message::{Envelope, Frame, FramePayload, TransactionResult};
    #[cfg(feature = "settings")]
    pub use super::settings::Settings;
}
