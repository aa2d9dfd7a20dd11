//! The byte channels a [`Communication`](crate::Communication) runs on.
//!
//! A channel is a duplex, ordered and reliable stream. alertr nodes usually talk to the server
//! via TLS encrypted TCP sockets, while local tooling can use Unix sockets.
//!
//! - Unix sockets are unencrypted
//! - TCP sockets are encrypted via TLS (plain TCP is only supported for local testing)
//!
//! Every channel is split into a [`ChannelReader`] and a [`ChannelWriter`] before it's used.
//! The reader is exclusively driven by the reader loop of a communication instance,
//! while the writer is shared by everyone that needs to send frames.
//!
//! Frames are newline-delimited. Each call to [`ChannelWriter::send`] writes exactly one line
//! and each call to [`ChannelReader::recv`] returns exactly one line, no matter how the
//! transport splits or coalesces the bytes in between.
use std::time::Duration;

use crate::error::Error;

pub mod memory;
mod socket;
#[cfg(feature = "tls")]
pub mod tls;

pub use socket::{get_client_channel, get_listener};

/// We choose a packet size of 1280 to be on the safe site regarding IPv6 MTU.
pub const PACKET_SIZE: usize = 1280;

/// Lines that're larger than this are rejected and the channel is considered broken.
pub const MAX_FRAME_SIZE: usize = 4 * 2usize.pow(20);

/// A peer that stops reading must not block a sender forever.
/// Exceeding this timeout breaks the channel.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(20);

/// The receiving half of a channel.
pub trait ChannelReader: Send {
    /// Receive the next line.
    ///
    /// Returns [`Error::RecvTimeout`] if no complete line arrived within `timeout`.
    /// Any other error means that the channel is broken.
    fn recv(&mut self, timeout: Duration) -> Result<String, Error>;
}

/// The sending half of a channel.
pub trait ChannelWriter: Send {
    /// Send a single line. The newline is appended by the channel.
    fn send(&mut self, data: &str) -> Result<(), Error>;

    /// Shut down the channel. Errors are ignored, as the channel is abandoned anyway.
    fn close(&mut self);
}

/// A connected duplex channel, which can be split into its two directions.
pub trait ByteChannel: Send {
    #[allow(clippy::type_complexity)]
    fn split(self: Box<Self>)
    -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error>;
}

pub type GenericChannel = Box<dyn ByteChannel>;

/// Accepts incoming channels on the server side.
pub trait ChannelListener: Send + Sync {
    fn accept(&self) -> Result<GenericChannel, Error>;
}

pub type GenericListener = Box<dyn ChannelListener>;

/// All information that's needed to connect to a server.
#[derive(Debug)]
pub enum ConnectionSettings {
    #[cfg(unix)]
    UnixSocket { path: std::path::PathBuf },
    /// Unencrypted TCP. Only use this for local connections.
    TcpSocket { host: String, port: String },
    #[cfg(feature = "tls")]
    TlsTcpSocket {
        host: String,
        port: String,
        /// The server's certificate. It's the only certificate that's trusted.
        certificate: rustls::pki_types::CertificateDer<'static>,
        /// The certificate chain and key this node authenticates itself with, if the server
        /// requires client certificates.
        client_auth: Option<crate::tls::ClientIdentity>,
    },
}

/// All information that's needed to listen for incoming nodes.
#[derive(Debug)]
pub enum ListenerSettings {
    #[cfg(unix)]
    UnixSocket {
        path: std::path::PathBuf,
        permissions: Option<u32>,
    },
    /// Unencrypted TCP. Only use this for local connections.
    TcpSocket { host: String, port: String },
    #[cfg(feature = "tls")]
    TlsTcpSocket {
        host: String,
        port: String,
        identity: crate::tls::ServerIdentity,
    },
}

/// Reassembles newline-delimited frames from arbitrary chunks of bytes.
#[derive(Default, Debug)]
pub struct LineBuffer {
    buffer: Vec<u8>,
    /// The bytes before this offset are known to contain no newline.
    scanned: usize,
}

impl LineBuffer {
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pop the next complete line, without its line ending.
    /// Empty lines are skipped.
    pub fn next_line(&mut self) -> Result<Option<String>, Error> {
        loop {
            let Some(offset) = self.buffer[self.scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
            else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > MAX_FRAME_SIZE {
                    return Err(Error::MessageTooBig(self.buffer.len(), MAX_FRAME_SIZE));
                }
                return Ok(None);
            };
            let position = self.scanned + offset;
            self.scanned = 0;

            if position > MAX_FRAME_SIZE {
                return Err(Error::MessageTooBig(position, MAX_FRAME_SIZE));
            }

            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            let line = String::from_utf8(line)
                .map_err(|err| Error::MalformedFrame(format!("Frame isn't valid UTF-8: {err}")))?;
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }

            return Ok(Some(line.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn split_and_coalesced_lines() {
        let mut lines = LineBuffer::default();
        lines.extend(b"{\"a\":1}\n{\"b\"");
        assert_eq!(lines.next_line().unwrap(), Some("{\"a\":1}".to_string()));
        assert_eq!(lines.next_line().unwrap(), None);

        lines.extend(b":2}\r\n\n{\"c\":3}\n");
        assert_eq!(lines.next_line().unwrap(), Some("{\"b\":2}".to_string()));
        assert_eq!(lines.next_line().unwrap(), Some("{\"c\":3}".to_string()));
        assert_eq!(lines.next_line().unwrap(), None);
    }

    /// A large frame that trickles in packet by packet is put back together,
    /// even if its newline arrives in a separate chunk.
    #[test]
    fn large_frame_in_packets() {
        let frame = "x".repeat(100 * PACKET_SIZE + 17);
        let mut lines = LineBuffer::default();
        for chunk in frame.as_bytes().chunks(PACKET_SIZE) {
            lines.extend(chunk);
            assert_eq!(lines.next_line().unwrap(), None);
        }

        lines.extend(b"\n{\"next\"");
        assert_eq!(lines.next_line().unwrap().map(|line| line.len()), Some(frame.len()));
        assert_eq!(lines.next_line().unwrap(), None);
        lines.extend(b":1}\n");
        assert_eq!(lines.next_line().unwrap(), Some("{\"next\":1}".to_string()));
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        let mut lines = LineBuffer::default();
        lines.extend(&[0xff, 0xfe, b'\n', b'o', b'k', b'\n']);
        assert!(matches!(lines.next_line(), Err(Error::MalformedFrame(_))));
        // The broken line has been consumed, the next one is still fine.
        assert_eq!(lines.next_line().unwrap(), Some("ok".to_string()));
    }

    #[test]
    fn oversized_line_is_rejected() {
        let mut lines = LineBuffer::default();
        lines.extend(&vec![b'a'; MAX_FRAME_SIZE + 1]);
        assert!(matches!(lines.next_line(), Err(Error::MessageTooBig(_, _))));
    }
}
