//! alertr-lib errors.
use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Error while building path: {0}")]
    InvalidPath(String),

    /// Any errors regarding the certificate setup.
    #[error("Invalid or malformed certificate: {0}")]
    CertificateFailure(String),

    /// The transport is gone or unusable.
    /// This is fatal for the channel it occurred on.
    #[error("{0}")]
    Connection(String),

    /// No data arrived within the deadline. The channel is still usable.
    #[error("Timed out while waiting for data")]
    RecvTimeout,

    /// A frame or envelope couldn't be decoded.
    /// Only the current handshake is aborted by this.
    #[error("Received malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Couldn't serialize message:\n{0}")]
    MessageSerialization(String),

    #[error("Received frame of {0} bytes with only {1} being allowed.")]
    MessageTooBig(usize, usize),

    /// The other side rejected our greeting or sent something unexpected during it.
    #[error("Greeting failed: {0}")]
    Greeting(String),

    #[error("Error while reading configuration:\n{0}")]
    ConfigDeserialization(String),

    #[error("Some error occurred. {0}")]
    Generic(String),

    #[error("I/O error while {0}:\n{1}")]
    IoError(String, std::io::Error),

    #[error("Unexpected I/O error:\n{0}")]
    RawIoError(#[from] std::io::Error),

    #[error("I/O error at path {0:?} while {1}:\n{2}")]
    IoPathError(PathBuf, &'static str, std::io::Error),

    /// Thrown if one tries to create the unix socket, but it already exists.
    /// Another server instance might be already running.
    #[error(
        "There seems to be an active alertr server.\n\
            If you're sure there isn't, please remove the \
            socket manually."
    )]
    UnixSocketExists,
}

impl Error {
    /// Whether this error means the underlying transport can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::RecvTimeout | Error::MalformedFrame(_))
    }
}
