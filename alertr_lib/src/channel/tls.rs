//! TLS encrypted TCP channels.
//!
//! rustls connections are plain state machines. Both halves of a split channel share the
//! connection state behind a mutex, which is only ever held while records are encrypted or
//! decrypted. Socket I/O happens outside of it: the reader blocks on its own socket handle,
//! while outgoing records are written through a second lock that owns the sending handle.
//! That way a writer that waits for a slow peer never stops the reader from draining the
//! peer's data.
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, Connection, ServerConfig, ServerConnection};

use super::socket::{is_timeout, send_error};
use super::{
    ByteChannel, ChannelListener, ChannelReader, ChannelWriter, GenericChannel, LineBuffer,
    PACKET_SIZE, WRITE_TIMEOUT,
};
use crate::{error::Error, internal_prelude::*};

/// A stalled peer must not block a node connection forever during the TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A TCP connection that's not yet gone through the TLS handshake.
/// The handshake happens on [`ByteChannel::split`].
pub struct TlsChannel {
    connection: Connection,
    stream: TcpStream,
}

impl TlsChannel {
    pub fn client(
        config: Arc<ClientConfig>,
        server_name: &str,
        stream: TcpStream,
    ) -> Result<Self, Error> {
        let server_name = ServerName::try_from(server_name)
            .map(|name| name.to_owned())
            .map_err(|err| Error::CertificateFailure(format!("Invalid server name: {err}")))?;
        let connection = ClientConnection::new(config, server_name)
            .map_err(|err| Error::Connection(format!("Failed to initialize tls:\n{err}.")))?;

        Ok(TlsChannel {
            connection: connection.into(),
            stream,
        })
    }

    pub fn server(config: Arc<ServerConfig>, stream: TcpStream) -> Result<Self, Error> {
        let connection = ServerConnection::new(config)
            .map_err(|err| Error::Connection(format!("Failed to initialize tls:\n{err}.")))?;

        Ok(TlsChannel {
            connection: connection.into(),
            stream,
        })
    }

    fn handshake(&mut self) -> Result<(), Error> {
        self.stream
            .set_read_timeout(Some(HANDSHAKE_TIMEOUT))
            .map_err(|err| Error::IoError("setting handshake timeout".to_string(), err))?;
        self.stream
            .set_write_timeout(Some(WRITE_TIMEOUT))
            .map_err(|err| Error::IoError("setting write timeout".to_string(), err))?;

        while self.connection.is_handshaking() {
            self.connection
                .complete_io(&mut self.stream)
                .map_err(|err| Error::Connection(format!("TLS handshake failed:\n{err}")))?;
        }

        Ok(())
    }
}

impl ByteChannel for TlsChannel {
    fn split(
        mut self: Box<Self>,
    ) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error> {
        self.handshake()?;

        let reader_stream = self
            .stream
            .try_clone()
            .map_err(|err| Error::IoError("cloning socket handle".to_string(), err))?;
        let TlsChannel { connection, stream } = *self;
        let connection = Arc::new(Mutex::new(connection));
        let output = Arc::new(Mutex::new(stream));

        Ok((
            Box::new(TlsReader {
                connection: connection.clone(),
                stream: reader_stream,
                output: output.clone(),
                lines: LineBuffer::default(),
                closed: false,
            }),
            Box::new(TlsWriter { connection, output }),
        ))
    }
}

fn lock(connection: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>, Error> {
    connection
        .lock()
        .map_err(|_| Error::Connection("TLS connection state is poisoned.".into()))
}

fn lock_output(output: &Mutex<TcpStream>) -> Result<MutexGuard<'_, TcpStream>, Error> {
    output
        .lock()
        .map_err(|_| Error::Connection("TLS socket handle is poisoned.".into()))
}

/// Take all pending TLS records out of the connection.
fn take_records(connection: &mut Connection) -> Result<Vec<u8>, Error> {
    let mut records = Vec::new();
    while connection.wants_write() {
        connection
            .write_tls(&mut records)
            .map_err(|err| Error::IoError("collecting tls records".to_string(), err))?;
    }
    Ok(records)
}

/// Push all pending TLS records to the socket.
/// The connection is only locked while records are taken out, never during the write.
fn flush_tls(connection: &Mutex<Connection>, stream: &mut TcpStream) -> Result<(), Error> {
    loop {
        let records = take_records(&mut *lock(connection)?)?;
        if records.is_empty() {
            break;
        }
        stream
            .write_all(&records)
            .map_err(|err| send_error("sending tls records", err))?;
    }
    stream
        .flush()
        .map_err(|err| send_error("flushing tls records", err))
}

struct TlsReader {
    connection: Arc<Mutex<Connection>>,
    stream: TcpStream,
    /// The sending handle, for records the connection produces on its own.
    output: Arc<Mutex<TcpStream>>,
    lines: LineBuffer,
    /// The peer sent a close_notify.
    closed: bool,
}

impl TlsReader {
    /// Move all decrypted data from the connection into the line buffer.
    fn drain_plaintext(&mut self, connection: &mut Connection) -> Result<(), Error> {
        let mut plaintext = [0; PACKET_SIZE];
        loop {
            match connection.reader().read(&mut plaintext) {
                Ok(0) => {
                    self.closed = true;
                    return Ok(());
                }
                Ok(read) => self.lines.extend(&plaintext[..read]),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(err) => return Err(Error::IoError("reading tls plaintext".to_string(), err)),
            }
        }
    }

    /// Feed raw bytes from the socket into the TLS state machine.
    fn process(&mut self, mut data: &[u8]) -> Result<(), Error> {
        let connection = self.connection.clone();
        {
            let mut connection = lock(&connection)?;
            while !data.is_empty() {
                connection
                    .read_tls(&mut data)
                    .map_err(|err| Error::IoError("reading tls records".to_string(), err))?;
                connection.process_new_packets().map_err(|err| {
                    Error::Connection(format!("Received invalid tls data:\n{err}"))
                })?;
                self.drain_plaintext(&mut connection)?;
            }
        }

        // Key updates and alerts might need an answer.
        // A busy writer sends them along with its own records, so never wait for it.
        let mut output = match self.output.try_lock() {
            Ok(output) => output,
            Err(TryLockError::WouldBlock) => return Ok(()),
            Err(TryLockError::Poisoned(_)) => {
                return Err(Error::Connection("TLS socket handle is poisoned.".into()));
            }
        };
        flush_tls(&connection, &mut output)
    }
}

impl ChannelReader for TlsReader {
    fn recv(&mut self, timeout: Duration) -> Result<String, Error> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0; PACKET_SIZE];

        loop {
            if let Some(line) = self.lines.next_line()? {
                return Ok(line);
            }
            if self.closed {
                return Err(Error::Connection(
                    "Connection has been closed by the peer.".into(),
                ));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::RecvTimeout);
            }
            self.stream
                .set_read_timeout(Some(remaining))
                .map_err(|err| Error::IoError("setting read timeout".to_string(), err))?;

            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Connection(
                        "Connection went away while receiving.".into(),
                    ));
                }
                Ok(received) => self.process(&chunk[..received])?,
                Err(err) if is_timeout(&err) => return Err(Error::RecvTimeout),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::IoError("receiving frame".to_string(), err)),
            }
        }
    }
}

struct TlsWriter {
    connection: Arc<Mutex<Connection>>,
    output: Arc<Mutex<TcpStream>>,
}

impl ChannelWriter for TlsWriter {
    fn send(&mut self, data: &str) -> Result<(), Error> {
        let mut line = String::with_capacity(data.len() + 1);
        line.push_str(data);
        line.push('\n');

        let mut output = lock_output(&self.output)?;
        // rustls only buffers a limited amount of records, so large frames are encrypted
        // and sent piece by piece.
        let mut remaining = line.as_bytes();
        while !remaining.is_empty() {
            let (accepted, records) = {
                let mut connection = lock(&self.connection)?;
                let accepted = connection
                    .writer()
                    .write(remaining)
                    .map_err(|err| Error::IoError("encrypting frame".to_string(), err))?;
                (accepted, take_records(&mut connection)?)
            };
            if accepted == 0 && records.is_empty() {
                return Err(Error::Connection(
                    "TLS connection doesn't accept any more data.".into(),
                ));
            }

            output
                .write_all(&records)
                .map_err(|err| send_error("sending frame", err))?;
            remaining = &remaining[accepted..];
        }

        flush_tls(&self.connection, &mut output)
    }

    fn close(&mut self) {
        let Ok(mut output) = lock_output(&self.output) else {
            return;
        };
        if let Ok(mut connection) = lock(&self.connection) {
            connection.send_close_notify();
        }
        if let Err(err) = flush_tls(&self.connection, &mut output) {
            debug!("Failed to send close notify: {err}");
        }
        if let Err(err) = output.shutdown(Shutdown::Both) {
            debug!("Failed to shut down socket: {err}");
        }
    }
}

/// Accepts TCP connections and wraps them into server side TLS channels.
pub struct TlsListener {
    listener: TcpListener,
    config: Arc<ServerConfig>,
}

impl TlsListener {
    pub fn new(listener: TcpListener, config: Arc<ServerConfig>) -> Self {
        TlsListener { listener, config }
    }
}

impl ChannelListener for TlsListener {
    fn accept(&self) -> Result<GenericChannel, Error> {
        let (stream, address) = self
            .listener
            .accept()
            .map_err(|err| Error::IoError("accepting new tcp connection".to_string(), err))?;
        debug!("Accepted tcp connection from {address}");

        Ok(Box::new(TlsChannel::server(self.config.clone(), stream)?))
    }
}
