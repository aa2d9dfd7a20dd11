use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use super::{
    ByteChannel, ChannelListener, ChannelReader, ChannelWriter, ConnectionSettings, GenericChannel,
    GenericListener, LineBuffer, ListenerSettings, PACKET_SIZE, WRITE_TIMEOUT,
};
use crate::{error::Error, internal_prelude::*};

/// The operations we need from a plain OS socket to turn it into a channel.
pub(crate) trait Socket: Read + Write + Send + Sized + 'static {
    fn try_clone_socket(&self) -> std::io::Result<Self>;
    fn set_read_deadline(&self, timeout: Duration) -> std::io::Result<()>;
    fn set_write_deadline(&self, timeout: Duration) -> std::io::Result<()>;
    fn shutdown_socket(&self) -> std::io::Result<()>;
}

impl Socket for TcpStream {
    fn try_clone_socket(&self) -> std::io::Result<Self> {
        self.try_clone()
    }

    fn set_read_deadline(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }

    fn set_write_deadline(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_write_timeout(Some(timeout))
    }

    fn shutdown_socket(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

#[cfg(unix)]
impl Socket for UnixStream {
    fn try_clone_socket(&self) -> std::io::Result<Self> {
        self.try_clone()
    }

    fn set_read_deadline(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_read_timeout(Some(timeout))
    }

    fn set_write_deadline(&self, timeout: Duration) -> std::io::Result<()> {
        self.set_write_timeout(Some(timeout))
    }

    fn shutdown_socket(&self) -> std::io::Result<()> {
        self.shutdown(Shutdown::Both)
    }
}

/// Socket timeouts are reported differently depending on the platform.
pub(crate) fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// A timed out write leaves a partial frame on the wire, so it's a broken connection.
pub(crate) fn send_error(context: &str, err: std::io::Error) -> Error {
    if is_timeout(&err) {
        Error::Connection(format!("Timed out while {context}. The peer stopped reading."))
    } else {
        Error::IoError(context.to_string(), err)
    }
}

pub(crate) struct SocketReader<S> {
    socket: S,
    lines: LineBuffer,
}

impl<S: Socket> ChannelReader for SocketReader<S> {
    fn recv(&mut self, timeout: Duration) -> Result<String, Error> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0; PACKET_SIZE];

        loop {
            if let Some(line) = self.lines.next_line()? {
                return Ok(line);
            }

            // A zero timeout would block forever on most platforms.
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::RecvTimeout);
            }
            self.socket
                .set_read_deadline(remaining)
                .map_err(|err| Error::IoError("setting read timeout".to_string(), err))?;

            match self.socket.read(&mut chunk) {
                Ok(0) => {
                    return Err(Error::Connection(
                        "Connection went away while receiving.".into(),
                    ));
                }
                Ok(received) => self.lines.extend(&chunk[..received]),
                Err(err) if is_timeout(&err) => return Err(Error::RecvTimeout),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(Error::IoError("receiving frame".to_string(), err)),
            }
        }
    }
}

pub(crate) struct SocketWriter<S> {
    socket: S,
}

impl<S: Socket> ChannelWriter for SocketWriter<S> {
    fn send(&mut self, data: &str) -> Result<(), Error> {
        let mut line = String::with_capacity(data.len() + 1);
        line.push_str(data);
        line.push('\n');

        self.socket
            .write_all(line.as_bytes())
            .map_err(|err| send_error("sending frame", err))?;
        self.socket
            .flush()
            .map_err(|err| send_error("flushing frame", err))
    }

    fn close(&mut self) {
        if let Err(err) = self.socket.shutdown_socket() {
            debug!("Failed to shut down socket: {err}");
        }
    }
}

/// Split a socket into a reader and a writer, that both operate on their own handle.
#[allow(clippy::type_complexity)]
fn split_socket<S: Socket>(
    socket: S,
    write_timeout: Duration,
) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error> {
    socket
        .set_write_deadline(write_timeout)
        .map_err(|err| Error::IoError("setting write timeout".to_string(), err))?;
    let reader = socket
        .try_clone_socket()
        .map_err(|err| Error::IoError("cloning socket handle".to_string(), err))?;

    Ok((
        Box::new(SocketReader {
            socket: reader,
            lines: LineBuffer::default(),
        }),
        Box::new(SocketWriter { socket }),
    ))
}

impl ByteChannel for TcpStream {
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error> {
        split_socket(*self, WRITE_TIMEOUT)
    }
}

#[cfg(unix)]
impl ByteChannel for UnixStream {
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error> {
        split_socket(*self, WRITE_TIMEOUT)
    }
}

impl ChannelListener for TcpListener {
    fn accept(&self) -> Result<GenericChannel, Error> {
        let (stream, _) = TcpListener::accept(self)
            .map_err(|err| Error::IoError("accepting new tcp connection".to_string(), err))?;
        Ok(Box::new(stream))
    }
}

#[cfg(unix)]
impl ChannelListener for UnixListener {
    fn accept(&self) -> Result<GenericChannel, Error> {
        let (stream, _) = UnixListener::accept(self)
            .map_err(|err| Error::IoError("accepting new unix connection".to_string(), err))?;
        Ok(Box::new(stream))
    }
}

fn connect_tcp(host: &str, port: &str) -> Result<TcpStream, Error> {
    let address = format!("{host}:{port}");
    TcpStream::connect(&address).map_err(|err| {
        Error::Connection(format!(
            "Failed to connect to the server on {address}. Did you start it?\n{err}"
        ))
    })
}

/// Get a new channel to the server. \
/// This can either be a UnixStream or a (TLS encrypted) TcpStream, depending on the settings.
pub fn get_client_channel(settings: &ConnectionSettings) -> Result<GenericChannel, Error> {
    match settings {
        #[cfg(unix)]
        ConnectionSettings::UnixSocket { path } => {
            let stream = UnixStream::connect(path).map_err(|err| {
                Error::IoPathError(path.clone(), "connecting to server. Did you start it?", err)
            })?;

            Ok(Box::new(stream))
        }
        ConnectionSettings::TcpSocket { host, port } => Ok(Box::new(connect_tcp(host, port)?)),
        #[cfg(feature = "tls")]
        ConnectionSettings::TlsTcpSocket {
            host,
            port,
            certificate,
            client_auth,
        } => {
            let tcp_stream = connect_tcp(host, port)?;
            let config = crate::tls::get_tls_client_config(certificate, client_auth.as_ref())?;

            // The TLS handshake itself happens once the channel is split.
            let channel =
                super::tls::TlsChannel::client(config, crate::tls::SERVER_NAME, tcp_stream)?;
            Ok(Box::new(channel))
        }
    }
}

/// Bind a new listener for incoming node connections.
pub fn get_listener(settings: &ListenerSettings) -> Result<GenericListener, Error> {
    match settings {
        #[cfg(unix)]
        ListenerSettings::UnixSocket { path, permissions } => {
            info!("Using unix socket at: {path:?}");

            // Check, if the socket already exists
            // In case it does, we have to check, if it's an active socket.
            // If it is, we have to throw an error, because another server is already running.
            // Otherwise, we can simply remove it.
            if path.exists() {
                if UnixStream::connect(path).is_ok() {
                    return Err(Error::UnixSocketExists);
                }

                std::fs::remove_file(path).map_err(|err| {
                    Error::IoPathError(path.clone(), "removing old socket", err)
                })?;
            }

            let listener = UnixListener::bind(path).map_err(|err| {
                Error::IoPathError(path.clone(), "binding unix socket to path", err)
            })?;

            if let Some(mode) = permissions {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(path, std::fs::Permissions::from_mode(*mode)).map_err(
                    |err| {
                        Error::IoPathError(path.clone(), "setting permissions on unix socket", err)
                    },
                )?;
            }

            Ok(Box::new(listener))
        }
        ListenerSettings::TcpSocket { host, port } => {
            let address = format!("{host}:{port}");
            warn!("Listening on unencrypted tcp socket: {address}");
            let listener = TcpListener::bind(&address)
                .map_err(|err| Error::IoError("binding tcp listener to address".to_string(), err))?;

            Ok(Box::new(listener))
        }
        #[cfg(feature = "tls")]
        ListenerSettings::TlsTcpSocket {
            host,
            port,
            identity,
        } => {
            let address = format!("{host}:{port}");
            info!("Binding to address: {address}");
            let tcp_listener = TcpListener::bind(&address)
                .map_err(|err| Error::IoError("binding tcp listener to address".to_string(), err))?;

            let config = crate::tls::get_tls_server_config(identity)?;

            Ok(Box::new(super::tls::TlsListener::new(tcp_listener, config)))
        }
    }
}
