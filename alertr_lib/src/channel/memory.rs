//! An in-process channel pair.
//!
//! Both ends behave like a connected socket pair, but additionally allow to inject transport
//! failures at a specific handshake phase. This is what the protocol tests are built on.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ByteChannel, ChannelReader, ChannelWriter};
use crate::error::Error;
use crate::internal_prelude::*;
use crate::message::{Frame, FrameKind};

const SIMULATED_ERROR: &str = "Simulated connection error";

enum Packet {
    Data(String),
    /// The peer's connection broke while sending. The receiving end breaks as well.
    Fault,
}

/// Breaks a channel the next time a frame of a given kind is sent through it.
///
/// The sender gets a [`Error::Connection`] and the peer's next receive fails the same way.
/// Afterwards, both ends of the pair are unusable.
#[derive(Clone, Default, Debug)]
pub struct FaultInjector {
    pending: Arc<Mutex<Vec<FrameKind>>>,
}

impl FaultInjector {
    pub fn fail_next(&self, kind: FrameKind) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.push(kind);
        }
    }

    /// Remove a pending fault for this kind of frame. Returns whether there was one.
    fn take(&self, kind: FrameKind) -> bool {
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        match pending.iter().position(|pending| *pending == kind) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }
}

/// One end of an in-memory channel pair. Create one via [`pair`].
pub struct MemoryChannel {
    sender: Sender<Packet>,
    receiver: Receiver<Packet>,
    broken: Arc<AtomicBool>,
    faults: FaultInjector,
}

impl MemoryChannel {
    /// Access to the fault injection of this end.
    /// Faults registered here trigger when *this* end sends the frame.
    pub fn faults(&self) -> FaultInjector {
        self.faults.clone()
    }
}

/// Create two connected channel ends.
pub fn pair() -> (MemoryChannel, MemoryChannel) {
    let (left_sender, right_receiver) = channel();
    let (right_sender, left_receiver) = channel();
    let broken = Arc::new(AtomicBool::new(false));

    (
        MemoryChannel {
            sender: left_sender,
            receiver: left_receiver,
            broken: broken.clone(),
            faults: FaultInjector::default(),
        },
        MemoryChannel {
            sender: right_sender,
            receiver: right_receiver,
            broken,
            faults: FaultInjector::default(),
        },
    )
}

impl ByteChannel for MemoryChannel {
    fn split(
        self: Box<Self>,
    ) -> Result<(Box<dyn ChannelReader>, Box<dyn ChannelWriter>), Error> {
        let channel = *self;
        Ok((
            Box::new(MemoryReader {
                receiver: channel.receiver,
                broken: channel.broken.clone(),
            }),
            Box::new(MemoryWriter {
                sender: Some(channel.sender),
                broken: channel.broken,
                faults: channel.faults,
            }),
        ))
    }
}

struct MemoryReader {
    receiver: Receiver<Packet>,
    broken: Arc<AtomicBool>,
}

impl ChannelReader for MemoryReader {
    fn recv(&mut self, timeout: Duration) -> Result<String, Error> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Connection(SIMULATED_ERROR.into()));
        }

        match self.receiver.recv_timeout(timeout) {
            Ok(Packet::Data(data)) => Ok(data),
            Ok(Packet::Fault) => {
                self.broken.store(true, Ordering::SeqCst);
                Err(Error::Connection(SIMULATED_ERROR.into()))
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.broken.load(Ordering::SeqCst) {
                    return Err(Error::Connection(SIMULATED_ERROR.into()));
                }
                Err(Error::RecvTimeout)
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Connection("Peer closed the channel.".into()))
            }
        }
    }
}

struct MemoryWriter {
    sender: Option<Sender<Packet>>,
    broken: Arc<AtomicBool>,
    faults: FaultInjector,
}

impl ChannelWriter for MemoryWriter {
    fn send(&mut self, data: &str) -> Result<(), Error> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::Connection(SIMULATED_ERROR.into()));
        }
        let Some(sender) = &self.sender else {
            return Err(Error::Connection("Channel has been closed.".into()));
        };

        // Raw greeting messages aren't frames, those are never failed.
        if let Ok(frame) = Frame::decode(data) {
            if self.faults.take(frame.kind()) {
                debug!("Injecting fault while sending {} frame", frame.kind());
                self.broken.store(true, Ordering::SeqCst);
                let _ = sender.send(Packet::Fault);
                return Err(Error::Connection(SIMULATED_ERROR.into()));
            }
        }

        sender
            .send(Packet::Data(data.to_string()))
            .map_err(|_| Error::Connection("Peer closed the channel.".into()))
    }

    fn close(&mut self) {
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn data_flows_both_ways() -> Result<(), Error> {
        let (left, right) = pair();
        let (mut left_reader, mut left_writer) = Box::new(left).split()?;
        let (mut right_reader, mut right_writer) = Box::new(right).split()?;

        left_writer.send("to the right")?;
        right_writer.send("to the left")?;

        assert_eq!(right_reader.recv(Duration::from_secs(1))?, "to the right");
        assert_eq!(left_reader.recv(Duration::from_secs(1))?, "to the left");
        assert!(matches!(
            left_reader.recv(Duration::from_millis(10)),
            Err(Error::RecvTimeout)
        ));

        Ok(())
    }

    #[test]
    fn injected_fault_breaks_both_ends() -> Result<(), Error> {
        let (left, right) = pair();
        let faults = left.faults();
        let (_left_reader, mut left_writer) = Box::new(left).split()?;
        let (mut right_reader, mut right_writer) = Box::new(right).split()?;

        faults.fail_next(FrameKind::Cts);
        // Other frames pass.
        left_writer.send(&Frame::rts("ping", 1, 10).encode()?)?;
        assert!(right_reader.recv(Duration::from_secs(1)).is_ok());

        let result = left_writer.send(&Frame::cts("ping", 1).encode()?);
        assert!(matches!(result, Err(Error::Connection(_))));
        assert!(matches!(
            right_reader.recv(Duration::from_secs(1)),
            Err(Error::Connection(_))
        ));
        assert!(right_writer.send("anything").is_err());

        Ok(())
    }

    #[test]
    fn close_disconnects_peer() -> Result<(), Error> {
        let (left, right) = pair();
        let (_left_reader, mut left_writer) = Box::new(left).split()?;
        let (mut right_reader, _right_writer) = Box::new(right).split()?;

        left_writer.close();
        let result = right_reader.recv(Duration::from_secs(1));
        assert!(matches!(result, Err(Error::Connection(_))));

        Ok(())
    }
}
