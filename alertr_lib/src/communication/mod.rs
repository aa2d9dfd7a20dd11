//! The message exchange between two peers.
//!
//! Each application message is transferred in a handshake of four frames:
//!
//! 1. sender → receiver: `rts` (request to send), announcing the envelope's size.
//! 2. receiver → sender: `cts` (clear to send).
//! 3. sender → receiver: `request`, carrying the envelope.
//! 4. receiver → sender: `response`, carrying the outcome.
//!
//! A [`Communication`] drives one channel. Any number of threads may send via
//! [`Communication::send_request`], but only one outbound handshake is in flight at a time.
//! All incoming frames are handled by a single background reader loop, which also services
//! handshakes that are initiated by the remote peer. Their results end up in an inbound queue,
//! which is consumed via [`Communication::recv_request`].
//!
//! Failures never surface as errors to callers. They're reflected in the state of the returned
//! [`Promise`] or [`MsgRequest`] instead, while [`Communication::has_channel`] tells whether the
//! channel is still usable. Re-establishing a channel is up to the caller
//! (see [`crate::watchdog`]).
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::channel::{ChannelReader, ChannelWriter, GenericChannel};
use crate::error::Error;
use crate::internal_prelude::*;
use crate::message::{Envelope, Frame, TransactionResult, unix_timestamp};

mod promise;
mod queue;
mod reader;

pub use promise::{Promise, PromiseState};
pub use queue::{MsgRequest, MsgState};
use queue::InboundQueue;

/// Timing and role of a [`Communication`].
#[derive(Clone, Debug)]
pub struct CommunicationConfig {
    /// The server wins whenever both peers start a handshake at the same time.
    pub is_server: bool,
    /// How long the sender waits for the `cts` and for the `response`, each.
    pub handshake_timeout: Duration,
    /// How long the receiver waits for the `request` after sending its `cts`.
    pub inbound_timeout: Duration,
    /// The receive timeout of the reader loop.
    /// This bounds how long it takes the loop to notice a shutdown.
    pub poll_interval: Duration,
    /// Envelopes whose `msgTime` is further away from the local time are answered as expired.
    pub msg_expiration: u64,
    /// The range of the random delay a withdrawn sender waits before its next `rts`.
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl CommunicationConfig {
    pub fn client() -> Self {
        CommunicationConfig {
            is_server: false,
            handshake_timeout: Duration::from_secs(20),
            inbound_timeout: Duration::from_secs(20),
            poll_interval: Duration::from_millis(500),
            msg_expiration: 600,
            backoff_min: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(2000),
        }
    }

    pub fn server() -> Self {
        CommunicationConfig {
            is_server: true,
            backoff_min: Duration::ZERO,
            backoff_max: Duration::from_millis(500),
            ..Self::client()
        }
    }

    fn backoff(&self) -> Duration {
        if self.backoff_max <= self.backoff_min {
            return self.backoff_min;
        }
        rand::rng().random_range(self.backoff_min..=self.backoff_max)
    }
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self::client()
    }
}

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn ChannelWriter>>>;

/// Where the current outbound handshake stands.
/// Only the reader loop moves a handshake out of the waiting phases.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub(crate) enum OutboundPhase {
    AwaitingCts,
    ClearToSend,
    AwaitingResponse,
    Completed(TransactionResult),
    /// The peer started a handshake at the same time and has precedence.
    Withdrawn,
}

#[derive(Debug)]
pub(crate) struct Outbound {
    pub id: u32,
    pub phase: OutboundPhase,
}

pub(crate) struct State {
    pub connected: bool,
    /// Incremented each time a channel is armed or torn down.
    /// Threads that belong to an older generation must not touch the state any longer.
    pub generation: u64,
    pub writer: Option<SharedWriter>,
    /// The reading half of an installed channel that hasn't been armed yet.
    pub unarmed_reader: Option<Box<dyn ChannelReader>>,
    pub outbound: Option<Outbound>,
    /// Ticket lock that serializes outbound handshakes in call order.
    pub next_ticket: u64,
    pub serving: u64,
    pub in_flight: usize,
    pub max_in_flight: usize,
    pub last_communication: i64,
    pub shutdown: bool,
}

pub(crate) struct Shared {
    pub config: CommunicationConfig,
    pub state: Mutex<State>,
    /// Signalled on every change of `state`.
    pub changed: Condvar,
    pub queue: InboundQueue,
}

impl Shared {
    pub fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for a state change. Returns `None` once the deadline has passed.
    pub fn wait_until<'a>(
        &self,
        state: MutexGuard<'a, State>,
        deadline: Instant,
    ) -> Option<MutexGuard<'a, State>> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return None;
        }
        let (state, _) = self
            .changed
            .wait_timeout(state, remaining)
            .unwrap_or_else(PoisonError::into_inner);
        Some(state)
    }

    /// The channel of `generation` broke. All waiting threads are woken up to notice.
    pub fn disconnect(&self, generation: u64, reason: &str) {
        let mut state = self.lock();
        if state.generation != generation || !state.connected {
            return;
        }

        warn!("Lost connection: {reason}");
        state.connected = false;
        state.generation += 1;
        let writer = state.writer.take();
        drop(state);

        if let Some(writer) = writer {
            close_writer(&writer);
        }
        self.queue.set_closed(true);
        self.changed.notify_all();
    }
}

fn close_writer(writer: &SharedWriter) {
    writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .close();
}

/// Send a frame. Frames are written in one piece, so concurrent writers can't interleave.
pub(crate) fn send_frame(writer: &SharedWriter, frame: &Frame) -> Result<(), Error> {
    let text = frame.encode()?;
    trace!("Sending frame: {text}");
    writer
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .send(&text)
}

/// Why an outbound handshake failed.
enum HandshakeFailure {
    /// The peer didn't answer in time. The channel is still considered usable.
    Timeout,
    /// The channel was torn down or replaced.
    Disconnected,
    /// The receiver answered with anything but `ok`.
    Rejected(TransactionResult),
}

/// The message exchange with one peer. See the [module documentation](self) for details.
pub struct Communication {
    shared: Arc<Shared>,
}

impl Communication {
    /// Create a new instance without channel.
    /// Use [`Communication::install_channel`] and [`Communication::set_connected`] to arm it.
    pub fn new(config: CommunicationConfig) -> Self {
        Communication {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State {
                    connected: false,
                    generation: 0,
                    writer: None,
                    unarmed_reader: None,
                    outbound: None,
                    next_ticket: 0,
                    serving: 0,
                    in_flight: 0,
                    max_in_flight: 0,
                    last_communication: 0,
                    shutdown: false,
                }),
                changed: Condvar::new(),
                queue: InboundQueue::new(),
            }),
        }
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.shared.config
    }

    /// Install a fresh channel.
    ///
    /// Any previous channel is closed and everybody that's still waiting on it is released.
    /// The new channel can be used with [`Communication::send_raw`] and
    /// [`Communication::recv_raw`] right away, the handshake based exchange only starts after
    /// [`Communication::set_connected`].
    pub fn install_channel(&self, channel: GenericChannel) -> Result<(), Error> {
        let (reader, writer) = channel.split()?;

        let mut state = self.shared.lock();
        let old_writer = state.writer.replace(Arc::new(Mutex::new(writer)));
        state.connected = false;
        state.generation += 1;
        state.outbound = None;
        state.unarmed_reader = Some(reader);
        drop(state);

        if let Some(old_writer) = old_writer {
            debug!("Replacing existing channel");
            close_writer(&old_writer);
        }
        self.shared.queue.set_closed(true);
        self.shared.changed.notify_all();

        Ok(())
    }

    /// Arm the installed channel and start the reader loop.
    ///
    /// Calling this on an already armed instance doesn't change anything.
    /// Promises from before the last failure stay failed.
    pub fn set_connected(&self) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(Error::Connection("Communication has been closed.".into()));
        }
        let Some(reader) = state.unarmed_reader.take() else {
            if state.connected {
                return Ok(());
            }
            return Err(Error::Connection(
                "There's no channel that could be armed.".into(),
            ));
        };

        state.generation += 1;
        state.connected = true;
        state.outbound = None;
        state.last_communication = unix_timestamp();
        let generation = state.generation;
        let Some(writer) = state.writer.clone() else {
            state.connected = false;
            return Err(Error::Connection("Installed channel has no writer.".into()));
        };
        drop(state);

        self.shared.queue.set_closed(false);
        self.shared.changed.notify_all();

        let shared = self.shared.clone();
        let spawned = thread::Builder::new()
            .name("alertr-reader".into())
            .spawn(move || reader::run(shared, reader, writer, generation));

        if let Err(err) = spawned {
            self.shared.disconnect(generation, "failed to spawn reader loop");
            return Err(Error::IoError("spawning reader loop".to_string(), err));
        }

        info!("Communication is connected");
        Ok(())
    }

    /// Whether the channel is armed and usable.
    pub fn has_channel(&self) -> bool {
        self.shared.lock().connected
    }

    /// Unix timestamp of the last completed handshake, in either direction.
    pub fn last_communication(&self) -> i64 {
        self.shared.lock().last_communication
    }

    /// The highest number of outbound handshakes that have ever been in flight at once.
    pub fn max_concurrent_handshakes(&self) -> usize {
        self.shared.lock().max_in_flight
    }

    /// The number of inbound results that are waiting to be consumed.
    pub fn queued_requests(&self) -> usize {
        self.shared.queue.len()
    }

    /// Send a message to the peer.
    ///
    /// Blocks until the handshake has finished or failed. The returned promise is resolved in
    /// all cases, except if the instance is torn down mid-handshake from another thread.
    pub fn send_request(&self, message_type: &str, envelope_text: &str) -> Promise {
        let promise = Promise::new(message_type, envelope_text);

        if !self.has_channel() {
            debug!("Not connected, dropping '{}' message", promise.msg_type());
            promise.set_failed();
            return promise;
        }

        let envelope = match Envelope::from_json(envelope_text) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("Refusing to send invalid '{}' envelope: {err}", promise.msg_type());
                promise.set_failed();
                return promise;
            }
        };

        let Some(generation) = self.acquire_send_slot() else {
            debug!("Connection lost while waiting to send '{}'", promise.msg_type());
            promise.set_failed();
            return promise;
        };

        let result = self.handshake(generation, promise.msg_type(), envelope);
        self.release_send_slot();

        match result {
            Ok(()) => promise.set_success(),
            Err(HandshakeFailure::Timeout) => {
                warn!("Timed out while sending '{}' message", promise.msg_type());
                promise.set_failed();
            }
            Err(HandshakeFailure::Disconnected) => {
                warn!("Connection lost while sending '{}' message", promise.msg_type());
                promise.set_failed();
            }
            Err(HandshakeFailure::Rejected(result)) => {
                warn!("Peer answered '{}' message with {result}", promise.msg_type());
                promise.set_failed();
            }
        }

        promise
    }

    /// Wait for the next result of a handshake that was initiated by the peer.
    ///
    /// Returns `None` if nothing arrived within `timeout`.
    /// Returns immediately while disconnected and no results are left.
    pub fn recv_request(&self, timeout: Duration) -> Option<MsgRequest> {
        self.shared.queue.pop(timeout)
    }

    /// Send a line on an installed channel that isn't armed yet.
    ///
    /// Only used for the greeting, before the peers exchange any frames.
    pub fn send_raw(&self, text: &str) -> Result<(), Error> {
        if text.contains('\n') {
            return Err(Error::MessageSerialization(
                "Raw messages must not contain line breaks.".into(),
            ));
        }

        let writer = {
            let state = self.shared.lock();
            if state.connected {
                return Err(Error::Generic(
                    "Raw messages can only be sent before the channel is armed.".into(),
                ));
            }
            state
                .writer
                .clone()
                .ok_or_else(|| Error::Connection("There's no installed channel.".into()))?
        };

        writer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .send(text)
    }

    /// Receive a line on an installed channel that isn't armed yet.
    pub fn recv_raw(&self, timeout: Duration) -> Result<String, Error> {
        let mut reader = self
            .shared
            .lock()
            .unarmed_reader
            .take()
            .ok_or_else(|| Error::Connection("There's no unarmed channel.".into()))?;

        let result = reader.recv(timeout);

        // Put it back, unless the channel has been replaced in the meantime.
        let mut state = self.shared.lock();
        if state.unarmed_reader.is_none() && !state.connected && state.writer.is_some() {
            state.unarmed_reader = Some(reader);
        }

        result
    }

    /// Tear down the current channel.
    ///
    /// Results that have already been received can still be consumed.
    pub fn close(&self) {
        let mut state = self.shared.lock();
        state.shutdown = true;
        state.connected = false;
        state.generation += 1;
        state.unarmed_reader = None;
        let writer = state.writer.take();
        drop(state);

        if let Some(writer) = writer {
            close_writer(&writer);
        }
        self.shared.queue.set_closed(true);
        self.shared.changed.notify_all();
    }

    /// Wait for our turn to send. Returns the generation that's allowed to send.
    fn acquire_send_slot(&self) -> Option<u64> {
        let mut state = self.shared.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        while state.serving != ticket {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }

        if !state.connected {
            drop(state);
            self.release_send_slot();
            return None;
        }

        Some(state.generation)
    }

    fn release_send_slot(&self) {
        let mut state = self.shared.lock();
        state.serving += 1;
        drop(state);
        self.shared.changed.notify_all();
    }

    fn handshake(
        &self,
        generation: u64,
        message_type: &str,
        envelope: Envelope,
    ) -> Result<(), HandshakeFailure> {
        let config = &self.shared.config;
        let size = envelope
            .to_json()
            .map(|text| text.len())
            .map_err(|_| HandshakeFailure::Rejected(TransactionResult::Error))?;
        let cts_deadline = Instant::now() + config.handshake_timeout;

        // Phase 1 and 2. This is repeated, whenever we have to give way to the peer.
        let (id, writer) = loop {
            let id: u32 = rand::random();
            let writer = self.begin_outbound(generation, id)?;

            if let Err(err) = send_frame(&writer, &Frame::rts(message_type, id, size)) {
                self.finish_outbound(generation, false);
                self.shared.disconnect(generation, &err.to_string());
                return Err(HandshakeFailure::Disconnected);
            }
            debug!("Sent rts {id} for '{message_type}'");

            match self.wait_for_phase(generation, cts_deadline, |phase| {
                phase != OutboundPhase::AwaitingCts
            }) {
                Ok(OutboundPhase::ClearToSend) => break (id, writer),
                Ok(OutboundPhase::Withdrawn) => {
                    self.finish_outbound(generation, false);
                    let backoff = config.backoff();
                    debug!("Withdrew rts {id}, retrying in {}ms", backoff.as_millis());
                    self.sleep(generation, (Instant::now() + backoff).min(cts_deadline))?;
                    if Instant::now() >= cts_deadline {
                        return Err(HandshakeFailure::Timeout);
                    }
                }
                Ok(phase) => {
                    self.finish_outbound(generation, false);
                    error!("Unexpected outbound phase {phase:?} while waiting for cts");
                    return Err(HandshakeFailure::Rejected(TransactionResult::Error));
                }
                Err(failure) => {
                    self.finish_outbound(generation, false);
                    return Err(failure);
                }
            }
        };

        // Phase 3 and 4.
        {
            let mut state = self.shared.lock();
            if state.generation != generation {
                drop(state);
                self.finish_outbound(generation, false);
                return Err(HandshakeFailure::Disconnected);
            }
            if let Some(outbound) = state.outbound.as_mut() {
                outbound.phase = OutboundPhase::AwaitingResponse;
            }
        }

        if let Err(err) = send_frame(&writer, &Frame::request(id, envelope)) {
            self.finish_outbound(generation, false);
            self.shared.disconnect(generation, &err.to_string());
            return Err(HandshakeFailure::Disconnected);
        }

        let response_deadline = Instant::now() + config.handshake_timeout;
        let result = self.wait_for_phase(generation, response_deadline, |phase| {
            matches!(phase, OutboundPhase::Completed(_))
        });

        match result {
            Ok(OutboundPhase::Completed(TransactionResult::Ok)) => {
                self.finish_outbound(generation, true);
                debug!("Handshake {id} for '{message_type}' finished");
                Ok(())
            }
            Ok(OutboundPhase::Completed(result)) => {
                self.finish_outbound(generation, false);
                Err(HandshakeFailure::Rejected(result))
            }
            Ok(_) => {
                self.finish_outbound(generation, false);
                Err(HandshakeFailure::Rejected(TransactionResult::Error))
            }
            Err(failure) => {
                self.finish_outbound(generation, false);
                Err(failure)
            }
        }
    }

    /// Register a new outbound handshake, which is then visible to the reader loop.
    fn begin_outbound(&self, generation: u64, id: u32) -> Result<SharedWriter, HandshakeFailure> {
        let mut state = self.shared.lock();
        if state.generation != generation || !state.connected {
            return Err(HandshakeFailure::Disconnected);
        }
        let writer = state
            .writer
            .clone()
            .ok_or(HandshakeFailure::Disconnected)?;

        state.outbound = Some(Outbound {
            id,
            phase: OutboundPhase::AwaitingCts,
        });
        state.in_flight += 1;
        state.max_in_flight = state.max_in_flight.max(state.in_flight);

        Ok(writer)
    }

    fn finish_outbound(&self, generation: u64, success: bool) {
        let mut state = self.shared.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.generation == generation {
            state.outbound = None;
            if success {
                state.last_communication = unix_timestamp();
            }
        }
    }

    /// Block until the outbound handshake reaches a phase that matches `done`.
    fn wait_for_phase(
        &self,
        generation: u64,
        deadline: Instant,
        done: impl Fn(OutboundPhase) -> bool,
    ) -> Result<OutboundPhase, HandshakeFailure> {
        let mut state = self.shared.lock();
        loop {
            if state.generation != generation || !state.connected {
                return Err(HandshakeFailure::Disconnected);
            }
            let Some(outbound) = state.outbound.as_ref() else {
                return Err(HandshakeFailure::Disconnected);
            };
            if done(outbound.phase) {
                return Ok(outbound.phase);
            }

            state = self
                .shared
                .wait_until(state, deadline)
                .ok_or(HandshakeFailure::Timeout)?;
        }
    }

    /// Sleep until `deadline`, unless the channel goes away.
    fn sleep(&self, generation: u64, deadline: Instant) -> Result<(), HandshakeFailure> {
        let mut state = self.shared.lock();
        loop {
            if state.generation != generation || !state.connected {
                return Err(HandshakeFailure::Disconnected);
            }
            match self.shared.wait_until(state, deadline) {
                Some(next) => state = next,
                None => return Ok(()),
            }
        }
    }
}

impl Drop for Communication {
    fn drop(&mut self) {
        self.close();
    }
}
