//! The background loop that handles all incoming frames of an armed channel.
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{MsgRequest, OutboundPhase, Shared, SharedWriter, send_frame};
use crate::channel::ChannelReader;
use crate::error::Error;
use crate::internal_prelude::*;
use crate::message::{Envelope, Frame, FramePayload, TransactionResult, unix_timestamp};

/// A handshake that has been initiated by the peer and is waiting for its `request`.
struct Inbound {
    id: u32,
    message: String,
    deadline: Instant,
}

struct ReaderLoop {
    shared: Arc<Shared>,
    reader: Box<dyn ChannelReader>,
    writer: SharedWriter,
    generation: u64,
    inbound: Option<Inbound>,
}

pub(super) fn run(
    shared: Arc<Shared>,
    reader: Box<dyn ChannelReader>,
    writer: SharedWriter,
    generation: u64,
) {
    let mut reader_loop = ReaderLoop {
        shared,
        reader,
        writer,
        generation,
        inbound: None,
    };

    debug!("Reader loop {generation} started");
    reader_loop.run();
    debug!("Reader loop {generation} stopped");
}

impl ReaderLoop {
    fn run(&mut self) {
        loop {
            if !self.is_current() {
                self.abort_inbound("channel has been torn down");
                return;
            }
            self.check_inbound_deadline();

            let result = match self.reader.recv(self.next_timeout()) {
                Ok(text) => self.dispatch(&text),
                Err(Error::RecvTimeout) => continue,
                Err(Error::MalformedFrame(reason)) => self.malformed(&reason),
                Err(err) => Err(err),
            };

            // Only transport errors end up here.
            if let Err(err) = result {
                self.abort_inbound("transport error");
                self.shared.disconnect(self.generation, &err.to_string());
                return;
            }
        }
    }

    fn is_current(&self) -> bool {
        let state = self.shared.lock();
        state.generation == self.generation && state.connected
    }

    fn next_timeout(&self) -> Duration {
        let poll_interval = self.shared.config.poll_interval;
        match &self.inbound {
            Some(inbound) => inbound
                .deadline
                .saturating_duration_since(Instant::now())
                .clamp(Duration::from_millis(1), poll_interval),
            None => poll_interval,
        }
    }

    fn check_inbound_deadline(&mut self) {
        let expired = self
            .inbound
            .as_ref()
            .is_some_and(|inbound| inbound.deadline <= Instant::now());
        if expired {
            self.abort_inbound("peer didn't send request in time");
        }
    }

    /// Fail the open inbound handshake, if there's one.
    fn abort_inbound(&mut self, reason: &str) {
        if let Some(inbound) = self.inbound.take() {
            warn!(
                "Aborting inbound '{}' handshake {}: {reason}",
                inbound.message, inbound.id
            );
            self.shared.queue.push(MsgRequest::error(Some(inbound.id)));
        }
    }

    fn dispatch(&mut self, text: &str) -> Result<(), Error> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err) => return self.malformed(&err.to_string()),
        };
        trace!("Received frame: {text}");

        let message = frame.message;
        match frame.payload {
            FramePayload::Rts { id, size } => self.on_rts(&message, id, size),
            FramePayload::Cts { id } => {
                self.advance_outbound(id, OutboundPhase::AwaitingCts, OutboundPhase::ClearToSend);
                Ok(())
            }
            FramePayload::Request { id, envelope } => self.on_request(id, envelope),
            FramePayload::Response { id, result } => {
                self.advance_outbound(
                    id,
                    OutboundPhase::AwaitingResponse,
                    OutboundPhase::Completed(result),
                );
                Ok(())
            }
        }
    }

    fn on_rts(&mut self, message: &str, id: u32, size: usize) -> Result<(), Error> {
        {
            let mut state = self.shared.lock();
            if state.generation != self.generation {
                return Ok(());
            }

            // Both sides want to send at the same time. The server has precedence.
            if let Some(outbound) = state.outbound.as_mut() {
                if outbound.phase == OutboundPhase::AwaitingCts {
                    if self.shared.config.is_server {
                        info!(
                            "Discarding rts {id} for '{message}', own rts {} has precedence",
                            outbound.id
                        );
                        return Ok(());
                    }

                    debug!("Withdrawing rts {} in favor of rts {id}", outbound.id);
                    outbound.phase = OutboundPhase::Withdrawn;
                    self.shared.changed.notify_all();
                }
            }
        }

        // The peer gave up on the previous handshake. It still counts as an attempt.
        self.abort_inbound(&format!("superseded by rts {id}"));

        debug!("Received rts {id} for '{message}' ({size} bytes)");
        self.inbound = Some(Inbound {
            id,
            message: message.to_string(),
            deadline: Instant::now() + self.shared.config.inbound_timeout,
        });

        send_frame(&self.writer, &Frame::cts(message, id))
    }

    fn on_request(&mut self, id: u32, envelope: Envelope) -> Result<(), Error> {
        let Some(inbound) = self.inbound.take_if(|inbound| inbound.id == id) else {
            warn!(
                "Discarding '{}' request {id} without preceding rts",
                envelope.message_type()
            );
            return Ok(());
        };

        let expired = envelope.is_expired(unix_timestamp(), self.shared.config.msg_expiration);
        let result = if expired {
            TransactionResult::Expired
        } else {
            TransactionResult::Ok
        };

        if let Err(err) = send_frame(&self.writer, &Frame::response(&inbound.message, id, result)) {
            self.shared.queue.push(MsgRequest::error(Some(id)));
            return Err(err);
        }

        if expired {
            warn!(
                "Received expired '{}' message (msgTime {:?})",
                envelope.message_type(),
                envelope.msg_time
            );
            self.shared.queue.push(MsgRequest::expired(id, envelope));
        } else {
            debug!("Received '{}' message {id}", envelope.message_type());
            self.shared.queue.push(MsgRequest::ok(id, envelope));
        }

        let mut state = self.shared.lock();
        if state.generation == self.generation {
            state.last_communication = unix_timestamp();
        }

        Ok(())
    }

    /// Move our own outbound handshake forward, if the frame belongs to it.
    fn advance_outbound(&self, id: u32, expected: OutboundPhase, next: OutboundPhase) {
        let mut state = self.shared.lock();
        if state.generation != self.generation {
            return;
        }

        match state.outbound.as_mut() {
            Some(outbound) if outbound.id == id && outbound.phase == expected => {
                outbound.phase = next;
                self.shared.changed.notify_all();
            }
            _ => debug!("Discarding stale frame for handshake {id}"),
        }
    }

    /// A frame couldn't be decoded. Only an open inbound handshake is affected by this.
    fn malformed(&mut self, reason: &str) -> Result<(), Error> {
        let Some(inbound) = self.inbound.take() else {
            warn!("Discarding malformed frame: {reason}");
            return Ok(());
        };

        warn!(
            "Malformed frame during inbound '{}' handshake {}: {reason}",
            inbound.message, inbound.id
        );
        self.shared.queue.push(MsgRequest::error(Some(inbound.id)));

        send_frame(
            &self.writer,
            &Frame::response(&inbound.message, inbound.id, TransactionResult::Error),
        )
    }
}
