use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use strum::Display;

use crate::message::{Envelope, unix_timestamp};

#[derive(PartialEq, Eq, Clone, Copy, Debug, Display)]
pub enum MsgState {
    Ok,
    /// The envelope arrived, but its timestamp was outside the expiration window.
    Expired,
    /// A handshake in which this peer was the receiver has been aborted.
    Error,
}

/// The result of one handshake that has been initiated by the remote peer.
#[derive(PartialEq, Clone, Debug)]
pub struct MsgRequest {
    pub state: MsgState,
    /// Always set for [`MsgState::Ok`] and [`MsgState::Expired`].
    pub envelope: Option<Envelope>,
    /// The id of the aborted transaction, if it was known at the time of failure.
    pub transaction_id: Option<u32>,
    pub time_received: i64,
}

impl MsgRequest {
    pub fn ok(transaction_id: u32, envelope: Envelope) -> Self {
        Self::new(MsgState::Ok, Some(envelope), Some(transaction_id))
    }

    pub fn expired(transaction_id: u32, envelope: Envelope) -> Self {
        Self::new(MsgState::Expired, Some(envelope), Some(transaction_id))
    }

    pub fn error(transaction_id: Option<u32>) -> Self {
        Self::new(MsgState::Error, None, transaction_id)
    }

    fn new(state: MsgState, envelope: Option<Envelope>, transaction_id: Option<u32>) -> Self {
        MsgRequest {
            state,
            envelope,
            transaction_id,
            time_received: unix_timestamp(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.state == MsgState::Ok
    }
}

#[derive(Default)]
struct QueueState {
    items: VecDeque<MsgRequest>,
    /// While closed, consumers don't wait for new items.
    closed: bool,
}

/// FIFO of inbound handshake results with a blocking pop.
pub(crate) struct InboundQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl InboundQueue {
    pub fn new() -> Self {
        InboundQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: true,
            }),
            condvar: Condvar::new(),
        }
    }

    pub fn push(&self, request: MsgRequest) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.items.push_back(request);
        self.condvar.notify_one();
    }

    /// Pop the oldest item.
    ///
    /// Waits up to `timeout` for an item, unless the queue is closed.
    /// Items that have been pushed before closing the queue are still returned.
    pub fn pop(&self, timeout: Duration) -> Option<MsgRequest> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        loop {
            if let Some(request) = state.items.pop_front() {
                return Some(request);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if state.closed || remaining.is_zero() {
                return None;
            }

            state = self
                .condvar
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn set_closed(&self, closed: bool) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.closed = closed;
        self.condvar.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .items
            .len()
    }
}
