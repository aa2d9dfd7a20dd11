use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use strum::Display;

use crate::internal_prelude::*;
use crate::message::unix_timestamp;

#[derive(PartialEq, Eq, Clone, Copy, Debug, Display)]
pub enum PromiseState {
    Pending,
    Success,
    Failed,
}

/// The outcome of a single outbound message.
///
/// A promise is resolved exactly once, either by the handshake that transferred the message or
/// right away, if the message could never be sent. Later resolutions are ignored.
///
/// Cloning a promise is cheap, all clones observe the same state.
#[derive(Clone, Debug)]
pub struct Promise {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    msg: String,
    msg_type: String,
    created_at: i64,
    state: Mutex<PromiseState>,
    resolved: Condvar,
}

impl Promise {
    pub(crate) fn new(msg_type: &str, msg: &str) -> Self {
        Promise {
            inner: Arc::new(Inner {
                msg: msg.to_string(),
                msg_type: msg_type.to_lowercase(),
                created_at: unix_timestamp(),
                state: Mutex::new(PromiseState::Pending),
                resolved: Condvar::new(),
            }),
        }
    }

    /// The serialized envelope.
    pub fn msg(&self) -> &str {
        &self.inner.msg
    }

    /// The lowercase message type.
    pub fn msg_type(&self) -> &str {
        &self.inner.msg_type
    }

    pub fn created_at(&self) -> i64 {
        self.inner.created_at
    }

    pub fn state(&self) -> PromiseState {
        *self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait up to `timeout` for the promise to be resolved.
    /// Returns whether the promise is resolved, no matter the outcome.
    pub fn is_finished(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        while *state == PromiseState::Pending {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            state = self
                .inner
                .resolved
                .wait_timeout(state, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }

    /// `false` while the promise is still pending.
    pub fn was_successful(&self) -> bool {
        self.state() == PromiseState::Success
    }

    pub(crate) fn set_success(&self) {
        self.resolve(PromiseState::Success);
    }

    pub(crate) fn set_failed(&self) {
        self.resolve(PromiseState::Failed);
    }

    fn resolve(&self, new_state: PromiseState) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if *state != PromiseState::Pending {
            warn!(
                "Ignoring {new_state} for already resolved '{}' promise ({})",
                self.inner.msg_type, *state
            );
            return;
        }

        *state = new_state;
        self.inner.resolved.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn single_assignment() {
        let promise = Promise::new("Ping", "{}");
        assert_eq!(promise.msg_type(), "ping");
        assert_eq!(promise.state(), PromiseState::Pending);
        assert!(!promise.was_successful());

        promise.set_failed();
        promise.set_success();
        assert_eq!(promise.state(), PromiseState::Failed);
        assert!(promise.is_finished(Duration::ZERO));
    }

    #[test]
    fn is_finished_waits_for_resolution() {
        let promise = Promise::new("ping", "{}");
        assert!(!promise.is_finished(Duration::from_millis(20)));

        let resolver = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            resolver.set_success();
        });

        assert!(promise.is_finished(Duration::from_secs(5)));
        assert!(promise.was_successful());
        handle.join().unwrap();
    }
}
