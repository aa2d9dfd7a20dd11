//! Keeps a node's connection to the server alive.
//!
//! The [`ConnectionWatchdog`] periodically checks the [`Communication`]:
//!
//! - If the channel is gone, it reconnects via the node's [`Reconnect`] implementation until
//!   that succeeds.
//! - If nothing has been exchanged for a while, it sends a ping to detect dead channels.
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::communication::Communication;
use crate::error::Error;
use crate::internal_prelude::*;
use crate::message::{builder, unix_timestamp};

/// Every this many failed reconnects, the failure is escalated to an error.
const FAILURE_ESCALATION: u32 = 5;

/// How a node establishes a fresh channel to the server.
pub trait Reconnect: Send + Sync {
    /// Connect, perform the greeting and arm the communication.
    fn reconnect(&self, communication: &Communication) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct WatchdogConfig {
    /// How often the connection is checked.
    pub check_interval: Duration,
    /// How long to wait between two failed reconnects.
    pub retry_interval: Duration,
    /// Send a ping, if nothing has been exchanged for this long.
    pub ping_interval: Duration,
    /// Warn, if a ping takes longer than this.
    pub ping_delay_warning: Duration,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            check_interval: Duration::from_secs(5),
            retry_interval: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            ping_delay_warning: Duration::from_secs(10),
        }
    }
}

#[derive(Default)]
struct StopSignal {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    fn stop(&self) {
        *self.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.condvar.notify_all();
    }

    /// Sleep for `duration`. Returns `true`, if the watchdog should stop.
    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.stopped.lock().unwrap_or_else(PoisonError::into_inner);
        while !*stopped {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            stopped = self
                .condvar
                .wait_timeout(stopped, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }
}

/// Handle to the watchdog thread. The thread is stopped once this is dropped.
pub struct ConnectionWatchdog {
    signal: Arc<StopSignal>,
    handle: Option<JoinHandle<()>>,
}

impl ConnectionWatchdog {
    pub fn spawn(
        communication: Arc<Communication>,
        reconnect: Arc<dyn Reconnect>,
        config: WatchdogConfig,
    ) -> Result<Self, Error> {
        let signal = Arc::new(StopSignal::default());
        let watchdog = Watchdog {
            communication,
            reconnect,
            config,
            signal: signal.clone(),
            retries: 1,
        };

        let handle = thread::Builder::new()
            .name("alertr-watchdog".into())
            .spawn(move || watchdog.run())
            .map_err(|err| Error::IoError("spawning watchdog".to_string(), err))?;

        Ok(ConnectionWatchdog {
            signal,
            handle: Some(handle),
        })
    }

    /// Stop the watchdog and wait for its thread to finish.
    pub fn stop(&mut self) {
        self.signal.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Connection watchdog panicked.");
            }
        }
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Watchdog {
    communication: Arc<Communication>,
    reconnect: Arc<dyn Reconnect>,
    config: WatchdogConfig,
    signal: Arc<StopSignal>,
    /// The number of the current reconnect attempt.
    retries: u32,
}

impl Watchdog {
    fn run(mut self) {
        while !self.signal.sleep(self.config.check_interval) {
            if !self.communication.has_channel() {
                error!("Connection to server has died.");
                if !self.reconnect() {
                    break;
                }
                continue;
            }

            let idle = unix_timestamp() - self.communication.last_communication();
            if idle > self.config.ping_interval.as_secs() as i64 {
                debug!("Ping interval exceeded.");
                self.ping();
            }
        }

        info!("Exiting connection watchdog.");
    }

    /// Retry until the connection is back. Returns `false`, if the watchdog has been stopped.
    fn reconnect(&mut self) -> bool {
        loop {
            match self.reconnect.reconnect(&self.communication) {
                Ok(()) => {
                    info!("Reconnecting successful after {} attempts.", self.retries);
                    self.retries = 1;
                    return true;
                }
                Err(err) => {
                    if self.retries % FAILURE_ESCALATION == 0 {
                        error!(
                            "Still no connection to server after {} attempts: {err}",
                            self.retries
                        );
                    } else {
                        warn!(
                            "Reconnecting failed: {err}. Retrying in {}s.",
                            self.config.retry_interval.as_secs()
                        );
                    }
                    self.retries += 1;
                }
            }

            if self.signal.sleep(self.config.retry_interval) {
                return false;
            }
        }
    }

    /// Send a ping on a helper thread, so a stuck handshake can't block the watchdog.
    fn ping(&self) {
        let envelope = match builder::ping().to_json() {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("Failed to build ping message: {err}");
                return;
            }
        };

        let (sender, receiver) = mpsc::channel();
        let communication = self.communication.clone();
        let spawned = thread::Builder::new()
            .name("alertr-ping".into())
            .spawn(move || {
                let promise = communication.send_request("ping", &envelope);
                let _ = sender.send(promise);
            });
        if let Err(err) = spawned {
            error!("Failed to spawn ping thread: {err}");
            return;
        }

        match receiver.recv_timeout(self.config.ping_delay_warning) {
            Ok(promise) if promise.was_successful() => debug!("Ping successful."),
            Ok(_) => error!("Connection to server has died."),
            Err(_) => warn!(
                "Stopped waiting for ping response after {} seconds.",
                self.config.ping_delay_warning.as_secs()
            ),
        }
    }
}
