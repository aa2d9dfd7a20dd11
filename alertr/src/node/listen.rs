use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use alertr_lib::watchdog::ConnectionWatchdog;
use alertr_lib::{Communication, Settings};

use super::ServerConnector;
use crate::internal_prelude::*;
use crate::received::log_request;

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Stay connected and log everything the server sends, until `shutdown` is set.
pub fn listen(
    communication: Arc<Communication>,
    connector: Arc<ServerConnector>,
    settings: &Settings,
    shutdown: &AtomicBool,
) -> Result<()> {
    let _watchdog = ConnectionWatchdog::spawn(
        communication.clone(),
        connector,
        settings.client.watchdog_config(),
    )?;

    while !shutdown.load(Ordering::SeqCst) {
        match communication.recv_request(POLL_INTERVAL) {
            Some(request) => log_request("server", &request),
            // Receiving returns right away while disconnected. The watchdog takes care of that.
            None if !communication.has_channel() => thread::sleep(POLL_INTERVAL),
            None => (),
        }
    }

    info!("Shutting down node.");
    communication.close();

    Ok(())
}
