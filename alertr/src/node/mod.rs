//! Everything a node does.
//!
//! A node connects to the server, performs the greeting and then exchanges messages via the
//! handshake protocol. Long running nodes additionally keep the connection alive via the
//! [`ConnectionWatchdog`](alertr_lib::watchdog::ConnectionWatchdog).
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alertr_lib::channel::get_client_channel;
use alertr_lib::greeting::{NodeIdentity, client_greeting};
use alertr_lib::settings::Shared;
use alertr_lib::watchdog::{ConnectionWatchdog, Reconnect};
use alertr_lib::{Communication, Settings};

use crate::cli::SubCommand;
use crate::internal_prelude::*;

mod listen;
mod ping;
mod send;

pub use listen::listen;
pub use ping::ping;
pub use send::send;

/// Establishes the connection to the server, both initially and after failures.
pub struct ServerConnector {
    shared: Shared,
    identity: NodeIdentity,
    greeting_timeout: Duration,
}

impl ServerConnector {
    pub fn new(settings: &Settings) -> Self {
        ServerConnector {
            shared: settings.shared.clone(),
            identity: settings.client.identity(),
            greeting_timeout: Duration::from_secs(settings.client.greeting_timeout),
        }
    }
}

impl Reconnect for ServerConnector {
    fn reconnect(&self, communication: &Communication) -> Result<(), alertr_lib::Error> {
        let connection_settings = self.shared.connection_settings()?;
        let channel = get_client_channel(&connection_settings)?;
        communication.install_channel(channel)?;

        let server = client_greeting(communication, &self.identity, self.greeting_timeout)?;
        info!(
            "Registered as '{}' at server with version {:.3}-{}",
            self.identity.instance, server.version, server.rev
        );

        communication.set_connected()
    }
}

/// Connect to the server once. Fails if the server can't be reached.
pub fn connect(settings: &Settings) -> Result<(Arc<Communication>, Arc<ServerConnector>)> {
    let communication = Arc::new(Communication::new(settings.client.communication_config()));
    let connector = Arc::new(ServerConnector::new(settings));

    connector
        .reconnect(&communication)
        .wrap_err("Failed to connect to server.")?;

    Ok((communication, connector))
}

/// The entry point for all node subcommands.
pub fn run(
    subcommand: SubCommand,
    config_path: Option<PathBuf>,
    profile: Option<String>,
) -> Result<()> {
    let (mut settings, config_found) =
        Settings::read(&config_path).wrap_err("Failed to read configuration.")?;

    if let Some(profile) = &profile {
        settings.load_profile(profile)?;
    }

    // Without a configuration file, there are no credentials to authenticate with.
    if !config_found {
        bail!("Couldn't find a configuration file. Did you start the server yet?");
    }

    let (communication, connector) = connect(&settings)?;

    match subcommand {
        SubCommand::Ping { count } => {
            let _watchdog = ConnectionWatchdog::spawn(
                communication.clone(),
                connector,
                settings.client.watchdog_config(),
            )?;
            ping(&communication, count)
        }
        SubCommand::Send { message, payload } => send(&communication, &message, &payload),
        SubCommand::Node => {
            let shutdown = Arc::new(AtomicBool::new(false));
            let shutdown_clone = shutdown.clone();
            ctrlc::set_handler(move || shutdown_clone.store(true, Ordering::SeqCst))?;

            listen(communication, connector, &settings, &shutdown)
        }
        SubCommand::Server => bail!("The server isn't a node command."),
    }
}
