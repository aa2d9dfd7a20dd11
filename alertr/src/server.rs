//! The server accepts nodes and handles each of them on its own thread.
use std::fs::create_dir_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use alertr_lib::Communication;
use alertr_lib::channel::{GenericChannel, GenericListener, get_listener};
use alertr_lib::error::Error;
use alertr_lib::greeting::server_greeting;
use alertr_lib::settings::{Settings, Shared};

use crate::internal_prelude::*;
use crate::received::log_request;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// The main entry point for the server logic.
/// It's basically the `main`, but publicly exported as a library.
/// That way we can properly do integration testing for the server.
///
/// The ctrlc handler can't be installed more than once per process, which is why it's skipped
/// during tests.
pub fn run(config_path: Option<PathBuf>, profile: Option<String>, test: bool) -> Result<()> {
    let (mut settings, config_found) =
        Settings::read(&config_path).wrap_err("Error while reading configuration.")?;

    // This probably means that alertr has been started for the first time and we have to
    // create a default config file once.
    if !config_found {
        if let Err(error) = settings.save(&config_path) {
            bail!("Failed saving config file: {error:?}.");
        }
    };

    if let Some(profile) = &profile {
        settings.load_profile(profile)?;
    }

    init_directories(&settings.shared.alertr_directory())?;
    if settings.server.users.is_empty() {
        warn!("No users are configured. Nodes won't be able to authenticate.");
    }

    let listener_settings = settings
        .shared
        .listener_settings()
        .wrap_err("Failed to prepare listener.")?;
    let listener = get_listener(&listener_settings).wrap_err("Failed to listen for nodes.")?;

    if !test {
        setup_signal_panic_handling(&settings)?;
    }

    info!("Waiting for nodes.");
    accept_incoming(listener, Arc::new(settings))
}

/// Initialize all directories needed for normal operation.
fn init_directories(alertr_dir: &Path) -> Result<()> {
    if !alertr_dir.exists() {
        create_dir_all(alertr_dir).map_err(|err| {
            Error::IoPathError(alertr_dir.to_path_buf(), "creating main directory", err)
        })?;
    }

    let certs_dir = alertr_dir.join("certs");
    if !certs_dir.exists() {
        create_dir_all(&certs_dir)
            .map_err(|err| Error::IoPathError(certs_dir, "creating certificate directory", err))?;
    }

    Ok(())
}

/// Accept nodes forever. Every node gets its own thread.
fn accept_incoming(listener: GenericListener, settings: Arc<Settings>) -> Result<()> {
    loop {
        let channel = match listener.accept() {
            Ok(channel) => channel,
            Err(err) => {
                warn!("Failed accepting node: {err}");
                continue;
            }
        };

        let settings = settings.clone();
        thread::Builder::new()
            .name("alertr-node".into())
            .spawn(move || {
                if let Err(err) = handle_node(channel, &settings) {
                    warn!("Connection to node ended: {err:?}");
                }
            })
            .wrap_err("Failed to spawn node thread.")?;
    }
}

/// Greet a freshly connected node and log everything it sends until it disconnects.
fn handle_node(channel: GenericChannel, settings: &Settings) -> Result<()> {
    let communication = Communication::new(settings.server.communication_config());
    communication.install_channel(channel)?;

    let greeting_timeout = Duration::from_secs(settings.server.greeting_timeout);
    let node = server_greeting(&communication, &settings.server.users, greeting_timeout)
        .wrap_err("Greeting failed.")?;
    communication.set_connected()?;

    let peer = format!("{} ({})", node.instance, node.username);
    info!(
        "{peer} connected as {} node with version {:.3}-{}",
        node.node_type, node.version, node.rev
    );

    loop {
        match communication.recv_request(POLL_INTERVAL) {
            Some(request) => log_request(&peer, &request),
            None if !communication.has_channel() => break,
            None => (),
        }
    }

    info!("{peer} disconnected");
    Ok(())
}

/// Setup signal handling and panic handling.
///
/// On SIGINT and SIGTERM as well as on panic, the unix socket is removed before exiting.
fn setup_signal_panic_handling(settings: &Settings) -> Result<()> {
    let shared = settings.shared.clone();
    ctrlc::set_handler(move || {
        socket_cleanup(&shared);
        std::process::exit(0);
    })?;

    let shared = settings.shared.clone();
    let orig_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        orig_hook(panic_info);
        socket_cleanup(&shared);
        std::process::exit(1);
    }));

    Ok(())
}

/// Remove the unix socket, if one is used.
fn socket_cleanup(shared: &Shared) {
    #[cfg(unix)]
    if shared.use_unix_socket {
        let path = shared.unix_socket_path();
        if path.exists() {
            if let Err(error) = std::fs::remove_file(&path) {
                eprintln!("Failed to remove unix socket {path:?}: {error}");
            }
        }
    }
    #[cfg(not(unix))]
    let _ = shared;
}
