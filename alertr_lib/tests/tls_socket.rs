#![cfg(feature = "tls")]
use std::thread;

use alertr_lib::channel::{GenericChannel, get_client_channel, get_listener};
use alertr_lib::prelude::*;
use color_eyre::Result;
use pretty_assertions::assert_eq;

mod helper;
use helper::*;

#[test]
fn greeting_and_exchange() -> Result<()> {
    better_panic::install();
    let (shared, _tempdir) = get_shared_settings(false);

    let (node, server, info) = greeted_pair(&shared)?;
    assert_eq!(info.username, "sensor");
    assert!(info.persistent);

    exchange_messages(&node, &server);

    Ok(())
}

/// Certificates are only created once and reused afterwards.
#[test]
fn certificates_are_reused() -> Result<()> {
    better_panic::install();
    let (shared, _tempdir) = get_shared_settings(false);

    shared.listener_settings()?;
    let certificate = std::fs::read(shared.server_cert())?;
    shared.listener_settings()?;
    assert_eq!(std::fs::read(shared.server_cert())?, certificate);

    Ok(())
}

/// A node that doesn't know the server's certificate can't connect.
#[test]
fn unknown_certificate() -> Result<()> {
    better_panic::install();
    let (shared, _tempdir) = get_shared_settings(false);
    let (other, _other_tempdir) = get_shared_settings(false);

    let listener = alertr_lib::channel::get_listener(&shared.listener_settings()?)?;
    other.listener_settings()?;
    let settings = alertr_lib::settings::Shared {
        server_cert: other.server_cert.clone(),
        ..shared.clone()
    };

    let server = std::thread::spawn(move || {
        let channel = listener.accept()?;
        alertr_lib::Communication::new(fast_config(true)).install_channel(channel)
    });

    let node = alertr_lib::Communication::new(fast_config(false));
    let result = alertr_lib::channel::get_client_channel(&settings.connection_settings()?)
        .and_then(|channel| node.install_channel(channel));
    assert!(result.is_err());
    assert!(server.join().unwrap().is_err());

    Ok(())
}

/// Both sides send a frame that's far larger than the socket buffers at the same time.
/// Neither writer may keep its reader from draining the other side's records.
#[test]
fn concurrent_large_frames() -> Result<()> {
    better_panic::install();
    let (shared, _tempdir) = get_shared_settings(false);
    let listener = get_listener(&shared.listener_settings()?)?;
    let frame = "a".repeat(2 * 2usize.pow(20));

    /// Send `frame` while another thread receives, and return what was received.
    fn exchange(channel: GenericChannel, frame: &str) -> Result<String> {
        let (mut reader, mut writer) = channel.split()?;
        let receiver = thread::spawn(move || reader.recv(TIMEOUT));
        writer.send(frame)?;
        let received = receiver.join().expect("Receiver thread panicked")?;
        Ok(received)
    }

    let server_frame = frame.clone();
    let server = thread::spawn(move || -> Result<String> {
        exchange(listener.accept()?, &server_frame)
    });
    let from_server = exchange(get_client_channel(&shared.connection_settings()?)?, &frame)?;
    let from_node = server.join().expect("Server thread panicked")?;

    assert_eq!(from_server.len(), frame.len());
    assert!(from_server == frame);
    assert!(from_node == frame);

    Ok(())
}
