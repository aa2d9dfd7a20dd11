use std::thread;
use std::time::{Duration, Instant};

use alertr::{node, server};
use alertr_lib::settings::Settings;
use color_eyre::Result;
use color_eyre::eyre::eyre;
use portpicker::pick_unused_port;
use tempfile::{Builder, TempDir};

/// Start a server with a fresh configuration in a temporary directory.
/// The returned settings are those of a node that's allowed to connect.
fn start_server() -> Result<(Settings, TempDir)> {
    let tempdir = Builder::new().prefix("alertr-").tempdir()?;
    let path = tempdir.path();

    let mut settings = Settings::default();
    settings.shared.alertr_directory = Some(path.to_path_buf());
    settings.shared.runtime_directory = Some(path.to_path_buf());
    settings.shared.host = "localhost".into();
    settings.shared.port = pick_unused_port()
        .ok_or_else(|| eyre!("There should be a free port"))?
        .to_string();
    settings
        .server
        .users
        .insert("sensor".into(), "secret".into());
    settings.client.username = "sensor".into();
    settings.client.password = "secret".into();
    settings.client.instance = "garage".into();

    let config_path = path.join("alertr.yml");
    settings.save(&Some(config_path.clone()))?;
    thread::spawn(move || server::run(Some(config_path), None, true));

    // Wait until the server has created its certificate and accepts nodes.
    let start = Instant::now();
    while node::connect(&settings).is_err() {
        if start.elapsed() > Duration::from_secs(10) {
            return Err(eyre!("Server didn't start in time"));
        }
        thread::sleep(Duration::from_millis(50));
    }

    Ok((settings, tempdir))
}

#[test]
fn ping_server() -> Result<()> {
    better_panic::install();
    let (settings, _tempdir) = start_server()?;

    let (communication, _) = node::connect(&settings)?;
    node::ping(&communication, 3)?;

    Ok(())
}

#[test]
fn send_message() -> Result<()> {
    better_panic::install();
    let (settings, _tempdir) = start_server()?;

    let (communication, _) = node::connect(&settings)?;
    node::send(
        &communication,
        "sensoralert",
        r#"{"sensorId": 3, "state": 1, "hasOptionalData": false}"#,
    )?;

    // Payloads have to be objects.
    assert!(node::send(&communication, "sensoralert", "[1, 2]").is_err());
    assert!(communication.has_channel());

    Ok(())
}

#[test]
fn wrong_password() -> Result<()> {
    better_panic::install();
    let (mut settings, _tempdir) = start_server()?;

    settings.client.password = "wrong".into();
    assert!(node::connect(&settings).is_err());

    Ok(())
}
