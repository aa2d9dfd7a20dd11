#![allow(dead_code)]
use std::collections::HashMap;
use std::thread;
use std::time::Duration;

use alertr_lib::channel::memory::{FaultInjector, pair};
use alertr_lib::channel::{get_client_channel, get_listener};
use alertr_lib::greeting::{NodeIdentity, NodeInfo, NodeType, client_greeting, server_greeting};
use alertr_lib::prelude::*;
use alertr_lib::settings::*;
use portpicker::pick_unused_port;
use serde_json::json;
use tempfile::{Builder, TempDir};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn get_shared_settings(
    #[cfg_attr(not(unix), allow(unused_variables))] use_unix_socket: bool,
) -> (Shared, TempDir) {
    // Create a temporary directory used for testing.
    let tempdir = Builder::new().prefix("alertr_lib-").tempdir().unwrap();
    let tempdir_path = tempdir.path();

    std::fs::create_dir(tempdir_path.join("certs")).unwrap();

    let shared_settings = Shared {
        alertr_directory: Some(tempdir_path.to_path_buf()),
        runtime_directory: Some(tempdir_path.to_path_buf()),
        #[cfg(unix)]
        use_unix_socket,
        #[cfg(unix)]
        unix_socket_path: None,
        #[cfg(unix)]
        unix_socket_permissions: Some(0o700),
        host: "localhost".to_string(),
        port: pick_unused_port()
            .expect("There should be a free port")
            .to_string(),
        use_tls: true,
        server_cert: Some(tempdir_path.join("certs").join("server.cert")),
        server_key: Some(tempdir_path.join("certs").join("server.key")),
        client_cert: None,
        client_key: None,
        client_ca: None,
    };

    (shared_settings, tempdir)
}

/// Short timeouts, so failing tests don't hang for long.
pub fn fast_config(is_server: bool) -> CommunicationConfig {
    CommunicationConfig {
        is_server,
        handshake_timeout: TIMEOUT,
        inbound_timeout: TIMEOUT,
        poll_interval: Duration::from_millis(20),
        msg_expiration: 600,
        backoff_min: Duration::from_millis(5),
        backoff_max: Duration::from_millis(30),
    }
}

/// A node and a server that aren't connected yet.
pub fn unconnected() -> (Communication, Communication) {
    (
        Communication::new(fast_config(false)),
        Communication::new(fast_config(true)),
    )
}

/// Connect both sides via a fresh in-memory channel.
/// Returns the fault injectors of the node's and the server's end.
pub fn rearm(
    node: &Communication,
    server: &Communication,
) -> Result<(FaultInjector, FaultInjector), Error> {
    let (node_channel, server_channel) = pair();
    let faults = (node_channel.faults(), server_channel.faults());

    node.install_channel(Box::new(node_channel))?;
    server.install_channel(Box::new(server_channel))?;
    node.set_connected()?;
    server.set_connected()?;

    Ok(faults)
}

pub fn connected() -> (Communication, Communication) {
    let (node, server) = unconnected();
    rearm(&node, &server).unwrap();
    (node, server)
}

/// A sensor alert with a counter, so messages can be told apart.
pub fn numbered_message(number: u64) -> String {
    Envelope::new("sensoralert", json!({"number": number}).as_object().unwrap().clone())
        .to_json()
        .unwrap()
}

pub fn number_of(request: &MsgRequest) -> Option<u64> {
    request
        .envelope
        .as_ref()
        .and_then(|envelope| envelope.payload.get("number"))
        .and_then(|number| number.as_u64())
}

/// Wait until `condition` holds or the timeout passes.
pub fn wait_for(condition: impl Fn() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}

/// Consume everything that's currently queued.
pub fn drain(communication: &Communication) -> Vec<MsgRequest> {
    let mut requests = Vec::new();
    while let Some(request) = communication.recv_request(Duration::from_millis(200)) {
        requests.push(request);
    }
    requests
}

pub fn node_identity() -> NodeIdentity {
    NodeIdentity {
        username: "sensor".into(),
        password: "secret".into(),
        node_type: NodeType::Sensor,
        instance: "garage".into(),
        persistent: true,
    }
}

/// Connect a node and a server via real sockets, including the greeting.
/// Returns the armed node, the armed server and what the server knows about the node.
pub fn greeted_pair(shared: &Shared) -> color_eyre::Result<(Communication, Communication, NodeInfo)> {
    // The listener has to come first, as it creates the certificates the node trusts.
    let listener = get_listener(&shared.listener_settings()?)?;
    let connection_settings = shared.connection_settings()?;

    let server_handle = thread::spawn(move || -> Result<(Communication, NodeInfo), Error> {
        let channel = listener.accept()?;
        let server = Communication::new(fast_config(true));
        server.install_channel(channel)?;

        let users = HashMap::from([("sensor".to_string(), "secret".to_string())]);
        let info = server_greeting(&server, &users, TIMEOUT)?;
        server.set_connected()?;
        Ok((server, info))
    });

    let node = Communication::new(fast_config(false));
    node.install_channel(get_client_channel(&connection_settings)?)?;
    client_greeting(&node, &node_identity(), TIMEOUT)?;
    node.set_connected()?;

    let (server, info) = server_handle
        .join()
        .map_err(|_| color_eyre::eyre::eyre!("Server thread panicked"))??;

    Ok((node, server, info))
}

/// Send messages in both directions and check that they arrive.
pub fn exchange_messages(node: &Communication, server: &Communication) {
    for number in 0..5 {
        assert!(node.send_request("sensoralert", &numbered_message(number)).was_successful());
        assert!(server.send_request("sensoralert", &numbered_message(number)).was_successful());
    }

    let from_node: Vec<u64> = drain(server).iter().filter_map(number_of).collect();
    let from_server: Vec<u64> = drain(node).iter().filter_map(number_of).collect();
    assert_eq!(from_node, (0..5).collect::<Vec<_>>());
    assert_eq!(from_server, (0..5).collect::<Vec<_>>());
}
