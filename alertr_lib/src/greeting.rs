//! The greeting, which happens once after a channel has been established.
//!
//! The greeting is exchanged with [`Communication::send_raw`] and [`Communication::recv_raw`],
//! i.e. before the channel is armed. It consists of two steps, both initiated by the node:
//!
//! - Authentication: The node sends its credentials and protocol version.
//!   The server answers with its own version, if the credentials are valid and both versions
//!   are compatible.
//! - Registration: The node tells the server what kind of node it is.
//!
//! Any side that's unhappy with a message answers with an error message instead and gives up.
//! Both sides arm the channel via [`Communication::set_connected`] afterwards.
use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use strum::{Display, EnumString};

use crate::communication::Communication;
use crate::error::Error;
use crate::internal_prelude::*;
use crate::message::unix_timestamp;
use crate::{PROTOCOL_REVISION, PROTOCOL_VERSION};

const GREETING_MESSAGE: &str = "initialization";

/// The kinds of nodes that connect to a server.
#[derive(
    PartialEq, Eq, Clone, Copy, Debug, Default, Deserialize, Serialize, Display, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum NodeType {
    #[default]
    Sensor,
    Alert,
    Manager,
}

/// Everything a node presents about itself during the greeting.
#[derive(Clone, Debug)]
pub struct NodeIdentity {
    pub username: String,
    pub password: String,
    pub node_type: NodeType,
    pub instance: String,
    /// Persistent nodes are expected to be connected at all times.
    pub persistent: bool,
}

/// What the server learned about a node.
#[derive(PartialEq, Clone, Debug)]
pub struct NodeInfo {
    pub username: String,
    pub version: f64,
    pub rev: u32,
    pub node_type: NodeType,
    pub instance: String,
    pub persistent: bool,
}

/// What the node learned about the server.
#[derive(PartialEq, Clone, Debug)]
pub struct ServerInfo {
    pub version: f64,
    pub rev: u32,
}

/// Checks the credentials a node presents.
pub trait Authenticator {
    fn authenticate(&self, username: &str, password: &str) -> bool;
}

/// A simple username → password map.
impl Authenticator for HashMap<String, String> {
    fn authenticate(&self, username: &str, password: &str) -> bool {
        self.get(username)
            .is_some_and(|expected| expected.as_str() == password)
    }
}

/// Two versions are compatible, as long as their first decimal place matches.
pub fn is_compatible(own: f64, other: f64) -> bool {
    (own * 10.0).floor() == (other * 10.0).floor()
}

#[derive(Debug, Deserialize, Serialize)]
struct RawMessage {
    #[serde(rename = "msgTime", default, skip_serializing_if = "Option::is_none")]
    msg_time: Option<i64>,
    message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(PartialEq, Eq, Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
enum PayloadType {
    Request,
    Response,
}

#[derive(Debug, Deserialize, Serialize)]
struct AuthRequest {
    #[serde(rename = "type")]
    kind: PayloadType,
    version: f64,
    rev: u32,
    username: String,
    password: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct AuthResponse {
    #[serde(rename = "type")]
    kind: PayloadType,
    result: String,
    version: f64,
    rev: u32,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct Registration {
    #[serde(rename = "type")]
    kind: PayloadType,
    node_type: NodeType,
    instance: String,
    persistent: u8,
}

#[derive(Debug, Deserialize, Serialize)]
struct RegistrationResponse {
    #[serde(rename = "type")]
    kind: PayloadType,
    result: String,
}

/// Perform the greeting from the node's side.
pub fn client_greeting(
    communication: &Communication,
    identity: &NodeIdentity,
    timeout: Duration,
) -> Result<ServerInfo, Error> {
    debug!("Sending user credentials and version.");
    send(
        communication,
        &AuthRequest {
            kind: PayloadType::Request,
            version: PROTOCOL_VERSION,
            rev: PROTOCOL_REVISION,
            username: identity.username.clone(),
            password: identity.password.clone(),
        },
    )?;

    let response: AuthResponse = receive(communication, timeout)?;
    expect_ok(communication, response.kind, &response.result)?;
    debug!(
        "Received server version: '{:.3}-{}'",
        response.version, response.rev
    );
    if !is_compatible(PROTOCOL_VERSION, response.version) {
        reject(communication, "version not compatible");
        return Err(Error::Greeting(format!(
            "Version not compatible. Node has version '{PROTOCOL_VERSION:.3}-{PROTOCOL_REVISION}' \
             and server has '{:.3}-{}'",
            response.version, response.rev
        )));
    }
    let server = ServerInfo {
        version: response.version,
        rev: response.rev,
    };

    debug!("Sending registration message.");
    send(
        communication,
        &Registration {
            kind: PayloadType::Request,
            node_type: identity.node_type,
            instance: identity.instance.clone(),
            persistent: u8::from(identity.persistent),
        },
    )?;

    let response: RegistrationResponse = receive(communication, timeout)?;
    expect_ok(communication, response.kind, &response.result)?;

    Ok(server)
}

/// Perform the greeting from the server's side.
pub fn server_greeting(
    communication: &Communication,
    authenticator: &dyn Authenticator,
    timeout: Duration,
) -> Result<NodeInfo, Error> {
    let request: AuthRequest = receive(communication, timeout)?;
    if request.kind != PayloadType::Request {
        reject(communication, "request expected");
        return Err(Error::Greeting("Node didn't send a request.".into()));
    }

    debug!(
        "Received node version: '{:.3}-{}'",
        request.version, request.rev
    );
    if !is_compatible(PROTOCOL_VERSION, request.version) {
        reject(communication, "version not compatible");
        return Err(Error::Greeting(format!(
            "Version not compatible. Node has version '{:.3}-{}' \
             and server has '{PROTOCOL_VERSION:.3}-{PROTOCOL_REVISION}'",
            request.version, request.rev
        )));
    }

    if !authenticator.authenticate(&request.username, &request.password) {
        reject(communication, "invalid credentials");
        return Err(Error::Greeting(format!(
            "Invalid credentials for user '{}'.",
            request.username
        )));
    }

    send(
        communication,
        &AuthResponse {
            kind: PayloadType::Response,
            result: "ok".into(),
            version: PROTOCOL_VERSION,
            rev: PROTOCOL_REVISION,
        },
    )?;

    let registration: Registration = receive(communication, timeout)?;
    if registration.kind != PayloadType::Request {
        reject(communication, "request expected");
        return Err(Error::Greeting("Node didn't send a request.".into()));
    }

    send(
        communication,
        &RegistrationResponse {
            kind: PayloadType::Response,
            result: "ok".into(),
        },
    )?;

    info!(
        "Node '{}' of type {} registered as '{}'",
        request.username, registration.node_type, registration.instance
    );

    Ok(NodeInfo {
        username: request.username,
        version: request.version,
        rev: request.rev,
        node_type: registration.node_type,
        instance: registration.instance,
        persistent: registration.persistent != 0,
    })
}

fn send<T: Serialize>(communication: &Communication, payload: &T) -> Result<(), Error> {
    let payload = serde_json::to_value(payload)
        .map_err(|err| Error::MessageSerialization(err.to_string()))?;
    let message = RawMessage {
        msg_time: Some(unix_timestamp()),
        message: GREETING_MESSAGE.into(),
        payload: Some(payload),
        error: None,
    };
    let text = serde_json::to_string(&message)
        .map_err(|err| Error::MessageSerialization(err.to_string()))?;

    communication.send_raw(&text)
}

/// Receive the next greeting message and extract its payload.
/// Error messages of the peer and invalid messages are turned into [`Error::Greeting`].
fn receive<T: DeserializeOwned>(
    communication: &Communication,
    timeout: Duration,
) -> Result<T, Error> {
    let text = communication.recv_raw(timeout)?;
    let message: RawMessage = match serde_json::from_str(&text) {
        Ok(message) => message,
        Err(err) => {
            reject(communication, "message header malformed");
            return Err(Error::Greeting(format!("Received malformed message: {err}")));
        }
    };

    if let Some(error) = message.error {
        return Err(Error::Greeting(format!("Peer reported an error: {error}")));
    }

    if !message.message.eq_ignore_ascii_case(GREETING_MESSAGE) {
        reject(communication, "initialization message expected");
        return Err(Error::Greeting(format!(
            "Expected initialization message, got '{}'",
            message.message
        )));
    }

    let payload = message.payload.unwrap_or(Value::Null);
    serde_json::from_value(payload).map_err(|err| {
        reject(communication, "message not valid");
        Error::Greeting(format!("Received invalid initialization message: {err}"))
    })
}

fn expect_ok(communication: &Communication, kind: PayloadType, result: &str) -> Result<(), Error> {
    if kind != PayloadType::Response {
        reject(communication, "response expected");
        return Err(Error::Greeting("Peer didn't send a response.".into()));
    }
    if !result.eq_ignore_ascii_case("ok") {
        return Err(Error::Greeting(format!("Result not ok: '{result}'")));
    }

    Ok(())
}

/// Tell the peer why we give up. Errors are ignored, the channel is abandoned anyway.
fn reject(communication: &Communication, error: &str) {
    let message = RawMessage {
        msg_time: None,
        message: GREETING_MESSAGE.into(),
        payload: None,
        error: Some(error.into()),
    };
    if let Ok(text) = serde_json::to_string(&message) {
        let _ = communication.send_raw(&text);
    }
}
