use alertr_lib::{Communication, Envelope};
use serde_json::{Map, Value};

use crate::internal_prelude::*;

/// Wrap the payload into an envelope and send it to the server.
pub fn send(communication: &Communication, message: &str, payload: &str) -> Result<()> {
    let payload: Map<String, Value> =
        serde_json::from_str(payload).wrap_err("The payload has to be a JSON object.")?;
    let envelope = Envelope::new(message, payload);

    let promise = communication.send_request(message, &envelope.to_json()?);
    if !promise.was_successful() {
        bail!("Server didn't accept the '{}' message.", promise.msg_type());
    }

    println!("Message '{}' has been delivered.", promise.msg_type());
    Ok(())
}
