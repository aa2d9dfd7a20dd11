use alertr_lib::{MsgRequest, MsgState};

use crate::internal_prelude::*;

/// Log the result of a handshake the other side initiated.
pub(crate) fn log_request(peer: &str, request: &MsgRequest) {
    match (request.state, &request.envelope) {
        (MsgState::Ok, Some(envelope)) => {
            info!(
                "Received '{}' from {peer}: {}",
                envelope.message_type(),
                serde_json::Value::Object(envelope.payload.clone())
            );
        }
        (MsgState::Expired, Some(envelope)) => {
            warn!(
                "Received expired '{}' from {peer} (msgTime {:?})",
                envelope.message_type(),
                envelope.msg_time
            );
        }
        (state, _) => {
            warn!(
                "Transfer {:?} from {peer} failed with state {state}",
                request.transaction_id
            );
        }
    }
}
