use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::unix_timestamp;
use crate::error::Error;

/// The application-level unit that's exchanged between two peers.
///
/// `message` names the message type (`ping`, `sensoralert`, `statechange`, `option`, ...).
/// The `payload` is specific to the message type and opaque to the communication layer.
/// It must be a JSON object.
///
/// `msgTime` is optional. If it's present, the receiver uses it to drop messages that have been
/// lingering for too long, for instance in a queue while the connection was down.
#[derive(PartialEq, Eq, Clone, Debug, Deserialize, Serialize)]
pub struct Envelope {
    #[serde(rename = "msgTime", default, skip_serializing_if = "Option::is_none")]
    pub msg_time: Option<i64>,
    pub message: String,
    pub payload: Map<String, Value>,
}

impl Envelope {
    /// Create a new envelope, which is stamped with the current time.
    pub fn new(message: impl Into<String>, payload: Map<String, Value>) -> Self {
        Envelope {
            msg_time: Some(unix_timestamp()),
            message: message.into(),
            payload,
        }
    }

    /// Parse an envelope from its JSON representation.
    pub fn from_json(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| Error::MalformedFrame(err.to_string()))
    }

    pub fn to_json(&self) -> Result<String, Error> {
        serde_json::to_string(self).map_err(|err| Error::MessageSerialization(err.to_string()))
    }

    /// The message type in its normalized, lowercase form.
    pub fn message_type(&self) -> String {
        self.message.to_lowercase()
    }

    /// Check whether this envelope's timestamp lies more than `window` seconds away from `now`.
    ///
    /// Both directions count. A message from the future means that the clocks of both hosts are
    /// too far out of sync.
    /// Envelopes without timestamp never expire.
    pub fn is_expired(&self, now: i64, window: u64) -> bool {
        match self.msg_time {
            Some(msg_time) => now.abs_diff(msg_time) > window,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_spec_ping() {
        let envelope =
            Envelope::from_json(r#"{"message":"ping","payload":{"clientTime":1700000000}}"#)
                .unwrap();

        assert_eq!(envelope.message, "ping");
        assert_eq!(envelope.msg_time, None);
        assert_eq!(envelope.payload.get("clientTime"), Some(&json!(1700000000)));
    }

    #[test]
    fn message_type_is_lowercase() {
        let envelope = Envelope::new("SensorAlert", Map::new());
        assert_eq!(envelope.message_type(), "sensoralert");
    }

    #[test]
    fn missing_fields_are_malformed() {
        for text in [
            r#"{"payload":{}}"#,
            r#"{"message":"ping"}"#,
            r#"{"message":"ping","payload":[]}"#,
            "not json",
        ] {
            let result = Envelope::from_json(text);
            assert!(
                matches!(result, Err(Error::MalformedFrame(_))),
                "Expected malformed envelope for {text}, got {result:?}"
            );
        }
    }

    #[test]
    fn expiration_in_both_directions() {
        let mut envelope = Envelope::new("ping", Map::new());
        envelope.msg_time = Some(1000);

        assert!(!envelope.is_expired(1000, 600));
        assert!(!envelope.is_expired(1600, 600));
        assert!(envelope.is_expired(1601, 600));
        assert!(envelope.is_expired(399, 600));

        envelope.msg_time = None;
        assert!(!envelope.is_expired(i64::MAX, 600));
    }
}
