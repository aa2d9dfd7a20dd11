//! Constructors for the envelopes every node type sends.
use serde_json::{Map, Value, json};

use super::Envelope;

/// The keep-alive message that's sent by the watchdog whenever a channel has been idle.
pub fn ping() -> Envelope {
    Envelope::new("ping", Map::new())
}

/// Manager nodes use options to change server side settings, e.g. the active profile.
pub fn option(option_type: &str, value: i64, time_delay: u64) -> Envelope {
    Envelope::new(
        "option",
        object(json!({
            "optionType": option_type,
            "value": value,
            "timeDelay": time_delay,
        })),
    )
}

/// A sensor changed its state.
pub fn state_change(sensor_id: u64, state: i64, data: Value) -> Envelope {
    Envelope::new(
        "statechange",
        object(json!({
            "clientSensorId": sensor_id,
            "state": state,
            "data": data,
        })),
    )
}

/// A sensor triggered an alarm.
pub fn sensor_alert(sensor_id: u64, state: i64, has_optional_data: bool, data: Value) -> Envelope {
    let mut payload = object(json!({
        "clientSensorId": sensor_id,
        "state": state,
        "hasOptionalData": has_optional_data,
    }));
    if has_optional_data {
        payload.insert("optionalData".into(), data);
    }

    Envelope::new("sensoralert", payload)
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn ping_is_stamped() {
        let envelope = ping();
        assert_eq!(envelope.message, "ping");
        assert!(envelope.msg_time.is_some());
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn sensor_alert_optional_data() {
        let with_data = sensor_alert(1, 1, true, json!({"message": "door open"}));
        assert_eq!(
            with_data.payload.get("optionalData"),
            Some(&json!({"message": "door open"}))
        );

        let without_data = sensor_alert(1, 1, false, json!({"message": "door open"}));
        assert_eq!(without_data.payload.get("optionalData"), None);
    }
}
