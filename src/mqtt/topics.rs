//! IoT Hub and DPS topic construction/parsing, per spec.md §6. Grounded in
//! the teacher's `iothub/topics.rs` (topic constants) and `iothub/query.rs`
//! (URL-encoded property parsing), generalized to cover devices *and*
//! modules and the DPS topic shapes the teacher doesn't need.

use std::collections::HashMap;

use urlencoding::{decode, encode};

use crate::errors::PipelineError;
use crate::operation::Message;

pub const METHODS_PREFIX: &str = "$iothub/methods/POST/";
pub const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";
pub const TWIN_DESIRED_PREFIX: &str = "$iothub/twin/PATCH/properties/desired/";
pub const DPS_RESPONSE_PREFIX: &str = "$dps/registrations/res/";

/// `devices/{deviceId}[/modules/{moduleId}]/messages/events/`
pub fn telemetry_topic(device_id: &str, module_id: Option<&str>) -> String {
    match module_id {
        Some(module_id) => format!("devices/{device_id}/modules/{module_id}/messages/events/"),
        None => format!("devices/{device_id}/messages/events/"),
    }
}

pub fn c2d_subscribe_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/#")
}

pub fn c2d_topic_prefix(device_id: &str) -> String {
    format!("devices/{device_id}/messages/devicebound/")
}

pub fn input_subscribe_topic(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/inputs/#")
}

pub fn input_topic_prefix(device_id: &str, module_id: &str) -> String {
    format!("devices/{device_id}/modules/{module_id}/inputs/")
}

pub fn method_response_topic(status: i32, request_id: &str) -> String {
    format!("$iothub/methods/res/{status}/?$rid={request_id}")
}

pub fn twin_get_topic(request_id: &str) -> String {
    format!("$iothub/twin/GET/?$rid={request_id}")
}

pub fn twin_patch_reported_topic(request_id: &str) -> String {
    format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
}

pub fn dps_register_topic(request_id: &str) -> String {
    format!("$dps/registrations/PUT/iotdps-register/?$rid={request_id}")
}

pub fn dps_query_topic(request_id: &str, operation_id: &str) -> String {
    format!("$dps/registrations/GET/iotdps-get-operationstatus/?$rid={request_id}&operationId={operation_id}")
}

pub fn dps_response_subscribe_topic() -> String {
    format!("{DPS_RESPONSE_PREFIX}#")
}

/// System property reserved keys (spec.md §6 "Property encoding").
pub mod system_properties {
    pub const MESSAGE_ID: &str = "$.mid";
    pub const CORRELATION_ID: &str = "$.cid";
    pub const USER_ID: &str = "$.uid";
    pub const TO: &str = "$.to";
    pub const CONTENT_TYPE: &str = "$.ct";
    pub const CONTENT_ENCODING: &str = "$.ce";
    pub const EXPIRY: &str = "$.exp";
    pub const OUTPUT_NAME: &str = "$.on";
}

/// Encode a [`Message`]'s properties as the URL-encoded `key=value&...`
/// suffix appended to a publish topic. A total function: every message
/// encodes, even one with no properties at all (empty string).
pub fn encode_properties(message: &Message, output_name: Option<&str>) -> String {
    use system_properties::*;

    let mut pairs = Vec::new();
    let mut push = |key: &str, value: &str| pairs.push(format!("{}={}", key, encode(value)));

    if let Some(v) = &message.message_id {
        push(MESSAGE_ID, v);
    }
    if let Some(v) = &message.correlation_id {
        push(CORRELATION_ID, v);
    }
    if let Some(v) = &message.user_id {
        push(USER_ID, v);
    }
    if let Some(v) = &message.to {
        push(TO, v);
    }
    if let Some(v) = &message.content_type {
        push(CONTENT_TYPE, v);
    }
    if let Some(v) = &message.content_encoding {
        push(CONTENT_ENCODING, v);
    }
    if let Some(v) = &message.expiry_time_utc {
        push(EXPIRY, &v.to_rfc3339());
    }
    if let Some(output_name) = output_name {
        push(OUTPUT_NAME, output_name);
    }
    for (key, value) in &message.custom_properties {
        push(key, value);
    }

    pairs.join("&")
}

/// Parse a `key=value&key2=value2` query/property segment into a map whose
/// values are single `Option<String>` — a key with no `=` maps to `None`.
/// This is the shape method-call and C2D topics use (at most one value per
/// key); grounded verbatim in the teacher's `iothub/query.rs::parse`.
pub fn parse_query_single(query: &str) -> Result<HashMap<String, Option<String>>, PipelineError> {
    let mut map = HashMap::new();
    if query.is_empty() {
        return Ok(map);
    }

    for prop in query.split('&') {
        match prop.find('=') {
            None => {
                let key = decode(prop)
                    .map_err(|e| PipelineError::InvalidArgument(format!("bad topic property key `{prop}`: {e}")))?;
                map.insert(key.into_owned(), None);
            }
            Some(pos) => {
                let key = decode(&prop[..pos]).map_err(|e| {
                    PipelineError::InvalidArgument(format!("bad topic property key `{prop}`: {e}"))
                })?;
                let value = decode(&prop[pos + 1..]).map_err(|e| {
                    PipelineError::InvalidArgument(format!("bad topic property value `{prop}`: {e}"))
                })?;
                map.insert(key.into_owned(), Some(value.into_owned()));
            }
        }
    }

    Ok(map)
}

/// Parse a query/property segment grouping repeated keys into lists, the
/// shape DPS response topics use (spec.md §8 scenario S5:
/// `key_values={"rid":["r1"],"retry-after":["3"]}`).
pub fn parse_query_multi(query: &str) -> Result<HashMap<String, Vec<String>>, PipelineError> {
    let mut map: HashMap<String, Vec<String>> = HashMap::new();
    if query.is_empty() {
        return Ok(map);
    }

    for prop in query.split('&') {
        let (key, value) = match prop.find('=') {
            None => (prop, String::new()),
            Some(pos) => (&prop[..pos], prop[pos + 1..].to_string()),
        };
        let key = decode(key)
            .map_err(|e| PipelineError::InvalidArgument(format!("bad topic property key `{prop}`: {e}")))?
            .into_owned();
        let value = decode(&value)
            .map_err(|e| PipelineError::InvalidArgument(format!("bad topic property value `{prop}`: {e}")))?
            .into_owned();
        map.entry(key).or_default().push(value);
    }

    Ok(map)
}

/// A decoded inbound MQTT message topic, per spec.md §6 "Topic parsing
/// (inbound)".
#[derive(Debug, PartialEq, Eq)]
pub enum IncomingTopicKind {
    CloudToDevice,
    Input { input_name: String },
    MethodRequest,
    TwinResponse,
    TwinDesiredPatch,
    DpsResponse,
    Unrecognized,
}

/// Classify an inbound topic. Split on `/`:
/// - contains `messages/devicebound` and has ≥5 segments ⇒ C2D
/// - contains `inputs` and has ≥7 segments ⇒ input message (name at index 5)
/// - otherwise match against the `$iothub`/`$dps` prefixes.
pub fn classify_incoming_topic(topic: &str) -> IncomingTopicKind {
    let segments: Vec<&str> = topic.split('/').collect();

    if topic.contains("messages/devicebound") && segments.len() >= 5 {
        return IncomingTopicKind::CloudToDevice;
    }
    if topic.contains("inputs") && segments.len() >= 7 {
        return IncomingTopicKind::Input {
            input_name: segments[5].to_string(),
        };
    }
    if topic.starts_with(METHODS_PREFIX) {
        return IncomingTopicKind::MethodRequest;
    }
    if topic.starts_with(TWIN_DESIRED_PREFIX) {
        return IncomingTopicKind::TwinDesiredPatch;
    }
    if topic.starts_with(TWIN_RESPONSE_PREFIX) {
        return IncomingTopicKind::TwinResponse;
    }
    if topic.starts_with(DPS_RESPONSE_PREFIX) {
        return IncomingTopicKind::DpsResponse;
    }

    IncomingTopicKind::Unrecognized
}

/// Split the trailing `{status}/?{props}` segment off a `res`-style topic
/// (method response, twin response, DPS response), returning the numeric
/// status and the raw property string.
pub fn split_status_and_properties(remainder: &str) -> Result<(u16, &str), PipelineError> {
    let (status_str, rest) = match remainder.split_once('/') {
        Some((status, rest)) => (status, rest),
        None => (remainder, ""),
    };
    let status = status_str
        .parse::<u16>()
        .map_err(|_| PipelineError::ProtocolError(format!("bad status code `{status_str}`")))?;
    let props = rest.strip_prefix('?').unwrap_or(rest);
    Ok((status, props))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Message;

    #[test]
    fn telemetry_topic_device_vs_module() {
        assert_eq!(
            telemetry_topic("d", None),
            "devices/d/messages/events/"
        );
        assert_eq!(
            telemetry_topic("d", Some("m")),
            "devices/d/modules/m/messages/events/"
        );
    }

    #[test]
    fn encode_properties_is_total_and_decodes_inverse() {
        let message = Message {
            body: b"x".to_vec(),
            message_id: Some("m1".to_string()),
            custom_properties: vec![("foo".to_string(), "bar baz".to_string())],
            ..Default::default()
        };

        let encoded = encode_properties(&message, None);
        assert!(encoded.contains("%24.mid=m1"));
        assert!(encoded.contains("foo=bar%20baz"));

        let decoded = parse_query_single(&encoded).expect("should decode");
        assert_eq!(decoded.get("$.mid").unwrap().as_deref(), Some("m1"));
        assert_eq!(decoded.get("foo").unwrap().as_deref(), Some("bar baz"));

        // Empty message still encodes to a total (empty) value.
        let empty = Message::default();
        assert_eq!(encode_properties(&empty, None), "");
    }

    #[test]
    fn classify_c2d_topic() {
        let kind = classify_incoming_topic("devices/d/messages/devicebound/%24.to=x");
        assert_eq!(kind, IncomingTopicKind::CloudToDevice);
    }

    #[test]
    fn classify_input_topic_extracts_name() {
        let kind = classify_incoming_topic("devices/d/modules/m/inputs/input1/foo=bar");
        assert_eq!(
            kind,
            IncomingTopicKind::Input {
                input_name: "input1".to_string()
            }
        );
    }

    #[test]
    fn classify_method_and_dps_topics() {
        assert_eq!(
            classify_incoming_topic("$iothub/methods/POST/reboot/?$rid=1"),
            IncomingTopicKind::MethodRequest
        );
        assert_eq!(
            classify_incoming_topic("$dps/registrations/res/200/?$rid=r1"),
            IncomingTopicKind::DpsResponse
        );
    }

    #[test]
    fn parse_query_multi_groups_repeated_keys() {
        let map = parse_query_multi("$rid=r1&retry-after=3").expect("should parse");
        assert_eq!(map.get("$rid").unwrap(), &vec!["r1".to_string()]);
        assert_eq!(map.get("retry-after").unwrap(), &vec!["3".to_string()]);
    }
}
