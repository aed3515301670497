//! The upward-flowing unit of information. Events never carry a completion
//! — they are observed, never completed (spec.md §3 invariants).

use std::collections::HashMap;

use serde_json::Value;

use crate::errors::PipelineError;

#[derive(Debug, Clone)]
pub enum Event {
    IncomingMqttMessage {
        topic: String,
        payload: Vec<u8>,
    },
    IncomingC2DMessage {
        payload: Vec<u8>,
        properties: HashMap<String, String>,
    },
    IncomingInputMessage {
        input_name: String,
        payload: Vec<u8>,
        properties: HashMap<String, String>,
    },
    IncomingMethodRequest {
        request_id: String,
        method_name: String,
        payload: Vec<u8>,
    },
    DesiredPropertiesUpdated {
        version: u64,
        patch: Value,
    },
    RegistrationResponse {
        request_id: String,
        status_code: u16,
        key_values: HashMap<String, Vec<String>>,
        payload: Vec<u8>,
    },
    ConnectedChanged {
        connected: bool,
    },
    DisconnectedUnexpected {
        error: PipelineErrorSnapshot,
    },
}

/// `PipelineError` doesn't implement `Clone` (its `#[source]` fields may
/// not), so events that carry an error carry this lightweight snapshot
/// instead, mirroring how the teacher's `iothub/eventloop.rs` wraps
/// `ConnectionError` in an `Arc` to share it across watchers.
#[derive(Debug, Clone)]
pub struct PipelineErrorSnapshot {
    pub message: String,
}

impl From<&PipelineError> for PipelineErrorSnapshot {
    fn from(err: &PipelineError) -> Self {
        PipelineErrorSnapshot {
            message: err.to_string(),
        }
    }
}
