//! `IoTHubMQTTConverter` (spec.md §4.3): translates IoT Hub domain
//! operations into MQTT operations, and classifies inbound MQTT messages
//! back into domain events. Grounded in the teacher's
//! `iothub/mod.rs::connect_iothub` (client id / username construction) and
//! `iothub/handlers/{c2d,direct_method,twins}.rs` (topic-based dispatch),
//! generalized from the teacher's fixed device-only shape to the
//! device-or-module client id spec.md §6b calls for.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uuid::Uuid;

use crate::errors::PipelineError;
use crate::event::Event;
use crate::mqtt::topics::{self, IncomingTopicKind};
use crate::operation::{
    IoTHubConnectionArgs, Message, MqttConnectionArgs, Operation, OperationKind, OperationResponse,
    OperationResult,
};
use crate::pipeline::{PipelineLink, Stage};

const API_VERSION: &str = "2018-06-30";

fn client_id(args: &IoTHubConnectionArgs) -> String {
    match &args.module_id {
        Some(module_id) => format!("{}/{}", args.device_id, module_id),
        None => args.device_id.clone(),
    }
}

pub struct IoTHubMQTTConverter {
    device_id: Mutex<Option<String>>,
    module_id: Mutex<Option<String>>,
    /// Twin GET/PATCH requests awaiting a `$iothub/twin/res/{status}` reply,
    /// keyed by request id (SPEC_FULL.md §4.9). `Arc`-wrapped so the publish
    /// operation's completion closure can reach back in and fail the
    /// stashed request if the publish itself never makes it to the broker.
    pending_twin_requests: Arc<Mutex<HashMap<String, Operation>>>,
}

impl IoTHubMQTTConverter {
    pub fn new() -> Arc<IoTHubMQTTConverter> {
        Arc::new(IoTHubMQTTConverter {
            device_id: Mutex::new(None),
            module_id: Mutex::new(None),
            pending_twin_requests: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn device_and_module(&self) -> (Option<String>, Option<String>) {
        (
            self.device_id.lock().expect("device id mutex poisoned").clone(),
            self.module_id.lock().expect("module id mutex poisoned").clone(),
        )
    }

    fn feature_topic(&self, feature: &str, device_id: &str, module_id: Option<&str>) -> Result<String, PipelineError> {
        match feature {
            "c2d" | "C2D" => Ok(topics::c2d_subscribe_topic(device_id)),
            "input" | "INPUT" => {
                let module_id = module_id.ok_or_else(|| {
                    PipelineError::InvalidArgument("the `input` feature requires a module id".to_string())
                })?;
                Ok(topics::input_subscribe_topic(device_id, module_id))
            }
            "methods" | "METHODS" => Ok(format!("{}#", topics::METHODS_PREFIX)),
            "twin" | "TWIN" => Ok(format!("{}#", topics::TWIN_RESPONSE_PREFIX)),
            other => Err(PipelineError::InvalidArgument(format!("unknown feature `{other}`"))),
        }
    }

    fn resolve_twin_request(&self, request_id: Option<String>, status: u16, payload: Vec<u8>) {
        let Some(request_id) = request_id else {
            log::warn!("twin response on status {status} had no `$rid`; dropping");
            return;
        };
        let op = self
            .pending_twin_requests
            .lock()
            .expect("pending twin requests mutex poisoned")
            .remove(&request_id);
        let Some(op) = op else {
            log::debug!("twin response for unknown request id `{request_id}`; dropping");
            return;
        };
        if (200..300).contains(&status) {
            let document = serde_json::from_slice(&payload).unwrap_or(Value::Null);
            op.succeed_with(OperationResponse::TwinDocument(document));
        } else {
            op.fail(PipelineError::ProtocolError(format!(
                "twin request failed with status {status}"
            )));
        }
    }
}

impl Stage for IoTHubMQTTConverter {
    fn name(&self) -> &'static str {
        "IoTHubMQTTConverter"
    }

    fn run_op(&self, op: Operation, link: PipelineLink) {
        match &op.kind {
            OperationKind::SetIoTHubConnectionArgs(args) => {
                *self.device_id.lock().expect("device id mutex poisoned") = Some(args.device_id.clone());
                *self.module_id.lock().expect("module id mutex poisoned") = args.module_id.clone();

                let client_id = client_id(args);
                let hostname = args.gateway_hostname.clone().unwrap_or_else(|| args.hostname.clone());
                let username = format!("{}/{}/?api-version={}", args.hostname, client_id, API_VERSION);
                let mqtt_args = MqttConnectionArgs {
                    client_id,
                    hostname,
                    username,
                    ca_cert: args.ca_cert.clone(),
                    client_cert: args.client_cert.clone(),
                };
                // The password isn't part of `MqttConnectionArgs` itself —
                // `MQTTClient` tracks it separately so a later SAS refresh
                // doesn't require rebuilding the whole connection args.
                if let Some(token) = &args.sas_token {
                    let token_op = Operation::new(OperationKind::SetSasToken(token.clone()), Box::new(|_| {}));
                    link.forward(token_op);
                }
                link.forward(op.delegate(OperationKind::SetMqttConnectionArgs(mqtt_args)));
            }

            OperationKind::SendTelemetry(message) => {
                let (device_id, module_id) = self.device_and_module();
                let Some(device_id) = device_id else {
                    return op.fail(PipelineError::NotConnected(
                        "no IoT Hub connection args set before sending telemetry".to_string(),
                    ));
                };
                let topic = telemetry_topic_with_properties(&device_id, module_id.as_deref(), message, None);
                let payload = message.body.clone();
                link.forward(op.delegate(OperationKind::MqttPublish { topic, payload }));
            }

            OperationKind::SendOutputMessage(message, output_name) => {
                let (device_id, module_id) = self.device_and_module();
                let Some(device_id) = device_id else {
                    return op.fail(PipelineError::NotConnected(
                        "no IoT Hub connection args set before sending an output message".to_string(),
                    ));
                };
                let topic = telemetry_topic_with_properties(&device_id, module_id.as_deref(), message, Some(output_name));
                let payload = message.body.clone();
                link.forward(op.delegate(OperationKind::MqttPublish { topic, payload }));
            }

            OperationKind::SendMethodResponse { request_id, status, payload } => {
                let topic = topics::method_response_topic(*status, request_id);
                let payload = payload.clone();
                link.forward(op.delegate(OperationKind::MqttPublish { topic, payload }));
            }

            OperationKind::GetTwin => {
                let request_id = Uuid::new_v4().to_string();
                let topic = topics::twin_get_topic(&request_id);
                self.pending_twin_requests
                    .lock()
                    .expect("pending twin requests mutex poisoned")
                    .insert(request_id.clone(), op);
                let pending = self.pending_twin_requests.clone();
                let publish = Operation::new(
                    OperationKind::MqttPublish { topic, payload: Vec::new() },
                    Box::new(move |result| fail_pending_twin_request_on_publish_error(&pending, &request_id, result)),
                );
                link.forward(publish);
            }

            OperationKind::PatchReportedProperties(patch) => {
                let payload = serde_json::to_vec(patch).unwrap_or_default();
                let request_id = Uuid::new_v4().to_string();
                let topic = topics::twin_patch_reported_topic(&request_id);
                self.pending_twin_requests
                    .lock()
                    .expect("pending twin requests mutex poisoned")
                    .insert(request_id.clone(), op);
                let pending = self.pending_twin_requests.clone();
                let publish = Operation::new(
                    OperationKind::MqttPublish { topic, payload },
                    Box::new(move |result| fail_pending_twin_request_on_publish_error(&pending, &request_id, result)),
                );
                link.forward(publish);
            }

            OperationKind::EnableFeature(feature) => {
                let (device_id, module_id) = self.device_and_module();
                let Some(device_id) = device_id else {
                    return op.fail(PipelineError::NotConnected(
                        "no IoT Hub connection args set before enabling a feature".to_string(),
                    ));
                };
                match self.feature_topic(feature, &device_id, module_id.as_deref()) {
                    Ok(topic) => link.forward(op.delegate(OperationKind::MqttSubscribe { topic, qos: 1 })),
                    Err(e) => op.fail(e),
                }
            }

            OperationKind::DisableFeature(feature) => {
                let (device_id, module_id) = self.device_and_module();
                let Some(device_id) = device_id else {
                    return op.fail(PipelineError::NotConnected(
                        "no IoT Hub connection args set before disabling a feature".to_string(),
                    ));
                };
                match self.feature_topic(feature, &device_id, module_id.as_deref()) {
                    Ok(topic) => link.forward(op.delegate(OperationKind::MqttUnsubscribe(topic))),
                    Err(e) => op.fail(e),
                }
            }

            _ => link.forward(op),
        }
    }

    fn handle_event(&self, event: Event, link: PipelineLink) {
        let Event::IncomingMqttMessage { topic, payload } = event else {
            return link.emit_event(event);
        };

        match topics::classify_incoming_topic(&topic) {
            IncomingTopicKind::CloudToDevice => {
                let prefix = {
                    let device_id = self.device_id.lock().expect("device id mutex poisoned");
                    device_id.as_ref().map(|d| topics::c2d_topic_prefix(d))
                };
                let Some(prefix) = prefix else {
                    return link.emit_event(Event::IncomingMqttMessage { topic, payload });
                };
                let props_segment = topic.strip_prefix(&prefix).unwrap_or("");
                match topics::parse_query_single(props_segment) {
                    Ok(raw) => link.emit_event(Event::IncomingC2DMessage {
                        payload,
                        properties: flatten_properties(raw),
                    }),
                    Err(e) => log::warn!("failed to parse C2D topic properties: {e}"),
                }
            }
            IncomingTopicKind::Input { input_name } => {
                let prefix = {
                    let device_id = self.device_id.lock().expect("device id mutex poisoned");
                    let module_id = self.module_id.lock().expect("module id mutex poisoned");
                    match (device_id.as_ref(), module_id.as_ref()) {
                        (Some(d), Some(m)) => Some(topics::input_topic_prefix(d, m)),
                        _ => None,
                    }
                };
                let Some(prefix) = prefix else {
                    return link.emit_event(Event::IncomingMqttMessage { topic, payload });
                };
                let rest = topic.strip_prefix(&prefix).unwrap_or("");
                let props_segment = rest.split_once('/').map(|(_, p)| p).unwrap_or("");
                match topics::parse_query_single(props_segment) {
                    Ok(raw) => link.emit_event(Event::IncomingInputMessage {
                        input_name,
                        payload,
                        properties: flatten_properties(raw),
                    }),
                    Err(e) => log::warn!("failed to parse input topic properties: {e}"),
                }
            }
            IncomingTopicKind::MethodRequest => {
                let Some(rest) = topic.strip_prefix(topics::METHODS_PREFIX) else {
                    return link.emit_event(Event::IncomingMqttMessage { topic, payload });
                };
                let (method_name, props_segment) = rest.split_once('/').unwrap_or((rest, ""));
                match topics::parse_query_single(props_segment.trim_start_matches('?')) {
                    Ok(props) => {
                        let request_id = props.get("$rid").cloned().flatten().unwrap_or_default();
                        link.emit_event(Event::IncomingMethodRequest {
                            request_id,
                            method_name: method_name.to_string(),
                            payload,
                        });
                    }
                    Err(e) => log::warn!("failed to parse method request topic properties: {e}"),
                }
            }
            IncomingTopicKind::TwinResponse => {
                let Some(remainder) = topic.strip_prefix(topics::TWIN_RESPONSE_PREFIX) else {
                    return link.emit_event(Event::IncomingMqttMessage { topic, payload });
                };
                match topics::split_status_and_properties(remainder) {
                    Ok((status, props_segment)) => match topics::parse_query_single(props_segment.trim_start_matches('?')) {
                        Ok(props) => {
                            let request_id = props.get("$rid").cloned().flatten();
                            self.resolve_twin_request(request_id, status, payload);
                        }
                        Err(e) => log::warn!("failed to parse twin response topic properties: {e}"),
                    },
                    Err(e) => log::warn!("failed to parse twin response topic: {e}"),
                }
            }
            IncomingTopicKind::TwinDesiredPatch => match serde_json::from_slice(&payload) {
                Ok(patch) => {
                    let version = extract_version(&patch);
                    link.emit_event(Event::DesiredPropertiesUpdated { version, patch });
                }
                Err(e) => log::warn!("desired properties patch was not valid JSON: {e}"),
            },
            IncomingTopicKind::DpsResponse | IncomingTopicKind::Unrecognized => {
                link.emit_event(Event::IncomingMqttMessage { topic, payload });
            }
        }
    }
}

/// The publish carrying a twin GET/PATCH request completed. On success the
/// request stays parked in `pending` until the matching
/// `$iothub/twin/res/{status}` event resolves it via `resolve_twin_request`;
/// on failure the publish itself never reached the broker, so nothing will
/// ever raise that response and the stashed operation has to be failed here
/// or it would hang forever.
fn fail_pending_twin_request_on_publish_error(
    pending: &Mutex<HashMap<String, Operation>>,
    request_id: &str,
    result: OperationResult,
) {
    if let Err(e) = result {
        if let Some(op) = pending
            .lock()
            .expect("pending twin requests mutex poisoned")
            .remove(request_id)
        {
            op.fail(e);
        }
    }
}

fn extract_version(patch: &Value) -> u64 {
    patch.get("$version").and_then(Value::as_u64).unwrap_or(0)
}

fn flatten_properties(raw: HashMap<String, Option<String>>) -> HashMap<String, String> {
    raw.into_iter().filter_map(|(k, v)| v.map(|v| (k, v))).collect()
}

fn telemetry_topic_with_properties(
    device_id: &str,
    module_id: Option<&str>,
    message: &Message,
    output_name: Option<&str>,
) -> String {
    let base = topics::telemetry_topic(device_id, module_id);
    let props = topics::encode_properties(message, output_name);
    if props.is_empty() {
        base
    } else {
        format!("{base}{props}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::IoTHubConnectionArgs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    struct Capture(StdMutex<Option<(String, String)>>);

    struct CapturingStage(Arc<Capture>);
    impl Stage for CapturingStage {
        fn name(&self) -> &'static str {
            "capture"
        }
        fn run_op(&self, op: Operation, _link: PipelineLink) {
            if let OperationKind::SetMqttConnectionArgs(args) = &op.kind {
                *self.0 .0.lock().unwrap() = Some((args.client_id.clone(), args.username.clone()));
            }
            op.succeed();
        }
    }

    fn build_pipeline() -> (crate::pipeline::Pipeline, Arc<Capture>) {
        let capture = Arc::new(Capture(StdMutex::new(None)));
        let converter = IoTHubMQTTConverter::new();
        let pipeline = crate::pipeline::Pipeline::new(vec![
            converter,
            Arc::new(CapturingStage(capture.clone())),
        ]);
        (pipeline, capture)
    }

    #[test]
    fn set_connection_args_builds_username_with_api_version() {
        let (pipeline, capture) = build_pipeline();
        let args = IoTHubConnectionArgs {
            device_id: "dev1".to_string(),
            module_id: None,
            hostname: "myhub.azure-devices.net".to_string(),
            gateway_hostname: None,
            ca_cert: None,
            sas_token: Some("tok".to_string()),
            client_cert: None,
        };
        let op = Operation::new(OperationKind::SetIoTHubConnectionArgs(args), Box::new(|_| {}));
        pipeline.submit(op);

        let (client_id, username) = capture.0.lock().unwrap().take().expect("should have forwarded");
        assert_eq!(client_id, "dev1");
        assert_eq!(username, "myhub.azure-devices.net/dev1/?api-version=2018-06-30");
    }

    #[test]
    fn send_telemetry_before_connection_args_fails() {
        let converter = IoTHubMQTTConverter::new();
        let pipeline = crate::pipeline::Pipeline::new(vec![converter]);
        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        let op = Operation::new(
            OperationKind::SendTelemetry(Message::default()),
            Box::new(move |r| failed2.store(r.is_err(), Ordering::SeqCst)),
        );
        pipeline.submit(op);
        assert!(failed.load(Ordering::SeqCst));
    }
}
