//! Blocking client facades over the pipeline (spec.md §9 "Coroutine vs.
//! synchronous clients" / SPEC_FULL.md §1b "Sync facade over the async
//! core"): each facade owns a [`Pipeline`] and the two dedicated executors
//! spec.md §5 describes, submits operations onto the pipeline executor, and
//! blocks the calling thread on a one-shot channel fed by the operation's
//! completion — which itself runs on the callback executor, so a slow
//! caller can never stall the pipeline thread.
//!
//! Three facades mirror the three pipeline shapes spec.md §4.2 lists:
//! [`DeviceClient`] (IoT Hub MQTT), [`EdgeModuleClient`] (Edge HTTP direct
//! method invocation), and [`ProvisioningClient`] (DPS registration).

use std::collections::HashMap;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use uuid::Uuid;

use crate::auth::{AuthProvider, SymmetricKeyAuthProvider, X509AuthProvider};
use crate::config::{generate_sas_token, parse_connection_string};
use crate::errors::PipelineError;
use crate::event::PipelineErrorSnapshot;
use crate::http::HTTPTransport;
use crate::mqtt::MQTTClient;
use crate::operation::{
    EdgeConnectionArgs, InvokeMethodArgs, Message, Operation, OperationKind, OperationResponse,
};
use crate::pipeline::auth_stage::{Domain, UseAuthProvider};
use crate::pipeline::edge_converter::EdgeHTTPConverter;
use crate::pipeline::executor::Executor;
use crate::pipeline::iothub_converter::IoTHubMQTTConverter;
use crate::pipeline::provisioning_converter::ProvisioningMQTTConverter;
use crate::pipeline::root::RootStage;
use crate::pipeline::Pipeline;

const DEFAULT_REGISTRATION_RESPONSE_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_REGISTRATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Submit `kind` to `pipeline` via `pipeline_executor` and block the caller
/// until its completion, observed via `callback_executor`, arrives.
fn call(
    pipeline: &Pipeline,
    pipeline_executor: &Executor,
    callback_executor: &Arc<Executor>,
    kind: OperationKind,
) -> Result<OperationResponse, PipelineError> {
    let (tx, rx) = std_mpsc::channel();
    let callback_executor = callback_executor.clone();
    let op = Operation::new(
        kind,
        Box::new(move |result| {
            callback_executor.run(move || {
                let _ = tx.send(result);
            });
        }),
    );
    let pipeline = pipeline.clone();
    pipeline_executor.run(move || pipeline.submit(op));
    rx.recv().unwrap_or_else(|_| {
        Err(PipelineError::Cancelled(
            "pipeline executor shut down before the operation completed".to_string(),
        ))
    })
}

/// A device-side IoT Hub client: connect, send telemetry, receive C2D and
/// input messages, respond to direct methods, and work with the device
/// twin — all over MQTT (spec.md §4.2's IoT Hub MQTT pipeline:
/// Root → UseAuthProvider → IoTHubMQTTConverter → MQTTClient).
pub struct DeviceClient {
    pipeline: Pipeline,
    root: Arc<RootStage>,
    pipeline_executor: Executor,
    callback_executor: Arc<Executor>,
}

impl DeviceClient {
    /// Build a client from a connection string (spec.md §6 "Connection
    /// string"). Equivalent to parsing it and calling
    /// [`DeviceClient::with_auth_provider`] with a [`SymmetricKeyAuthProvider`].
    pub fn from_connection_string(connection_string: &str) -> Result<DeviceClient, PipelineError> {
        let info = parse_connection_string(connection_string)?;
        let key = info.shared_access_key.ok_or_else(|| {
            PipelineError::InvalidArgument("connection string is missing a SharedAccessKey".to_string())
        })?;
        let mut provider = SymmetricKeyAuthProvider::new(info.device_id, info.module_id, info.host_name, key);
        if let Some(name) = info.shared_access_key_name {
            provider = provider.with_shared_access_key_name(name);
        }
        if let Some(gateway) = info.gateway_host_name {
            provider = provider.with_gateway_hostname(gateway);
        }
        DeviceClient::with_auth_provider(Arc::new(provider))
    }

    /// Build an X.509-authenticated client (spec.md §4.1 `SetX509AuthProvider`).
    pub fn with_x509(
        device_id: String,
        hostname: String,
        certificate_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
    ) -> Result<DeviceClient, PipelineError> {
        let provider = X509AuthProvider::new(device_id, hostname, certificate_pem, private_key_pem);
        DeviceClient::with_x509_provider(Arc::new(provider))
    }

    /// Build a client from any SAS-token-minting [`AuthProvider`] (symmetric
    /// key, Edge HSM, or a custom implementation).
    pub fn with_auth_provider(provider: Arc<dyn AuthProvider>) -> Result<DeviceClient, PipelineError> {
        DeviceClient::build(provider, OperationKind::SetAuthProvider)
    }

    /// Build a client from a certificate-holding [`AuthProvider`].
    pub fn with_x509_provider(provider: Arc<dyn AuthProvider>) -> Result<DeviceClient, PipelineError> {
        DeviceClient::build(provider, OperationKind::SetX509AuthProvider)
    }

    fn build(
        provider: Arc<dyn AuthProvider>,
        wrap: fn(Arc<dyn AuthProvider>) -> OperationKind,
    ) -> Result<DeviceClient, PipelineError> {
        let pipeline_executor = Executor::spawn("pipeline");
        let callback_executor = Arc::new(Executor::spawn("callback"));
        let root = RootStage::new(callback_executor.clone());
        let pipeline = Pipeline::new(vec![
            root.clone(),
            UseAuthProvider::new(Domain::IoTHub),
            IoTHubMQTTConverter::new(),
            MQTTClient::new(),
        ]);

        let client = DeviceClient {
            pipeline,
            root,
            pipeline_executor,
            callback_executor,
        };
        client.call(wrap(provider))?;
        Ok(client)
    }

    fn call(&self, kind: OperationKind) -> Result<OperationResponse, PipelineError> {
        call(&self.pipeline, &self.pipeline_executor, &self.callback_executor, kind)
    }

    pub fn connect(&self) -> Result<(), PipelineError> {
        self.call(OperationKind::Connect).map(|_| ())
    }

    pub fn disconnect(&self) -> Result<(), PipelineError> {
        self.call(OperationKind::Disconnect).map(|_| ())
    }

    pub fn reconnect(&self) -> Result<(), PipelineError> {
        self.call(OperationKind::Reconnect).map(|_| ())
    }

    pub fn send_telemetry(&self, message: Message) -> Result<(), PipelineError> {
        self.call(OperationKind::SendTelemetry(message)).map(|_| ())
    }

    pub fn send_output_message(&self, message: Message, output_name: impl Into<String>) -> Result<(), PipelineError> {
        self.call(OperationKind::SendOutputMessage(message, output_name.into()))
            .map(|_| ())
    }

    pub fn send_method_response(
        &self,
        request_id: impl Into<String>,
        status: i32,
        payload: Vec<u8>,
    ) -> Result<(), PipelineError> {
        self.call(OperationKind::SendMethodResponse {
            request_id: request_id.into(),
            status,
            payload,
        })
        .map(|_| ())
    }

    /// Enable a named feature (spec.md GLOSSARY: `c2d`, `input`, `methods`,
    /// `twin`). Fails with [`PipelineError::InvalidArgument`] on an unknown
    /// name (spec.md §8 S4).
    pub fn enable_feature(&self, feature: impl Into<String>) -> Result<(), PipelineError> {
        self.call(OperationKind::EnableFeature(feature.into())).map(|_| ())
    }

    pub fn disable_feature(&self, feature: impl Into<String>) -> Result<(), PipelineError> {
        self.call(OperationKind::DisableFeature(feature.into())).map(|_| ())
    }

    /// Fetch the current twin document (desired + reported properties).
    pub fn get_twin(&self) -> Result<Value, PipelineError> {
        match self.call(OperationKind::GetTwin)? {
            OperationResponse::TwinDocument(doc) => Ok(doc),
            _ => Ok(Value::Null),
        }
    }

    /// Apply a JSON-merge-patch to the device's reported properties
    /// (SPEC_FULL.md §1b "Device Twin").
    pub fn patch_reported_properties(&self, patch: Value) -> Result<(), PipelineError> {
        self.call(OperationKind::PatchReportedProperties(patch)).map(|_| ())
    }

    pub fn on_connection_state_changed(&self, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.root.on_connection_state_changed(callback);
    }

    pub fn on_c2d_message(&self, callback: impl Fn(Vec<u8>, Vec<(String, String)>) + Send + Sync + 'static) {
        self.root.on_c2d_message(callback);
    }

    pub fn on_input_message(&self, callback: impl Fn(String, Vec<u8>, Vec<(String, String)>) + Send + Sync + 'static) {
        self.root.on_input_message(callback);
    }

    pub fn on_method_request(&self, callback: impl Fn(String, String, Vec<u8>) + Send + Sync + 'static) {
        self.root.on_method_request(callback);
    }

    pub fn on_desired_properties_updated(&self, callback: impl Fn(u64, Value) + Send + Sync + 'static) {
        self.root.on_desired_properties_updated(callback);
    }

    pub fn on_disconnected_unexpected(&self, callback: impl Fn(PipelineErrorSnapshot) + Send + Sync + 'static) {
        self.root.on_disconnected_unexpected(callback);
    }
}

impl Drop for DeviceClient {
    /// Cancellation is modeled as client teardown (spec.md §5): best-effort
    /// disconnect before the executors are joined.
    fn drop(&mut self) {
        if let Err(e) = self.disconnect() {
            log::debug!("disconnect during DeviceClient teardown failed: {e}");
        }
    }
}

/// An IoT Edge module client: invokes direct methods on sibling modules or
/// downstream devices over the gateway's HTTPS endpoint (spec.md §4.2's Edge
/// HTTP pipeline: Root → UseAuthProvider(Edge) → EdgeHTTPConverter →
/// HTTPTransport).
pub struct EdgeModuleClient {
    pipeline: Pipeline,
    pipeline_executor: Executor,
    callback_executor: Arc<Executor>,
}

impl EdgeModuleClient {
    pub fn with_auth_provider(provider: Arc<dyn AuthProvider>) -> Result<EdgeModuleClient, PipelineError> {
        let pipeline_executor = Executor::spawn("edge-pipeline");
        let callback_executor = Arc::new(Executor::spawn("edge-callback"));
        let root = RootStage::new(callback_executor.clone());
        let pipeline = Pipeline::new(vec![
            root,
            UseAuthProvider::new(Domain::Edge),
            EdgeHTTPConverter::new(),
            HTTPTransport::new(),
        ]);

        let client = EdgeModuleClient {
            pipeline,
            pipeline_executor,
            callback_executor,
        };
        client.call(OperationKind::SetAuthProvider(provider))?;
        Ok(client)
    }

    fn call(&self, kind: OperationKind) -> Result<OperationResponse, PipelineError> {
        call(&self.pipeline, &self.pipeline_executor, &self.callback_executor, kind)
    }

    /// Invoke `method_name` on `target_device_id` (and, for a module,
    /// `target_module_id`), returning the responder's status and payload
    /// (spec.md §6 "HTTP (Edge method invoke)").
    pub fn invoke_method(
        &self,
        target_device_id: impl Into<String>,
        target_module_id: Option<String>,
        method_name: impl Into<String>,
        payload: Vec<u8>,
        connect_timeout_secs: u32,
        response_timeout_secs: u32,
    ) -> Result<(i32, Vec<u8>), PipelineError> {
        let result = self.call(OperationKind::InvokeMethod(InvokeMethodArgs {
            method_name: method_name.into(),
            target_device_id: target_device_id.into(),
            target_module_id,
            payload,
            connect_timeout_secs,
            response_timeout_secs,
        }))?;
        match result {
            OperationResponse::MethodInvocationResult { status, payload } => Ok((status, payload)),
            _ => Err(PipelineError::Fatal(
                "InvokeMethod completed without a MethodInvocationResult".to_string(),
            )),
        }
    }

    /// Connect args for an Edge-hosted client, bypassing an [`AuthProvider`]
    /// when the caller already knows its identity and gateway (matches the
    /// shape `EdgeHTTPConverter` expects directly).
    pub fn connect_args(&self, device_id: String, module_id: Option<String>, gateway_hostname: String) -> Result<(), PipelineError> {
        self.call(OperationKind::SetEdgeConnectionArgs(EdgeConnectionArgs {
            device_id,
            module_id,
            gateway_hostname,
        }))
        .map(|_| ())
    }
}

/// The outcome of a completed DPS registration (spec.md GLOSSARY
/// "Provisioning"): the IoT Hub the device was assigned to, and the
/// (possibly reassigned) device id.
#[derive(Debug, Clone)]
pub struct ProvisioningResult {
    pub assigned_hub: String,
    pub device_id: String,
    pub payload: Value,
}

struct RegistrationResponseEvent {
    request_id: String,
    status_code: u16,
    key_values: HashMap<String, Vec<String>>,
    payload: Vec<u8>,
}

/// A Device Provisioning Service client: resolves a registration id to an
/// assigned IoT Hub hostname and device id (spec.md §4.2's provisioning
/// pipeline: Root → UseSecurityProvider → ProvisioningMQTTConverter →
/// MQTTClient; here `UseSecurityProvider` is folded into this facade since
/// `SetSecurityClientArgs` needs no auth-provider indirection).
pub struct ProvisioningClient {
    registration_id: String,
    pipeline: Pipeline,
    pipeline_executor: Executor,
    callback_executor: Arc<Executor>,
    registration_rx: Mutex<std_mpsc::Receiver<RegistrationResponseEvent>>,
}

impl ProvisioningClient {
    /// Build a provisioning client for `registration_id` under `id_scope`,
    /// authenticating with a symmetric key if one is supplied (X.509
    /// enrollment supplies the client certificate via [`SetClientCertificate`]
    /// instead, before calling [`ProvisioningClient::register`]).
    ///
    /// [`SetClientCertificate`]: crate::operation::OperationKind::SetClientCertificate
    pub fn new(
        id_scope: impl Into<String>,
        registration_id: impl Into<String>,
        provisioning_host: impl Into<String>,
        symmetric_key: Option<String>,
    ) -> Result<ProvisioningClient, PipelineError> {
        let id_scope = id_scope.into();
        let registration_id = registration_id.into();
        let provisioning_host = provisioning_host.into();

        let pipeline_executor = Executor::spawn("dps-pipeline");
        let callback_executor = Arc::new(Executor::spawn("dps-callback"));
        let root = RootStage::new(callback_executor.clone());

        let (tx, rx) = std_mpsc::channel();
        root.on_registration_response(move |request_id, status_code, key_values, payload| {
            let _ = tx.send(RegistrationResponseEvent {
                request_id,
                status_code,
                key_values: key_values.into_iter().collect(),
                payload,
            });
        });

        let pipeline = Pipeline::new(vec![root, ProvisioningMQTTConverter::new(), MQTTClient::new()]);

        let client = ProvisioningClient {
            registration_id: registration_id.clone(),
            pipeline,
            pipeline_executor,
            callback_executor,
            registration_rx: Mutex::new(rx),
        };

        client.call(OperationKind::SetSecurityClientArgs(crate::operation::SecurityClientArgs {
            id_scope: id_scope.clone(),
            registration_id: registration_id.clone(),
            provisioning_host,
        }))?;

        if let Some(key) = symmetric_key {
            let resource_uri = format!("{id_scope}/registrations/{registration_id}");
            let token = generate_sas_token(&resource_uri, &key, None, Duration::from_secs(3600))?;
            client.call(OperationKind::SetSasToken(token))?;
        }

        Ok(client)
    }

    fn call(&self, kind: OperationKind) -> Result<OperationResponse, PipelineError> {
        call(&self.pipeline, &self.pipeline_executor, &self.callback_executor, kind)
    }

    /// Run the full registration handshake: connect, subscribe to
    /// registration responses, submit the registration request, and poll
    /// until the service reports `assigned` or a terminal failure (spec.md
    /// §8 S5).
    pub fn register(&self) -> Result<ProvisioningResult, PipelineError> {
        self.call(OperationKind::Connect)?;
        self.call(OperationKind::EnableFeature("registration".to_string()))?;

        let request_id = Uuid::new_v4().to_string();
        let body = serde_json::to_vec(&json!({ "registrationId": self.registration_id })).unwrap_or_default();
        self.call(OperationKind::SendRegistrationRequest {
            request_id: request_id.clone(),
            payload: body,
        })?;

        let mut response = self.await_registration_response(&request_id)?;
        loop {
            let document: Value = serde_json::from_slice(&response.payload).unwrap_or(Value::Null);
            match document.get("status").and_then(Value::as_str).unwrap_or("") {
                "assigned" => {
                    let state = document.get("registrationState").cloned().unwrap_or(Value::Null);
                    return Ok(ProvisioningResult {
                        assigned_hub: state.get("assignedHub").and_then(Value::as_str).unwrap_or_default().to_string(),
                        device_id: state.get("deviceId").and_then(Value::as_str).unwrap_or_default().to_string(),
                        payload: document,
                    });
                }
                "assigning" => {
                    let operation_id = document.get("operationId").and_then(Value::as_str).unwrap_or_default().to_string();
                    let retry_after = response
                        .key_values
                        .get("retry-after")
                        .and_then(|values| values.first())
                        .and_then(|s| s.parse::<u64>().ok())
                        .map(Duration::from_secs)
                        .unwrap_or(DEFAULT_REGISTRATION_POLL_INTERVAL);
                    std::thread::sleep(retry_after);

                    let query_request_id = Uuid::new_v4().to_string();
                    self.call(OperationKind::SendQueryRequest {
                        request_id: query_request_id.clone(),
                        operation_id,
                        payload: Vec::new(),
                    })?;
                    response = self.await_registration_response(&query_request_id)?;
                }
                other => {
                    return Err(PipelineError::ProtocolError(format!(
                        "DPS registration did not reach `assigned`: status `{other}` (HTTP-equivalent {})",
                        response.status_code
                    )));
                }
            }
        }
    }

    fn await_registration_response(&self, request_id: &str) -> Result<RegistrationResponseEvent, PipelineError> {
        let rx = self.registration_rx.lock().expect("registration receiver mutex poisoned");
        loop {
            let event = rx.recv_timeout(DEFAULT_REGISTRATION_RESPONSE_TIMEOUT).map_err(|_| {
                PipelineError::Timeout("timed out waiting for a DPS registration response".to_string())
            })?;
            if event.request_id == request_id {
                return Ok(event);
            }
            log::debug!(
                "dropping registration response for request id `{}` while awaiting `{request_id}`",
                event.request_id
            );
        }
    }
}
