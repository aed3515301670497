//! The downward-flowing unit of work. An [`Operation`] is a closed, tagged
//! union of everything a caller or a stage can ask a lower stage to do; it
//! carries exactly one completion, fired exactly once, via a boxed callback
//! taken out of an `Option` so a second completion attempt is a programming
//! error we can catch rather than silently double-fire.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::auth::AuthProvider;
use crate::errors::PipelineError;

static NEXT_OPERATION_ID: AtomicU64 = AtomicU64::new(1);

/// Data returned from a successfully completed operation. Most operations
/// carry no data back (`None`); the variants below cover the ones the
/// caller inspects per spec.md §4.1 ("the callback receives the
/// operation itself so the caller can inspect kind-specific results").
#[derive(Debug, Clone)]
pub enum OperationResponse {
    None,
    MethodInvocationResult { status: i32, payload: Vec<u8> },
    RegistrationResult { status_code: u16, payload: Vec<u8> },
    QueryResult { status_code: u16, payload: Vec<u8> },
    TwinDocument(Value),
    HttpResponse { status: u16, body: Vec<u8> },
}

pub type OperationResult = Result<OperationResponse, PipelineError>;
pub type CompletionCallback = Box<dyn FnOnce(OperationResult) + Send>;

#[derive(Debug, Clone)]
pub struct MqttConnectionArgs {
    pub client_id: String,
    pub hostname: String,
    pub username: String,
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<ClientCertificate>,
}

#[derive(Debug, Clone)]
pub struct ClientCertificate {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct HttpConnectionArgs {
    pub hostname: String,
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<ClientCertificate>,
}

#[derive(Debug, Clone, Default)]
pub struct Message {
    pub body: Vec<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub to: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub expiry_time_utc: Option<chrono::DateTime<chrono::Utc>>,
    pub custom_properties: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct IoTHubConnectionArgs {
    pub device_id: String,
    pub module_id: Option<String>,
    pub hostname: String,
    pub gateway_hostname: Option<String>,
    pub ca_cert: Option<Vec<u8>>,
    pub sas_token: Option<String>,
    pub client_cert: Option<ClientCertificate>,
}

#[derive(Debug, Clone)]
pub struct EdgeConnectionArgs {
    pub device_id: String,
    pub module_id: Option<String>,
    pub gateway_hostname: String,
}

#[derive(Debug, Clone)]
pub struct InvokeMethodArgs {
    pub method_name: String,
    pub target_device_id: String,
    pub target_module_id: Option<String>,
    pub payload: Vec<u8>,
    pub connect_timeout_secs: u32,
    pub response_timeout_secs: u32,
}

#[derive(Debug, Clone)]
pub struct SecurityClientArgs {
    pub id_scope: String,
    pub registration_id: String,
    pub provisioning_host: String,
}

/// Every operation kind the pipeline understands, grouped by origin exactly
/// as spec.md §4.1 groups them.
pub enum OperationKind {
    // Generic
    Connect,
    Disconnect,
    Reconnect,
    EnableFeature(String),
    DisableFeature(String),
    SetSasToken(String),
    SetClientCertificate(ClientCertificate),

    // Authentication
    SetAuthProvider(Arc<dyn AuthProvider>),
    SetX509AuthProvider(Arc<dyn AuthProvider>),

    // IoT Hub domain
    SetIoTHubConnectionArgs(IoTHubConnectionArgs),
    SendTelemetry(Message),
    SendOutputMessage(Message, String),
    SendMethodResponse {
        request_id: String,
        status: i32,
        payload: Vec<u8>,
    },
    GetTwin,
    PatchReportedProperties(Value),

    // Edge domain
    SetEdgeConnectionArgs(EdgeConnectionArgs),
    InvokeMethod(InvokeMethodArgs),

    // Provisioning domain
    SetSecurityClientArgs(SecurityClientArgs),
    SendRegistrationRequest {
        request_id: String,
        payload: Vec<u8>,
    },
    SendQueryRequest {
        request_id: String,
        operation_id: String,
        payload: Vec<u8>,
    },

    // MQTT transport
    SetMqttConnectionArgs(MqttConnectionArgs),
    MqttPublish {
        topic: String,
        payload: Vec<u8>,
    },
    MqttSubscribe {
        topic: String,
        qos: u8,
    },
    MqttUnsubscribe(String),

    // HTTP transport
    SetHttpConnectionArgs(HttpConnectionArgs),
    HttpPost {
        url: String,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
}

impl fmt::Debug for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Kind names only; payloads may contain credentials or message
        // bodies we don't want showing up in logs by accident.
        let name = match self {
            OperationKind::Connect => "Connect",
            OperationKind::Disconnect => "Disconnect",
            OperationKind::Reconnect => "Reconnect",
            OperationKind::EnableFeature(_) => "EnableFeature",
            OperationKind::DisableFeature(_) => "DisableFeature",
            OperationKind::SetSasToken(_) => "SetSasToken",
            OperationKind::SetClientCertificate(_) => "SetClientCertificate",
            OperationKind::SetAuthProvider(_) => "SetAuthProvider",
            OperationKind::SetX509AuthProvider(_) => "SetX509AuthProvider",
            OperationKind::SetIoTHubConnectionArgs(_) => "SetIoTHubConnectionArgs",
            OperationKind::SendTelemetry(_) => "SendTelemetry",
            OperationKind::SendOutputMessage(_, _) => "SendOutputMessage",
            OperationKind::SendMethodResponse { .. } => "SendMethodResponse",
            OperationKind::GetTwin => "GetTwin",
            OperationKind::PatchReportedProperties(_) => "PatchReportedProperties",
            OperationKind::SetEdgeConnectionArgs(_) => "SetEdgeConnectionArgs",
            OperationKind::InvokeMethod(_) => "InvokeMethod",
            OperationKind::SetSecurityClientArgs(_) => "SetSecurityClientArgs",
            OperationKind::SendRegistrationRequest { .. } => "SendRegistrationRequest",
            OperationKind::SendQueryRequest { .. } => "SendQueryRequest",
            OperationKind::SetMqttConnectionArgs(_) => "SetMqttConnectionArgs",
            OperationKind::MqttPublish { .. } => "MqttPublish",
            OperationKind::MqttSubscribe { .. } => "MqttSubscribe",
            OperationKind::MqttUnsubscribe(_) => "MqttUnsubscribe",
            OperationKind::SetHttpConnectionArgs(_) => "SetHttpConnectionArgs",
            OperationKind::HttpPost { .. } => "HttpPost",
        };
        f.write_str(name)
    }
}

/// A unit of work flowing down the pipeline, owned by whichever stage is
/// currently processing it. Ownership transfers to a delegate on
/// [`Operation::delegate`] and the completion fires exactly once, either via
/// [`Operation::complete`] or, if the operation is dropped without being
/// completed, via the `Drop` impl below (logged as a bug: see
/// spec.md §8 invariant 1).
pub struct Operation {
    pub id: u64,
    pub kind: OperationKind,
    completion: Option<CompletionCallback>,
}

impl Operation {
    pub fn new(kind: OperationKind, completion: CompletionCallback) -> Self {
        Operation {
            id: NEXT_OPERATION_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            completion: Some(completion),
        }
    }

    /// Complete this operation. Exactly one of `complete`, `succeed`,
    /// `succeed_with`, or `fail` may run for a given operation.
    pub fn complete(mut self, result: OperationResult) {
        if let Some(cb) = self.completion.take() {
            cb(result);
        } else {
            log::error!(
                "Operation {} ({:?}) completed twice; second completion ignored",
                self.id,
                self.kind
            );
        }
    }

    pub fn succeed(self) {
        self.complete(Ok(OperationResponse::None));
    }

    pub fn succeed_with(self, response: OperationResponse) {
        self.complete(Ok(response));
    }

    pub fn fail(self, error: PipelineError) {
        self.complete(Err(error));
    }

    /// Delegate: replace this operation's kind with `new_kind`, handing the
    /// *same* completion callback to the delegate so the delegate's result
    /// mirrors back to whoever is waiting on the original operation (spec.md
    /// §4.2 "Delegate").
    pub fn delegate(mut self, new_kind: OperationKind) -> Operation {
        let completion = self
            .completion
            .take()
            .expect("delegate called on an already-completed operation");
        Operation {
            id: self.id,
            kind: new_kind,
            completion: Some(completion),
        }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if let Some(cb) = self.completion.take() {
            log::error!(
                "Operation {} ({:?}) dropped without completing; completing as Cancelled",
                self.id,
                self.kind
            );
            cb(Err(PipelineError::Cancelled(
                "operation dropped without completion".to_string(),
            )));
        }
    }
}
