//! `EdgeHTTPConverter` (spec.md §4.3): translates Edge domain operations
//! into HTTP operations. Grounded in the teacher's `cloud/api_core.rs`
//! request-building style (`post`/`put` helpers around `ureq`), adapted
//! from Spotflow's cloud-service endpoints to IoT Hub Edge's
//! `/twins/.../methods` direct-method-invocation endpoint.

use std::sync::Arc;

use serde_json::json;

use crate::operation::{HttpConnectionArgs, Operation, OperationKind, OperationResponse};
use crate::pipeline::{PipelineLink, Stage};

const API_VERSION: &str = "2020-09-30";

pub struct EdgeHTTPConverter;

impl EdgeHTTPConverter {
    pub fn new() -> Arc<EdgeHTTPConverter> {
        Arc::new(EdgeHTTPConverter)
    }
}

impl Stage for EdgeHTTPConverter {
    fn name(&self) -> &'static str {
        "EdgeHTTPConverter"
    }

    fn run_op(&self, op: Operation, link: PipelineLink) {
        match &op.kind {
            OperationKind::SetEdgeConnectionArgs(args) => {
                let http_args = HttpConnectionArgs {
                    hostname: args.gateway_hostname.clone(),
                    ca_cert: None,
                    client_cert: None,
                };
                link.forward(op.delegate(OperationKind::SetHttpConnectionArgs(http_args)));
            }

            OperationKind::InvokeMethod(args) => {
                let target = match &args.target_module_id {
                    Some(module_id) => format!("{}/modules/{}", args.target_device_id, module_id),
                    None => args.target_device_id.clone(),
                };
                let url = format!("/twins/{target}/methods?api-version={API_VERSION}");
                let body = json!({
                    "methodName": args.method_name,
                    "responseTimeoutInSeconds": args.response_timeout_secs,
                    "connectTimeoutInSeconds": args.connect_timeout_secs,
                    "payload": serde_json::from_slice::<serde_json::Value>(&args.payload)
                        .unwrap_or(serde_json::Value::Null),
                });
                let payload = serde_json::to_vec(&body).unwrap_or_default();

                // A plain `delegate` would mirror `HttpResponse` straight
                // back to the caller, but `InvokeMethod` callers expect a
                // `MethodInvocationResult`; translate the response shape
                // instead of the raw HTTP one.
                let http_op = Operation::new(
                    OperationKind::HttpPost {
                        url,
                        headers: vec![("Content-Type".to_string(), "application/json".to_string())],
                        body: payload,
                    },
                    Box::new(move |result| {
                        let mapped = result.map(|response| match response {
                            OperationResponse::HttpResponse { status, body } => {
                                OperationResponse::MethodInvocationResult {
                                    status: status as i32,
                                    payload: body,
                                }
                            }
                            other => other,
                        });
                        op.complete(mapped);
                    }),
                );
                link.forward(http_op);
            }

            _ => link.forward(op),
        }
    }
}
