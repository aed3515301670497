//! `HTTPTransport` (spec.md §4.7): the bottom-most stage of the Edge HTTP
//! pipeline. Stores connection args set once at startup and runs each
//! `HttpPost` on a blocking thread, since `ureq` is synchronous and the
//! pipeline executor must never block on network I/O.

use std::sync::{Arc, Mutex};

use crate::errors::PipelineError;
use crate::http::transport::{self, HttpTransportConfig};
use crate::operation::{Operation, OperationKind, OperationResponse};
use crate::pipeline::{PipelineLink, Stage};

pub struct HTTPTransport {
    config: Mutex<Option<HttpTransportConfig>>,
}

impl HTTPTransport {
    pub fn new() -> Arc<HTTPTransport> {
        Arc::new(HTTPTransport {
            config: Mutex::new(None),
        })
    }
}

impl Stage for HTTPTransport {
    fn name(&self) -> &'static str {
        "HTTPTransport"
    }

    fn run_op(&self, op: Operation, link: PipelineLink) {
        match &op.kind {
            OperationKind::SetHttpConnectionArgs(args) => {
                *self.config.lock().expect("http config mutex poisoned") = Some(HttpTransportConfig {
                    hostname: args.hostname.clone(),
                    ca_cert: args.ca_cert.clone(),
                    client_cert: args.client_cert.clone(),
                });
                op.succeed();
            }

            OperationKind::HttpPost { .. } => {
                let Some(config) = self.config.lock().expect("http config mutex poisoned").clone() else {
                    return op.fail(PipelineError::InvalidArgument(
                        "no HTTP connection args set before sending a request".to_string(),
                    ));
                };
                let OperationKind::HttpPost { url, headers, body } = op.kind else {
                    unreachable!("matched above")
                };

                tokio::task::spawn_local(async move {
                    let result = tokio::task::spawn_blocking(move || transport::post(&config, &url, &headers, &body)).await;
                    match result {
                        Ok(Ok(response)) => op.complete(Ok(OperationResponse::HttpResponse {
                            status: response.status,
                            body: response.body,
                        })),
                        Ok(Err(e)) => op.fail(e),
                        Err(join_err) => op.fail(PipelineError::Fatal(format!(
                            "HTTP request blocking task panicked: {join_err}"
                        ))),
                    }
                });
            }

            _ => link.forward(op),
        }
    }
}
