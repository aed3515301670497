//! `UseAuthProvider` (spec.md §4.3): turns an [`AuthProvider`] into
//! connection args for the domain converter below it, and re-derives the
//! credential on `Reconnect` so a SAS-token provider gets a fresh token
//! instead of replaying an expired one (SPEC_FULL.md §1b, grounded in the
//! teacher's `iothub/token_handler.rs` refresh loop).

use std::sync::{Arc, Mutex};

use crate::auth::{AuthCredential, AuthProvider};
use crate::errors::PipelineError;
use crate::operation::{EdgeConnectionArgs, IoTHubConnectionArgs, Operation, OperationKind};
use crate::pipeline::{PipelineLink, Stage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Domain {
    IoTHub,
    Edge,
}

pub struct UseAuthProvider {
    domain: Domain,
    provider: Mutex<Option<Arc<dyn AuthProvider>>>,
}

impl UseAuthProvider {
    pub fn new(domain: Domain) -> Arc<UseAuthProvider> {
        Arc::new(UseAuthProvider {
            domain,
            provider: Mutex::new(None),
        })
    }

    fn build_connection_args(&self, provider: &Arc<dyn AuthProvider>) -> Result<OperationKind, PipelineError> {
        match self.domain {
            Domain::IoTHub => {
                let (sas_token, client_cert) = match provider.credential()? {
                    AuthCredential::SasToken(token) => (Some(token), None),
                    AuthCredential::ClientCertificate(cert) => (None, Some(cert)),
                };
                Ok(OperationKind::SetIoTHubConnectionArgs(IoTHubConnectionArgs {
                    device_id: provider.device_id().to_string(),
                    module_id: provider.module_id().map(str::to_string),
                    hostname: provider.hostname().to_string(),
                    gateway_hostname: provider.gateway_hostname().map(str::to_string),
                    ca_cert: provider.ca_cert().map(<[u8]>::to_vec),
                    sas_token,
                    client_cert,
                }))
            }
            Domain::Edge => {
                let gateway_hostname = provider.gateway_hostname().ok_or_else(|| {
                    PipelineError::InvalidArgument(
                        "an Edge auth provider must supply a gateway hostname".to_string(),
                    )
                })?;
                Ok(OperationKind::SetEdgeConnectionArgs(EdgeConnectionArgs {
                    device_id: provider.device_id().to_string(),
                    module_id: provider.module_id().map(str::to_string),
                    gateway_hostname: gateway_hostname.to_string(),
                }))
            }
        }
    }
}

impl Stage for UseAuthProvider {
    fn name(&self) -> &'static str {
        "UseAuthProvider"
    }

    fn run_op(&self, op: Operation, link: PipelineLink) {
        if let OperationKind::SetAuthProvider(provider) | OperationKind::SetX509AuthProvider(provider) = &op.kind {
            let provider = provider.clone();
            *self.provider.lock().expect("auth provider mutex poisoned") = Some(provider.clone());
            return match self.build_connection_args(&provider) {
                Ok(new_kind) => link.forward(op.delegate(new_kind)),
                Err(e) => op.fail(e),
            };
        }

        if matches!(op.kind, OperationKind::Reconnect) {
            let provider = self
                .provider
                .lock()
                .expect("auth provider mutex poisoned")
                .clone();
            let Some(provider) = provider else {
                return link.forward(op);
            };
            return match provider.credential() {
                Ok(AuthCredential::SasToken(token)) => {
                    let refresh = Operation::new(
                        OperationKind::SetSasToken(token),
                        Box::new(|result| {
                            if let Err(e) = result {
                                log::warn!("SAS token refresh before reconnect failed: {e}");
                            }
                        }),
                    );
                    link.forward(refresh);
                    link.forward(op);
                }
                Ok(AuthCredential::ClientCertificate(_)) => link.forward(op),
                Err(e) => op.fail(e),
            };
        }

        link.forward(op);
    }
}
