//! The HTTP transport adapter (spec.md §4.7 / SPEC_FULL §4.10), used by the
//! Edge direct-method-invocation pipeline. Grounded in the teacher's
//! `cloud/api_core::send` (`ureq` + a `native-tls` connector, status-code
//! and transport-error classification), generalized from POST/PUT-with-JSON
//! to an arbitrary method-agnostic `url`/`headers`/`body` request and
//! extended with optional mTLS via a client [`ClientCertificate`].

use std::sync::Arc;
use std::time::Duration;

use crate::errors::PipelineError;
use crate::operation::ClientCertificate;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpTransportConfig {
    pub hostname: String,
    pub ca_cert: Option<Vec<u8>>,
    pub client_cert: Option<ClientCertificate>,
}

pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Build the `ureq` agent for `config` and send `body` as a POST to
/// `https://{hostname}{url}`. Synchronous — callers run this on a blocking
/// thread (`tokio::task::spawn_blocking`), never directly on the pipeline
/// executor.
pub fn post(
    config: &HttpTransportConfig,
    url: &str,
    headers: &[(String, String)],
    body: &[u8],
) -> Result<HttpResponse, PipelineError> {
    let connector = build_tls_connector(config)?;
    let agent = ureq::AgentBuilder::new()
        .tls_connector(Arc::new(connector))
        .timeout(REQUEST_TIMEOUT)
        .build();

    let full_url = format!("https://{}{}", config.hostname, url);
    let mut request = agent.post(&full_url);
    for (name, value) in headers {
        request = request.set(name, value);
    }

    match request.send_bytes(body) {
        Ok(response) => Ok(read_response(response)),
        Err(ureq::Error::Status(_, response)) => Ok(read_response(response)),
        Err(ureq::Error::Transport(e)) => Err(PipelineError::ConnectionFailed(e.to_string())),
    }
}

fn read_response(response: ureq::Response) -> HttpResponse {
    use std::io::Read;

    let status = response.status();
    let mut body = Vec::new();
    let _ = response.into_reader().take(16 * 1024 * 1024).read_to_end(&mut body);
    HttpResponse { status, body }
}

fn build_tls_connector(config: &HttpTransportConfig) -> Result<native_tls::TlsConnector, PipelineError> {
    let mut builder = native_tls::TlsConnector::builder();

    if let Some(ca_cert) = &config.ca_cert {
        let cert = native_tls::Certificate::from_pem(ca_cert)
            .map_err(|e| PipelineError::InvalidArgument(format!("invalid CA certificate: {e}")))?;
        builder.add_root_certificate(cert);
    }

    if let Some(client_cert) = &config.client_cert {
        let identity = native_tls::Identity::from_pkcs8(&client_cert.certificate_pem, &client_cert.private_key_pem)
            .map_err(|e| PipelineError::InvalidArgument(format!("invalid client certificate: {e}")))?;
        builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| PipelineError::Fatal(format!("failed to build TLS connector: {e}")))
}
