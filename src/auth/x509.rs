//! X.509 device authentication: the client certificate/key is handed to the
//! MQTT transport instead of a username/password. Grounded in the original
//! `x509_authentication_provider.py`.

use crate::auth::{AuthCredential, AuthProvider};
use crate::errors::PipelineError;
use crate::operation::ClientCertificate;

pub struct X509AuthProvider {
    device_id: String,
    module_id: Option<String>,
    hostname: String,
    gateway_hostname: Option<String>,
    ca_cert: Option<Vec<u8>>,
    certificate: ClientCertificate,
}

impl X509AuthProvider {
    pub fn new(
        device_id: String,
        hostname: String,
        certificate_pem: Vec<u8>,
        private_key_pem: Vec<u8>,
    ) -> Self {
        X509AuthProvider {
            device_id,
            module_id: None,
            hostname,
            gateway_hostname: None,
            ca_cert: None,
            certificate: ClientCertificate {
                certificate_pem,
                private_key_pem,
            },
        }
    }

    pub fn with_gateway_hostname(mut self, gateway_hostname: String) -> Self {
        self.gateway_hostname = Some(gateway_hostname);
        self
    }

    pub fn with_ca_cert(mut self, ca_cert: Vec<u8>) -> Self {
        self.ca_cert = Some(ca_cert);
        self
    }
}

impl AuthProvider for X509AuthProvider {
    fn device_id(&self) -> &str {
        &self.device_id
    }

    fn module_id(&self) -> Option<&str> {
        self.module_id.as_deref()
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    fn gateway_hostname(&self) -> Option<&str> {
        self.gateway_hostname.as_deref()
    }

    fn ca_cert(&self) -> Option<&[u8]> {
        self.ca_cert.as_deref()
    }

    fn credential(&self) -> Result<AuthCredential, PipelineError> {
        Ok(AuthCredential::ClientCertificate(self.certificate.clone()))
    }
}
