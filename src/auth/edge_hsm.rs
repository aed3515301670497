//! Edge HSM authentication. The HSM itself is out of scope (spec.md §1): we
//! only define the narrow contract a real HSM client implements, and an
//! `AuthProvider` that signs SAS tokens through it instead of a local key.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::auth::{AuthCredential, AuthProvider};
use crate::errors::PipelineError;

/// Narrow contract for an Edge security daemon / HSM: sign arbitrary bytes
/// and return the raw signature. The pipeline never talks to the HSM
/// directly; only this trait does.
pub trait EdgeHsm: Send + Sync {
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>, PipelineError>;
}

pub struct EdgeHsmAuthProvider {
    device_id: String,
    module_id: Option<String>,
    hostname: String,
    gateway_hostname: Option<String>,
    hsm: Box<dyn EdgeHsm>,
    token_ttl: Duration,
}

impl EdgeHsmAuthProvider {
    pub fn new(
        device_id: String,
        module_id: Option<String>,
        hostname: String,
        gateway_hostname: String,
        hsm: Box<dyn EdgeHsm>,
    ) -> Self {
        EdgeHsmAuthProvider {
            device_id,
            module_id,
            hostname,
            gateway_hostname: Some(gateway_hostname),
            hsm,
            token_ttl: Duration::from_secs(3600),
        }
    }

    fn resource_uri(&self) -> String {
        match &self.module_id {
            Some(module_id) => format!(
                "{}/devices/{}/modules/{}",
                self.hostname, self.device_id, module_id
            ),
            None => format!("{}/devices/{}", self.hostname, self.device_id),
        }
    }
}

impl AuthProvider for EdgeHsmAuthProvider {
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
        None
    }

    fn credential(&self) -> Result<AuthCredential, PipelineError> {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            + self.token_ttl;
        let expiry_secs = expiry.as_secs();

        let encoded_uri = urlencoding::encode(&self.resource_uri()).into_owned();
        let string_to_sign = format!("{encoded_uri}\n{expiry_secs}");

        let signature = self.hsm.sign(string_to_sign.as_bytes())?;
        let encoded_signature = urlencoding::encode(&BASE64.encode(signature)).into_owned();

        Ok(AuthCredential::SasToken(format!(
            "SharedAccessSignature sr={encoded_uri}&sig={encoded_signature}&se={expiry_secs}"
        )))
    }
}
