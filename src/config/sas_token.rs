//! SAS token minting, per spec.md §6 "SAS token":
//! `SharedAccessSignature sr={uri}&sig={hmac}&se={expiry}&skn={keyName}`.
//! Treated as an external collaborator to the pipeline core — only
//! [`crate::auth`] calls into this module.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::errors::PipelineError;

type HmacSha256 = Hmac<Sha256>;

/// Mint a SAS token for `resource_uri`, signed with the base64-encoded
/// `key`, valid for `ttl` starting now.
pub fn generate_sas_token(
    resource_uri: &str,
    key_base64: &str,
    key_name: Option<&str>,
    ttl: Duration,
) -> Result<String, PipelineError> {
    let key = BASE64.decode(key_base64).map_err(|e| {
        PipelineError::InvalidArgument(format!("shared access key is not valid base64: {e}"))
    })?;

    let expiry = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        + ttl;
    let expiry_secs = expiry.as_secs();

    let encoded_uri = urlencoding::encode(resource_uri);
    let string_to_sign = format!("{encoded_uri}\n{expiry_secs}");

    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| PipelineError::InvalidArgument(format!("invalid signing key: {e}")))?;
    mac.update(string_to_sign.as_bytes());
    let signature = BASE64.encode(mac.finalize().into_bytes());
    let encoded_signature = urlencoding::encode(&signature);

    let mut token = format!("SharedAccessSignature sr={encoded_uri}&sig={encoded_signature}&se={expiry_secs}");
    if let Some(name) = key_name {
        token.push_str(&format!("&skn={}", urlencoding::encode(name)));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_well_formed_token() {
        let token = generate_sas_token(
            "h.example/devices/d",
            "Zm9vYmFy",
            None,
            Duration::from_secs(3600),
        )
        .expect("should mint a token");

        assert!(token.starts_with("SharedAccessSignature sr="));
        assert!(token.contains("&sig="));
        assert!(token.contains("&se="));
        assert!(!token.contains("&skn="));
    }

    #[test]
    fn includes_key_name_when_present() {
        let token = generate_sas_token(
            "h.example/devices/d",
            "Zm9vYmFy",
            Some("iothubowner"),
            Duration::from_secs(60),
        )
        .expect("should mint a token");
        assert!(token.contains("&skn=iothubowner"));
    }

    #[test]
    fn rejects_non_base64_key() {
        let err = generate_sas_token("uri", "not base64!!", None, Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }
}
