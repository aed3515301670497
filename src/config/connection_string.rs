//! Device/module connection string parsing, per spec.md §6 "Connection
//! string". Grounded in `azure_provisioning_e2e/connection_string.py` from
//! the original source: semicolon-separated `Key=Value` pairs, duplicate
//! keys or a missing required key is `InvalidArgument`.

use std::collections::HashMap;
use std::fmt;

use crate::errors::PipelineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStringInfo {
    pub host_name: String,
    pub device_id: String,
    pub module_id: Option<String>,
    pub shared_access_key: Option<String>,
    pub shared_access_key_name: Option<String>,
    pub gateway_host_name: Option<String>,
}

const HOST_NAME: &str = "HostName";
const DEVICE_ID: &str = "DeviceId";
const MODULE_ID: &str = "ModuleId";
const SHARED_ACCESS_KEY: &str = "SharedAccessKey";
const SHARED_ACCESS_KEY_NAME: &str = "SharedAccessKeyName";
const GATEWAY_HOST_NAME: &str = "GatewayHostName";

/// Parse a connection string. Fails with [`PipelineError::InvalidArgument`]
/// on a duplicate key, an unparsable `Key=Value` pair, or a missing
/// `HostName`/`DeviceId`.
pub fn parse(connection_string: &str) -> Result<ConnectionStringInfo, PipelineError> {
    let mut fields: HashMap<String, String> = HashMap::new();

    for pair in connection_string.split(';').filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "malformed connection string segment `{pair}`; expected `Key=Value`"
            ))
        })?;

        if fields.insert(key.to_string(), value.to_string()).is_some() {
            return Err(PipelineError::InvalidArgument(format!(
                "duplicate key `{key}` in connection string"
            )));
        }
    }

    let host_name = fields.remove(HOST_NAME).ok_or_else(|| {
        PipelineError::InvalidArgument("connection string is missing `HostName`".to_string())
    })?;
    let device_id = fields.remove(DEVICE_ID).ok_or_else(|| {
        PipelineError::InvalidArgument("connection string is missing `DeviceId`".to_string())
    })?;
    let module_id = fields.remove(MODULE_ID);
    let shared_access_key = fields.remove(SHARED_ACCESS_KEY);
    let shared_access_key_name = fields.remove(SHARED_ACCESS_KEY_NAME);
    let gateway_host_name = fields.remove(GATEWAY_HOST_NAME);

    if module_id.is_some() && shared_access_key.is_none() {
        return Err(PipelineError::InvalidArgument(
            "module connection string is missing `SharedAccessKey`".to_string(),
        ));
    }

    if !fields.is_empty() {
        let unknown: Vec<_> = fields.into_keys().collect();
        return Err(PipelineError::InvalidArgument(format!(
            "connection string has unrecognized keys: {}",
            unknown.join(", ")
        )));
    }

    Ok(ConnectionStringInfo {
        host_name,
        device_id,
        module_id,
        shared_access_key,
        shared_access_key_name,
        gateway_host_name,
    })
}

impl fmt::Display for ConnectionStringInfo {
    /// Stringifies in a fixed key order. This does not reproduce the
    /// original key order but round-trips: `parse(s.to_string()) == s`
    /// for any `s` produced by this impl, satisfying spec.md §8 invariant 7
    /// ("modulo key order").
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HOST_NAME}={}", self.host_name)?;
        write!(f, ";{DEVICE_ID}={}", self.device_id)?;
        if let Some(module_id) = &self.module_id {
            write!(f, ";{MODULE_ID}={module_id}")?;
        }
        if let Some(key) = &self.shared_access_key {
            write!(f, ";{SHARED_ACCESS_KEY}={key}")?;
        }
        if let Some(name) = &self.shared_access_key_name {
            write!(f, ";{SHARED_ACCESS_KEY_NAME}={name}")?;
        }
        if let Some(gateway) = &self.gateway_host_name {
            write!(f, ";{GATEWAY_HOST_NAME}={gateway}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_device_string() {
        let info = parse("HostName=h.example;DeviceId=d;SharedAccessKey=Zm9vYmFy")
            .expect("should parse");
        assert_eq!(info.host_name, "h.example");
        assert_eq!(info.device_id, "d");
        assert_eq!(info.shared_access_key.as_deref(), Some("Zm9vYmFy"));
        assert!(info.module_id.is_none());
    }

    #[test]
    fn round_trip_with_gateway() {
        let original =
            "HostName=my.host.name;DeviceId=my-device;SharedAccessKey=Zm9vYmFy;GatewayHostName=mygateway";
        let info = parse(original).expect("should parse");
        assert_eq!(info.to_string(), original);

        let reparsed = parse(&info.to_string()).expect("re-parse should succeed");
        assert_eq!(info, reparsed);
    }

    #[test]
    fn module_connection_string_requires_key() {
        let err = parse("HostName=h;DeviceId=d;ModuleId=m").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn missing_host_name_is_invalid_argument() {
        let err = parse("DeviceId=d;SharedAccessKey=Zm9vYmFy").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn duplicate_key_is_invalid_argument() {
        let err =
            parse("HostName=h;HostName=h2;DeviceId=d;SharedAccessKey=Zm9vYmFy").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }

    #[test]
    fn malformed_segment_is_invalid_argument() {
        let err = parse("HostName=h;garbage;DeviceId=d").unwrap_err();
        assert!(matches!(err, PipelineError::InvalidArgument(_)));
    }
}
