//! Authentication providers. Out of scope for the pipeline core (spec.md
//! §1 "Out of scope": "SAS token minting and HSM interaction, X.509
//! credential holders") — the pipeline only ever sees the narrow
//! [`AuthProvider`] contract via `SetAuthProvider`/`SetX509AuthProvider`.

pub mod edge_hsm;
pub mod symmetric_key;
pub mod x509;

pub use edge_hsm::{EdgeHsm, EdgeHsmAuthProvider};
pub use symmetric_key::SymmetricKeyAuthProvider;
pub use x509::X509AuthProvider;

use crate::errors::PipelineError;
use crate::operation::ClientCertificate;

/// A credential an [`AuthProvider`] hands to `UseAuthProvider` (see
/// spec.md §4.3) to populate `SetIoTHubConnectionArgs`.
pub enum AuthCredential {
    SasToken(String),
    ClientCertificate(ClientCertificate),
}

/// The narrow contract the pipeline's `UseAuthProvider` stage consumes.
/// Implementors mint SAS tokens, hold X.509 material, or delegate signing
/// to an HSM — none of that is the pipeline's concern.
pub trait AuthProvider: Send + Sync {
    fn device_id(&self) -> &str;
    fn module_id(&self) -> Option<&str>;
    fn hostname(&self) -> &str;
    fn gateway_hostname(&self) -> Option<&str>;
    fn ca_cert(&self) -> Option<&[u8]>;

    /// Produce the current credential. Called once per `Connect`/`Reconnect`
    /// so a SAS-token-based provider can mint a fresh token each time.
    fn credential(&self) -> Result<AuthCredential, PipelineError>;
}
