//! Configuration parsing: connection strings and SAS tokens. Treated by the
//! core pipeline as an external collaborator — these functions feed an
//! [`crate::auth::AuthProvider`], they never touch a `Stage` directly.

pub mod connection_string;
pub mod sas_token;

pub use connection_string::{parse as parse_connection_string, ConnectionStringInfo};
pub use sas_token::generate_sas_token;
