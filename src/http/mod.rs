//! The HTTP transport stage, used by the Edge direct-method-invocation
//! pipeline (spec.md §4.7).

pub mod stage;
pub mod transport;

pub use stage::HTTPTransport;
