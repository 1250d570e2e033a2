//! Transport layer: JSON-RPC message types, the adapter/connection traits the
//! session manager consumes, and the streamable-HTTP implementation.

pub mod adapter;
pub mod http;
pub mod protocol;
pub mod sse;
pub mod testing;

pub use adapter::{
    execute_operation, Connection, InitializeOutcome, OperationSpec, TransportAdapter,
    TransportConfig, TransportError,
};
pub use http::StreamableHttpAdapter;
