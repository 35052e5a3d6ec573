// fkv-common - Shared wire-protocol types for FlareKV
//
// This crate defines the RESP2 value model, the incremental parser used by
// the server front-end, the reply formatter, and the shared error type.

pub mod error;
pub mod resp;

// Re-export for convenience
pub use error::{FkvError, FkvResult};
pub use resp::{encode_command, Parsed, Parser, Value};
