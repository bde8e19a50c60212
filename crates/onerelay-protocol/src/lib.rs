//! Wire DTOs for the request families the gateway accepts and emits.
//!
//! Only the fields the relay reads or rewrites are typed; everything else is
//! kept in flattened `extra` maps so pass-through stays lossless.

pub mod claude;
pub mod gemini;
pub mod openai;
pub mod sse;

pub type JsonObject = serde_json::Map<String, serde_json::Value>;
