pub mod error;
pub mod messages;
pub mod stream;

pub use error::{ClaudeErrorBody, ClaudeErrorDetail};
