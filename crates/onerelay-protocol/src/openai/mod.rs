pub mod audio;
pub mod chat;
pub mod embeddings;
pub mod error;
pub mod images;
pub mod models;
pub mod rerank;
pub mod usage;

pub use error::{OpenAIError, OpenAIErrorBody};
pub use usage::{CompletionTokensDetails, PromptTokensDetails, Usage};
