//! Pure conversions between wire families.
//!
//! Nothing here performs network IO; remote images are resolved through the
//! [`ImageLoader`] seam supplied by the caller.

pub mod claude2openai;
mod error;
pub mod gemini2openai;
pub mod image;
pub mod openai2claude;

pub use error::TransformError;
pub use image::{ImageLoader, LoadedImage};
