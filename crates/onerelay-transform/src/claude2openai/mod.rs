pub mod response;
pub mod stream;
