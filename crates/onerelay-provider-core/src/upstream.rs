//! Transport-neutral upstream HTTP types.
//!
//! Adaptors build [`UpstreamHttpRequest`]s; a concrete [`UpstreamClient`]
//! living in a higher layer performs the IO.

use std::future::Future;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub type Headers = Vec<(String, String)>;
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

/// Case-insensitive insert-or-replace.
pub fn header_set(headers: &mut Headers, name: &str, value: impl Into<String>) {
    let value = value.into();
    match headers
        .iter_mut()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
    {
        Some((_, existing)) => *existing = value,
        None => headers.push((name.to_string(), value)),
    }
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct UpstreamHttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
    pub is_stream: bool,
}

#[derive(Debug)]
pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(ByteStream),
}

#[derive(Debug)]
pub struct UpstreamHttpResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamHttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        header_get(&self.headers, "content-type")
    }

    /// Drains the body, whatever its shape.
    pub async fn into_bytes(self) -> Bytes {
        match self.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(mut rx) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = rx.recv().await {
                    buf.extend_from_slice(&chunk);
                }
                buf.freeze()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Connect,
    Dns,
    Tls,
    Other,
}

#[derive(Debug, Clone)]
pub enum UpstreamFailure {
    /// No HTTP response was received.
    Transport {
        kind: UpstreamTransportErrorKind,
        message: String,
    },
    /// Non-2xx response captured as bytes.
    Http {
        status: u16,
        headers: Headers,
        body: Bytes,
    },
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>;
}
