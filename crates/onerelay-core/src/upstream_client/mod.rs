use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tracing::{debug, warn};
use wreq::{Client, Method, Proxy};

use onerelay_common::GlobalConfig;
use onerelay_provider_core::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamFailure, UpstreamHttpRequest,
    UpstreamHttpResponse, UpstreamTransportErrorKind,
};
use onerelay_provider_core::writer::STREAM_BUFFER;

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
    /// Whole-request budget, streams included.
    pub request_timeout: Duration,
    /// Longest silence tolerated between two stream chunks.
    pub stream_idle_timeout: Duration,
}

impl UpstreamClientConfig {
    pub fn from_global(global: &GlobalConfig) -> Self {
        Self {
            proxy: global.proxy.clone(),
            request_timeout: Duration::from_secs(global.settings.upstream_timeout_secs.max(1)),
            ..Self::default()
        }
    }
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(300),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// One wreq client per egress proxy, picked per call from the live proxy setting.
#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    proxy_resolver: Arc<dyn Fn() -> Option<String> + Send + Sync>,
    clients: Arc<Mutex<HashMap<Option<String>, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Result<Self, wreq::Error> {
        let proxy = normalize_proxy(config.proxy.clone());
        Self::new_with_proxy_resolver(config, move || proxy.clone())
    }

    pub fn new_with_proxy_resolver<F>(
        config: UpstreamClientConfig,
        proxy_resolver: F,
    ) -> Result<Self, wreq::Error>
    where
        F: Fn() -> Option<String> + Send + Sync + 'static,
    {
        let resolver: Arc<dyn Fn() -> Option<String> + Send + Sync> = Arc::new(proxy_resolver);
        let initial_proxy = normalize_proxy(resolver());
        let initial_client = build_client(&config, initial_proxy.as_deref())?;
        let mut clients = HashMap::new();
        clients.insert(initial_proxy, initial_client);
        Ok(Self {
            config,
            proxy_resolver: resolver,
            clients: Arc::new(Mutex::new(clients)),
        })
    }

    fn client_for_proxy(&self, proxy: Option<String>) -> Result<Client, UpstreamFailure> {
        let mut clients = self
            .clients
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(client) = clients.get(&proxy) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref()).map_err(map_wreq_error)?;
        debug!(event = "upstream_client_built", proxy = proxy.is_some());
        clients.insert(proxy, client.clone());
        Ok(client)
    }
}

fn normalize_proxy(value: Option<String>) -> Option<String> {
    value
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
}

fn build_client(config: &UpstreamClientConfig, proxy: Option<&str>) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client_for_proxy(normalize_proxy((self.proxy_resolver)()))?;
            let method = match req.method {
                HttpMethod::Get => Method::GET,
                HttpMethod::Post => Method::POST,
            };
            let mut builder = client.request(method, &req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            if let Some(body) = req.body {
                builder = builder.body(body);
            }

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

/// Error responses and non-stream calls are read to the end; successful
/// streams are pumped through a bounded channel.
async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamHttpResponse, UpstreamFailure> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    if !(200..300).contains(&status) || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamHttpResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(STREAM_BUFFER);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let chunk = match tokio::time::timeout(stream_idle_timeout, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(err))) => {
                    warn!(event = "upstream_stream_error", error = %err);
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        event = "upstream_stream_idle",
                        idle_secs = stream_idle_timeout.as_secs()
                    );
                    break;
                }
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamHttpResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    map.iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn map_wreq_error(err: wreq::Error) -> UpstreamFailure {
    UpstreamFailure::Transport {
        kind: classify_wreq_error(&err),
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if err.is_connection_reset() {
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}
