use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use onerelay_protocol::openai::embeddings::EmbeddingRequest;
use onerelay_provider_core::{
    Adaptor, AdaptorOutput, AdaptorRegistry, ByteStream, CallerInfo, Channel, ChannelType,
    Headers, ProviderError, ProviderResult, RelayError, RelayFormat, RelayInfo, RelayMode,
    RequestBody, RequestMeta, ResponseWriter, UpstreamBody, UpstreamClient, UpstreamFailure,
    UpstreamHttpRequest, UpstreamHttpResponse, Usage, header_get, header_set,
};

struct EchoAdaptor;

#[async_trait]
impl Adaptor for EchoAdaptor {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn build_request_url(&self, info: &RelayInfo) -> ProviderResult<String> {
        Ok(format!("{}{}", info.base_url, info.mode.path()))
    }

    fn setup_request_headers(&self, info: &RelayInfo, headers: &mut Headers) -> ProviderResult<()> {
        header_set(headers, "authorization", format!("Bearer {}", info.api_key));
        header_set(headers, "x-trace", "adaptor");
        Ok(())
    }

    async fn handle_batch(
        &self,
        _info: &mut RelayInfo,
        status: u16,
        content_type: String,
        body: Bytes,
    ) -> Result<AdaptorOutput, RelayError> {
        Ok(AdaptorOutput::Batch {
            status,
            content_type,
            body,
            usage: Usage::new(3, 4),
        })
    }

    async fn handle_stream(
        &self,
        info: &mut RelayInfo,
        mut rx: ByteStream,
        writer: &mut ResponseWriter,
    ) -> Result<AdaptorOutput, RelayError> {
        while let Some(chunk) = rx.recv().await {
            writer.write_raw(info, chunk).await;
        }
        Ok(AdaptorOutput::Stream {
            usage: Usage::new(1, 1),
            truncated: false,
        })
    }
}

struct CannedClient;

impl UpstreamClient for CannedClient {
    fn send<'a>(
        &'a self,
        req: UpstreamHttpRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamHttpResponse, UpstreamFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            Ok(UpstreamHttpResponse {
                status: 200,
                headers: vec![("content-type".to_string(), "application/json".to_string())],
                body: UpstreamBody::Bytes(req.body.unwrap_or_default()),
            })
        })
    }
}

fn relay_info(stream: bool) -> RelayInfo {
    let mut channel = Channel::new(5, "echo", ChannelType::Custom);
    channel.base_url = Some("https://relay.example/".to_string());
    channel
        .header_override
        .insert("X-Trace".to_string(), "override".to_string());
    let caller = CallerInfo {
        user_id: 1,
        token_id: 2,
        token_name: "t".to_string(),
        group: "default".to_string(),
        is_root: false,
        token_unlimited: false,
        accept_unset_ratio_model: false,
    };
    let meta = RequestMeta {
        mode: RelayMode::Embeddings,
        format: RelayFormat::OpenAI,
        origin_model: "text-embedding-3-small".to_string(),
        is_stream: stream,
        include_usage: false,
        prompt_tokens: 0,
        max_tokens: 0,
    };
    RelayInfo::new(&caller, &channel, "sk-echo", &meta)
}

#[tokio::test]
async fn unimplemented_conversions_are_unsupported() {
    let mut info = relay_info(false);
    let req: EmbeddingRequest =
        serde_json::from_str(r#"{"model":"text-embedding-3-small","input":"hi"}"#).unwrap();
    let err = EchoAdaptor
        .convert_embedding_request(&mut info, req)
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::Unsupported(_)));
    assert!(RelayError::from(err).is_local());
}

#[tokio::test]
async fn build_request_applies_header_overrides_last() {
    let info = relay_info(true);
    let body = RequestBody::json(&serde_json::json!({"input": "hi"})).unwrap();
    let req = EchoAdaptor.build_request(&info, body).unwrap();
    assert_eq!(req.url, "https://relay.example/v1/embeddings");
    assert_eq!(header_get(&req.headers, "authorization"), Some("Bearer sk-echo"));
    assert_eq!(header_get(&req.headers, "x-trace"), Some("override"));
    assert_eq!(header_get(&req.headers, "accept"), Some("text/event-stream"));
    assert!(req.is_stream);
}

#[tokio::test]
async fn batch_and_stream_responses_dispatch() {
    let mut info = relay_info(false);
    let body = RequestBody::json(&serde_json::json!({"ok": true})).unwrap();
    let req = EchoAdaptor.build_request(&info, body).unwrap();
    let resp = EchoAdaptor.do_request(&CannedClient, req).await.unwrap();

    let (mut writer, _rx) = ResponseWriter::channel(RelayFormat::OpenAI, "m");
    let out = EchoAdaptor
        .do_response(&mut info, resp, &mut writer)
        .await
        .unwrap();
    match out {
        AdaptorOutput::Batch { status, body, .. } => {
            assert_eq!(status, 200);
            assert_eq!(&body[..], br#"{"ok":true}"#);
        }
        other => panic!("unexpected {other:?}"),
    }

    let (tx, upstream_rx) = tokio::sync::mpsc::channel(4);
    tx.send(Bytes::from_static(b"data: {}\n\n")).await.unwrap();
    drop(tx);
    let stream_resp = UpstreamHttpResponse {
        status: 200,
        headers: Vec::new(),
        body: UpstreamBody::Stream(upstream_rx),
    };
    let (mut writer, mut down_rx) = ResponseWriter::channel(RelayFormat::OpenAI, "m");
    let out = EchoAdaptor
        .do_response(&mut info, stream_resp, &mut writer)
        .await
        .unwrap();
    assert_eq!(out.usage(), Usage::new(1, 1));
    assert_eq!(down_rx.recv().await.unwrap(), Bytes::from_static(b"data: {}\n\n"));
    assert!(info.has_send_response());
}

#[test]
fn registry_maps_every_registered_type() {
    let mut registry = AdaptorRegistry::new();
    let adaptor: Arc<dyn Adaptor> = Arc::new(EchoAdaptor);
    registry.register(&[ChannelType::OpenAI, ChannelType::DeepSeek], adaptor);
    assert!(registry.supports(ChannelType::DeepSeek));
    assert!(registry.get(ChannelType::Anthropic).is_none());
    assert_eq!(registry.get(ChannelType::OpenAI).unwrap().name(), "echo");
}
