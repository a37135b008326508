//! Abstract provider: the seven translation hooks plus shared plumbing.
//!
//! A concrete provider supplies auth headers, endpoint resolution, the
//! canonical↔upstream transforms, and an SSE-line parser. Everything
//! else — connection lifecycle, capability declaration, the retried
//! chat/stream orchestration, and the *not available* defaults for the
//! extended and specialized tiers — lives here. Providers opt into a
//! tier by overriding its methods; tier membership is declared as data
//! in `capabilities()`.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Client;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use super::retry::{with_retry, RateLimitTracker};
use super::types::*;
use crate::config::{ProviderConfig, RetryConfig};
use crate::error::{GatewayError, Result};
use crate::ingest::Extractors;

/// Stream of canonical chunks — boxed for trait-object safety. Errors
/// travel in-band as `error` chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = StreamChunk> + Send>>;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared per-provider state: config, key, HTTP client, connection flag,
/// rate-limit tracker, and the extractor registry for capability-driven
/// content adaptation.
pub struct ProviderCore {
    pub config: ProviderConfig,
    pub api_key: String,
    pub client: Client,
    pub extractors: Arc<Extractors>,
    connected: AtomicBool,
    rate_limits: RateLimitTracker,
}

impl ProviderCore {
    pub fn new(config: ProviderConfig, api_key: String, extractors: Arc<Extractors>) -> Self {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            config,
            api_key,
            client,
            extractors,
            connected: AtomicBool::new(false),
            rate_limits: RateLimitTracker::new(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn core(&self) -> &ProviderCore;

    // ─── Required hooks ──────────────────────────────────────────────────

    /// Auth headers. Content-Type is set by the request builder.
    fn headers(&self) -> Result<HeaderMap>;

    /// Endpoint for a non-streaming chat with `model`.
    fn chat_endpoint(&self, model: &str) -> String;

    /// Canonical request → upstream payload.
    fn transform_request(&self, request: &ChatRequest) -> Result<Value>;

    /// Same, with the provider's streaming flag applied.
    fn transform_stream_request(&self, request: &ChatRequest) -> Result<Value>;

    /// Upstream response body → canonical response.
    fn transform_response(&self, raw: Value) -> Result<ChatResponse>;

    /// One SSE data line (without the `data: ` prefix) → canonical chunk.
    /// `None` skips the line.
    fn parse_stream_chunk(&self, line: &str) -> Option<StreamChunk>;

    /// Tier and feature declaration.
    fn capabilities(&self) -> CapabilitiesResponse;

    // ─── Provided: identity & lifecycle ──────────────────────────────────

    fn name(&self) -> &str {
        &self.core().config.name
    }

    fn models(&self) -> Vec<String> {
        self.core().config.models()
    }

    fn default_model(&self) -> String {
        self.core().config.default_model.clone()
    }

    fn retry_config(&self) -> &RetryConfig {
        &self.core().config.retry
    }

    fn rate_limits(&self) -> &RateLimitTracker {
        &self.core().rate_limits
    }

    fn is_connected(&self) -> bool {
        self.core().connected.load(Ordering::Relaxed)
    }

    fn connect(&self) -> ConnectionStatus {
        self.core().connected.store(true, Ordering::Relaxed);
        ConnectionStatus {
            status: "connected".into(),
            provider: self.name().into(),
            timestamp: now_rfc3339(),
            reset: None,
        }
    }

    fn disconnect(&self) -> ConnectionStatus {
        self.core().connected.store(false, Ordering::Relaxed);
        ConnectionStatus {
            status: "disconnected".into(),
            provider: self.name().into(),
            timestamp: now_rfc3339(),
            reset: None,
        }
    }

    fn reset(&self) -> ConnectionStatus {
        self.disconnect();
        let mut status = self.connect();
        status.reset = Some(true);
        status
    }

    fn health(&self) -> HealthResponse {
        HealthResponse {
            status: if self.is_connected() { "ok" } else { "disconnected" }.into(),
            provider: self.name().into(),
            timestamp: now_rfc3339(),
        }
    }

    /// Endpoint for a streaming chat; defaults to the chat endpoint.
    fn stream_endpoint(&self, model: &str) -> String {
        self.chat_endpoint(model)
    }

    /// Model the request will run against.
    fn resolve_model(&self, requested: Option<&str>) -> String {
        requested
            .filter(|m| !m.is_empty())
            .map(String::from)
            .unwrap_or_else(|| self.default_model())
    }

    fn not_available(&self, endpoint: &str) -> GatewayError {
        GatewayError::EndpointNotAvailable {
            endpoint: endpoint.into(),
            provider: self.name().into(),
        }
    }

    // ─── Provided: core chat orchestration ───────────────────────────────

    /// Non-streaming chat against the upstream, wrapped in the retry
    /// engine.
    async fn send_chat(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let model = self.resolve_model(request.model.as_deref());
        let endpoint = self.chat_endpoint(&model);
        let headers = self.headers()?;
        let payload = self.transform_request(request)?;
        let core = self.core();

        let raw = with_retry(
            || {
                let client = core.client.clone();
                let endpoint = endpoint.clone();
                let headers = headers.clone();
                let payload = payload.clone();
                async move {
                    let resp = client
                        .post(&endpoint)
                        .headers(headers)
                        .json(&payload)
                        .send()
                        .await?;
                    read_json_response(resp).await
                }
            },
            self.retry_config(),
            self.rate_limits(),
        )
        .await?;

        self.transform_response(raw)
    }

    /// Open a streaming chat. Only connection establishment (everything
    /// before the first body byte) is retried; once the stream is open,
    /// errors surface as in-band `error` chunks.
    async fn start_stream(&self, request: &ChatRequest) -> Result<reqwest::Response> {
        let model = self.resolve_model(request.model.as_deref());
        let endpoint = self.stream_endpoint(&model);
        let headers = self.headers()?;
        let payload = self.transform_stream_request(request)?;
        let core = self.core();

        with_retry(
            || {
                let client = core.client.clone();
                let endpoint = endpoint.clone();
                let headers = headers.clone();
                let payload = payload.clone();
                async move {
                    let resp = client
                        .post(&endpoint)
                        .headers(headers)
                        .json(&payload)
                        .send()
                        .await?;
                    let status = resp.status();
                    if !status.is_success() {
                        let retry_after = header_retry_after(resp.headers());
                        let body = resp.text().await.unwrap_or_default();
                        return Err(upstream_error(status.as_u16(), retry_after, &body));
                    }
                    Ok(resp)
                }
            },
            self.retry_config(),
            self.rate_limits(),
        )
        .await
    }

    // ─── Tier 1 extras (opt-in) ──────────────────────────────────────────

    async fn model_detail(&self, _model_id: &str) -> Result<ModelDetail> {
        Err(self.not_available("GET /models/{id}"))
    }

    async fn count_tokens(&self, _request: &TokenCountRequest) -> Result<TokenCountResponse> {
        Err(self.not_available("POST /tokens/count"))
    }

    // ─── Tier 2: extended (opt-in) ───────────────────────────────────────

    async fn create_embedding(&self, _request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        Err(self.not_available("POST /embeddings"))
    }

    async fn create_batch(&self, _request: &BatchCreateRequest) -> Result<BatchStatus> {
        Err(self.not_available("POST /batches"))
    }

    async fn list_batches(&self) -> Result<BatchListResponse> {
        Err(self.not_available("GET /batches"))
    }

    async fn get_batch(&self, _batch_id: &str) -> Result<BatchStatus> {
        Err(self.not_available("GET /batches/{id}"))
    }

    async fn cancel_batch(&self, _batch_id: &str) -> Result<BatchStatus> {
        Err(self.not_available("POST /batches/{id}/cancel"))
    }

    async fn batch_results(&self, _batch_id: &str) -> Result<BatchResultsResponse> {
        Err(self.not_available("GET /batches/{id}/results"))
    }

    // ─── Tier 3: specialized (opt-in) ────────────────────────────────────

    async fn create_moderation(&self, _request: &ModerationRequest) -> Result<ModerationResponse> {
        Err(self.not_available("POST /moderations"))
    }

    async fn transcribe_audio(
        &self,
        _data: Vec<u8>,
        _filename: String,
        _opts: &AudioOptions,
    ) -> Result<AudioResponse> {
        Err(self.not_available("POST /audio/transcriptions"))
    }

    async fn translate_audio(
        &self,
        _data: Vec<u8>,
        _filename: String,
        _opts: &AudioOptions,
    ) -> Result<AudioResponse> {
        Err(self.not_available("POST /audio/translations"))
    }

    async fn create_speech(&self, _request: &AudioSpeechRequest) -> Result<Vec<u8>> {
        Err(self.not_available("POST /audio/speech"))
    }

    async fn generate_image(&self, _request: &ImageGenerationRequest) -> Result<ImageResponse> {
        Err(self.not_available("POST /images/generations"))
    }

    async fn edit_image(
        &self,
        _image: Vec<u8>,
        _mask: Option<Vec<u8>>,
        _request: &ImageEditRequest,
    ) -> Result<ImageResponse> {
        Err(self.not_available("POST /images/edits"))
    }

    async fn image_variation(
        &self,
        _image: Vec<u8>,
        _request: &ImageVariationRequest,
    ) -> Result<ImageResponse> {
        Err(self.not_available("POST /images/variations"))
    }
}

/// Pump an upstream SSE body through the provider's line parser.
///
/// Lines without a `data: ` prefix are skipped; a `[DONE]` sentinel or a
/// terminal chunk ends the pump. If the receiver goes away the task
/// stops at its next send.
pub fn sse_to_chunks(provider: Arc<dyn Provider>, response: reqwest::Response) -> ChunkStream {
    let (tx, rx) = mpsc::channel::<StreamChunk>(32);

    tokio::spawn(async move {
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk) = byte_stream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let _ = tx.send(StreamChunk::Error { error: e.to_string() }).await;
                    return;
                }
            };
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            while let Some(pos) = buffer.find('\n') {
                let line: String = buffer.drain(..=pos).collect();
                let line = line.trim_end();
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data.trim() == "[DONE]" {
                    return;
                }
                if let Some(chunk) = provider.parse_stream_chunk(data) {
                    let terminal = chunk.is_terminal();
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                    if terminal {
                        return;
                    }
                }
            }
        }
    });

    Box::pin(ReceiverStream::new(rx))
}

// ─── Shared HTTP helpers ─────────────────────────────────────────────────────

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(crate) fn header_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

/// Map a non-2xx upstream body to an error, preserving `error.message`
/// when the body parses as JSON.
pub(crate) fn upstream_error(status: u16, retry_after: Option<u64>, body: &str) -> GatewayError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            let detail = json.get("error")?;
            detail
                .get("message")
                .and_then(|m| m.as_str().map(String::from))
                .or_else(|| Some(detail.to_string()))
        })
        .unwrap_or_else(|| body.to_string());
    GatewayError::Upstream {
        status,
        message,
        retry_after,
    }
}

pub(crate) async fn read_json_response(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    if !status.is_success() {
        let retry_after = header_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream_error(status.as_u16(), retry_after, &body));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| GatewayError::Parse(e.to_string()))
}

pub(crate) async fn get_json(client: &Client, url: &str, headers: HeaderMap) -> Result<Value> {
    let resp = client.get(url).headers(headers).send().await?;
    read_json_response(resp).await
}

pub(crate) async fn post_json(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    payload: &Value,
) -> Result<Value> {
    let resp = client.post(url).headers(headers).json(payload).send().await?;
    read_json_response(resp).await
}

pub(crate) async fn get_text(client: &Client, url: &str, headers: HeaderMap) -> Result<String> {
    let resp = client.get(url).headers(headers).send().await?;
    let status = resp.status();
    if !status.is_success() {
        let retry_after = header_retry_after(resp.headers());
        let body = resp.text().await.unwrap_or_default();
        return Err(upstream_error(status.as_u16(), retry_after, &body));
    }
    resp.text()
        .await
        .map_err(|e| GatewayError::Parse(e.to_string()))
}

pub(crate) async fn post_multipart(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    form: reqwest::multipart::Form,
) -> Result<Value> {
    let resp = client
        .post(url)
        .headers(headers)
        .multipart(form)
        .send()
        .await?;
    read_json_response(resp).await
}

/// Build the capabilities declaration from static tier and feature data.
pub fn declare_capabilities(
    provider: &str,
    core: &[&str],
    extended: &[&str],
    specialized: &[&str],
    features: &[(&str, bool)],
) -> CapabilitiesResponse {
    CapabilitiesResponse {
        provider: provider.into(),
        tiers: CapabilityTier {
            core: core.iter().map(|s| s.to_string()).collect(),
            extended: extended.iter().map(|s| s.to_string()).collect(),
            specialized: specialized.iter().map(|s| s.to_string()).collect(),
        },
        features: features
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect::<HashMap<_, _>>(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_error_preserves_json_message() {
        let body = r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        match upstream_error(529, None, body) {
            GatewayError::Upstream { status, message, .. } => {
                assert_eq!(status, 529);
                assert_eq!(message, "Overloaded");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn upstream_error_falls_back_to_raw_body() {
        match upstream_error(502, Some(7), "<html>bad gateway</html>") {
            GatewayError::Upstream {
                message,
                retry_after,
                ..
            } => {
                assert_eq!(message, "<html>bad gateway</html>");
                assert_eq!(retry_after, Some(7));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn retry_after_header_parses_seconds_only() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "30".parse().unwrap());
        assert_eq!(header_retry_after(&headers), Some(30));

        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(header_retry_after(&headers), None);
    }

    #[test]
    fn capability_declaration_shape() {
        let caps = declare_capabilities(
            "anthropic",
            &["chat", "chat_stream"],
            &["batches"],
            &[],
            &[("tool_use", true), ("audio", false)],
        );
        assert_eq!(caps.provider, "anthropic");
        assert_eq!(caps.tiers.core, vec!["chat", "chat_stream"]);
        assert_eq!(caps.tiers.extended, vec!["batches"]);
        assert!(caps.tiers.specialized.is_empty());
        assert_eq!(caps.features["tool_use"], true);
        assert_eq!(caps.features["audio"], false);
    }
}
