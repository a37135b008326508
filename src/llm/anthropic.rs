//! Claude-style provider.
//!
//! Tier 1: chat, chat_stream, models, model_detail, token_count
//! Tier 2: batches
//! Tier 3: –

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde_json::{json, Value};

use super::provider::{
    declare_capabilities, get_json, get_text, post_json, Provider, ProviderCore,
};
use super::types::*;
use crate::error::{GatewayError, Result};

const DEFAULT_API_VERSION: &str = "2023-06-01";

pub struct AnthropicProvider {
    core: ProviderCore,
}

impl AnthropicProvider {
    pub fn new(core: ProviderCore) -> Self {
        Self { core }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.core.config.api_base, path)
    }

    /// Render message content natively. A single text block collapses to
    /// a plain string to match the API's happy path.
    fn render_content(&self, content: &MessageContent) -> Value {
        let blocks = content.to_blocks();
        if let [ContentBlock::Text { text }] = blocks.as_slice() {
            return json!(text);
        }
        let parts: Vec<Value> = blocks
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
                ContentBlock::Image { media_type, data } => json!({
                    "type": "image",
                    "source": { "type": "base64", "media_type": media_type, "data": data }
                }),
                ContentBlock::Document { data, .. } => json!({
                    "type": "document",
                    "source": {
                        "type": "base64",
                        "media_type": "application/pdf",
                        "data": data
                    }
                }),
                ContentBlock::ToolUse { id, name, input } => json!({
                    "type": "tool_use", "id": id, "name": name, "input": input
                }),
                ContentBlock::ToolResult { tool_use_id, content } => json!({
                    "type": "tool_result", "tool_use_id": tool_use_id, "content": content
                }),
            })
            .collect();
        json!(parts)
    }

    fn parse_batch(&self, raw: &Value) -> BatchStatus {
        let counts = &raw["request_counts"];
        BatchStatus {
            id: raw["id"].as_str().unwrap_or_default().to_string(),
            status: raw["processing_status"]
                .as_str()
                .or_else(|| raw["status"].as_str())
                .unwrap_or("unknown")
                .to_string(),
            total_requests: counts["total"].as_u64(),
            completed_requests: counts["succeeded"].as_u64(),
            failed_requests: counts["errored"].as_u64(),
            created_at: raw["created_at"].as_str().map(String::from),
            ended_at: raw["ended_at"].as_str().map(String::from),
            provider: self.name().to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for AnthropicProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.core.api_key)
                .map_err(|e| GatewayError::Config(format!("invalid api key: {e}")))?,
        );
        let version = self
            .core
            .config
            .api_version
            .as_deref()
            .unwrap_or(DEFAULT_API_VERSION);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_str(version)
                .map_err(|e| GatewayError::Config(format!("invalid api version: {e}")))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn chat_endpoint(&self, _model: &str) -> String {
        self.endpoint("/messages")
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<Value> {
        let model = self.resolve_model(request.model.as_deref());
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": self.render_content(&m.content) }))
            .collect();

        let mut payload = json!({
            "model": model,
            "max_tokens": request.max_tokens,
            "messages": messages,
        });
        if let Some(system) = &request.system {
            payload["system"] = json!(system);
        }
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            payload["stop_sequences"] = json!(stop);
        }
        if let Some(tools) = &request.tools {
            payload["tools"] = json!(tools);
        }
        Ok(payload)
    }

    fn transform_stream_request(&self, request: &ChatRequest) -> Result<Value> {
        let mut payload = self.transform_request(request)?;
        payload["stream"] = json!(true);
        Ok(payload)
    }

    fn transform_response(&self, raw: Value) -> Result<ChatResponse> {
        let blocks = raw["content"].as_array().cloned().unwrap_or_default();
        let content: String = blocks
            .iter()
            .filter(|b| b["type"] == "text")
            .filter_map(|b| b["text"].as_str())
            .collect();
        Ok(ChatResponse {
            content,
            model: raw["model"].as_str().unwrap_or("unknown").to_string(),
            usage: TokenUsage {
                input_tokens: raw["usage"]["input_tokens"].as_u64().unwrap_or(0),
                output_tokens: raw["usage"]["output_tokens"].as_u64().unwrap_or(0),
            },
            provider: self.name().to_string(),
            stop_reason: raw["stop_reason"].as_str().map(String::from),
            content_blocks: Some(blocks),
        })
    }

    fn parse_stream_chunk(&self, line: &str) -> Option<StreamChunk> {
        let event: Value = serde_json::from_str(line).ok()?;
        match event["type"].as_str()? {
            "message_start" => {
                let message = &event["message"];
                Some(StreamChunk::Usage {
                    usage: PartialUsage {
                        input_tokens: Some(message["usage"]["input_tokens"].as_u64().unwrap_or(0)),
                        output_tokens: Some(0),
                    },
                    model: message["model"].as_str().map(String::from),
                })
            }
            "content_block_delta" => {
                let text = event["delta"]["text"].as_str()?;
                if text.is_empty() {
                    return None;
                }
                Some(StreamChunk::delta(text))
            }
            "message_delta" => Some(StreamChunk::Usage {
                usage: PartialUsage {
                    input_tokens: None,
                    output_tokens: Some(event["usage"]["output_tokens"].as_u64().unwrap_or(0)),
                },
                model: None,
            }),
            "message_stop" => Some(StreamChunk::Done { model: None }),
            _ => None,
        }
    }

    fn capabilities(&self) -> CapabilitiesResponse {
        declare_capabilities(
            self.name(),
            &["chat", "chat_stream", "models_list", "model_detail", "token_count"],
            &["batches"],
            &[],
            &[
                ("tool_use", true),
                ("vision", true),
                ("web_search", true),
                ("citations", true),
                ("thinking", true),
                ("cache_control", true),
                ("embeddings", false),
                ("audio", false),
                ("images", false),
                ("moderation", false),
            ],
        )
    }

    async fn model_detail(&self, model_id: &str) -> Result<ModelDetail> {
        let raw = get_json(
            &self.core.client,
            &self.endpoint(&format!("/models/{model_id}")),
            self.headers()?,
        )
        .await?;
        Ok(ModelDetail {
            id: raw["id"].as_str().unwrap_or(model_id).to_string(),
            name: raw["display_name"]
                .as_str()
                .or_else(|| raw["id"].as_str())
                .map(String::from),
            provider: self.name().to_string(),
            created: None,
            owned_by: Some("anthropic".into()),
            context_window: None,
            max_output_tokens: None,
        })
    }

    async fn count_tokens(&self, request: &TokenCountRequest) -> Result<TokenCountResponse> {
        let model = self.resolve_model(request.model.as_deref());
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({ "role": m.role, "content": self.render_content(&m.content) }))
            .collect();
        let mut payload = json!({ "model": model, "messages": messages });
        if let Some(system) = &request.system {
            payload["system"] = json!(system);
        }
        if let Some(tools) = &request.tools {
            payload["tools"] = json!(tools);
        }
        let raw = post_json(
            &self.core.client,
            &self.endpoint("/messages/count_tokens"),
            self.headers()?,
            &payload,
        )
        .await?;
        Ok(TokenCountResponse {
            input_tokens: raw["input_tokens"].as_u64().unwrap_or(0),
            model,
            provider: self.name().to_string(),
        })
    }

    async fn create_batch(&self, request: &BatchCreateRequest) -> Result<BatchStatus> {
        let model = self.resolve_model(request.model.as_deref());
        let requests: Vec<Value> = request
            .requests
            .iter()
            .map(|item| {
                let mut params = item.params.clone();
                if let Some(obj) = params.as_object_mut() {
                    obj.entry("model").or_insert_with(|| json!(model));
                }
                json!({ "custom_id": item.custom_id, "params": params })
            })
            .collect();
        let raw = post_json(
            &self.core.client,
            &self.endpoint("/messages/batches"),
            self.headers()?,
            &json!({ "requests": requests }),
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    async fn list_batches(&self) -> Result<BatchListResponse> {
        let raw = get_json(
            &self.core.client,
            &self.endpoint("/messages/batches"),
            self.headers()?,
        )
        .await?;
        let items = raw["data"]
            .as_array()
            .or_else(|| raw["batches"].as_array())
            .cloned()
            .unwrap_or_default();
        Ok(BatchListResponse {
            batches: items.iter().map(|b| self.parse_batch(b)).collect(),
            provider: self.name().to_string(),
        })
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchStatus> {
        let raw = get_json(
            &self.core.client,
            &self.endpoint(&format!("/messages/batches/{batch_id}")),
            self.headers()?,
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<BatchStatus> {
        let raw = post_json(
            &self.core.client,
            &self.endpoint(&format!("/messages/batches/{batch_id}/cancel")),
            self.headers()?,
            &json!({}),
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    /// Batch results arrive as JSON-lines, one result object per line.
    async fn batch_results(&self, batch_id: &str) -> Result<BatchResultsResponse> {
        let body = get_text(
            &self.core.client,
            &self.endpoint(&format!("/messages/batches/{batch_id}/results")),
            self.headers()?,
        )
        .await?;
        let results = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .map(|entry| BatchResultItem {
                custom_id: entry["custom_id"].as_str().unwrap_or_default().to_string(),
                result: entry.get("result").cloned(),
                error: entry.get("error").cloned(),
            })
            .collect();
        Ok(BatchResultsResponse {
            batch_id: batch_id.to_string(),
            results,
            provider: self.name().to_string(),
        })
    }
}
