//! Gemini-style provider.
//!
//! Tier 1: chat, chat_stream, models, model_detail, token_count
//! Tier 2: embeddings
//! Tier 3: –
//!
//! Wire quirks: the model is part of the endpoint path, the API key is a
//! query parameter (no auth header), roles are reduced to `user` and
//! `model`, and consecutive same-role messages must be merged.

use reqwest::header::HeaderMap;
use serde_json::{json, Value};

use super::provider::{declare_capabilities, get_json, post_json, Provider, ProviderCore};
use super::types::*;
use crate::error::Result;

pub struct GeminiProvider {
    core: ProviderCore,
}

impl GeminiProvider {
    pub fn new(core: ProviderCore) -> Self {
        Self { core }
    }

    fn model_url(&self, model: &str, action: &str, extra_query: &str) -> String {
        format!(
            "{}/models/{}:{}?{}key={}",
            self.core.config.api_base, model, action, extra_query, self.core.api_key
        )
    }

    fn role_for(role: &str) -> &'static str {
        if role == "assistant" {
            "model"
        } else {
            "user"
        }
    }

    /// Messages → `contents`, merging consecutive same-role entries so
    /// the output alternates strictly between `user` and `model`.
    fn to_contents(&self, messages: &[ChatMessage]) -> Vec<Value> {
        let mut contents: Vec<Value> = Vec::new();
        for message in messages {
            let role = Self::role_for(&message.role);
            let parts = self.to_parts(&message.content);
            if parts.is_empty() {
                continue;
            }
            match contents.last_mut() {
                Some(last) if last["role"] == role => {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                    }
                }
                _ => contents.push(json!({ "role": role, "parts": parts })),
            }
        }
        contents
    }

    fn to_parts(&self, content: &MessageContent) -> Vec<Value> {
        content
            .to_blocks()
            .iter()
            .map(|block| match block {
                ContentBlock::Text { text } => json!({ "text": text }),
                ContentBlock::Image { media_type, data } => json!({
                    "inline_data": { "mime_type": media_type, "data": data }
                }),
                ContentBlock::Document { data, .. } => json!({
                    "inline_data": { "mime_type": "application/pdf", "data": data }
                }),
                ContentBlock::ToolUse { name, input, .. } => json!({
                    "functionCall": { "name": name, "args": input }
                }),
                ContentBlock::ToolResult { tool_use_id, content } => json!({
                    "functionResponse": {
                        "name": tool_use_id,
                        "response": { "output": content }
                    }
                }),
            })
            .collect()
    }

    fn build_payload(&self, request: &ChatRequest) -> Value {
        let mut payload = json!({ "contents": self.to_contents(&request.messages) });

        if let Some(system) = &request.system {
            payload["system_instruction"] = json!({ "parts": [{ "text": system }] });
        }

        let mut generation = serde_json::Map::new();
        generation.insert("maxOutputTokens".into(), json!(request.max_tokens));
        if let Some(temperature) = request.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".into(), json!(top_p));
        }
        if let Some(stop) = &request.stop_sequences {
            generation.insert("stopSequences".into(), json!(stop));
        }
        if !generation.is_empty() {
            payload["generationConfig"] = Value::Object(generation);
        }

        if let Some(tools) = &request.tools {
            payload["tools"] = json!([{ "function_declarations": tools }]);
        }
        payload
    }
}

#[async_trait::async_trait]
impl Provider for GeminiProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    /// No auth header — the key travels as a query parameter.
    fn headers(&self) -> Result<HeaderMap> {
        Ok(HeaderMap::new())
    }

    fn chat_endpoint(&self, model: &str) -> String {
        self.model_url(model, "generateContent", "")
    }

    fn stream_endpoint(&self, model: &str) -> String {
        self.model_url(model, "streamGenerateContent", "alt=sse&")
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<Value> {
        Ok(self.build_payload(request))
    }

    /// Streaming is selected by the endpoint, not a payload flag.
    fn transform_stream_request(&self, request: &ChatRequest) -> Result<Value> {
        Ok(self.build_payload(request))
    }

    fn transform_response(&self, raw: Value) -> Result<ChatResponse> {
        let mut content = String::new();
        let mut content_blocks: Vec<Value> = Vec::new();
        let mut stop_reason = None;

        if let Some(candidate) = raw["candidates"].as_array().and_then(|c| c.first()) {
            stop_reason = candidate["finishReason"]
                .as_str()
                .map(|r| r.to_lowercase())
                .or(Some("stop".into()));
            for part in candidate["content"]["parts"].as_array().into_iter().flatten() {
                if let Some(text) = part["text"].as_str() {
                    content.push_str(text);
                    content_blocks.push(json!({ "type": "text", "text": text }));
                } else if let Some(call) = part.get("functionCall") {
                    content_blocks.push(json!({
                        "type": "tool_use",
                        "name": call["name"].as_str().unwrap_or_default(),
                        "input": call.get("args").cloned().unwrap_or(json!({})),
                    }));
                }
            }
        }

        Ok(ChatResponse {
            content,
            model: raw["modelVersion"]
                .as_str()
                .map(String::from)
                .unwrap_or_else(|| self.default_model()),
            usage: TokenUsage {
                input_tokens: raw["usageMetadata"]["promptTokenCount"].as_u64().unwrap_or(0),
                output_tokens: raw["usageMetadata"]["candidatesTokenCount"]
                    .as_u64()
                    .unwrap_or(0),
            },
            provider: self.name().to_string(),
            stop_reason,
            content_blocks: Some(content_blocks),
        })
    }

    fn parse_stream_chunk(&self, line: &str) -> Option<StreamChunk> {
        let event: Value = serde_json::from_str(line).ok()?;

        let Some(candidate) = event["candidates"].as_array().and_then(|c| c.first()) else {
            let usage = &event["usageMetadata"];
            if usage.is_object() {
                return Some(StreamChunk::Usage {
                    usage: PartialUsage {
                        input_tokens: Some(usage["promptTokenCount"].as_u64().unwrap_or(0)),
                        output_tokens: Some(usage["candidatesTokenCount"].as_u64().unwrap_or(0)),
                    },
                    model: None,
                });
            }
            return None;
        };

        if matches!(
            candidate["finishReason"].as_str(),
            Some("STOP") | Some("MAX_TOKENS")
        ) {
            return Some(StreamChunk::Done {
                model: event["modelVersion"].as_str().map(String::from),
            });
        }

        let text: String = candidate["content"]["parts"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|p| p["text"].as_str())
            .collect();
        if text.is_empty() {
            return None;
        }
        Some(StreamChunk::ContentDelta {
            content: text,
            model: event["modelVersion"].as_str().map(String::from),
        })
    }

    fn capabilities(&self) -> CapabilitiesResponse {
        declare_capabilities(
            self.name(),
            &["chat", "chat_stream", "models_list", "model_detail", "token_count"],
            &["embeddings"],
            &[],
            &[
                ("tool_use", true),
                ("vision", true),
                ("web_search", true),
                ("citations", false),
                ("thinking", true),
                ("cache_control", false),
                ("embeddings", true),
                ("audio", false),
                ("images", false),
                ("moderation", false),
            ],
        )
    }

    async fn model_detail(&self, model_id: &str) -> Result<ModelDetail> {
        let url = format!(
            "{}/models/{}?key={}",
            self.core.config.api_base, model_id, self.core.api_key
        );
        let raw = get_json(&self.core.client, &url, HeaderMap::new()).await?;
        let id = raw["name"]
            .as_str()
            .map(|name| name.rsplit('/').next().unwrap_or(name).to_string())
            .unwrap_or_else(|| model_id.to_string());
        Ok(ModelDetail {
            id,
            name: raw["displayName"].as_str().map(String::from),
            provider: self.name().to_string(),
            created: None,
            owned_by: Some("google".into()),
            context_window: raw["inputTokenLimit"].as_u64(),
            max_output_tokens: raw["outputTokenLimit"].as_u64(),
        })
    }

    async fn count_tokens(&self, request: &TokenCountRequest) -> Result<TokenCountResponse> {
        let model = self.resolve_model(request.model.as_deref());
        let mut payload = json!({ "contents": self.to_contents(&request.messages) });
        if let Some(system) = &request.system {
            payload["system_instruction"] = json!({ "parts": [{ "text": system }] });
        }
        let raw = post_json(
            &self.core.client,
            &self.model_url(&model, "countTokens", ""),
            HeaderMap::new(),
            &payload,
        )
        .await?;
        Ok(TokenCountResponse {
            input_tokens: raw["totalTokens"].as_u64().unwrap_or(0),
            model,
            provider: self.name().to_string(),
        })
    }

    /// The upstream embeds one text per call; array inputs iterate.
    async fn create_embedding(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.core.config.embedding_model.clone())
            .unwrap_or_else(|| "text-embedding-004".to_string());
        let texts = request.input.clone().into_vec();

        let mut data = Vec::with_capacity(texts.len());
        for (index, text) in texts.iter().enumerate() {
            let raw = post_json(
                &self.core.client,
                &self.model_url(&model, "embedContent", ""),
                HeaderMap::new(),
                &json!({ "content": { "parts": [{ "text": text }] } }),
            )
            .await?;
            let values = raw["embedding"]["values"]
                .as_array()
                .map(|v| v.iter().filter_map(|f| f.as_f64()).map(|f| f as f32).collect())
                .unwrap_or_default();
            data.push(EmbeddingData {
                index,
                embedding: values,
                object: "embedding".into(),
            });
        }

        let n = texts.len() as u64;
        Ok(EmbeddingResponse {
            data,
            model,
            usage: [
                ("prompt_tokens".to_string(), n),
                ("total_tokens".to_string(), n),
            ]
            .into_iter()
            .collect(),
            provider: self.name().to_string(),
        })
    }
}
