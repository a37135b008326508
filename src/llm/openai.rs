//! OpenAI-style provider.
//!
//! Tier 1: chat, chat_stream, models, model_detail, token_count (local BPE)
//! Tier 2: embeddings, batches
//! Tier 3: moderation, audio (transcription, translation, speech),
//!         images (generation, edit, variation)

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde_json::{json, Value};
use tiktoken_rs::CoreBPE;

use super::provider::{
    declare_capabilities, get_json, get_text, post_json, post_multipart, Provider, ProviderCore,
};
use super::types::*;
use crate::error::{GatewayError, Result};
use crate::ingest::adapt_blocks_for_provider;

pub struct OpenAiProvider {
    core: ProviderCore,
    /// Fallback encoding when the model has no registered BPE table.
    cl100k: CoreBPE,
}

impl OpenAiProvider {
    pub fn new(core: ProviderCore) -> Self {
        let cl100k = tiktoken_rs::cl100k_base().expect("failed to load cl100k tokenizer");
        Self { core, cl100k }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.core.config.api_base, path)
    }

    /// Newer model families take the token limit as `max_completion_tokens`.
    fn token_limit_key(model: &str) -> &'static str {
        if model.contains("gpt-5") || model.contains("o3") || model.contains("o4") {
            "max_completion_tokens"
        } else {
            "max_tokens"
        }
    }

    /// Render message content. Documents are pre-adapted to text because
    /// this provider has no native PDF path; a single text block
    /// collapses to a bare string.
    fn render_content(&self, content: &MessageContent) -> Value {
        let blocks = adapt_blocks_for_provider(
            content.to_blocks(),
            self.name(),
            &self.core.extractors,
        );
        if let [ContentBlock::Text { text }] = blocks.as_slice() {
            return json!(text);
        }
        let parts: Vec<Value> = blocks
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(json!({ "type": "text", "text": text })),
                ContentBlock::Image { media_type, data } => Some(json!({
                    "type": "image_url",
                    "image_url": { "url": format!("data:{media_type};base64,{data}") }
                })),
                _ => None,
            })
            .collect();
        json!(parts)
    }

    /// Re-shape one canonical message into OpenAI chat messages.
    /// Assistant tool-use blocks become `tool_calls`; user tool results
    /// fan out to one `role:tool` message per result.
    fn push_message(&self, out: &mut Vec<Value>, message: &ChatMessage) {
        let blocks = message.content.to_blocks();

        if message.role == "assistant" {
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(json!({
                        "id": id,
                        "type": "function",
                        "function": { "name": name, "arguments": input.to_string() }
                    })),
                    _ => None,
                })
                .collect();
            if !tool_calls.is_empty() {
                let text: Vec<&str> = blocks
                    .iter()
                    .filter_map(|b| match b {
                        ContentBlock::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect();
                let mut msg = json!({ "role": "assistant", "tool_calls": tool_calls });
                msg["content"] = if text.is_empty() {
                    Value::Null
                } else {
                    json!(text.join("\n"))
                };
                out.push(msg);
                return;
            }
        }

        let tool_results: Vec<Value> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult { tool_use_id, content } => Some(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": content
                })),
                _ => None,
            })
            .collect();
        if message.role == "user" && !tool_results.is_empty() {
            out.extend(tool_results);
            return;
        }

        out.push(json!({
            "role": message.role,
            "content": self.render_content(&message.content)
        }));
    }

    fn count_text(&self, bpe: &CoreBPE, text: &str) -> u64 {
        bpe.encode_ordinary(text).len() as u64
    }

    fn parse_batch(&self, raw: &Value) -> BatchStatus {
        let counts = &raw["request_counts"];
        BatchStatus {
            id: raw["id"].as_str().unwrap_or_default().to_string(),
            status: raw["status"].as_str().unwrap_or("unknown").to_string(),
            total_requests: counts["total"].as_u64(),
            completed_requests: counts["completed"].as_u64(),
            failed_requests: counts["failed"].as_u64(),
            created_at: raw["created_at"].as_i64().map(|v| v.to_string()),
            ended_at: raw["completed_at"].as_i64().map(|v| v.to_string()),
            provider: self.name().to_string(),
        }
    }

    fn parse_images(&self, raw: &Value, model: &str) -> ImageResponse {
        ImageResponse {
            data: raw["data"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|i| ImageData {
                            url: i["url"].as_str().map(String::from),
                            b64_json: i["b64_json"].as_str().map(String::from),
                            revised_prompt: i["revised_prompt"].as_str().map(String::from),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            model: model.to_string(),
            provider: self.name().to_string(),
        }
    }
}

#[async_trait::async_trait]
impl Provider for OpenAiProvider {
    fn core(&self) -> &ProviderCore {
        &self.core
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", self.core.api_key))
                .map_err(|e| GatewayError::Config(format!("invalid api key: {e}")))?,
        );
        Ok(headers)
    }

    fn chat_endpoint(&self, _model: &str) -> String {
        self.endpoint("/chat/completions")
    }

    fn transform_request(&self, request: &ChatRequest) -> Result<Value> {
        let model = self.resolve_model(request.model.as_deref());
        let mut messages: Vec<Value> = Vec::new();
        if let Some(system) = &request.system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        for message in &request.messages {
            self.push_message(&mut messages, message);
        }

        let mut payload = json!({ "model": model, "messages": messages });
        payload[Self::token_limit_key(&model)] = json!(request.max_tokens);
        if let Some(temperature) = request.temperature {
            payload["temperature"] = json!(temperature);
        }
        if let Some(top_p) = request.top_p {
            payload["top_p"] = json!(top_p);
        }
        if let Some(stop) = &request.stop_sequences {
            payload["stop"] = json!(stop);
        }
        if let Some(tools) = &request.tools {
            payload["tools"] = json!(tools);
        }
        Ok(payload)
    }

    fn transform_stream_request(&self, request: &ChatRequest) -> Result<Value> {
        let mut payload = self.transform_request(request)?;
        payload["stream"] = json!(true);
        payload["stream_options"] = json!({ "include_usage": true });
        Ok(payload)
    }

    fn transform_response(&self, raw: Value) -> Result<ChatResponse> {
        let choice = &raw["choices"][0];
        let message = &choice["message"];
        let content = message["content"].as_str().unwrap_or_default().to_string();

        // rebuild a canonical block list from text + tool calls
        let mut content_blocks: Vec<Value> = Vec::new();
        if !content.is_empty() {
            content_blocks.push(json!({ "type": "text", "text": content }));
        }
        for call in message["tool_calls"].as_array().into_iter().flatten() {
            let arguments = call["function"]["arguments"].as_str().unwrap_or("{}");
            content_blocks.push(json!({
                "type": "tool_use",
                "id": call["id"].as_str().unwrap_or_default(),
                "name": call["function"]["name"].as_str().unwrap_or_default(),
                "input": serde_json::from_str::<Value>(arguments).unwrap_or(json!({})),
            }));
        }

        let stop_reason = choice["finish_reason"].as_str().map(|reason| {
            if reason == "tool_calls" {
                "tool_use".to_string()
            } else {
                reason.to_string()
            }
        });

        Ok(ChatResponse {
            content,
            model: raw["model"].as_str().unwrap_or("unknown").to_string(),
            usage: TokenUsage {
                input_tokens: raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
                output_tokens: raw["usage"]["completion_tokens"].as_u64().unwrap_or(0),
            },
            provider: self.name().to_string(),
            stop_reason,
            content_blocks: Some(content_blocks),
        })
    }

    fn parse_stream_chunk(&self, line: &str) -> Option<StreamChunk> {
        let event: Value = serde_json::from_str(line).ok()?;
        let model = event["model"].as_str().map(String::from);

        if let Some(usage) = event.get("usage").filter(|u| !u.is_null()) {
            return Some(StreamChunk::Usage {
                usage: PartialUsage {
                    input_tokens: Some(usage["prompt_tokens"].as_u64().unwrap_or(0)),
                    output_tokens: Some(usage["completion_tokens"].as_u64().unwrap_or(0)),
                },
                model,
            });
        }

        let choice = event["choices"].as_array()?.first()?;
        if choice["finish_reason"] == "stop" {
            return Some(StreamChunk::Done { model });
        }
        let content = choice["delta"]["content"].as_str()?;
        if content.is_empty() {
            return None;
        }
        Some(StreamChunk::ContentDelta {
            content: content.to_string(),
            model,
        })
    }

    fn capabilities(&self) -> CapabilitiesResponse {
        declare_capabilities(
            self.name(),
            &["chat", "chat_stream", "models_list", "model_detail", "token_count"],
            &["embeddings", "batches"],
            &[
                "moderation",
                "audio_transcription",
                "audio_translation",
                "audio_speech",
                "image_generation",
                "image_edit",
                "image_variation",
            ],
            &[
                ("tool_use", true),
                ("vision", true),
                ("web_search", false),
                ("citations", false),
                ("thinking", true),
                ("cache_control", false),
                ("embeddings", true),
                ("audio", true),
                ("images", true),
                ("moderation", true),
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
            name: raw["id"].as_str().map(String::from),
            provider: self.name().to_string(),
            created: raw["created"].as_i64(),
            owned_by: raw["owned_by"].as_str().map(String::from),
            context_window: None,
            max_output_tokens: None,
        })
    }

    /// Local token counting via the model's BPE table; no upstream call.
    async fn count_tokens(&self, request: &TokenCountRequest) -> Result<TokenCountResponse> {
        let model = self.resolve_model(request.model.as_deref());
        let model_bpe = tiktoken_rs::get_bpe_from_model(&model).ok();
        let bpe = model_bpe.as_ref().unwrap_or(&self.cl100k);

        let mut total = 0u64;
        for message in &request.messages {
            let text: String = message
                .content
                .to_blocks()
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect();
            // per-message framing overhead, matching the chat format
            total += 4 + self.count_text(bpe, &text) + self.count_text(bpe, &message.role);
        }
        if let Some(system) = &request.system {
            total += 4 + self.count_text(bpe, system);
        }
        total += 2;

        Ok(TokenCountResponse {
            input_tokens: total,
            model,
            provider: self.name().to_string(),
        })
    }

    async fn create_embedding(&self, request: &EmbeddingRequest) -> Result<EmbeddingResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.core.config.embedding_model.clone())
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let mut payload = json!({ "model": model, "input": request.input });
        if let Some(format) = &request.encoding_format {
            payload["encoding_format"] = json!(format);
        }
        if let Some(dimensions) = request.dimensions {
            payload["dimensions"] = json!(dimensions);
        }
        let raw = post_json(
            &self.core.client,
            &self.endpoint("/embeddings"),
            self.headers()?,
            &payload,
        )
        .await?;

        let data = raw["data"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .map(|i| EmbeddingData {
                        index: i["index"].as_u64().unwrap_or(0) as usize,
                        embedding: i["embedding"]
                            .as_array()
                            .map(|v| v.iter().filter_map(|f| f.as_f64()).map(|f| f as f32).collect())
                            .unwrap_or_default(),
                        object: "embedding".into(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(EmbeddingResponse {
            data,
            model: raw["model"].as_str().unwrap_or(&model).to_string(),
            usage: [
                ("prompt_tokens".to_string(), raw["usage"]["prompt_tokens"].as_u64().unwrap_or(0)),
                ("total_tokens".to_string(), raw["usage"]["total_tokens"].as_u64().unwrap_or(0)),
            ]
            .into_iter()
            .collect(),
            provider: self.name().to_string(),
        })
    }

    /// Batch creation: upload the requests as a JSONL file, then open a
    /// batch against it.
    async fn create_batch(&self, request: &BatchCreateRequest) -> Result<BatchStatus> {
        let model = self.resolve_model(request.model.as_deref());
        let mut lines = Vec::new();
        for item in &request.requests {
            let mut body = item.params.clone();
            if let Some(obj) = body.as_object_mut() {
                obj.entry("model").or_insert_with(|| json!(model));
            }
            lines.push(
                json!({
                    "custom_id": item.custom_id,
                    "method": "POST",
                    "url": "/v1/chat/completions",
                    "body": body,
                })
                .to_string(),
            );
        }
        let jsonl = lines.join("\n");

        let part = Part::bytes(jsonl.into_bytes())
            .file_name("batch.jsonl")
            .mime_str("application/jsonl")
            .map_err(|e| GatewayError::Translation(e.to_string()))?;
        let form = Form::new().part("file", part).text("purpose", "batch");
        let upload = post_multipart(
            &self.core.client,
            &self.endpoint("/files"),
            self.headers()?,
            form,
        )
        .await?;
        let file_id = upload["id"]
            .as_str()
            .ok_or_else(|| GatewayError::Parse("file upload returned no id".into()))?;

        let raw = post_json(
            &self.core.client,
            &self.endpoint("/batches"),
            self.headers()?,
            &json!({
                "input_file_id": file_id,
                "endpoint": "/v1/chat/completions",
                "completion_window": "24h",
            }),
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    async fn list_batches(&self) -> Result<BatchListResponse> {
        let raw = get_json(&self.core.client, &self.endpoint("/batches"), self.headers()?).await?;
        Ok(BatchListResponse {
            batches: raw["data"]
                .as_array()
                .map(|items| items.iter().map(|b| self.parse_batch(b)).collect())
                .unwrap_or_default(),
            provider: self.name().to_string(),
        })
    }

    async fn get_batch(&self, batch_id: &str) -> Result<BatchStatus> {
        let raw = get_json(
            &self.core.client,
            &self.endpoint(&format!("/batches/{batch_id}")),
            self.headers()?,
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    async fn cancel_batch(&self, batch_id: &str) -> Result<BatchStatus> {
        let raw = post_json(
            &self.core.client,
            &self.endpoint(&format!("/batches/{batch_id}/cancel")),
            self.headers()?,
            &json!({}),
        )
        .await?;
        Ok(self.parse_batch(&raw))
    }

    /// Results live in the batch's output file; fetch and parse JSONL.
    async fn batch_results(&self, batch_id: &str) -> Result<BatchResultsResponse> {
        let batch = get_json(
            &self.core.client,
            &self.endpoint(&format!("/batches/{batch_id}")),
            self.headers()?,
        )
        .await?;
        let Some(output_file_id) = batch["output_file_id"].as_str() else {
            return Ok(BatchResultsResponse {
                batch_id: batch_id.to_string(),
                results: Vec::new(),
                provider: self.name().to_string(),
            });
        };
        let body = get_text(
            &self.core.client,
            &self.endpoint(&format!("/files/{output_file_id}/content")),
            self.headers()?,
        )
        .await?;
        let results = body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .map(|entry| BatchResultItem {
                custom_id: entry["custom_id"].as_str().unwrap_or_default().to_string(),
                result: entry["response"].get("body").cloned(),
                error: entry.get("error").filter(|e| !e.is_null()).cloned(),
            })
            .collect();
        Ok(BatchResultsResponse {
            batch_id: batch_id.to_string(),
            results,
            provider: self.name().to_string(),
        })
    }

    async fn create_moderation(&self, request: &ModerationRequest) -> Result<ModerationResponse> {
        let mut payload = json!({ "input": request.input });
        if let Some(model) = &request.model {
            payload["model"] = json!(model);
        }
        let raw = post_json(
            &self.core.client,
            &self.endpoint("/moderations"),
            self.headers()?,
            &payload,
        )
        .await?;
        Ok(ModerationResponse {
            id: raw["id"].as_str().unwrap_or_default().to_string(),
            results: raw["results"]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .map(|r| ModerationResult {
                            flagged: r["flagged"].as_bool().unwrap_or(false),
                            categories: r["categories"].clone(),
                            category_scores: r["category_scores"].clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
            model: raw["model"].as_str().unwrap_or_default().to_string(),
            provider: self.name().to_string(),
        })
    }

    async fn transcribe_audio(
        &self,
        data: Vec<u8>,
        filename: String,
        opts: &AudioOptions,
    ) -> Result<AudioResponse> {
        let model = opts
            .model
            .clone()
            .or_else(|| self.core.config.audio_model.clone())
            .unwrap_or_else(|| "whisper-1".to_string());
        let mut form = Form::new()
            .part(
                "file",
                Part::bytes(data)
                    .file_name(filename)
                    .mime_str("audio/mpeg")
                    .map_err(|e| GatewayError::Translation(e.to_string()))?,
            )
            .text("model", model.clone());
        if let Some(language) = &opts.language {
            form = form.text("language", language.clone());
        }
        if let Some(prompt) = &opts.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(format) = &opts.response_format {
            form = form.text("response_format", format.clone());
        }
        if let Some(temperature) = opts.temperature {
            form = form.text("temperature", temperature.to_string());
        }
        let raw = post_multipart(
            &self.core.client,
            &self.endpoint("/audio/transcriptions"),
            self.headers()?,
            form,
        )
        .await?;
        Ok(AudioResponse {
            text: raw["text"].as_str().unwrap_or_default().to_string(),
            model,
            provider: self.name().to_string(),
        })
    }

    async fn translate_audio(
        &self,
        data: Vec<u8>,
        filename: String,
        opts: &AudioOptions,
    ) -> Result<AudioResponse> {
        let model = opts
            .model
            .clone()
            .or_else(|| self.core.config.audio_model.clone())
            .unwrap_or_else(|| "whisper-1".to_string());
        let mut form = Form::new()
            .part(
                "file",
                Part::bytes(data)
                    .file_name(filename)
                    .mime_str("audio/mpeg")
                    .map_err(|e| GatewayError::Translation(e.to_string()))?,
            )
            .text("model", model.clone());
        if let Some(prompt) = &opts.prompt {
            form = form.text("prompt", prompt.clone());
        }
        if let Some(format) = &opts.response_format {
            form = form.text("response_format", format.clone());
        }
        if let Some(temperature) = opts.temperature {
            form = form.text("temperature", temperature.to_string());
        }
        let raw = post_multipart(
            &self.core.client,
            &self.endpoint("/audio/translations"),
            self.headers()?,
            form,
        )
        .await?;
        Ok(AudioResponse {
            text: raw["text"].as_str().unwrap_or_default().to_string(),
            model,
            provider: self.name().to_string(),
        })
    }

    /// Text-to-speech returns the raw audio body.
    async fn create_speech(&self, request: &AudioSpeechRequest) -> Result<Vec<u8>> {
        let model = request
            .model
            .clone()
            .or_else(|| self.core.config.tts_model.clone())
            .unwrap_or_else(|| "tts-1".to_string());
        let mut payload = json!({
            "model": model,
            "input": request.input,
            "voice": request.voice,
        });
        if let Some(format) = &request.response_format {
            payload["response_format"] = json!(format);
        }
        if let Some(speed) = request.speed {
            payload["speed"] = json!(speed);
        }
        let resp = self
            .core
            .client
            .post(self.endpoint("/audio/speech"))
            .headers(self.headers()?)
            .json(&payload)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(super::provider::upstream_error(status.as_u16(), None, &body));
        }
        Ok(resp
            .bytes()
            .await
            .map_err(|e| GatewayError::Network(e.to_string()))?
            .to_vec())
    }

    async fn generate_image(&self, request: &ImageGenerationRequest) -> Result<ImageResponse> {
        let model = request
            .model
            .clone()
            .or_else(|| self.core.config.image_model.clone())
            .unwrap_or_else(|| "dall-e-3".to_string());
        let mut payload = json!({ "model": model, "prompt": request.prompt, "n": request.n });
        if let Some(size) = &request.size {
            payload["size"] = json!(size);
        }
        if let Some(quality) = &request.quality {
            payload["quality"] = json!(quality);
        }
        if let Some(style) = &request.style {
            payload["style"] = json!(style);
        }
        if let Some(format) = &request.response_format {
            payload["response_format"] = json!(format);
        }
        let raw = post_json(
            &self.core.client,
            &self.endpoint("/images/generations"),
            self.headers()?,
            &payload,
        )
        .await?;
        Ok(self.parse_images(&raw, &model))
    }

    async fn edit_image(
        &self,
        image: Vec<u8>,
        mask: Option<Vec<u8>>,
        request: &ImageEditRequest,
    ) -> Result<ImageResponse> {
        let model = request.model.clone().unwrap_or_else(|| "dall-e-2".to_string());
        let mut form = Form::new()
            .part(
                "image",
                Part::bytes(image)
                    .file_name("image.png")
                    .mime_str("image/png")
                    .map_err(|e| GatewayError::Translation(e.to_string()))?,
            )
            .text("prompt", request.prompt.clone())
            .text("model", model.clone())
            .text("n", request.n.to_string());
        if let Some(mask) = mask {
            form = form.part(
                "mask",
                Part::bytes(mask)
                    .file_name("mask.png")
                    .mime_str("image/png")
                    .map_err(|e| GatewayError::Translation(e.to_string()))?,
            );
        }
        if let Some(size) = &request.size {
            form = form.text("size", size.clone());
        }
        let raw = post_multipart(
            &self.core.client,
            &self.endpoint("/images/edits"),
            self.headers()?,
            form,
        )
        .await?;
        Ok(self.parse_images(&raw, &model))
    }

    async fn image_variation(
        &self,
        image: Vec<u8>,
        request: &ImageVariationRequest,
    ) -> Result<ImageResponse> {
        let model = request.model.clone().unwrap_or_else(|| "dall-e-2".to_string());
        let mut form = Form::new()
            .part(
                "image",
                Part::bytes(image)
                    .file_name("image.png")
                    .mime_str("image/png")
                    .map_err(|e| GatewayError::Translation(e.to_string()))?,
            )
            .text("model", model.clone())
            .text("n", request.n.to_string());
        if let Some(size) = &request.size {
            form = form.text("size", size.clone());
        }
        let raw = post_multipart(
            &self.core.client,
            &self.endpoint("/images/variations"),
            self.headers()?,
            form,
        )
        .await?;
        Ok(self.parse_images(&raw, &model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderConfig;
    use crate::ingest::Extractors;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn provider() -> OpenAiProvider {
        let config = ProviderConfig::from_yaml(
            "name: openai\napi_base: https://api.openai.com/v1\ndefault_model: gpt-4o\nmodels: [gpt-4o, gpt-4o-mini]\n",
        )
        .unwrap();
        OpenAiProvider::new(ProviderCore::new(
            config,
            "sk-test".into(),
            Arc::new(Extractors::default()),
        ))
    }

    fn request(messages: Vec<ChatMessage>) -> ChatRequest {
        ChatRequest {
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn system_is_lifted_into_the_message_list() {
        let mut req = request(vec![ChatMessage::user("Test")]);
        req.system = Some("System prompt here".into());
        let payload = provider().transform_request(&req).unwrap();
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(payload["messages"][0]["content"], "System prompt here");
        assert_eq!(payload["messages"][1]["role"], "user");
    }

    #[test]
    fn token_limit_key_depends_on_model_family() {
        let p = provider();

        let mut req = request(vec![ChatMessage::user("hi")]);
        req.model = Some("gpt-4o".into());
        req.max_tokens = 256;
        let payload = p.transform_request(&req).unwrap();
        assert_eq!(payload["max_tokens"], 256);
        assert!(payload.get("max_completion_tokens").is_none());

        for model in ["gpt-5", "o3-mini", "o4-mini"] {
            let mut req = request(vec![ChatMessage::user("hi")]);
            req.model = Some(model.into());
            let payload = p.transform_request(&req).unwrap();
            assert!(payload.get("max_tokens").is_none(), "model {model}");
            assert_eq!(payload["max_completion_tokens"], 1024, "model {model}");
        }
    }

    #[test]
    fn assistant_tool_use_becomes_tool_calls() {
        let message = ChatMessage {
            role: "assistant".into(),
            content: MessageContent::Blocks(vec![
                ContentBlock::text("Let me check."),
                ContentBlock::ToolUse {
                    id: "call_1".into(),
                    name: "get_weather".into(),
                    input: json!({"city": "Berlin"}),
                },
            ]),
        };
        let payload = provider().transform_request(&request(vec![message])).unwrap();
        let msg = &payload["messages"][0];
        assert_eq!(msg["role"], "assistant");
        assert_eq!(msg["content"], "Let me check.");
        assert_eq!(msg["tool_calls"][0]["id"], "call_1");
        assert_eq!(msg["tool_calls"][0]["type"], "function");
        assert_eq!(msg["tool_calls"][0]["function"]["name"], "get_weather");
        // arguments are a JSON string, not an object
        let args = msg["tool_calls"][0]["function"]["arguments"].as_str().unwrap();
        assert_eq!(serde_json::from_str::<Value>(args).unwrap(), json!({"city": "Berlin"}));
    }

    #[test]
    fn user_tool_results_fan_out_to_tool_messages() {
        let message = ChatMessage {
            role: "user".into(),
            content: MessageContent::Blocks(vec![
                ContentBlock::ToolResult {
                    tool_use_id: "call_1".into(),
                    content: "22°C".into(),
                },
                ContentBlock::ToolResult {
                    tool_use_id: "call_2".into(),
                    content: "sunny".into(),
                },
            ]),
        };
        let payload = provider().transform_request(&request(vec![message])).unwrap();
        let messages = payload["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0]["role"], "tool");
        assert_eq!(messages[0]["tool_call_id"], "call_1");
        assert_eq!(messages[1]["content"], "sunny");
    }

    #[test]
    fn image_blocks_become_data_urls() {
        let message = ChatMessage {
            role: "user".into(),
            content: MessageContent::Blocks(vec![
                ContentBlock::text("what is this?"),
                ContentBlock::image("image/png", "aW1n"),
            ]),
        };
        let payload = provider().transform_request(&request(vec![message])).unwrap();
        let parts = payload["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,aW1n");
    }

    #[test]
    fn document_blocks_are_preadapted_to_text() {
        use base64::engine::general_purpose::STANDARD as BASE64;
        use base64::Engine;
        let message = ChatMessage {
            role: "user".into(),
            content: MessageContent::Blocks(vec![
                ContentBlock::text("summary please"),
                ContentBlock::document(BASE64.encode(b"%PDF-1.4")),
            ]),
        };
        let payload = provider().transform_request(&request(vec![message])).unwrap();
        let parts = payload["messages"][0]["content"].as_array().unwrap();
        assert_eq!(parts.len(), 2);
        // no native PDF: the document arrives as extracted text
        assert_eq!(parts[1]["type"], "text");
    }

    #[test]
    fn stream_request_enables_usage_accounting() {
        let payload = provider()
            .transform_stream_request(&request(vec![ChatMessage::user("hi")]))
            .unwrap();
        assert_eq!(payload["stream"], true);
        assert_eq!(payload["stream_options"]["include_usage"], true);
    }

    #[test]
    fn finish_reason_tool_calls_normalizes_to_tool_use() {
        let raw = json!({
            "model": "gpt-4o",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "lookup", "arguments": "{\"q\":\"rust\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 7, "completion_tokens": 3}
        });
        let resp = provider().transform_response(raw).unwrap();
        assert_eq!(resp.stop_reason.as_deref(), Some("tool_use"));
        let blocks = resp.content_blocks.unwrap();
        assert_eq!(blocks[0]["type"], "tool_use");
        assert_eq!(blocks[0]["input"], json!({"q": "rust"}));
        assert_eq!(resp.usage.input_tokens, 7);
    }

    #[test]
    fn stream_chunks_map_delta_usage_done() {
        let p = provider();

        let delta = p
            .parse_stream_chunk(
                r#"{"model":"gpt-4o","choices":[{"delta":{"content":"Hel"},"finish_reason":null}]}"#,
            )
            .unwrap();
        assert_eq!(
            delta,
            StreamChunk::ContentDelta {
                content: "Hel".into(),
                model: Some("gpt-4o".into())
            }
        );

        let done = p
            .parse_stream_chunk(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#)
            .unwrap();
        assert!(done.is_terminal());

        let usage = p
            .parse_stream_chunk(
                r#"{"model":"gpt-4o","choices":[],"usage":{"prompt_tokens":11,"completion_tokens":4}}"#,
            )
            .unwrap();
        assert_eq!(
            usage,
            StreamChunk::Usage {
                usage: PartialUsage {
                    input_tokens: Some(11),
                    output_tokens: Some(4)
                },
                model: Some("gpt-4o".into())
            }
        );

        // empty delta lines are skipped
        assert_eq!(
            p.parse_stream_chunk(r#"{"choices":[{"delta":{},"finish_reason":null}]}"#),
            None
        );
    }

    #[tokio::test]
    async fn local_token_count_is_plausible() {
        let p = provider();
        let count = p
            .count_tokens(&TokenCountRequest {
                messages: vec![ChatMessage::user("Hello, world!")],
                model: Some("gpt-4o".into()),
                system: Some("Be brief.".into()),
                tools: None,
            })
            .await
            .unwrap();
        // framing overhead alone is 4 + 4 + 2; content adds a handful
        assert!(count.input_tokens > 10);
        assert!(count.input_tokens < 40);
        assert_eq!(count.provider, "openai");
    }

    #[test]
    fn capabilities_declare_all_three_tiers() {
        let caps = provider().capabilities();
        assert!(caps.tiers.extended.contains(&"embeddings".to_string()));
        assert!(caps.tiers.specialized.contains(&"moderation".to_string()));
        assert!(caps.features["embeddings"]);
        assert!(!caps.features["web_search"]);
    }
}
