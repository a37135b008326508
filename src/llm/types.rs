//! Canonical request/response/stream model.
//!
//! These are the provider-agnostic shapes exposed at the gateway boundary.
//! Each translator converts between this model and its upstream wire
//! format in both directions; nothing upstream-specific leaks out of the
//! `llm` module.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Content blocks (multimodal) ─────────────────────────────────────────────

/// One piece of multimodal message content, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    /// Base64-encoded image. `media_type` is one of image/jpeg, image/png,
    /// image/gif, image/webp.
    Image {
        media_type: String,
        data: String,
    },
    /// Base64-encoded PDF document.
    Document {
        #[serde(default = "pdf_media_type")]
        media_type: String,
        data: String,
    },
    /// Tool invocation requested by the assistant. The three upstreams
    /// disagree on tool-call shape; each translator expands this its own
    /// way.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Tool result supplied by the caller.
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

fn pdf_media_type() -> String {
    "application/pdf".to_string()
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        ContentBlock::Image {
            media_type: media_type.into(),
            data: data.into(),
        }
    }

    pub fn document(data: impl Into<String>) -> Self {
        ContentBlock::Document {
            media_type: pdf_media_type(),
            data: data.into(),
        }
    }
}

/// Message content: a bare string (fast path) or an ordered block list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        MessageContent::Text(String::new())
    }
}

impl MessageContent {
    /// Normalise to a block list. A bare string becomes one text block.
    pub fn to_blocks(&self) -> Vec<ContentBlock> {
        match self {
            MessageContent::Text(s) => vec![ContentBlock::text(s.clone())],
            MessageContent::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Plain-string view used for command detection. Block lists never
    /// trigger commands.
    pub fn as_plain_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(s) => Some(s),
            MessageContent::Blocks(_) => None,
        }
    }
}

impl From<&str> for MessageContent {
    fn from(s: &str) -> Self {
        MessageContent::Text(s.to_string())
    }
}

// ─── Messages & requests ─────────────────────────────────────────────────────

/// A single conversation turn. `role` is free-form; canonical values are
/// `user`, `assistant`, `system`, `tool`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn user(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<MessageContent>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

impl From<String> for MessageContent {
    fn from(s: String) -> Self {
        MessageContent::Text(s)
    }
}

impl From<Vec<ContentBlock>> for MessageContent {
    fn from(blocks: Vec<ContentBlock>) -> Self {
        MessageContent::Blocks(blocks)
    }
}

/// Correlation ids threaded through logs and cost rows. Never affects
/// model selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub heinzel_id: Option<String>,
    pub session_id: Option<String>,
    pub task_id: Option<String>,
}

fn default_max_tokens() -> u32 {
    1024
}

/// Canonical chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub top_p: Option<f32>,
    #[serde(default)]
    pub stop_sequences: Option<Vec<String>>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

impl Default for ChatRequest {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            model: None,
            max_tokens: default_max_tokens(),
            system: None,
            temperature: None,
            top_p: None,
            stop_sequences: None,
            tools: None,
            context: None,
        }
    }
}

// ─── Responses & streaming ───────────────────────────────────────────────────

/// Token accounting for a completed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Partial usage carried by a stream. Fields absent from a chunk keep
/// their previous value (last-writer-wins per field).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialUsage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
}

impl TokenUsage {
    /// Fold a partial update into the running total.
    pub fn apply(&mut self, partial: &PartialUsage) {
        if let Some(input) = partial.input_tokens {
            self.input_tokens = input;
        }
        if let Some(output) = partial.output_tokens {
            self.output_tokens = output;
        }
    }
}

/// Canonical chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub provider: String,
    #[serde(default)]
    pub stop_reason: Option<String>,
    /// Raw content-block list including tool-use blocks, when the
    /// upstream produced structured content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_blocks: Option<Vec<Value>>,
}

/// One canonical streaming event, discriminated by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    ContentDelta {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Usage {
        usage: PartialUsage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
    },
    Error {
        error: String,
    },
    CommandResponse {
        command: String,
        result: Value,
    },
}

impl StreamChunk {
    pub fn delta(content: impl Into<String>) -> Self {
        StreamChunk::ContentDelta {
            content: content.into(),
            model: None,
        }
    }

    /// True for the two terminal variants, `done` and `error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamChunk::Done { .. } | StreamChunk::Error { .. })
    }
}

// ─── Token counting ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system: Option<String>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCountResponse {
    pub input_tokens: u64,
    pub model: String,
    pub provider: String,
}

// ─── Models ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetail {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub created: Option<i64>,
    #[serde(default)]
    pub owned_by: Option<String>,
    #[serde(default)]
    pub context_window: Option<u64>,
    #[serde(default)]
    pub max_output_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub models: Vec<String>,
    pub default: String,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDetailResponse {
    pub model: ModelDetail,
    pub provider: String,
}

// ─── Embeddings ──────────────────────────────────────────────────────────────

/// A single string or a list of strings; both are accepted wherever the
/// upstream APIs accept either.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextInput {
    One(String),
    Many(Vec<String>),
}

impl TextInput {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            TextInput::One(s) => vec![s],
            TextInput::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub input: TextInput,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub encoding_format: Option<String>,
    #[serde(default)]
    pub dimensions: Option<u32>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

fn embedding_object() -> String {
    "embedding".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingData {
    pub index: usize,
    pub embedding: Vec<f32>,
    #[serde(default = "embedding_object")]
    pub object: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub data: Vec<EmbeddingData>,
    pub model: String,
    pub usage: HashMap<String, u64>,
    pub provider: String,
}

// ─── Batches ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequestItem {
    pub custom_id: String,
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCreateRequest {
    pub requests: Vec<BatchRequestItem>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub total_requests: Option<u64>,
    #[serde(default)]
    pub completed_requests: Option<u64>,
    #[serde(default)]
    pub failed_requests: Option<u64>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub ended_at: Option<String>,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchListResponse {
    pub batches: Vec<BatchStatus>,
    pub provider: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultItem {
    pub custom_id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResultsResponse {
    pub batch_id: String,
    pub results: Vec<BatchResultItem>,
    pub provider: String,
}

// ─── Moderation ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationRequest {
    pub input: TextInput,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResult {
    pub flagged: bool,
    pub categories: Value,
    pub category_scores: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResponse {
    pub id: String,
    pub results: Vec<ModerationResult>,
    pub model: String,
    pub provider: String,
}

// ─── Audio ───────────────────────────────────────────────────────────────────

/// Options for the multipart transcription/translation endpoints.
#[derive(Debug, Clone, Default)]
pub struct AudioOptions {
    pub model: Option<String>,
    pub language: Option<String>,
    pub prompt: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f32>,
}

fn default_voice() -> String {
    "alloy".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSpeechRequest {
    pub input: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioResponse {
    pub text: String,
    pub model: String,
    pub provider: String,
}

// ─── Images ──────────────────────────────────────────────────────────────────

fn default_n() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageGenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageEditRequest {
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageVariationRequest {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_n")]
    pub n: u32,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub context: Option<RequestContext>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageData {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub b64_json: Option<String>,
    #[serde(default)]
    pub revised_prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageResponse {
    pub data: Vec<ImageData>,
    pub model: String,
    pub provider: String,
}

// ─── Gateway meta ────────────────────────────────────────────────────────────

/// Endpoint groups a provider advertises. Membership is a data
/// declaration, not reflection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CapabilityTier {
    pub core: Vec<String>,
    pub extended: Vec<String>,
    pub specialized: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesResponse {
    pub provider: String,
    pub tiers: CapabilityTier,
    pub features: HashMap<String, bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub provider: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub status: String,
    pub provider: String,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset: Option<bool>,
}

fn not_implemented() -> String {
    "not_yet_implemented".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotImplementedResponse {
    #[serde(default = "not_implemented")]
    pub error: String,
    pub endpoint: String,
    pub provider: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn content_block_tagged_serialization() {
        let block = ContentBlock::image("image/png", "aGVsbG8=");
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["media_type"], "image/png");

        let back: ContentBlock = serde_json::from_value(json).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn document_block_defaults_to_pdf() {
        let block: ContentBlock =
            serde_json::from_str(r#"{"type":"document","data":"QUJD"}"#).unwrap();
        match block {
            ContentBlock::Document { media_type, .. } => {
                assert_eq!(media_type, "application/pdf")
            }
            other => panic!("expected document block, got {other:?}"),
        }
    }

    #[test]
    fn message_content_untagged() {
        let text: MessageContent = serde_json::from_str(r#""hello""#).unwrap();
        assert_eq!(text, MessageContent::Text("hello".into()));

        let blocks: MessageContent =
            serde_json::from_str(r#"[{"type":"text","text":"hi"}]"#).unwrap();
        assert_eq!(blocks.to_blocks(), vec![ContentBlock::text("hi")]);
    }

    #[test]
    fn empty_content_serializes_as_empty_string() {
        let msg = ChatMessage {
            role: "user".into(),
            content: MessageContent::default(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"], "");
    }

    #[test]
    fn chat_request_defaults() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"messages":[{"role":"user","content":"hi"}]}"#).unwrap();
        assert_eq!(req.max_tokens, 1024);
        assert!(req.model.is_none());
        assert!(req.context.is_none());
    }

    #[test]
    fn stream_chunk_wire_format() {
        let chunk = StreamChunk::delta("Hel");
        let json = serde_json::to_string(&chunk).unwrap();
        assert_eq!(json, r#"{"type":"content_delta","content":"Hel"}"#);

        let done: StreamChunk = serde_json::from_str(r#"{"type":"done"}"#).unwrap();
        assert!(done.is_terminal());
    }

    #[test]
    fn usage_reduction_is_last_writer_wins_per_field() {
        let mut usage = TokenUsage::default();
        usage.apply(&PartialUsage {
            input_tokens: Some(10),
            output_tokens: None,
        });
        usage.apply(&PartialUsage {
            input_tokens: None,
            output_tokens: Some(5),
        });
        assert_eq!(
            usage,
            TokenUsage {
                input_tokens: 10,
                output_tokens: 5
            }
        );

        usage.apply(&PartialUsage {
            input_tokens: None,
            output_tokens: Some(9),
        });
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.input_tokens, 10);
    }

    #[test]
    fn text_input_accepts_one_or_many() {
        let one: TextInput = serde_json::from_str(r#""a""#).unwrap();
        assert_eq!(one.into_vec(), vec!["a"]);
        let many: TextInput = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many.into_vec(), vec!["a", "b"]);
    }
}
