//! HTTP surface.
//!
//! All endpoints are thin wrappers over the gateway service. Streaming
//! responses are RFC 6202 server-sent events: one `data: <json>` line
//! per canonical chunk, closed by the literal `data: [DONE]` line.
//! Error mapping: `endpoint_not_available` → 501, rate-limit exhaustion
//! → 429 with Retry-After, everything else → 500 with the upstream
//! message preserved.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header::{HeaderName, HeaderValue, CACHE_CONTROL, CONNECTION, CONTENT_DISPOSITION, CONTENT_TYPE};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::GatewayError;
use crate::gateway::Gateway;
use crate::llm::provider::ChunkStream;
use crate::llm::types::*;
use crate::observe::{cleanup_logs, cleanup_metrics, read_logs, CostFilter, LogFilter};

type AppState = Arc<Gateway>;

pub fn router(gateway: AppState) -> Router {
    Router::new()
        // lifecycle & meta
        .route("/health", get(health))
        .route("/capabilities", get(capabilities))
        .route("/status", get(status))
        .route("/connect", post(connect))
        .route("/disconnect", post(disconnect))
        .route("/reset", post(reset))
        // tier 1: core
        .route("/models", get(models_list))
        .route("/models/:model_id", get(model_detail))
        .route("/chat", post(chat))
        .route("/chat/stream", post(chat_stream))
        .route("/tokens/count", post(tokens_count))
        // tier 2: extended
        .route("/embeddings", post(embeddings))
        .route("/batches", post(create_batch).get(list_batches))
        .route("/batches/:batch_id", get(get_batch))
        .route("/batches/:batch_id/cancel", post(cancel_batch))
        .route("/batches/:batch_id/results", get(batch_results))
        // tier 3: specialized
        .route("/moderations", post(moderations))
        .route("/audio/transcriptions", post(audio_transcriptions))
        .route("/audio/translations", post(audio_translations))
        .route("/audio/speech", post(audio_speech))
        .route("/images/generations", post(image_generations))
        .route("/images/edits", post(image_edits))
        .route("/images/variations", post(image_variations))
        // ops
        .route("/logging/enable", post(logging_enable))
        .route("/logging/disable", post(logging_disable))
        .route("/logging/status", get(logging_status))
        .route("/retention/run", post(retention_run))
        .route("/logs", get(logs))
        .route("/metrics", get(metrics))
        .route("/metrics/summary", get(metrics_summary))
        .route("/metrics/rate-limits", get(metrics_rate_limits))
        .with_state(gateway)
}

// ─── Error mapping ───────────────────────────────────────────────────────────

pub struct ApiError(pub GatewayError);

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.0 {
            GatewayError::EndpointNotAvailable { endpoint, provider } => {
                let body = NotImplementedResponse {
                    error: "not_yet_implemented".into(),
                    message: format!("'{endpoint}' is not available for provider '{provider}'"),
                    endpoint,
                    provider,
                };
                (StatusCode::NOT_IMPLEMENTED, Json(body)).into_response()
            }
            e @ GatewayError::RateLimitExhausted { .. } => {
                let retry_after = e.retry_after().unwrap_or(60);
                let body = Json(json!({
                    "error": "rate_limit_exhausted",
                    "detail": e.to_string(),
                }));
                let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                    response.headers_mut().insert("retry-after", value);
                }
                response
            }
            e => {
                tracing::error!(error = %e, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": e.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

// ─── Lifecycle & meta ────────────────────────────────────────────────────────

async fn health(State(gateway): State<AppState>) -> Json<HealthResponse> {
    Json(gateway.provider().health())
}

async fn capabilities(State(gateway): State<AppState>) -> Json<CapabilitiesResponse> {
    Json(gateway.provider().capabilities())
}

async fn status(State(gateway): State<AppState>) -> Json<Value> {
    let provider = gateway.provider();
    let connected = provider.is_connected();
    Json(json!({
        "provider": provider.name(),
        "connected": connected,
        "status": if connected { "ok" } else { "disconnected" },
        "default_model": provider.default_model(),
        "available_models": provider.models(),
        "dialog_logging": gateway.dialog().enabled(),
        "rate_limit_hits": provider.rate_limits().count(),
        "retry_config": serde_json::to_value(provider.retry_config()).unwrap_or_default(),
    }))
}

async fn connect(State(gateway): State<AppState>) -> Json<ConnectionStatus> {
    Json(gateway.provider().connect())
}

async fn disconnect(State(gateway): State<AppState>) -> Json<ConnectionStatus> {
    Json(gateway.provider().disconnect())
}

async fn reset(State(gateway): State<AppState>) -> Json<ConnectionStatus> {
    Json(gateway.provider().reset())
}

// ─── Tier 1: core ────────────────────────────────────────────────────────────

async fn models_list(State(gateway): State<AppState>) -> Json<ModelsResponse> {
    let provider = gateway.provider();
    Json(ModelsResponse {
        models: provider.models(),
        default: provider.default_model(),
        provider: provider.name().to_string(),
    })
}

async fn model_detail(
    State(gateway): State<AppState>,
    Path(model_id): Path<String>,
) -> Result<Json<ModelDetailResponse>, ApiError> {
    let provider = gateway.provider();
    let model = provider.model_detail(&model_id).await?;
    Ok(Json(ModelDetailResponse {
        model,
        provider: provider.name().to_string(),
    }))
}

async fn chat(
    State(gateway): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    Ok(Json(gateway.chat(request).await?))
}

async fn chat_stream(
    State(gateway): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Response {
    sse_response(gateway.chat_stream(request).await)
}

/// Serialise canonical chunks onto the SSE wire and close with the
/// `[DONE]` terminator line.
fn sse_response(chunks: ChunkStream) -> Response {
    let events = chunks
        .map(|chunk| {
            let data = serde_json::to_string(&chunk).unwrap_or_else(|_| "{}".to_string());
            Ok::<Event, Infallible>(Event::default().data(data))
        })
        .chain(futures::stream::once(async {
            Ok(Event::default().data("[DONE]"))
        }));

    let mut response = Sse::new(events).into_response();
    let headers = response.headers_mut();
    headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(
        HeaderName::from_static("x-accel-buffering"),
        HeaderValue::from_static("no"),
    );
    response
}

async fn tokens_count(
    State(gateway): State<AppState>,
    Json(request): Json<TokenCountRequest>,
) -> Result<Json<TokenCountResponse>, ApiError> {
    Ok(Json(gateway.provider().count_tokens(&request).await?))
}

// ─── Tier 2: extended ────────────────────────────────────────────────────────

async fn embeddings(
    State(gateway): State<AppState>,
    Json(request): Json<EmbeddingRequest>,
) -> Result<Json<EmbeddingResponse>, ApiError> {
    Ok(Json(gateway.provider().create_embedding(&request).await?))
}

async fn create_batch(
    State(gateway): State<AppState>,
    Json(request): Json<BatchCreateRequest>,
) -> Result<Json<BatchStatus>, ApiError> {
    Ok(Json(gateway.provider().create_batch(&request).await?))
}

async fn list_batches(State(gateway): State<AppState>) -> Result<Json<BatchListResponse>, ApiError> {
    Ok(Json(gateway.provider().list_batches().await?))
}

async fn get_batch(
    State(gateway): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatus>, ApiError> {
    Ok(Json(gateway.provider().get_batch(&batch_id).await?))
}

async fn cancel_batch(
    State(gateway): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchStatus>, ApiError> {
    Ok(Json(gateway.provider().cancel_batch(&batch_id).await?))
}

async fn batch_results(
    State(gateway): State<AppState>,
    Path(batch_id): Path<String>,
) -> Result<Json<BatchResultsResponse>, ApiError> {
    Ok(Json(gateway.provider().batch_results(&batch_id).await?))
}

// ─── Tier 3: specialized ─────────────────────────────────────────────────────

async fn moderations(
    State(gateway): State<AppState>,
    Json(request): Json<ModerationRequest>,
) -> Result<Json<ModerationResponse>, ApiError> {
    Ok(Json(gateway.provider().create_moderation(&request).await?))
}

/// Collected multipart form: uploaded files by field name plus plain
/// text fields.
#[derive(Default)]
struct FormData {
    files: Vec<(String, String, Vec<u8>)>,
    fields: std::collections::HashMap<String, String>,
}

impl FormData {
    fn file(&self, name: &str) -> Option<(&str, &[u8])> {
        self.files
            .iter()
            .find(|(field, _, _)| field == name)
            .map(|(_, filename, data)| (filename.as_str(), data.as_slice()))
    }

    fn text(&self, name: &str) -> Option<String> {
        self.fields.get(name).cloned()
    }
}

async fn collect_form(mut multipart: Multipart) -> Result<FormData, ApiError> {
    let mut form = FormData::default();
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(GatewayError::Translation(format!("invalid multipart body: {e}")))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(String::from);
        let data = field.bytes().await.map_err(|e| {
            ApiError(GatewayError::Translation(format!("multipart read failed: {e}")))
        })?;
        match filename {
            Some(filename) => form.files.push((name, filename, data.to_vec())),
            None => {
                form.fields
                    .insert(name, String::from_utf8_lossy(&data).to_string());
            }
        }
    }
    Ok(form)
}

fn audio_options(form: &FormData) -> AudioOptions {
    AudioOptions {
        model: form.text("model"),
        language: form.text("language"),
        prompt: form.text("prompt"),
        response_format: form.text("response_format"),
        temperature: form.text("temperature").and_then(|t| t.parse().ok()),
    }
}

async fn audio_transcriptions(
    State(gateway): State<AppState>,
    multipart: Multipart,
) -> Result<Json<AudioResponse>, ApiError> {
    let form = collect_form(multipart).await?;
    let (filename, data) = form
        .file("file")
        .ok_or_else(|| ApiError(GatewayError::Translation("missing 'file' field".into())))?;
    let opts = audio_options(&form);
    Ok(Json(
        gateway
            .provider()
            .transcribe_audio(data.to_vec(), filename.to_string(), &opts)
            .await?,
    ))
}

async fn audio_translations(
    State(gateway): State<AppState>,
    multipart: Multipart,
) -> Result<Json<AudioResponse>, ApiError> {
    let form = collect_form(multipart).await?;
    let (filename, data) = form
        .file("file")
        .ok_or_else(|| ApiError(GatewayError::Translation("missing 'file' field".into())))?;
    let opts = audio_options(&form);
    Ok(Json(
        gateway
            .provider()
            .translate_audio(data.to_vec(), filename.to_string(), &opts)
            .await?,
    ))
}

async fn audio_speech(
    State(gateway): State<AppState>,
    Json(request): Json<AudioSpeechRequest>,
) -> Result<Response, ApiError> {
    let format = request.response_format.clone().unwrap_or_else(|| "mp3".to_string());
    let audio = gateway.provider().create_speech(&request).await?;
    let media_type = match format.as_str() {
        "opus" => "audio/opus",
        "aac" => "audio/aac",
        "flac" => "audio/flac",
        "wav" => "audio/wav",
        "pcm" => "audio/pcm",
        _ => "audio/mpeg",
    };
    let mut response = audio.into_response();
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(media_type));
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"speech.{format}\"")) {
        headers.insert(CONTENT_DISPOSITION, value);
    }
    Ok(response)
}

async fn image_generations(
    State(gateway): State<AppState>,
    Json(request): Json<ImageGenerationRequest>,
) -> Result<Json<ImageResponse>, ApiError> {
    Ok(Json(gateway.provider().generate_image(&request).await?))
}

async fn image_edits(
    State(gateway): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ImageResponse>, ApiError> {
    let form = collect_form(multipart).await?;
    let (_, image) = form
        .file("image")
        .ok_or_else(|| ApiError(GatewayError::Translation("missing 'image' field".into())))?;
    let prompt = form
        .text("prompt")
        .ok_or_else(|| ApiError(GatewayError::Translation("missing 'prompt' field".into())))?;
    let mask = form.file("mask").map(|(_, data)| data.to_vec());
    let request = ImageEditRequest {
        prompt,
        model: form.text("model"),
        n: form.text("n").and_then(|n| n.parse().ok()).unwrap_or(1),
        size: form.text("size"),
        response_format: form.text("response_format"),
        context: None,
    };
    Ok(Json(
        gateway
            .provider()
            .edit_image(image.to_vec(), mask, &request)
            .await?,
    ))
}

async fn image_variations(
    State(gateway): State<AppState>,
    multipart: Multipart,
) -> Result<Json<ImageResponse>, ApiError> {
    let form = collect_form(multipart).await?;
    let (_, image) = form
        .file("image")
        .ok_or_else(|| ApiError(GatewayError::Translation("missing 'image' field".into())))?;
    let request = ImageVariationRequest {
        model: form.text("model"),
        n: form.text("n").and_then(|n| n.parse().ok()).unwrap_or(1),
        size: form.text("size"),
        response_format: form.text("response_format"),
        context: None,
    };
    Ok(Json(
        gateway
            .provider()
            .image_variation(image.to_vec(), &request)
            .await?,
    ))
}

// ─── Ops: logging, retention, logs, metrics ──────────────────────────────────

async fn logging_enable(State(gateway): State<AppState>) -> Json<Value> {
    gateway.dialog().set_enabled(true);
    Json(json!({ "dialog_logging": true }))
}

async fn logging_disable(State(gateway): State<AppState>) -> Json<Value> {
    gateway.dialog().set_enabled(false);
    Json(json!({ "dialog_logging": false }))
}

async fn logging_status(State(gateway): State<AppState>) -> Json<Value> {
    Json(json!({ "dialog_logging": gateway.dialog().enabled() }))
}

async fn retention_run(State(gateway): State<AppState>) -> Json<Value> {
    let policy = gateway.retention().clone();
    let log_stats = cleanup_logs(gateway.log_dir(), &policy);
    let db_stats = cleanup_metrics(gateway.costs(), &policy).await;
    Json(json!({
        "logs": log_stats,
        "metrics_db": db_stats,
        "policy": policy,
    }))
}

#[derive(Debug, Deserialize)]
struct LogsQuery {
    session_id: Option<String>,
    heinzel_id: Option<String>,
    task_id: Option<String>,
    #[serde(rename = "type")]
    entry_type: Option<String>,
    since: Option<String>,
    until: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn logs(State(gateway): State<AppState>, Query(query): Query<LogsQuery>) -> Json<Value> {
    let filter = LogFilter {
        session_id: query.session_id,
        heinzel_id: query.heinzel_id,
        task_id: query.task_id,
        entry_type: query.entry_type,
        since: query.since,
        until: query.until,
        limit: query.limit.unwrap_or(100).min(1000),
    };
    let entries = read_logs(gateway.log_dir(), gateway.provider().name(), &filter);
    Json(json!({ "count": entries.len(), "entries": entries }))
}

fn parse_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[derive(Debug, Deserialize)]
struct MetricsQuery {
    session_id: Option<String>,
    heinzel_id: Option<String>,
    model: Option<String>,
    status: Option<String>,
    since: Option<String>,
    until: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
}

async fn metrics(State(gateway): State<AppState>, Query(query): Query<MetricsQuery>) -> Json<Value> {
    let filter = CostFilter {
        session_id: query.session_id,
        heinzel_id: query.heinzel_id,
        provider: Some(gateway.provider().name().to_string()),
        model: query.model,
        status: query.status,
        since: parse_ts(query.since),
        until: parse_ts(query.until),
        limit: query.limit.unwrap_or(100),
    };
    let rows = gateway.costs().query(&filter).await;
    Json(json!({ "count": rows.len(), "entries": rows }))
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    session_id: Option<String>,
    heinzel_id: Option<String>,
    since: Option<String>,
    until: Option<String>,
}

async fn metrics_summary(
    State(gateway): State<AppState>,
    Query(query): Query<SummaryQuery>,
) -> Json<Value> {
    let filter = CostFilter {
        session_id: query.session_id,
        heinzel_id: query.heinzel_id,
        since: parse_ts(query.since),
        until: parse_ts(query.until),
        ..Default::default()
    };
    Json(serde_json::to_value(gateway.costs().summary(&filter).await).unwrap_or_default())
}

async fn metrics_rate_limits(State(gateway): State<AppState>) -> Json<Value> {
    let provider = gateway.provider();
    let tracker = provider.rate_limits();
    Json(json!({
        "total_hits": tracker.count(),
        "last_hit": tracker.last_hit().map(|t| t.to_rfc3339()),
        "retry_config": serde_json::to_value(provider.retry_config()).unwrap_or_default(),
    }))
}
