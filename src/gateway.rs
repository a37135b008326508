//! Gateway service: stateless glue between the surface and a provider.
//!
//! Every chat path runs the same shape: intercept in-band commands,
//! connect lazily, write the request dialog entry, delegate to the
//! translator (wrapped by the retry engine), and — on every exit path,
//! including mid-stream errors and client disconnects — write the
//! response/error dialog entry and exactly one cost row with the final
//! usage and latency. Observability failures never reach the caller.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::commands::{
    execute_command, extract_command, is_command, CommandEnv, SessionStore,
};
use crate::config::RetentionPolicy;
use crate::error::Result;
use crate::llm::provider::{sse_to_chunks, ChunkStream, Provider};
use crate::llm::types::*;
use crate::observe::{CostStore, DialogLogger, NewCostRow};

pub struct Gateway {
    provider: Arc<dyn Provider>,
    dialog: Arc<DialogLogger>,
    costs: Arc<CostStore>,
    sessions: Mutex<SessionStore>,
    log_dir: PathBuf,
    retention: RetentionPolicy,
}

impl Gateway {
    pub fn new(
        provider: Arc<dyn Provider>,
        dialog: Arc<DialogLogger>,
        costs: Arc<CostStore>,
        log_dir: PathBuf,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            provider,
            dialog,
            costs,
            sessions: Mutex::new(SessionStore::new()),
            log_dir,
            retention,
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn dialog(&self) -> &Arc<DialogLogger> {
        &self.dialog
    }

    pub fn costs(&self) -> &Arc<CostStore> {
        &self.costs
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    /// Intercept a trailing `!`-command. Only a final user message with
    /// plain string content triggers; the upstream is never contacted.
    fn try_command(&self, request: &ChatRequest) -> Option<(String, Value)> {
        let last = request.messages.last()?;
        if last.role != "user" {
            return None;
        }
        let text = last.content.as_plain_text()?;
        if !is_command(text) {
            return None;
        }
        let (command, args) = extract_command(text);

        let session_key = request
            .context
            .as_ref()
            .and_then(|c| c.session_id.clone())
            .unwrap_or_default();
        let env = CommandEnv {
            provider_name: self.provider.name(),
            connected: self.provider.is_connected(),
            default_model: self.provider.default_model(),
            available_models: self.provider.models(),
            dialog: &self.dialog,
            retry: self.provider.retry_config(),
            rate_limit_hits: self.provider.rate_limits().count(),
        };
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        let params = sessions.params_mut(&session_key);
        let result = execute_command(&command, &args, &env, params);
        Some((command, result))
    }

    fn context_of(request: &ChatRequest) -> RequestContext {
        request.context.clone().unwrap_or_default()
    }

    fn ensure_connected(&self) {
        if !self.provider.is_connected() {
            self.provider.connect();
        }
    }

    /// Non-streaming chat.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse> {
        if let Some((command, result)) = self.try_command(&request) {
            return Ok(ChatResponse {
                content: format!("[!{command}] {result}"),
                model: self.provider.default_model(),
                usage: TokenUsage::default(),
                provider: self.provider.name().to_string(),
                stop_reason: None,
                content_blocks: None,
            });
        }

        let start = Instant::now();
        self.ensure_connected();
        let ctx = Self::context_of(&request);
        let mut model = self.provider.resolve_model(request.model.as_deref());

        if let Ok(payload) = self.provider.transform_request(&request) {
            self.dialog.log_request("/chat", &payload, &ctx);
        }

        let outcome = self.provider.send_chat(&request).await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(response) => {
                model = response.model.clone();
                let content = serde_json::to_value(&response).unwrap_or_default();
                self.dialog.log_response("/chat", 200, &content, &ctx);
                self.costs
                    .insert(&NewCostRow {
                        provider: self.provider.name().to_string(),
                        model,
                        input_tokens: response.usage.input_tokens,
                        output_tokens: response.usage.output_tokens,
                        latency_ms,
                        context: ctx,
                        status: "success".into(),
                        error_message: None,
                    })
                    .await;
                Ok(response)
            }
            Err(e) => {
                let message = e.to_string();
                self.dialog.log_error("/chat", &message, &ctx);
                self.costs
                    .insert(&NewCostRow {
                        provider: self.provider.name().to_string(),
                        model,
                        input_tokens: 0,
                        output_tokens: 0,
                        latency_ms,
                        context: ctx,
                        status: e.cost_status().into(),
                        error_message: Some(message),
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Streaming chat. The returned stream always terminates with
    /// exactly one `done` or `error` chunk; the surface appends the
    /// out-of-band `[DONE]` line.
    pub async fn chat_stream(&self, request: ChatRequest) -> ChunkStream {
        if let Some((command, result)) = self.try_command(&request) {
            let chunk = StreamChunk::CommandResponse { command, result };
            return Box::pin(futures::stream::once(async move { chunk }));
        }

        let start = Instant::now();
        self.ensure_connected();
        let ctx = Self::context_of(&request);
        let model = self.provider.resolve_model(request.model.as_deref());

        if let Ok(payload) = self.provider.transform_stream_request(&request) {
            self.dialog.log_request("/chat/stream", &payload, &ctx);
        }

        let response = match self.provider.start_stream(&request).await {
            Ok(response) => response,
            Err(e) => {
                let message = e.to_string();
                let latency_ms = start.elapsed().as_millis() as u64;
                self.dialog.log_error("/chat/stream", &message, &ctx);
                self.finish_stream(&model, TokenUsage::default(), latency_ms, e.cost_status(), Some(&message), &ctx)
                    .await;
                let chunk = StreamChunk::Error { error: message };
                return Box::pin(futures::stream::once(async move { chunk }));
            }
        };

        let mut upstream = sse_to_chunks(self.provider.clone(), response);
        let (tx, rx) = mpsc::channel::<StreamChunk>(32);

        let provider_name = self.provider.name().to_string();
        let dialog = self.dialog.clone();
        let costs = self.costs.clone();
        tokio::spawn(async move {
            let mut usage = TokenUsage::default();
            let mut model = model;
            let mut status = "success";
            let mut error_message: Option<String> = None;
            let mut saw_terminal = false;
            let mut receiver_gone = false;

            while let Some(chunk) = upstream.next().await {
                match &chunk {
                    StreamChunk::Usage { usage: partial, model: m } => {
                        usage.apply(partial);
                        if let Some(m) = m {
                            model = m.clone();
                        }
                    }
                    StreamChunk::ContentDelta { model: Some(m), .. } => {
                        model = m.clone();
                    }
                    StreamChunk::Error { error } => {
                        status = "error";
                        error_message = Some(error.clone());
                    }
                    _ => {}
                }

                let terminal = chunk.is_terminal();
                if tx.send(chunk).await.is_err() {
                    // downstream went away; drop the upstream at the next
                    // suspension but still record what accumulated
                    receiver_gone = true;
                    break;
                }
                if terminal {
                    saw_terminal = true;
                    break;
                }
            }

            if !saw_terminal && !receiver_gone {
                let _ = tx
                    .send(StreamChunk::Done {
                        model: Some(model.clone()),
                    })
                    .await;
            }

            let latency_ms = start.elapsed().as_millis() as u64;
            if let Some(error) = &error_message {
                dialog.log_error("/chat/stream", error, &ctx);
            }
            dialog.log_response(
                "/chat/stream",
                200,
                &json!({
                    "model": model,
                    "input_tokens": usage.input_tokens,
                    "output_tokens": usage.output_tokens,
                    "latency_ms": latency_ms,
                }),
                &ctx,
            );
            costs
                .insert(&NewCostRow {
                    provider: provider_name,
                    model,
                    input_tokens: usage.input_tokens,
                    output_tokens: usage.output_tokens,
                    latency_ms,
                    context: ctx,
                    status: status.into(),
                    error_message,
                })
                .await;
        });

        Box::pin(ReceiverStream::new(rx))
    }

    async fn finish_stream(
        &self,
        model: &str,
        usage: TokenUsage,
        latency_ms: u64,
        status: &str,
        error_message: Option<&str>,
        ctx: &RequestContext,
    ) {
        self.dialog.log_response(
            "/chat/stream",
            200,
            &json!({
                "model": model,
                "input_tokens": usage.input_tokens,
                "output_tokens": usage.output_tokens,
                "latency_ms": latency_ms,
            }),
            ctx,
        );
        self.costs
            .insert(&NewCostRow {
                provider: self.provider.name().to_string(),
                model: model.to_string(),
                input_tokens: usage.input_tokens,
                output_tokens: usage.output_tokens,
                latency_ms,
                context: ctx.clone(),
                status: status.into(),
                error_message: error_message.map(String::from),
            })
            .await;
    }
}
