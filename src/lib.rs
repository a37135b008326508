//! Unified LLM provider gateway.
//!
//! One deployed instance speaks one upstream provider (Claude-style,
//! OpenAI-style, or Gemini-style) and exposes a single canonical HTTP
//! surface: chat, streaming chat, token counting, embeddings, batches,
//! moderation, audio, and images. Heterogeneity is achieved by running
//! several instances behind a router.

pub mod commands;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ingest;
pub mod llm;
pub mod observe;
pub mod server;

pub use error::{GatewayError, Result};
