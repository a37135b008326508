pub mod anthropic;
pub mod gemini;
pub mod openai;
pub mod provider;
pub mod retry;
pub mod types;

pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use openai::OpenAiProvider;
pub use provider::{Provider, ProviderCore};
pub use types::*;
