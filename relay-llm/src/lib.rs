//! Gemini completion client for the WhatsApp relay.
//!
//! Pure HTTP client: one `generateContent` call per prompt, no conversation state.

mod client;
mod error;
mod traits;
mod types;

pub use client::{DEFAULT_GEMINI_BASE_URL, GeminiClient};
pub use error::{LlmError, Result};
pub use traits::CompletionBackend;
pub use types::{
    Candidate, CompletionRequest, CompletionResponse, GenerationConfig, HarmBlockThreshold,
    HarmCategory, SafetySetting, Usage,
};
