use crate::error::Result;
use crate::types::{CompletionRequest, CompletionResponse};
use async_trait::async_trait;

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Model identifier used for logging.
    fn model(&self) -> &str;

    /// Run a single completion. An `Ok` response may still carry zero candidates
    /// (e.g. the prompt itself was blocked).
    async fn generate(&self, request: &CompletionRequest) -> Result<CompletionResponse>;
}
