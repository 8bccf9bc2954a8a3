use async_trait::async_trait;
use tokio::sync::mpsc;

use super::types::{ChatRequest, CompletionRequest, ProviderError, StreamEvent};

#[async_trait]
pub trait ChatGateway: Send + Sync {
    /// Send a full history and forward every decoded stream event to `tx`
    /// until the upstream closes. Returns early without error when the
    /// receiver is dropped.
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError>;

    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError>;
}
