pub mod gateway;
#[cfg(test)]
pub mod scripted;
pub mod traits;
pub mod types;

pub use gateway::GatewayProvider;
pub use traits::ChatGateway;
pub use types::{ChatMessage, ChatRequest, CompletionRequest, ProviderError, StreamEvent};
