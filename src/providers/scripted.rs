use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::traits::ChatGateway;
use super::types::{ChatRequest, CompletionRequest, ProviderError, StreamEvent};

#[derive(Debug, Clone)]
pub enum Step {
    Emit(StreamEvent),
    /// Keep the stream open until the receiver goes away.
    Hang,
}

/// Gateway replaying one script per `stream_chat` call.
#[derive(Default)]
pub struct ScriptedGateway {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<ChatRequest>>,
    completion: Option<String>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completion(mut self, text: &str) -> Self {
        self.completion = Some(text.to_string());
        self
    }

    pub fn then(self, steps: Vec<Step>) -> Self {
        self.scripts.lock().unwrap().push_back(steps);
        self
    }

    pub fn then_events(self, events: Vec<StreamEvent>) -> Self {
        self.then(events.into_iter().map(Step::Emit).collect())
    }

    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub fn text(s: &str) -> StreamEvent {
    StreamEvent::Token(s.to_string())
}

#[async_trait]
impl ChatGateway for ScriptedGateway {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        self.requests.lock().unwrap().push(request);
        let steps = self.scripts.lock().unwrap().pop_front().ok_or_else(|| {
            ProviderError::NetworkError("no scripted response left".to_string())
        })?;
        for step in steps {
            match step {
                Step::Emit(event) => {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Step::Hang => {
                    tx.closed().await;
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<String, ProviderError> {
        self.completion
            .clone()
            .ok_or_else(|| ProviderError::RequestFailed("HTTP 503: unavailable".to_string()))
    }
}
