//! Folds one streamed reply into the visible message sequence.
//!
//! The assembler owns the in-progress assistant message for the duration of
//! a turn. Readers only ever see immutable snapshots of the whole sequence.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::models::{Citation, Message};
use crate::providers::{ChatGateway, ChatRequest, StreamEvent};

pub type Snapshot = Arc<Vec<Message>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TurnFailure {
    #[error("Generation stopped")]
    Cancelled,

    #[error("Failed to get response: {0}")]
    Transport(String),

    #[error("The model returned an empty response")]
    EmptyResponse,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    TextDelta(String),
    ImageReady(String),
    CitationsReady(Vec<Citation>),
    Completed(Message),
    Failed(TurnFailure),
}

pub struct TurnAssembler {
    base: Vec<Message>,
    in_progress: Option<Message>,
}

impl TurnAssembler {
    pub fn new(base: Vec<Message>) -> Self {
        Self {
            base,
            in_progress: None,
        }
    }

    fn current(&mut self) -> &mut Message {
        self.in_progress
            .get_or_insert_with(Message::assistant_streaming)
    }

    pub fn push_text(&mut self, fragment: &str) {
        self.current().content.push_str(fragment);
    }

    pub fn push_image(&mut self, url: String) {
        self.current().generated_images.push(url);
    }

    pub fn set_citations(&mut self, citations: Vec<Citation>) {
        self.current().citations = citations;
    }

    pub fn has_reply(&self) -> bool {
        self.in_progress.is_some()
    }

    pub fn snapshot(&self) -> Snapshot {
        let mut messages = self.base.clone();
        if let Some(msg) = &self.in_progress {
            messages.push(msg.clone());
        }
        Arc::new(messages)
    }

    /// Freeze the reply and append it. Fails when nothing arrived.
    pub fn finish(self) -> Result<(Vec<Message>, Message), (Vec<Message>, TurnFailure)> {
        let Some(mut reply) = self.in_progress else {
            return Err((self.base, TurnFailure::EmptyResponse));
        };
        reply.streaming = false;
        let mut messages = self.base;
        messages.push(reply.clone());
        Ok((messages, reply))
    }

    /// Drop the partial reply, returning the sequence as it was before the turn.
    pub fn discard(self) -> Vec<Message> {
        self.base
    }
}

pub struct TurnOutcome {
    pub messages: Vec<Message>,
    pub result: Result<Message, TurnFailure>,
}

/// Stream one reply for `request`, folding fragments on top of `base`.
///
/// `on_event` sees every turn event together with the sequence snapshot that
/// reflects it. Cancelling `cancel` aborts the transport and discards the
/// partial reply, as does any transport error.
pub async fn run_turn<F>(
    gateway: Arc<dyn ChatGateway>,
    request: ChatRequest,
    base: Vec<Message>,
    cancel: CancellationToken,
    mut on_event: F,
) -> TurnOutcome
where
    F: FnMut(&TurnEvent, Snapshot) + Send,
{
    let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);

    let stream_handle = tokio::spawn(async move {
        if let Err(e) = gateway.stream_chat(request, tx.clone()).await {
            let _ = tx.send(StreamEvent::Error(e.to_string())).await;
        }
    });

    let mut assembler = TurnAssembler::new(base);

    let outcome = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                break fail(assembler, TurnFailure::Cancelled);
            }
            event = rx.recv() => {
                match event {
                    Some(StreamEvent::Token(token)) => {
                        assembler.push_text(&token);
                        on_event(&TurnEvent::TextDelta(token), assembler.snapshot());
                    }
                    Some(StreamEvent::Image(url)) => {
                        assembler.push_image(url.clone());
                        on_event(&TurnEvent::ImageReady(url), assembler.snapshot());
                    }
                    Some(StreamEvent::Citations(citations)) => {
                        assembler.set_citations(citations.clone());
                        on_event(&TurnEvent::CitationsReady(citations), assembler.snapshot());
                    }
                    Some(StreamEvent::Done) => break complete(assembler),
                    Some(StreamEvent::Error(error)) => {
                        break fail(assembler, TurnFailure::Transport(error));
                    }
                    None => {
                        if assembler.has_reply() {
                            break complete(assembler);
                        }
                        break fail(
                            assembler,
                            TurnFailure::Transport("Stream ended unexpectedly".to_string()),
                        );
                    }
                }
            }
        }
    };

    stream_handle.abort();

    let event = match &outcome.result {
        Ok(reply) => TurnEvent::Completed(reply.clone()),
        Err(failure) => TurnEvent::Failed(failure.clone()),
    };
    on_event(&event, Arc::new(outcome.messages.clone()));

    outcome
}

fn complete(assembler: TurnAssembler) -> TurnOutcome {
    match assembler.finish() {
        Ok((messages, reply)) => TurnOutcome {
            messages,
            result: Ok(reply),
        },
        Err((messages, failure)) => TurnOutcome {
            messages,
            result: Err(failure),
        },
    }
}

fn fail(assembler: TurnAssembler, failure: TurnFailure) -> TurnOutcome {
    match &failure {
        TurnFailure::Cancelled => tracing::info!("Turn cancelled"),
        other => tracing::warn!("Turn failed: {}", other),
    }
    TurnOutcome {
        messages: assembler.discard(),
        result: Err(failure),
    }
}
