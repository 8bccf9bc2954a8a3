use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::models::{Conversation, GeneratedImage, Message, Role};
use crate::providers::{ChatGateway, ChatMessage, ChatRequest};
use crate::services::assembler::{run_turn, Snapshot, TurnEvent, TurnFailure};
use crate::services::persistence::PersistenceAdapter;
use crate::services::policy::{ModelChange, PolicyEngine, PolicyError, PolicyNotice};

/// Prompt sent when the user attaches images without any text.
pub const IMAGE_ONLY_PROMPT: &str = "Check these images";
const IMAGE_LIBRARY_PROMPT: &str = "Generated image";

static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)\bdan\b",
        r"(?i)\bjailbreak\b",
        r"(?i)\bignore.*instructions\b",
        r"(?i)\bpretend.*no.*rules\b",
        r"(?i)\bdo.*anything.*now\b",
        r"(?i)\bbypass.*restrictions\b",
        r"(?i)\broleplay.*evil\b",
        r"(?i)\bact.*without.*limits\b",
        r"(?i)\bdisregard.*previous\b",
        r"(?i)\bforget.*rules\b",
        r"(?i)\bno.*ethical\b",
        r"(?i)\bno.*moral\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

pub fn contains_blocked_content(text: &str) -> bool {
    BLOCKED_PATTERNS.iter().any(|re| re.is_match(text))
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message is empty")]
    EmptyInput,

    #[error("A response is still being generated")]
    TurnInFlight,

    #[error("Your message contains content that violates the usage policy. Remove any jailbreak or DAN attempts.")]
    BlockedContent,

    #[error("There is no message to regenerate")]
    NothingToRegenerate,

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Result of one turn that passed the policy checks.
#[derive(Debug)]
pub struct TurnReport {
    pub model: String,
    pub result: Result<Message, TurnFailure>,
    /// The premium window started because of this turn.
    pub premium_window_started: bool,
}

/// Cancels whichever turn is in flight. Cheap to clone and usable from
/// another task while the session is busy.
#[derive(Clone, Default)]
pub struct StopHandle {
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl StopHandle {
    /// Returns `false` when no turn was running.
    pub fn stop(&self) -> bool {
        match self.current.lock().map(|guard| guard.clone()) {
            Ok(Some(token)) => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.current.lock().map(|g| g.is_some()).unwrap_or(false)
    }

    fn begin(&self) -> Option<CancellationToken> {
        let mut guard = self.current.lock().ok()?;
        if guard.is_some() {
            return None;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        Some(token)
    }

    fn end(&self) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = None;
        }
    }
}

/// One chat window: the visible sequence plus the policy, streaming and
/// persistence collaborators acting on it.
pub struct ChatSession {
    gateway: Arc<dyn ChatGateway>,
    policy: PolicyEngine,
    persistence: Option<PersistenceAdapter>,
    messages: Vec<Message>,
    updates: watch::Sender<Snapshot>,
    stop: StopHandle,
}

impl ChatSession {
    pub fn new(
        gateway: Arc<dyn ChatGateway>,
        policy: PolicyEngine,
        persistence: Option<PersistenceAdapter>,
    ) -> Self {
        let (updates, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            gateway,
            policy,
            persistence,
            messages: Vec::new(),
            updates,
            stop: StopHandle::default(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn is_authenticated(&self) -> bool {
        self.persistence.is_some()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.persistence.as_ref().and_then(|p| p.conversation_id())
    }

    fn publish(&self) {
        self.updates.send_replace(Arc::new(self.messages.clone()));
    }

    pub async fn submit(&mut self, text: &str, images: Vec<String>) -> Result<TurnReport, ChatError> {
        if self.stop.is_running() {
            return Err(ChatError::TurnInFlight);
        }
        let text = text.trim();
        if text.is_empty() && images.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        if contains_blocked_content(text) {
            return Err(ChatError::BlockedContent);
        }

        self.policy.check_and_consume_message_quota().await?;
        let model = self.policy.active_model().await?;

        let content = if text.is_empty() { IMAGE_ONLY_PROMPT } else { text };
        let user_message = Message::user(content, images);
        self.messages.push(user_message.clone());
        self.publish();

        if let Some(persistence) = self.persistence.as_mut() {
            persistence.append_message(&user_message).await;
        }

        Ok(self.stream_reply(model, text.to_string()).await)
    }

    /// Drop everything after the last user message and ask again.
    pub async fn regenerate(&mut self) -> Result<TurnReport, ChatError> {
        if self.stop.is_running() {
            return Err(ChatError::TurnInFlight);
        }
        let last_user = self
            .messages
            .iter()
            .rposition(|m| m.role == Role::User)
            .ok_or(ChatError::NothingToRegenerate)?;

        self.policy.check_and_consume_message_quota().await?;
        let model = self.policy.active_model().await?;

        let discarded: Vec<Message> = self.messages.drain(last_user + 1..).collect();
        self.publish();
        if let Some(persistence) = self.persistence.as_mut() {
            for msg in &discarded {
                persistence.delete_message(&msg.id).await;
            }
        }

        let prompt = self.messages[last_user].content.clone();
        Ok(self.stream_reply(model, prompt).await)
    }

    async fn stream_reply(&mut self, model: String, prompt: String) -> TurnReport {
        let Some(cancel) = self.stop.begin() else {
            return TurnReport {
                model,
                result: Err(TurnFailure::Transport("Another turn is running".to_string())),
                premium_window_started: false,
            };
        };

        let request = ChatRequest {
            model: model.clone(),
            messages: self.messages.iter().map(to_chat_message).collect(),
        };

        let updates = self.updates.clone();
        let library = self
            .persistence
            .as_ref()
            .map(|p| (p.remote(), p.user_id().to_string()));
        let library_prompt = if prompt.is_empty() {
            IMAGE_LIBRARY_PROMPT.to_string()
        } else {
            prompt
        };

        let outcome = run_turn(
            self.gateway.clone(),
            request,
            self.messages.clone(),
            cancel,
            |event, snapshot| {
                if let (TurnEvent::ImageReady(url), Some((remote, user_id))) = (event, &library) {
                    let remote = remote.clone();
                    let image = GeneratedImage {
                        user_id: user_id.clone(),
                        prompt: library_prompt.clone(),
                        image_url: url.clone(),
                    };
                    tokio::spawn(async move {
                        if let Err(e) = remote.save_generated_image(&image).await {
                            tracing::warn!("Failed to save image to library: {}", e);
                        }
                    });
                }
                updates.send_replace(snapshot);
            },
        )
        .await;

        self.stop.end();
        self.messages = outcome.messages;

        let mut premium_window_started = false;
        if let Ok(reply) = &outcome.result {
            match self.policy.note_model_used(&model).await {
                Ok(started) => premium_window_started = started,
                Err(e) => tracing::warn!("Failed to record model use: {}", e),
            }

            if let Some(persistence) = self.persistence.as_mut() {
                let user = self
                    .messages
                    .iter()
                    .rev()
                    .find(|m| m.role == Role::User)
                    .cloned();
                if let Some(user) = user {
                    persistence.append_message(&user).await;
                }
                persistence.append_message(reply).await;
            }
        }

        TurnReport {
            model,
            result: outcome.result,
            premium_window_started,
        }
    }

    pub async fn change_model(&mut self, target: &str) -> Result<ModelChange, ChatError> {
        Ok(self.policy.request_model_change(target).await?)
    }

    /// One-second poll of the premium window.
    pub async fn tick(&self) -> Option<PolicyNotice> {
        match self.policy.tick_premium_window().await {
            Ok(notice) => notice,
            Err(e) => {
                tracing::warn!("Premium window check failed: {}", e);
                None
            }
        }
    }

    /// Empty the chat; a signed-in user's stored conversation goes with it.
    pub async fn clear(&mut self) {
        self.messages.clear();
        self.publish();
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.clear_conversation().await;
        }
    }

    pub fn new_conversation(&mut self) {
        self.messages.clear();
        self.publish();
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.reset();
        }
    }

    pub async fn load_conversation(&mut self, id: &str) -> bool {
        let Some(persistence) = self.persistence.as_mut() else {
            return false;
        };
        match persistence.load_conversation(id).await {
            Some(messages) => {
                self.messages = messages;
                self.publish();
                true
            }
            None => false,
        }
    }

    pub async fn delete_conversation(&mut self, id: &str) -> bool {
        let Some(persistence) = self.persistence.as_mut() else {
            return false;
        };
        if persistence.delete_conversation(id).await {
            self.messages.clear();
            self.publish();
        }
        true
    }

    pub async fn delete_message(&mut self, id: &str) -> bool {
        let Some(pos) = self.messages.iter().position(|m| m.id == id) else {
            return false;
        };
        self.messages.remove(pos);
        self.publish();
        if let Some(persistence) = self.persistence.as_mut() {
            persistence.delete_message(id).await;
        }
        true
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        match &self.persistence {
            Some(persistence) => persistence.list_conversations().await,
            None => Vec::new(),
        }
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    ChatMessage {
        role: message.role,
        content: message.content.clone(),
        images: message.images.clone(),
    }
}
