//! Best-effort mirroring of an authenticated chat to the remote store.
//!
//! Every remote failure is logged and swallowed: the visible conversation
//! keeps working whether or not the write landed.

use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use regex::Regex;

use crate::models::{Conversation, Message, Role};
use crate::services::remote::ConversationStore;

pub const DEFAULT_TITLE: &str = "New Chat";
const TITLE_MAX_CHARS: usize = 50;

static GREETING: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(hi|hello|hey|שלום|היי|מה נשמע|מה קורה)\b[\s,.!]*").ok()
});

/// Title for a conversation, taken from its first user message: a leading
/// greeting is dropped and the first sentence kept, capped in length.
pub fn derive_title(content: &str, fallback: &str) -> String {
    let trimmed = content.trim();
    let stripped = match GREETING.as_ref() {
        Some(re) => re.replace(trimmed, "").trim().to_string(),
        None => trimmed.to_string(),
    };

    let first_sentence = stripped.split(['.', '!', '?']).next().unwrap_or("").trim();
    let mut title = if first_sentence.is_empty() {
        stripped
    } else {
        first_sentence.to_string()
    };

    if title.chars().count() > TITLE_MAX_CHARS {
        title = title.chars().take(TITLE_MAX_CHARS).collect::<String>() + "...";
    }

    if title.is_empty() {
        fallback.to_string()
    } else {
        title
    }
}

pub struct PersistenceAdapter {
    remote: Arc<dyn ConversationStore>,
    user_id: String,
    default_title: String,
    conversation_id: Option<String>,
    titled: bool,
    persisted: HashSet<String>,
}

impl PersistenceAdapter {
    pub fn new(remote: Arc<dyn ConversationStore>, user_id: impl Into<String>) -> Self {
        Self {
            remote,
            user_id: user_id.into(),
            default_title: DEFAULT_TITLE.to_string(),
            conversation_id: None,
            titled: false,
            persisted: HashSet::new(),
        }
    }

    pub fn with_default_title(mut self, title: impl Into<String>) -> Self {
        self.default_title = title.into();
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn remote(&self) -> Arc<dyn ConversationStore> {
        self.remote.clone()
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    /// Forget the current conversation; the next append starts a new one.
    pub fn reset(&mut self) {
        self.conversation_id = None;
        self.titled = false;
        self.persisted.clear();
    }

    pub async fn ensure_conversation(&mut self) -> Option<String> {
        if let Some(id) = &self.conversation_id {
            return Some(id.clone());
        }
        match self
            .remote
            .create_conversation(&self.user_id, &self.default_title)
            .await
        {
            Ok(conv) => {
                tracing::info!(conversation_id = %conv.id, "Conversation created");
                self.conversation_id = Some(conv.id.clone());
                self.titled = false;
                Some(conv.id)
            }
            Err(e) => {
                tracing::error!("Failed to create conversation: {}", e);
                None
            }
        }
    }

    /// Write one finalized message. Messages already written are skipped.
    /// The first user message titles the conversation; every later append
    /// only bumps its updated-at marker.
    pub async fn append_message(&mut self, message: &Message) {
        if self.persisted.contains(&message.id) {
            return;
        }
        let Some(conversation_id) = self.ensure_conversation().await else {
            return;
        };

        if let Err(e) = self
            .remote
            .insert_message(&message.to_record(&conversation_id))
            .await
        {
            tracing::error!(%conversation_id, "Failed to save message: {}", e);
            return;
        }
        self.persisted.insert(message.id.clone());

        let result = if message.role == Role::User && !self.titled {
            self.titled = true;
            let title = derive_title(&message.content, &self.default_title);
            self.remote
                .set_conversation_title(&conversation_id, &title)
                .await
        } else {
            self.remote.touch_conversation(&conversation_id).await
        };
        if let Err(e) = result {
            tracing::warn!(%conversation_id, "Failed to update conversation: {}", e);
        }
    }

    /// Load a conversation's messages and make it the current one.
    pub async fn load_conversation(&mut self, id: &str) -> Option<Vec<Message>> {
        let records = match self.remote.list_messages(id).await {
            Ok(records) => records,
            Err(e) => {
                tracing::error!(conversation_id = %id, "Failed to load conversation: {}", e);
                return None;
            }
        };

        let messages: Vec<Message> = records
            .into_iter()
            .filter_map(|r| r.into_message())
            .collect();

        self.conversation_id = Some(id.to_string());
        self.titled = messages.iter().any(|m| m.role == Role::User);
        self.persisted = messages.iter().map(|m| m.id.clone()).collect();
        Some(messages)
    }

    /// Delete a conversation record; its messages go with it. Returns whether
    /// the current conversation was the one deleted.
    pub async fn delete_conversation(&mut self, id: &str) -> bool {
        if let Err(e) = self.remote.delete_conversation(id).await {
            tracing::error!(conversation_id = %id, "Failed to delete conversation: {}", e);
            return false;
        }
        if self.conversation_id.as_deref() == Some(id) {
            self.reset();
            return true;
        }
        false
    }

    /// Remove the current conversation with all of its messages.
    pub async fn clear_conversation(&mut self) {
        let Some(id) = self.conversation_id.clone() else {
            return;
        };
        if let Err(e) = self.remote.delete_messages(&id).await {
            tracing::error!(conversation_id = %id, "Failed to clear messages: {}", e);
        }
        if let Err(e) = self.remote.delete_conversation(&id).await {
            tracing::error!(conversation_id = %id, "Failed to delete conversation: {}", e);
        }
        self.reset();
    }

    pub async fn delete_message(&mut self, id: &str) {
        if !self.persisted.remove(id) {
            return;
        }
        if let Err(e) = self.remote.delete_message(id).await {
            tracing::error!(message_id = %id, "Failed to delete message: {}", e);
        }
    }

    pub async fn list_conversations(&self) -> Vec<Conversation> {
        match self.remote.list_conversations(&self.user_id).await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!("Failed to list conversations: {}", e);
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::remote::MemoryConversationStore;

    fn adapter(store: &Arc<MemoryConversationStore>) -> PersistenceAdapter {
        PersistenceAdapter::new(store.clone(), "u1")
    }

    #[test]
    fn test_derive_title() {
        assert_eq!(derive_title("Hello! What is Rust? Tell me", "New Chat"), "What is Rust");
        assert_eq!(derive_title("hey, plan my trip. Now", "New Chat"), "plan my trip");
        assert_eq!(derive_title("שלום מה שלומך", "New Chat"), "מה שלומך");
        assert_eq!(derive_title("hi", "New Chat"), "New Chat");
        assert_eq!(derive_title("highway numbers", "New Chat"), "highway numbers");

        let long = "a".repeat(80);
        let title = derive_title(&long, "New Chat");
        assert_eq!(title.chars().count(), 53);
        assert!(title.ends_with("..."));
    }

    #[tokio::test]
    async fn test_title_is_set_once_per_conversation() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut persistence = adapter(&store);

        persistence.append_message(&Message::user("Explain borrowing", Vec::new())).await;
        let first = persistence.conversation_id().unwrap().to_string();
        let mut reply = Message::assistant_streaming();
        reply.content = "Sure".to_string();
        reply.streaming = false;
        persistence.append_message(&reply).await;
        persistence.append_message(&Message::user("And lifetimes?", Vec::new())).await;

        assert_eq!(store.title_of(&first).as_deref(), Some("Explain borrowing"));
        assert_eq!(store.message_count(&first), 3);

        persistence.reset();
        persistence.append_message(&Message::user("Write a haiku", Vec::new())).await;
        let second = persistence.conversation_id().unwrap().to_string();
        assert_ne!(first, second);
        assert_eq!(store.title_of(&second).as_deref(), Some("Write a haiku"));
        assert_eq!(store.title_of(&first).as_deref(), Some("Explain borrowing"));
        assert_eq!(store.tables.lock().unwrap().title_writes, 2);
    }

    #[tokio::test]
    async fn test_duplicate_append_is_skipped() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut persistence = adapter(&store);
        let msg = Message::user("Hi there", Vec::new());
        persistence.append_message(&msg).await;
        persistence.append_message(&msg).await;
        let id = persistence.conversation_id().unwrap().to_string();
        assert_eq!(store.message_count(&id), 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let store = Arc::new(MemoryConversationStore::new());
        store.set_failing(true);
        let mut persistence = adapter(&store);
        persistence.append_message(&Message::user("Hi", Vec::new())).await;
        assert!(persistence.conversation_id().is_none());
        assert!(persistence.list_conversations().await.is_empty());
        assert!(persistence.load_conversation("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_loaded_conversation_keeps_its_title() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut persistence = adapter(&store);
        persistence.append_message(&Message::user("Original topic", Vec::new())).await;
        let id = persistence.conversation_id().unwrap().to_string();

        let mut other = adapter(&store);
        let loaded = other.load_conversation(&id).await.unwrap();
        assert_eq!(loaded.len(), 1);
        other.append_message(&Message::user("Different topic", Vec::new())).await;
        assert_eq!(store.title_of(&id).as_deref(), Some("Original topic"));
    }

    #[tokio::test]
    async fn test_clear_and_delete() {
        let store = Arc::new(MemoryConversationStore::new());
        let mut persistence = adapter(&store);
        let msg = Message::user("To remove", Vec::new());
        persistence.append_message(&msg).await;
        persistence.append_message(&Message::user("Keep", Vec::new())).await;
        let id = persistence.conversation_id().unwrap().to_string();

        persistence.delete_message(&msg.id).await;
        assert_eq!(store.message_count(&id), 1);

        persistence.clear_conversation().await;
        assert!(persistence.conversation_id().is_none());
        assert_eq!(store.message_count(&id), 0);
        assert!(store.title_of(&id).is_none());

        persistence.append_message(&Message::user("Fresh", Vec::new())).await;
        let fresh = persistence.conversation_id().unwrap().to_string();
        assert!(persistence.delete_conversation(&fresh).await);
        assert!(persistence.conversation_id().is_none());
        assert!(persistence.list_conversations().await.is_empty());
    }
}
