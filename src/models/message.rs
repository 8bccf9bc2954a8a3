use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

/// A web source the model cited while answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: String,
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

/// One turn entry in the visible conversation.
///
/// `images` holds data URIs the user attached; `generated_images` holds
/// references produced by the model. `streaming` is only ever set on the
/// assistant message a turn is currently assembling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated_images: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<Citation>,
    #[serde(skip)]
    pub streaming: bool,
}

impl Message {
    pub fn user(content: impl Into<String>, images: Vec<String>) -> Self {
        Self {
            id: new_message_id(),
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            images,
            generated_images: Vec::new(),
            citations: Vec::new(),
            streaming: false,
        }
    }

    /// An empty assistant message in the streaming state.
    pub fn assistant_streaming() -> Self {
        Self {
            id: new_message_id(),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            images: Vec::new(),
            generated_images: Vec::new(),
            citations: Vec::new(),
            streaming: true,
        }
    }

    pub fn to_record(&self, conversation_id: &str) -> MessageRecord {
        // The store has a single image column: attachments for user turns,
        // generated images for assistant turns.
        let image_urls = match self.role {
            Role::User => &self.images,
            Role::Assistant => &self.generated_images,
        };
        MessageRecord {
            id: self.id.clone(),
            conversation_id: conversation_id.to_string(),
            role: self.role.as_str().to_string(),
            content: self.content.clone(),
            image_urls: if image_urls.is_empty() {
                None
            } else {
                Some(image_urls.clone())
            },
            created_at: self.created_at,
        }
    }
}

/// Row shape of the remote `messages` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub role: String,
    pub content: String,
    #[serde(default)]
    pub image_urls: Option<Vec<String>>,
    pub created_at: DateTime<Utc>,
}

impl MessageRecord {
    pub fn into_message(self) -> Option<Message> {
        let role = Role::from_str(&self.role)?;
        let images = self.image_urls.unwrap_or_default();
        let (images, generated_images) = match role {
            Role::User => (images, Vec::new()),
            Role::Assistant => (Vec::new(), images),
        };
        Some(Message {
            id: self.id,
            role,
            content: self.content,
            created_at: self.created_at,
            images,
            generated_images,
            citations: Vec::new(),
            streaming: false,
        })
    }
}

pub fn new_message_id() -> String {
    Uuid::new_v4().to_string()
}
