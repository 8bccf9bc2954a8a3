use serde::{Deserialize, Serialize};

use crate::models::Citation;

// --- Request types ---

#[derive(Debug, Serialize)]
pub struct GatewayRequest {
    pub model: String,
    pub messages: Vec<GatewayMessage>,
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GatewayMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

// --- Response types (non-streaming) ---

#[derive(Debug, Deserialize)]
pub struct GatewayResponse {
    #[serde(default)]
    pub choices: Vec<GatewayChoice>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayChoice {
    pub message: GatewayResponseMessage,
}

#[derive(Debug, Deserialize)]
pub struct GatewayResponseMessage {
    #[serde(default)]
    pub content: Option<String>,
}

// --- Streaming types ---

/// One `data:` payload. Text and images arrive in OpenAI-style deltas,
/// citations and failures as top-level fields.
#[derive(Debug, Default, Deserialize)]
pub struct GatewayStreamChunk {
    #[serde(default)]
    pub choices: Vec<GatewayStreamChoice>,
    #[serde(default)]
    pub sources: Option<Vec<Citation>>,
    #[serde(default)]
    pub error: Option<GatewayStreamError>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayStreamChoice {
    #[serde(default)]
    pub delta: GatewayDelta,
}

#[derive(Debug, Default, Deserialize)]
pub struct GatewayDelta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub images: Option<Vec<GatewayImage>>,
}

#[derive(Debug, Deserialize)]
pub struct GatewayImage {
    pub image_url: GatewayImageUrl,
}

#[derive(Debug, Deserialize)]
pub struct GatewayImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum GatewayStreamError {
    Message(String),
    Detail { message: String },
}

impl GatewayStreamError {
    pub fn into_message(self) -> String {
        match self {
            GatewayStreamError::Message(m) => m,
            GatewayStreamError::Detail { message } => message,
        }
    }
}

// --- Error types ---

#[derive(Debug, Deserialize)]
pub struct GatewayErrorResponse {
    pub error: GatewayStreamError,
}
