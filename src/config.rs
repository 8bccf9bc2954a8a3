//! Configuration for the chat client and the functions service, loaded from
//! environment variables with defaults for local development.

use std::net::SocketAddr;
use std::path::PathBuf;

pub const APP_ID: &str = "ai.deta.Deta";

/// Settings for the interactive client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Env: `DETA_SUPABASE_URL`
    pub supabase_url: String,

    /// Public (anon) API key of the hosted backend.
    /// Env: `DETA_SUPABASE_ANON_KEY`
    pub supabase_anon_key: String,

    /// Streaming chat endpoint.
    /// Env: `DETA_CHAT_URL`
    /// Default: `{supabase_url}/functions/v1/chat`
    pub chat_url: String,

    /// Directory holding the local store.
    /// Env: `DETA_DATA_DIR`
    /// Default: `$XDG_DATA_HOME/deta`, else `~/.local/share/deta`
    pub data_dir: PathBuf,

    /// Env: `DETA_DAILY_LIMIT`
    /// Default: `10`
    pub daily_message_limit: u32,

    /// Models listed but not selectable (comma-separated).
    /// Env: `DETA_UNAVAILABLE_MODELS`
    pub unavailable_models: Vec<String>,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let supabase_url = get("DETA_SUPABASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| "http://localhost:54321".to_string());

        let chat_url = get("DETA_CHAT_URL")
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| format!("{}/functions/v1/chat", supabase_url));

        let data_dir = get("DETA_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| get("XDG_DATA_HOME").map(|d| PathBuf::from(d).join("deta")))
            .or_else(|| {
                get("HOME").map(|h| PathBuf::from(h).join(".local").join("share").join("deta"))
            })
            .unwrap_or_else(|| PathBuf::from(".deta"));

        let mut daily_message_limit = 10;
        if let Some(val) = get("DETA_DAILY_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) => daily_message_limit = n,
                Err(_) => tracing::warn!(value = %val, "Invalid DETA_DAILY_LIMIT, using default"),
            }
        }

        let unavailable_models = get("DETA_UNAVAILABLE_MODELS")
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|m| !m.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Self {
            supabase_url,
            supabase_anon_key: get("DETA_SUPABASE_ANON_KEY").unwrap_or_default(),
            chat_url,
            data_dir,
            daily_message_limit,
            unavailable_models,
        }
    }
}

/// Settings for the `serve` command (title and transcription functions).
#[derive(Debug, Clone)]
pub struct FunctionsConfig {
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// OpenAI-compatible completion endpoint used for titles.
    /// Env: `AI_GATEWAY_URL`
    pub gateway_url: String,

    /// Env: `LOVABLE_API_KEY`
    /// Default: unset, in which case every title is the default title.
    pub gateway_api_key: Option<String>,

    /// Env: `TITLE_MODEL`
    pub title_model: String,

    /// Env: `OPENAI_API_KEY`
    pub openai_api_key: Option<String>,

    /// Env: `TRANSCRIPTION_URL`
    pub transcription_url: String,

    /// Identity backend used to recognise signed-in callers.
    /// Env: `SUPABASE_URL`, `SUPABASE_ANON_KEY`
    pub supabase_url: Option<String>,
    pub supabase_anon_key: String,

    /// Anonymous transcriptions per client IP per hour.
    /// Env: `ANONYMOUS_TRANSCRIPTION_LIMIT`
    /// Default: `5`
    pub anonymous_transcription_limit: u32,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], 8080).into(),
            gateway_url: "https://ai.gateway.lovable.dev/v1/chat/completions".to_string(),
            gateway_api_key: None,
            title_model: "google/gemini-2.5-flash-lite".to_string(),
            openai_api_key: None,
            transcription_url: "https://api.openai.com/v1/audio/transcriptions".to_string(),
            supabase_url: None,
            supabase_anon_key: String::new(),
            anonymous_transcription_limit: 5,
        }
    }
}

impl FunctionsConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| get(key).filter(|v| !v.trim().is_empty());

        if let Some(addr) = non_empty("HTTP_ADDR") {
            if let Ok(parsed) = addr.parse::<SocketAddr>() {
                config.http_addr = parsed;
            } else {
                tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default");
            }
        }

        if let Some(url) = non_empty("AI_GATEWAY_URL") {
            config.gateway_url = url;
        }
        config.gateway_api_key = non_empty("LOVABLE_API_KEY");
        if let Some(model) = non_empty("TITLE_MODEL") {
            config.title_model = model;
        }

        config.openai_api_key = non_empty("OPENAI_API_KEY");
        if let Some(url) = non_empty("TRANSCRIPTION_URL") {
            config.transcription_url = url;
        }

        config.supabase_url = non_empty("SUPABASE_URL");
        config.supabase_anon_key = non_empty("SUPABASE_ANON_KEY").unwrap_or_default();

        if let Some(val) = non_empty("ANONYMOUS_TRANSCRIPTION_LIMIT") {
            match val.parse::<u32>() {
                Ok(n) => config.anonymous_transcription_limit = n,
                Err(_) => tracing::warn!(
                    value = %val,
                    "Invalid ANONYMOUS_TRANSCRIPTION_LIMIT, using default"
                ),
            }
        }

        config
    }
}
