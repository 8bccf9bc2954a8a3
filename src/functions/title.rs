use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::Serialize;

use super::FunctionsState;
use crate::providers::{ChatGateway, CompletionRequest, ProviderError};
use crate::services::persistence::DEFAULT_TITLE;

const SYSTEM_PROMPT: &str = "You are a title generator. Generate a very short title (2-5 words max) that summarizes the user's message topic.
Rules:
- Keep it under 5 words
- Use the same language as the user's message
- Be concise and descriptive
- No quotes, no punctuation at the end
- Just return the title, nothing else";

const TITLE_MAX_CHARS: usize = 40;
const ECHO_CHARS: usize = 30;

#[derive(Debug, Serialize)]
pub struct TitleResponse {
    pub title: String,
}

pub async fn generate_title_handler(
    State(state): State<FunctionsState>,
    body: Bytes,
) -> Json<TitleResponse> {
    let message = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string));

    let title = generate_title(
        state.title_gateway.as_deref(),
        &state.config.title_model,
        message.as_deref(),
    )
    .await;
    Json(TitleResponse { title })
}

/// Best-effort short title for `message`. Never fails: without input or a
/// configured gateway the default title is returned, and an upstream
/// rejection falls back to the start of the message itself.
pub async fn generate_title(
    gateway: Option<&dyn ChatGateway>,
    model: &str,
    message: Option<&str>,
) -> String {
    let Some(message) = message.filter(|m| !m.is_empty()) else {
        return DEFAULT_TITLE.to_string();
    };
    let Some(gateway) = gateway else {
        tracing::warn!("Title gateway is not configured");
        return DEFAULT_TITLE.to_string();
    };

    let result = gateway
        .complete(CompletionRequest {
            model: model.to_string(),
            system_prompt: Some(SYSTEM_PROMPT.to_string()),
            prompt: message.to_string(),
        })
        .await;

    let raw = match result {
        Ok(content) if !content.trim().is_empty() => content,
        Ok(_) | Err(ProviderError::InvalidResponse(_)) => echo(message),
        Err(ProviderError::NetworkError(e)) => {
            tracing::error!(error = %e, "Title generation failed");
            return DEFAULT_TITLE.to_string();
        }
        Err(e) => {
            tracing::error!(error = %e, "Title generation error");
            return echo(message);
        }
    };

    clean(&raw)
}

fn echo(message: &str) -> String {
    message.chars().take(ECHO_CHARS).collect()
}

fn clean(raw: &str) -> String {
    let trimmed = raw.trim();
    let unquoted = trimmed.strip_prefix(['"', '\'']).unwrap_or(trimmed);
    let unquoted = unquoted
        .strip_suffix(['"', '\''])
        .unwrap_or(unquoted)
        .trim();

    if unquoted.chars().count() > TITLE_MAX_CHARS {
        let head: String = unquoted.chars().take(TITLE_MAX_CHARS).collect();
        format!("{head}...")
    } else {
        unquoted.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::scripted::ScriptedGateway;

    #[tokio::test]
    async fn test_title_is_unquoted_and_capped() {
        let gateway = ScriptedGateway::new().with_completion("  \"Trip to Lisbon\"  ");
        let title = generate_title(Some(&gateway), "m", Some("plan my trip")).await;
        assert_eq!(title, "Trip to Lisbon");

        let long = "x".repeat(45);
        let gateway = ScriptedGateway::new().with_completion(&long);
        let title = generate_title(Some(&gateway), "m", Some("hello")).await;
        assert_eq!(title, format!("{}...", "x".repeat(40)));
    }

    #[tokio::test]
    async fn test_upstream_rejection_echoes_message_start() {
        let gateway = ScriptedGateway::new();
        let message = "Explain how photosynthesis works in desert plants";
        let title = generate_title(Some(&gateway), "m", Some(message)).await;
        assert_eq!(title, "Explain how photosynthesis wor");
    }

    #[tokio::test]
    async fn test_missing_input_or_gateway_gives_default() {
        let gateway = ScriptedGateway::new().with_completion("Unused");
        assert_eq!(generate_title(Some(&gateway), "m", None).await, DEFAULT_TITLE);
        assert_eq!(generate_title(Some(&gateway), "m", Some("")).await, DEFAULT_TITLE);
        assert_eq!(generate_title(None, "m", Some("hello")).await, DEFAULT_TITLE);
    }
}
