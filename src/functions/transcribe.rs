use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use base64::Engine;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::error::FunctionError;
use super::rate_limit::client_ip;
use super::FunctionsState;
use crate::services::remote::{RemoteError, SupabaseClient};

const WHISPER_MODEL: &str = "whisper-1";

/// Speech-to-text backend.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, FunctionError>;
}

/// Decides whether a bearer token belongs to a signed-in user.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn is_authenticated(&self, access_token: &str) -> bool;
}

pub struct WhisperTranscriber {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key,
        }
    }
}

#[derive(Deserialize)]
struct WhisperResponse {
    text: String,
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, audio: Vec<u8>) -> Result<String, FunctionError> {
        let file = Part::bytes(audio)
            .file_name("audio.webm")
            .mime_str("audio/webm")
            .map_err(|e| FunctionError::Upstream(e.to_string()))?;
        let form = Form::new()
            .part("file", file)
            .text("model", WHISPER_MODEL);

        let mut req = self.client.post(&self.endpoint).multipart(form);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| FunctionError::Upstream(e.to_string()))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FunctionError::Upstream(body));
        }

        let parsed: WhisperResponse = response
            .json()
            .await
            .map_err(|e| FunctionError::Upstream(e.to_string()))?;
        Ok(parsed.text)
    }
}

/// Token check against the hosted identity service.
pub struct SupabaseVerifier {
    client: SupabaseClient,
}

impl SupabaseVerifier {
    pub fn new(client: SupabaseClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IdentityVerifier for SupabaseVerifier {
    async fn is_authenticated(&self, access_token: &str) -> bool {
        match self.client.get_user(access_token).await {
            Ok(_) => true,
            Err(RemoteError::Unauthenticated) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Identity check failed, treating caller as anonymous");
                false
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TranscribeResponse {
    pub text: String,
}

pub async fn transcribe_handler(
    State(state): State<FunctionsState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<TranscribeResponse>, FunctionError> {
    if !caller_is_authenticated(&state, &headers).await {
        let ip = client_ip(&headers);
        let admission = state.anonymous_limiter.check(&ip).await;
        if !admission.allowed {
            tracing::info!(ip = %ip, "Rate limit exceeded for anonymous user");
            return Err(FunctionError::RateLimited);
        }
        tracing::info!(ip = %ip, remaining = admission.remaining, "Anonymous transcription request");
    }

    let audio = serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| FunctionError::BadRequest(e.to_string()))?
        .get("audio")
        .and_then(|a| a.as_str())
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .ok_or(FunctionError::MissingAudio)?;

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(audio.trim())
        .map_err(|e| FunctionError::BadRequest(format!("Invalid audio encoding: {e}")))?;

    let text = state
        .transcriber
        .transcribe(bytes)
        .await
        .inspect_err(|e| tracing::error!(error = %e, "Transcribe error"))?;
    Ok(Json(TranscribeResponse { text }))
}

async fn caller_is_authenticated(state: &FunctionsState, headers: &HeaderMap) -> bool {
    let Some(verifier) = &state.identity else {
        return false;
    };
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.strip_prefix("Bearer ").unwrap_or(v).trim())
        .filter(|t| !t.is_empty());
    match token {
        Some(token) => verifier.is_authenticated(token).await,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_whisper_returns_text() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/transcriptions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"text": "hello there"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let transcriber = WhisperTranscriber::new(
            format!("{}/v1/audio/transcriptions", server.uri()),
            Some("sk-test".to_string()),
        );
        let text = transcriber.transcribe(b"abc".to_vec()).await.unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn test_whisper_error_body_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad audio"))
            .mount(&server)
            .await;

        let transcriber = WhisperTranscriber::new(server.uri(), None);
        let err = transcriber.transcribe(vec![1]).await.unwrap_err();
        assert_eq!(err.to_string(), "Transcription API error: bad audio");
    }

    #[tokio::test]
    async fn test_verifier_rejects_expired_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer good"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "u1"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .and(header("authorization", "Bearer stale"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({"msg": "expired"})))
            .mount(&server)
            .await;

        let verifier = SupabaseVerifier::new(SupabaseClient::new(server.uri(), "anon"));
        assert!(verifier.is_authenticated("good").await);
        assert!(!verifier.is_authenticated("stale").await);
    }
}
