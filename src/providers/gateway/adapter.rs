use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::mpsc;

use super::models::*;
use crate::models::Role;
use crate::providers::traits::ChatGateway;
use crate::providers::types::{
    ChatMessage, ChatRequest, CompletionRequest, ProviderError, StreamEvent,
};

/// OpenAI-compatible completion endpoint: either the hosted chat function
/// (streaming, used by the client) or the AI gateway itself (used by the
/// title function).
pub struct GatewayProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl GatewayProvider {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint: endpoint.into(),
            api_key: api_key.filter(|k| !k.is_empty()),
        }
    }

    fn translate_role(role: &Role) -> &'static str {
        match role {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_messages(messages: &[ChatMessage]) -> Vec<GatewayMessage> {
        messages
            .iter()
            .map(|msg| GatewayMessage {
                role: Self::translate_role(&msg.role).to_string(),
                content: msg.content.clone(),
                images: if msg.images.is_empty() {
                    None
                } else {
                    Some(msg.images.clone())
                },
            })
            .collect()
    }

    fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
        if let Ok(parsed) = serde_json::from_str::<GatewayErrorResponse>(body) {
            return format!("HTTP {}: {}", status.as_u16(), parsed.error.into_message());
        }
        format!("HTTP {}: Request failed", status.as_u16())
    }

    async fn post(&self, body: &GatewayRequest) -> Result<reqwest::Response, ProviderError> {
        let mut req = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .json(body);

        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let response = req
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ProviderError::AuthError("Invalid API key".to_string()));
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed(Self::parse_error_message(
                status, &body,
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl ChatGateway for GatewayProvider {
    async fn stream_chat(
        &self,
        request: ChatRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        use super::stream::parse_sse_stream;

        let body = GatewayRequest {
            model: request.model,
            messages: Self::build_messages(&request.messages),
            stream: true,
        };

        let response = self.post(&body).await?;
        parse_sse_stream(response.bytes_stream(), tx).await;

        Ok(())
    }

    async fn complete(&self, request: CompletionRequest) -> Result<String, ProviderError> {
        let mut messages = Vec::new();
        if let Some(prompt) = request.system_prompt.filter(|p| !p.is_empty()) {
            messages.push(GatewayMessage {
                role: "system".to_string(),
                content: prompt,
                images: None,
            });
        }
        messages.push(GatewayMessage {
            role: "user".to_string(),
            content: request.prompt,
            images: None,
        });

        let body = GatewayRequest {
            model: request.model,
            messages,
            stream: false,
        };

        let response: GatewayResponse = self
            .post(&body)
            .await?
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(ProviderError::InvalidResponse(
                "No content in response".to_string(),
            ));
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn history() -> Vec<ChatMessage> {
        vec![ChatMessage {
            role: Role::User,
            content: "Draw a cat".to_string(),
            images: vec!["data:image/png;base64,AAAA".to_string()],
        }]
    }

    #[tokio::test]
    async fn test_stream_chat_sends_history_and_forwards_events() {
        let server = MockServer::start().await;
        let sse = "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n\ndata: [DONE]\n\n";
        Mock::given(method("POST"))
            .and(path("/functions/v1/chat"))
            .and(header("authorization", "Bearer anon"))
            .and(body_partial_json(serde_json::json!({
                "model": "LPT-4",
                "stream": true,
                "messages": [{"role": "user", "content": "Draw a cat", "images": ["data:image/png;base64,AAAA"]}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_raw(sse, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = GatewayProvider::new(
            format!("{}/functions/v1/chat", server.uri()),
            Some("anon".to_string()),
        );
        let (tx, mut rx) = mpsc::channel(16);
        provider
            .stream_chat(
                ChatRequest {
                    model: "LPT-4".to_string(),
                    messages: history(),
                },
                tx,
            )
            .await
            .unwrap();

        assert_eq!(rx.recv().await, Some(StreamEvent::Token("Hi".to_string())));
        assert_eq!(rx.recv().await, Some(StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_stream_chat_maps_rate_limit() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "30"))
            .mount(&server)
            .await;

        let provider = GatewayProvider::new(server.uri(), None);
        let (tx, _rx) = mpsc::channel(1);
        let err = provider
            .stream_chat(
                ChatRequest {
                    model: "LPT-4".to_string(),
                    messages: history(),
                },
                tx,
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(30)
            }
        ));
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "stream": false,
                "messages": [{"role": "system", "content": "be brief"}, {"role": "user", "content": "hello"}]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "Greeting"}}]
            })))
            .mount(&server)
            .await;

        let provider = GatewayProvider::new(server.uri(), Some("key".to_string()));
        let text = provider
            .complete(CompletionRequest {
                model: "m".to_string(),
                system_prompt: Some("be brief".to_string()),
                prompt: "hello".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(text, "Greeting");
    }

    #[tokio::test]
    async fn test_complete_surfaces_upstream_error_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "error": {"message": "overloaded"}
            })))
            .mount(&server)
            .await;

        let provider = GatewayProvider::new(server.uri(), None);
        let err = provider
            .complete(CompletionRequest {
                model: "m".to_string(),
                system_prompt: None,
                prompt: "hello".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Request failed: HTTP 500: overloaded");
    }
}
