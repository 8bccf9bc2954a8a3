//! REST client for the hosted backend: PostgREST tables under `/rest/v1`,
//! the identity API under `/auth/v1` and edge functions under
//! `/functions/v1`.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{AuthSession, Conversation, GeneratedImage, MessageRecord};

/// PostgREST code for `.single()` matching no row.
pub const NO_ROWS: &str = "PGRST116";
/// Postgres unique-constraint violation.
pub const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Not signed in")]
    Unauthenticated,

    #[error("HTTP {status}: {message}")]
    Http {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    pub fn code(&self) -> Option<&str> {
        match self {
            RemoteError::Http { code, .. } => code.as_deref(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: Option<String>,
    message: Option<String>,
    msg: Option<String>,
    error_description: Option<String>,
    error: Option<serde_json::Value>,
}

impl ErrorBody {
    fn into_parts(self) -> (Option<String>, Option<String>) {
        let message = self
            .message
            .or(self.error_description)
            .or(self.msg)
            .or_else(|| match self.error {
                Some(serde_json::Value::String(s)) => Some(s),
                _ => None,
            });
        (self.code, message)
    }
}

/// Identity of the bearer of an access token.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    user: AuthUser,
}

/// Remote side of conversation persistence.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, RemoteError>;
    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), RemoteError>;
    async fn touch_conversation(&self, id: &str) -> Result<(), RemoteError>;
    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RemoteError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), RemoteError>;
    async fn insert_message(&self, record: &MessageRecord) -> Result<(), RemoteError>;
    async fn list_messages(&self, conversation_id: &str)
        -> Result<Vec<MessageRecord>, RemoteError>;
    async fn delete_messages(&self, conversation_id: &str) -> Result<(), RemoteError>;
    async fn delete_message(&self, id: &str) -> Result<(), RemoteError>;
    async fn save_generated_image(&self, image: &GeneratedImage) -> Result<(), RemoteError>;
}

pub fn eq(value: impl std::fmt::Display) -> String {
    format!("eq.{value}")
}

pub fn in_list<S: AsRef<str>>(values: &[S]) -> String {
    let joined: Vec<&str> = values.iter().map(|v| v.as_ref()).collect();
    format!("in.({})", joined.join(","))
}

#[derive(Clone)]
pub struct SupabaseClient {
    client: Client,
    base_url: String,
    anon_key: String,
    access_token: Option<String>,
}

impl SupabaseClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            access_token: None,
        }
    }

    /// A copy of this client acting on behalf of `session`.
    pub fn with_session(&self, session: &AuthSession) -> Self {
        Self {
            access_token: Some(session.access_token.clone()),
            ..self.clone()
        }
    }

    pub fn function_url(&self, name: &str) -> String {
        format!("{}/functions/v1/{}", self.base_url, name)
    }

    fn rest_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        req.header("apikey", &self.anon_key).bearer_auth(token)
    }

    async fn send(req: RequestBuilder) -> Result<Response, RemoteError> {
        let response = req
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = serde_json::from_str::<ErrorBody>(&body)
            .map(ErrorBody::into_parts)
            .unwrap_or((None, None));
        Err(RemoteError::Http {
            status: status.as_u16(),
            code,
            message: message.unwrap_or_else(|| {
                status
                    .canonical_reason()
                    .unwrap_or("Request failed")
                    .to_string()
            }),
        })
    }

    async fn json<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
        response
            .json()
            .await
            .map_err(|e| RemoteError::InvalidResponse(e.to_string()))
    }

    pub async fn select<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, RemoteError> {
        let req = self.authorize(self.client.get(self.rest_url(table)).query(query));
        Self::json(Self::send(req).await?).await
    }

    /// Select exactly one row; no match is a `PGRST116` error.
    pub async fn select_single<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<T, RemoteError> {
        let req = self.authorize(
            self.client
                .get(self.rest_url(table))
                .query(query)
                .header("accept", "application/vnd.pgrst.object+json"),
        );
        Self::json(Self::send(req).await?).await
    }

    pub async fn insert<T, R>(&self, table: &str, row: &T) -> Result<Vec<R>, RemoteError>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let req = self.authorize(
            self.client
                .post(self.rest_url(table))
                .header("prefer", "return=representation")
                .json(row),
        );
        Self::json(Self::send(req).await?).await
    }

    pub async fn insert_minimal<T: Serialize + ?Sized>(
        &self,
        table: &str,
        row: &T,
    ) -> Result<(), RemoteError> {
        let req = self.authorize(
            self.client
                .post(self.rest_url(table))
                .header("prefer", "return=minimal")
                .json(row),
        );
        Self::send(req).await?;
        Ok(())
    }

    pub async fn update<T: Serialize + ?Sized>(
        &self,
        table: &str,
        filters: &[(&str, String)],
        patch: &T,
    ) -> Result<(), RemoteError> {
        let req = self.authorize(
            self.client
                .patch(self.rest_url(table))
                .query(filters)
                .header("prefer", "return=minimal")
                .json(patch),
        );
        Self::send(req).await?;
        Ok(())
    }

    pub async fn delete(&self, table: &str, filters: &[(&str, String)]) -> Result<(), RemoteError> {
        let req = self.authorize(self.client.delete(self.rest_url(table)).query(filters));
        Self::send(req).await?;
        Ok(())
    }

    /// Row count from the `Content-Range` header of a counting HEAD request.
    pub async fn count(&self, table: &str, filters: &[(&str, String)]) -> Result<usize, RemoteError> {
        let req = self.authorize(
            self.client
                .head(self.rest_url(table))
                .query(&[("select", "id".to_string())])
                .query(filters)
                .header("prefer", "count=exact"),
        );
        let response = Self::send(req).await?;
        response
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|total| total.parse().ok())
            .ok_or_else(|| RemoteError::InvalidResponse("Missing content-range total".to_string()))
    }

    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<AuthSession, RemoteError> {
        let req = self
            .client
            .post(format!("{}/auth/v1/token", self.base_url))
            .query(&[("grant_type", "password")])
            .header("apikey", &self.anon_key)
            .json(&serde_json::json!({ "email": email, "password": password }));
        let token: TokenResponse = Self::json(Self::send(req).await?).await?;
        Ok(AuthSession {
            user_id: token.user.id,
            email: token.user.email,
            access_token: token.access_token,
        })
    }

    /// Resolve an access token to its user. An expired or forged token is
    /// reported as `Unauthenticated`.
    pub async fn get_user(&self, access_token: &str) -> Result<AuthUser, RemoteError> {
        let req = self
            .client
            .get(format!("{}/auth/v1/user", self.base_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token);
        match Self::send(req).await {
            Ok(response) => Self::json(response).await,
            Err(RemoteError::Http { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                Err(RemoteError::Unauthenticated)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn invoke_function<B, R>(&self, name: &str, body: &B) -> Result<R, RemoteError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let req = self.authorize(self.client.post(self.function_url(name)).json(body));
        Self::json(Self::send(req).await?).await
    }

    /// Whether `user_id` holds `role` in `user_roles`.
    pub async fn has_role(&self, user_id: &str, role: &str) -> Result<bool, RemoteError> {
        let rows: Vec<serde_json::Value> = self
            .select(
                "user_roles",
                &[
                    ("select", "role".to_string()),
                    ("user_id", eq(user_id)),
                    ("role", eq(role)),
                ],
            )
            .await?;
        Ok(!rows.is_empty())
    }
}

#[derive(Serialize)]
struct NewConversation<'a> {
    user_id: &'a str,
    title: &'a str,
}

#[async_trait]
impl ConversationStore for SupabaseClient {
    async fn create_conversation(
        &self,
        user_id: &str,
        title: &str,
    ) -> Result<Conversation, RemoteError> {
        let rows: Vec<Conversation> = self
            .insert("conversations", &NewConversation { user_id, title })
            .await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| RemoteError::InvalidResponse("Insert returned no row".to_string()))
    }

    async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), RemoteError> {
        self.update(
            "conversations",
            &[("id", eq(id))],
            &serde_json::json!({ "title": title, "updated_at": Utc::now() }),
        )
        .await
    }

    async fn touch_conversation(&self, id: &str) -> Result<(), RemoteError> {
        self.update(
            "conversations",
            &[("id", eq(id))],
            &serde_json::json!({ "updated_at": Utc::now() }),
        )
        .await
    }

    async fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>, RemoteError> {
        self.select(
            "conversations",
            &[
                ("select", "*".to_string()),
                ("user_id", eq(user_id)),
                ("order", "updated_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), RemoteError> {
        self.delete("conversations", &[("id", eq(id))]).await
    }

    async fn insert_message(&self, record: &MessageRecord) -> Result<(), RemoteError> {
        self.insert_minimal("messages", record).await
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<MessageRecord>, RemoteError> {
        self.select(
            "messages",
            &[
                ("select", "*".to_string()),
                ("conversation_id", eq(conversation_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn delete_messages(&self, conversation_id: &str) -> Result<(), RemoteError> {
        self.delete("messages", &[("conversation_id", eq(conversation_id))])
            .await
    }

    async fn delete_message(&self, id: &str) -> Result<(), RemoteError> {
        self.delete("messages", &[("id", eq(id))]).await
    }

    async fn save_generated_image(&self, image: &GeneratedImage) -> Result<(), RemoteError> {
        self.insert_minimal("generated_images", image).await
    }
}

#[cfg(test)]
pub use memory::MemoryConversationStore;

#[cfg(test)]
mod memory {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use super::{ConversationStore, RemoteError};
    use crate::models::{Conversation, GeneratedImage, MessageRecord};

    #[derive(Default)]
    pub struct Tables {
        pub conversations: Vec<Conversation>,
        pub messages: Vec<MessageRecord>,
        pub images: Vec<GeneratedImage>,
        pub title_writes: usize,
    }

    /// In-memory stand-in for the hosted tables.
    #[derive(Default)]
    pub struct MemoryConversationStore {
        pub tables: Mutex<Tables>,
        pub fail: Mutex<bool>,
    }

    impl MemoryConversationStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_failing(&self, fail: bool) {
            *self.fail.lock().unwrap() = fail;
        }

        fn check(&self) -> Result<(), RemoteError> {
            if *self.fail.lock().unwrap() {
                return Err(RemoteError::Network("connection refused".to_string()));
            }
            Ok(())
        }

        pub fn title_of(&self, id: &str) -> Option<String> {
            let tables = self.tables.lock().unwrap();
            tables
                .conversations
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.title.clone())
        }

        pub fn message_count(&self, conversation_id: &str) -> usize {
            let tables = self.tables.lock().unwrap();
            tables
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .count()
        }
    }

    #[async_trait]
    impl ConversationStore for MemoryConversationStore {
        async fn create_conversation(
            &self,
            user_id: &str,
            title: &str,
        ) -> Result<Conversation, RemoteError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let conv = Conversation {
                id: format!("conv-{}", tables.conversations.len() + 1),
                user_id: user_id.to_string(),
                title: title.to_string(),
                created_at: Some(Utc::now()),
                updated_at: Utc::now(),
            };
            tables.conversations.push(conv.clone());
            Ok(conv)
        }

        async fn set_conversation_title(&self, id: &str, title: &str) -> Result<(), RemoteError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            tables.title_writes += 1;
            if let Some(conv) = tables.conversations.iter_mut().find(|c| c.id == id) {
                conv.title = title.to_string();
                conv.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn touch_conversation(&self, id: &str) -> Result<(), RemoteError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            if let Some(conv) = tables.conversations.iter_mut().find(|c| c.id == id) {
                conv.updated_at = Utc::now();
            }
            Ok(())
        }

        async fn list_conversations(
            &self,
            user_id: &str,
        ) -> Result<Vec<Conversation>, RemoteError> {
            self.check()?;
            let tables = self.tables.lock().unwrap();
            let mut list: Vec<Conversation> = tables
                .conversations
                .iter()
                .filter(|c| c.user_id == user_id)
                .cloned()
                .collect();
            list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
            Ok(list)
        }

        async fn delete_conversation(&self, id: &str) -> Result<(), RemoteError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            tables.conversations.retain(|c| c.id != id);
            tables.messages.retain(|m| m.conversation_id != id);
            Ok(())
        }

        async fn insert_message(&self, record: &MessageRecord) -> Result<(), RemoteError> {
            self.check()?;
            self.tables.lock().unwrap().messages.push(record.clone());
            Ok(())
        }

        async fn list_messages(
            &self,
            conversation_id: &str,
        ) -> Result<Vec<MessageRecord>, RemoteError> {
            self.check()?;
            let tables = self.tables.lock().unwrap();
            Ok(tables
                .messages
                .iter()
                .filter(|m| m.conversation_id == conversation_id)
                .cloned()
                .collect())
        }

        async fn delete_messages(&self, conversation_id: &str) -> Result<(), RemoteError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            tables.messages.retain(|m| m.conversation_id != conversation_id);
            Ok(())
        }

        async fn delete_message(&self, id: &str) -> Result<(), RemoteError> {
            self.check()?;
            self.tables.lock().unwrap().messages.retain(|m| m.id != id);
            Ok(())
        }

        async fn save_generated_image(&self, image: &GeneratedImage) -> Result<(), RemoteError> {
            self.check()?;
            self.tables.lock().unwrap().images.push(image.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn session() -> AuthSession {
        AuthSession {
            user_id: "u1".to_string(),
            email: Some("a@b.c".to_string()),
            access_token: "user-token".to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_conversation_sends_user_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/conversations"))
            .and(header("apikey", "anon"))
            .and(header("authorization", "Bearer user-token"))
            .and(header("prefer", "return=representation"))
            .and(body_partial_json(serde_json::json!({"user_id": "u1", "title": "New Chat"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!([{
                "id": "c1",
                "user_id": "u1",
                "title": "New Chat",
                "created_at": "2025-03-10T09:00:00Z",
                "updated_at": "2025-03-10T09:00:00Z"
            }])))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon").with_session(&session());
        let conv = client.create_conversation("u1", "New Chat").await.unwrap();
        assert_eq!(conv.id, "c1");
    }

    #[tokio::test]
    async fn test_list_messages_filters_and_orders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/messages"))
            .and(query_param("conversation_id", "eq.c1"))
            .and(query_param("order", "created_at.asc"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{
                "id": "m1",
                "conversation_id": "c1",
                "role": "user",
                "content": "Hi",
                "image_urls": null,
                "created_at": "2025-03-10T09:00:00Z"
            }])))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let rows = client.list_messages("c1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "Hi");
    }

    #[tokio::test]
    async fn test_postgrest_error_code_is_kept() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "code": "23505",
                "message": "duplicate key value violates unique constraint"
            })))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let err = client
            .update("profiles", &[("id", eq("u1"))], &serde_json::json!({"handle": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(UNIQUE_VIOLATION));
    }

    #[tokio::test]
    async fn test_count_reads_content_range() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/rest/v1/generated_images"))
            .and(query_param("user_id", "eq.u1"))
            .and(header("prefer", "count=exact"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-range", "0-6/7"))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let n = client
            .count("generated_images", &[("user_id", eq("u1"))])
            .await
            .unwrap();
        assert_eq!(n, 7);
    }

    #[tokio::test]
    async fn test_password_sign_in() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "jwt",
                "token_type": "bearer",
                "user": {"id": "u1", "email": "a@b.c"}
            })))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let session = client.sign_in_with_password("a@b.c", "pw").await.unwrap();
        assert_eq!(session.user_id, "u1");
        assert_eq!(session.access_token, "jwt");
    }

    #[tokio::test]
    async fn test_get_user_rejects_bad_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/auth/v1/user"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "msg": "invalid JWT"
            })))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        assert!(matches!(
            client.get_user("bogus").await,
            Err(RemoteError::Unauthenticated)
        ));
    }

    #[test]
    fn test_filter_helpers() {
        assert_eq!(eq("c1"), "eq.c1");
        assert_eq!(in_list(&["a", "b"]), "in.(a,b)");
    }
}
