use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::ClientConfig;
use crate::models::{AuthSession, SessionKind};
use crate::providers::GatewayProvider;
use crate::services::attachments;
use crate::services::discover::DiscoverService;
use crate::services::policy::{ModelCatalog, PolicyLimits};
use crate::services::remote::RemoteError;
use crate::services::{
    ChatSession, KeyValueStore, LocalStore, MemoryStore, PersistenceAdapter, PolicyEngine,
    SessionVault, SupabaseClient, SystemClock,
};

/// Everything a command needs: configuration, the backend client and the
/// identity of whoever is at the keyboard.
pub struct App {
    pub config: ClientConfig,
    client: SupabaseClient,
    identity: SessionKind,
    vault: Option<SessionVault>,
}

#[derive(Deserialize)]
struct TranscriptResponse {
    text: String,
}

impl App {
    /// Load configuration and restore a stored session. A session the
    /// identity service no longer accepts is dropped.
    pub async fn load() -> Result<Self> {
        let config = ClientConfig::from_env();
        let client = SupabaseClient::new(&config.supabase_url, &config.supabase_anon_key);

        let vault = match SessionVault::new().await {
            Ok(vault) => Some(vault),
            Err(e) => {
                tracing::warn!("Secret service unavailable, continuing signed out: {:#}", e);
                None
            }
        };

        let stored = match &vault {
            Some(vault) => vault.load().await.unwrap_or_else(|e| {
                tracing::warn!("Failed to read stored session: {:#}", e);
                None
            }),
            None => None,
        };

        let identity = match stored {
            Some(session) => match client.get_user(&session.access_token).await {
                Ok(_) => SessionKind::Authenticated(session),
                Err(RemoteError::Unauthenticated) => {
                    tracing::info!(user_id = %session.user_id, "Stored session expired");
                    if let Some(vault) = &vault {
                        if let Err(e) = vault.clear().await {
                            tracing::warn!("Failed to clear expired session: {:#}", e);
                        }
                    }
                    SessionKind::Anonymous
                }
                Err(e) => {
                    tracing::warn!("Could not verify stored session: {}", e);
                    SessionKind::Authenticated(session)
                }
            },
            None => SessionKind::Anonymous,
        };

        Ok(Self {
            config,
            client,
            identity,
            vault,
        })
    }

    pub fn identity(&self) -> &SessionKind {
        &self.identity
    }

    pub fn require_session(&self) -> Result<&AuthSession> {
        self.identity
            .auth()
            .context("Not signed in. Run `deta login` first.")
    }

    /// Backend client acting as the current user, or anonymously.
    pub fn client(&self) -> SupabaseClient {
        match self.identity.auth() {
            Some(session) => self.client.with_session(session),
            None => self.client.clone(),
        }
    }

    pub async fn login(&mut self, email: &str, password: &str) -> Result<&AuthSession> {
        let session = self
            .client
            .sign_in_with_password(email, password)
            .await
            .context("Sign-in failed")?;
        let vault = self
            .vault
            .as_ref()
            .context("No secret service available to keep the session")?;
        vault.store(&session).await?;
        tracing::info!(user_id = %session.user_id, "Signed in");
        self.identity = SessionKind::Authenticated(session);
        self.require_session()
    }

    pub async fn logout(&mut self) -> Result<()> {
        if let Some(vault) = &self.vault {
            vault.clear().await?;
        }
        self.identity = SessionKind::Anonymous;
        Ok(())
    }

    pub fn local_store(&self, ephemeral: bool) -> Result<Arc<dyn KeyValueStore>> {
        if ephemeral {
            return Ok(Arc::new(MemoryStore::new()));
        }
        Ok(Arc::new(LocalStore::open(&self.config.data_dir)?))
    }

    pub fn chat_session(&self, store: Arc<dyn KeyValueStore>) -> ChatSession {
        let token = match self.identity.auth() {
            Some(session) => session.access_token.clone(),
            None => self.config.supabase_anon_key.clone(),
        };
        let gateway = Arc::new(GatewayProvider::new(self.config.chat_url.clone(), Some(token)));

        let limits = PolicyLimits {
            daily_message_limit: self.config.daily_message_limit,
            ..PolicyLimits::default()
        };
        let catalog = ModelCatalog {
            unavailable: self.config.unavailable_models.clone(),
            ..ModelCatalog::default()
        };
        let policy = PolicyEngine::new(
            store,
            Arc::new(SystemClock),
            limits,
            catalog,
            self.identity.is_authenticated(),
        );

        let persistence = self
            .identity
            .auth()
            .map(|session| PersistenceAdapter::new(Arc::new(self.client()), &session.user_id));

        ChatSession::new(gateway, policy, persistence)
    }

    pub fn discover(&self) -> DiscoverService {
        DiscoverService::new(
            self.client(),
            self.identity.user_id().map(str::to_string),
        )
    }

    /// Send a recording to the transcription function.
    pub async fn transcribe(&self, path: &Path) -> Result<String> {
        let audio = attachments::read_audio_base64(path).await?;
        let response: TranscriptResponse = self
            .client()
            .invoke_function("transcribe", &serde_json::json!({ "audio": audio }))
            .await
            .context("Transcription failed")?;
        Ok(response.text)
    }
}
