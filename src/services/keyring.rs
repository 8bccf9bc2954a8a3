use std::sync::Arc;

use anyhow::{Context, Result};
use oo7::Keyring;

use crate::config::APP_ID;
use crate::models::AuthSession;

const KEYRING_ATTR_APP: &str = "application";
const KEYRING_ATTR_KIND: &str = "kind";
const SESSION_KIND: &str = "auth-session";

/// Keeps the signed-in session in the desktop secret service.
#[derive(Debug, Clone)]
pub struct SessionVault {
    keyring: Arc<Keyring>,
}

impl SessionVault {
    pub async fn new() -> Result<Self> {
        let keyring = Keyring::new()
            .await
            .context("Failed to initialize keyring")?;
        Ok(Self {
            keyring: Arc::new(keyring),
        })
    }

    pub async fn store(&self, session: &AuthSession) -> Result<()> {
        let secret = serde_json::to_string(session)?;
        self.keyring
            .create_item(
                &format!("Deta session - {}", session.email.as_deref().unwrap_or(&session.user_id)),
                &Self::attributes(),
                secret.as_str(),
                true,
            )
            .await
            .context("Failed to store session in keyring")?;
        Ok(())
    }

    pub async fn load(&self) -> Result<Option<AuthSession>> {
        let items = self
            .keyring
            .search_items(&Self::attributes())
            .await
            .context("Failed to search keyring")?;

        let Some(item) = items.first() else {
            return Ok(None);
        };
        let secret = item.secret().await.context("Failed to read secret")?;
        match serde_json::from_slice::<AuthSession>(&secret.to_vec()) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                tracing::warn!("Ignoring unreadable stored session: {}", e);
                Ok(None)
            }
        }
    }

    pub async fn clear(&self) -> Result<()> {
        self.keyring
            .delete(&Self::attributes())
            .await
            .context("Failed to delete session from keyring")?;
        Ok(())
    }

    fn attributes() -> Vec<(&'static str, &'static str)> {
        vec![(KEYRING_ATTR_APP, APP_ID), (KEYRING_ATTR_KIND, SESSION_KIND)]
    }
}
