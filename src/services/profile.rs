use std::path::Path;

use chrono::Utc;
use thiserror::Error;

use crate::models::{AuthSession, Profile, ProfileUpdate, UsageStats};
use crate::services::attachments::{self, MAX_AVATAR_BYTES};
use crate::services::remote::{eq, in_list, RemoteError, SupabaseClient, NO_ROWS, UNIQUE_VIOLATION};

const NAME_MAX: usize = 100;
const HANDLE_MAX: usize = 30;
const BIO_MAX: usize = 500;

#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("Name cannot be empty")]
    EmptyName,

    #[error("Name must be less than 100 characters")]
    NameTooLong,

    #[error("Handle must be less than 30 characters")]
    HandleTooLong,

    #[error("Handle can only contain letters, numbers, and underscores")]
    InvalidHandle,

    #[error("Bio must be less than 500 characters")]
    BioTooLong,

    #[error("This handle is already taken")]
    HandleTaken,

    #[error("{0}")]
    Avatar(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

/// Fields ready to be written: trimmed, with empty optional values as null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidProfile {
    pub full_name: String,
    pub handle: Option<String>,
    pub bio: Option<String>,
}

pub fn validate(update: &ProfileUpdate) -> Result<ValidProfile, ProfileError> {
    let full_name = update.full_name.trim();
    if full_name.is_empty() {
        return Err(ProfileError::EmptyName);
    }
    if full_name.chars().count() > NAME_MAX {
        return Err(ProfileError::NameTooLong);
    }

    let handle = update.handle.trim();
    if handle.chars().count() > HANDLE_MAX {
        return Err(ProfileError::HandleTooLong);
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ProfileError::InvalidHandle);
    }

    let bio = update.bio.trim();
    if bio.chars().count() > BIO_MAX {
        return Err(ProfileError::BioTooLong);
    }

    let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());
    Ok(ValidProfile {
        full_name: full_name.to_string(),
        handle: non_empty(handle),
        bio: non_empty(bio),
    })
}

pub struct ProfileService {
    client: SupabaseClient,
    session: AuthSession,
}

impl ProfileService {
    pub fn new(client: &SupabaseClient, session: AuthSession) -> Self {
        Self {
            client: client.with_session(&session),
            session,
        }
    }

    /// Load the signed-in user's profile, creating the row on first visit.
    pub async fn load_or_create(&self) -> Result<Profile, ProfileError> {
        let existing = self
            .client
            .select_single::<Profile>(
                "profiles",
                &[("select", "*".to_string()), ("id", eq(&self.session.user_id))],
            )
            .await;

        match existing {
            Ok(profile) => Ok(profile),
            Err(e) if e.code() == Some(NO_ROWS) => {
                let full_name = self.session.email.clone();
                self.client
                    .insert_minimal(
                        "profiles",
                        &serde_json::json!({
                            "id": self.session.user_id,
                            "email": self.session.email,
                            "full_name": full_name,
                        }),
                    )
                    .await?;
                tracing::info!(user_id = %self.session.user_id, "Profile created");
                Ok(Profile {
                    id: self.session.user_id.clone(),
                    full_name,
                    handle: None,
                    bio: None,
                    avatar_url: None,
                    verified: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn update(&self, update: &ProfileUpdate) -> Result<ValidProfile, ProfileError> {
        let valid = validate(update)?;
        let result = self
            .client
            .update(
                "profiles",
                &[("id", eq(&self.session.user_id))],
                &serde_json::json!({
                    "full_name": valid.full_name,
                    "handle": valid.handle,
                    "bio": valid.bio,
                    "updated_at": Utc::now(),
                }),
            )
            .await;
        match result {
            Ok(()) => Ok(valid),
            Err(e) if e.code() == Some(UNIQUE_VIOLATION) => Err(ProfileError::HandleTaken),
            Err(e) => Err(e.into()),
        }
    }

    /// Store an image file as the avatar, inline as a data URI.
    pub async fn set_avatar(&self, path: &Path) -> Result<String, ProfileError> {
        let data_uri = attachments::read_image(path, Some(MAX_AVATAR_BYTES))
            .await
            .map_err(|e| ProfileError::Avatar(e.to_string()))?;
        self.client
            .update(
                "profiles",
                &[("id", eq(&self.session.user_id))],
                &serde_json::json!({ "avatar_url": data_uri, "updated_at": Utc::now() }),
            )
            .await?;
        Ok(data_uri)
    }

    pub async fn usage_stats(&self) -> Result<UsageStats, ProfileError> {
        let user_id = eq(&self.session.user_id);
        let conversations: Vec<serde_json::Value> = self
            .client
            .select(
                "conversations",
                &[("select", "id".to_string()), ("user_id", user_id.clone())],
            )
            .await?;
        let ids: Vec<String> = conversations
            .iter()
            .filter_map(|c| c.get("id").and_then(|v| v.as_str()).map(str::to_string))
            .collect();

        let messages = if ids.is_empty() {
            0
        } else {
            self.client
                .count("messages", &[("conversation_id", in_list(&ids))])
                .await?
        };
        let images = self
            .client
            .count("generated_images", &[("user_id", user_id)])
            .await?;

        Ok(UsageStats {
            conversations: ids.len(),
            messages,
            images,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn update(name: &str, handle: &str, bio: &str) -> ProfileUpdate {
        ProfileUpdate {
            full_name: name.to_string(),
            handle: handle.to_string(),
            bio: bio.to_string(),
        }
    }

    fn session() -> AuthSession {
        AuthSession {
            user_id: "u1".to_string(),
            email: Some("dana@example.com".to_string()),
            access_token: "t".to_string(),
        }
    }

    #[test]
    fn test_validation_rules() {
        assert!(matches!(validate(&update("  ", "", "")), Err(ProfileError::EmptyName)));
        assert!(matches!(
            validate(&update(&"n".repeat(101), "", "")),
            Err(ProfileError::NameTooLong)
        ));
        assert!(matches!(
            validate(&update("Dana", "bad handle", "")),
            Err(ProfileError::InvalidHandle)
        ));
        assert!(matches!(
            validate(&update("Dana", &"h".repeat(31), "")),
            Err(ProfileError::HandleTooLong)
        ));
        assert!(matches!(
            validate(&update("Dana", "", &"b".repeat(501))),
            Err(ProfileError::BioTooLong)
        ));

        let valid = validate(&update(" Dana ", "dana_01", "")).unwrap();
        assert_eq!(valid.full_name, "Dana");
        assert_eq!(valid.handle.as_deref(), Some("dana_01"));
        assert_eq!(valid.bio, None);
    }

    #[tokio::test]
    async fn test_missing_profile_is_created() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(406).set_body_json(serde_json::json!({
                "code": "PGRST116",
                "message": "JSON object requested, multiple (or no) rows returned"
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/rest/v1/profiles"))
            .and(body_partial_json(serde_json::json!({"id": "u1", "email": "dana@example.com"})))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let profile = ProfileService::new(&client, session())
            .load_or_create()
            .await
            .unwrap();
        assert_eq!(profile.display_name(), "dana@example.com");
    }

    #[tokio::test]
    async fn test_duplicate_handle_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(409).set_body_json(serde_json::json!({
                "code": "23505",
                "message": "duplicate key"
            })))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let result = ProfileService::new(&client, session())
            .update(&update("Dana", "taken", ""))
            .await;
        assert!(matches!(result, Err(ProfileError::HandleTaken)));
    }

    #[tokio::test]
    async fn test_usage_stats_without_conversations() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/conversations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/rest/v1/generated_images"))
            .respond_with(ResponseTemplate::new(200).insert_header("content-range", "*/3"))
            .mount(&server)
            .await;

        let client = SupabaseClient::new(server.uri(), "anon");
        let stats = ProfileService::new(&client, session())
            .usage_stats()
            .await
            .unwrap();
        assert_eq!(
            stats,
            UsageStats {
                conversations: 0,
                messages: 0,
                images: 3
            }
        );
    }
}
