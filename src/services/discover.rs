//! Discover feed: editorial posts, their authors, admin management and the
//! new-post notices shown to signed-in users.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::models::{DiscoverPost, NewPostNotice, PostDraft, PostWithAuthor, Profile};
use crate::services::local_store::{load_json, save_json, KeyValueStore};
use crate::services::markdown;
use crate::services::remote::{eq, in_list, RemoteError, SupabaseClient};

const POSTS: &str = "discover_posts";
const SEEN_KEY: &str = "seen_posts";
const PREVIEW_CHARS: usize = 150;
const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Error)]
pub enum DiscoverError {
    #[error("Please sign in first")]
    NotSignedIn,

    #[error("Only admins can manage posts")]
    NotAdmin,

    #[error("Post not found")]
    NotFound,

    #[error("Title and content are required")]
    EmptyDraft,

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

#[derive(Serialize)]
struct NewPost<'a> {
    title: &'a str,
    content: &'a str,
    image_url: Option<&'a str>,
    author_id: &'a str,
    published: bool,
}

pub struct DiscoverService {
    client: SupabaseClient,
    viewer: Option<String>,
}

impl DiscoverService {
    /// `viewer` is the signed-in user id; `client` should carry that
    /// user's session when present.
    pub fn new(client: SupabaseClient, viewer: Option<String>) -> Self {
        Self { client, viewer }
    }

    pub async fn is_admin(&self) -> Result<bool, DiscoverError> {
        match &self.viewer {
            Some(user_id) => Ok(self.client.has_role(user_id, ADMIN_ROLE).await?),
            None => Ok(false),
        }
    }

    /// Newest first: every published post plus the viewer's own drafts.
    pub async fn feed(&self) -> Result<Vec<PostWithAuthor>, DiscoverError> {
        let visibility = match &self.viewer {
            Some(user_id) => ("or", format!("(published.eq.true,author_id.eq.{user_id})")),
            None => ("published", eq(true)),
        };
        let posts: Vec<DiscoverPost> = self
            .client
            .select(
                POSTS,
                &[
                    ("select", "*".to_string()),
                    visibility,
                    ("order", "created_at.desc".to_string()),
                ],
            )
            .await?;
        self.with_authors(posts).await
    }

    pub async fn post(&self, id: &str) -> Result<PostWithAuthor, DiscoverError> {
        let posts: Vec<DiscoverPost> = self
            .client
            .select(POSTS, &[("select", "*".to_string()), ("id", eq(id))])
            .await?;
        let post = posts.into_iter().next().ok_or(DiscoverError::NotFound)?;
        let mut joined = self.with_authors(vec![post]).await?;
        joined.pop().ok_or(DiscoverError::NotFound)
    }

    pub async fn posts_by_author(&self, author_id: &str) -> Result<Vec<DiscoverPost>, DiscoverError> {
        Ok(self
            .client
            .select(
                POSTS,
                &[
                    ("select", "*".to_string()),
                    ("author_id", eq(author_id)),
                    ("published", eq(true)),
                    ("order", "created_at.desc".to_string()),
                ],
            )
            .await?)
    }

    async fn with_authors(
        &self,
        posts: Vec<DiscoverPost>,
    ) -> Result<Vec<PostWithAuthor>, DiscoverError> {
        let author_ids: Vec<String> = posts
            .iter()
            .map(|p| p.author_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut authors: HashMap<String, Profile> = HashMap::new();
        if !author_ids.is_empty() {
            let profiles: Vec<Profile> = self
                .client
                .select(
                    "profiles",
                    &[
                        ("select", "id,full_name,avatar_url,handle,verified,bio".to_string()),
                        ("id", in_list(&author_ids)),
                    ],
                )
                .await?;
            authors = profiles.into_iter().map(|p| (p.id.clone(), p)).collect();
        }

        Ok(posts
            .into_iter()
            .map(|post| {
                let author = authors.get(&post.author_id).cloned();
                PostWithAuthor { post, author }
            })
            .collect())
    }

    async fn require_admin(&self) -> Result<&str, DiscoverError> {
        let user_id = self.viewer.as_deref().ok_or(DiscoverError::NotSignedIn)?;
        if !self.client.has_role(user_id, ADMIN_ROLE).await? {
            return Err(DiscoverError::NotAdmin);
        }
        Ok(user_id)
    }

    pub async fn create_post(&self, draft: &PostDraft) -> Result<DiscoverPost, DiscoverError> {
        validate(draft)?;
        let author_id = self.require_admin().await?;
        let rows: Vec<DiscoverPost> = self
            .client
            .insert(
                POSTS,
                &NewPost {
                    title: draft.title.trim(),
                    content: draft.content.trim(),
                    image_url: draft.image_url.as_deref().filter(|u| !u.is_empty()),
                    author_id,
                    published: true,
                },
            )
            .await?;
        let post = rows.into_iter().next().ok_or(DiscoverError::NotFound)?;
        tracing::info!(post_id = %post.id, "Post created");
        Ok(post)
    }

    pub async fn update_post(&self, id: &str, draft: &PostDraft) -> Result<(), DiscoverError> {
        validate(draft)?;
        self.require_admin().await?;
        self.client
            .update(
                POSTS,
                &[("id", eq(id))],
                &serde_json::json!({
                    "title": draft.title.trim(),
                    "content": draft.content.trim(),
                    "image_url": draft.image_url.as_deref().filter(|u| !u.is_empty()),
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_post(&self, id: &str) -> Result<(), DiscoverError> {
        self.require_admin().await?;
        self.client.delete(POSTS, &[("id", eq(id))]).await?;
        tracing::info!(post_id = %id, "Post deleted");
        Ok(())
    }

    /// Flip a post between public and private; returns the new state.
    pub async fn toggle_published(&self, id: &str) -> Result<bool, DiscoverError> {
        self.require_admin().await?;
        let current = self.post(id).await?.post.published;
        self.client
            .update(
                POSTS,
                &[("id", eq(id))],
                &serde_json::json!({ "published": !current }),
            )
            .await?;
        Ok(!current)
    }

    /// Published posts created after `since`, oldest first.
    pub async fn published_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<DiscoverPost>, DiscoverError> {
        Ok(self
            .client
            .select(
                POSTS,
                &[
                    ("select", "*".to_string()),
                    ("published", eq(true)),
                    (
                        "created_at",
                        format!("gt.{}", since.to_rfc3339_opts(SecondsFormat::Micros, true)),
                    ),
                    ("order", "created_at.asc".to_string()),
                ],
            )
            .await?)
    }
}

fn validate(draft: &PostDraft) -> Result<(), DiscoverError> {
    if draft.title.trim().is_empty() || draft.content.trim().is_empty() {
        return Err(DiscoverError::EmptyDraft);
    }
    Ok(())
}

/// Post ids the user has already been told about, kept in local storage.
#[derive(Clone)]
pub struct SeenPosts {
    store: Arc<dyn KeyValueStore>,
}

impl SeenPosts {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    async fn load(&self) -> Vec<String> {
        match load_json(self.store.as_ref(), SEEN_KEY).await {
            Ok(seen) => seen.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Failed to read seen posts: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn contains(&self, post_id: &str) -> bool {
        self.load().await.iter().any(|id| id == post_id)
    }

    pub async fn mark(&self, post_id: &str) {
        let mut seen = self.load().await;
        if seen.iter().any(|id| id == post_id) {
            return;
        }
        seen.push(post_id.to_string());
        if let Err(e) = save_json(self.store.as_ref(), SEEN_KEY, &seen).await {
            tracing::warn!("Failed to save seen posts: {}", e);
        }
    }
}

pub fn notice_for(post: &DiscoverPost) -> NewPostNotice {
    NewPostNotice {
        post_id: post.id.clone(),
        title: post.title.clone(),
        preview: markdown::preview(&post.content, PREVIEW_CHARS),
        image_url: post.image_url.clone(),
    }
}

/// Polls for posts published after the watcher was started and turns the
/// unseen ones into notices.
pub struct PostWatcher {
    service: DiscoverService,
    seen: SeenPosts,
    cursor: DateTime<Utc>,
}

impl PostWatcher {
    pub fn new(service: DiscoverService, seen: SeenPosts, since: DateTime<Utc>) -> Self {
        Self {
            service,
            seen,
            cursor: since,
        }
    }

    pub async fn poll(&mut self) -> Result<Vec<NewPostNotice>, DiscoverError> {
        let posts = self.service.published_since(self.cursor).await?;
        let mut notices = Vec::new();
        for post in posts {
            if post.created_at > self.cursor {
                self.cursor = post.created_at;
            }
            if !self.seen.contains(&post.id).await {
                notices.push(notice_for(&post));
            }
        }
        Ok(notices)
    }

    /// Dismissing or opening a notice both count as seeing the post.
    pub async fn acknowledge(&self, notice: &NewPostNotice) {
        self.seen.mark(&notice.post_id).await;
    }
}
