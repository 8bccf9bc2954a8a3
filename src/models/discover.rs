use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::profile::Profile;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoverPost {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub author_id: String,
    pub published: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PostWithAuthor {
    pub post: DiscoverPost,
    pub author: Option<Profile>,
}

/// Fields an author supplies when creating or editing a post.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PostDraft {
    pub title: String,
    pub content: String,
    pub image_url: Option<String>,
}

/// In-app notice raised for a newly published, not yet seen post.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPostNotice {
    pub post_id: String,
    pub title: String,
    pub preview: String,
    pub image_url: Option<String>,
}
