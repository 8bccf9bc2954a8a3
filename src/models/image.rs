use serde::{Deserialize, Serialize};

/// Entry of a user's generated-image library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub user_id: String,
    pub prompt: String,
    pub image_url: String,
}
