pub mod conversation;
pub mod discover;
pub mod identity;
pub mod image;
pub mod message;
pub mod profile;

pub use conversation::Conversation;
pub use discover::{DiscoverPost, NewPostNotice, PostDraft, PostWithAuthor};
pub use identity::{AuthSession, SessionKind};
pub use image::GeneratedImage;
pub use message::{Citation, Message, MessageRecord, Role};
pub use profile::{Profile, ProfileUpdate, UsageStats};
