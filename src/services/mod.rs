pub mod assembler;
pub mod attachments;
pub mod clock;
pub mod discover;
pub mod keyring;
pub mod local_store;
pub mod markdown;
pub mod persistence;
pub mod policy;
pub mod profile;
pub mod remote;
pub mod session;

pub use clock::{Clock, SystemClock};
pub use keyring::SessionVault;
pub use local_store::{KeyValueStore, LocalStore, MemoryStore};
pub use persistence::PersistenceAdapter;
pub use policy::{ModelCatalog, PolicyEngine, PolicyLimits};
pub use remote::SupabaseClient;
pub use session::ChatSession;
