use serde::{Deserialize, Serialize};

/// Credentials of a signed-in user, as returned by the identity backend.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub user_id: String,
    pub email: Option<String>,
    pub access_token: String,
}

impl std::fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSession")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("access_token", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Anonymous,
    Authenticated(AuthSession),
}

impl SessionKind {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionKind::Authenticated(_))
    }

    pub fn auth(&self) -> Option<&AuthSession> {
        match self {
            SessionKind::Authenticated(session) => Some(session),
            SessionKind::Anonymous => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.auth().map(|s| s.user_id.as_str())
    }
}
