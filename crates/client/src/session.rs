//! Authentication session shared by the coordinator and the HTTP transport.

use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Stored session data
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthSession {
    pub user_id: String,
    /// Bearer token for mutation requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// The current user's session, if any. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct Session {
    inner: Arc<RwLock<Option<AuthSession>>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn authenticated(user_id: impl Into<String>, token: Option<String>) -> Self {
        let session = Self::new();
        session.login(user_id, token);
        session
    }

    pub fn login(&self, user_id: impl Into<String>, token: Option<String>) {
        let user_id = user_id.into();
        crate::log_info!("session started for {}", user_id);
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(AuthSession { user_id, token });
    }

    /// Logout and clear session
    pub fn logout(&self) {
        self.inner.write().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Check if user is authenticated
    pub fn is_authenticated(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Get the current user ID
    pub fn identity(&self) -> Option<String> {
        self.current().map(|s| s.user_id)
    }

    pub fn token(&self) -> Option<String> {
        self.current().and_then(|s| s.token)
    }

    pub fn current(&self) -> Option<AuthSession> {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.identity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_and_logout() {
        let session = Session::new();
        assert!(!session.is_authenticated());
        assert_eq!(session.identity(), None);

        let shared = session.clone();
        session.login("alice", Some("tok".into()));
        assert!(shared.is_authenticated());
        assert_eq!(shared.identity().as_deref(), Some("alice"));
        assert_eq!(shared.token().as_deref(), Some("tok"));

        shared.logout();
        assert!(!session.is_authenticated());
    }

    #[test]
    fn stored_session_round_trips_without_token() {
        let json = serde_json::to_string(&AuthSession {
            user_id: "bob".into(),
            token: None,
        })
        .unwrap();
        assert_eq!(json, r#"{"user_id":"bob"}"#);
    }
}
