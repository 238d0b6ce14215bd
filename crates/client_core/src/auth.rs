use std::sync::{PoisonError, RwLock};

use shared::domain::SessionUser;

/// Source of the session credential and the signed-in user.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn current_user(&self) -> Option<SessionUser>;
}

#[derive(Debug, Clone)]
struct Session {
    user: SessionUser,
    token: String,
}

/// In-memory session filled in by a successful login.
#[derive(Debug, Default)]
pub struct SessionAuth {
    session: RwLock<Option<Session>>,
}

impl SessionAuth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(user: SessionUser, token: impl Into<String>) -> Self {
        let auth = Self::new();
        auth.set_session(user, token);
        auth
    }

    pub fn set_session(&self, user: SessionUser, token: impl Into<String>) {
        let mut guard = self.session.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(Session {
            user,
            token: token.into(),
        });
    }

    pub fn clear(&self) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl AuthProvider for SessionAuth {
    fn token(&self) -> Option<String> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.token.clone())
    }

    fn current_user(&self) -> Option<SessionUser> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|session| session.user.clone())
    }
}
