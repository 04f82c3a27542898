//! The authentication collaborator consumed by the vault.
//!
//! The vault never signs anyone in. It only asks who the current principal is
//! and listens for that answer to change.

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub access_token: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }
}

pub trait AuthProvider: Send + Sync {
    fn current_principal(&self) -> Option<Principal>;

    /// Yields a new value on every sign-in, sign-out or user switch.
    fn subscribe(&self) -> watch::Receiver<Option<Principal>>;
}

/// Watch-channel backed provider for hosts that manage sign-in themselves.
#[derive(Debug)]
pub struct AuthSession {
    tx: watch::Sender<Option<Principal>>,
}

impl AuthSession {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    pub fn signed_in(principal: Principal) -> Self {
        let session = Self::new();
        session.sign_in(principal);
        session
    }

    /// Builds a principal from `COFFER_USER_ID` / `COFFER_ACCESS_TOKEN`.
    pub fn from_env() -> Self {
        let session = Self::new();
        if let Ok(user_id) = std::env::var("COFFER_USER_ID") {
            if !user_id.is_empty() {
                let mut principal = Principal::new(user_id);
                principal.access_token = std::env::var("COFFER_ACCESS_TOKEN")
                    .ok()
                    .filter(|t| !t.is_empty());
                session.sign_in(principal);
            }
        }
        session
    }

    pub fn sign_in(&self, principal: Principal) {
        self.tx.send_replace(Some(principal));
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}

impl Default for AuthSession {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthProvider for AuthSession {
    fn current_principal(&self) -> Option<Principal> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Principal>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_sign_out() {
        let auth = AuthSession::signed_in(Principal::new("u-1").with_token("t"));
        let mut rx = auth.subscribe();
        assert_eq!(auth.current_principal().unwrap().user_id, "u-1");
        auth.sign_out();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_none());
        assert!(auth.current_principal().is_none());
    }
}
