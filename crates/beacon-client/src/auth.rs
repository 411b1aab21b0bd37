//! Authentication state.
//!
//! The host application logs in and out through [`AuthState`]; everything
//! that needs the credential reads it through [`CredentialProvider`] at the
//! moment it is used, so a refreshed token takes effect on the next request
//! or reconnect.

use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

/// Source of the current credential.
pub trait CredentialProvider: Send + Sync {
    /// The credential to use right now, if logged in.
    fn credential(&self) -> Option<String>;
}

/// Login state shared between the host application and the client.
#[derive(Clone)]
pub struct AuthState {
    token: Arc<watch::Sender<Option<String>>>,
}

impl AuthState {
    /// Create a logged-out state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { token: Arc::new(tx) }
    }

    /// Log in, or replace the credential of an existing login.
    pub fn login(&self, token: impl Into<String>) {
        let was_authenticated = self.is_authenticated();
        self.token.send_replace(Some(token.into()));
        if was_authenticated {
            info!("Credential refreshed");
        } else {
            info!("Logged in");
        }
    }

    /// Log out.
    pub fn logout(&self) {
        if self.token.send_replace(None).is_some() {
            info!("Logged out");
        }
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Watch login and logout.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}

impl Default for AuthState {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("authenticated", &self.is_authenticated())
            .finish()
    }
}

impl CredentialProvider for AuthState {
    fn credential(&self) -> Option<String> {
        self.token.borrow().clone()
    }
}
