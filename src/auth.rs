//! Who is signed in, and whether data may be touched at all

use crate::error::Result;
use crate::store::RemoteStore;
use async_trait::async_trait;
use bloom_auth::{Auth, User};
use std::sync::{Arc, RwLock};
use tracing::info;

/// The signed-in user, as the data layer sees it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

impl From<User> for AuthUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
        }
    }
}

/// Identity capability. "No user" means no data access, not an error.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    fn current_user(&self) -> Option<AuthUser>;

    async fn sign_out(&self) -> Result<()>;
}

/// Password sign-in against the hosted auth service.
///
/// The session token is handed to the [`RemoteStore`] so reads, writes and
/// realtime joins run as the user.
pub struct SupabaseAuth {
    auth: Auth,
    store: Arc<RemoteStore>,
}

impl SupabaseAuth {
    pub fn new(base_url: &str, anon_key: &str, http_client: reqwest::Client, store: Arc<RemoteStore>) -> Self {
        Self {
            auth: Auth::new(base_url, anon_key, http_client),
            store,
        }
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser> {
        let session = self.auth.sign_in_with_password(email, password).await?;
        self.store
            .set_access_token(Some(session.access_token.clone()))
            .await;
        info!(user_id = %session.user.id, "signed in");
        Ok(session.user.into())
    }

    /// Refreshes the session and forwards the new token.
    pub async fn refresh(&self) -> Result<AuthUser> {
        let session = self.auth.refresh_session().await?;
        self.store
            .set_access_token(Some(session.access_token.clone()))
            .await;
        Ok(session.user.into())
    }
}

#[async_trait]
impl AuthProvider for SupabaseAuth {
    fn current_user(&self) -> Option<AuthUser> {
        self.auth.current_user().map(AuthUser::from)
    }

    /// Drops the store's token even when the logout request fails.
    async fn sign_out(&self) -> Result<()> {
        let result = self.auth.sign_out().await;
        self.store.set_access_token(None).await;
        info!("signed out");
        Ok(result?)
    }
}

/// A fixed identity, for embedding and tests
#[derive(Debug, Default)]
pub struct StaticAuth {
    user: RwLock<Option<AuthUser>>,
}

impl StaticAuth {
    pub fn signed_in(user: AuthUser) -> Self {
        Self {
            user: RwLock::new(Some(user)),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AuthProvider for StaticAuth {
    fn current_user(&self) -> Option<AuthUser> {
        self.user
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn sign_out(&self) -> Result<()> {
        *self
            .user
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
        Ok(())
    }
}
