//! Auth client for the Bloom materials tracker
//!
//! Password sign-in against GoTrue (`/auth/v1`), an in-memory session and
//! sign-out. The data layer only needs to know whether a user is present and
//! which access token to forward to the record store.

use log::{debug, info, warn};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// エラー型
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("API error: {0}")]
    ApiError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Missing session")]
    MissingSession,
}

/// ユーザー情報
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub user_metadata: serde_json::Value,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// セッション情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_in: i64,
    pub token_type: String,
    pub user: User,
}

/// Auth クライアント
pub struct Auth {
    url: String,
    key: String,
    http_client: Client,
    current_session: Arc<RwLock<Option<Session>>>,
}

impl Auth {
    /// 新しい Auth クライアントを作成
    ///
    /// The session lives in memory for the life of the client.
    pub fn new(url: &str, key: &str, http_client: Client) -> Self {
        Self {
            url: url.trim_end_matches('/').to_string(),
            key: key.to_string(),
            http_client,
            current_session: Arc::new(RwLock::new(None)),
        }
    }

    /// メール・パスワードでログイン
    pub async fn sign_in_with_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Session, AuthError> {
        let url = format!("{}/auth/v1/token?grant_type=password", self.url);

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await?;

        let session: Session = success(response).await?.json().await?;
        info!("Signed in as {}", session.user.id);
        self.store_session(session.clone());
        Ok(session)
    }

    /// セッションをリフレッシュ
    pub async fn refresh_session(&self) -> Result<Session, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;
        let url = format!("{}/auth/v1/token?grant_type=refresh_token", self.url);

        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({ "refresh_token": session.refresh_token }))
            .send()
            .await?;

        let new_session: Session = success(response).await?.json().await?;
        debug!("Refreshed session for {}", new_session.user.id);
        self.store_session(new_session.clone());
        Ok(new_session)
    }

    /// 保存済みのセッションを復元
    pub fn set_session(&self, session: Session) {
        *self.write_session() = Some(session);
    }

    /// 現在のセッションを取得
    pub fn get_session(&self) -> Option<Session> {
        self.read_session().clone()
    }

    /// Signed-in user from the local session, without a round trip.
    pub fn current_user(&self) -> Option<User> {
        self.read_session().as_ref().map(|session| session.user.clone())
    }

    /// 現在のユーザーを取得
    pub async fn get_user(&self) -> Result<User, AuthError> {
        let session = self.get_session().ok_or(AuthError::MissingSession)?;
        let url = format!("{}/auth/v1/user", self.url);

        let response = self
            .http_client
            .get(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        Ok(success(response).await?.json().await?)
    }

    /// サインアウト
    ///
    /// The local session is cleared before the server call, so a failed
    /// logout request still leaves the client signed out. Without a session
    /// this is a no-op.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let taken = self.write_session().take();
        let Some(session) = taken else {
            debug!("sign_out without a session");
            return Ok(());
        };

        let url = format!("{}/auth/v1/logout", self.url);
        let response = self
            .http_client
            .post(&url)
            .header("apikey", &self.key)
            .header("Authorization", format!("Bearer {}", session.access_token))
            .send()
            .await?;

        if let Err(e) = success(response).await {
            warn!("Logout request failed: {}", e);
            return Err(e);
        }
        info!("Signed out {}", session.user.id);
        Ok(())
    }

    fn store_session(&self, session: Session) {
        *self.write_session() = Some(session);
    }

    // A poisoned lock still holds a valid Option<Session>.
    fn read_session(&self) -> RwLockReadGuard<'_, Option<Session>> {
        self.current_session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_session(&self) -> RwLockWriteGuard<'_, Option<Session>> {
        self.current_session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn success(response: Response) -> Result<Response, AuthError> {
    if response.status().is_success() {
        Ok(response)
    } else {
        let status = response.status();
        let error_text = response.text().await?;
        Err(AuthError::ApiError(format!("{}: {}", status, error_text)))
    }
}
