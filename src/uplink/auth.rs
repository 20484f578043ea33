//! OAuth2 client-credentials session.
//!
//! The bearer token and its version counter are the only mutable state that
//! concurrent dispatch tasks share outside the change-log. The refresh
//! discipline keeps a 401 storm from turning into a refresh storm: every
//! caller captures the token version it used, and on a 401 asks
//! [`AuthSession::refresh_if_stale`] to refresh. Under the single refresh
//! mutex, a caller that finds the version already advanced knows another
//! task beat it there and simply retries with the now-current token.

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token endpoint request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("token endpoint returned status {0}")]
    Rejected(u16),

    #[error("token response did not contain an access_token")]
    MalformedResponse,
}

pub type AuthResult<T> = Result<T, AuthError>;

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct AuthSession {
    http: reqwest::Client,
    oauth_url: String,
    client_id: String,
    client_secret: String,
    token: RwLock<String>,
    version: AtomicU64,
    refresh_gate: Mutex<()>,
}

impl AuthSession {
    pub fn new(
        http: reqwest::Client,
        oauth_url: String,
        client_id: String,
        client_secret: String,
    ) -> Self {
        Self {
            http,
            oauth_url,
            client_id,
            client_secret,
            token: RwLock::new(String::new()),
            version: AtomicU64::new(0),
            refresh_gate: Mutex::new(()),
        }
    }

    /// The current bearer token together with the version it belongs to.
    /// Callers hold on to the version so a later 401 can be attributed to
    /// this exact token generation.
    pub fn current(&self) -> (String, u64) {
        let version = self.version.load(Ordering::SeqCst);
        let token = self.token.read().clone();
        (token, version)
    }

    /// Obtains the first token of the run. Failure here is fatal: nothing
    /// has been dispatched yet and the run cannot proceed without a token.
    pub async fn login(&self) -> AuthResult<()> {
        let token = self.exchange().await?;
        *self.token.write() = token;
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Refreshes the token unless another task already did so for the same
    /// staleness generation. Returns `true` when the caller may retry
    /// immediately (token swapped, or version had already advanced) and
    /// `false` when the refresh attempt itself failed, in which case the old
    /// token stays in place and the caller should back off before retrying.
    pub async fn refresh_if_stale(&self, seen_version: u64) -> bool {
        let _gate = self.refresh_gate.lock().await;
        if self.version.load(Ordering::SeqCst) != seen_version {
            debug!("token already refreshed by another task");
            return true;
        }
        match self.exchange().await {
            Ok(token) => {
                *self.token.write() = token;
                self.version.fetch_add(1, Ordering::SeqCst);
                debug!("fetched new OAuth token after a 401 response");
                true
            }
            Err(e) => {
                warn!("OAuth token refresh failed, keeping previous token: {e}");
                false
            }
        }
    }

    async fn exchange(&self) -> AuthResult<String> {
        let response = self
            .http
            .post(&self.oauth_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(AuthError::Rejected(response.status().as_u16()));
        }
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|_| AuthError::MalformedResponse)?;
        if body.access_token.is_empty() {
            return Err(AuthError::MalformedResponse);
        }
        Ok(body.access_token)
    }
}
