// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bearer credentials for source API calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client;
use serde::Deserialize;
use tracing::info;

use super::{AccessToken, ApiError};
use crate::account::{Credentials, SyncAccount};

/// A usable token plus, when a refresh happened, the credentials that must
/// be persisted back onto the account.
#[derive(Debug)]
pub struct ResolvedToken {
    pub token: AccessToken,
    pub refreshed: Option<Credentials>,
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn resolve(&self, account: &SyncAccount) -> Result<ResolvedToken, ApiError>;
}

/// Uses the stored access token as-is.
#[derive(Debug, Default, Clone, Copy)]
pub struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn resolve(&self, account: &SyncAccount) -> Result<ResolvedToken, ApiError> {
        stored_token(account).map(|token| ResolvedToken { token, refreshed: None })
    }
}

fn stored_token(account: &SyncAccount) -> Result<AccessToken, ApiError> {
    if account.credentials.access_token.is_empty() {
        return Err(ApiError::MissingCredentials(account.id.clone()));
    }
    Ok(AccessToken::new(account.credentials.access_token.clone()))
}

/// OAuth2 `refresh_token` grant against the provider's token endpoint.
pub struct OAuthRefresher {
    client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

impl OAuthRefresher {
    pub fn new(
        client: Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }

    async fn refresh(&self, account: &SyncAccount, refresh_token: &str) -> Result<Credentials, ApiError> {
        let response = self
            .client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "refresh_token"), ("refresh_token", refresh_token)])
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status: status.as_u16(), message, retry_after: None });
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;

        info!(account = %account.id, "Refreshed source API token");
        Ok(apply_token_response(&account.credentials, body, Utc::now()))
    }
}

fn apply_token_response(previous: &Credentials, body: TokenResponse, now: DateTime<Utc>) -> Credentials {
    Credentials {
        access_token: body.access_token,
        // providers may omit the refresh token when it is unchanged
        refresh_token: body.refresh_token.or_else(|| previous.refresh_token.clone()),
        expires_at: body.expires_in.map(|secs| now + Duration::seconds(secs)),
    }
}

#[async_trait]
impl CredentialProvider for OAuthRefresher {
    async fn resolve(&self, account: &SyncAccount) -> Result<ResolvedToken, ApiError> {
        if !account.credentials.needs_refresh(Utc::now()) {
            return stored_token(account).map(|token| ResolvedToken { token, refreshed: None });
        }
        let Some(refresh_token) = account.credentials.refresh_token.as_deref() else {
            return Err(ApiError::MissingCredentials(account.id.clone()));
        };

        let credentials = self.refresh(account, refresh_token).await?;
        Ok(ResolvedToken {
            token: AccessToken::new(credentials.access_token.clone()),
            refreshed: Some(credentials),
        })
    }
}
