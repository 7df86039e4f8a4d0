// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Source CRM access.
//!
//! - [`SourceApi`]: the raw list/detail calls, one endpoint per entity type
//! - [`http::KeapClient`]: the HTTPS implementation
//! - [`fetch::PageFetcher`]: gated, offset-paginated reads built on top
//! - [`oauth`]: bearer credentials and refresh

pub mod fetch;
pub mod http;
pub mod oauth;

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::entity::EntityType;
use crate::resilience::retry::Transient;

pub use fetch::{FetchError, Page, PageFetcher, Pagination};
pub use http::KeapClient;
pub use oauth::{CredentialProvider, OAuthRefresher, ResolvedToken, StaticCredentials};

/// Failure of a single call to the source API.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Connection reset, timeout, DNS failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status
    #[error("source returned {status}: {message}")]
    Status {
        status: u16,
        message: String,
        retry_after: Option<Duration>,
    },

    /// Body did not have the expected shape
    #[error("invalid response: {0}")]
    Decode(String),

    #[error("no credentials available for account '{0}'")]
    MissingCredentials(String),
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_rate_limited(&self) -> bool {
        self.status() == Some(429)
    }

    /// Shorthand for [`Transient::is_transient`].
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Transient for ApiError {
    /// Transport failures, 5xx and 429 are worth another attempt; every
    /// other 4xx and local failures are not.
    fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Decode(_) | Self::MissingCredentials(_) => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { status: 429, retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

/// Bearer credential for one account. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    #[must_use]
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([REDACTED])")
    }
}

/// Raw calls against the source CRM.
///
/// Implementations perform exactly one HTTP exchange per call; throttling
/// and retries belong to the request gate.
#[async_trait]
pub trait SourceApi: Send + Sync {
    /// One page of `entity` records starting at `offset`.
    async fn list(
        &self,
        token: &AccessToken,
        entity: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, ApiError>;

    /// A single record by id. `Ok(None)` on 404.
    async fn get(
        &self,
        token: &AccessToken,
        entity: EntityType,
        source_id: &str,
    ) -> Result<Option<Value>, ApiError>;
}
