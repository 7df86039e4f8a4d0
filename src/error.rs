// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Top-level error for orchestration calls.

use thiserror::Error;

use crate::config::ConfigError;
use crate::ledger::InvalidTransition;
use crate::resilience::gate::GateError;
use crate::source::{ApiError, FetchError};
use crate::storage::traits::StorageError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("account '{0}' not found")]
    AccountNotFound(String),

    #[error("conflict '{0}' not found")]
    ConflictNotFound(String),

    /// Caller input that can never succeed as given
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("source request failed: {0}")]
    Gate(#[from] GateError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Transition(#[from] InvalidTransition),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SyncError {
    /// Caused by the request rather than by the system.
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_) | Self::Storage(StorageError::Rejected(_)))
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::AccountNotFound(_) | Self::ConflictNotFound(_) | Self::Storage(StorageError::NotFound(_))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(SyncError::InvalidRequest("x".into()).is_client_error());
        assert!(SyncError::from(StorageError::Rejected("resolved".into())).is_client_error());
        assert!(SyncError::AccountNotFound("a".into()).is_not_found());
        assert!(SyncError::from(StorageError::NotFound("c".into())).is_not_found());
        assert!(!SyncError::from(StorageError::Backend("down".into())).is_not_found());
    }

    #[test]
    fn test_messages() {
        let err = SyncError::from(ApiError::MissingCredentials("acme".into()));
        assert!(!err.to_string().is_empty());
        assert_eq!(SyncError::AccountNotFound("acme".into()).to_string(), "account 'acme' not found");
    }
}
