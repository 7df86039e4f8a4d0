// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! HTTPS client for the Keap REST API.
//!
//! List endpoints live at `{base}/{plural}?limit=N&offset=M` and wrap the
//! records in an array field named after the entity (`{"contacts": [...]}`).
//! Detail endpoints are `{base}/{plural}/{id}`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::{AccessToken, ApiError, SourceApi};
use crate::entity::EntityType;

/// Longest error body kept in an [`ApiError`] message.
const MAX_ERROR_BODY: usize = 512;

pub struct KeapClient {
    client: Client,
    base_url: String,
}

impl KeapClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self::with_client(client, base_url))
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    fn list_url(&self, entity: EntityType, offset: usize, limit: usize) -> String {
        format!("{}/{}?limit={}&offset={}", self.base_url, entity.plural(), limit, offset)
    }

    fn detail_url(&self, entity: EntityType, source_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, entity.plural(), source_id)
    }

    async fn send(&self, url: &str, token: &AccessToken) -> Result<Response, ApiError> {
        debug!(url, "GET");
        self.client
            .get(url)
            .bearer_auth(token.secret())
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))
    }
}

#[async_trait]
impl SourceApi for KeapClient {
    async fn list(
        &self,
        token: &AccessToken,
        entity: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, ApiError> {
        let response = self.send(&self.list_url(entity, offset, limit), token).await?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        extract_records(entity, body)
    }

    async fn get(
        &self,
        token: &AccessToken,
        entity: EntityType,
        source_id: &str,
    ) -> Result<Option<Value>, ApiError> {
        let response = self.send(&self.detail_url(entity, source_id), token).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        response
            .json()
            .await
            .map(Some)
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Pull the record array out of a list response. Accepts either the
/// wrapped form or a bare array.
pub fn extract_records(entity: EntityType, body: Value) -> Result<Vec<Value>, ApiError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(entity.plural()) {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(ApiError::Decode(format!(
                "expected array in '{}', found {}",
                entity.plural(),
                type_name(&other)
            ))),
        },
        other => Err(ApiError::Decode(format!(
            "expected object or array, found {}",
            type_name(&other)
        ))),
    }
}

async fn status_error(response: Response) -> ApiError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| parse_retry_after(v, Utc::now()));
    let mut message = response.text().await.unwrap_or_default();
    if message.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !message.is_char_boundary(cut) {
            cut -= 1;
        }
        message.truncate(cut);
    }
    ApiError::Status { status, message, retry_after }
}

/// `Retry-After` is either delta-seconds or an HTTP date.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some((at - now).to_std().unwrap_or_default())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
