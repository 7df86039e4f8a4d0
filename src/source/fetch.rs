// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Offset-paginated reads through the request gate.
//!
//! The source gives no explicit "more data" flag, so a page that comes back
//! full is taken as a hint that another page exists. The loop stops on the
//! first short or empty page, and any page failure (after the gate's own
//! retries) ends the pagination with an error instead of a silent
//! truncation.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

use super::{AccessToken, SourceApi};
use crate::entity::EntityType;
use crate::record::SourceRecord;
use crate::resilience::gate::{GateError, RequestGate};

/// One list call's worth of records.
#[derive(Debug, Clone)]
pub struct Page {
    pub entity: EntityType,
    pub offset: usize,
    /// Page size asked for
    pub requested: usize,
    /// Records with a usable id
    pub records: Vec<SourceRecord>,
    /// Objects returned by the API, including any skipped for lacking an id
    pub raw_len: usize,
}

impl Page {
    /// Continuation heuristic: a full page implies there may be another.
    #[must_use]
    pub fn has_more(&self) -> bool {
        self.raw_len > 0 && self.raw_len >= self.requested
    }

    #[must_use]
    pub fn next_offset(&self) -> usize {
        self.offset + self.raw_len
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.raw_len - self.records.len()
    }
}

#[derive(Debug, Error)]
#[error("failed to fetch {entity} page at offset {offset}: {source}")]
pub struct FetchError {
    pub entity: EntityType,
    pub offset: usize,
    #[source]
    pub source: GateError,
}

#[derive(Clone)]
pub struct PageFetcher {
    gate: Arc<RequestGate>,
    api: Arc<dyn SourceApi>,
}

impl PageFetcher {
    pub fn new(gate: Arc<RequestGate>, api: Arc<dyn SourceApi>) -> Self {
        Self { gate, api }
    }

    #[must_use]
    pub fn gate(&self) -> &Arc<RequestGate> {
        &self.gate
    }

    /// Fetch one page of `entity` starting at `offset`.
    pub async fn fetch_page(
        &self,
        token: &AccessToken,
        entity: EntityType,
        offset: usize,
        page_size: usize,
    ) -> Result<Page, FetchError> {
        let label = format!("list_{}", entity.plural());
        let api = self.api.as_ref();
        let result = self
            .gate
            .execute(&label, move || api.list(token, entity, offset, page_size))
            .await;
        crate::metrics::record_source_request(entity.as_str(), if result.is_ok() { "ok" } else { "error" });

        let raw = result.map_err(|source| FetchError { entity, offset, source })?;
        let raw_len = raw.len();
        let records: Vec<SourceRecord> = raw
            .into_iter()
            .filter_map(|value| SourceRecord::from_value(entity, value))
            .collect();
        if records.len() < raw_len {
            warn!(
                entity = %entity,
                offset,
                skipped = raw_len - records.len(),
                "Skipping source objects without an id"
            );
        }
        debug!(entity = %entity, offset, count = raw_len, "Fetched page");

        Ok(Page { entity, offset, requested: page_size, records, raw_len })
    }

    /// Fetch one record from its detail endpoint. `Ok(None)` when the
    /// source no longer has it.
    pub async fn fetch_one(
        &self,
        token: &AccessToken,
        entity: EntityType,
        source_id: &str,
    ) -> Result<Option<SourceRecord>, GateError> {
        let label = format!("get_{}", entity.as_str());
        let api = self.api.as_ref();
        let result = self
            .gate
            .execute(&label, move || api.get(token, entity, source_id))
            .await;
        crate::metrics::record_source_request(entity.as_str(), if result.is_ok() { "ok" } else { "error" });

        Ok(result?.and_then(|value| SourceRecord::from_value(entity, value)))
    }

    /// Walk every page of `entity` from offset zero.
    pub fn paginate(&self, token: AccessToken, entity: EntityType, page_size: usize) -> Pagination<'_> {
        self.paginate_from(token, entity, 0, page_size)
    }

    /// Walk the pages of `entity` starting at `offset`, e.g. a saved cursor
    /// from an interrupted run.
    pub fn paginate_from(
        &self,
        token: AccessToken,
        entity: EntityType,
        offset: usize,
        page_size: usize,
    ) -> Pagination<'_> {
        Pagination {
            fetcher: self,
            token,
            entity,
            page_size: page_size.max(1),
            offset,
            done: false,
        }
    }
}

/// Sequential page cursor. Pages come back in strictly increasing offset
/// order.
pub struct Pagination<'a> {
    fetcher: &'a PageFetcher,
    token: AccessToken,
    entity: EntityType,
    page_size: usize,
    offset: usize,
    done: bool,
}

impl Pagination<'_> {
    /// Next non-empty page, or `None` once the source is exhausted. After
    /// an error the pagination is finished.
    pub async fn next_page(&mut self) -> Result<Option<Page>, FetchError> {
        if self.done {
            return Ok(None);
        }
        let page = match self
            .fetcher
            .fetch_page(&self.token, self.entity, self.offset, self.page_size)
            .await
        {
            Ok(page) => page,
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        if page.raw_len == 0 {
            self.done = true;
            return Ok(None);
        }
        self.done = !page.has_more();
        self.offset = page.next_offset();
        Ok(Some(page))
    }

    /// Offset the next call would request.
    #[must_use]
    pub fn offset(&self) -> usize {
        self.offset
    }
}
