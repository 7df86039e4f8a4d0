// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full runs over in-memory stores and a scripted source API.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

use crm_sync::server::{app_router, AppState};
use crm_sync::source::AccessToken;
use crm_sync::storage::{InMemoryCache, InMemoryStore};
use crm_sync::{
    ApiError, CacheKeys, CacheLayer, CacheTtl, Credentials, EntityType, GateConfig, LedgerStore, ResolutionStrategy,
    RunStatus, SingleSync, SourceApi, StaticCredentials, StorageError, Stores, SyncAccount, SyncConfig,
    SyncConflict, SyncDirection, SyncOrchestrator, SyncRun, SyncStatus, SyncType, TargetStore,
};

// =============================================================================
// Scripted source
// =============================================================================

#[derive(Default)]
struct FakeCrm {
    records: Mutex<HashMap<EntityType, Vec<Value>>>,
    /// Errors returned by upcoming list calls, in order
    list_failures: Mutex<VecDeque<ApiError>>,
    /// `(entity, offset)` pairs that always fail with a 400
    broken_pages: Mutex<HashSet<(EntityType, usize)>>,
    /// Ids whose detail lookup returns 404
    missing_details: Mutex<HashSet<String>>,
    list_calls: Mutex<Vec<(EntityType, usize)>>,
    detail_calls: Mutex<usize>,
}

impl FakeCrm {
    fn with_contacts(n: usize) -> Arc<Self> {
        let fake = Self::default();
        fake.set(EntityType::Contact, (1..=n).map(contact).collect());
        Arc::new(fake)
    }

    fn set(&self, entity: EntityType, records: Vec<Value>) {
        self.records.lock().insert(entity, records);
    }

    fn list_offsets(&self, entity: EntityType) -> Vec<usize> {
        self.list_calls
            .lock()
            .iter()
            .filter(|(e, _)| *e == entity)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

fn contact(i: usize) -> Value {
    json!({
        "id": i,
        "given_name": format!("Contact{i}"),
        "family_name": "Test",
        "email_addresses": [{"email": format!("c{i}@example.com"), "field": "EMAIL1"}],
    })
}

fn order(i: usize) -> Value {
    json!({
        "id": 1000 + i,
        "title": format!("Order {i}"),
        "status": "PAID",
        "total": {"amount": 1999},
        "contact": {"id": i, "email": format!("c{i}@example.com")},
    })
}

#[async_trait]
impl SourceApi for FakeCrm {
    async fn list(
        &self,
        _token: &AccessToken,
        entity: EntityType,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Value>, ApiError> {
        self.list_calls.lock().push((entity, offset));
        if let Some(err) = self.list_failures.lock().pop_front() {
            return Err(err);
        }
        if self.broken_pages.lock().contains(&(entity, offset)) {
            return Err(ApiError::Status { status: 400, message: "invalid offset".into(), retry_after: None });
        }
        let records = self.records.lock();
        let all = records.get(&entity).map(Vec::as_slice).unwrap_or_default();
        Ok(all.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn get(&self, _token: &AccessToken, entity: EntityType, source_id: &str) -> Result<Option<Value>, ApiError> {
        *self.detail_calls.lock() += 1;
        if self.missing_details.lock().contains(source_id) {
            return Ok(None);
        }
        let records = self.records.lock();
        Ok(records
            .get(&entity)
            .and_then(|all| all.iter().find(|r| r["id"].to_string() == source_id).cloned()))
    }
}

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    orchestrator: Arc<SyncOrchestrator>,
    api: Arc<FakeCrm>,
    store: Arc<InMemoryStore>,
    cache: CacheLayer,
}

fn harness_with(api: Arc<FakeCrm>, configure: impl FnOnce(&mut SyncConfig)) -> Harness {
    let mut config = SyncConfig { page_size: 100, batch_size: 100, ..Default::default() };
    configure(&mut config);

    let store = Arc::new(InMemoryStore::new());
    let cache_backend = Arc::new(InMemoryCache::new());
    let stores = Stores {
        target: store.clone(),
        ledger: store.clone(),
        accounts: store.clone(),
        cache: cache_backend.clone(),
    };
    let orchestrator = SyncOrchestrator::with_gate_config(
        config,
        GateConfig::test(),
        stores,
        api.clone(),
        Arc::new(StaticCredentials),
    );
    Harness {
        orchestrator: Arc::new(orchestrator),
        api,
        store,
        cache: CacheLayer::new(cache_backend),
    }
}

fn harness(api: Arc<FakeCrm>) -> Harness {
    harness_with(api, |_| {})
}

async fn register(h: &Harness, id: &str) {
    h.orchestrator
        .register_account(SyncAccount::new(id, Credentials::bearer("token")))
        .await
        .unwrap();
}

fn email(value: &str) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("email".into(), json!(value));
    fields
}

// =============================================================================
// Runs
// =============================================================================

#[tokio::test]
async fn test_250_contacts_in_three_pages() {
    let h = harness(FakeCrm::with_contacts(250));
    register(&h, "A").await;

    let run = h.orchestrator.run_account("A", SyncType::Only(EntityType::Contact)).await.unwrap();

    assert_eq!(h.api.list_offsets(EntityType::Contact), vec![0, 100, 200]);
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_processed, 250);
    assert_eq!(run.entity_counts[&EntityType::Contact], 250);
    assert!(run.errors.is_empty());
    assert!(run.completed_at.is_some());
    assert_eq!(h.store.status_count(), 250);
    assert_eq!(h.store.len(), 250);

    let logged = h.orchestrator.recent_runs(Some("A"), 10).await.unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].id, run.id);
    assert_eq!(logged[0].status, RunStatus::Completed);

    let account = h.orchestrator.account("A").await.unwrap();
    assert!(account.last_sync_at.is_some());
    assert!(account.cursors.is_empty());
}

#[tokio::test]
async fn test_full_sync_covers_every_entity_in_order() {
    let api = FakeCrm::with_contacts(3);
    api.set(EntityType::Order, (1..=2).map(order).collect());
    api.set(EntityType::Tag, vec![json!({"id": 5, "name": "VIP"})]);
    let h = harness(api);
    register(&h, "A").await;

    let run = h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    assert_eq!(run.records_processed, 6);
    let entities: Vec<EntityType> = h.api.list_calls.lock().iter().map(|(e, _)| *e).collect();
    assert_eq!(
        entities,
        vec![EntityType::Contact, EntityType::Order, EntityType::Tag, EntityType::Subscription]
    );
    let stored = h.store.get(EntityType::Order, "1001").await.unwrap().unwrap();
    assert_eq!(stored.fields["contact_email"], json!("c1@example.com"));
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_call_is_retried_once() {
    let api = FakeCrm::with_contacts(5);
    api.list_failures.lock().push_back(ApiError::Status {
        status: 429,
        message: "slow down".into(),
        retry_after: Some(Duration::from_millis(500)),
    });
    let h = harness(api);
    register(&h, "A").await;

    let run = h.orchestrator.run_account("A", SyncType::Only(EntityType::Contact)).await.unwrap();

    assert_eq!(h.api.list_calls.lock().len(), 2);
    assert_eq!(run.records_processed, 5);
    assert_eq!(run.status, RunStatus::Completed);
}

#[tokio::test]
async fn test_detail_404_is_recorded_and_skipped() {
    let api = FakeCrm::with_contacts(3);
    api.set(EntityType::Order, (1..=2).map(order).collect());
    api.missing_details.lock().insert("2".into());
    let h = harness_with(api, |c| c.hydrate_details = true);
    register(&h, "A").await;

    let run = h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_processed, 4);
    assert_eq!(run.entity_counts[&EntityType::Order], 2);
    assert_eq!(run.errors.len(), 1);
    assert!(run.errors[0].contains("contact 2"));
    assert!(h.store.get(EntityType::Contact, "2").await.unwrap().is_none());
    assert_eq!(*h.api.detail_calls.lock(), 5);
}

#[tokio::test]
async fn test_replaying_a_run_is_idempotent() {
    let h = harness(FakeCrm::with_contacts(120));
    register(&h, "A").await;

    h.orchestrator.run_account("A", SyncType::All).await.unwrap();
    let first_rows = h.store.len();
    let second = h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    assert_eq!(second.records_processed, 120);
    assert_eq!(h.store.len(), first_rows);
    assert_eq!(h.store.status_count(), 120);
    assert_eq!(h.orchestrator.recent_runs(None, 10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_failed_page_fails_run_and_resumes_next_time() {
    let api = FakeCrm::with_contacts(250);
    api.broken_pages.lock().insert((EntityType::Contact, 100));
    let h = harness(api);
    register(&h, "A").await;

    assert!(h.orchestrator.run_account("A", SyncType::All).await.is_err());

    let failed = &h.orchestrator.recent_runs(Some("A"), 1).await.unwrap()[0];
    assert_eq!(failed.status, RunStatus::Failed);
    assert_eq!(failed.records_processed, 100);
    assert_eq!(failed.errors.len(), 1);
    assert_eq!(h.orchestrator.account("A").await.unwrap().cursor(EntityType::Contact), 100);

    h.api.broken_pages.lock().clear();
    h.api.list_calls.lock().clear();
    let run = h.orchestrator.run_account("A", SyncType::Only(EntityType::Contact)).await.unwrap();

    assert_eq!(h.api.list_offsets(EntityType::Contact), vec![100, 200]);
    assert_eq!(run.records_processed, 150);
    assert_eq!(h.store.len(), 250);
    assert_eq!(h.orchestrator.account("A").await.unwrap().cursor(EntityType::Contact), 0);
}

#[tokio::test]
async fn test_failed_run_invalidates_pages_it_wrote() {
    let api = FakeCrm::with_contacts(250);
    api.broken_pages.lock().insert((EntityType::Contact, 200));
    let h = harness(api);
    register(&h, "A").await;
    h.cache.set(&CacheKeys::metrics_summary(), &json!({"contacts": 0}), CacheTtl::LONG).await.unwrap();
    assert_eq!(h.orchestrator.statistics().await.unwrap().records[&EntityType::Contact], 0);

    assert!(h.orchestrator.run_account("A", SyncType::All).await.is_err());
    assert_eq!(h.store.len(), 200);

    assert!(h.cache.get::<Value>(&CacheKeys::metrics_summary()).await.unwrap().is_none());
    assert_eq!(h.orchestrator.statistics().await.unwrap().records[&EntityType::Contact], 200);
}

/// Run log that refuses to record completed runs.
struct LosesCompletedRuns(Arc<InMemoryStore>);

#[async_trait]
impl LedgerStore for LosesCompletedRuns {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StorageError> {
        self.0.upsert_status(status).await
    }

    async fn get_status(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        self.0.get_status(entity, entity_id).await
    }

    async fn recent_statuses(&self, limit: usize) -> Result<Vec<SyncStatus>, StorageError> {
        self.0.recent_statuses(limit).await
    }

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StorageError> {
        self.0.save_conflict(conflict).await
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>, StorageError> {
        self.0.get_conflict(id).await
    }

    async fn latest_conflict(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncConflict>, StorageError> {
        self.0.latest_conflict(entity, entity_id).await
    }

    async fn pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, StorageError> {
        self.0.pending_conflicts(limit).await
    }

    async fn count_pending_conflicts(&self) -> Result<u64, StorageError> {
        self.0.count_pending_conflicts().await
    }

    async fn save_run(&self, run: &SyncRun) -> Result<(), StorageError> {
        if run.status == RunStatus::Completed {
            return Err(StorageError::Backend("run log unavailable".into()));
        }
        self.0.save_run(run).await
    }

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StorageError> {
        self.0.recent_runs(account_id, limit).await
    }
}

#[tokio::test]
async fn test_run_log_failure_does_not_fail_finished_run() {
    let store = Arc::new(InMemoryStore::new());
    let cache_backend = Arc::new(InMemoryCache::new());
    let stores = Stores {
        target: store.clone(),
        ledger: Arc::new(LosesCompletedRuns(store.clone())),
        accounts: store.clone(),
        cache: cache_backend.clone(),
    };
    let orchestrator = SyncOrchestrator::with_gate_config(
        SyncConfig::default(),
        GateConfig::test(),
        stores,
        FakeCrm::with_contacts(3),
        Arc::new(StaticCredentials),
    );
    orchestrator
        .register_account(SyncAccount::new("A", Credentials::bearer("token")))
        .await
        .unwrap();

    let run = orchestrator.run_account("A", SyncType::Only(EntityType::Contact)).await.unwrap();

    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_processed, 3);
    assert!(orchestrator.account("A").await.unwrap().last_sync_at.is_some());
    assert!(CacheLayer::new(cache_backend).last_sync("A").await.unwrap().is_some());
}

#[test]
fn test_run_futures_are_send() {
    fn assert_send<T: Send>(_: T) {}

    let h = harness(FakeCrm::with_contacts(1));
    assert_send(h.orchestrator.run_account("A", SyncType::All));
    assert_send(h.orchestrator.run_scheduled());
    assert_send(h.orchestrator.trigger("A", SyncType::All));
}

#[tokio::test]
async fn test_scheduled_tick_continues_past_failing_account() {
    let h = harness(FakeCrm::with_contacts(2));
    register(&h, "good").await;
    h.orchestrator
        .register_account(SyncAccount::new("no-token", Credentials::default()))
        .await
        .unwrap();

    let summary = h.orchestrator.run_scheduled().await.unwrap();

    assert_eq!(summary.accounts, 2);
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed.len(), 1);
    assert_eq!(summary.failed[0].0, "no-token");
    assert_eq!(h.store.len(), 2);
}

// =============================================================================
// Conflicts
// =============================================================================

async fn edited_then_changed(direction: SyncDirection, strategy: ResolutionStrategy) -> Harness {
    let h = harness_with(FakeCrm::with_contacts(2), |c| {
        c.sync_direction = direction;
        c.conflict_strategy = strategy;
    });
    register(&h, "A").await;
    h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    // Target-side edit after the sync, then a source-side change
    let later = Utc::now() + chrono::Duration::seconds(1);
    assert!(h
        .store
        .apply_local_edit(EntityType::Contact, "1", email("local@example.com"), later)
        .await
        .unwrap());
    let mut changed = contact(1);
    changed["email_addresses"] = json!([{"email": "new@example.com"}]);
    h.api.set(EntityType::Contact, vec![changed, contact(2)]);
    h
}

#[tokio::test]
async fn test_bidirectional_sync_records_conflict() {
    let h = edited_then_changed(SyncDirection::Bidirectional, ResolutionStrategy::Manual).await;

    let run = h.orchestrator.run_account("A", SyncType::All).await.unwrap();
    assert_eq!(run.records_processed, 1);

    let pending = h.orchestrator.pending_conflicts(10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].entity_id, "1");
    assert_eq!(pending[0].fields, vec!["email".to_string()]);
    assert_eq!(pending[0].source_version["email"], json!("new@example.com"));

    let target = h.store.get(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(target.fields["email"], json!("local@example.com"));
    let status = h.store.get_status(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(status.conflict_status, crm_sync::ConflictStatus::Pending);

    // Same versions again: no duplicate conflict
    h.orchestrator.run_account("A", SyncType::All).await.unwrap();
    assert_eq!(h.orchestrator.status(10).await.unwrap().pending_conflicts, 1);

    let resolution = h
        .orchestrator
        .resolve_conflict(&pending[0].id, ResolutionStrategy::SourceWins)
        .await
        .unwrap();
    assert!(resolution.conflict.resolved_at.is_some());
    assert_eq!(resolution.status.conflict_status, crm_sync::ConflictStatus::Resolved);
    let target = h.store.get(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(target.fields["email"], json!("new@example.com"));
    assert_eq!(h.orchestrator.status(10).await.unwrap().pending_conflicts, 0);

    let again = h.orchestrator.resolve_conflict(&pending[0].id, ResolutionStrategy::TargetWins).await;
    assert!(again.unwrap_err().is_client_error());
}

#[tokio::test]
async fn test_source_only_sync_overwrites_without_conflict() {
    let h = edited_then_changed(SyncDirection::SourceToTarget, ResolutionStrategy::Manual).await;

    let run = h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    assert_eq!(run.records_processed, 2);
    assert!(h.orchestrator.pending_conflicts(10).await.unwrap().is_empty());
    let target = h.store.get(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(target.fields["email"], json!("new@example.com"));
}

#[tokio::test]
async fn test_target_wins_keeps_local_edit() {
    let h = edited_then_changed(SyncDirection::Bidirectional, ResolutionStrategy::TargetWins).await;

    h.orchestrator.run_account("A", SyncType::All).await.unwrap();
    h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    let target = h.store.get(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(target.fields["email"], json!("local@example.com"));
    assert!(h.orchestrator.pending_conflicts(10).await.unwrap().is_empty());
    let latest = h.store.latest_conflict(EntityType::Contact, "1").await.unwrap().unwrap();
    assert_eq!(latest.strategy, ResolutionStrategy::TargetWins);
    assert!(latest.is_resolved());
}

// =============================================================================
// Single records and caches
// =============================================================================

#[tokio::test]
async fn test_single_record_sync_and_delete() {
    let h = harness(FakeCrm::with_contacts(3));
    register(&h, "A").await;

    assert_eq!(
        h.orchestrator.sync_single("A", EntityType::Contact, "2").await.unwrap(),
        SingleSync::Written
    );
    assert_eq!(h.store.len(), 1);
    assert_eq!(
        h.orchestrator.sync_single("A", EntityType::Contact, "99").await.unwrap(),
        SingleSync::NotFound
    );

    assert!(h.orchestrator.mark_deleted("A", EntityType::Contact, "2").await.unwrap());
    assert!(!h.store.get(EntityType::Contact, "2").await.unwrap().unwrap().active);
    assert!(!h.orchestrator.mark_deleted("A", EntityType::Contact, "3").await.unwrap());
}

#[tokio::test]
async fn test_write_invalidates_derived_caches() {
    let api = FakeCrm::with_contacts(2);
    let h = harness(api);
    register(&h, "A").await;
    h.cache.set(&CacheKeys::metrics_summary(), &json!({"contacts": 0}), CacheTtl::LONG).await.unwrap();
    h.cache.set(&CacheKeys::revenue_by_period("q1"), &1, CacheTtl::LONG).await.unwrap();

    h.orchestrator.run_account("A", SyncType::Only(EntityType::Contact)).await.unwrap();

    assert!(h.cache.get::<Value>(&CacheKeys::metrics_summary()).await.unwrap().is_none());
    assert!(h.cache.get::<i32>(&CacheKeys::revenue_by_period("q1")).await.unwrap().is_some());
    assert!(h.cache.last_sync("A").await.unwrap().is_some());
}

#[tokio::test]
async fn test_statistics_refresh_after_writes() {
    let h = harness(FakeCrm::with_contacts(4));
    register(&h, "A").await;

    let before = h.orchestrator.statistics().await.unwrap();
    assert_eq!(before.records[&EntityType::Contact], 0);
    assert!(before.last_sync_at.is_none());

    h.orchestrator.run_account("A", SyncType::All).await.unwrap();
    let after = h.orchestrator.statistics().await.unwrap();
    assert_eq!(after.records[&EntityType::Contact], 4);
    assert!(after.last_sync_at.is_some());
    assert_eq!(after.accounts.len(), 1);
}

// =============================================================================
// HTTP surface
// =============================================================================

async fn call(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
        .unwrap();
    let response = app_router(AppState::new(h.orchestrator.clone()))
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn test_trigger_surface() {
    let h = harness(FakeCrm::with_contacts(3));
    register(&h, "A").await;

    let (status, body) = call(&h, "POST", "/sync/trigger", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], json!(false));

    let (status, _) = call(&h, "POST", "/sync/trigger", Some(json!({"accountId": "nobody"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&h, "POST", "/sync/trigger", Some(json!({"accountId": "A", "syncType": "products"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&h, "POST", "/sync/trigger", Some(json!({"accountId": "A", "syncType": "contacts"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], json!(true));

    // The run finishes in the background
    let mut completed = false;
    for _ in 0..200 {
        let runs = h.orchestrator.recent_runs(Some("A"), 1).await.unwrap();
        if runs.first().map_or(false, |r| r.status == RunStatus::Completed) {
            completed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(completed);

    let (status, body) = call(&h, "GET", "/sync/status?limit=2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["statuses"].as_array().unwrap().len(), 2);
    assert_eq!(body["pendingConflicts"], json!(0));

    let (status, body) = call(&h, "GET", "/sync/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["records"]["contact"], json!(3));

    let (status, body) = call(&h, "GET", "/sync/runs", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["runs"].as_array().unwrap().len(), 1);

    let (status, body) = call(&h, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], json!("ok"));
}

#[tokio::test]
async fn test_conflict_endpoints() {
    let h = edited_then_changed(SyncDirection::Bidirectional, ResolutionStrategy::Manual).await;
    h.orchestrator.run_account("A", SyncType::All).await.unwrap();

    let (status, body) = call(&h, "GET", "/sync/conflicts", None).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["conflicts"][0]["id"].as_str().unwrap().to_string();

    let uri = format!("/sync/conflicts/{id}/resolve");
    let (status, _) = call(&h, "POST", &uri, Some(json!({"strategy": "manual"}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&h, "POST", &uri, Some(json!({"strategy": "target_wins"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["conflict"]["strategy"], json!("target_wins"));

    let (status, _) = call(&h, "POST", "/sync/conflicts/missing/resolve", Some(json!({"strategy": "source_wins"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&h, "POST", "/sync/scheduled", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["succeeded"], json!(1));
}
