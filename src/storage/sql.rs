// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL backend for the target mirror, the ledger and the account registry.
//!
//! One table per entity type, keyed by `source_id`, with a typed column per
//! mapped field (queryable directly) plus the full field map in
//! `fields_json` for lossless reads:
//!
//! ```sql
//! CREATE TABLE sync_contacts (
//!   source_id VARCHAR(64) PRIMARY KEY,
//!   account_id VARCHAR(64) NOT NULL,
//!   email VARCHAR(512), given_name VARCHAR(512), ...  -- from the mapping
//!   fields_json LONGTEXT NOT NULL,
//!   active TINYINT NOT NULL,
//!   source_updated_at VARCHAR(40),
//!   schema_version INTEGER NOT NULL,
//!   synced_at VARCHAR(40) NOT NULL,
//!   modified_at VARCHAR(40) NOT NULL
//! )
//! ```
//!
//! Ledger tables: `sync_status` (PK `entity_type, entity_id`),
//! `sync_conflicts`, `sync_runs`, `sync_accounts`.
//!
//! ## sqlx Any driver quirks
//!
//! - JSON goes in TEXT/LONGTEXT; the `Any` driver has no MySQL JSON mapping.
//! - MySQL TEXT columns can come back as bytes, so text reads try `String`
//!   then `Vec<u8>`.
//! - Timestamps are fixed-width RFC 3339 strings (microseconds, `Z`), which
//!   sort lexicographically in time order and compare with `MAX`/`GREATEST`.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::sync::Once;
use std::time::Duration;

use super::traits::{AccountStore, LedgerStore, StorageError, TargetStore};
use crate::account::SyncAccount;
use crate::entity::EntityType;
use crate::ledger::{SyncConflict, SyncRun, SyncStatus};
use crate::record::MirroredRecord;
use crate::resilience::retry::{retry, RetryConfig};
use crate::writer::mapping::{mapping_for, ColumnKind, EntityMapping};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// SQLite's historic bind-parameter ceiling, used for both backends.
const MAX_BINDS: usize = 900;

const RECORD_COLUMNS: &str =
    "source_id, account_id, fields_json, active, source_updated_at, schema_version, synced_at, modified_at";
const STATUS_COLUMNS: &str =
    "entity_type, entity_id, account_id, last_synced_at, sync_direction, conflict_status";
const CONFLICT_COLUMNS: &str =
    "id, entity_type, entity_id, account_id, source_version, target_version, fields, strategy, detected_at, resolved_at";
const RUN_COLUMNS: &str =
    "id, account_id, sync_type, status, records_processed, entity_counts, errors, started_at, completed_at";

pub struct SqlStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStore {
    /// Connect with startup-mode retry (fails fast if config is wrong) and
    /// create any missing tables.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 10 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(format!("{pragma} failed: {e}")))?;
        }
        Ok(())
    }

    fn schema_statements(&self) -> Vec<String> {
        let (key, text, json, ts, int) = if self.is_sqlite {
            ("TEXT", "TEXT", "TEXT", "TEXT", "INTEGER")
        } else {
            ("VARCHAR(64)", "VARCHAR(255)", "LONGTEXT", "VARCHAR(40)", "BIGINT")
        };

        let mut statements: Vec<String> = EntityType::ALL
            .iter()
            .map(|&entity| {
                let mapping = mapping_for(entity);
                let mapped: String = mapping
                    .columns
                    .iter()
                    .map(|c| format!("{} {},\n", c.name, c.kind.sql_type(self.is_sqlite)))
                    .collect();
                format!(
                    "CREATE TABLE IF NOT EXISTS {table} (
                        source_id {key} PRIMARY KEY,
                        account_id {key} NOT NULL,
                        {mapped}
                        fields_json {json} NOT NULL,
                        active {int} NOT NULL DEFAULT 1,
                        source_updated_at {ts},
                        schema_version {int} NOT NULL,
                        synced_at {ts} NOT NULL,
                        modified_at {ts} NOT NULL
                    )",
                    table = mapping.table,
                )
            })
            .collect();

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS sync_status (
                entity_type VARCHAR(32) NOT NULL,
                entity_id {key} NOT NULL,
                account_id {key} NOT NULL,
                last_synced_at {ts} NOT NULL,
                sync_direction VARCHAR(32) NOT NULL,
                conflict_status VARCHAR(16) NOT NULL,
                PRIMARY KEY (entity_type, entity_id)
            )"
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id {key} PRIMARY KEY,
                entity_type VARCHAR(32) NOT NULL,
                entity_id {key} NOT NULL,
                account_id {key} NOT NULL,
                source_version {json} NOT NULL,
                target_version {json} NOT NULL,
                fields {json} NOT NULL,
                strategy VARCHAR(16) NOT NULL,
                detected_at {ts} NOT NULL,
                resolved_at {ts}
            )"
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS sync_runs (
                id {key} PRIMARY KEY,
                account_id {key} NOT NULL,
                sync_type VARCHAR(32) NOT NULL,
                status VARCHAR(16) NOT NULL,
                records_processed {int} NOT NULL,
                entity_counts {json} NOT NULL,
                errors {json} NOT NULL,
                started_at {ts} NOT NULL,
                completed_at {ts}
            )"
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS sync_accounts (
                id {key} PRIMARY KEY,
                name {text} NOT NULL,
                credentials {json} NOT NULL,
                cursors {json} NOT NULL,
                last_sync_at {ts},
                created_at {ts} NOT NULL
            )"
        ));

        if self.is_sqlite {
            statements.push("CREATE INDEX IF NOT EXISTS idx_status_synced ON sync_status (last_synced_at)".into());
            statements.push("CREATE INDEX IF NOT EXISTS idx_conflicts_entity ON sync_conflicts (entity_type, entity_id)".into());
            statements.push("CREATE INDEX IF NOT EXISTS idx_runs_started ON sync_runs (started_at)".into());
        }
        statements
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        for sql in self.schema_statements() {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(&sql)
                    .execute(&self.pool)
                    .await
                    .map_err(|e| StorageError::Backend(e.to_string()))
            })
            .await?;
        }
        Ok(())
    }

    /// Multi-row upsert statement for `rows` records. `modified_at` is only
    /// written on insert.
    fn upsert_sql(&self, mapping: &EntityMapping, rows: usize) -> String {
        let mapped: Vec<&str> = mapping.column_names();
        let columns = format!("{}, {}", RECORD_COLUMNS, mapped.join(", "));
        let row = format!("({})", vec!["?"; 8 + mapped.len()].join(", "));
        let values = vec![row.as_str(); rows].join(", ");

        let updated = ["account_id", "fields_json", "active", "source_updated_at", "schema_version", "synced_at"]
            .into_iter()
            .chain(mapped.iter().copied());
        let assignments: Vec<String> = if self.is_sqlite {
            updated.map(|c| format!("{c} = excluded.{c}")).collect()
        } else {
            updated.map(|c| format!("{c} = VALUES({c})")).collect()
        };

        if self.is_sqlite {
            format!(
                "INSERT INTO {} ({columns}) VALUES {values} ON CONFLICT(source_id) DO UPDATE SET {}",
                mapping.table,
                assignments.join(", ")
            )
        } else {
            format!(
                "INSERT INTO {} ({columns}) VALUES {values} ON DUPLICATE KEY UPDATE {}",
                mapping.table,
                assignments.join(", ")
            )
        }
    }

    async fn write_chunk(&self, mapping: &EntityMapping, chunk: &[MirroredRecord]) -> Result<(), StorageError> {
        let sql = self.upsert_sql(mapping, chunk.len());
        let prepared: Vec<PreparedRecord> = chunk
            .iter()
            .map(|r| PreparedRecord::new(mapping, r))
            .collect::<Result<_, _>>()?;

        retry("sql_upsert_batch", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for row in &prepared {
                query = query
                    .bind(row.source_id.clone())
                    .bind(row.account_id.clone())
                    .bind(row.fields_json.clone())
                    .bind(row.active)
                    .bind(row.source_updated_at.clone())
                    .bind(row.schema_version)
                    .bind(row.synced_at.clone())
                    .bind(row.modified_at.clone());
                for value in &row.mapped {
                    query = match value {
                        SqlValue::Text(v) => query.bind(v.clone()),
                        SqlValue::Int(v) => query.bind(*v),
                        SqlValue::Float(v) => query.bind(*v),
                    };
                }
            }
            query
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn select_records(
        &self,
        entity: EntityType,
        where_clause: &str,
        binds: &[String],
    ) -> Result<Vec<MirroredRecord>, StorageError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE {where_clause}",
            mapping_for(entity).table
        );
        let rows = retry("sql_select_records", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in binds {
                query = query.bind(bind.clone());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;

        rows.iter().map(|row| record_from_row(entity, row)).collect()
    }

    async fn update_record_fields(
        &self,
        entity: EntityType,
        record: &MirroredRecord,
    ) -> Result<(), StorageError> {
        let mapping = mapping_for(entity);
        let prepared = PreparedRecord::new(mapping, record)?;
        let assignments: Vec<String> = mapping.columns.iter().map(|c| format!("{} = ?", c.name)).collect();
        let sql = format!(
            "UPDATE {} SET fields_json = ?, active = ?, synced_at = ?, modified_at = ?, {} WHERE source_id = ?",
            mapping.table,
            assignments.join(", ")
        );

        retry("sql_update_record", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql)
                .bind(prepared.fields_json.clone())
                .bind(prepared.active)
                .bind(prepared.synced_at.clone())
                .bind(prepared.modified_at.clone());
            for value in &prepared.mapped {
                query = match value {
                    SqlValue::Text(v) => query.bind(v.clone()),
                    SqlValue::Int(v) => query.bind(*v),
                    SqlValue::Float(v) => query.bind(*v),
                };
            }
            query
                .bind(prepared.source_id.clone())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn fetch_statuses(&self, sql: &str, binds: &[String]) -> Result<Vec<SyncStatus>, StorageError> {
        let rows = retry("sql_select_status", &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            for bind in binds {
                query = query.bind(bind.clone());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        rows.iter().map(status_from_row).collect()
    }

    async fn fetch_conflicts(&self, sql: &str, binds: &[String]) -> Result<Vec<SyncConflict>, StorageError> {
        let rows = retry("sql_select_conflicts", &RetryConfig::query(), || async {
            let mut query = sqlx::query(sql);
            for bind in binds {
                query = query.bind(bind.clone());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        rows.iter().map(conflict_from_row).collect()
    }
}

enum SqlValue {
    Text(Option<String>),
    Int(Option<i64>),
    Float(Option<f64>),
}

fn sql_value(kind: ColumnKind, value: Option<&Value>) -> SqlValue {
    let value = value.filter(|v| !v.is_null());
    match kind {
        ColumnKind::Text | ColumnKind::Timestamp => {
            SqlValue::Text(value.map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_string)))
        }
        ColumnKind::Json => SqlValue::Text(value.map(Value::to_string)),
        ColumnKind::Integer => SqlValue::Int(value.and_then(Value::as_i64)),
        ColumnKind::Bool => SqlValue::Int(value.and_then(Value::as_bool).map(i64::from)),
        ColumnKind::Decimal | ColumnKind::Cents => SqlValue::Float(value.and_then(Value::as_f64)),
    }
}

/// Owned bind values for one record.
struct PreparedRecord {
    source_id: String,
    account_id: String,
    fields_json: String,
    active: i64,
    source_updated_at: Option<String>,
    schema_version: i64,
    synced_at: String,
    modified_at: String,
    mapped: Vec<SqlValue>,
}

impl PreparedRecord {
    fn new(mapping: &EntityMapping, record: &MirroredRecord) -> Result<Self, StorageError> {
        Ok(Self {
            source_id: record.source_id.clone(),
            account_id: record.account_id.clone(),
            fields_json: serde_json::to_string(&record.fields)?,
            active: i64::from(record.active),
            source_updated_at: record.source_updated_at.map(ts),
            schema_version: i64::from(record.schema_version),
            synced_at: ts(record.synced_at),
            modified_at: ts(record.modified_at),
            mapped: mapping
                .columns
                .iter()
                .map(|c| sql_value(c.kind, record.fields.get(c.name)))
                .collect(),
        })
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("bad timestamp '{s}': {e}")))
}

/// Read a text column. SQLite hands back `String`; MySQL TEXT may arrive
/// as bytes.
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
}

fn required_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    text(row, column).ok_or_else(|| StorageError::Serialization(format!("missing column '{column}'")))
}

fn int(row: &AnyRow, column: &str) -> Result<i64, StorageError> {
    row.try_get::<i64, _>(column)
        .or_else(|_| row.try_get::<i32, _>(column).map(i64::from))
        .map_err(|e| StorageError::Serialization(format!("column '{column}': {e}")))
}

fn parsed<T: std::str::FromStr>(row: &AnyRow, column: &str) -> Result<T, StorageError>
where
    T::Err: std::fmt::Display,
{
    let raw = required_text(row, column)?;
    raw.parse::<T>()
        .map_err(|e| StorageError::Serialization(format!("column '{column}': {e}")))
}

fn record_from_row(entity: EntityType, row: &AnyRow) -> Result<MirroredRecord, StorageError> {
    let fields: Map<String, Value> = serde_json::from_str(&required_text(row, "fields_json")?)?;
    Ok(MirroredRecord {
        entity_type: entity,
        source_id: required_text(row, "source_id")?,
        account_id: required_text(row, "account_id")?,
        fields,
        active: int(row, "active")? != 0,
        source_updated_at: text(row, "source_updated_at").map(|s| parse_ts(&s)).transpose()?,
        schema_version: u32::try_from(int(row, "schema_version")?).unwrap_or_default(),
        synced_at: parse_ts(&required_text(row, "synced_at")?)?,
        modified_at: parse_ts(&required_text(row, "modified_at")?)?,
    })
}

fn status_from_row(row: &AnyRow) -> Result<SyncStatus, StorageError> {
    Ok(SyncStatus {
        entity_type: parsed(row, "entity_type")?,
        entity_id: required_text(row, "entity_id")?,
        account_id: required_text(row, "account_id")?,
        last_synced_at: parse_ts(&required_text(row, "last_synced_at")?)?,
        sync_direction: parsed(row, "sync_direction")?,
        conflict_status: parsed(row, "conflict_status")?,
    })
}

fn conflict_from_row(row: &AnyRow) -> Result<SyncConflict, StorageError> {
    Ok(SyncConflict {
        id: required_text(row, "id")?,
        entity_type: parsed(row, "entity_type")?,
        entity_id: required_text(row, "entity_id")?,
        account_id: required_text(row, "account_id")?,
        source_version: serde_json::from_str(&required_text(row, "source_version")?)?,
        target_version: serde_json::from_str(&required_text(row, "target_version")?)?,
        fields: serde_json::from_str(&required_text(row, "fields")?)?,
        strategy: parsed(row, "strategy")?,
        detected_at: parse_ts(&required_text(row, "detected_at")?)?,
        resolved_at: text(row, "resolved_at").map(|s| parse_ts(&s)).transpose()?,
    })
}

fn run_from_row(row: &AnyRow) -> Result<SyncRun, StorageError> {
    Ok(SyncRun {
        id: required_text(row, "id")?,
        account_id: required_text(row, "account_id")?,
        sync_type: required_text(row, "sync_type")?,
        status: parsed(row, "status")?,
        records_processed: usize::try_from(int(row, "records_processed")?).unwrap_or_default(),
        entity_counts: serde_json::from_str(&required_text(row, "entity_counts")?)?,
        errors: serde_json::from_str(&required_text(row, "errors")?)?,
        started_at: parse_ts(&required_text(row, "started_at")?)?,
        completed_at: text(row, "completed_at").map(|s| parse_ts(&s)).transpose()?,
    })
}

fn account_from_row(row: &AnyRow) -> Result<SyncAccount, StorageError> {
    Ok(SyncAccount {
        id: required_text(row, "id")?,
        name: required_text(row, "name")?,
        credentials: serde_json::from_str(&required_text(row, "credentials")?)?,
        cursors: serde_json::from_str(&required_text(row, "cursors")?)?,
        last_sync_at: text(row, "last_sync_at").map(|s| parse_ts(&s)).transpose()?,
        created_at: parse_ts(&required_text(row, "created_at")?)?,
    })
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl TargetStore for SqlStore {
    async fn upsert_batch(&self, entity: EntityType, records: &[MirroredRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }
        let mapping = mapping_for(entity);
        let rows_per_statement = (MAX_BINDS / (8 + mapping.columns.len())).max(1);
        for chunk in records.chunks(rows_per_statement) {
            self.write_chunk(mapping, chunk).await?;
        }
        Ok(records.len())
    }

    async fn get(&self, entity: EntityType, source_id: &str) -> Result<Option<MirroredRecord>, StorageError> {
        Ok(self
            .select_records(entity, "source_id = ?", &[source_id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn get_many(&self, entity: EntityType, source_ids: &[String]) -> Result<Vec<MirroredRecord>, StorageError> {
        let mut found = Vec::with_capacity(source_ids.len());
        for chunk in source_ids.chunks(MAX_BINDS) {
            let clause = format!("source_id IN ({})", placeholders(chunk.len()));
            found.extend(self.select_records(entity, &clause, chunk).await?);
        }
        Ok(found)
    }

    async fn mark_inactive(&self, entity: EntityType, source_id: &str, at: DateTime<Utc>) -> Result<bool, StorageError> {
        let Some(mut record) = self.get(entity, source_id).await? else {
            return Ok(false);
        };
        record.active = false;
        record.synced_at = at;
        self.update_record_fields(entity, &record).await?;
        Ok(true)
    }

    async fn apply_local_edit(
        &self,
        entity: EntityType,
        source_id: &str,
        fields: Map<String, Value>,
        at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(mut record) = self.get(entity, source_id).await? else {
            return Ok(false);
        };
        record.fields.extend(fields);
        record.modified_at = at;
        self.update_record_fields(entity, &record).await?;
        Ok(true)
    }

    async fn count(&self, entity: EntityType) -> Result<u64, StorageError> {
        let sql = format!("SELECT COUNT(*) AS cnt FROM {}", mapping_for(entity).table);
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(u64::try_from(int(&row, "cnt")?).unwrap_or_default())
    }
}

#[async_trait]
impl LedgerStore for SqlStore {
    async fn upsert_status(&self, status: &SyncStatus) -> Result<SyncStatus, StorageError> {
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO sync_status ({STATUS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(entity_type, entity_id) DO UPDATE SET
                    account_id = excluded.account_id,
                    last_synced_at = MAX(sync_status.last_synced_at, excluded.last_synced_at),
                    sync_direction = excluded.sync_direction,
                    conflict_status = excluded.conflict_status"
            )
        } else {
            format!(
                "INSERT INTO sync_status ({STATUS_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    account_id = VALUES(account_id),
                    last_synced_at = GREATEST(last_synced_at, VALUES(last_synced_at)),
                    sync_direction = VALUES(sync_direction),
                    conflict_status = VALUES(conflict_status)"
            )
        };

        retry("sql_upsert_status", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(status.entity_type.as_str())
                .bind(status.entity_id.as_str())
                .bind(status.account_id.as_str())
                .bind(ts(status.last_synced_at))
                .bind(status.sync_direction.as_str())
                .bind(status.conflict_status.as_str())
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok::<(), StorageError>(())
        })
        .await?;

        self.get_status(status.entity_type, &status.entity_id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("{} {}", status.entity_type, status.entity_id)))
    }

    async fn get_status(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncStatus>, StorageError> {
        let sql = format!("SELECT {STATUS_COLUMNS} FROM sync_status WHERE entity_type = ? AND entity_id = ?");
        Ok(self
            .fetch_statuses(&sql, &[entity.as_str().to_string(), entity_id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn get_statuses(&self, entity: EntityType, entity_ids: &[String]) -> Result<Vec<SyncStatus>, StorageError> {
        let mut found = Vec::with_capacity(entity_ids.len());
        for chunk in entity_ids.chunks(MAX_BINDS - 1) {
            let sql = format!(
                "SELECT {STATUS_COLUMNS} FROM sync_status WHERE entity_type = ? AND entity_id IN ({})",
                placeholders(chunk.len())
            );
            let mut binds = Vec::with_capacity(chunk.len() + 1);
            binds.push(entity.as_str().to_string());
            binds.extend(chunk.iter().cloned());
            found.extend(self.fetch_statuses(&sql, &binds).await?);
        }
        Ok(found)
    }

    async fn recent_statuses(&self, limit: usize) -> Result<Vec<SyncStatus>, StorageError> {
        let sql = format!(
            "SELECT {STATUS_COLUMNS} FROM sync_status ORDER BY last_synced_at DESC, entity_id ASC LIMIT {limit}"
        );
        self.fetch_statuses(&sql, &[]).await
    }

    async fn save_conflict(&self, conflict: &SyncConflict) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET strategy = excluded.strategy, resolved_at = excluded.resolved_at"
            )
        } else {
            format!(
                "INSERT INTO sync_conflicts ({CONFLICT_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE strategy = VALUES(strategy), resolved_at = VALUES(resolved_at)"
            )
        };
        let source_version = serde_json::to_string(&conflict.source_version)?;
        let target_version = serde_json::to_string(&conflict.target_version)?;
        let fields = serde_json::to_string(&conflict.fields)?;

        retry("sql_save_conflict", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(conflict.id.as_str())
                .bind(conflict.entity_type.as_str())
                .bind(conflict.entity_id.as_str())
                .bind(conflict.account_id.as_str())
                .bind(source_version.as_str())
                .bind(target_version.as_str())
                .bind(fields.as_str())
                .bind(conflict.strategy.as_str())
                .bind(ts(conflict.detected_at))
                .bind(conflict.resolved_at.map(ts))
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_conflict(&self, id: &str) -> Result<Option<SyncConflict>, StorageError> {
        let sql = format!("SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE id = ?");
        Ok(self.fetch_conflicts(&sql, &[id.to_string()]).await?.into_iter().next())
    }

    async fn latest_conflict(&self, entity: EntityType, entity_id: &str) -> Result<Option<SyncConflict>, StorageError> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE entity_type = ? AND entity_id = ?
             ORDER BY detected_at DESC LIMIT 1"
        );
        Ok(self
            .fetch_conflicts(&sql, &[entity.as_str().to_string(), entity_id.to_string()])
            .await?
            .into_iter()
            .next())
    }

    async fn pending_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>, StorageError> {
        let sql = format!(
            "SELECT {CONFLICT_COLUMNS} FROM sync_conflicts WHERE resolved_at IS NULL ORDER BY detected_at ASC LIMIT {limit}"
        );
        self.fetch_conflicts(&sql, &[]).await
    }

    async fn count_pending_conflicts(&self) -> Result<u64, StorageError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM sync_conflicts WHERE resolved_at IS NULL")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(u64::try_from(int(&row, "cnt")?).unwrap_or_default())
    }

    async fn save_run(&self, run: &SyncRun) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO sync_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET status = excluded.status,
                    records_processed = excluded.records_processed, entity_counts = excluded.entity_counts,
                    errors = excluded.errors, completed_at = excluded.completed_at"
            )
        } else {
            format!(
                "INSERT INTO sync_runs ({RUN_COLUMNS}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE status = VALUES(status),
                    records_processed = VALUES(records_processed), entity_counts = VALUES(entity_counts),
                    errors = VALUES(errors), completed_at = VALUES(completed_at)"
            )
        };
        let entity_counts = serde_json::to_string(&run.entity_counts)?;
        let errors = serde_json::to_string(&run.errors)?;
        let processed = i64::try_from(run.records_processed).unwrap_or(i64::MAX);

        retry("sql_save_run", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(run.id.as_str())
                .bind(run.account_id.as_str())
                .bind(run.sync_type.as_str())
                .bind(run.status.as_str())
                .bind(processed)
                .bind(entity_counts.as_str())
                .bind(errors.as_str())
                .bind(ts(run.started_at))
                .bind(run.completed_at.map(ts))
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn recent_runs(&self, account_id: Option<&str>, limit: usize) -> Result<Vec<SyncRun>, StorageError> {
        let (sql, binds) = match account_id {
            Some(id) => (
                format!("SELECT {RUN_COLUMNS} FROM sync_runs WHERE account_id = ? ORDER BY started_at DESC LIMIT {limit}"),
                vec![id.to_string()],
            ),
            None => (
                format!("SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY started_at DESC LIMIT {limit}"),
                Vec::new(),
            ),
        };
        let rows = retry("sql_recent_runs", &RetryConfig::query(), || async {
            let mut query = sqlx::query(&sql);
            for bind in &binds {
                query = query.bind(bind.clone());
            }
            query
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))
        })
        .await?;
        rows.iter().map(run_from_row).collect()
    }
}

#[async_trait]
impl AccountStore for SqlStore {
    async fn upsert_account(&self, account: &SyncAccount) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO sync_accounts (id, name, credentials, cursors, last_sync_at, created_at) VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, credentials = excluded.credentials,
                cursors = excluded.cursors, last_sync_at = excluded.last_sync_at"
        } else {
            "INSERT INTO sync_accounts (id, name, credentials, cursors, last_sync_at, created_at) VALUES (?, ?, ?, ?, ?, ?)
             ON DUPLICATE KEY UPDATE name = VALUES(name), credentials = VALUES(credentials),
                cursors = VALUES(cursors), last_sync_at = VALUES(last_sync_at)"
        };
        let credentials = serde_json::to_string(&account.credentials)?;
        let cursors = serde_json::to_string(&account.cursors)?;

        retry("sql_upsert_account", &RetryConfig::query(), || async {
            sqlx::query(sql)
                .bind(account.id.as_str())
                .bind(account.name.as_str())
                .bind(credentials.as_str())
                .bind(cursors.as_str())
                .bind(account.last_sync_at.map(ts))
                .bind(ts(account.created_at))
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn get_account(&self, id: &str) -> Result<Option<SyncAccount>, StorageError> {
        let row = sqlx::query(
            "SELECT id, name, credentials, cursors, last_sync_at, created_at FROM sync_accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<SyncAccount>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, name, credentials, cursors, last_sync_at, created_at FROM sync_accounts ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Backend(e.to_string()))?;
        rows.iter().map(account_from_row).collect()
    }
}
