// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity column mapping from source payloads to target rows.
//!
//! Each target column lists the JSON pointers it may be read from, in
//! priority order. Older API versions and some endpoints use different
//! field names, so the first pointer that yields a value of the right
//! shape wins and the rest are fallbacks. A column with no usable source
//! is written as `NULL`.
//!
//! Bump `schema_version` whenever a column is added, removed or changes
//! kind; the SQL backend records it per row.

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Number, Value};

use crate::entity::EntityType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Decimal,
    /// Integer minor units (cents) stored as a decimal major amount
    Cents,
    Bool,
    /// RFC 3339 string, normalized to UTC
    Timestamp,
    /// Any JSON value stored verbatim
    Json,
}

impl ColumnKind {
    #[must_use]
    pub const fn sql_type(self, sqlite: bool) -> &'static str {
        match (self, sqlite) {
            (Self::Text, true) | (Self::Timestamp, true) | (Self::Json, true) => "TEXT",
            (Self::Text, false) => "VARCHAR(512)",
            (Self::Timestamp, false) => "VARCHAR(40)",
            (Self::Json, false) => "LONGTEXT",
            (Self::Integer, true) | (Self::Bool, true) => "INTEGER",
            (Self::Integer, false) => "BIGINT",
            (Self::Bool, false) => "TINYINT",
            (Self::Decimal, true) | (Self::Cents, true) => "REAL",
            (Self::Decimal, false) | (Self::Cents, false) => "DOUBLE",
        }
    }
}

#[derive(Debug)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// JSON pointers tried in order
    pub sources: &'static [&'static str],
}

const fn col(name: &'static str, kind: ColumnKind, sources: &'static [&'static str]) -> Column {
    Column { name, kind, sources }
}

#[derive(Debug)]
pub struct EntityMapping {
    pub entity: EntityType,
    pub table: &'static str,
    pub schema_version: u32,
    pub columns: &'static [Column],
    /// Pointers to the source's last-modified timestamp
    pub updated_at: &'static [&'static str],
}

use ColumnKind::{Bool, Cents, Decimal, Integer, Json, Text, Timestamp};

const UPDATED_AT: &[&str] = &["/last_updated", "/update_time", "/modification_time", "/date_updated"];

static CONTACT: EntityMapping = EntityMapping {
    entity: EntityType::Contact,
    table: "sync_contacts",
    schema_version: 2,
    columns: &[
        col("email", Text, &["/email_addresses/0/email", "/email", "/primary_email"]),
        col("given_name", Text, &["/given_name", "/first_name"]),
        col("family_name", Text, &["/family_name", "/last_name"]),
        col("company_name", Text, &["/company_name", "/company/company_name", "/company/name"]),
        col("phone", Text, &["/phone_numbers/0/number", "/phone"]),
        col("lifecycle_stage", Text, &["/lifecycle_stage"]),
        col("lead_score", Integer, &["/lead_score", "/score_value"]),
        col("tag_ids", Json, &["/tag_ids"]),
        col("custom_fields", Json, &["/custom_fields"]),
        col("addresses", Json, &["/addresses"]),
        col("date_created", Timestamp, &["/date_created", "/create_time", "/created_at"]),
    ],
    updated_at: UPDATED_AT,
};

static ORDER: EntityMapping = EntityMapping {
    entity: EntityType::Order,
    table: "sync_orders",
    schema_version: 2,
    columns: &[
        col("contact_source_id", Text, &["/contact/id", "/contact_id"]),
        col("contact_email", Text, &["/contact/email", "/contact/email_addresses/0/email"]),
        col("title", Text, &["/title", "/order_title"]),
        col("status", Text, &["/status"]),
        col("total_amount", Cents, &["/total/amount", "/total_in_cents"]),
        col("order_date", Timestamp, &["/order_time", "/order_date", "/creation_time"]),
        col("items", Json, &["/order_items", "/items"]),
    ],
    updated_at: UPDATED_AT,
};

static TAG: EntityMapping = EntityMapping {
    entity: EntityType::Tag,
    table: "sync_tags",
    schema_version: 1,
    columns: &[
        col("name", Text, &["/name"]),
        col("description", Text, &["/description"]),
        col("category", Text, &["/category/name", "/category"]),
    ],
    updated_at: UPDATED_AT,
};

static SUBSCRIPTION: EntityMapping = EntityMapping {
    entity: EntityType::Subscription,
    table: "sync_subscriptions",
    schema_version: 1,
    columns: &[
        col("contact_source_id", Text, &["/contact_id", "/contact/id"]),
        col("product_id", Text, &["/product_id", "/product/id"]),
        col("status", Text, &["/status"]),
        col("billing_cycle", Text, &["/billing_cycle", "/cycle"]),
        col("frequency", Integer, &["/frequency"]),
        col("billing_amount", Decimal, &["/billing_amount", "/subscription_plan/price"]),
        col("start_date", Timestamp, &["/start_date", "/next_bill_date"]),
        col("next_bill_date", Timestamp, &["/next_bill_date"]),
        col("end_date", Timestamp, &["/end_date"]),
        col("auto_charge", Bool, &["/auto_charge"]),
    ],
    updated_at: UPDATED_AT,
};

/// Mapping lookup. Indexed by entity, no string matching.
#[must_use]
pub fn mapping_for(entity: EntityType) -> &'static EntityMapping {
    match entity {
        EntityType::Contact => &CONTACT,
        EntityType::Order => &ORDER,
        EntityType::Tag => &TAG,
        EntityType::Subscription => &SUBSCRIPTION,
    }
}

impl EntityMapping {
    /// Map a raw payload to target columns. Every column is present in the
    /// result, `Null` when no source yielded a usable value.
    #[must_use]
    pub fn map_fields(&self, attributes: &Value) -> Map<String, Value> {
        self.columns
            .iter()
            .map(|column| {
                let value = column
                    .sources
                    .iter()
                    .filter_map(|pointer| attributes.pointer(pointer))
                    .find_map(|raw| coerce(column.kind, raw))
                    .unwrap_or(Value::Null);
                (column.name.to_string(), value)
            })
            .collect()
    }

    #[must_use]
    pub fn source_updated_at(&self, attributes: &Value) -> Option<DateTime<Utc>> {
        self.updated_at
            .iter()
            .filter_map(|pointer| attributes.pointer(pointer))
            .find_map(|raw| raw.as_str().and_then(parse_timestamp))
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}

/// Convert `raw` to the column's kind, or `None` when it can't be.
fn coerce(kind: ColumnKind, raw: &Value) -> Option<Value> {
    match (kind, raw) {
        (_, Value::Null) => None,
        (Json, v) => Some(v.clone()),

        (Text, Value::String(s)) => {
            let s = s.trim();
            (!s.is_empty()).then(|| Value::String(s.to_string()))
        }
        (Text, Value::Number(n)) => Some(Value::String(n.to_string())),
        (Text, Value::Bool(b)) => Some(Value::String(b.to_string())),

        (Integer, Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(Value::from),
        (Integer, Value::String(s)) => s.trim().parse::<i64>().ok().map(Value::from),

        (Decimal, Value::Number(n)) => n.as_f64().and_then(Number::from_f64).map(Value::Number),
        (Decimal, Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),

        (Cents, Value::Number(n)) => n
            .as_f64()
            .and_then(|cents| Number::from_f64(cents / 100.0))
            .map(Value::Number),

        (Bool, Value::Bool(b)) => Some(Value::Bool(*b)),
        (Bool, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(Value::Bool(true)),
            "false" | "no" | "0" => Some(Value::Bool(false)),
            _ => None,
        },
        (Bool, Value::Number(n)) => n.as_i64().map(|i| Value::Bool(i != 0)),

        (Timestamp, Value::String(s)) => {
            parse_timestamp(s).map(|ts| Value::String(ts.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
        }

        _ => None,
    }
}

/// RFC 3339 timestamps, or bare `YYYY-MM-DD` dates taken as midnight UTC.
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
