//! Database entity and view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::model::EventKind;
use crate::normalizer::Hints;

/// Insert payload for the raw webhook buffer.
#[derive(Debug)]
pub struct NewRawEvent<'a> {
    pub app_id: &'a str,
    pub event_kind: EventKind,
    pub hints: &'a Hints,
    pub payload_json: &'a Value,
    pub dedupe_key: &'a str,
}

/// A pending raw event as claimed by the worker.
#[derive(Debug, Clone)]
pub struct RawEventRow {
    pub id: u64,
    pub app_id: String,
    pub event_kind: EventKind,
    pub payload_json: Value,
    pub attempts: i32,
    pub received_at: DateTime<Utc>,
}

/// Active provider-account mapping consulted by template and user
/// projections.
#[derive(Debug, Clone, Copy)]
pub struct Integration {
    pub id: i64,
    pub company_id: i64,
}
