//! Idempotency-key construction and soft payload parsing for the ingest path.
//!
//! The dedupe key is a contract: identical inputs under the same rule yield
//! identical keys across restarts and replicas, so the UNIQUE constraint on
//! the raw table absorbs every provider redelivery.

use chrono::SecondsFormat;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::model::EventKind;
use crate::normalizer::Hints;

/// Build the SHA-256 hex dedupe key for an incoming event.
///
/// Material, in priority order:
/// 1. `appId|kind|providerEventId` when the provider names the event;
/// 2. `appId|kind|messageId?|eventStatus?|isoTimestamp?` when any of those
///    hints exist (absent parts stay empty);
/// 3. the full raw request body otherwise.
pub fn dedupe_key(app_id: &str, kind: EventKind, hints: &Hints, raw_body: &str) -> String {
    let material = if let Some(provider_event_id) = &hints.provider_event_id {
        format!("{}|{}|{}", app_id, kind.as_str(), provider_event_id)
    } else if hints.message_id.is_some() || hints.event_status.is_some() || hints.event_at.is_some()
    {
        format!(
            "{}|{}|{}|{}|{}",
            app_id,
            kind.as_str(),
            hints.message_id.as_deref().unwrap_or(""),
            hints.event_status.as_deref().unwrap_or(""),
            hints
                .event_at
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
                .unwrap_or_default(),
        )
    } else {
        raw_body.to_string()
    };
    format!("{:x}", Sha256::digest(material.as_bytes()))
}

/// Soft-parse a request body. Empty bodies and non-JSON text are wrapped
/// instead of rejected; ingestion never fails on payload shape.
pub fn parse_payload_json(body: &str) -> Value {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return json!({ "_raw": body, "_empty": true });
    }
    match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => json!({ "_raw": body, "_format": "text/plain" }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn hints_with_provider_id() -> Hints {
        Hints {
            provider_event_id: Some("ev-42".into()),
            message_id: Some("gs-1".into()),
            event_status: Some("delivered".into()),
            ..Hints::default()
        }
    }

    #[test]
    fn provider_event_id_dominates() {
        let a = dedupe_key("app", EventKind::Message, &hints_with_provider_id(), "{}");
        let mut other = hints_with_provider_id();
        other.message_id = Some("different".into());
        let b = dedupe_key("app", EventKind::Message, &other, r#"{"x":1}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn key_is_64_hex_chars() {
        let key = dedupe_key("app", EventKind::Unknown, &Hints::default(), "raw body");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hint_material_distinguishes_status() {
        let at = Utc.timestamp_millis_opt(1_739_112_000_000).unwrap();
        let delivered = Hints {
            message_id: Some("gs-1".into()),
            event_status: Some("delivered".into()),
            event_at: Some(at),
            ..Hints::default()
        };
        let read = Hints {
            event_status: Some("read".into()),
            ..delivered.clone()
        };
        assert_ne!(
            dedupe_key("app", EventKind::Message, &delivered, "{}"),
            dedupe_key("app", EventKind::Message, &read, "{}"),
        );
    }

    #[test]
    fn app_id_scopes_the_key() {
        let hints = Hints {
            message_id: Some("gs-1".into()),
            ..Hints::default()
        };
        assert_ne!(
            dedupe_key("app-a", EventKind::Message, &hints, "{}"),
            dedupe_key("app-b", EventKind::Message, &hints, "{}"),
        );
    }

    #[test]
    fn bare_body_fallback_hashes_the_body() {
        let a = dedupe_key("app", EventKind::Unknown, &Hints::default(), "hello");
        let b = dedupe_key("app", EventKind::Unknown, &Hints::default(), "hello");
        let c = dedupe_key("app", EventKind::Unknown, &Hints::default(), "hello!");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn soft_parse_shapes() {
        assert_eq!(
            parse_payload_json(""),
            json!({ "_raw": "", "_empty": true })
        );
        assert_eq!(
            parse_payload_json("not json"),
            json!({ "_raw": "not json", "_format": "text/plain" })
        );
        assert_eq!(parse_payload_json(r#"{"a":1}"#), json!({ "a": 1 }));
    }
}
