//! Schema-tolerant extraction of a typed event from heterogeneous provider
//! payloads.
//!
//! Providers emit several payload generations for the same logical event, so
//! extraction never binds to one shape. Every field is resolved by a
//! prioritized dotted-path probe first and a breadth-first case-insensitive
//! key search as fallback; the first non-empty hit wins.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::collections::VecDeque;

use crate::model::{ConsentSignal, EventKind, MessageStatus, TemplateStatus};

/// Typed view of a message delivery receipt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageEvent {
    pub message_id: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub status: Option<MessageStatus>,
    pub raw_status: Option<String>,
    pub event_at: Option<DateTime<Utc>>,
    pub error_code: Option<String>,
    pub error_reason: Option<String>,
    pub error_payload: Option<Value>,
}

/// Typed view of a template lifecycle event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemplateEvent {
    pub name: Option<String>,
    pub provider_id: Option<String>,
    pub status: Option<TemplateStatus>,
    pub raw_status: Option<String>,
    pub language: Option<String>,
    pub rejection_reason: Option<String>,
    pub correct_category: Option<String>,
    pub event_at: Option<DateTime<Utc>>,
}

/// Typed view of a user consent event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserEvent {
    pub phone: Option<String>,
    pub consent: Option<ConsentSignal>,
    pub event_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedEvent {
    Message(MessageEvent),
    Template(TemplateEvent),
    User(UserEvent),
    Unknown,
}

/// Result of normalizing a payload: the typed variant plus the provider's own
/// event id when it carries one.
#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub provider_event_id: Option<String>,
    pub event: NormalizedEvent,
}

/// Denormalized lookup hints persisted next to the raw payload. The payload
/// stays authoritative; these exist for dedupe-key material and operator
/// queries only.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hints {
    pub provider_event_id: Option<String>,
    pub message_id: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub template_name: Option<String>,
    pub template_provider_id: Option<String>,
    pub event_status: Option<String>,
    pub event_at: Option<DateTime<Utc>>,
}

impl Normalized {
    pub fn kind(&self) -> EventKind {
        match &self.event {
            NormalizedEvent::Message(_) => EventKind::Message,
            NormalizedEvent::Template(_) => EventKind::Template,
            NormalizedEvent::User(_) => EventKind::User,
            NormalizedEvent::Unknown => EventKind::Unknown,
        }
    }

    pub fn hints(&self) -> Hints {
        let mut hints = Hints {
            provider_event_id: self.provider_event_id.clone(),
            ..Hints::default()
        };
        match &self.event {
            NormalizedEvent::Message(ev) => {
                hints.message_id = ev.message_id.clone();
                hints.whatsapp_message_id = ev.whatsapp_message_id.clone();
                hints.event_status = ev
                    .status
                    .map(|s| s.as_str().to_string())
                    .or_else(|| ev.raw_status.clone());
                hints.event_at = ev.event_at;
            }
            NormalizedEvent::Template(ev) => {
                hints.template_name = ev.name.clone();
                hints.template_provider_id = ev.provider_id.clone();
                hints.event_status = ev
                    .status
                    .map(|s| s.as_str().to_string())
                    .or_else(|| ev.raw_status.clone());
                hints.event_at = ev.event_at;
            }
            NormalizedEvent::User(ev) => {
                hints.event_status = ev.consent.map(|c| c.as_str().to_string());
                hints.event_at = ev.event_at;
            }
            NormalizedEvent::Unknown => {}
        }
        hints
    }
}

const PROVIDER_EVENT_ID_PATHS: &[&str] = &[
    "eventId",
    "event_id",
    "payload.eventId",
    "payload.event_id",
    "webhookEventId",
];

const MESSAGE_ID_PATHS: &[&str] = &[
    "statuses[0].id",
    "messages[0].id",
    "payload.id",
    "payload.gsId",
    "messageId",
    "message.id",
];
const MESSAGE_ID_KEYS: &[&str] = &["messageid", "gsid"];

const WA_MESSAGE_ID_PATHS: &[&str] = &[
    "statuses[0].meta.whatsappMessageId",
    "payload.whatsappMessageId",
    "payload.meta.whatsappMessageId",
    "whatsappMessageId",
];
const WA_MESSAGE_ID_KEYS: &[&str] = &["whatsappmessageid", "wamid"];

const MESSAGE_STATUS_PATHS: &[&str] = &[
    "statuses[0].status",
    "payload.type",
    "messageStatus",
    "status",
];

const TEMPLATE_STATUS_PATHS: &[&str] = &[
    "template.status",
    "payload.status",
    "templateStatus",
    "status",
];
const TEMPLATE_NAME_PATHS: &[&str] = &[
    "template.name",
    "payload.elementName",
    "elementName",
    "templateName",
];
const TEMPLATE_NAME_KEYS: &[&str] = &["elementname", "templatename"];
const TEMPLATE_PROVIDER_ID_PATHS: &[&str] = &[
    "template.id",
    "payload.templateId",
    "templateId",
    "payload.id",
];
const TEMPLATE_LANGUAGE_PATHS: &[&str] = &[
    "template.language",
    "payload.languageCode",
    "languageCode",
    "language",
];
const TEMPLATE_REASON_PATHS: &[&str] = &[
    "template.reason",
    "payload.rejectedReason",
    "rejectedReason",
    "reason",
];
const TEMPLATE_CATEGORY_PATHS: &[&str] = &[
    "template.category",
    "payload.correctCategory",
    "correctCategory",
];

const EVENT_HINT_PATHS: &[&str] = &["event", "type", "eventType", "event_type", "payload.type"];

const CONSENT_PATHS: &[&str] = &["payload.type", "payload.event", "event", "action", "type"];

const PHONE_PATHS: &[&str] = &[
    "payload.phone",
    "payload.source",
    "payload.wa_id",
    "sender.phone",
    "phone",
    "destination",
];
const PHONE_KEYS: &[&str] = &["phone", "msisdn", "waid", "wa_id"];

const TIMESTAMP_PATHS: &[&str] = &[
    "statuses[0].timestamp",
    "messages[0].timestamp",
    "payload.timestamp",
    "payload.payload.ts",
    "timestamp",
    "ts",
];
const TIMESTAMP_KEYS: &[&str] = &["timestamp"];

const ERROR_CODE_PATHS: &[&str] = &[
    "statuses[0].errors[0].code",
    "messages[0].errors[0].code",
    "payload.payload.code",
    "errors[0].code",
];
const ERROR_REASON_PATHS: &[&str] = &[
    "statuses[0].errors[0].message",
    "statuses[0].errors[0].title",
    "messages[0].errors[0].message",
    "payload.payload.reason",
    "errors[0].message",
    "errors[0].title",
];
const ERROR_PAYLOAD_PATHS: &[&str] = &[
    "statuses[0].errors",
    "messages[0].errors",
    "errors",
    "payload.payload",
];

/// Classify a payload and extract the typed event. Variants are tried in
/// order (template, message, user); the first match wins.
pub fn normalize(payload: &Value) -> Normalized {
    let provider_event_id = extract_string(payload, PROVIDER_EVENT_ID_PATHS, &[]);
    let event_at = extract_timestamp(payload);

    let template_raw_status = extract_string(payload, TEMPLATE_STATUS_PATHS, &[]);
    let template_status = template_raw_status
        .as_deref()
        .and_then(TemplateStatus::parse_token);
    let template_name = extract_string(payload, TEMPLATE_NAME_PATHS, TEMPLATE_NAME_KEYS);
    let template_provider_id = extract_string(payload, TEMPLATE_PROVIDER_ID_PATHS, &[]);
    let hint_is_template = extract_string(payload, EVENT_HINT_PATHS, &[])
        .map(|h| h.to_ascii_lowercase().contains("template"))
        .unwrap_or(false);

    let has_template_signal = template_raw_status.is_some()
        || template_name.is_some()
        || template_provider_id.is_some();
    if has_template_signal && (template_status.is_some() || hint_is_template) {
        return Normalized {
            provider_event_id,
            event: NormalizedEvent::Template(TemplateEvent {
                name: template_name,
                provider_id: template_provider_id,
                status: template_status,
                raw_status: template_raw_status,
                language: extract_string(payload, TEMPLATE_LANGUAGE_PATHS, &[]),
                rejection_reason: extract_string(payload, TEMPLATE_REASON_PATHS, &[]),
                correct_category: extract_string(payload, TEMPLATE_CATEGORY_PATHS, &[]),
                event_at,
            }),
        };
    }

    let message_id = extract_string(payload, MESSAGE_ID_PATHS, MESSAGE_ID_KEYS);
    let whatsapp_message_id = extract_string(payload, WA_MESSAGE_ID_PATHS, WA_MESSAGE_ID_KEYS);
    let message_raw_status = extract_string(payload, MESSAGE_STATUS_PATHS, &[]);
    let message_status = message_raw_status
        .as_deref()
        .and_then(MessageStatus::parse_token);

    // A template name with no message id at all means the payload is about a
    // template, not a message; don't claim it just because a status-looking
    // token happened to match.
    let pure_template = template_name.is_some()
        && message_id.is_none()
        && whatsapp_message_id.is_none();
    if (message_id.is_some() || whatsapp_message_id.is_some() || message_status.is_some())
        && !pure_template
    {
        return Normalized {
            provider_event_id,
            event: NormalizedEvent::Message(MessageEvent {
                message_id,
                whatsapp_message_id,
                status: message_status,
                raw_status: message_raw_status,
                event_at,
                error_code: extract_string(payload, ERROR_CODE_PATHS, &[]),
                error_reason: extract_string(payload, ERROR_REASON_PATHS, &[]),
                error_payload: extract_value(payload, ERROR_PAYLOAD_PATHS, &[]).cloned(),
            }),
        };
    }

    let consent = extract_string(payload, CONSENT_PATHS, &[])
        .as_deref()
        .and_then(ConsentSignal::parse_token);
    let phone = extract_string(payload, PHONE_PATHS, PHONE_KEYS).and_then(normalize_phone);
    if consent.is_some() || phone.is_some() {
        return Normalized {
            provider_event_id,
            event: NormalizedEvent::User(UserEvent {
                phone,
                consent,
                event_at,
            }),
        };
    }

    Normalized {
        provider_event_id,
        event: NormalizedEvent::Unknown,
    }
}

/// Strip all whitespace from a phone-like value. Full E.164 validation is
/// deliberately not done here; identity is resolved at projection time.
pub fn normalize_phone(raw: String) -> Option<String> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

fn is_empty_value(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        _ => false,
    }
}

/// Resolve one dotted path with optional `[idx]` segments, e.g.
/// `statuses[0].errors[0].code`.
fn probe_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let (name, indexes) = split_segment(segment)?;
        if !name.is_empty() {
            current = current.as_object()?.get(name)?;
        }
        for idx in indexes {
            current = current.as_array()?.get(idx)?;
        }
    }
    Some(current)
}

/// Split `name[0][1]` into `("name", [0, 1])`. Returns None on malformed
/// segments so a bad probe path can never panic.
fn split_segment(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let name = &segment[..pos];
            let mut indexes = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(stripped) = rest.strip_prefix('[') {
                let end = stripped.find(']')?;
                indexes.push(stripped[..end].parse().ok()?);
                rest = &stripped[end + 1..];
            }
            if rest.is_empty() {
                Some((name, indexes))
            } else {
                None
            }
        }
    }
}

/// Breadth-first walk over the payload tree, matching keys case-insensitively
/// against an allowlist. Used as a fallback when no probe path hits.
fn search_key<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    let mut queue = VecDeque::new();
    queue.push_back(value);
    while let Some(current) = queue.pop_front() {
        match current {
            Value::Object(map) => {
                for (k, v) in map {
                    let lowered = k.to_ascii_lowercase();
                    if keys.iter().any(|key| *key == lowered) && !is_empty_value(v) {
                        return Some(v);
                    }
                }
                queue.extend(map.values());
            }
            Value::Array(items) => queue.extend(items.iter()),
            _ => {}
        }
    }
    None
}

fn extract_value<'a>(value: &'a Value, paths: &[&str], keys: &[&str]) -> Option<&'a Value> {
    for path in paths {
        if let Some(found) = probe_path(value, path) {
            if !is_empty_value(found) {
                return Some(found);
            }
        }
    }
    if keys.is_empty() {
        None
    } else {
        search_key(value, keys)
    }
}

fn extract_string(value: &Value, paths: &[&str], keys: &[&str]) -> Option<String> {
    extract_value(value, paths, keys).and_then(value_to_string)
}

fn value_to_string(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn extract_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    extract_value(value, TIMESTAMP_PATHS, TIMESTAMP_KEYS).and_then(coerce_timestamp)
}

/// Accepts epoch seconds (≤ 10 digits), epoch milliseconds, or ISO-8601
/// strings. Anything else is treated as absent.
pub fn coerce_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    match v {
        Value::Number(n) => {
            let raw = n.as_i64()?;
            epoch_to_utc(raw)
        }
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return None;
            }
            if trimmed.chars().all(|c| c.is_ascii_digit()) {
                epoch_to_utc(trimmed.parse().ok()?)
            } else {
                DateTime::parse_from_rfc3339(trimmed)
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }
        }
        _ => None,
    }
}

fn epoch_to_utc(raw: i64) -> Option<DateTime<Utc>> {
    // Ten digits or fewer means seconds; anything longer is already millis.
    let millis = if raw.abs() <= 9_999_999_999 {
        raw.checked_mul(1000)?
    } else {
        raw
    };
    Utc.timestamp_millis_opt(millis).single()
}
