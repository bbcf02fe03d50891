//! Redaction and bounding of payload data before it reaches the logs.
//!
//! Webhook payloads carry phone numbers and occasionally credentials echoed
//! back by the provider. Nothing from a payload is logged without passing
//! through [`sanitize`] / [`preview`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

static SENSITIVE_KEY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)secret|token|password|authorization|auth|cipher|signature|api[-_]?key|bearer")
        .expect("sensitive key pattern")
});

static PHONE_KEY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)phone|msisdn|wa[-_]?id|whatsapp").expect("phone key pattern"));

static PHONE_VALUE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[\d\s().-]+$").expect("phone value pattern"));

/// Caps applied while sanitizing a payload tree.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_string: usize,
    pub max_depth: usize,
    pub max_items: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_string: 256,
            max_depth: 6,
            max_items: 50,
        }
    }
}

/// Mask a phone-like value down to its last four digits.
fn mask_phone(raw: &str) -> String {
    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    let tail: String = digits
        .iter()
        .skip(digits.len().saturating_sub(4))
        .collect();
    format!("***{}", tail)
}

fn looks_like_phone(value: &str) -> bool {
    if !PHONE_VALUE_RE.is_match(value) {
        return false;
    }
    let digits = value.chars().filter(|c| c.is_ascii_digit()).count();
    (8..=15).contains(&digits)
}

fn bounded_string(s: &str, max: usize) -> Value {
    let total = s.chars().count();
    if total <= max {
        return Value::String(s.to_string());
    }
    let kept: String = s.chars().take(max).collect();
    Value::String(format!("{}[truncated:{}]", kept, total))
}

fn sanitize_string(s: &str, limits: &Limits) -> Value {
    if looks_like_phone(s) {
        Value::String(mask_phone(s))
    } else {
        bounded_string(s, limits.max_string)
    }
}

fn sanitize_at(value: &Value, limits: &Limits, depth: usize) -> Value {
    match value {
        Value::Object(map) => {
            if depth >= limits.max_depth {
                return Value::String("[MaxDepth]".into());
            }
            let mut out = Map::new();
            for (i, (key, v)) in map.iter().enumerate() {
                if i >= limits.max_items {
                    out.insert("_truncated".into(), Value::from(map.len() - limits.max_items));
                    break;
                }
                if SENSITIVE_KEY_RE.is_match(key) {
                    out.insert(key.clone(), Value::String("[REDACTED]".into()));
                } else if PHONE_KEY_RE.is_match(key) {
                    match v {
                        Value::String(s) => {
                            out.insert(key.clone(), Value::String(mask_phone(s)));
                        }
                        Value::Number(n) => {
                            out.insert(key.clone(), Value::String(mask_phone(&n.to_string())));
                        }
                        other => {
                            out.insert(key.clone(), sanitize_at(other, limits, depth + 1));
                        }
                    }
                } else {
                    out.insert(key.clone(), sanitize_at(v, limits, depth + 1));
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            if depth >= limits.max_depth {
                return Value::String("[MaxDepth]".into());
            }
            let mut out: Vec<Value> = items
                .iter()
                .take(limits.max_items)
                .map(|v| sanitize_at(v, limits, depth + 1))
                .collect();
            if items.len() > limits.max_items {
                out.push(Value::String(format!(
                    "[+{} more]",
                    items.len() - limits.max_items
                )));
            }
            Value::Array(out)
        }
        Value::String(s) => sanitize_string(s, limits),
        other => other.clone(),
    }
}

/// Produce a copy of `value` safe to log: sensitive keys replaced with
/// `[REDACTED]`, phone-like values masked to their last four digits, strings
/// and containers bounded.
pub fn sanitize(value: &Value, limits: &Limits) -> Value {
    sanitize_at(value, limits, 0)
}

/// One-line bounded preview of a payload for log fields.
pub fn preview(value: &Value, max_chars: usize) -> String {
    let rendered = sanitize(value, &Limits::default()).to_string();
    let total = rendered.chars().count();
    if total <= max_chars {
        return rendered;
    }
    let kept: String = rendered.chars().take(max_chars).collect();
    format!("{}[truncated:{}]", kept, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sensitive_keys_are_redacted() {
        let input = json!({
            "apiKey": "sk-123",
            "X-Gupshup-Secret": "hunter2",
            "Authorization": "Bearer abc",
            "nested": {"password": "pw", "fine": "value"}
        });
        let out = sanitize(&input, &Limits::default());
        assert_eq!(out["apiKey"], "[REDACTED]");
        assert_eq!(out["X-Gupshup-Secret"], "[REDACTED]");
        assert_eq!(out["Authorization"], "[REDACTED]");
        assert_eq!(out["nested"]["password"], "[REDACTED]");
        assert_eq!(out["nested"]["fine"], "value");
    }

    #[test]
    fn phone_keys_and_values_are_masked() {
        let input = json!({
            "phone": "+15551234567",
            "wa_id": "5511999887766",
            "destination": "+55 11 98888-7777",
            "note": "call +1 555 000"
        });
        let out = sanitize(&input, &Limits::default());
        assert_eq!(out["phone"], "***4567");
        assert_eq!(out["wa_id"], "***7766");
        // Value looks like a phone even though the key doesn't match.
        assert_eq!(out["destination"], "***7777");
        // Fewer than 8 digits and not a pure phone string: untouched.
        assert_eq!(out["note"], "call +1 555 000");
    }

    #[test]
    fn numeric_phone_under_phone_key_is_masked() {
        let input = json!({"msisdn": 5511999887766u64});
        let out = sanitize(&input, &Limits::default());
        assert_eq!(out["msisdn"], "***7766");
    }

    #[test]
    fn long_strings_are_truncated_with_marker() {
        let long = "x".repeat(300);
        let out = sanitize(&json!({ "body": long }), &Limits::default());
        let rendered = out["body"].as_str().unwrap();
        assert!(rendered.ends_with("[truncated:300]"));
        assert!(rendered.len() < 300);
    }

    #[test]
    fn depth_and_breadth_are_capped() {
        let deep = json!({"a": {"b": {"c": {"d": {"e": {"f": {"g": 1}}}}}}});
        let out = sanitize(&deep, &Limits { max_depth: 3, ..Limits::default() });
        assert_eq!(out["a"]["b"]["c"], "[MaxDepth]");

        let wide: Vec<i64> = (0..60).collect();
        let out = sanitize(&json!(wide), &Limits::default());
        let arr = out.as_array().unwrap();
        assert_eq!(arr.len(), 51);
        assert_eq!(arr[50], "[+10 more]");
    }

    #[test]
    fn preview_is_bounded() {
        let payload = json!({"data": "y".repeat(100)});
        let p = preview(&payload, 40);
        assert!(p.chars().count() < 70);
        assert!(p.contains("[truncated:"));
    }

    #[test]
    fn no_unmasked_long_digit_runs_survive() {
        let input = json!({
            "statuses": [{"id": "gs-1", "destination": "15551234567"}],
            "contact": {"whatsappNumber": "+55 11 91234-5678"}
        });
        let rendered = sanitize(&input, &Limits::default()).to_string();
        let digit_runs: Vec<&str> = rendered
            .split(|c: char| !c.is_ascii_digit())
            .filter(|run| run.len() >= 5)
            .collect();
        assert!(digit_runs.is_empty(), "leaked digits: {digit_runs:?}");
    }
}
