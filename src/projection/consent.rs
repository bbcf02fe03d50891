//! Marketing consent projection.
//!
//! Consent events are appended verbatim; the current stance per
//! (user, company) is an aggregate derived purely from the latest opt-in and
//! opt-out timestamps, recomputed under a row lock on every event.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use sqlx::Row;
use tracing::instrument;

use crate::db::{Integration, Tx};
use crate::model::{ConsentEventType, ConsentSignal, ConsentStatus};
use crate::normalizer::UserEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentOutcome {
    Applied,
    UserNotFound,
    DroppedBlocked,
}

/// Same whitelist the config layer enforces. Revalidated here because the
/// column name is interpolated into SQL below.
static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier pattern"));

/// Map an incoming signal to the event type actually recorded. BLOCKED
/// becomes an opt-out when configured, otherwise the event is dropped.
pub fn effective_event_type(
    signal: ConsentSignal,
    blocked_as_opt_out: bool,
) -> Option<ConsentEventType> {
    match signal {
        ConsentSignal::OptIn => Some(ConsentEventType::OptIn),
        ConsentSignal::OptOut => Some(ConsentEventType::OptOut),
        ConsentSignal::Blocked => blocked_as_opt_out.then_some(ConsentEventType::OptOut),
    }
}

/// Aggregate stance from the two watermark timestamps; a tie resolves to
/// opt-in.
pub fn recompute_status(
    last_opt_in_at: Option<DateTime<Utc>>,
    last_opt_out_at: Option<DateTime<Utc>>,
) -> ConsentStatus {
    match (last_opt_in_at, last_opt_out_at) {
        (None, None) => ConsentStatus::Unknown,
        (Some(_), None) => ConsentStatus::OptIn,
        (None, Some(_)) => ConsentStatus::OptOut,
        (Some(opt_in), Some(opt_out)) => {
            if opt_in >= opt_out {
                ConsentStatus::OptIn
            } else {
                ConsentStatus::OptOut
            }
        }
    }
}

/// Append one consent event and refresh the aggregate. The caller guarantees
/// a phone and a consent signal are present.
#[instrument(skip_all)]
pub async fn apply_consent_event(
    tx: &mut Tx<'_>,
    integration: &Integration,
    event: &UserEvent,
    phone_column: &str,
    blocked_as_opt_out: bool,
) -> Result<ConsentOutcome> {
    let (Some(signal), Some(phone)) = (event.consent, &event.phone) else {
        return Ok(ConsentOutcome::UserNotFound);
    };
    let Some(event_type) = effective_event_type(signal, blocked_as_opt_out) else {
        return Ok(ConsentOutcome::DroppedBlocked);
    };

    let Some(user_id) = resolve_user_id(tx, phone_column, phone).await? else {
        return Ok(ConsentOutcome::UserNotFound);
    };

    let event_at = event.event_at.unwrap_or_else(Utc::now);
    sqlx::query(
        "INSERT INTO marketing_consent_event (user_id, company_id, event_type, event_at) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(integration.company_id)
    .bind(event_type.as_str())
    .bind(event_at)
    .execute(&mut **tx)
    .await
    .context("failed to append consent event")?;

    upsert_current(tx, user_id, integration.company_id, event_type, event_at).await?;
    Ok(ConsentOutcome::Applied)
}

async fn resolve_user_id(
    tx: &mut Tx<'_>,
    phone_column: &str,
    phone: &str,
) -> Result<Option<i64>> {
    if !IDENTIFIER_RE.is_match(phone_column) {
        anyhow::bail!("refusing to interpolate phone column {phone_column:?}");
    }
    let sql = format!("SELECT id FROM `user` WHERE `{}` = ? LIMIT 1", phone_column);
    sqlx::query_scalar::<_, i64>(&sql)
        .bind(phone)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to resolve user by phone")
}

/// Refresh the aggregate under a row lock: advance the matching watermark,
/// carry the other, recompute the stance.
async fn upsert_current(
    tx: &mut Tx<'_>,
    user_id: i64,
    company_id: i64,
    event_type: ConsentEventType,
    event_at: DateTime<Utc>,
) -> Result<()> {
    let existing = sqlx::query(
        "SELECT last_opt_in_at, last_opt_out_at \
         FROM marketing_consent_current \
         WHERE user_id = ? AND company_id = ? \
         FOR UPDATE",
    )
    .bind(user_id)
    .bind(company_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to lock consent aggregate")?;

    let (mut last_opt_in_at, mut last_opt_out_at) = match &existing {
        Some(row) => (
            row.get::<Option<DateTime<Utc>>, _>("last_opt_in_at"),
            row.get::<Option<DateTime<Utc>>, _>("last_opt_out_at"),
        ),
        None => (None, None),
    };
    match event_type {
        ConsentEventType::OptIn => {
            last_opt_in_at = Some(last_opt_in_at.map_or(event_at, |at| at.max(event_at)));
        }
        ConsentEventType::OptOut => {
            last_opt_out_at = Some(last_opt_out_at.map_or(event_at, |at| at.max(event_at)));
        }
    }
    let status = recompute_status(last_opt_in_at, last_opt_out_at);

    if existing.is_some() {
        sqlx::query(
            "UPDATE marketing_consent_current \
             SET status = ?, last_opt_in_at = ?, last_opt_out_at = ?, updated_at = NOW() \
             WHERE user_id = ? AND company_id = ?",
        )
        .bind(status.as_str())
        .bind(last_opt_in_at)
        .bind(last_opt_out_at)
        .bind(user_id)
        .bind(company_id)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            "INSERT INTO marketing_consent_current \
             (user_id, company_id, status, last_opt_in_at, last_opt_out_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, NOW())",
        )
        .bind(user_id)
        .bind(company_id)
        .bind(status.as_str())
        .bind(last_opt_in_at)
        .bind(last_opt_out_at)
        .execute(&mut **tx)
        .await
    }
    .context("failed to upsert consent aggregate")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn blocked_mapping_follows_flag() {
        assert_eq!(
            effective_event_type(ConsentSignal::Blocked, true),
            Some(ConsentEventType::OptOut)
        );
        assert_eq!(effective_event_type(ConsentSignal::Blocked, false), None);
        assert_eq!(
            effective_event_type(ConsentSignal::OptIn, false),
            Some(ConsentEventType::OptIn)
        );
        assert_eq!(
            effective_event_type(ConsentSignal::OptOut, false),
            Some(ConsentEventType::OptOut)
        );
    }

    #[test]
    fn status_derivation() {
        assert_eq!(recompute_status(None, None), ConsentStatus::Unknown);
        assert_eq!(recompute_status(Some(ts(10)), None), ConsentStatus::OptIn);
        assert_eq!(recompute_status(None, Some(ts(10))), ConsentStatus::OptOut);
        assert_eq!(
            recompute_status(Some(ts(20)), Some(ts(10))),
            ConsentStatus::OptIn
        );
        assert_eq!(
            recompute_status(Some(ts(10)), Some(ts(20))),
            ConsentStatus::OptOut
        );
    }

    #[test]
    fn ties_resolve_to_opt_in() {
        assert_eq!(
            recompute_status(Some(ts(10)), Some(ts(10))),
            ConsentStatus::OptIn
        );
    }
}
