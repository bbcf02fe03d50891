//! Template lifecycle projection.
//!
//! Template status flows from the provider to the template row and its latest
//! version. Rejection metadata lives only on REJECTED rows; first-occurrence
//! timestamps on the version fill once and never move.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::Row;
use tracing::instrument;

use crate::db::{Integration, Tx};
use crate::model::TemplateStatus;
use crate::normalizer::TemplateEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateOutcome {
    Updated,
    NotFound,
}

struct VersionRow {
    id: i64,
    submitted_at: Option<DateTime<Utc>>,
    approved_at: Option<DateTime<Utc>>,
    rejected_at: Option<DateTime<Utc>>,
}

/// Apply a template lifecycle event for the given integration. The caller
/// guarantees `event.status` is recognized.
#[instrument(skip_all)]
pub async fn apply_template_event(
    tx: &mut Tx<'_>,
    integration: &Integration,
    event: &TemplateEvent,
) -> Result<TemplateOutcome> {
    let Some(status) = event.status else {
        return Ok(TemplateOutcome::NotFound);
    };
    let Some(template_id) = resolve_template_id(tx, integration, event).await? else {
        return Ok(TemplateOutcome::NotFound);
    };

    let rejected = status == TemplateStatus::Rejected;
    sqlx::query(
        "UPDATE whatsapp_template \
         SET status = ?, rejection_reason = ?, correct_category = ?, \
             last_synced_at = NOW(), updated_at = NOW() \
         WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(rejected.then(|| event.rejection_reason.clone()).flatten())
    .bind(rejected.then(|| event.correct_category.clone()).flatten())
    .bind(template_id)
    .execute(&mut **tx)
    .await
    .context("failed to update template")?;

    update_latest_version(tx, template_id, status, event).await?;
    Ok(TemplateOutcome::Updated)
}

/// Resolve template identity: by provider template id when the event carries
/// one, otherwise by company + name (+ language), newest row first.
async fn resolve_template_id(
    tx: &mut Tx<'_>,
    integration: &Integration,
    event: &TemplateEvent,
) -> Result<Option<i64>> {
    if let Some(provider_id) = &event.provider_id {
        let id = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM whatsapp_template \
             WHERE integration_id = ? AND provider_template_id = ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(integration.id)
        .bind(provider_id)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to look up template by provider id")?;
        return Ok(id);
    }

    let Some(name) = &event.name else {
        return Ok(None);
    };
    let id = if let Some(language) = &event.language {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM whatsapp_template \
             WHERE company_id = ? AND name = ? AND language = ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(integration.company_id)
        .bind(name)
        .bind(language)
        .fetch_optional(&mut **tx)
        .await
    } else {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM whatsapp_template \
             WHERE company_id = ? AND name = ? \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(integration.company_id)
        .bind(name)
        .fetch_optional(&mut **tx)
        .await
    }
    .context("failed to look up template by name")?;
    Ok(id)
}

/// Mirror the status onto the latest version row, selected under a row lock
/// so concurrent lifecycle events for the same template serialize.
async fn update_latest_version(
    tx: &mut Tx<'_>,
    template_id: i64,
    status: TemplateStatus,
    event: &TemplateEvent,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT id, submitted_at, approved_at, rejected_at \
         FROM whatsapp_template_version \
         WHERE template_id = ? \
         ORDER BY version_no DESC LIMIT 1 \
         FOR UPDATE",
    )
    .bind(template_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to lock latest template version")?;
    let Some(row) = row else {
        // A template without versions is legal; the template row already
        // carries the status.
        return Ok(());
    };
    let version = VersionRow {
        id: row.get("id"),
        submitted_at: row.get("submitted_at"),
        approved_at: row.get("approved_at"),
        rejected_at: row.get("rejected_at"),
    };

    let now = Utc::now();
    let (submitted_at, approved_at, rejected_at) = version_timestamps(&version, status, now);
    let rejected = status == TemplateStatus::Rejected;

    if rejected {
        sqlx::query(
            "UPDATE whatsapp_template_version \
             SET status = ?, submitted_at = ?, approved_at = ?, rejected_at = ?, \
                 rejection_reason = ?, updated_at = NOW() \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(submitted_at)
        .bind(approved_at)
        .bind(rejected_at)
        .bind(event.rejection_reason.as_deref())
        .bind(version.id)
        .execute(&mut **tx)
        .await
    } else {
        sqlx::query(
            "UPDATE whatsapp_template_version \
             SET status = ?, submitted_at = ?, approved_at = ?, rejected_at = ?, \
                 updated_at = NOW() \
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(submitted_at)
        .bind(approved_at)
        .bind(rejected_at)
        .bind(version.id)
        .execute(&mut **tx)
        .await
    }
    .context("failed to update template version")?;
    Ok(())
}

/// First-occurrence timestamps for the version row: the slot matching the
/// incoming status fills if (and only if) it is still null.
fn version_timestamps(
    version: &VersionRow,
    status: TemplateStatus,
    now: DateTime<Utc>,
) -> (
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
    Option<DateTime<Utc>>,
) {
    let mut submitted_at = version.submitted_at;
    let mut approved_at = version.approved_at;
    let mut rejected_at = version.rejected_at;
    match status {
        TemplateStatus::Submitted => submitted_at = submitted_at.or(Some(now)),
        TemplateStatus::Approved => approved_at = approved_at.or(Some(now)),
        TemplateStatus::Rejected => rejected_at = rejected_at.or(Some(now)),
        TemplateStatus::Draft | TemplateStatus::Pending => {}
    }
    (submitted_at, approved_at, rejected_at)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn version() -> VersionRow {
        VersionRow {
            id: 1,
            submitted_at: None,
            approved_at: None,
            rejected_at: None,
        }
    }

    fn ts(millis: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    #[test]
    fn approval_fills_approved_at_once() {
        let now = ts(10_000);
        let (s, a, r) = version_timestamps(&version(), TemplateStatus::Approved, now);
        assert_eq!((s, a, r), (None, Some(now), None));

        let mut existing = version();
        existing.approved_at = Some(ts(5_000));
        let (_, a, _) = version_timestamps(&existing, TemplateStatus::Approved, now);
        assert_eq!(a, Some(ts(5_000)));
    }

    #[test]
    fn pending_touches_no_timestamps() {
        let (s, a, r) = version_timestamps(&version(), TemplateStatus::Pending, ts(1));
        assert_eq!((s, a, r), (None, None, None));
    }

    #[test]
    fn rejection_fills_rejected_at() {
        let (_, _, r) = version_timestamps(&version(), TemplateStatus::Rejected, ts(7));
        assert_eq!(r, Some(ts(7)));
    }
}
