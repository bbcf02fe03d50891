//! Campaign recipient projection.
//!
//! Delivery receipts arrive out of order and at-least-once; the projection
//! compensates with a rank-ordered status machine and first-occurrence
//! timestamps that only ever transition null → value.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{QueryBuilder, Row};
use tracing::instrument;

use crate::db::Tx;
use crate::model::{MessageStatus, RecipientStatus};
use crate::normalizer::MessageEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Updated,
    Noop,
    NotFound,
}

/// Snapshot of the recipient columns the projection reads.
#[derive(Debug, Clone)]
pub struct RecipientRow {
    pub id: i64,
    pub status: RecipientStatus,
    pub whatsapp_message_id: Option<String>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub reached_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
}

/// Field writes produced by planning; every populated field is a change.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecipientUpdate {
    pub status: Option<RecipientStatus>,
    pub whatsapp_message_id: Option<String>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub reached_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_reason: Option<String>,
    pub error: Option<Value>,
}

impl RecipientUpdate {
    fn is_empty(&self) -> bool {
        *self == RecipientUpdate::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Upgrade(RecipientStatus),
    Same,
    Ignore,
}

/// Status transition decision. FAILED supersedes anything below READ; a
/// FAILED recipient otherwise stays put; everything else moves strictly up
/// the rank order.
fn decide(current: RecipientStatus, incoming: MessageStatus) -> Transition {
    if incoming == MessageStatus::Failed {
        return match current {
            RecipientStatus::Read => Transition::Ignore,
            RecipientStatus::Failed => Transition::Same,
            _ => Transition::Upgrade(RecipientStatus::Failed),
        };
    }
    if current == RecipientStatus::Failed {
        return Transition::Ignore;
    }
    let target = incoming.target_status();
    if target.rank() > current.rank() {
        Transition::Upgrade(target)
    } else if target == current {
        Transition::Same
    } else {
        Transition::Ignore
    }
}

/// Compute the field writes for one receipt against the current row.
/// Returns `None` when nothing would change.
///
/// First-occurrence timestamps fill even when the status itself is not
/// upgraded (a late `sent` after DELIVERED still sets a null `sent_at`); the
/// one hard exception is `failed` arriving after READ, which writes nothing.
pub fn plan_update(
    current: &RecipientRow,
    event: &MessageEvent,
    now: DateTime<Utc>,
) -> Option<RecipientUpdate> {
    let incoming = event.status?;
    if incoming == MessageStatus::Failed && current.status == RecipientStatus::Read {
        return None;
    }

    let mut update = RecipientUpdate::default();
    let stamp = event.event_at.unwrap_or(now);

    if let Transition::Upgrade(target) = decide(current.status, incoming) {
        update.status = Some(target);
        if current.last_event_at.map_or(true, |existing| stamp > existing) {
            update.last_event_at = Some(stamp);
        }
    }

    match incoming {
        MessageStatus::Accepted => {
            if current.accepted_at.is_none() {
                update.accepted_at = Some(stamp);
            }
        }
        MessageStatus::Sent => {
            if current.sent_at.is_none() {
                update.sent_at = Some(stamp);
            }
        }
        MessageStatus::Delivered | MessageStatus::Read => {
            if current.reached_at.is_none() {
                update.reached_at = Some(stamp);
            }
        }
        MessageStatus::Failed => {
            if current.failed_at.is_none() {
                update.failed_at = Some(stamp);
            }
            update.last_error_code = event.error_code.clone();
            update.last_error_reason = event.error_reason.clone();
            update.error = event.error_payload.clone();
        }
    }

    if current.whatsapp_message_id.is_none() {
        update.whatsapp_message_id = event.whatsapp_message_id.clone();
    }

    if update.is_empty() {
        None
    } else {
        Some(update)
    }
}

/// Apply one delivery receipt to the recipient it targets.
#[instrument(skip_all)]
pub async fn apply_message_event(tx: &mut Tx<'_>, event: &MessageEvent) -> Result<ApplyOutcome> {
    if event.status.is_none() {
        return Ok(ApplyOutcome::Noop);
    }
    let Some(current) = find_recipient(tx, event).await? else {
        return Ok(ApplyOutcome::NotFound);
    };

    let Some(update) = plan_update(&current, event, Utc::now()) else {
        return Ok(ApplyOutcome::Noop);
    };
    apply_update(tx, current.id, &update).await?;
    Ok(ApplyOutcome::Updated)
}

/// Look up the recipient, first by the provider message id, then by the
/// WhatsApp message id. The row lock serializes concurrent receipts for the
/// same recipient.
async fn find_recipient(tx: &mut Tx<'_>, event: &MessageEvent) -> Result<Option<RecipientRow>> {
    if let Some(message_id) = &event.message_id {
        if let Some(row) = fetch_by(tx, "gupshup_message_id", message_id).await? {
            return Ok(Some(row));
        }
    }
    if let Some(wa_id) = &event.whatsapp_message_id {
        if let Some(row) = fetch_by(tx, "whatsapp_message_id", wa_id).await? {
            return Ok(Some(row));
        }
    }
    Ok(None)
}

async fn fetch_by(tx: &mut Tx<'_>, column: &str, value: &str) -> Result<Option<RecipientRow>> {
    // `column` is one of two literals above, never external input.
    let sql = format!(
        "SELECT id, status, whatsapp_message_id, accepted_at, sent_at, reached_at, \
                failed_at, last_event_at \
         FROM campaign_recipient WHERE {} = ? LIMIT 1 FOR UPDATE",
        column
    );
    let row = sqlx::query(&sql)
        .bind(value)
        .fetch_optional(&mut **tx)
        .await
        .context("failed to look up campaign recipient")?;
    let Some(row) = row else { return Ok(None) };

    let status_str: String = row.get("status");
    let status = RecipientStatus::parse(&status_str)
        .ok_or_else(|| anyhow::anyhow!("recipient has unknown status {status_str}"))?;
    Ok(Some(RecipientRow {
        id: row.get("id"),
        status,
        whatsapp_message_id: row.get("whatsapp_message_id"),
        accepted_at: row.get("accepted_at"),
        sent_at: row.get("sent_at"),
        reached_at: row.get("reached_at"),
        failed_at: row.get("failed_at"),
        last_event_at: row.get("last_event_at"),
    }))
}

async fn apply_update(tx: &mut Tx<'_>, id: i64, update: &RecipientUpdate) -> Result<()> {
    let mut builder = QueryBuilder::new("UPDATE campaign_recipient SET ");
    let mut fields = builder.separated(", ");
    if let Some(status) = update.status {
        fields.push("status = ").push_bind_unseparated(status.as_str());
    }
    if let Some(wa_id) = &update.whatsapp_message_id {
        fields
            .push("whatsapp_message_id = ")
            .push_bind_unseparated(wa_id.clone());
    }
    if let Some(at) = update.last_event_at {
        fields.push("last_event_at = ").push_bind_unseparated(at);
    }
    if let Some(at) = update.accepted_at {
        fields.push("accepted_at = ").push_bind_unseparated(at);
    }
    if let Some(at) = update.sent_at {
        fields.push("sent_at = ").push_bind_unseparated(at);
    }
    if let Some(at) = update.reached_at {
        fields.push("reached_at = ").push_bind_unseparated(at);
    }
    if let Some(at) = update.failed_at {
        fields.push("failed_at = ").push_bind_unseparated(at);
    }
    if let Some(code) = &update.last_error_code {
        fields
            .push("last_error_code = ")
            .push_bind_unseparated(code.clone());
    }
    if let Some(reason) = &update.last_error_reason {
        fields
            .push("last_error_reason = ")
            .push_bind_unseparated(reason.clone());
    }
    if let Some(error) = &update.error {
        fields
            .push("error = ")
            .push_bind_unseparated(Json(error.clone()));
    }
    fields.push("updated_at = NOW()");
    builder.push(" WHERE id = ").push_bind(id);
    builder
        .build()
        .execute(&mut **tx)
        .await
        .context("failed to update campaign recipient")?;
    Ok(())
}
