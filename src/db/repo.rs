use anyhow::{Context, Result};
use sqlx::mysql::MySqlPoolOptions;
use sqlx::types::Json;
use sqlx::{MySql, MySqlPool, Row, Transaction};
use tracing::instrument;

use super::model::{Integration, NewRawEvent, RawEventRow};
use crate::model::EventKind;

pub type Pool = MySqlPool;
pub type Tx<'a> = Transaction<'a, MySql>;

/// Errors persisted into `last_error` are capped at the column width.
const LAST_ERROR_MAX_CHARS: usize = 255;

pub async fn init_pool(database_url: &str, pool_size: u32) -> Result<Pool> {
    MySqlPoolOptions::new()
        .max_connections(pool_size)
        .connect(database_url)
        .await
        .context("failed to connect to database")
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Insert a raw event. Returns `false` (and nothing else happens) when the
/// dedupe key already exists; any other failure propagates.
#[instrument(skip_all)]
pub async fn insert_raw_event(pool: &Pool, event: &NewRawEvent<'_>) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO wpp_webhook_event_raw \
         (app_id, event_kind, provider_event_id, message_id, whatsapp_message_id, \
          template_name, template_provider_id, event_status, payload_json, dedupe_key) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(event.app_id)
    .bind(event.event_kind.as_str())
    .bind(event.hints.provider_event_id.as_deref())
    .bind(event.hints.message_id.as_deref())
    .bind(event.hints.whatsapp_message_id.as_deref())
    .bind(event.hints.template_name.as_deref())
    .bind(event.hints.template_provider_id.as_deref())
    .bind(event.hints.event_status.as_deref())
    .bind(Json(event.payload_json))
    .bind(event.dedupe_key)
    .execute(pool)
    .await;

    match result {
        Ok(_) => Ok(true),
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => Ok(false),
        Err(err) => Err(err).context("failed to insert raw webhook event"),
    }
}

/// Claim up to `batch_size` pending rows, oldest first, skipping rows held by
/// other transactions. The locks live until the caller's transaction ends, so
/// concurrent workers always claim disjoint batches.
#[instrument(skip_all)]
pub async fn lock_next_batch(tx: &mut Tx<'_>, batch_size: u32) -> Result<Vec<RawEventRow>> {
    let rows = sqlx::query(
        "SELECT id, app_id, event_kind, payload_json, attempts, received_at \
         FROM wpp_webhook_event_raw \
         WHERE processed = 0 \
         ORDER BY received_at ASC, id ASC \
         LIMIT ? \
         FOR UPDATE SKIP LOCKED",
    )
    .bind(i64::from(batch_size))
    .fetch_all(&mut **tx)
    .await
    .context("failed to lock pending webhook batch")?;

    let mut batch = Vec::with_capacity(rows.len());
    for row in rows {
        let kind_str: String = row.get("event_kind");
        batch.push(RawEventRow {
            id: row.get("id"),
            app_id: row.get("app_id"),
            event_kind: EventKind::parse(&kind_str).unwrap_or(EventKind::Unknown),
            payload_json: row.get::<Json<serde_json::Value>, _>("payload_json").0,
            attempts: row.get("attempts"),
            received_at: row.get("received_at"),
        });
    }
    Ok(batch)
}

/// Terminal success, or a benign skip with an annotation.
#[instrument(skip_all)]
pub async fn mark_processed(tx: &mut Tx<'_>, id: u64, note: Option<&str>) -> Result<()> {
    sqlx::query(
        "UPDATE wpp_webhook_event_raw \
         SET processed = 1, processed_at = NOW(3), last_error = ? \
         WHERE id = ?",
    )
    .bind(note.map(truncate_error))
    .bind(id)
    .execute(&mut **tx)
    .await
    .context("failed to mark raw event processed")?;
    Ok(())
}

/// Record a failed attempt. With `finalize` the row becomes terminal;
/// otherwise it stays pending and will be reclaimed on a later tick.
#[instrument(skip_all)]
pub async fn mark_failed_attempt(
    tx: &mut Tx<'_>,
    id: u64,
    attempts: i32,
    error: &str,
    finalize: bool,
) -> Result<()> {
    let query = if finalize {
        "UPDATE wpp_webhook_event_raw \
         SET attempts = ?, last_error = ?, processed = 1, processed_at = NOW(3) \
         WHERE id = ?"
    } else {
        "UPDATE wpp_webhook_event_raw \
         SET attempts = ?, last_error = ? \
         WHERE id = ?"
    };
    sqlx::query(query)
        .bind(attempts)
        .bind(truncate_error(error))
        .bind(id)
        .execute(&mut **tx)
        .await
        .context("failed to record failed attempt")?;
    Ok(())
}

/// Look up the active integration for a provider account id. Inactive
/// mappings are treated as missing.
#[instrument(skip_all)]
pub async fn find_active_integration(tx: &mut Tx<'_>, app_id: &str) -> Result<Option<Integration>> {
    let row = sqlx::query(
        "SELECT id, company_id FROM whatsapp_integration WHERE app_id = ? AND is_active = 1",
    )
    .bind(app_id)
    .fetch_optional(&mut **tx)
    .await
    .context("failed to look up integration")?;
    Ok(row.map(|row| Integration {
        id: row.get("id"),
        company_id: row.get("company_id"),
    }))
}

fn truncate_error(error: &str) -> String {
    if error.chars().count() <= LAST_ERROR_MAX_CHARS {
        return error.to_string();
    }
    error.chars().take(LAST_ERROR_MAX_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_truncation_respects_char_boundaries() {
        let short = "database timed out";
        assert_eq!(truncate_error(short), short);

        let long = "é".repeat(300);
        let truncated = truncate_error(&long);
        assert_eq!(truncated.chars().count(), 255);
    }
}
