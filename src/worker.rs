//! Asynchronous projection worker.
//!
//! One serial loop per process: every tick claims a batch of pending raw
//! events under `FOR UPDATE SKIP LOCKED` and projects each row inside the
//! same transaction. Because claims are disjoint across transactions, any
//! number of process replicas can run the same loop against the same table.

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Integration, Pool, RawEventRow, Tx};
use crate::model::EventKind;
use crate::normalizer::{self, NormalizedEvent};
use crate::projection::{
    apply_consent_event, apply_message_event, apply_template_event, ApplyOutcome, ConsentOutcome,
    TemplateOutcome,
};

/// Per-tick accounting, logged and returned for tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickStats {
    pub claimed: usize,
    pub done: usize,
    pub retried: usize,
    pub finalized: usize,
}

/// Terminal disposition of one raw row.
enum RowOutcome {
    /// Projected (or benignly skipped); the optional note lands in
    /// `last_error` as an annotation.
    Done(Option<String>),
}

/// Run the worker loop until `shutdown` fires. Ticks never overlap: the loop
/// is serial and a missed tick is delayed, not stacked.
pub async fn run(pool: Pool, config: Arc<Config>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(Duration::from_millis(config.interval_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(
        interval_ms = config.interval_ms,
        batch_size = config.batch_size,
        "webhook worker started"
    );
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("webhook worker stopping");
                break;
            }
            _ = ticker.tick() => {
                match process_batch(&pool, &config).await {
                    Ok(stats) if stats.claimed > 0 => {
                        if config.verbose_logs {
                            info!(
                                claimed = stats.claimed,
                                done = stats.done,
                                retried = stats.retried,
                                finalized = stats.finalized,
                                "webhook batch processed"
                            );
                        } else {
                            debug!(claimed = stats.claimed, done = stats.done, "webhook batch processed");
                        }
                    }
                    Ok(_) => {}
                    Err(err) => error!(?err, "webhook worker tick failed"),
                }
            }
        }
    }
}

/// Claim and project one batch inside a single transaction.
#[instrument(skip_all)]
pub async fn process_batch(pool: &Pool, config: &Config) -> Result<TickStats> {
    let mut stats = TickStats::default();
    let mut tx = pool.begin().await?;
    let rows = db::lock_next_batch(&mut tx, config.batch_size).await?;
    if rows.is_empty() {
        tx.commit().await?;
        return Ok(stats);
    }
    stats.claimed = rows.len();

    for row in &rows {
        match process_row(&mut tx, row, config).await {
            Ok(RowOutcome::Done(note)) => {
                if let Some(note) = &note {
                    debug!(id = row.id, %note, "raw event closed with annotation");
                }
                db::mark_processed(&mut tx, row.id, note.as_deref()).await?;
                stats.done += 1;
            }
            Err(err) => {
                let (attempts, finalize) = next_attempt(row.attempts, config.max_attempts);
                warn!(
                    id = row.id,
                    attempts,
                    finalize,
                    error = %format!("{err:#}"),
                    "raw event projection failed"
                );
                db::mark_failed_attempt(&mut tx, row.id, attempts, &format!("{err:#}"), finalize)
                    .await?;
                if finalize {
                    stats.finalized += 1;
                } else {
                    stats.retried += 1;
                }
            }
        }
    }

    tx.commit().await?;
    Ok(stats)
}

/// Project one raw row. The stored payload is authoritative: it is re-parsed
/// and re-normalized here; the denormalized columns written at ingest are
/// hints only.
async fn process_row(tx: &mut Tx<'_>, row: &RawEventRow, config: &Config) -> Result<RowOutcome> {
    let normalized = normalizer::normalize(&row.payload_json);
    match row.event_kind {
        EventKind::Message => {
            let NormalizedEvent::Message(event) = &normalized.event else {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            };
            if event.status.is_none() {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            }
            match apply_message_event(tx, event).await? {
                ApplyOutcome::Updated | ApplyOutcome::Noop => Ok(RowOutcome::Done(None)),
                ApplyOutcome::NotFound => {
                    Ok(RowOutcome::Done(Some("Recipient not found".into())))
                }
            }
        }
        EventKind::Template => {
            let NormalizedEvent::Template(event) = &normalized.event else {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            };
            let Some(integration) = resolve_integration(tx, row).await? else {
                return Ok(RowOutcome::Done(Some(format!(
                    "Integration not found for appId {}",
                    row.app_id
                ))));
            };
            if event.status.is_none() {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            }
            match apply_template_event(tx, &integration, event).await? {
                TemplateOutcome::Updated => Ok(RowOutcome::Done(None)),
                TemplateOutcome::NotFound => {
                    Ok(RowOutcome::Done(Some("Template not found".into())))
                }
            }
        }
        EventKind::User => {
            let NormalizedEvent::User(event) = &normalized.event else {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            };
            let Some(integration) = resolve_integration(tx, row).await? else {
                return Ok(RowOutcome::Done(Some(format!(
                    "Integration not found for appId {}",
                    row.app_id
                ))));
            };
            if event.phone.is_none() || event.consent.is_none() {
                return Ok(RowOutcome::Done(Some("Unrecognized payload".into())));
            }
            let outcome = apply_consent_event(
                tx,
                &integration,
                event,
                &config.user_phone_column,
                config.blocked_as_opt_out,
            )
            .await?;
            match outcome {
                ConsentOutcome::Applied => Ok(RowOutcome::Done(None)),
                ConsentOutcome::UserNotFound => {
                    Ok(RowOutcome::Done(Some("User not found for phone".into())))
                }
                ConsentOutcome::DroppedBlocked => Ok(RowOutcome::Done(Some(
                    "Blocked event ignored by configuration".into(),
                ))),
            }
        }
        EventKind::Unknown => Ok(RowOutcome::Done(Some("Unrecognized payload".into()))),
    }
}

async fn resolve_integration(tx: &mut Tx<'_>, row: &RawEventRow) -> Result<Option<Integration>> {
    db::find_active_integration(tx, &row.app_id).await
}

/// Retry accounting for one failure: bump the counter and finalize only once
/// it exceeds the configured maximum.
fn next_attempt(previous_attempts: i32, max_attempts: i32) -> (i32, bool) {
    let attempts = previous_attempts + 1;
    (attempts, attempts > max_attempts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenth_failure_stays_pending_eleventh_finalizes() {
        assert_eq!(next_attempt(8, 10), (9, false));
        assert_eq!(next_attempt(9, 10), (10, false));
        assert_eq!(next_attempt(10, 10), (11, true));
    }

    #[test]
    fn single_attempt_limit() {
        assert_eq!(next_attempt(0, 1), (1, false));
        assert_eq!(next_attempt(1, 1), (2, true));
    }
}
