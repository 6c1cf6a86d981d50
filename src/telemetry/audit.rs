use std::time::Duration;

use rusqlite::params;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::db::Database;
use crate::telemetry::GenerationEvent;

/// Maximum number of events to buffer before flushing, regardless of timer.
const BATCH_SIZE: usize = 100;

/// How often to flush buffered events even if the batch is not full.
const FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Spawn a background task that reads `GenerationEvent` values from the
/// channel and batch-writes them to the `generation_log` table.
///
/// The task exits once every sender is dropped and the remaining events
/// have been written; await the handle during shutdown to drain it.
pub fn spawn_audit_logger(
    db: Database,
    mut rx: mpsc::UnboundedReceiver<GenerationEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut buffer: Vec<GenerationEvent> = Vec::with_capacity(BATCH_SIZE);
        let mut interval = tokio::time::interval(FLUSH_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(e) => {
                            buffer.push(e);
                            if buffer.len() >= BATCH_SIZE {
                                flush_batch(&db, &mut buffer);
                            }
                        }
                        None => {
                            if !buffer.is_empty() {
                                flush_batch(&db, &mut buffer);
                            }
                            tracing::info!("Audit logger shutting down");
                            break;
                        }
                    }
                }
                _ = interval.tick() => {
                    if !buffer.is_empty() {
                        flush_batch(&db, &mut buffer);
                    }
                }
            }
        }
    })
}

fn flush_batch(db: &Database, buffer: &mut Vec<GenerationEvent>) {
    let events = std::mem::take(buffer);
    let count = events.len();

    if let Err(e) = write_events(db, &events) {
        tracing::error!(count, error = %e, "Failed to flush generation log batch");
        // Retry on the next tick.
        buffer.extend(events);
    } else {
        tracing::debug!(count, "Flushed generation log batch");
    }
}

fn write_events(db: &Database, events: &[GenerationEvent]) -> Result<(), rusqlite::Error> {
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        {
            let mut insert = tx.prepare_cached(
                "INSERT INTO generation_log (id, request_id, identity, tool, model, cost, \
                 result, error_code, metadata, latency_ms) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            )?;

            for event in events {
                let metadata = serde_json::Value::Object(event.metadata.clone()).to_string();
                insert.execute(params![
                    Uuid::new_v4().to_string(),
                    event.request_id,
                    event.identity,
                    event.tool,
                    event.model,
                    i64::try_from(event.cost).unwrap_or(i64::MAX),
                    event.result.as_str(),
                    event.error_code.map(|c| c.as_str()),
                    metadata,
                    i64::try_from(event.latency_ms).unwrap_or(i64::MAX),
                ])?;
            }
        }
        tx.commit()
    })
}
