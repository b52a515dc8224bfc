// Write path. A single writer task owns the MongoDB handle and drains the
// record channel, so the MQTT loop never touches the database directly and
// a slow database shows up as backpressure on the channel instead of
// unbounded buffering.
use std::collections::HashSet;

use mongodb::bson::{Document, doc};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::IndexOptions;
use mongodb::{Database, IndexModel};
use prometheus::IntCounter;
use tokio::sync::mpsc;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, info, warn};

use crate::ingest::IngestRecord;

/// Attempts per record before it is dropped.
const MAX_INSERT_ATTEMPTS: u32 = 5;

/// Counters the writer maintains; registered by `server::run()`.
#[derive(Clone)]
pub struct StoreCounters {
    pub stored: IntCounter,
    pub duplicates: IntCounter,
    pub retries: IntCounter,
    pub dropped: IntCounter,
}

/// Consume records until the channel closes. Intended to be spawned with
/// `tokio::task::spawn` from `server::run()`.
pub async fn run_writer(
    db: Database,
    mut records: mpsc::Receiver<IngestRecord>,
    counters: StoreCounters,
) {
    // Collections whose dedup index has already been created this run.
    let mut prepared: HashSet<String> = HashSet::new();

    while let Some(record) = records.recv().await {
        if let Err(e) = ensure_collection(&db, &mut prepared, &record.collection).await {
            // Without the unique index a redelivered message may be stored
            // twice; the insert itself is still attempted.
            warn!(collection = %record.collection, error = %e, "failed to ensure dedup index");
        }
        insert_with_retry(&db, &record, &counters).await;
    }

    info!("record channel closed; store writer exiting");
}

/// Create the unique dedup index the first time a daily collection is
/// written to. MongoDB creates the collection itself on first insert.
async fn ensure_collection(
    db: &Database,
    prepared: &mut HashSet<String>,
    name: &str,
) -> anyhow::Result<()> {
    if prepared.contains(name) {
        return Ok(());
    }

    let index = IndexModel::builder()
        .keys(doc! { "dedup_key": 1 })
        .options(
            IndexOptions::builder()
                .unique(true)
                .name("dedup_key_unique".to_string())
                .build(),
        )
        .build();
    db.collection::<Document>(name).create_index(index).await?;

    prepared.insert(name.to_string());
    Ok(())
}

/// Insert one record, retrying transient failures with exponential backoff.
/// A duplicate-key error means the record was already stored by an earlier
/// delivery of the same message and counts as success.
async fn insert_with_retry(db: &Database, record: &IngestRecord, counters: &StoreCounters) {
    let collection = db.collection::<Document>(&record.collection);

    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match collection.insert_one(&record.document).await {
            Ok(_) => {
                counters.stored.inc();
                debug!(collection = %record.collection, "stored document");
                return;
            }
            Err(e) if is_duplicate_key(&e) => {
                counters.duplicates.inc();
                debug!(collection = %record.collection, "duplicate dedup_key; message already stored");
                return;
            }
            Err(e) if attempt < MAX_INSERT_ATTEMPTS => {
                counters.retries.inc();
                let delay = backoff_delay(attempt);
                warn!(
                    collection = %record.collection,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "insert failed; retrying"
                );
                sleep(delay).await;
            }
            Err(e) => {
                counters.dropped.inc();
                error!(
                    collection = %record.collection,
                    error = %e,
                    "insert failed after {MAX_INSERT_ATTEMPTS} attempts; dropping record"
                );
                return;
            }
        }
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match &*err.kind {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => write_error.code == 11000,
        _ => false,
    }
}

/// 250ms doubling per attempt, capped at 5s.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(6);
    Duration::from_millis((250u64 << exp).min(5_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff_delay(1), Duration::from_millis(250));
        assert_eq!(backoff_delay(2), Duration::from_millis(500));
        assert_eq!(backoff_delay(3), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(5), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(6), Duration::from_secs(5));
        assert_eq!(backoff_delay(40), Duration::from_secs(5));
    }
}
