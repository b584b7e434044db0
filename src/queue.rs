use crate::feed::FeedItem;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// A claimed queue entry handed to the worker.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub item: FeedItem,
    pub attempts: u32,
    pub claimed_at: String,
}

/// Counts per state, for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub error: usize,
}

/// Durable FIFO-ish work queue with four states and stalled-item recovery.
///
/// One row per item, keyed by guid. The claim in `dequeue` is a check-and-set
/// on `state` (a single UPDATE guarded by `state = 'pending'`), so an entry
/// handed to one worker can never be handed to another until it is completed,
/// errored, released, or reclaimed by `recover_stalled`.
#[derive(Clone)]
pub struct WorkQueue {
    conn: Arc<Mutex<Connection>>,
}

impl WorkQueue {
    pub fn new(database_path: &str) -> Result<Self> {
        let conn = Connection::open(database_path)
            .context(format!("Failed to open queue at {}", database_path))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS queue (
                guid TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                queued_at TEXT NOT NULL,
                claimed_at TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                error_reason TEXT,
                finished_at TEXT
            )",
            [],
        )
        .context("Failed to create queue table")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Append an item to `pending`. Idempotent on guid: re-enqueueing an item
    /// already present in any state is a no-op and returns false.
    pub fn enqueue(&self, item: &FeedItem) -> Result<bool> {
        let payload = serde_json::to_string(item).context("Failed to serialize queue payload")?;
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let inserted = conn
            .execute(
                "INSERT INTO queue (guid, payload, state, queued_at)
                 VALUES (?1, ?2, 'pending', ?3)
                 ON CONFLICT(guid) DO NOTHING",
                params![item.guid, payload, now],
            )
            .context("Failed to enqueue item")?;

        Ok(inserted > 0)
    }

    /// Atomically move the oldest `pending` entry to `processing`, stamping
    /// `claimed_at` and bumping `attempts`. Returns `None` when the queue is
    /// empty; callers back off and poll again.
    pub fn dequeue(&self) -> Result<Option<QueueEntry>> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        let candidate: Option<String> = conn
            .query_row(
                "SELECT guid FROM queue WHERE state = 'pending'
                 ORDER BY queued_at, rowid LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to select pending entry")?;

        let guid = match candidate {
            Some(g) => g,
            None => return Ok(None),
        };

        // Check-and-set: only claims the row if it is still pending.
        let claimed = conn
            .execute(
                "UPDATE queue
                 SET state = 'processing', claimed_at = ?1, attempts = attempts + 1
                 WHERE guid = ?2 AND state = 'pending'",
                params![now, guid],
            )
            .context("Failed to claim entry")?;

        if claimed == 0 {
            return Ok(None);
        }

        let (payload, attempts): (String, u32) = conn
            .query_row(
                "SELECT payload, attempts FROM queue WHERE guid = ?1",
                params![guid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .context("Failed to read claimed entry")?;

        let item: FeedItem =
            serde_json::from_str(&payload).context("Failed to deserialize queue payload")?;

        Ok(Some(QueueEntry {
            item,
            attempts,
            claimed_at: now,
        }))
    }

    /// Move a processing entry to `completed`.
    pub fn mark_completed(&self, guid: &str) -> Result<()> {
        self.finish(guid, "completed", None)
    }

    /// Move a processing entry to `error`, recording the reason.
    pub fn mark_error(&self, guid: &str, reason: &str) -> Result<()> {
        self.finish(guid, "error", Some(reason))
    }

    fn finish(&self, guid: &str, state: &str, reason: Option<&str>) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE queue
                 SET state = ?1, error_reason = ?2, finished_at = ?3, claimed_at = NULL
                 WHERE guid = ?4 AND state = 'processing'",
                params![state, reason, now, guid],
            )
            .context("Failed to finish entry")?;

        if updated == 0 {
            warn!("Tried to mark {} as {} but it was not processing", guid, state);
        }
        Ok(())
    }

    /// Return a claimed entry to the back of `pending` without burning it
    /// (used when the credential pool is exhausted and the item should be
    /// retried in a later quota window).
    pub fn release(&self, guid: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                "UPDATE queue
                 SET state = 'pending', claimed_at = NULL, queued_at = ?1
                 WHERE guid = ?2 AND state = 'processing'",
                params![now, guid],
            )
            .context("Failed to release entry")?;

        if updated == 0 {
            warn!("Tried to release {} but it was not processing", guid);
        }
        Ok(())
    }

    /// Reset every `processing` entry whose claim is older than
    /// `max_processing_time` back to `pending`. Returns the number of
    /// reclaimed entries. Must run before the first dequeue of a worker
    /// session; safe to run on every poll.
    pub fn recover_stalled(&self, max_processing_time: Duration) -> Result<usize> {
        let cutoff = (Utc::now()
            - ChronoDuration::from_std(max_processing_time)
                .context("max_processing_time out of range")?)
        .to_rfc3339();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock().unwrap();

        // RFC3339 UTC timestamps compare correctly as strings. Reclaimed
        // entries get a fresh queued_at, so they rejoin the back of pending.
        let recovered = conn
            .execute(
                "UPDATE queue
                 SET state = 'pending', claimed_at = NULL, queued_at = ?1
                 WHERE state = 'processing' AND claimed_at < ?2",
                params![now, cutoff],
            )
            .context("Failed to recover stalled entries")?;

        if recovered > 0 {
            info!("Recovered {} stalled queue entries", recovered);
        }
        Ok(recovered)
    }

    /// Counts per state.
    pub fn stats(&self) -> Result<QueueStats> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT state, COUNT(*) FROM queue GROUP BY state")
            .context("Failed to prepare stats query")?;

        let mut stats = QueueStats::default();
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .context("Failed to query stats")?;

        for row in rows {
            let (state, count) = row.context("Failed to read stats row")?;
            let count = count as usize;
            match state.as_str() {
                "pending" => stats.pending = count,
                "processing" => stats.processing = count,
                "completed" => stats.completed = count,
                "error" => stats.error = count,
                other => warn!("Unknown queue state in stats: {}", other),
            }
        }

        Ok(stats)
    }
}
