use crate::config::Config;
use crate::error::{is_all_credentials_exhausted, PipelineError};
use crate::feed;
use crate::ledger::{DeduplicationLedger, RecordStatus};
use crate::publisher::MultiLocalePublisher;
use crate::queue::{QueueEntry, WorkQueue};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Outcome of one worker iteration, so `run_forever` knows whether to keep
/// draining or back off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// An item was processed (completed or errored); keep going.
    Processed,
    /// The queue is empty.
    Idle,
    /// The credential pool is dry; sleep until the next quota window.
    QuotaPause,
}

/// The orchestration layer: ingest -> dedup -> queue -> translate -> publish.
///
/// Single polling worker, no parallelism across items: the translation
/// backend's quota makes parallel fan-out counter-productive.
pub struct Pipeline {
    config: Arc<Config>,
    ledger: DeduplicationLedger,
    queue: WorkQueue,
    publisher: MultiLocalePublisher,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        ledger: DeduplicationLedger,
        queue: WorkQueue,
        publisher: MultiLocalePublisher,
    ) -> Self {
        Self {
            config,
            ledger,
            queue,
            publisher,
        }
    }

    /// One ingest cycle: fetch feeds, drop duplicates and invalid items,
    /// record survivors in the ledger and enqueue them. Returns the number
    /// of newly enqueued items.
    pub async fn ingest_once(&self) -> Result<usize> {
        let items = feed::fetch_feed_items(&self.config).await?;
        info!("Ingest: {} items fetched", items.len());

        let mut enqueued = 0;

        for item in items.into_iter().take(self.config.max_items_per_cycle) {
            if let Err(e) = item.validate() {
                warn!("Ingest: rejecting item {}: {}", item.guid, e);
                // Recorded so the same broken item is not re-validated forever
                match self.ledger.record(
                    &item.guid,
                    &item.title,
                    &item.body,
                    &item.link,
                    RecordStatus::Rejected,
                ) {
                    Ok(()) => {}
                    Err(e) if is_duplicate(&e) => {}
                    Err(e) => return Err(e),
                }
                continue;
            }

            if self.ledger.exists(&item.guid, &item.title)? {
                debug!("Ingest: skipping duplicate item {}", item.guid);
                continue;
            }
            if self.ledger.is_duplicate_content(&item.body)? {
                debug!("Ingest: skipping duplicate content for {}", item.guid);
                continue;
            }

            match self.ledger.record(
                &item.guid,
                &item.title,
                &item.body,
                &item.link,
                RecordStatus::Selected,
            ) {
                Ok(()) => {}
                Err(e) if is_duplicate(&e) => {
                    // Lost a race with an earlier record; a duplicate is not
                    // a pipeline error.
                    debug!("Ingest: item {} recorded concurrently", item.guid);
                    continue;
                }
                Err(e) => return Err(e),
            }

            if self.queue.enqueue(&item)? {
                enqueued += 1;
            }
        }

        info!("Ingest: {} new items enqueued", enqueued);
        Ok(enqueued)
    }

    /// One worker iteration: reclaim stalled entries, claim one item and
    /// push it through translation and publishing. Deterministic, so tests
    /// drive the pipeline by calling this directly.
    pub async fn run_once(&self) -> Result<WorkOutcome> {
        self.queue
            .recover_stalled(Duration::from_secs(self.config.max_processing_secs))?;

        let entry = match self.queue.dequeue()? {
            Some(entry) => entry,
            None => return Ok(WorkOutcome::Idle),
        };

        self.process_entry(entry).await
    }

    async fn process_entry(&self, entry: QueueEntry) -> Result<WorkOutcome> {
        let item = &entry.item;
        info!(
            "Processing item {} (attempt {}): {}",
            item.guid, entry.attempts, item.title
        );

        match self.publisher.publish_item(item).await {
            Ok(set) => {
                for failure in &set.failed_locales {
                    warn!(
                        "Item {} published without locale {}: {}",
                        item.guid, failure.locale, failure.reason
                    );
                }

                self.ledger.update_status(&item.guid, RecordStatus::Published)?;
                self.ledger.set_output(&item.guid, &set.document_id)?;
                self.ledger.log_translation(
                    &item.guid,
                    &item.title,
                    &set.base_post.title,
                    &item.link,
                    Some(&set.document_id),
                    "published",
                )?;
                for post in &set.localizations {
                    self.ledger.log_translation(
                        &item.guid,
                        &item.title,
                        &post.title,
                        &item.link,
                        Some(&set.document_id),
                        "published",
                    )?;
                }

                self.queue.mark_completed(&item.guid)?;
                info!(
                    "Item {} published as document {} ({} localizations, {} failed locales)",
                    item.guid,
                    set.document_id,
                    set.localizations.len(),
                    set.failed_locales.len()
                );
                Ok(WorkOutcome::Processed)
            }
            Err(e) if is_all_credentials_exhausted(&e) => {
                // Only reachable while no base document exists yet (the
                // publisher absorbs exhaustion after that point), so the
                // item can safely go back to pending and be retried in a
                // later quota window. The worker pauses instead of burning
                // the rest of the queue against a dry pool.
                warn!(
                    "Translation credentials exhausted while processing {}; releasing item",
                    item.guid
                );
                self.queue.release(&item.guid)?;
                Ok(WorkOutcome::QuotaPause)
            }
            Err(e) => {
                error!("Item {} failed: {:#}", item.guid, e);
                self.queue.mark_error(&item.guid, &format!("{:#}", e))?;
                Ok(WorkOutcome::Processed)
            }
        }
    }

    /// Poll until the shutdown signal flips. Drains the queue eagerly,
    /// re-ingests when idle, and sleeps `poll_interval` between rounds.
    pub async fn run_forever(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let poll_interval = Duration::from_secs(self.config.poll_interval_secs);
        info!(
            "Worker loop started (poll interval {:?}, {} locales)",
            poll_interval,
            self.config.locales.len()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let outcome = match self.run_once().await {
                Ok(outcome) => outcome,
                Err(e) => {
                    // A single bad iteration must not kill the loop
                    error!("Worker iteration failed: {:#}", e);
                    WorkOutcome::Idle
                }
            };

            match outcome {
                WorkOutcome::Processed => continue,
                WorkOutcome::Idle => {
                    match self.ingest_once().await {
                        Ok(n) if n > 0 => continue,
                        Ok(_) => {}
                        Err(e) => warn!("Ingest cycle failed: {:#}", e),
                    }
                    // Stats are observability only; a failed read must not
                    // kill the loop.
                    match self.queue.stats() {
                        Ok(stats) => debug!(
                            "Queue stats: pending={} processing={} completed={} error={}",
                            stats.pending, stats.processing, stats.completed, stats.error
                        ),
                        Err(e) => warn!("Failed to read queue stats: {:#}", e),
                    }
                }
                WorkOutcome::QuotaPause => {
                    info!("Pausing {:?} for quota window", poll_interval);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Worker loop stopped");
        Ok(())
    }
}

fn is_duplicate(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::AlreadyExists { .. })
    )
}
