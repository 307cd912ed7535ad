//! Outbox relay.
//!
//! Producers publish their own outbox entry right after commit. The relay is
//! the safety net: it re-publishes entries that are due but still unprocessed
//! after a grace period (crash between commit and publish, broker outage,
//! deferred retries whose backoff has elapsed).

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use taskforge_events::{OutboxMessage, TaskQueue};

use crate::store::{StoreError, TaskStore};

/// Publish one outbox entry and mark it processed.
///
/// Returns `true` when the entry was handed to the queue. Failures are logged
/// and leave the entry pending for the relay.
pub async fn dispatch_entry<S, Q>(store: &S, queue: &Q, entry: &OutboxMessage, now: DateTime<Utc>) -> bool
where
    S: TaskStore + ?Sized,
    Q: TaskQueue + ?Sized,
{
    let message = match entry.decode_task_queued() {
        Ok(message) => message,
        Err(e) => {
            error!(outbox_id = %entry.id(), error = %e, "undecodable outbox entry");
            return false;
        }
    };

    if let Err(e) = queue.publish(message).await {
        warn!(outbox_id = %entry.id(), error = %e, "publish failed; relay will retry");
        return false;
    }

    if let Err(e) = store.mark_outbox_processed(entry.id(), now).await {
        // Published but not marked: the relay may publish it again, which the
        // claim makes harmless.
        warn!(outbox_id = %entry.id(), error = %e, "failed to mark outbox entry processed");
    }
    true
}

pub struct OutboxRelay<S, Q> {
    store: S,
    queue: Q,
    interval: Duration,
    grace: Duration,
    batch: u32,
}

impl<S, Q> OutboxRelay<S, Q>
where
    S: TaskStore,
    Q: TaskQueue,
{
    pub fn new(store: S, queue: Q) -> Self {
        Self {
            store,
            queue,
            interval: Duration::from_secs(1),
            grace: Duration::from_secs(5),
            batch: 100,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_batch(mut self, batch: u32) -> Self {
        self.batch = batch.max(1);
        self
    }

    /// One relay pass. Returns how many entries were published.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::zero());
        let pending = self
            .store
            .pending_outbox(now, now - grace, self.batch)
            .await?;

        let mut published = 0;
        for entry in &pending {
            if dispatch_entry(&self.store, &self.queue, entry, now).await {
                published += 1;
            }
        }
        if published > 0 {
            info!(published, pending = pending.len(), "relayed outbox entries");
        }
        Ok(published)
    }

    /// Run passes until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(interval_ms = self.interval.as_millis() as u64, "outbox relay started");
        loop {
            if let Err(e) = self.run_once(Utc::now()).await {
                error!(error = %e, "outbox relay pass failed");
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        debug!("outbox relay stopped");
    }
}
