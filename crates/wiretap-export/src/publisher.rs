//! Batching publisher
//!
//! Producers push transactions into a bounded queue through a
//! [`PublisherHandle`]; a single [`Publisher`] task drains it into batches and
//! hands them to the sink. A batch that still fails after its retries, or is
//! rejected outright, goes to the spool or is dropped. The spool is replayed
//! after the next successful send.

use crate::spool::Spool;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use wiretap_core::config::{FailureAction, OverflowPolicy, PublishSettings};
use wiretap_core::metrics::{add, inc, SharedMetrics};
use wiretap_core::plugins::{ExportPlugin, PluginError, PluginResult};
use wiretap_core::transaction::Transaction;

/// Publisher tuning
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub queue_capacity: usize,
    pub overflow: OverflowPolicy,
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub on_failure: FailureAction,
    pub shutdown_timeout: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self::from(&PublishSettings::default())
    }
}

impl From<&PublishSettings> for PublisherConfig {
    fn from(settings: &PublishSettings) -> Self {
        Self {
            batch_size: settings.batch_size.max(1),
            flush_interval: Duration::from_millis(settings.flush_interval_ms.max(1)),
            queue_capacity: settings.queue_capacity.max(1),
            overflow: settings.overflow,
            max_retries: settings.max_retries,
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms.max(settings.initial_backoff_ms)),
            on_failure: settings.on_failure,
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
        }
    }
}

/// Returned by [`PublisherHandle::publish`] once the publisher is closed
#[derive(Debug, Error)]
#[error("publisher is closed")]
pub struct PublisherClosed(pub Transaction);

struct Shared {
    queue: Mutex<VecDeque<Transaction>>,
    capacity: usize,
    overflow: OverflowPolicy,
    closed: AtomicBool,
    not_empty: Notify,
    not_full: Notify,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn take(&self, max: usize) -> Vec<Transaction> {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        let batch: Vec<_> = queue.drain(..n).collect();
        drop(queue);
        if !batch.is_empty() {
            self.not_full.notify_waiters();
        }
        batch
    }
}

/// Producer side of the outbound queue
#[derive(Clone)]
pub struct PublisherHandle {
    shared: Arc<Shared>,
    metrics: SharedMetrics,
}

impl PublisherHandle {
    /// Queue a transaction. With the drop-oldest policy this never waits;
    /// with the block policy it waits for room.
    pub async fn publish(&self, transaction: Transaction) -> Result<(), PublisherClosed> {
        let shared = &self.shared;
        loop {
            let notified = shared.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shared.is_closed() {
                return Err(PublisherClosed(transaction));
            }
            {
                let mut queue = shared.queue.lock();
                if queue.len() < shared.capacity {
                    queue.push_back(transaction);
                    drop(queue);
                    inc(&self.metrics.publish.queued);
                    shared.not_empty.notify_one();
                    return Ok(());
                }
                if shared.overflow == OverflowPolicy::DropOldest {
                    queue.pop_front();
                    queue.push_back(transaction);
                    drop(queue);
                    inc(&self.metrics.publish.queued);
                    inc(&self.metrics.publish.dropped_overflow);
                    shared.not_empty.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Stop accepting transactions and let the publisher drain
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            debug!("Publisher queue closed");
        }
        self.shared.not_empty.notify_one();
        self.shared.not_full.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Transactions waiting to be batched
    pub fn len(&self) -> usize {
        self.shared.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Consumer side: batches, delivers, retries and spools
pub struct Publisher {
    config: PublisherConfig,
    sink: Box<dyn ExportPlugin>,
    spool: Option<Spool>,
    shared: Arc<Shared>,
    metrics: SharedMetrics,
}

impl Publisher {
    /// `sink` must already be initialized
    pub fn new(
        config: PublisherConfig,
        sink: Box<dyn ExportPlugin>,
        spool: Option<Spool>,
        metrics: SharedMetrics,
    ) -> (Self, PublisherHandle) {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(config.queue_capacity.min(4096))),
            capacity: config.queue_capacity,
            overflow: config.overflow,
            closed: AtomicBool::new(false),
            not_empty: Notify::new(),
            not_full: Notify::new(),
        });
        let handle = PublisherHandle {
            shared: shared.clone(),
            metrics: metrics.clone(),
        };
        (
            Self {
                config,
                sink,
                spool,
                shared,
                metrics,
            },
            handle,
        )
    }

    /// Publish until the handle is closed, then drain within the shutdown timeout
    pub async fn run(mut self) {
        info!(
            sink = self.sink.name(),
            batch_size = self.config.batch_size,
            spool = self.spool.is_some(),
            "Publisher started"
        );

        if self.spool_pending() > 0 {
            self.replay_spool().await;
        }

        while let Some(batch) = self.next_batch().await {
            if self.deliver(batch, None).await && self.spool_pending() > 0 {
                self.replay_spool().await;
            }
        }

        let deadline = Instant::now() + self.config.shutdown_timeout;
        loop {
            if Instant::now() >= deadline {
                break;
            }
            let batch = self.shared.take(self.config.batch_size);
            if batch.is_empty() {
                break;
            }
            self.deliver(batch, Some(deadline)).await;
        }

        let leftover = self.shared.take(usize::MAX);
        if !leftover.is_empty() {
            warn!(count = leftover.len(), "Shutdown timeout elapsed with transactions still queued");
            self.give_up(leftover);
        }

        if let Err(e) = self.sink.flush().await {
            warn!("Sink flush failed: {}", e);
        }
        if let Err(e) = self.sink.shutdown() {
            warn!("Sink shutdown failed: {}", e);
        }
        info!("Publisher stopped");
    }

    /// Next batch, once it is full or the flush interval elapsed. `None` once closed.
    async fn next_batch(&self) -> Option<Vec<Transaction>> {
        let mut deadline = Instant::now() + self.config.flush_interval;
        loop {
            let notified = self.shared.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shared.is_closed() {
                return None;
            }
            if self.shared.queue.lock().len() >= self.config.batch_size {
                return Some(self.shared.take(self.config.batch_size));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(deadline) => {
                    let batch = self.shared.take(self.config.batch_size);
                    if !batch.is_empty() {
                        return Some(batch);
                    }
                    deadline = Instant::now() + self.config.flush_interval;
                }
            }
        }
    }

    async fn export(&self, batch: &[Transaction], deadline: Option<Instant>) -> PluginResult<()> {
        match deadline {
            None => self.sink.export_batch(batch).await,
            Some(deadline) => tokio::time::timeout_at(deadline, self.sink.export_batch(batch))
                .await
                .unwrap_or_else(|_| Err(PluginError::Unavailable("shutdown timeout elapsed".into()))),
        }
    }

    /// Send one batch with backoff. Returns whether the sink accepted it.
    async fn deliver(&self, batch: Vec<Transaction>, deadline: Option<Instant>) -> bool {
        let mut backoff = self.config.initial_backoff;
        let mut attempt = 0u32;
        loop {
            let err = match self.export(&batch, deadline).await {
                Ok(()) => {
                    inc(&self.metrics.publish.batches);
                    add(&self.metrics.publish.published, batch.len() as u64);
                    debug!(count = batch.len(), attempt, "Batch published");
                    return true;
                }
                Err(e) => e,
            };
            inc(&self.metrics.publish.failures);

            if !err.is_retryable() {
                error!(count = batch.len(), "Batch rejected: {}", err);
                self.give_up(batch);
                return false;
            }
            if attempt >= self.config.max_retries {
                error!(count = batch.len(), attempts = attempt + 1, "Batch failed after retries: {}", err);
                self.give_up(batch);
                return false;
            }
            if deadline.is_some_and(|d| Instant::now() + backoff >= d) {
                warn!(count = batch.len(), "No time left to retry before shutdown: {}", err);
                self.give_up(batch);
                return false;
            }

            attempt += 1;
            inc(&self.metrics.publish.retries);
            warn!(attempt, backoff_ms = backoff.as_millis() as u64, "Publish failed, retrying: {}", err);
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(self.config.max_backoff);
        }
    }

    /// Spool or drop a batch the sink would not take
    fn give_up(&self, batch: Vec<Transaction>) {
        let spool = match (&self.config.on_failure, &self.spool) {
            (FailureAction::Spool, Some(spool)) => spool,
            _ => {
                add(&self.metrics.publish.dropped_failed, batch.len() as u64);
                warn!(count = batch.len(), "Dropped undeliverable transactions");
                return;
            }
        };
        match spool.store(&batch) {
            Ok(stored) => {
                add(&self.metrics.publish.spooled, stored.inserted as u64);
                add(&self.metrics.publish.dropped_failed, stored.evicted as u64);
            }
            Err(e) => {
                error!(count = batch.len(), "Failed to spool transactions: {}", e);
                add(&self.metrics.publish.dropped_failed, batch.len() as u64);
            }
        }
    }

    fn spool_pending(&self) -> usize {
        self.spool
            .as_ref()
            .and_then(|spool| spool.len().ok())
            .unwrap_or(0)
    }

    /// Resend spooled transactions, one attempt per batch, stopping at the
    /// first retryable failure
    async fn replay_spool(&self) {
        let Some(spool) = &self.spool else {
            return;
        };
        let mut total = 0usize;
        loop {
            let spooled = match spool.peek(self.config.batch_size) {
                Ok(batch) => batch,
                Err(e) => {
                    error!("Failed to read spool: {}", e);
                    break;
                }
            };
            if spooled.is_empty() {
                break;
            }

            match self.sink.export_batch(&spooled.transactions).await {
                Ok(()) => {
                    let count = spooled.transactions.len() as u64;
                    inc(&self.metrics.publish.batches);
                    add(&self.metrics.publish.published, count);
                    add(&self.metrics.publish.replayed, count);
                    total += spooled.transactions.len();
                }
                Err(e) if e.is_retryable() => {
                    inc(&self.metrics.publish.failures);
                    debug!("Spool replay interrupted, will retry later: {}", e);
                    break;
                }
                Err(e) => {
                    inc(&self.metrics.publish.failures);
                    add(&self.metrics.publish.dropped_failed, spooled.transactions.len() as u64);
                    error!(count = spooled.transactions.len(), "Spooled batch rejected, discarding: {}", e);
                }
            }
            if let Err(e) = spool.remove(&spooled.ids) {
                error!("Failed to remove replayed transactions from spool: {}", e);
                break;
            }
        }
        if total > 0 {
            info!(count = total, "Replayed spooled transactions");
        }
    }
}
