//! The outbox delivery loop.
//!
//! Generalizes the teacher's `events::outbox::start_outbox_publisher`,
//! keeping the same claim/publish/mark shape, with retry partitioning,
//! backoff, dead-letter routing, and a consecutive-failure circuit breaker
//! layered on top. Every suspension point here (storage call, broker call)
//! sits between transactions, never inside one.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::domain::OutboxRecord;
use crate::errors::StorageError;
use crate::outbox::dlq::wrap_dead_letter;
use crate::storage::OutboxStore;
use event_bus::EventBus;

#[derive(Debug, Clone)]
pub struct OutboxWorkerConfig {
    pub batch_size: i64,
    pub poll_interval: Duration,
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_consecutive_failures: u32,
    pub topic_prefix: String,
}

impl Default for OutboxWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_consecutive_failures: 10,
            topic_prefix: "payments".to_string(),
        }
    }
}

/// Cooperative shutdown signal, checked between cycles and between
/// per-record sends, never mid-transaction.
#[derive(Clone, Default)]
pub struct ShutdownSignal(Arc<tokio::sync::Notify>, Arc<std::sync::atomic::AtomicBool>);

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.1.store(true, std::sync::atomic::Ordering::SeqCst);
        self.0.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.1.load(std::sync::atomic::Ordering::SeqCst)
    }
}

/// The advisory backoff delay for a record's next retry. Not enforced at
/// query time: the natural poll cadence bounds real retry pacing (see
/// DESIGN.md).
pub fn backoff_delay(cfg: &OutboxWorkerConfig, retry_count: i32) -> Duration {
    let exp = 2u32.saturating_pow(retry_count.max(0) as u32);
    let base = cfg.base_delay.saturating_mul(exp);
    let capped = base.min(cfg.max_delay);
    let jitter_max_ms = (capped.as_millis() as u64) / 10;
    let jitter_ms = if jitter_max_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_max_ms)
    };
    capped + Duration::from_millis(jitter_ms)
}

fn topic_for(topic_prefix: &str, event_type: &str) -> String {
    format!("{topic_prefix}.{}", event_type.to_lowercase())
}

fn dlq_topic(topic_prefix: &str) -> String {
    format!("{topic_prefix}.dlq")
}

pub struct OutboxWorker<O: OutboxStore, B: EventBus + ?Sized> {
    store: O,
    bus: Arc<B>,
    cfg: OutboxWorkerConfig,
    metrics: Option<crate::metrics::Metrics>,
}

impl<O: OutboxStore, B: EventBus + ?Sized> OutboxWorker<O, B> {
    pub fn new(store: O, bus: Arc<B>, cfg: OutboxWorkerConfig) -> Self {
        Self {
            store,
            bus,
            cfg,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: crate::metrics::Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Long-running task. Terminates on shutdown signal or when the
    /// circuit breaker latches open.
    pub async fn run(&self, shutdown: ShutdownSignal) {
        let mut consecutive_empty_success_cycles = 0u32;

        loop {
            if shutdown.is_set() {
                info!("outbox worker stopping on shutdown signal");
                return;
            }

            match self.run_cycle().await {
                Ok(CycleOutcome {
                    claimed,
                    published,
                    dead_lettered,
                }) => {
                    let made_progress = published > 0 || dead_lettered > 0;
                    if claimed > 0 && !made_progress {
                        consecutive_empty_success_cycles += 1;
                        warn!(
                            consecutive_empty_success_cycles,
                            claimed, "outbox cycle made no progress on a non-empty batch"
                        );
                        if consecutive_empty_success_cycles >= self.cfg.max_consecutive_failures {
                            error!(
                                consecutive_empty_success_cycles,
                                "outbox circuit breaker latched open, stopping worker"
                            );
                            return;
                        }
                    } else {
                        consecutive_empty_success_cycles = 0;
                    }

                    if let Some(m) = &self.metrics {
                        if let Ok(depth) = self.store.pending_depth().await {
                            m.payments_outbox_pending.set(depth);
                        }
                    }

                    // A full batch means more work is likely waiting; skip
                    // the sleep and go straight to the next cycle.
                    if claimed < self.cfg.batch_size {
                        tokio::select! {
                            _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                            _ = shutdown.0.notified() => {
                                info!("outbox worker stopping during poll sleep");
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    // Storage unavailable: pause, let the circuit breaker's
                    // counter accumulate via the same no-progress path on
                    // the next reachable cycle.
                    error!(error = %err, "outbox worker could not claim batch, pausing");
                    consecutive_empty_success_cycles += 1;
                    if consecutive_empty_success_cycles >= self.cfg.max_consecutive_failures {
                        error!("outbox circuit breaker latched open after storage failures");
                        return;
                    }
                    tokio::time::sleep(self.cfg.poll_interval).await;
                }
            }
        }
    }

    /// Runs exactly one claim/publish/dead-letter cycle and returns what
    /// happened. Exposed so tests can drive the worker deterministically
    /// instead of racing its background sleep loop.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, StorageError> {
        let batch = self.store.claim_pending(self.cfg.batch_size).await?;
        let claimed = batch.len() as i64;
        if batch.is_empty() {
            return Ok(CycleOutcome {
                claimed: 0,
                published: 0,
                dead_lettered: 0,
            });
        }

        let (to_dead_letter, to_publish): (Vec<_>, Vec<_>) = batch
            .into_iter()
            .partition(|r| r.retry_count >= self.cfg.max_retries);

        let mut published = 0u32;
        let mut dead_lettered = 0u32;

        for record in &to_publish {
            if self.publish_one(record).await {
                published += 1;
            }
        }

        for record in &to_dead_letter {
            if self.dead_letter_one(record).await {
                dead_lettered += 1;
            }
        }

        Ok(CycleOutcome {
            claimed,
            published,
            dead_lettered,
        })
    }

    async fn publish_one(&self, record: &OutboxRecord) -> bool {
        let topic = topic_for(&self.cfg.topic_prefix, &record.event_type);
        let envelope = envelope_for(record);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                // Permanent failure: the record can never serialize, so
                // there is nothing to retry. Bumping retry_count past the
                // threshold immediately would need a dedicated store call;
                // instead we let it retry normally and age out to DLQ,
                // logging loudly now.
                error!(event_id = %record.id, error = %err, "outbox record failed to serialize");
                self.increment_retry(record).await;
                return false;
            }
        };

        match self.bus.publish_durable(&topic, &record.id, payload).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(&record.id).await {
                    error!(event_id = %record.id, error = %err, "failed to mark outbox record published");
                    return false;
                }
                if let Some(m) = &self.metrics {
                    m.payments_outbox_published_total.inc();
                }
                debug!(event_id = %record.id, topic = %topic, "outbox record published");
                true
            }
            Err(err) => {
                warn!(
                    event_id = %record.id,
                    attempt = record.retry_count + 1,
                    error = %err,
                    "outbox publish failed, will retry"
                );
                self.increment_retry(record).await;
                false
            }
        }
    }

    async fn increment_retry(&self, record: &OutboxRecord) {
        if let Err(err) = self.store.increment_retry(&record.id).await {
            error!(event_id = %record.id, error = %err, "failed to record outbox retry");
        }
        if let Some(m) = &self.metrics {
            m.payments_outbox_failed_total.inc();
        }
        let delay = backoff_delay(&self.cfg, record.retry_count);
        debug!(event_id = %record.id, backoff_ms = delay.as_millis() as u64, "advisory backoff computed");
    }

    /// Routes a record to the dead-letter topic. A dead letter that
    /// actually reaches the broker is publication, not failure, and the
    /// caller folds it into the cycle's progress accordingly.
    async fn dead_letter_one(&self, record: &OutboxRecord) -> bool {
        let topic = dlq_topic(&self.cfg.topic_prefix);
        let payload = wrap_dead_letter(record, &record.id);
        let bytes = match serde_json::to_vec(&payload) {
            Ok(b) => b,
            Err(err) => {
                error!(event_id = %record.id, error = %err, "failed to serialize dead-letter envelope");
                return false;
            }
        };

        match self.bus.publish_durable(&topic, &record.id, bytes).await {
            Ok(()) => {
                if let Err(err) = self.store.mark_published(&record.id).await {
                    error!(event_id = %record.id, error = %err, "failed to mark dead-lettered record published");
                    return false;
                }
                if let Some(m) = &self.metrics {
                    m.payments_outbox_dlq_total.inc();
                }
                warn!(event_id = %record.id, retry_count = record.retry_count, "outbox record routed to dead letter");
                true
            }
            Err(err) => {
                // Leave the record pending; it is retried as a dead
                // letter again next cycle.
                error!(event_id = %record.id, error = %err, "dead-letter publish failed, will retry next cycle");
                false
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CycleOutcome {
    pub claimed: i64,
    pub published: u32,
    pub dead_lettered: u32,
}

fn envelope_for(record: &OutboxRecord) -> serde_json::Value {
    serde_json::json!({
        "event_id": record.id,
        "aggregate_type": record.aggregate_type,
        "aggregate_id": record.aggregate_id,
        "event_type": record.event_type,
        "payload": record.payload,
        "timestamp": record.created_at.to_rfc3339(),
    })
}
