//! Outbox delivery worker.

mod dlq;
mod worker;

pub use dlq::wrap_dead_letter;
pub use worker::{backoff_delay, CycleOutcome, OutboxWorker, OutboxWorkerConfig, ShutdownSignal};
