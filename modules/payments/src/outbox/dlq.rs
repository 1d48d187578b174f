//! Dead-letter envelope construction.
//!
//! Unlike the teacher's `events::dlq`, which routes failed events into a
//! side DB table, this worker's dead-letter path is a publish like any
//! other. The dead-letter topic (`<prefix>.dlq`) is just another broker
//! destination for retry-exhausted or unrouteable events; DLQ-ness is
//! entirely an envelope-wrapping concern.

use chrono::Utc;
use serde_json::{json, Value};

use crate::domain::OutboxRecord;

/// Wrap an exhausted record's original envelope for the dead-letter
/// topic, adding `retry_count`, `failed_at`, `error`.
pub fn wrap_dead_letter(record: &OutboxRecord, event_id: &str) -> Value {
    json!({
        "event_id": event_id,
        "aggregate_type": record.aggregate_type,
        "aggregate_id": record.aggregate_id,
        "event_type": record.event_type,
        "payload": record.payload,
        "timestamp": record.created_at.to_rfc3339(),
        "retry_count": record.retry_count,
        "failed_at": Utc::now().to_rfc3339(),
        "error": "max_retries_exceeded",
    })
}
