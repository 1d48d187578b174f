//! Observability surface: counters, histograms, and gauges rendered as
//! plain text on a separate listener.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,

    pub payments_requests_total: IntCounterVec,
    pub payments_rate_limited_total: IntCounter,
    pub payments_outbox_published_total: IntCounter,
    pub payments_outbox_failed_total: IntCounter,
    pub payments_outbox_dlq_total: IntCounter,

    pub payments_request_duration_seconds: HistogramVec,
    pub payments_authorize_duration_seconds: Histogram,

    pub payments_outbox_pending: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let payments_requests_total = IntCounterVec::new(
            Opts::new("payments_requests_total", "AuthorizePayment outcomes"),
            &["status"], // authorized|declined|duplicate|invalid_argument|transient|internal
        )
        .expect("metric");

        let payments_rate_limited_total = IntCounter::new(
            "payments_rate_limited_total",
            "Requests rejected by the admission gate",
        )
        .expect("metric");

        let payments_outbox_published_total = IntCounter::new(
            "payments_outbox_published_total",
            "Outbox records successfully published",
        )
        .expect("metric");

        let payments_outbox_failed_total = IntCounter::new(
            "payments_outbox_failed_total",
            "Outbox publish attempts that failed and were retried",
        )
        .expect("metric");

        let payments_outbox_dlq_total = IntCounter::new(
            "payments_outbox_dlq_total",
            "Outbox records routed to the dead-letter topic",
        )
        .expect("metric");

        let payments_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "payments_request_duration_seconds",
                "Inner-handler duration, excluding the admission gate",
            ),
            &["route", "status"],
        )
        .expect("metric");

        let payments_authorize_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "payments_authorize_duration_seconds",
            "AuthorizationEngine::authorize wall time",
        ))
        .expect("metric");

        let payments_outbox_pending = IntGauge::new(
            "payments_outbox_pending",
            "Unpublished outbox rows as of the last worker cycle",
        )
        .expect("metric");

        registry
            .register(Box::new(payments_requests_total.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_rate_limited_total.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_outbox_published_total.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_outbox_failed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_outbox_dlq_total.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_request_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_authorize_duration_seconds.clone()))
            .unwrap();
        registry
            .register(Box::new(payments_outbox_pending.clone()))
            .unwrap();

        Self {
            registry,
            payments_requests_total,
            payments_rate_limited_total,
            payments_outbox_published_total,
            payments_outbox_failed_total,
            payments_outbox_dlq_total,
            payments_request_duration_seconds,
            payments_authorize_duration_seconds,
            payments_outbox_pending,
        }
    }

    pub fn render(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&mf, &mut buf).map_err(|e| e.to_string())?;
        String::from_utf8(buf).map_err(|e| e.to_string())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_registered_metric_names() {
        let metrics = Metrics::new();
        metrics.payments_rate_limited_total.inc();
        let rendered = metrics.render().unwrap();
        assert!(rendered.contains("payments_rate_limited_total"));
    }
}
