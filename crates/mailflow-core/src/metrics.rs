//! Prometheus instrumentation for the delivery pipeline.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

#[cfg(test)]
#[path = "metrics_tests.rs"]
mod tests;

/// Pipeline-wide metrics on a dedicated registry
pub struct PipelineMetrics {
    registry: Registry,
    pub emails_sent: IntCounterVec,
    pub emails_failed: IntCounterVec,
    pub emails_retried: IntCounterVec,
    pub emails_dead_lettered: IntCounter,
    pub send_duration: HistogramVec,
    pub queue_depth: IntGaugeVec,
}

impl PipelineMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let emails_sent = IntCounterVec::new(
            Opts::new("emails_sent_total", "Emails delivered successfully"),
            &["provider", "event_type"],
        )?;
        registry.register(Box::new(emails_sent.clone()))?;

        let emails_failed = IntCounterVec::new(
            Opts::new("emails_failed_total", "Delivery attempts that failed"),
            &["event_type", "error_type"],
        )?;
        registry.register(Box::new(emails_failed.clone()))?;

        let emails_retried = IntCounterVec::new(
            Opts::new("emails_retried_total", "Deliveries scheduled for retry"),
            &["event_type"],
        )?;
        registry.register(Box::new(emails_retried.clone()))?;

        let emails_dead_lettered = IntCounter::new(
            "emails_dead_lettered_total",
            "Messages moved to the dead-letter queue",
        )?;
        registry.register(Box::new(emails_dead_lettered.clone()))?;

        let send_duration = HistogramVec::new(
            HistogramOpts::new(
                "email_send_duration_seconds",
                "Duration of transport send attempts",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["provider"],
        )?;
        registry.register(Box::new(send_duration.clone()))?;

        let queue_depth = IntGaugeVec::new(
            Opts::new("email_queue_depth", "Messages waiting per queue"),
            &["queue"],
        )?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            emails_sent,
            emails_failed,
            emails_retried,
            emails_dead_lettered,
            send_duration,
            queue_depth,
        })
    }

    /// The registry backing these metrics, for exposition
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
