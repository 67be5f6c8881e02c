//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry, register_histogram_with_registry,
};
use std::sync::Arc;
use once_cell::sync::Lazy;

/// Global metrics registry
pub static METRICS: Lazy<Arc<Metrics>> = Lazy::new(|| {
    Arc::new(Metrics::new().expect("Failed to initialize metrics"))
});

/// Metrics collector
pub struct Metrics {
    registry: Registry,

    // Stream metrics
    pub stream_events: CounterVec,
    pub stream_events_dropped: CounterVec,
    pub stream_stalls: Counter,

    // Turn metrics
    pub turns: CounterVec,

    // Remote collaborators
    pub checkpoint_loads: CounterVec,
    pub compression_batches: CounterVec,
    pub remote_call_duration: HistogramVec,

    // Token metrics
    pub estimated_tokens: Histogram,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let stream_events = register_counter_vec_with_registry!(
            Opts::new("stream_events_total", "Stream events applied by kind"),
            &["kind"],
            registry
        )?;

        let stream_events_dropped = register_counter_vec_with_registry!(
            Opts::new("stream_events_dropped_total", "Stream events discarded by reason"),
            &["reason"],
            registry
        )?;

        let stream_stalls = register_counter_with_registry!(
            Opts::new("stream_stalls_total", "Streams that went silent past the stall timeout"),
            registry
        )?;

        let turns = register_counter_vec_with_registry!(
            Opts::new("turns_total", "Turns by outcome"),
            &["outcome"],
            registry
        )?;

        let checkpoint_loads = register_counter_vec_with_registry!(
            Opts::new("checkpoint_loads_total", "Checkpoint history loads"),
            &["status"],
            registry
        )?;

        let compression_batches = register_counter_vec_with_registry!(
            Opts::new("compression_batches_total", "Compression batches"),
            &["status"],
            registry
        )?;

        let remote_call_duration = register_histogram_vec_with_registry!(
            "remote_call_duration_seconds",
            "Remote collaborator call duration in seconds",
            &["operation"],
            registry
        )?;

        let estimated_tokens = register_histogram_with_registry!(
            HistogramOpts::new("estimated_tokens", "Locally estimated transcript tokens")
                .buckets(vec![100.0, 1_000.0, 4_000.0, 16_000.0, 64_000.0, 128_000.0, 256_000.0]),
            registry
        )?;

        Ok(Self {
            registry,
            stream_events,
            stream_events_dropped,
            stream_stalls,
            turns,
            checkpoint_loads,
            compression_batches,
            remote_call_duration,
            estimated_tokens,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record an applied stream event
    pub fn record_event(&self, kind: &str) {
        self.stream_events.with_label_values(&[kind]).inc();
    }

    /// Record a discarded stream event
    pub fn record_dropped(&self, reason: &str) {
        self.stream_events_dropped.with_label_values(&[reason]).inc();
    }

    /// Record a turn outcome
    pub fn record_turn(&self, outcome: &str) {
        self.turns.with_label_values(&[outcome]).inc();
    }

    /// Record a checkpoint load
    pub fn record_checkpoint_load(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.checkpoint_loads.with_label_values(&[status]).inc();
    }

    /// Record a compression batch
    pub fn record_compression(&self, success: bool) {
        let status = if success { "success" } else { "error" };
        self.compression_batches.with_label_values(&[status]).inc();
    }

    /// Record a local token estimate
    pub fn record_estimate(&self, tokens: usize) {
        self.estimated_tokens.observe(tokens as f64);
    }

    /// Export metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer).unwrap_or_default();

        String::from_utf8(buffer).unwrap_or_default()
    }
}

/// Render the global registry in Prometheus text format
pub fn gather_text() -> String {
    METRICS.export_prometheus()
}

/// Helper macro to time operations
#[macro_export]
macro_rules! time_operation {
    ($histogram:expr, $label:expr, $operation:expr) => {{
        let timer = $histogram.with_label_values(&[$label]).start_timer();
        let result = $operation;
        timer.observe_duration();
        result
    }};
}
