use prometheus::{Encoder, Histogram, IntCounter, Registry, TextEncoder};
use std::sync::{Arc, LazyLock};

static GLOBAL: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// Process-wide collector. Counters clone by handle, so every clone
/// reports into the same registry.
pub fn global() -> &'static Metrics {
    &GLOBAL
}

/// Metrics collector for observability
#[derive(Clone)]
pub struct Metrics {
    pub requests_total: IntCounter,
    pub submissions_total: IntCounter,
    pub callbacks_total: IntCounter,
    pub shards_completed: IntCounter,
    pub shards_failed: IntCounter,
    pub enrichment_failures: IntCounter,
    pub provider_latency: Histogram,
    registry: Arc<Registry>,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounter::new(
            "prompt_runner_requests_total",
            "Total number of HTTP requests processed",
        )
        .expect("metric creation");

        let submissions_total = IntCounter::new(
            "prompt_runner_submissions_total",
            "Total number of accepted prompt submissions",
        )
        .expect("metric creation");

        let callbacks_total = IntCounter::new(
            "prompt_runner_callbacks_total",
            "Total number of provider callbacks received",
        )
        .expect("metric creation");

        let shards_completed = IntCounter::new(
            "prompt_runner_shards_completed_total",
            "Total number of shards that completed",
        )
        .expect("metric creation");

        let shards_failed = IntCounter::new(
            "prompt_runner_shards_failed_total",
            "Total number of shards that failed",
        )
        .expect("metric creation");

        let enrichment_failures = IntCounter::new(
            "prompt_runner_enrichment_failures_total",
            "Total number of enrichment analyses that fell back to defaults",
        )
        .expect("metric creation");

        let provider_latency = Histogram::with_opts(prometheus::HistogramOpts::new(
            "prompt_runner_provider_latency_seconds",
            "External provider call latency in seconds",
        ))
        .expect("metric creation");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(submissions_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(callbacks_total.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(shards_completed.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(shards_failed.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(enrichment_failures.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(provider_latency.clone()))
            .expect("metric registration");

        Self {
            requests_total,
            submissions_total,
            callbacks_total,
            shards_completed,
            shards_failed,
            enrichment_failures,
            provider_latency,
            registry: Arc::new(registry),
        }
    }

    /// Export metrics in Prometheus format
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        match encoder.encode(&metric_families, &mut buffer) {
            Ok(()) => String::from_utf8(buffer).unwrap_or_default(),
            Err(_) => String::new(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
