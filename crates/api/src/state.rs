use std::sync::Arc;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use ratelab_common::{AppConfig, RatelabResult};
use ratelab_rate_limit::RateLimiterEngine;

/// Shared state type alias used across all route handlers.
pub type SharedState = Arc<AppState>;

/// Central application state: the configuration it was built from, the
/// rate limiter engine and the metrics describing its decisions.
pub struct AppState {
    pub config: AppConfig,
    pub engine: RateLimiterEngine,
    pub metrics: LimiterMetrics,
    pub start_time: std::time::Instant,
}

/// Prometheus metrics describing admission decisions.
pub struct LimiterMetrics {
    pub registry: Registry,
    /// Decisions per policy; `outcome` is one of `admitted`, `queued` or
    /// `rejected`.
    pub requests_total: IntCounterVec,
    pub queue_wait: HistogramVec,
}

impl LimiterMetrics {
    /// Create the metrics and register them against a fresh registry.
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("ratelab_requests_total", "Admission decisions by policy and outcome"),
            &["policy", "outcome"],
        )
        .expect("failed to create requests_total counter");

        let queue_wait = HistogramVec::new(
            HistogramOpts::new(
                "ratelab_queue_wait_seconds",
                "Time queued requests waited before being admitted",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0]),
            &["policy"],
        )
        .expect("failed to create queue_wait histogram");

        registry
            .register(Box::new(requests_total.clone()))
            .expect("failed to register requests_total");
        registry
            .register(Box::new(queue_wait.clone()))
            .expect("failed to register queue_wait");

        Self {
            registry,
            requests_total,
            queue_wait,
        }
    }

    pub fn record(&self, policy: &str, outcome: &str) {
        self.requests_total.with_label_values(&[policy, outcome]).inc();
    }

    /// Sum of all decisions with the given outcome across policies.
    pub fn total(&self, outcome: &str) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name() == "ratelab_requests_total")
            .flat_map(|family| family.get_metric())
            .filter(|metric| {
                metric
                    .get_label()
                    .iter()
                    .any(|label| label.get_name() == "outcome" && label.get_value() == outcome)
            })
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }
}

impl Default for LimiterMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// Build the state, including the rate limiter engine, from `config`.
    pub fn new(config: AppConfig) -> RatelabResult<Self> {
        let engine = RateLimiterEngine::from_config(&config.rate_limit)?;
        Ok(Self::with_engine(config, engine))
    }

    /// Build the state around an existing engine.
    pub fn with_engine(config: AppConfig, engine: RateLimiterEngine) -> Self {
        Self {
            config,
            engine,
            metrics: LimiterMetrics::new(),
            start_time: std::time::Instant::now(),
        }
    }
}
