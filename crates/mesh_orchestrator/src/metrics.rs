use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, Gauge, IntCounter, Registry, TextEncoder};

/// A container for all Prometheus metric collectors for the orchestrator.
///
/// Wrapped in an `Arc` and shared by every component of a build.
pub struct Metrics {
    pub registry: Registry,
    /// Builds started through either the Wizard or the Queue.
    pub builds_started_total: IntCounter,
    /// Builds that ended in an error.
    pub builds_failed_total: IntCounter,
    /// Project-scoped presets patched by the Wizard driver.
    pub presets_patched_total: IntCounter,
    /// HTTP liveness probes sent to the Project Queue.
    pub queue_probes_total: IntCounter,
    /// Last progress percentage reported by the Reality Mesh processor.
    pub postprocess_progress: Gauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Creates a new `Metrics` struct, initializing and registering all collectors.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("mesh_orchestrator".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            builds_started_total: reg!(IntCounter::new(
                "builds_started_total",
                "Total number of builds started"
            )
            .unwrap()),
            builds_failed_total: reg!(IntCounter::new(
                "builds_failed_total",
                "Total number of builds that failed"
            )
            .unwrap()),
            presets_patched_total: reg!(IntCounter::new(
                "presets_patched_total",
                "Total number of project presets patched before autostart"
            )
            .unwrap()),
            queue_probes_total: reg!(IntCounter::new(
                "queue_probes_total",
                "Total number of Project Queue liveness probes"
            )
            .unwrap()),
            postprocess_progress: reg!(Gauge::new(
                "postprocess_progress_percent",
                "Last progress percentage reported by the Reality Mesh processor"
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("Failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("Metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }
}
