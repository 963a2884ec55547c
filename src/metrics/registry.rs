use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0];

/// Histogram bucket boundaries for relayed body size (bytes).
const SIZE_BUCKETS: &[f64] = &[100.0, 1000.0, 1e4, 1e5, 5e5, 1e6, 2e6];

/// Thin handle around the global metrics recorder. This is the statistics-store
/// collaborator referenced throughout the router: per-request usage
/// counters and durations are recorded directly against it rather than through
/// a separate out-of-scope dashboard store.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) can be used anywhere in the codebase. The `PrometheusHandle`
/// is retained solely for rendering the `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    ///
    /// Must be called **once** at startup before any `counter!` / `gauge!` /
    /// `histogram!` calls.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_bytes".to_string()),
                SIZE_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // jobs
        describe_counter!("router_jobs_enqueued_total", Unit::Count, "Jobs enqueued per service");
        describe_counter!("router_jobs_completed_total", Unit::Count, "Jobs that received an HTTP response");
        describe_counter!("router_jobs_failed_total", Unit::Count, "Jobs that never reached an HTTP response");
        describe_counter!("router_http_retries_total", Unit::Count, "HTTP transport retries issued");
        describe_histogram!("router_job_duration_seconds", Unit::Seconds, "Time from job dequeue to response emission");

        // bytes
        describe_counter!("router_bytes_in_total", Unit::Bytes, "Request bytes relayed to local services");
        describe_counter!("router_bytes_out_total", Unit::Bytes, "Response bytes relayed back over the overlay");

        // uploads
        describe_counter!("router_upload_finalized_total", Unit::Count, "Upload sessions finalized with a complete body");
        describe_counter!("router_upload_timed_out_total", Unit::Count, "Upload sessions that timed out or gave up partial");

        // port isolation
        describe_counter!("router_port_isolation_rejections_total", Unit::Count, "Outgoing requests rejected by the port whitelist");
        describe_counter!("router_port_isolation_grants_total", Unit::Count, "Ports added to a whitelist via on-demand or periodic discovery");

        // bridge
        describe_counter!("router_bridge_restarts_total", Unit::Count, "Bridge child-process restarts");
        describe_gauge!("router_bridge_up", Unit::Count, "Whether a service's bridge currently has an assigned address: 1=up 0=down");

        // rotation
        describe_counter!("router_rate_limit_rotations_total", Unit::Count, "Seed rotations triggered by sustained rate limiting");

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
