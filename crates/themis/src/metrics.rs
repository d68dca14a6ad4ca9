//! Prometheus metrics for the judge

use std::sync::{LazyLock, Once};

use axum::http::StatusCode;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use themis_common::Verdict;

/// Global metrics registry
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Execution duration histogram
pub static EXECUTION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let opts = HistogramOpts::new(
        "judge_execution_duration_seconds",
        "Wall time spent judging one submission",
    )
    .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]);

    Histogram::with_opts(opts).expect("Failed to create histogram")
});

/// Verdict counter by type
pub static VERDICT_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("judge_verdict_total", "Total verdicts by type");
    IntCounterVec::new(opts, &["verdict"]).expect("Failed to create counter")
});

/// Jobs processed counter
pub static JOBS_PROCESSED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("judge_jobs_processed_total", "Total jobs processed")
        .expect("Failed to create counter")
});

/// Jobs that ended in JUDGE_ERROR
pub static JOBS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("judge_jobs_failed_total", "Total jobs that failed")
        .expect("Failed to create counter")
});

/// Currently active jobs gauge
pub static ACTIVE_JOBS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("judge_active_jobs", "Currently active judging jobs")
        .expect("Failed to create gauge")
});

/// Queued submissions per lane
pub static QUEUE_DEPTH: LazyLock<IntGaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("judge_queue_depth", "Submissions waiting in the queue");
    IntGaugeVec::new(opts, &["lane"]).expect("Failed to create gauge")
});

/// Infrastructure retries
pub static RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("judge_retries_total", "Judging attempts retried after a failure")
        .expect("Failed to create counter")
});

/// Submissions rejected at intake, by reason
pub static INTAKE_REJECTED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let opts = Opts::new("judge_intake_rejected_total", "Submissions rejected at intake");
    IntCounterVec::new(opts, &["reason"]).expect("Failed to create counter")
});

/// Lost compare-and-swap races on aggregate statistics
pub static STATS_CONFLICTS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "judge_stats_conflicts_total",
        "Statistics updates retried after a concurrent write",
    )
    .expect("Failed to create counter")
});

static INIT: Once = Once::new();

/// Initialize and register all metrics
pub fn init_metrics() {
    INIT.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(EXECUTION_DURATION.clone()),
            Box::new(VERDICT_TOTAL.clone()),
            Box::new(JOBS_PROCESSED.clone()),
            Box::new(JOBS_FAILED.clone()),
            Box::new(ACTIVE_JOBS.clone()),
            Box::new(QUEUE_DEPTH.clone()),
            Box::new(RETRIES.clone()),
            Box::new(INTAKE_REJECTED.clone()),
            Box::new(STATS_CONFLICTS.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!("Failed to register metric: {}", e);
            }
        }
    });
}

/// Record a verdict
pub fn record_verdict(verdict: Verdict) {
    VERDICT_TOTAL.with_label_values(&[verdict.code()]).inc();
}

/// Record how long one submission took to judge
pub fn record_execution(duration_secs: f64) {
    EXECUTION_DURATION.observe(duration_secs);
}

/// Record the current queue depth of a lane
pub fn set_queue_depth(lane: &str, depth: usize) {
    QUEUE_DEPTH.with_label_values(&[lane]).set(depth as i64);
}

/// Record an intake rejection
pub fn record_rejection(reason: &str) {
    INTAKE_REJECTED.with_label_values(&[reason]).inc();
}

/// Render the registry in the Prometheus text format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// HTTP server for Prometheus metrics endpoint
pub struct MetricsServer;

impl MetricsServer {
    /// Run the metrics server
    pub async fn run(port: u16) -> anyhow::Result<()> {
        use axum::{routing::get, Router};
        use std::net::SocketAddr;

        init_metrics();

        let app = Router::new()
            .route("/metrics", get(Self::metrics_handler))
            .route("/health", get(|| async { "OK" }));

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        tracing::info!("Metrics server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }

    async fn metrics_handler() -> Result<String, (StatusCode, String)> {
        render().map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_registered_metrics() {
        init_metrics();
        init_metrics();
        record_verdict(Verdict::WrongAnswer);
        set_queue_depth("contest", 3);

        let text = render().unwrap();
        assert!(text.contains("judge_verdict_total"));
        assert!(text.contains("judge_queue_depth"));
    }
}
