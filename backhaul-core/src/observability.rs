/*!
Observability for Backhaul.

- Structured logging setup (`init_observability`)
- Prometheus counters and an engine-duration histogram behind the `metrics`
  feature
*/

#[cfg(feature = "metrics")]
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounter, Opts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{BackhaulError, Result};

/// Filter applied when `RUST_LOG` is not set
pub const DEFAULT_LOG_FILTER: &str = "backhaul=info,backhaul_core=info,backhaul_retry=info";
const VERBOSE_LOG_FILTER: &str = "backhaul=debug,backhaul_core=debug,backhaul_retry=debug";

#[cfg(feature = "metrics")]
static METRICS: OnceLock<Option<BackhaulMetrics>> = OnceLock::new();

/// Metrics for engine runs and session handling
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct BackhaulMetrics {
    pub engine_runs_total: CounterVec,
    pub engine_failures_total: CounterVec,
    pub engine_duration_seconds: HistogramVec,
    pub credential_refreshes_total: IntCounter,
    pub retries_total: CounterVec,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn metric_error(name: &str, e: prometheus::Error) -> BackhaulError {
    BackhaulError::validation(format!("Failed to set up metric {name}: {e}"))
}

#[cfg(feature = "metrics")]
impl BackhaulMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let engine_runs_total = CounterVec::new(
            Opts::new("backhaul_engine_runs_total", "Engine commands started"),
            &["operation"],
        )
        .map_err(|e| metric_error("engine_runs_total", e))?;

        let engine_failures_total = CounterVec::new(
            Opts::new("backhaul_engine_failures_total", "Engine commands that failed"),
            &["operation"],
        )
        .map_err(|e| metric_error("engine_failures_total", e))?;

        let engine_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "backhaul_engine_duration_seconds",
                "Duration of engine commands in seconds",
            )
            .buckets(vec![1.0, 10.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0]),
            &["operation"],
        )
        .map_err(|e| metric_error("engine_duration_seconds", e))?;

        let credential_refreshes_total = IntCounter::new(
            "backhaul_credential_refreshes_total",
            "Session credentials issued or renewed",
        )
        .map_err(|e| metric_error("credential_refreshes_total", e))?;

        let retries_total = CounterVec::new(
            Opts::new("backhaul_retries_total", "Retry attempts by operation"),
            &["operation"],
        )
        .map_err(|e| metric_error("retries_total", e))?;

        registry
            .register(Box::new(engine_runs_total.clone()))
            .map_err(|e| metric_error("engine_runs_total", e))?;
        registry
            .register(Box::new(engine_failures_total.clone()))
            .map_err(|e| metric_error("engine_failures_total", e))?;
        registry
            .register(Box::new(engine_duration_seconds.clone()))
            .map_err(|e| metric_error("engine_duration_seconds", e))?;
        registry
            .register(Box::new(credential_refreshes_total.clone()))
            .map_err(|e| metric_error("credential_refreshes_total", e))?;
        registry
            .register(Box::new(retries_total.clone()))
            .map_err(|e| metric_error("retries_total", e))?;

        Ok(Self {
            engine_runs_total,
            engine_failures_total,
            engine_duration_seconds,
            credential_refreshes_total,
            retries_total,
            registry,
        })
    }

    /// The process-wide metrics, or `None` if they could not be registered
    pub fn global() -> Option<&'static BackhaulMetrics> {
        METRICS
            .get_or_init(|| match Self::new() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    tracing::warn!(error = %e, "Metrics disabled");
                    None
                }
            })
            .as_ref()
    }

    pub fn record_engine_run(&self, operation: &str) {
        self.engine_runs_total.with_label_values(&[operation]).inc();
    }

    pub fn record_engine_failure(&self, operation: &str) {
        self.engine_failures_total.with_label_values(&[operation]).inc();
    }

    pub fn record_engine_duration(&self, operation: &str, duration: std::time::Duration) {
        self.engine_duration_seconds
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    pub fn record_credential_refresh(&self) {
        self.credential_refreshes_total.inc();
    }

    pub fn record_retry(&self, operation: &str) {
        self.retries_total.with_label_values(&[operation]).inc();
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| metric_error("encoder", e))?;

        String::from_utf8(buffer)
            .map_err(|e| BackhaulError::validation(format!("Metrics are not UTF-8: {e}")))
    }
}

/// Measures one engine command
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: &'static str,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    /// Count an engine run and start timing it
    pub fn start_engine_operation(operation: &'static str) -> Self {
        if let Some(metrics) = BackhaulMetrics::global() {
            metrics.record_engine_run(operation);
        }
        Self {
            start: Instant::now(),
            operation,
        }
    }

    pub fn finish(self) {
        if let Some(metrics) = BackhaulMetrics::global() {
            metrics.record_engine_duration(self.operation, self.start.elapsed());
        }
    }

    pub fn finish_with_error(self) {
        if let Some(metrics) = BackhaulMetrics::global() {
            metrics.record_engine_duration(self.operation, self.start.elapsed());
            metrics.record_engine_failure(self.operation);
        }
    }
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence; otherwise Backhaul crates log at `info`, or
/// `debug` with `verbose`. `json` selects JSON lines over the human format.
pub fn init_observability(json: bool, verbose: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    BackhaulMetrics::global();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if verbose {
            VERBOSE_LOG_FILTER
        } else {
            DEFAULT_LOG_FILTER
        })
    });

    let result = if json {
        let subscriber = TracingRegistry::default().with(filter).with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .with_current_span(false),
        );
        set_global_default(subscriber)
    } else {
        let subscriber = TracingRegistry::default()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(verbose));
        set_global_default(subscriber)
    };

    result.map_err(|e| {
        BackhaulError::validation(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::debug!("Backhaul logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_observability(false, false);
        assert!(init_observability(true, true).is_err());
    }
}

#[cfg(all(test, feature = "metrics"))]
mod metrics_tests {
    use super::*;

    #[test]
    fn test_metrics_timer() {
        let timer = MetricsTimer::start_engine_operation("backup");
        timer.finish();
        let timer = MetricsTimer::start_engine_operation("restore");
        timer.finish_with_error();

        let metrics = BackhaulMetrics::global().unwrap();
        assert!(metrics.engine_failures_total.with_label_values(&["restore"]).get() >= 1.0);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = BackhaulMetrics::global().unwrap();
        metrics.record_credential_refresh();
        metrics.record_retry("repair index");

        let text = metrics.gather_metrics().unwrap();
        assert!(text.contains("backhaul_credential_refreshes_total"));
        assert!(text.contains("backhaul_retries_total"));
    }
}
