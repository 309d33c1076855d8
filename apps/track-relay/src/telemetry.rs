use std::path::Path;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use opentelemetry::{global, trace::TracerProvider, KeyValue};
use opentelemetry_sdk::{
    resource::Resource,
    trace::{Sampler, SdkTracerProvider},
};
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer,
};

const SERVICE_NAME: &str = "track-relay";
const OTEL_STDOUT_ENV: &str = "TRACK_RELAY_OTEL_STDOUT";
const DEFAULT_FILTER: &str = "info";
const ERROR_LOG_PREFIX: &str = "track-relay-errors.log";

/// Process-wide logging, tracing and metrics. Keep it alive for the lifetime of the process;
/// dropping it flushes pending spans.
pub struct Telemetry {
    metrics: Option<PrometheusHandle>,
    spans: Option<SdkTracerProvider>,
    _error_log: Option<WorkerGuard>,
}

impl Telemetry {
    /// `log_filter` wins over `RUST_LOG`. With `error_log_dir`, ERROR events are also written
    /// to a daily-rotated file there. The Prometheus recorder is only installed for the server;
    /// the watch client has nothing to scrape.
    pub fn init(
        log_filter: Option<&str>,
        error_log_dir: Option<&Path>,
        with_metrics: bool,
    ) -> Result<Self> {
        let metrics = with_metrics
            .then(|| PrometheusBuilder::new().install_recorder())
            .transpose()
            .context("failed to install Prometheus recorder")?;

        let filter = match log_filter {
            Some(directive) => EnvFilter::try_new(directive)
                .with_context(|| format!("invalid log filter `{directive}`"))?,
            None => EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        };

        let (error_layer, error_guard) = match error_log_dir {
            Some(dir) => {
                let (writer, guard) = error_file_writer(dir)?;
                let layer = tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true)
                    .with_writer(writer)
                    .with_filter(LevelFilter::ERROR);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        let spans = stdout_span_provider();
        let otel_layer = spans.as_ref().map(|provider| {
            tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME))
        });
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .with(otel_layer)
            .with(error_layer)
            .try_init()
            .context("failed to install tracing subscriber")?;
        if spans.is_some() {
            info!(env = OTEL_STDOUT_ENV, "exporting spans to stdout");
        }
        if let Some(dir) = error_log_dir {
            info!(dir = %dir.display(), "writing errors to a rotating log file");
        }

        Ok(Self {
            metrics,
            spans,
            _error_log: error_guard,
        })
    }

    pub fn metrics_handle(&self) -> Option<PrometheusHandle> {
        self.metrics.clone()
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        let Some(provider) = self.spans.take() else {
            return;
        };
        if let Err(err) = provider.shutdown() {
            warn!(error = %err, "span exporter did not shut down cleanly");
        }
    }
}

fn error_file_writer(dir: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, ERROR_LOG_PREFIX);
    Ok(tracing_appender::non_blocking(appender))
}

/// Span pipeline printing to stdout, enabled by `TRACK_RELAY_OTEL_STDOUT`.
fn stdout_span_provider() -> Option<SdkTracerProvider> {
    if !env_flag(OTEL_STDOUT_ENV) {
        return None;
    }
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", SERVICE_NAME)])
        .build();
    let provider = SdkTracerProvider::builder()
        .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        .with_sampler(Sampler::AlwaysOn)
        .with_resource(resource)
        .build();
    global::set_tracer_provider(provider.clone());
    Some(provider)
}

fn env_flag(key: &str) -> bool {
    std::env::var(key).is_ok_and(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}
