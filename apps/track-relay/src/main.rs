use std::{collections::HashSet, future::IntoFuture, sync::Arc, time::Instant};

use anyhow::{anyhow, Context, Result};
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use clap::Parser;
use dashmap::DashMap;
use metrics_exporter_prometheus::PrometheusHandle;
use relay_bus::{Bus, LocalBus};
use serde_json::json;
use tokio::{signal, task::JoinHandle, time::timeout};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};
use track_mux::{Multiplexer, SessionId, StreamState};

mod config;
mod hashtags;
mod redis_bus;
mod scoring;
mod telemetry;
mod upstream;
mod watch;
mod ws;

use config::{Cli, Commands, ServerConfig};
use ws::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Watch {
        url,
        keyword,
        count,
    }) = cli.command
    {
        let _telemetry =
            telemetry::Telemetry::init(cli.serve.log_filter.as_deref(), None, false)?;
        return watch::run_watch(url, keyword, count).await;
    }

    let telemetry = telemetry::Telemetry::init(
        cli.serve.log_filter.as_deref(),
        cli.serve.error_log_dir.as_deref(),
        true,
    )?;
    let config = ServerConfig::try_from(cli.serve)?;
    info!(
        listen_addr = %config.listen_addr,
        redis = config.redis_url.is_some(),
        upstream = %config.upstream.endpoint,
        "starting track-relay"
    );

    let metrics = telemetry
        .metrics_handle()
        .ok_or_else(|| anyhow!("metrics recorder not installed"))?;
    run(config, metrics).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let bus: Arc<dyn Bus> = match &config.redis_url {
        Some(url) => Arc::new(redis_bus::RedisBus::connect(url).await?),
        None => {
            info!(target = "relay.bus", "no redis configured; relaying in-process");
            Arc::new(LocalBus::new())
        }
    };
    let upstream = upstream::HttpStreamUpstream::new(config.upstream.clone())
        .context("failed to build upstream client")?;

    let (mux, mut worker) = Multiplexer::start(
        config.worker.clone(),
        Arc::new(upstream),
        Arc::new(scoring::LexiconScorer::new()),
        Arc::new(hashtags::HashtagFrequencies),
        bus.clone(),
    )
    .context("failed to start stream worker")?;

    let app = Arc::new(AppState {
        mux: mux.clone(),
        bus,
        sockets: DashMap::new(),
        session_buffer: config.session_buffer,
        metrics,
    });
    let reconciler = spawn_reconciler(app.clone(), config.reconcile_interval);

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/track", get(ws::track_handler))
        .with_state(app.clone())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("track-relay listening on {}", config.listen_addr);

    let server = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .into_future();
    tokio::select! {
        served = server => served.context("server shutdown with error")?,
        exited = worker.wait() => {
            reconciler.abort();
            return match exited {
                Ok(()) => Err(anyhow!("stream worker stopped unexpectedly")),
                Err(err) => Err(err).context("stream worker failed"),
            };
        }
    }

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping stream worker"
    );
    reconciler.abort();
    if let Err(err) = mux.shutdown() {
        warn!(error = %err, "stream worker already gone");
    }
    match timeout(config.shutdown_grace, worker.wait()).await {
        Ok(Ok(())) => info!("graceful shutdown complete"),
        Ok(Err(err)) => error!(error = %err, "stream worker failed during shutdown"),
        Err(_) => warn!("stream worker did not stop within the grace period"),
    }
    Ok(())
}

/// Periodically tells the worker which sockets are still open so sessions that vanished
/// without a clean close are dropped, and releases relay topics nobody listens on.
fn spawn_reconciler(app: Arc<AppState>, every: std::time::Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let taken_at = Instant::now();
            let live: HashSet<SessionId> =
                app.sockets.iter().map(|entry| entry.key().clone()).collect();
            let sockets = live.len();
            if let Err(err) = app.mux.sync_sessions(live, taken_at) {
                warn!(error = %err, "reconciler stopping; worker is gone");
                break;
            }
            let pruned = app.bus.prune();
            debug!(sockets, pruned, "reconciled sessions");
        }
    })
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let status = state.mux.status();
    let code = if status.terminated {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    let body = json!({
        "status": if status.terminated { "failed" } else { "ok" },
        "stream": status.state,
        "streaming": status.state == StreamState::Running,
        "suppressed": status.suppressed,
        "filters": status.filters,
        "sessions": state.mux.session_count(),
        "sockets": state.sockets.len(),
        "restarts": status.restarts,
    });
    (code, Json(body))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}
