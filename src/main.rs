use anyhow::{Context, Result};
use clap::Parser;
use futures::stream::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use streamscribe::audio::{AudioNormalizer, SpeechGate};
use streamscribe::clock::{Clock, SystemClock};
use streamscribe::events::{AudioChunkMessage, EndOfStreamMessage, JoinSessionMessage};
use streamscribe::kv::{KvStore, MemoryKvStore};
use streamscribe::limiter::RateLimiter;
use streamscribe::metrics::MetricsEngine;
use streamscribe::session::{PipelineServices, SessionManager};
use streamscribe::stt::{CircuitBreaker, NatsTranscriber, TranscriptionInvoker};
use streamscribe::transport::TransportClient;
use streamscribe::{create_router, AppState, Config};

#[derive(Debug, Parser)]
#[command(name = "streamscribe", about = "Live audio transcription pipeline")]
struct Args {
    /// Path to the configuration file (without extension)
    #[arg(long, default_value = "config/streamscribe")]
    config: String,

    /// Override the HTTP status API port
    #[arg(long)]
    http_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config))?;

    info!("Streamscribe v0.1.0");
    info!("Loaded config: {}", cfg.service.name);

    let transport = Arc::new(TransportClient::connect(&cfg.nats.url).await?);

    // Shared services: constructed once, injected everywhere.
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
    let limiter = Arc::new(RateLimiter::new(
        cfg.limiter.clone(),
        store.clone(),
        clock.clone(),
    ));
    let breaker = Arc::new(CircuitBreaker::new(cfg.breaker, clock.clone()));
    let backend = Arc::new(NatsTranscriber::new(
        transport.nats(),
        cfg.nats.stt_subject.clone(),
        Duration::from_millis(cfg.nats.stt_timeout_ms),
    ));
    let invoker = TranscriptionInvoker::new(backend, breaker, limiter.clone(), cfg.retry);
    let metrics = Arc::new(MetricsEngine::new(cfg.metrics));

    let services = Arc::new(PipelineServices {
        normalizer: AudioNormalizer::new(cfg.normalizer.clone()),
        gate: SpeechGate::new(cfg.gate),
        invoker,
        limiter,
        metrics: metrics.clone(),
        store,
        clock,
        filter_config: cfg.filter.clone(),
        session_config: cfg.session.clone(),
    });

    let (events_tx, mut events_rx) = mpsc::channel(1024);
    let manager = Arc::new(SessionManager::new(services, events_tx));

    // Event publisher: drains worker events out to NATS.
    let publisher = transport.clone();
    tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            if let Err(e) = publisher.publish_event(&event).await {
                error!(
                    session_id = event.session_id(),
                    "failed to publish event: {e}"
                );
            }
        }
    });

    // Chunk ingress.
    let mut chunks = transport.subscribe_chunks().await?;
    let chunk_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(msg) = chunks.next().await {
            match serde_json::from_slice::<AudioChunkMessage>(&msg.payload) {
                Ok(chunk) => chunk_manager.handle_chunk(chunk).await,
                Err(e) => warn!("failed to parse audio chunk message: {e}"),
            }
        }
    });

    // Session joins.
    let mut joins = transport.subscribe_joins().await?;
    let join_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(msg) = joins.next().await {
            match serde_json::from_slice::<JoinSessionMessage>(&msg.payload) {
                Ok(join) => join_manager.handle_join(join).await,
                Err(e) => warn!("failed to parse join message: {e}"),
            }
        }
    });

    // Explicit end-of-stream markers.
    let mut ends = transport.subscribe_ends().await?;
    let end_manager = manager.clone();
    tokio::spawn(async move {
        while let Some(msg) = ends.next().await {
            match serde_json::from_slice::<EndOfStreamMessage>(&msg.payload) {
                Ok(end) => end_manager.handle_end(end).await,
                Err(e) => warn!("failed to parse end-of-stream message: {e}"),
            }
        }
    });

    // Idle-session eviction sweep.
    manager.clone().spawn_sweeper();

    // Periodic QA report snapshots.
    let report_transport = transport.clone();
    let report_metrics = metrics.clone();
    let report_interval = cfg.metrics.report_interval_secs;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(report_interval));
        loop {
            interval.tick().await;
            let report = report_metrics.report();
            if let Err(e) = report_transport.publish_report(&report).await {
                warn!("failed to publish metrics report: {e}");
            }
        }
    });

    // HTTP status API.
    let state = AppState::new(manager.clone(), metrics);
    let router = create_router(state);
    let port = args.http_port.unwrap_or(cfg.service.http.port);
    let addr = format!("{}:{}", cfg.service.http.bind, port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("HTTP status API listening on {}", addr);

    tokio::select! {
        result = async { axum::serve(listener, router).await } => {
            result.context("HTTP server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping");
        }
    }

    Ok(())
}
