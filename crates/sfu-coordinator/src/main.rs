//! SFU Coordinator
//!
//! WebSocket signaling server and entity-lifecycle coordinator for an SFU.
//!
//! # Servers
//!
//! - WebSocket signaling server (default: 0.0.0.0:3001, route `/sfu`)
//! - HTTP server for health and metrics (default: 0.0.0.0:3002)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Start the media engine (failure is fatal)
//! 4. Spawn the engine event actor
//! 5. Start health HTTP server (liveness, readiness, metrics)
//! 6. Start WebSocket signaling server
//! 7. Wait for shutdown signal or engine worker death

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use sfu_coordinator::actors::{ActorMetrics, EngineEventActor};
use sfu_coordinator::config::Config;
use sfu_coordinator::coordinator::Coordinator;
use sfu_coordinator::engine::{LocalEngine, LocalEngineConfig, MediaEngine};
use sfu_coordinator::observability::{health_router, init_metrics_recorder, HealthState};
use sfu_coordinator::registry::SessionLimits;
use sfu_coordinator::server::{signaling_router, SignalingState};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Time given to connection tasks to finish after cancellation.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sfu_coordinator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting SFU Coordinator");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        sfu_id = %config.sfu_id,
        bind_address = %config.bind_address,
        ws_path = %config.ws_path,
        health_bind_address = %config.health_bind_address,
        announced_ip = %config.announced_ip,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        max_connections = config.max_connections,
        max_sessions = config.max_sessions,
        max_participants_per_session = config.max_participants_per_session,
        "Configuration loaded successfully"
    );

    // This must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    // Media engine (MUST succeed - signaling is useless without it)
    info!("Starting media engine...");
    let engine = LocalEngine::new(LocalEngineConfig::from_config(&config)).map_err(|e| {
        error!(error = %e, "Failed to start media engine");
        e
    })?;
    let engine_events = engine
        .take_events()
        .ok_or("Media engine event stream already taken")?;
    let engine: Arc<dyn MediaEngine> = Arc::new(engine);
    info!("Media engine started");

    let coordinator = Coordinator::new(
        Arc::clone(&engine),
        SessionLimits {
            max_sessions: config.max_sessions,
            max_participants_per_session: config.max_participants_per_session,
        },
    );
    let actor_metrics = ActorMetrics::new();

    let shutdown_token = CancellationToken::new();
    let fatal_token = CancellationToken::new();

    let engine_events_task = EngineEventActor::spawn(
        coordinator.clone(),
        engine_events,
        shutdown_token.child_token(),
        fatal_token.clone(),
    );

    // Readiness follows coordinator draining and engine death
    let health_state = Arc::new(HealthState::new(coordinator.clone(), fatal_token.clone()));

    // Start health HTTP server (MUST succeed - fail startup if it doesn't)
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state)).merge(metrics_router);

    // Bind listener BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // Start WebSocket signaling server
    let signaling_addr: SocketAddr = config.bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;

    let signaling_app = signaling_router(
        SignalingState {
            coordinator: coordinator.clone(),
            metrics: Arc::clone(&actor_metrics),
            max_connections: config.max_connections,
            shutdown: shutdown_token.child_token(),
        },
        &config.ws_path,
    );

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;

    let signaling_shutdown_token = shutdown_token.child_token();
    let signaling_task = tokio::spawn(async move {
        info!(addr = %signaling_addr, "Signaling server starting");
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.mark_listening();
    info!(
        addr = %signaling_addr,
        ws_path = %config.ws_path,
        "SFU Coordinator running - press Ctrl+C to shutdown"
    );

    let engine_failed = tokio::select! {
        () = shutdown_signal() => {
            info!("Shutdown signal received, initiating graceful shutdown...");
            false
        }
        () = fatal_token.cancelled() => {
            error!("Media engine worker died, shutting down");
            true
        }
    };

    // Draining drops readiness so no new traffic is routed here
    coordinator.begin_drain();
    shutdown_token.cancel();

    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, signaling_task)
        .await
        .is_err()
    {
        warn!("Signaling server did not stop within the grace period");
    }
    match engine_events_task.await {
        Ok(events) => info!(
            events_processed = events.events_processed,
            peak_backlog = events.peak_backlog,
            "Engine event actor stopped"
        ),
        Err(e) => error!(error = %e, "Engine event actor failed"),
    }

    let stats = coordinator.stats().await;
    info!(
        clients = stats.clients,
        sessions = stats.sessions,
        transports = stats.transports,
        "SFU Coordinator shutdown complete"
    );

    if engine_failed {
        return Err("media engine worker died".into());
    }
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed. This is acceptable because
/// without signal handlers, we cannot gracefully shut down the service.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
