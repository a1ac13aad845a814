//! Health endpoints for the SFU coordinator.
//!
//! - `GET /health` - Liveness check (200 while the media engine worker is alive)
//! - `GET /ready` - Readiness check (200 once the signaling listener is bound,
//!   until the coordinator starts draining or the engine worker dies)
//!
//! Readiness is derived from coordinator state on every request, so draining and
//! engine death are reflected without the binary having to flip a flag. The
//! body names the current [`Readiness`] phase. `/metrics` is merged onto the
//! same router by the binary.

use crate::coordinator::Coordinator;
use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Readiness phase reported by `/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Signaling listener not bound yet.
    Starting,
    Ready,
    /// Shutdown in progress; new joins are rejected.
    Draining,
    /// The media engine worker died.
    EngineFailed,
}

impl Readiness {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Readiness::Starting => "starting",
            Readiness::Ready => "ready",
            Readiness::Draining => "draining",
            Readiness::EngineFailed => "engine_failed",
        }
    }

    #[must_use]
    pub fn is_ready(self) -> bool {
        self == Readiness::Ready
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health state backed by the coordinator and the engine's fatal token.
#[derive(Debug)]
pub struct HealthState {
    coordinator: Coordinator,
    /// Cancelled by `EngineEventActor` when the engine worker dies.
    engine_failed: CancellationToken,
    listening: AtomicBool,
}

impl HealthState {
    #[must_use]
    pub fn new(coordinator: Coordinator, engine_failed: CancellationToken) -> Self {
        Self {
            coordinator,
            engine_failed,
            listening: AtomicBool::new(false),
        }
    }

    /// Record that the signaling listener is bound and serving.
    pub fn mark_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    /// The process is live until the engine worker dies.
    #[must_use]
    pub fn is_live(&self) -> bool {
        !self.engine_failed.is_cancelled()
    }

    #[must_use]
    pub fn readiness(&self) -> Readiness {
        if self.engine_failed.is_cancelled() {
            Readiness::EngineFailed
        } else if self.coordinator.is_draining() {
            Readiness::Draining
        } else if self.listening.load(Ordering::SeqCst) {
            Readiness::Ready
        } else {
            Readiness::Starting
        }
    }
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(State(state): State<Arc<HealthState>>) -> StatusCode {
    if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn readiness_handler(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    let readiness = state.readiness();
    let status = if readiness.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, readiness.as_str())
}
