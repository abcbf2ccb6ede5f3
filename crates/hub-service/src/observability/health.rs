//! Health endpoints for the coordination hub.
//!
//! - `GET /health` - Liveness probe (is the process running?)
//! - `GET /ready` - Readiness probe (bound and accepting WebSocket upgrades)
//!
//! Both answer with a small JSON body naming the current phase. `/ready`
//! reports 503 while starting and again once draining begins, so load
//! balancers stop routing new sockets before open ones are closed.
//!
//! `GET /metrics` is served by the router in [`crate::routes`] from the
//! Prometheus handle.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle phase reported by the probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Ready,
    Draining,
}

impl Phase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Phase::Ready,
            2 => Phase::Draining,
            _ => Phase::Starting,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Phase::Starting => 0,
            Phase::Ready => 1,
            Phase::Draining => 2,
        }
    }
}

/// Shared probe state. Starts in [`Phase::Starting`].
#[derive(Debug, Default)]
pub struct HealthState {
    phase: AtomicU8,
}

impl HealthState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The listener is bound. Ignored once draining has begun.
    pub fn set_ready(&self) {
        let _ = self.phase.compare_exchange(
            Phase::Starting.as_u8(),
            Phase::Ready.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Shutdown has started. Irreversible.
    pub fn begin_draining(&self) {
        self.phase.store(Phase::Draining.as_u8(), Ordering::SeqCst);
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// The process answers at all, including while draining.
    #[must_use]
    pub fn is_live(&self) -> bool {
        true
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.phase() == Phase::Ready
    }
}

#[derive(Debug, Serialize)]
struct ProbeBody {
    status: Phase,
}

/// Create the health router with liveness and readiness endpoints.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness_handler))
        .route("/ready", get(readiness_handler))
        .with_state(health_state)
}

async fn liveness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ProbeBody>) {
    let status = if state.is_live() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProbeBody { status: state.phase() }))
}

async fn readiness_handler(
    State(state): State<Arc<HealthState>>,
) -> (StatusCode, Json<ProbeBody>) {
    let status = if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(ProbeBody { status: state.phase() }))
}
