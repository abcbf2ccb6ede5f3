//! HTTP routes for the coordination hub.
//!
//! Defines the Axum router and application state.

use crate::auth::Gatekeeper;
use crate::channels::ChannelHub;
use crate::dispatch::Dispatcher;
use crate::observability::{health_router, HealthState};
use crate::ws;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Routes inbound events.
    pub dispatcher: Arc<Dispatcher>,

    /// Handshake authentication.
    pub gatekeeper: Gatekeeper,

    /// Connection registry and outbound queues.
    pub channels: Arc<ChannelHub>,

    /// Liveness and readiness.
    pub health: Arc<HealthState>,

    /// Cancelled when the process starts shutting down.
    pub shutdown: CancellationToken,
}

/// Build the application routes.
///
/// Creates an Axum router with:
/// - `/ws` - WebSocket endpoint for all realtime traffic
/// - `/health` - Liveness probe
/// - `/ready` - Readiness probe
/// - `/metrics` - Prometheus metrics endpoint, when a recorder is installed
/// - TraceLayer for request logging
/// - 30 second timeout on the HTTP side (an upgraded socket is not bounded)
pub fn build_routes(state: AppState, metrics_handle: Option<PrometheusHandle>) -> Router {
    let health_routes = health_router(Arc::clone(&state.health));

    let ws_routes = Router::new()
        .route("/ws", get(ws::ws_handler))
        .with_state(state);

    let mut app = ws_routes.merge(health_routes);

    if let Some(handle) = metrics_handle {
        let metrics_routes = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(handle);
        app = app.merge(metrics_routes);
    }

    app.layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
}

/// Render the Prometheus text exposition.
#[tracing::instrument(skip_all, name = "hub.metrics.scrape")]
async fn metrics_handler(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    handle.render()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::repositories::memory::MemoryStore;
    use crate::repositories::Repositories;
    use crate::runtime::HubRuntime;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::collections::HashMap;
    use tower::util::ServiceExt;

    fn config() -> Config {
        let vars = HashMap::from([(
            "HUB_JWT_SECRET".to_string(),
            "routes-test-secret-0123456789abcdef".to_string(),
        )]);
        Config::from_vars(&vars).unwrap()
    }

    #[test]
    fn test_app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[tokio::test]
    async fn test_health_routes_are_mounted() {
        let runtime = HubRuntime::start(&config(), Repositories::in_memory(&MemoryStore::new()));
        let app = build_routes(runtime.state().clone(), None);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Readiness flips only once the server is bound
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        runtime.shutdown().await;
    }

    #[tokio::test]
    async fn test_metrics_route_absent_without_recorder() {
        let runtime = HubRuntime::start(&config(), Repositories::in_memory(&MemoryStore::new()));
        let app = build_routes(runtime.state().clone(), None);

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        runtime.shutdown().await;
    }
}
