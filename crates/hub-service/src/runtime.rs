//! Hub assembly.
//!
//! [`HubRuntime`] wires the channel hub, the room registry and the
//! dispatcher over one set of repositories, and owns the shutdown token
//! they share. Used by the binary and by the test harness.

use crate::actors::{ActorMetrics, RoomDeps, RoomRegistryHandle, RoomSettings};
use crate::auth::Gatekeeper;
use crate::channels::ChannelHub;
use crate::chat::ChatSettings;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::observability::HealthState;
use crate::repositories::Repositories;
use crate::routes::{build_routes, AppState};

use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Upper bound on the registry's graceful shutdown.
const REGISTRY_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// A running hub without its listener.
pub struct HubRuntime {
    state: AppState,
    registry: RoomRegistryHandle,
    registry_task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl HubRuntime {
    /// Spawn the registry and build the shared state.
    ///
    /// Must be called inside a tokio runtime.
    #[must_use]
    pub fn start(config: &Config, repositories: Repositories) -> Self {
        let shutdown = CancellationToken::new();
        let channels = ChannelHub::new(config.outbound_queue_capacity);

        let deps = RoomDeps {
            appointments: Arc::clone(&repositories.appointments),
            channels: Arc::clone(&channels),
            settings: RoomSettings::from_config(config),
        };
        let (registry, registry_task) =
            RoomRegistryHandle::spawn(deps, ActorMetrics::new(), shutdown.child_token());

        let dispatcher = Dispatcher::new(
            &repositories,
            Arc::clone(&channels),
            registry.clone(),
            ChatSettings::from_config(config),
        );

        let state = AppState {
            dispatcher: Arc::new(dispatcher),
            gatekeeper: Gatekeeper::from_config(config),
            channels,
            health: Arc::new(HealthState::new()),
            shutdown: shutdown.clone(),
        };

        Self {
            state,
            registry,
            registry_task,
            shutdown,
        }
    }

    #[must_use]
    pub fn state(&self) -> &AppState {
        &self.state
    }

    #[must_use]
    pub fn registry(&self) -> &RoomRegistryHandle {
        &self.registry
    }

    #[must_use]
    pub fn router(&self, metrics_handle: Option<PrometheusHandle>) -> Router {
        build_routes(self.state.clone(), metrics_handle)
    }

    /// Token cancelled when [`HubRuntime::shutdown`] starts.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop accepting traffic, close every connection and drain the rooms.
    pub async fn shutdown(self) {
        self.state.health.begin_draining();
        self.shutdown.cancel();

        match tokio::time::timeout(REGISTRY_SHUTDOWN_TIMEOUT, self.registry_task).await {
            Ok(Ok(())) => info!(target: "hub.actor.registry", "Registry stopped"),
            Ok(Err(e)) => warn!(
                target: "hub.actor.registry",
                error = %e,
                "Registry task failed during shutdown"
            ),
            Err(_) => warn!(
                target: "hub.actor.registry",
                timeout_secs = REGISTRY_SHUTDOWN_TIMEOUT.as_secs(),
                "Registry shutdown timed out"
            ),
        }
    }
}
