//! Test server harness for E2E testing
//!
//! Provides `TestHubServer` for spawning real hub instances in tests.

use crate::fixtures::TEST_JWT_SECRET;

use hub_service::actors::RoomRegistryHandle;
use hub_service::config::Config;
use hub_service::repositories::memory::MemoryStore;
use hub_service::repositories::Repositories;
use hub_service::runtime::HubRuntime;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::task::JoinHandle;

/// Test harness for spawning the hub in E2E tests.
///
/// The server runs over in-memory repositories so tests can seed and
/// inspect state through the shared [`MemoryStore`].
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_health_flow_e2e() -> Result<(), anyhow::Error> {
///     let server = TestHubServer::spawn(MemoryStore::new()).await?;
///     let mut client = TestWsClient::connect(&server, &mint_token("U1", Role::User)).await?;
///     client.expect_event("connected").await?;
///     Ok(())
/// }
/// ```
pub struct TestHubServer {
    addr: SocketAddr,
    store: MemoryStore,
    config: Config,
    runtime: Option<HubRuntime>,
    handle: JoinHandle<()>,
}

impl TestHubServer {
    /// Spawn a server with the default test configuration.
    pub async fn spawn(store: MemoryStore) -> Result<Self, anyhow::Error> {
        Self::spawn_with(store, &[]).await
    }

    /// Spawn a server with extra `HUB_*` variables layered over the test
    /// defaults.
    ///
    /// The server will:
    /// - Bind to a random available port (127.0.0.1:0)
    /// - Start the HTTP server in the background
    /// - Report ready once bound
    pub async fn spawn_with(
        store: MemoryStore,
        overrides: &[(&str, &str)],
    ) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            ("HUB_JWT_SECRET".to_string(), TEST_JWT_SECRET.to_string()),
            ("HUB_BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
        ]);
        for (key, value) in overrides {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let runtime = HubRuntime::start(&config, Repositories::in_memory(&store));
        let app = runtime.router(None);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let shutdown = runtime.shutdown_token();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = server.await {
                eprintln!("Test server error: {}", e);
            }
        });
        runtime.state().health.set_ready();

        Ok(Self {
            addr,
            store,
            config,
            runtime: Some(runtime),
            handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Get the WebSocket endpoint URL.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Get the store backing the server's repositories.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the live room registry.
    pub fn registry(&self) -> &RoomRegistryHandle {
        self.runtime
            .as_ref()
            .map(HubRuntime::registry)
            .expect("server has not been shut down")
    }

    /// Run the full graceful shutdown and wait for it.
    pub async fn shutdown(mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown().await;
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for TestHubServer {
    fn drop(&mut self) {
        // Cancel the shared token so open sockets and rooms stop, then abort
        // the HTTP server task for immediate cleanup
        if let Some(runtime) = &self.runtime {
            runtime.shutdown_token().cancel();
        }
        self.handle.abort();
    }
}
