//! # Hub Test Utilities
//!
//! Shared test utilities for the coordination hub.
//!
//! This crate provides:
//! - Fixtures (token minting, seeded appointments and conversations)
//! - Server test harness (`TestHubServer` for E2E tests)
//! - WebSocket client (`TestWsClient`) speaking the hub's JSON frames
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hub_test_utils::*;
//!
//! #[tokio::test]
//! async fn test_example() -> Result<(), anyhow::Error> {
//!     let store = MemoryStore::new();
//!     seed_appointment(&store, "A1", "D1", "P1").await;
//!     let server = TestHubServer::spawn(store).await?;
//!
//!     let mut doctor = TestWsClient::connect(&server, &mint_token("D1", Role::Doctor)).await?;
//!     doctor.send("joinVideoCall", json!("A1")).await?;
//!     doctor.expect_event("joinedVideoCall").await?;
//!     Ok(())
//! }
//! ```

pub mod fixtures;
pub mod server_harness;
pub mod ws_client;

// Re-export commonly used items
pub use fixtures::*;
pub use server_harness::*;
pub use ws_client::*;

pub use common::types::{Identity, Role};
pub use hub_service::repositories::memory::MemoryStore;
