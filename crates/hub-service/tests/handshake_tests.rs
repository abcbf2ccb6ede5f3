//! End-to-end tests for handshake authentication and frame handling.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;

use hub_test_utils::*;
use serde_json::json;

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_without_valid_token_is_refused() -> Result<(), anyhow::Error> {
    let server = TestHubServer::spawn(MemoryStore::new()).await?;

    assert_eq!(refused_handshake_status(&server, None).await?, Some(401));
    assert_eq!(
        refused_handshake_status(&server, Some("not-a-jwt")).await?,
        Some(401)
    );
    assert_eq!(
        refused_handshake_status(&server, Some(mint_forged_token("U1", Role::User).as_str())).await?,
        Some(401)
    );
    assert_eq!(
        refused_handshake_status(&server, Some(mint_expired_token("U1", Role::User).as_str())).await?,
        Some(401)
    );
    assert_eq!(
        refused_handshake_status(&server, Some(mint_token("U1", Role::User).as_str())).await?,
        None
    );
    Ok(())
}

#[tokio::test]
async fn test_connected_event_carries_identity() -> Result<(), anyhow::Error> {
    let server = TestHubServer::spawn(MemoryStore::new()).await?;

    let mut client = TestWsClient::connect(&server, &mint_token("D1", Role::Doctor)).await?;
    let connected = client.expect_event("connected").await?;
    assert_eq!(connected["userId"], "D1");
    assert_eq!(connected["role"], "doctor");
    assert!(connected["connectionId"].is_string());
    Ok(())
}

#[tokio::test]
async fn test_query_parameter_token_is_accepted() -> Result<(), anyhow::Error> {
    let server = TestHubServer::spawn(MemoryStore::new()).await?;

    let mut client =
        TestWsClient::connect_with_query(&server, &mint_token("P1", Role::User)).await?;
    let connected = client.expect_event("connected").await?;
    assert_eq!(connected["userId"], "P1");
    Ok(())
}

#[tokio::test]
async fn test_anonymous_mode_admits_but_requires_identity_per_event() -> Result<(), anyhow::Error> {
    let store = MemoryStore::new();
    seed_conversation(&store, "C1", &["S", "R"]).await;
    let server = TestHubServer::spawn_with(store, &[("HUB_ALLOW_ANONYMOUS", "true")]).await?;

    let mut client = TestWsClient::connect_anonymous(&server).await?;
    let connected = client.expect_event("connected").await?;
    assert!(connected.get("userId").is_none());

    client.send("join", json!("C1")).await?;
    let error = client.expect_event("error").await?;
    assert_eq!(error["code"], "UNAUTHENTICATED");
    Ok(())
}

// ============================================================================
// Frames
// ============================================================================

#[tokio::test]
async fn test_bad_frames_yield_errors_without_closing() -> Result<(), anyhow::Error> {
    let server = TestHubServer::spawn(MemoryStore::new()).await?;
    let mut client = TestWsClient::connect(&server, &mint_token("U1", Role::User)).await?;
    client.expect_event("connected").await?;

    client.send_raw("{not json").await?;
    assert_eq!(client.expect_event("error").await?["code"], "INVALID_REQUEST");

    client.send("noSuchEvent", json!({})).await?;
    assert_eq!(client.expect_event("error").await?["code"], "INVALID_REQUEST");

    client.send_binary(vec![1, 2, 3]).await?;
    assert_eq!(client.expect_event("error").await?["code"], "INVALID_REQUEST");

    client
        .send("sendMessage", json!({ "conversationId": "C1" }))
        .await?;
    assert_eq!(client.expect_event("error").await?["code"], "INVALID_REQUEST");

    // Still usable
    client.send("leave", json!("C1")).await?;
    let left = client.expect_event("left").await?;
    assert_eq!(left["roomId"], "C1");
    Ok(())
}

#[tokio::test]
async fn test_shutdown_closes_open_sockets() -> Result<(), anyhow::Error> {
    let server = TestHubServer::spawn(MemoryStore::new()).await?;
    let mut client = TestWsClient::connect(&server, &mint_token("U1", Role::User)).await?;
    client.expect_event("connected").await?;

    server.shutdown().await;
    assert!(client.closed_within(Duration::from_secs(5)).await);
    Ok(())
}
