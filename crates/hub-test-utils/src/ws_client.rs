//! WebSocket client for E2E tests.
//!
//! Speaks the hub's `{"event": ..., "data": ...}` text frames over
//! `tokio-tungstenite`.

use crate::server_harness::TestHubServer;

use anyhow::{anyhow, bail, Context};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long [`TestWsClient::next_event`] waits before failing the test.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// One connected test client.
pub struct TestWsClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestWsClient {
    /// Connect with `Authorization: Bearer <token>`.
    pub async fn connect(server: &TestHubServer, token: &str) -> Result<Self, anyhow::Error> {
        let mut request = server.ws_url().into_client_request()?;
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
        let (stream, _response) = connect_async(request)
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self { stream })
    }

    /// Connect passing the token as the `token` query parameter.
    pub async fn connect_with_query(
        server: &TestHubServer,
        token: &str,
    ) -> Result<Self, anyhow::Error> {
        let url = format!("{}?token={token}", server.ws_url());
        let (stream, _response) = connect_async(url)
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self { stream })
    }

    /// Connect without any token.
    pub async fn connect_anonymous(server: &TestHubServer) -> Result<Self, anyhow::Error> {
        let (stream, _response) = connect_async(server.ws_url())
            .await
            .context("WebSocket handshake failed")?;
        Ok(Self { stream })
    }

    /// Send one event frame.
    pub async fn send(&mut self, event: &str, data: Value) -> Result<(), anyhow::Error> {
        self.send_raw(&json!({ "event": event, "data": data }).to_string())
            .await
    }

    /// Send an arbitrary text frame.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Send a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Next event frame as `(event, data)`.
    pub async fn next_event(&mut self) -> Result<(String, Value), anyhow::Error> {
        self.next_event_within(DEFAULT_EVENT_TIMEOUT)
            .await?
            .ok_or_else(|| anyhow!("no event within {:?}", DEFAULT_EVENT_TIMEOUT))
    }

    /// Skip events until `name` arrives and return its data.
    pub async fn expect_event(&mut self, name: &str) -> Result<Value, anyhow::Error> {
        let deadline = Instant::now() + DEFAULT_EVENT_TIMEOUT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.next_event_within(remaining).await? {
                Some((event, data)) if event == name => return Ok(data),
                Some(_) => {}
                None => bail!("expected '{name}' within {:?}", DEFAULT_EVENT_TIMEOUT),
            }
        }
    }

    /// Fail if `name` arrives within `wait`. Other events are discarded.
    pub async fn expect_no_event(&mut self, name: &str, wait: Duration) -> Result<(), anyhow::Error> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            match self.next_event_within(remaining).await? {
                Some((event, data)) if event == name => {
                    bail!("unexpected '{name}': {data}")
                }
                Some(_) => {}
                None => return Ok(()),
            }
        }
    }

    /// Close the socket from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream.close(None).await?;
        Ok(())
    }

    /// Whether the server closes the socket within `wait`.
    pub async fn closed_within(&mut self, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.stream.next()).await {
                Err(_) => return false,
                Ok(None | Some(Ok(Message::Close(_)) | Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    async fn next_event_within(
        &mut self,
        wait: Duration,
    ) -> Result<Option<(String, Value)>, anyhow::Error> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let frame = match tokio::time::timeout(remaining, self.stream.next()).await {
                Err(_) => return Ok(None),
                Ok(frame) => frame,
            };
            match frame {
                Some(Ok(Message::Text(text))) => {
                    let mut frame: Value = serde_json::from_str(&text)?;
                    let event = frame["event"]
                        .as_str()
                        .ok_or_else(|| anyhow!("frame without event: {text}"))?
                        .to_string();
                    return Ok(Some((event, frame["data"].take())));
                }
                Some(Ok(Message::Close(_))) | None => bail!("connection closed"),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }
}

/// Status code the server answers a handshake with, when it refuses the
/// upgrade. `None` means the upgrade succeeded.
pub async fn refused_handshake_status(
    server: &TestHubServer,
    token: Option<&str>,
) -> Result<Option<u16>, anyhow::Error> {
    let mut request = server.ws_url().into_client_request()?;
    if let Some(token) = token {
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))?,
        );
    }
    match connect_async(request).await {
        Ok((mut stream, _)) => {
            let _ = stream.close(None).await;
            Ok(None)
        }
        Err(tungstenite::Error::Http(response)) => Ok(Some(response.status().as_u16())),
        Err(e) => Err(e.into()),
    }
}
