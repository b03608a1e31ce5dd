//! WebSocket client transport
//!
//! The station side of the OCPP-J connection: offers the configured
//! subprotocol, attaches HTTP Basic credentials for security profiles 1/2,
//! and pumps text frames between the socket and the connectivity manager.
//! The [`WebSocketTransport`] trait is the seam the connectivity manager
//! talks through; tests substitute a scripted transport.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::domain::{ConnectionProfile, InfraError, OcppVersion};

/// Events surfaced from an open connection.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A text frame arrived.
    Message(String),
    /// The connection closed; the string describes why.
    Closed(String),
}

/// An open connection: a sender for outbound text and a receiver of events.
pub struct WebSocketConnection {
    pub outbound: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Seam between the connectivity manager and the socket implementation.
#[async_trait]
pub trait WebSocketTransport: Send + Sync {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        version: OcppVersion,
    ) -> Result<WebSocketConnection, InfraError>;
}

/// Production transport over tokio-tungstenite.
///
/// Mutual-TLS client certificates (security profile 3) are configured at
/// the TLS layer, which is owned by the embedding application; this
/// transport covers profiles 1 and 2 plus server-side TLS out of the box.
pub struct TungsteniteTransport;

#[async_trait]
impl WebSocketTransport for TungsteniteTransport {
    async fn connect(
        &self,
        profile: &ConnectionProfile,
        version: OcppVersion,
    ) -> Result<WebSocketConnection, InfraError> {
        let mut request = profile
            .csms_url
            .clone()
            .into_client_request()
            .map_err(|e| InfraError::WebSocket(format!("invalid CSMS URL: {}", e)))?;

        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            version
                .subprotocol()
                .parse()
                .map_err(|_| InfraError::WebSocket("subprotocol header".to_string()))?,
        );

        if profile.security_profile.uses_basic_auth() {
            if let Some(auth) = &profile.basic_auth {
                let credentials = BASE64.encode(format!("{}:{}", auth.username, auth.password));
                request.headers_mut().insert(
                    "Authorization",
                    format!("Basic {}", credentials)
                        .parse()
                        .map_err(|_| InfraError::WebSocket("authorization header".to_string()))?,
                );
            }
        }

        info!(url = profile.csms_url.as_str(), slot = profile.slot, "Opening WebSocket");
        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| InfraError::WebSocket(format!("connect failed: {}", e)))?;

        let accepted = response
            .headers()
            .get("Sec-WebSocket-Protocol")
            .and_then(|v| v.to_str().ok())
            .map(|p| p == version.subprotocol())
            .unwrap_or(false);
        if !accepted {
            warn!(
                expected = version.subprotocol(),
                "CSMS did not accept the offered subprotocol"
            );
            return Err(InfraError::WebSocket("subprotocol not accepted".to_string()));
        }

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<ConnectionEvent>();

        // Outgoing pump
        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                debug!(frame = text.as_str(), "-> CSMS");
                if let Err(e) = ws_sender.send(Message::Text(text)).await {
                    error!(error = %e, "WebSocket send failed");
                    break;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Incoming pump
        tokio::spawn(async move {
            loop {
                match ws_receiver.next().await {
                    Some(Ok(Message::Text(text))) => {
                        debug!(frame = text.as_str(), "<- CSMS");
                        if event_tx.send(ConnectionEvent::Message(text)).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Binary(data))) => {
                        warn!(bytes = data.len(), "Ignoring binary frame");
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "close frame".to_string());
                        let _ = event_tx.send(ConnectionEvent::Closed(reason));
                        break;
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        let _ = event_tx.send(ConnectionEvent::Closed(e.to_string()));
                        break;
                    }
                    None => {
                        let _ = event_tx.send(ConnectionEvent::Closed("stream ended".to_string()));
                        break;
                    }
                }
            }
        });

        Ok(WebSocketConnection {
            outbound: outbound_tx,
            events: event_rx,
        })
    }
}
