//! WebSocket push transport.
//!
//! One socket per channel. After the handshake the client sends a
//! `{"type":"subscribe","channel":..,"filter":..}` text frame; the server
//! answers with JSON [`TransportFrame`]s.

use crate::http::auth_pairs;
use crate::transport::{PushTransport, TransportFactory, TransportFrame, FRAME_BUFFER};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use vitrine_core::{ApiConfig, ChannelError};

#[derive(Debug, Clone)]
pub struct WsPushTransport {
    endpoint: String,
    auth: Vec<(&'static str, String)>,
}

impl WsPushTransport {
    /// Fails when no credentials are configured; push then stays off.
    pub fn new(config: &ApiConfig) -> Result<Self, ChannelError> {
        if !config.auth.has_credentials() {
            return Err(ChannelError::Unavailable {
                reason: "no credentials configured for push channel".to_string(),
            });
        }
        if !config.push_endpoint.starts_with("ws://") && !config.push_endpoint.starts_with("wss://")
        {
            return Err(ChannelError::Unavailable {
                reason: format!("unsupported push endpoint {}", config.push_endpoint),
            });
        }
        Ok(Self {
            endpoint: config.push_endpoint.clone(),
            auth: auth_pairs(&config.auth),
        })
    }

    /// Factory for [`crate::PushSubscriber`].
    pub fn factory(config: ApiConfig) -> TransportFactory {
        Box::new(move || {
            WsPushTransport::new(&config).map(|t| Arc::new(t) as Arc<dyn PushTransport>)
        })
    }
}

#[async_trait]
impl PushTransport for WsPushTransport {
    async fn open(
        &self,
        channel: &str,
        filter: &str,
    ) -> Result<mpsc::Receiver<TransportFrame>, ChannelError> {
        let connect_err = |reason: String| ChannelError::Connect {
            channel: channel.to_string(),
            reason,
        };

        let mut request = self
            .endpoint
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let headers = request.headers_mut();
        for (name, value) in &self.auth {
            headers.insert(
                HeaderName::from_static(*name),
                HeaderValue::from_str(value).map_err(|e| connect_err(e.to_string()))?,
            );
        }

        let (mut stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connect_err(e.to_string()))?;
        let subscribe = json!({"type": "subscribe", "channel": channel, "filter": filter});
        stream
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| connect_err(e.to_string()))?;

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = stream.next() => match message {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<TransportFrame>(&text) {
                                Ok(frame) => {
                                    if tx.send(frame).await.is_err() {
                                        break;
                                    }
                                }
                                Err(err) => {
                                    warn!(channel = %channel, error = %err, "WS decode error");
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(channel = %channel, error = %err, "WS stream error");
                            break;
                        }
                    },
                    _ = tx.closed() => {
                        let _ = stream.close(None).await;
                        break;
                    }
                }
            }
            debug!(channel = %channel, "WS pump stopped");
        });
        Ok(rx)
    }
}
