//! Outbound side of the live view: the producer's connection to the hub ingress.

use async_trait::async_trait;
use futures::SinkExt;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::frame::UiMessage;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Destination of live view messages
#[async_trait]
pub trait UiSink: Send {
    async fn send(&mut self, message: UiMessage) -> Result<(), RelayError>;
}

/// Establishes the live view sink when the producer starts
#[async_trait]
pub trait UiConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn UiSink>, RelayError>;
}

/// Dials the hub ingress endpoint over WebSocket
#[derive(Debug, Clone)]
pub struct RelayConnector {
    url: String,
}

impl RelayConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl UiConnector for RelayConnector {
    async fn connect(&self) -> Result<Box<dyn UiSink>, RelayError> {
        let (stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RelayError::Connect {
                url: self.url.clone(),
                source: e,
            })?;
        log::info!("Relay connected to {}", self.url);
        Ok(Box::new(RelayClient { stream }))
    }
}

/// Sends each UI message as one binary frame holding its JSON encoding
pub struct RelayClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl UiSink for RelayClient {
    async fn send(&mut self, message: UiMessage) -> Result<(), RelayError> {
        let payload = message.to_json_bytes()?;
        self.stream.send(Message::Binary(payload.into())).await?;
        Ok(())
    }
}
