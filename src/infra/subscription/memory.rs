//! In-process transport.
//!
//! Each `connect` hands the server half of a fresh channel pair to the paired
//! [`MemoryServer`]. Dropping the server half closes the client's stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use url::Url;

use crate::infra::error::InfraError;

use super::transport::{Channel, Connector};

/// Client side of the in-process transport.
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    accept: mpsc::UnboundedSender<ServerConnection>,
    subprotocol: Option<String>,
    connects: Arc<AtomicUsize>,
}

/// Receives the server halves of new connections.
#[derive(Debug)]
pub struct MemoryServer {
    incoming: mpsc::UnboundedReceiver<ServerConnection>,
}

/// Server half of one in-process connection.
#[derive(Debug)]
pub struct ServerConnection {
    pub target: Url,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

/// Pair a connector with its server. `subprotocol` is what the server "negotiates".
pub fn pair(subprotocol: Option<&str>) -> (MemoryConnector, MemoryServer) {
    let (accept, incoming) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept,
            subprotocol: subprotocol.map(str::to_owned),
            connects: Arc::new(AtomicUsize::new(0)),
        },
        MemoryServer { incoming },
    )
}

impl MemoryConnector {
    /// Number of successful connects so far.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        target: &Url,
        _protocols: &[&str],
    ) -> Result<Box<dyn Channel>, InfraError> {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        self.accept
            .send(ServerConnection {
                target: target.clone(),
                from_client,
                to_client,
            })
            .map_err(|_| InfraError::websocket(format!("connection to {target} refused")))?;
        self.connects.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(MemoryChannel {
            to_server: Some(client_tx),
            from_server: client_rx,
            subprotocol: self.subprotocol.clone(),
        }))
    }
}

impl MemoryServer {
    /// Wait for the next connection; `None` once every connector is gone.
    pub async fn accept(&mut self) -> Option<ServerConnection> {
        self.incoming.recv().await
    }
}

impl ServerConnection {
    /// Next text frame from the client; `None` once the client closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame parsed as JSON. Undecodable frames end the stream.
    pub async fn recv_json(&mut self) -> Option<Value> {
        let text = self.recv().await?;
        serde_json::from_str(&text).ok()
    }

    /// Returns false once the client is gone.
    pub fn send(&self, text: impl Into<String>) -> bool {
        self.to_client.send(text.into()).is_ok()
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send(value.to_string())
    }
}

struct MemoryChannel {
    to_server: Option<mpsc::UnboundedSender<String>>,
    from_server: mpsc::UnboundedReceiver<String>,
    subprotocol: Option<String>,
}

#[async_trait]
impl Channel for MemoryChannel {
    fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    async fn send(&mut self, text: String) -> Result<(), InfraError> {
        let sender = self
            .to_server
            .as_ref()
            .ok_or_else(|| InfraError::websocket("channel already closed"))?;
        sender
            .send(text)
            .map_err(|_| InfraError::websocket("peer closed the connection"))
    }

    async fn recv(&mut self) -> Option<Result<String, InfraError>> {
        self.from_server.recv().await.map(Ok)
    }

    async fn close(&mut self) {
        self.to_server = None;
        self.from_server.close();
    }
}
