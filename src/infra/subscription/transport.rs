//! Transport seam under the subscription manager.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::trace;
use url::Url;

use crate::infra::error::InfraError;

/// One open, text-framed connection.
#[async_trait]
pub trait Channel: Send {
    /// Sub-protocol the server agreed to, if it named one.
    fn subprotocol(&self) -> Option<&str>;

    async fn send(&mut self, text: String) -> Result<(), InfraError>;

    /// Next text frame; `None` once the peer closed the connection.
    async fn recv(&mut self) -> Option<Result<String, InfraError>>;

    async fn close(&mut self);
}

/// Opens channels to a target URL.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        target: &Url,
        protocols: &[&str],
    ) -> Result<Box<dyn Channel>, InfraError>;
}

/// Production connector over `tokio-tungstenite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        target: &Url,
        protocols: &[&str],
    ) -> Result<Box<dyn Channel>, InfraError> {
        let mut request = target
            .as_str()
            .into_client_request()
            .map_err(|err| InfraError::websocket(format!("invalid target {target}: {err}")))?;
        let offered = HeaderValue::from_str(&protocols.join(", "))
            .map_err(|err| InfraError::websocket(format!("invalid sub-protocol list: {err}")))?;
        request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);

        let (stream, response) = connect_async(request)
            .await
            .map_err(|err| InfraError::websocket(format!("connect to {target} failed: {err}")))?;
        let subprotocol = response
            .headers()
            .get(SEC_WEBSOCKET_PROTOCOL)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        trace!(%target, subprotocol = ?subprotocol, "WebSocket connected");

        Ok(Box::new(WsChannel {
            stream,
            subprotocol,
        }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    subprotocol: Option<String>,
}

#[async_trait]
impl Channel for WsChannel {
    fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    async fn send(&mut self, text: String) -> Result<(), InfraError> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(|err| InfraError::websocket(format!("send failed: {err}")))
    }

    async fn recv(&mut self) -> Option<Result<String, InfraError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => {
                    return Some(String::from_utf8(bytes.to_vec()).map_err(|err| {
                        InfraError::decode(format!("binary frame is not utf-8: {err}"))
                    }));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Transport-level ping/pong is answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(err)) => {
                    return Some(Err(InfraError::websocket(format!("receive failed: {err}"))));
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(err) = self.stream.close(None).await {
            trace!(error = %err, "WebSocket close failed");
        }
    }
}
