use {
    async_trait::async_trait,
    futures::{SinkExt, StreamExt},
    tokio::net::TcpStream,
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream, connect_async,
        tungstenite::{self, client::IntoClientRequest, protocol::Message},
    },
    tracing::debug,
};

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport failure: {message}")]
pub struct TransportError {
    pub message: String,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Connection factory; the `wsFactory` seam. Swap it to run the client over
/// any frame transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<Box<dyn TransportConnection>, TransportError>;
}

/// One live connection: text frames in both directions. `recv` returning
/// `None` means the peer closed.
#[async_trait]
pub trait TransportConnection: Send {
    async fn send(&mut self, text: String) -> Result<(), TransportError>;

    async fn recv(&mut self) -> Option<Result<String, TransportError>>;

    async fn close(&mut self);
}

// ── Default WebSocket transport ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        url: &str,
        protocols: &[String],
    ) -> Result<Box<dyn TransportConnection>, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|err| TransportError::new(err.to_string()))?;
        if !protocols.is_empty() {
            let joined = protocols.join(", ");
            let value = joined
                .parse()
                .map_err(|_| TransportError::new("invalid subprotocol list"))?;
            request
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", value);
        }
        let (stream, _response) = connect_async(request)
            .await
            .map_err(|err| TransportError::new(err.to_string()))?;
        Ok(Box::new(WebSocketConnection { stream }))
    }
}

struct WebSocketConnection {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl TransportConnection for WebSocketConnection {
    async fn send(&mut self, text: String) -> Result<(), TransportError> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, TransportError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Ping(data)) => {
                    if let Err(err) = self.stream.send(Message::Pong(data)).await {
                        return Some(Err(TransportError::new(err.to_string())));
                    }
                },
                Ok(Message::Close(_)) => {
                    debug!("websocket closed by server");
                    return None;
                },
                Ok(_) => {},
                Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                    return None;
                },
                Err(err) => return Some(Err(TransportError::new(err.to_string()))),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
