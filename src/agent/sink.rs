//! Frame sinks: where a connection's generated frames go.

use crate::rpc::AgentFault;
use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type WsWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// One open traffic connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Send one frame. Returns once the frame has been handed to the socket.
    async fn send_frame(&mut self, payload: &[u8]) -> std::io::Result<()>;

    /// Close the connection. Errors are swallowed, the peer may be gone.
    async fn close(&mut self);
}

/// Open a sink for `url`.
///
/// `ws://` and `wss://` open a WebSocket. `null://` discards frames locally,
/// which exercises the whole control plane without a server under test.
pub async fn open_sink(url: &Url) -> Result<Box<dyn FrameSink>, AgentFault> {
    match url.scheme() {
        "ws" | "wss" => Ok(Box::new(WebSocketSink::connect(url).await?)),
        "null" => Ok(Box::new(NullSink)),
        other => Err(AgentFault::InvalidArgument(format!(
            "unsupported url scheme {:?}",
            other
        ))),
    }
}

/// Binary WebSocket frames. Anything the server sends back is drained and
/// dropped so the server never stalls on a full socket.
pub struct WebSocketSink {
    writer: WsWriter,
    drain: JoinHandle<()>,
}

impl WebSocketSink {
    pub async fn connect(url: &Url) -> Result<Self, AgentFault> {
        let fault = |reason: String| AgentFault::Connect {
            url: url.to_string(),
            reason,
        };

        let (stream, _response) = timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| fault(format!("timed out after {:?}", CONNECT_TIMEOUT)))?
            .map_err(|e| fault(e.to_string()))?;
        debug!("WebSocket connected to {}", url);

        let (writer, mut reader) = stream.split();
        let drain = tokio::spawn(async move {
            while let Some(message) = reader.next().await {
                match message {
                    Ok(message) => trace!("Discarding {} byte server message", message.len()),
                    Err(_) => break,
                }
            }
        });

        Ok(Self { writer, drain })
    }
}

#[async_trait]
impl FrameSink for WebSocketSink {
    async fn send_frame(&mut self, payload: &[u8]) -> std::io::Result<()> {
        self.writer
            .send(Message::Binary(payload.to_vec()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    async fn close(&mut self) {
        let _ = self.writer.close().await;
        self.drain.abort();
    }
}

impl Drop for WebSocketSink {
    fn drop(&mut self) {
        self.drain.abort();
    }
}

/// Accepts and forgets every frame.
pub struct NullSink;

#[async_trait]
impl FrameSink for NullSink {
    async fn send_frame(&mut self, _payload: &[u8]) -> std::io::Result<()> {
        Ok(())
    }

    async fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn test_null_sink_accepts_frames() {
        let url = Url::parse("null://local").unwrap();
        let mut sink = open_sink(&url).await.unwrap();
        sink.send_frame(&[0u8; 16]).await.unwrap();
        sink.close().await;
    }

    #[tokio::test]
    async fn test_unknown_scheme_is_rejected() {
        let url = Url::parse("http://127.0.0.1:8080/").unwrap();
        let err = open_sink(&url).await.err().unwrap();
        assert!(matches!(err, AgentFault::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_websocket_sink_delivers_binary_frames() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            let mut sizes = Vec::new();
            while let Some(Ok(message)) = ws.next().await {
                if let Message::Binary(data) = message {
                    sizes.push(data.len());
                }
            }
            sizes
        });

        let url = Url::parse(&format!("ws://{}/streaming", addr)).unwrap();
        let mut sink = open_sink(&url).await.unwrap();
        sink.send_frame(&[7u8; 100]).await.unwrap();
        sink.send_frame(&[7u8; 100]).await.unwrap();
        sink.close().await;

        assert_eq!(server.await.unwrap(), vec![100, 100]);
    }

    #[tokio::test]
    async fn test_refused_connection_is_a_connect_fault() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let url = Url::parse(&format!("ws://{}/streaming", addr)).unwrap();
        let err = open_sink(&url).await.err().unwrap();
        assert!(matches!(err, AgentFault::Connect { .. }));
    }
}
