//! Native WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use chatsync_shared::SyncError;
use futures_util::{future, SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::connection::{Connector, Frame, Transport};

/// Production connector for `ws://` and `wss://` endpoints.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport, SyncError> {
        let (ws_stream, _response) = connect_async(url)
            .await
            .map_err(|e| SyncError::TransportFailure(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| SyncError::TransportFailure(e.to_string()))
            .with(|text: String| future::ready(Ok::<_, SyncError>(Message::Text(text.into()))));

        let stream = read.map(|msg| match msg {
            Ok(Message::Text(text)) => Ok(Frame::Text(text.to_string())),
            Ok(Message::Close(_)) => Ok(Frame::Close),
            // Pong is handled automatically by tungstenite
            Ok(_) => Ok(Frame::Other),
            Err(e) => Err(SyncError::TransportFailure(e.to_string())),
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
