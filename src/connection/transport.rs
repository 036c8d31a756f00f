//! Frame transports
//!
//! A connection is split into a [`FrameSource`] and a [`FrameSink`] that carry
//! encoded frames, one per binary WebSocket message. Text messages are not
//! part of the protocol and are skipped.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;

use crate::{Error, Result};

/// Receiving half of a connection
#[async_trait]
pub trait FrameSource: Send {
    /// Next binary message; `None` once the peer is gone
    async fn recv(&mut self) -> Option<Result<Vec<u8>>>;
}

/// Sending half of a connection
#[async_trait]
pub trait FrameSink: Send {
    /// Send one encoded frame
    ///
    /// # Errors
    ///
    /// Returns error if the peer is gone
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()>;

    /// Close the connection
    ///
    /// # Errors
    ///
    /// Returns error if the close handshake fails
    async fn close(&mut self) -> Result<()>;
}

/// Server-side WebSocket receiver
pub struct AxumSource(SplitStream<axum::extract::ws::WebSocket>);

/// Server-side WebSocket sender
pub struct AxumSink(SplitSink<axum::extract::ws::WebSocket, axum::extract::ws::Message>);

/// Split an upgraded axum socket into frame halves
#[must_use]
pub fn split_axum(socket: axum::extract::ws::WebSocket) -> (AxumSource, AxumSink) {
    let (sink, stream) = socket.split();
    (AxumSource(stream), AxumSink(sink))
}

#[async_trait]
impl FrameSource for AxumSource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        use axum::extract::ws::Message;

        loop {
            match self.0.next().await? {
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes.to_vec())),
                Ok(Message::Text(text)) => {
                    tracing::debug!(len = text.len(), "ignoring text websocket message");
                }
                Ok(Message::Close(_)) => return None,
                Ok(Message::Ping(_) | Message::Pong(_)) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[async_trait]
impl FrameSink for AxumSink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.0
            .send(axum::extract::ws::Message::Binary(bytes.into()))
            .await
            .map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await.map_err(Error::from)
    }
}

/// Client-side WebSocket receiver
pub struct TungsteniteSource<S>(S);

/// Client-side WebSocket sender
pub struct TungsteniteSink<S>(S);

/// Split a connected client socket into frame halves
pub fn split_tungstenite<T>(
    socket: T,
) -> (
    TungsteniteSource<SplitStream<T>>,
    TungsteniteSink<SplitSink<T, tungstenite::Message>>,
)
where
    T: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>,
{
    let (sink, stream) = socket.split();
    (TungsteniteSource(stream), TungsteniteSink(sink))
}

#[async_trait]
impl<S> FrameSource for TungsteniteSource<S>
where
    S: Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>>
        + Unpin
        + Send,
{
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        use tungstenite::Message;

        loop {
            match self.0.next().await? {
                Ok(Message::Binary(bytes)) => return Some(Ok(bytes)),
                Ok(Message::Text(text)) => {
                    tracing::debug!(len = text.len(), "ignoring text websocket message");
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

#[async_trait]
impl<S> FrameSink for TungsteniteSink<S>
where
    S: Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin
        + Send,
{
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        self.0
            .send(tungstenite::Message::Binary(bytes))
            .await
            .map_err(Error::from)
    }

    async fn close(&mut self) -> Result<()> {
        self.0.close().await.map_err(Error::from)
    }
}

/// In-process receiver
#[derive(Debug)]
pub struct MemorySource(mpsc::Receiver<Vec<u8>>);

/// In-process sender; closing drops the channel
#[derive(Debug)]
pub struct MemorySink(Option<mpsc::Sender<Vec<u8>>>);

/// One side of an in-process connection
pub type MemoryEnd = (MemorySource, MemorySink);

/// Two connected in-process ends, each buffering up to `capacity` messages
#[must_use]
pub fn memory_pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity.max(1));
    let (b_tx, b_rx) = mpsc::channel(capacity.max(1));
    (
        (MemorySource(a_rx), MemorySink(Some(b_tx))),
        (MemorySource(b_rx), MemorySink(Some(a_tx))),
    )
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.0.recv().await.map(Ok)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, bytes: Vec<u8>) -> Result<()> {
        let tx = self
            .0
            .as_ref()
            .ok_or_else(|| Error::Transport("connection closed".to_string()))?;
        tx.send(bytes)
            .await
            .map_err(|_| Error::Transport("peer disconnected".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.0 = None;
        Ok(())
    }
}
