//! WebSocket collaborator for realtime channels.
//!
//! A [`Connector`] opens one framed text connection and hands back its two
//! halves. Only the multiplexer in [`crate::realtime`] ever writes to the sink.

use crate::error::{Error, Result};
use futures::future::{self, BoxFuture};
use futures::{Sink, SinkExt, Stream, StreamExt};
use log::debug;
use std::pin::Pin;
use tokio_tungstenite::tungstenite::protocol::Message;

/// Outbound half: accepts serialized JSON frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = Error> + Send>>;

/// Inbound half: yields text frames until the connection ends.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Opens realtime connections.
pub trait Connector: Send + Sync {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(FrameSink, FrameStream)>>;
}

/// [`Connector`] backed by tokio-tungstenite.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

impl TungsteniteConnector {
    async fn connect(url: &str) -> Result<(FrameSink, FrameStream)> {
        let (ws, response) = tokio_tungstenite::connect_async(url).await.map_err(|e| match e {
            tokio_tungstenite::tungstenite::Error::Http(response) => Error::Connection(format!(
                "WebSocket upgrade rejected with HTTP {}",
                response.status().as_u16()
            )),
            other => other.into(),
        })?;
        debug!("[REALTIME] Upgrade complete, HTTP {}", response.status().as_u16());

        let (write, read) = ws.split();

        let sink = write
            .sink_map_err(Error::from)
            .with(|frame: String| future::ready(Ok::<_, Error>(Message::Text(frame))));

        // Only text frames carry protocol messages; control frames are handled by tungstenite.
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        debug!("[REALTIME] Dropping non UTF-8 binary frame");
                        None
                    }
                },
                Ok(_) => None,
                Err(e) => Some(Err(Error::from(e))),
            })
        });

        let sink: FrameSink = Box::pin(sink);
        let stream: FrameStream = Box::pin(stream);
        Ok((sink, stream))
    }
}

impl Connector for TungsteniteConnector {
    fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<(FrameSink, FrameStream)>> {
        Box::pin(Self::connect(url))
    }
}
