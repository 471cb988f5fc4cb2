//! Realtime multiplexer: one WebSocket connection, many logical channels.
//!
//! - The connection is opened lazily by the first subscribe (or an explicit
//!   [`RealtimeClient::connect`]) under a single async lock, so concurrent first
//!   subscribers never open two sockets.
//! - Inbound frames are routed by channel name in arrival order.
//! - Losing the connection moves live channels back to `unsubscribed`.
//!   Reconnecting and resubscribing is left to the caller.

use crate::channel::{Channel, ChannelInner, ChannelState};
use crate::client::Credentials;
use crate::error::{Error, Result};
use crate::protocol::{ClientFrame, ServerFrame};
use crate::response::Response;
use crate::socket::{Connector, FrameSink, FrameStream};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Absent,
    Connecting,
    Open,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Absent => write!(f, "absent"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Open => write!(f, "open"),
            ConnectionState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Default)]
struct Connection {
    sink: Option<FrameSink>,
    reader: Option<JoinHandle<()>>,
    /// Bumped on every open and on disconnect; a reader only reports loss for its own generation.
    generation: u64,
}

pub(crate) struct Shared {
    endpoint: String,
    credentials: Credentials,
    connector: Arc<dyn Connector>,
    connection: tokio::sync::Mutex<Connection>,
    state: Mutex<ConnectionState>,
    channels: Mutex<HashMap<String, Arc<ChannelInner>>>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    fn socket_url(&self) -> String {
        let mut params = Vec::new();
        if let Some(key) = &self.credentials.api_key {
            params.push(format!("apikey={}", urlencoding::encode(key)));
        }
        if let Some(token) = self.credentials.access_token() {
            params.push(format!("token={}", urlencoding::encode(&token)));
        }

        if params.is_empty() {
            self.endpoint.clone()
        } else {
            let separator = if self.endpoint.contains('?') { '&' } else { '?' };
            format!("{}{}{}", self.endpoint, separator, params.join("&"))
        }
    }

    async fn open_locked(self: &Arc<Self>, conn: &mut Connection) -> Result<()> {
        if conn.sink.is_some() {
            return Ok(());
        }

        self.set_state(ConnectionState::Connecting);
        info!("[REALTIME] Connecting to {}", self.endpoint);

        let url = self.socket_url();
        match self.connector.open(&url).await {
            Ok((sink, stream)) => {
                conn.generation += 1;
                conn.sink = Some(sink);
                conn.reader = Some(tokio::spawn(read_loop(
                    Arc::downgrade(self),
                    stream,
                    conn.generation,
                )));
                self.set_state(ConnectionState::Open);
                info!("[REALTIME] Connection open (generation {})", conn.generation);
                Ok(())
            }
            Err(err) => {
                self.set_state(ConnectionState::Closed);
                warn!("[REALTIME] Failed to connect to {}: {}", self.endpoint, err);
                Err(err)
            }
        }
    }

    async fn write(&self, conn: &mut Connection, frame: &ClientFrame) -> Result<()> {
        let text = serde_json::to_string(frame)?;
        let Some(sink) = conn.sink.as_mut() else {
            return Err(Error::ChannelClosed);
        };

        debug!("[REALTIME] -> {}", text);
        if let Err(err) = sink.send(text).await {
            warn!("[REALTIME] Send failed, dropping connection: {}", err);
            self.lose_connection(conn, true);
            return Err(err);
        }
        Ok(())
    }

    /// Send the subscribe frame for `channel`, opening the connection first if
    /// needed. The channel state is checked again under the connection lock: a
    /// registration closed while we waited must not open a socket.
    pub(crate) async fn subscribe(self: &Arc<Self>, channel: &ChannelInner) -> Result<()> {
        let mut conn = self.connection.lock().await;
        match channel.state() {
            ChannelState::Closed => return Err(Error::ChannelClosed),
            ChannelState::Subscribed => return Ok(()),
            // Reset by a connection loss while we waited
            ChannelState::Unsubscribed => {
                channel.transition(&[ChannelState::Unsubscribed], ChannelState::Subscribing);
            }
            ChannelState::Subscribing => {}
        }

        self.open_locked(&mut conn).await?;
        let frame = ClientFrame::Subscribe {
            channel: channel.name().to_string(),
        };
        self.write(&mut conn, &frame).await?;
        channel.transition(&[ChannelState::Subscribing], ChannelState::Subscribed);
        Ok(())
    }

    /// Send a control frame only if a connection exists; otherwise there is
    /// nobody to tell.
    pub(crate) async fn send_if_open(&self, frame: &ClientFrame) -> Result<()> {
        let mut conn = self.connection.lock().await;
        if conn.sink.is_none() {
            debug!("[REALTIME] No connection, skipping {:?}", frame);
            return Ok(());
        }
        self.write(&mut conn, frame).await
    }

    fn lose_connection(&self, conn: &mut Connection, abort_reader: bool) {
        conn.sink = None;
        if let Some(reader) = conn.reader.take() {
            if abort_reader {
                reader.abort();
            }
        }
        self.set_state(ConnectionState::Closed);

        for channel in self.channels.lock().values() {
            channel.transition(
                &[ChannelState::Subscribing, ChannelState::Subscribed],
                ChannelState::Unsubscribed,
            );
        }
    }

    /// Remove `channel` from the registry if it is still the registered entry.
    pub(crate) fn evict(&self, channel: &Arc<ChannelInner>) {
        let mut channels = self.channels.lock();
        if channels
            .get(channel.name())
            .is_some_and(|current| Arc::ptr_eq(current, channel))
        {
            channels.remove(channel.name());
        }
    }

    fn lookup(&self, name: &str) -> Option<Arc<ChannelInner>> {
        self.channels
            .lock()
            .get(name)
            .filter(|c| c.state() != ChannelState::Closed)
            .cloned()
    }

    fn route(&self, text: &str) {
        let frame: ServerFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("[REALTIME] Dropping unparseable frame: {}", err);
                return;
            }
        };

        match frame {
            ServerFrame::Event { channel, payload } => match self.lookup(&channel) {
                Some(target) => {
                    let ran = target.dispatch(&payload);
                    debug!("[REALTIME] {} on '{}' -> {} handler(s)", payload.kind, channel, ran);
                }
                None => debug!("[REALTIME] Dropping event for unknown channel '{}'", channel),
            },
            ServerFrame::Subscribed { channel } => {
                if let Some(target) = self.lookup(&channel) {
                    target.transition(&[ChannelState::Subscribing], ChannelState::Subscribed);
                }
            }
            ServerFrame::Error { channel, message } => match channel.and_then(|name| self.lookup(&name)) {
                Some(target) => {
                    warn!("[REALTIME] Channel '{}' rejected: {}", target.name(), message);
                    target.transition(
                        &[ChannelState::Subscribing, ChannelState::Subscribed],
                        ChannelState::Unsubscribed,
                    );
                }
                None => warn!("[REALTIME] Server error: {}", message),
            },
            ServerFrame::Unknown => debug!("[REALTIME] Ignoring frame of unknown type"),
        }
    }
}

async fn read_loop(shared: Weak<Shared>, mut stream: FrameStream, generation: u64) {
    let reason = loop {
        match stream.next().await {
            Some(Ok(text)) => match shared.upgrade() {
                Some(shared) => shared.route(&text),
                None => return,
            },
            Some(Err(err)) => break err.to_string(),
            None => break "closed by peer".to_string(),
        }
    };

    let Some(shared) = shared.upgrade() else {
        return;
    };
    let mut conn = shared.connection.lock().await;
    if conn.generation == generation {
        warn!("[REALTIME] Connection lost: {}", reason);
        shared.lose_connection(&mut conn, false);
    }
}

/// Owner of the single realtime connection and the channel registry.
#[derive(Clone)]
pub struct RealtimeClient {
    shared: Arc<Shared>,
}

impl fmt::Debug for RealtimeClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeClient")
            .field("endpoint", &self.shared.endpoint)
            .field("state", &self.connection_state())
            .field("channels", &self.channel_names())
            .finish()
    }
}

impl RealtimeClient {
    pub fn new(
        endpoint: impl Into<String>,
        credentials: Credentials,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                endpoint: endpoint.into(),
                credentials,
                connector,
                connection: tokio::sync::Mutex::new(Connection::default()),
                state: Mutex::new(ConnectionState::Absent),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    /// Names of registered, non-closed channels
    pub fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .shared
            .channels
            .lock()
            .values()
            .filter(|c| c.state() != ChannelState::Closed)
            .map(|c| c.name().to_string())
            .collect();
        names.sort();
        names
    }

    /// Get the live channel called `name`, or register a new one.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        let name = name.into();
        let mut channels = self.shared.channels.lock();

        if let Some(existing) = channels
            .get(&name)
            .filter(|c| c.state() != ChannelState::Closed)
            .cloned()
        {
            return Channel::new(existing, self.shared.clone());
        }

        let fresh = Arc::new(ChannelInner::new(name.clone()));
        channels.insert(name, fresh.clone());
        Channel::new(fresh, self.shared.clone())
    }

    /// Open the connection now instead of on first subscribe.
    pub async fn connect(&self) -> Response<()> {
        let mut conn = self.shared.connection.lock().await;
        self.shared.open_locked(&mut conn).await.into()
    }

    /// Close the connection and every channel.
    pub async fn disconnect(&self) -> Response<()> {
        let mut conn = self.shared.connection.lock().await;
        conn.generation += 1;
        if let Some(reader) = conn.reader.take() {
            reader.abort();
        }
        let closed = match conn.sink.take() {
            Some(mut sink) => sink.close().await,
            None => Ok(()),
        };
        if self.connection_state() != ConnectionState::Absent {
            self.shared.set_state(ConnectionState::Closed);
        }

        // Still under the connection lock, so a subscribe queued behind us
        // observes its channel as closed.
        let drained: Vec<Arc<ChannelInner>> = self
            .shared
            .channels
            .lock()
            .drain()
            .map(|(_, channel)| channel)
            .collect();
        for channel in &drained {
            channel.close();
        }
        drop(conn);
        info!("[REALTIME] Disconnected, closed {} channel(s)", drained.len());

        if let Err(err) = &closed {
            warn!("[REALTIME] Error while closing connection: {}", err);
        }
        closed.into()
    }
}
