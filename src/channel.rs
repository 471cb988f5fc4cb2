//! Per-subscription lifecycle and handler registry.
//!
//! A channel moves `unsubscribed → subscribing → subscribed → closed`. Closed is
//! terminal for that registration; asking the client for the same name again
//! yields a fresh one. Connection loss moves live channels back to
//! `unsubscribed` so they can be subscribed again.

use crate::error::Error;
use crate::protocol::{ClientFrame, EventKind, RealtimePayload};
use crate::realtime::Shared;
use crate::response::Response;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Handler invoked for each routed event.
pub type EventCallback = Arc<dyn Fn(&RealtimePayload) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unsubscribed,
    Subscribing,
    Subscribed,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::Unsubscribed => write!(f, "unsubscribed"),
            ChannelState::Subscribing => write!(f, "subscribing"),
            ChannelState::Subscribed => write!(f, "subscribed"),
            ChannelState::Closed => write!(f, "closed"),
        }
    }
}

#[derive(Default)]
struct Handlers {
    by_kind: HashMap<EventKind, Vec<EventCallback>>,
    any: Vec<EventCallback>,
}

impl Handlers {
    fn matching(&self, kind: EventKind) -> Vec<EventCallback> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .chain(self.any.iter())
            .cloned()
            .collect()
    }
}

/// Registry entry owned by the multiplexer.
pub(crate) struct ChannelInner {
    name: String,
    state: Mutex<ChannelState>,
    handlers: Mutex<Handlers>,
    /// Serializes subscribe/unsubscribe so control frames leave in issue order.
    op_lock: tokio::sync::Mutex<()>,
}

impl ChannelInner {
    pub(crate) fn new(name: String) -> Self {
        Self {
            name,
            state: Mutex::new(ChannelState::Unsubscribed),
            handlers: Mutex::new(Handlers::default()),
            op_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    /// Move to `to` if the current state is one of `from`.
    pub(crate) fn transition(&self, from: &[ChannelState], to: ChannelState) -> bool {
        let mut state = self.state.lock();
        if from.contains(&*state) {
            debug!("[CHANNEL] '{}' {} -> {}", self.name, *state, to);
            *state = to;
            true
        } else {
            false
        }
    }

    pub(crate) fn close(&self) {
        *self.state.lock() = ChannelState::Closed;
        let mut handlers = self.handlers.lock();
        handlers.by_kind.clear();
        handlers.any.clear();
    }

    /// Invoke matching handlers in registration order. Returns how many ran.
    pub(crate) fn dispatch(&self, payload: &RealtimePayload) -> usize {
        if self.state() == ChannelState::Closed {
            return 0;
        }

        // Snapshot so handlers may register more handlers without deadlocking.
        let callbacks = self.handlers.lock().matching(payload.kind);
        for callback in &callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                warn!(
                    "[CHANNEL] Handler for {} on '{}' panicked; continuing",
                    payload.kind, self.name
                );
            }
        }
        callbacks.len()
    }
}

/// Handle to one logical subscription on the shared realtime connection.
///
/// Cloning the handle does not create a new subscription.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
    shared: Arc<Shared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(inner: Arc<ChannelInner>, shared: Arc<Shared>) -> Self {
        Self { inner, shared }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn state(&self) -> ChannelState {
        self.inner.state()
    }

    pub fn is_subscribed(&self) -> bool {
        self.state() == ChannelState::Subscribed
    }

    /// Register a handler for one event kind. Applies to events routed after
    /// this call; nothing is replayed. Ignored once the channel is closed.
    pub fn on(&self, kind: EventKind, callback: impl Fn(&RealtimePayload) + Send + Sync + 'static) -> &Self {
        if self.state() == ChannelState::Closed {
            debug!("[CHANNEL] Ignoring handler on closed channel '{}'", self.inner.name);
            return self;
        }
        self.inner
            .handlers
            .lock()
            .by_kind
            .entry(kind)
            .or_default()
            .push(Arc::new(callback));
        self
    }

    /// Register a handler for every event kind
    pub fn on_any(&self, callback: impl Fn(&RealtimePayload) + Send + Sync + 'static) -> &Self {
        if self.state() == ChannelState::Closed {
            debug!("[CHANNEL] Ignoring handler on closed channel '{}'", self.inner.name);
            return self;
        }
        self.inner.handlers.lock().any.push(Arc::new(callback));
        self
    }

    /// Drop every handler registered for `kind`
    pub fn off(&self, kind: EventKind) -> &Self {
        self.inner.handlers.lock().by_kind.remove(&kind);
        self
    }

    /// Drop every handler registered with [`on_any`](Self::on_any)
    pub fn off_any(&self) -> &Self {
        self.inner.handlers.lock().any.clear();
        self
    }

    /// Subscribe, opening the shared connection if needed. A no-op when already
    /// subscribing or subscribed.
    pub async fn subscribe(&self) -> Response<()> {
        let _op = self.inner.op_lock.lock().await;

        match self.inner.state() {
            ChannelState::Subscribing | ChannelState::Subscribed => return Response::Data(()),
            ChannelState::Closed => return Error::ChannelClosed.into(),
            ChannelState::Unsubscribed => {}
        }

        self.inner
            .transition(&[ChannelState::Unsubscribed], ChannelState::Subscribing);

        match self.shared.subscribe(&self.inner).await {
            Ok(()) => Response::Data(()),
            Err(err) => {
                warn!("[CHANNEL] Subscribe '{}' failed: {}", self.inner.name, err);
                self.inner
                    .transition(&[ChannelState::Subscribing], ChannelState::Unsubscribed);
                err.into()
            }
        }
    }

    /// Leave the channel for good. Idempotent.
    pub async fn unsubscribe(&self) -> Response<()> {
        let _op = self.inner.op_lock.lock().await;

        let previous = self.inner.state();
        if previous == ChannelState::Closed {
            return Response::Data(());
        }

        self.inner.close();
        self.shared.evict(&self.inner);

        if matches!(previous, ChannelState::Subscribing | ChannelState::Subscribed) {
            let frame = ClientFrame::Unsubscribe {
                channel: self.inner.name.clone(),
            };
            if let Err(err) = self.shared.send_if_open(&frame).await {
                warn!("[CHANNEL] Unsubscribe '{}' failed: {}", self.inner.name, err);
                return err.into();
            }
        }

        Response::Data(())
    }
}
