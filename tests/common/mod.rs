//! In-memory transports shared by the integration tests.

#![allow(dead_code)]

use aerodb::{
  Connector, Error, FrameSink, FrameStream, HttpRequest, HttpResponse, HttpTransport,
};
use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::{ready, FutureExt, Sink, SinkExt};
use serde_json::Value;
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

/// Records requests and replays canned responses (default: `200 []`).
#[derive(Default)]
pub struct MockHttp {
  responses: Mutex<VecDeque<aerodb::Result<HttpResponse>>>,
  requests: Mutex<Vec<HttpRequest>>,
}

impl MockHttp {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, status: u16, body: Value) {
    self.responses.lock().unwrap().push_back(Ok(HttpResponse {
      status,
      body: body.to_string().into_bytes(),
    }));
  }

  pub fn respond_raw(&self, status: u16, body: &str) {
    self.responses.lock().unwrap().push_back(Ok(HttpResponse {
      status,
      body: body.as_bytes().to_vec(),
    }));
  }

  pub fn fail(&self, err: Error) {
    self.responses.lock().unwrap().push_back(Err(err));
  }

  pub fn requests(&self) -> Vec<HttpRequest> {
    self.requests.lock().unwrap().clone()
  }
}

impl HttpTransport for MockHttp {
  fn send<'a>(&'a self, request: &'a HttpRequest) -> BoxFuture<'a, aerodb::Result<HttpResponse>> {
    self.requests.lock().unwrap().push(request.clone());
    let next = self.responses.lock().unwrap().pop_front().unwrap_or(Ok(HttpResponse {
      status: 200,
      body: b"[]".to_vec(),
    }));
    Box::pin(async move { next })
  }
}

struct MockSocket {
  outbound: UnboundedReceiver<String>,
  inbound: UnboundedSender<aerodb::Result<String>>,
}

/// Sink whose close waits for the test to release it.
struct HeldClose<S> {
  inner: S,
  release: Option<oneshot::Receiver<()>>,
  close_requested: Arc<AtomicBool>,
}

impl<S> Sink<String> for HeldClose<S>
where
  S: Sink<String, Error = Error> + Unpin,
{
  type Error = Error;

  fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<aerodb::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_ready(cx)
  }

  fn start_send(self: Pin<&mut Self>, item: String) -> aerodb::Result<()> {
    Pin::new(&mut self.get_mut().inner).start_send(item)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<aerodb::Result<()>> {
    Pin::new(&mut self.get_mut().inner).poll_flush(cx)
  }

  fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<aerodb::Result<()>> {
    let this = self.get_mut();
    this.close_requested.store(true, Ordering::SeqCst);
    if let Some(release) = this.release.as_mut() {
      let _ = ready!(release.poll_unpin(cx));
      this.release = None;
    }
    Pin::new(&mut this.inner).poll_close(cx)
  }
}

/// Hands out in-memory sockets; the test side keeps the far ends.
#[derive(Default)]
pub struct MockConnector {
  sockets: Mutex<Vec<MockSocket>>,
  urls: Mutex<Vec<String>>,
  refuse_next: AtomicBool,
  held_close: Mutex<Option<oneshot::Receiver<()>>>,
  close_requested: Arc<AtomicBool>,
}

impl MockConnector {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn refuse_next(&self) {
    self.refuse_next.store(true, Ordering::SeqCst);
  }

  /// Make closing the next opened socket wait until the returned sender fires.
  pub fn hold_close(&self) -> oneshot::Sender<()> {
    let (tx, rx) = oneshot::channel();
    *self.held_close.lock().unwrap() = Some(rx);
    tx
  }

  pub fn close_requested(&self) -> bool {
    self.close_requested.load(Ordering::SeqCst)
  }

  pub fn opened(&self) -> usize {
    self.sockets.lock().unwrap().len()
  }

  pub fn urls(&self) -> Vec<String> {
    self.urls.lock().unwrap().clone()
  }

  /// Drain the frames written to socket `index` so far.
  pub fn sent(&self, index: usize) -> Vec<Value> {
    let mut sockets = self.sockets.lock().unwrap();
    let socket = &mut sockets[index];
    let mut frames = Vec::new();
    while let Ok(Some(text)) = socket.outbound.try_next() {
      frames.push(serde_json::from_str(&text).unwrap());
    }
    frames
  }

  /// Deliver a server frame on socket `index`.
  pub fn push(&self, index: usize, frame: Value) {
    self.push_text(index, &frame.to_string());
  }

  pub fn push_text(&self, index: usize, text: &str) {
    self.sockets.lock().unwrap()[index]
      .inbound
      .unbounded_send(Ok(text.to_string()))
      .unwrap();
  }

  /// End socket `index` as if the peer went away.
  pub fn hang_up(&self, index: usize) {
    self.sockets.lock().unwrap()[index].inbound.close_channel();
  }

  /// Fail socket `index` with a transport error.
  pub fn break_socket(&self, index: usize) {
    self.sockets.lock().unwrap()[index]
      .inbound
      .unbounded_send(Err(Error::Connection("connection reset".to_string())))
      .unwrap();
  }
}

impl Connector for MockConnector {
  fn open<'a>(&'a self, url: &'a str) -> BoxFuture<'a, aerodb::Result<(FrameSink, FrameStream)>> {
    self.urls.lock().unwrap().push(url.to_string());
    if self.refuse_next.swap(false, Ordering::SeqCst) {
      return Box::pin(async { Err(Error::Connection("connection refused".to_string())) });
    }

    let (out_tx, out_rx) = mpsc::unbounded::<String>();
    let (in_tx, in_rx) = mpsc::unbounded::<aerodb::Result<String>>();
    self.sockets.lock().unwrap().push(MockSocket {
      outbound: out_rx,
      inbound: in_tx,
    });

    let sink: FrameSink = Box::pin(HeldClose {
      inner: out_tx.sink_map_err(|_| Error::ChannelClosed),
      release: self.held_close.lock().unwrap().take(),
      close_requested: self.close_requested.clone(),
    });
    let stream: FrameStream = Box::pin(in_rx);
    Box::pin(async move { Ok((sink, stream)) })
  }
}

/// Yield to spawned tasks until `cond` holds or we give up.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
  for _ in 0..1000 {
    if cond() {
      return true;
    }
    tokio::task::yield_now().await;
  }
  cond()
}
