//! AeroDB Rust SDK - Realtime Multiplexer Tests

mod common;

use aerodb::{
  ChannelState, ConnectionState, Credentials, ErrorKind, EventKind, RealtimeClient,
  RealtimePayload, StaticToken,
};
use common::{eventually, MockConnector};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const ENDPOINT: &str = "wss://api.example.com/realtime/v1/websocket";

fn realtime() -> (RealtimeClient, Arc<MockConnector>) {
  let connector = MockConnector::new();
  let client = RealtimeClient::new(ENDPOINT, Credentials::default(), connector.clone());
  (client, connector)
}

fn event(channel: &str, kind: &str, id: i64) -> Value {
  json!({
    "type": "event",
    "channel": channel,
    "payload": {"type": kind, "table": channel, "schema": "public", "new": {"id": id}}
  })
}

fn subscribe_frame(channel: &str) -> Value {
  json!({"type": "subscribe", "channel": channel})
}

fn record_ids(seen: &Arc<Mutex<Vec<i64>>>) -> impl Fn(&RealtimePayload) + Send + Sync + 'static {
  let seen = seen.clone();
  move |payload: &RealtimePayload| {
    let id = payload
      .new
      .as_ref()
      .and_then(|row| row.get("id"))
      .and_then(Value::as_i64)
      .unwrap_or(-1);
    seen.lock().push(id);
  }
}

#[tokio::test]
async fn test_connection_is_lazy() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");
  channel.on(EventKind::Insert, |_: &RealtimePayload| {});

  assert_eq!(client.connection_state(), ConnectionState::Absent);
  assert_eq!(connector.opened(), 0);
  assert_eq!(channel.state(), ChannelState::Unsubscribed);
}

#[tokio::test]
async fn test_subscribe_opens_connection_and_sends_frame() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");

  assert!(channel.subscribe().await.is_ok());

  assert_eq!(connector.opened(), 1);
  assert_eq!(connector.urls(), vec![ENDPOINT.to_string()]);
  assert_eq!(client.connection_state(), ConnectionState::Open);
  assert_eq!(channel.state(), ChannelState::Subscribed);
  assert!(channel.is_subscribed());
  assert_eq!(connector.sent(0), vec![subscribe_frame("posts")]);
}

#[tokio::test]
async fn test_socket_url_carries_credentials() {
  let connector = MockConnector::new();
  let credentials = Credentials {
    api_key: Some("anon key".to_string()),
    tokens: Some(Arc::new(StaticToken("jwt".to_string()))),
  };
  let client = RealtimeClient::new(ENDPOINT, credentials, connector.clone());

  assert!(client.connect().await.is_ok());
  assert_eq!(connector.urls(), vec![format!("{}?apikey=anon%20key&token=jwt", ENDPOINT)]);
}

#[tokio::test]
async fn test_double_subscribe_sends_one_frame() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");

  assert!(channel.subscribe().await.is_ok());
  assert!(channel.subscribe().await.is_ok());
  assert!(client.channel("posts").subscribe().await.is_ok());

  assert_eq!(connector.sent(0), vec![subscribe_frame("posts")]);
}

#[tokio::test]
async fn test_channels_share_one_connection() {
  let (client, connector) = realtime();
  let posts = client.channel("posts");
  let users = client.channel("users");

  let (a, b) = tokio::join!(posts.subscribe(), users.subscribe());
  assert!(a.is_ok() && b.is_ok());

  assert_eq!(connector.opened(), 1);
  let mut sent = connector.sent(0);
  sent.sort_by_key(|f| f["channel"].as_str().map(str::to_string));
  assert_eq!(sent, vec![subscribe_frame("posts"), subscribe_frame("users")]);
  assert_eq!(client.channel_names(), vec!["posts", "users"]);
}

#[tokio::test]
async fn test_same_name_returns_same_registration() {
  let (client, _connector) = realtime();
  let first = client.channel("posts");
  let second = client.channel("posts");

  first.subscribe().await;
  assert_eq!(second.state(), ChannelState::Subscribed);
  assert_eq!(client.channel_names(), vec!["posts"]);
}

#[tokio::test]
async fn test_events_are_routed_in_order() {
  let (client, connector) = realtime();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  channel.on(EventKind::Insert, record_ids(&seen));
  channel.subscribe().await;

  for id in 1..=5 {
    connector.push(0, event("posts", "INSERT", id));
  }

  assert!(eventually(|| seen.lock().len() == 5).await);
  assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn test_handlers_run_in_registration_order() {
  let (client, connector) = realtime();
  let order = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  for tag in ["first", "second"] {
    let order = order.clone();
    channel.on(EventKind::Update, move |_: &RealtimePayload| order.lock().push(tag));
  }
  let any = order.clone();
  channel.on_any(move |_: &RealtimePayload| any.lock().push("any"));
  channel.subscribe().await;

  connector.push(0, event("posts", "UPDATE", 1));

  assert!(eventually(|| order.lock().len() == 3).await);
  assert_eq!(*order.lock(), vec!["first", "second", "any"]);
}

#[tokio::test]
async fn test_events_only_reach_their_channel_and_kind() {
  let (client, connector) = realtime();
  let posts_seen = Arc::new(Mutex::new(Vec::new()));
  let users_seen = Arc::new(Mutex::new(Vec::new()));

  let posts = client.channel("posts");
  posts.on(EventKind::Insert, record_ids(&posts_seen));
  let users = client.channel("users");
  users.on(EventKind::Insert, record_ids(&users_seen));
  posts.subscribe().await;
  users.subscribe().await;

  connector.push(0, event("users", "INSERT", 1));
  connector.push(0, event("posts", "DELETE", 2));
  connector.push(0, event("nobody", "INSERT", 3));
  connector.push_text(0, "not json");
  connector.push(0, json!({"type": "heartbeat"}));
  connector.push(0, event("posts", "INSERT", 4));

  assert!(eventually(|| posts_seen.lock().len() == 1).await);
  assert_eq!(*posts_seen.lock(), vec![4]);
  assert_eq!(*users_seen.lock(), vec![1]);
  assert_eq!(client.connection_state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_delivery() {
  let (client, connector) = realtime();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  channel.on(EventKind::Insert, |_: &RealtimePayload| panic!("handler bug"));
  channel.on(EventKind::Insert, record_ids(&seen));
  channel.subscribe().await;

  connector.push(0, event("posts", "INSERT", 1));
  connector.push(0, event("posts", "INSERT", 2));

  assert!(eventually(|| seen.lock().len() == 2).await);
  assert_eq!(client.connection_state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_off_removes_handlers() {
  let (client, connector) = realtime();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  channel.on(EventKind::Insert, record_ids(&seen));
  channel.on(EventKind::Update, record_ids(&seen));
  channel.off(EventKind::Insert);
  channel.subscribe().await;

  connector.push(0, event("posts", "INSERT", 1));
  connector.push(0, event("posts", "UPDATE", 2));

  assert!(eventually(|| seen.lock().len() == 1).await);
  assert_eq!(*seen.lock(), vec![2]);
}

#[tokio::test]
async fn test_no_delivery_after_unsubscribe() {
  let (client, connector) = realtime();
  let calls = Arc::new(AtomicUsize::new(0));
  let channel = client.channel("posts");
  let counter = calls.clone();
  channel.on(EventKind::Insert, move |_: &RealtimePayload| {
    counter.fetch_add(1, Ordering::SeqCst);
  });
  channel.subscribe().await;

  connector.push(0, event("posts", "INSERT", 1));
  assert!(eventually(|| calls.load(Ordering::SeqCst) == 1).await);

  assert!(channel.unsubscribe().await.is_ok());
  assert_eq!(channel.state(), ChannelState::Closed);
  assert_eq!(
    connector.sent(0),
    vec![subscribe_frame("posts"), json!({"type": "unsubscribe", "channel": "posts"})]
  );

  connector.push(0, event("posts", "INSERT", 2));
  // A later frame proves the reader has moved past the dropped event.
  let marker = Arc::new(AtomicUsize::new(0));
  let other = client.channel("marker");
  let m = marker.clone();
  other.on(EventKind::Insert, move |_: &RealtimePayload| {
    m.fetch_add(1, Ordering::SeqCst);
  });
  other.subscribe().await;
  connector.push(0, event("marker", "INSERT", 3));
  assert!(eventually(|| marker.load(Ordering::SeqCst) == 1).await);

  assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unsubscribe_is_idempotent() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");
  channel.subscribe().await;

  assert!(channel.unsubscribe().await.is_ok());
  assert!(channel.unsubscribe().await.is_ok());

  let sent = connector.sent(0);
  assert_eq!(sent.len(), 2);
  assert!(client.channel_names().is_empty());
}

#[tokio::test]
async fn test_unsubscribe_before_subscribe_sends_nothing() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");
  assert!(channel.unsubscribe().await.is_ok());
  assert_eq!(channel.state(), ChannelState::Closed);
  assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn test_closed_channel_is_replaced_by_name() {
  let (client, connector) = realtime();
  let old = client.channel("posts");
  old.subscribe().await;
  old.unsubscribe().await;

  let response = old.subscribe().await;
  assert_eq!(response.error().unwrap().kind, ErrorKind::Transport);

  let fresh = client.channel("posts");
  assert_eq!(fresh.state(), ChannelState::Unsubscribed);
  assert!(fresh.subscribe().await.is_ok());
  assert_eq!(old.state(), ChannelState::Closed);
  assert_eq!(connector.sent(0).last(), Some(&subscribe_frame("posts")));
}

#[tokio::test]
async fn test_connection_loss_resets_channels() {
  let (client, connector) = realtime();
  let posts = client.channel("posts");
  let users = client.channel("users");
  posts.subscribe().await;
  users.subscribe().await;

  connector.hang_up(0);

  assert!(eventually(|| client.connection_state() == ConnectionState::Closed).await);
  assert_eq!(posts.state(), ChannelState::Unsubscribed);
  assert_eq!(users.state(), ChannelState::Unsubscribed);

  assert!(posts.subscribe().await.is_ok());
  assert_eq!(connector.opened(), 2);
  assert_eq!(client.connection_state(), ConnectionState::Open);
  assert_eq!(connector.sent(1), vec![subscribe_frame("posts")]);
  assert_eq!(users.state(), ChannelState::Unsubscribed);
}

#[tokio::test]
async fn test_stream_error_counts_as_connection_loss() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");
  channel.subscribe().await;

  connector.break_socket(0);

  assert!(eventually(|| channel.state() == ChannelState::Unsubscribed).await);
  assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_handlers_survive_reconnect() {
  let (client, connector) = realtime();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  channel.on(EventKind::Insert, record_ids(&seen));
  channel.subscribe().await;

  connector.hang_up(0);
  assert!(eventually(|| channel.state() == ChannelState::Unsubscribed).await);
  channel.subscribe().await;

  connector.push(1, event("posts", "INSERT", 7));
  assert!(eventually(|| seen.lock().len() == 1).await);
  assert_eq!(*seen.lock(), vec![7]);
}

#[tokio::test]
async fn test_connect_failure_leaves_channel_unsubscribed() {
  let (client, connector) = realtime();
  let channel = client.channel("posts");
  connector.refuse_next();

  let response = channel.subscribe().await;
  let err = response.error().unwrap();
  assert_eq!(err.kind, ErrorKind::Transport);
  assert!(err.message.contains("connection refused"));
  assert_eq!(channel.state(), ChannelState::Unsubscribed);
  assert_eq!(client.connection_state(), ConnectionState::Closed);

  assert!(channel.subscribe().await.is_ok());
  assert_eq!(channel.state(), ChannelState::Subscribed);
  assert_eq!(connector.opened(), 1);
}

#[tokio::test]
async fn test_server_rejection_resets_channel() {
  let (client, connector) = realtime();
  let channel = client.channel("private");
  channel.subscribe().await;

  connector.push(0, json!({"type": "error", "channel": "private", "message": "denied"}));

  assert!(eventually(|| channel.state() == ChannelState::Unsubscribed).await);
  assert_eq!(client.connection_state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_disconnect_closes_everything() {
  let (client, connector) = realtime();
  let posts = client.channel("posts");
  let idle = client.channel("idle");
  posts.subscribe().await;

  assert!(client.disconnect().await.is_ok());

  assert_eq!(client.connection_state(), ConnectionState::Closed);
  assert_eq!(posts.state(), ChannelState::Closed);
  assert_eq!(idle.state(), ChannelState::Closed);
  assert!(client.channel_names().is_empty());
  assert_eq!(posts.subscribe().await.error().unwrap().kind, ErrorKind::Transport);

  // The client stays usable: a new registration opens a new connection.
  assert!(client.channel("posts").subscribe().await.is_ok());
  assert_eq!(connector.opened(), 2);
}

#[tokio::test]
async fn test_disconnect_without_connection() {
  let (client, connector) = realtime();
  assert!(client.disconnect().await.is_ok());
  assert_eq!(client.connection_state(), ConnectionState::Absent);
  assert_eq!(connector.opened(), 0);
}

#[tokio::test]
async fn test_event_with_unreadable_timestamp_is_delivered() {
  let (client, connector) = realtime();
  let stamps = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  let seen = stamps.clone();
  channel.on(EventKind::Insert, move |payload: &RealtimePayload| {
    seen.lock().push(payload.commit_timestamp.map(|t| t.to_rfc3339()));
  });
  channel.subscribe().await;

  for stamp in ["", "2024-01-15 10:30:00+00", "yesterday"] {
    connector.push(
      0,
      json!({
        "type": "event",
        "channel": "posts",
        "payload": {"type": "INSERT", "table": "posts", "commit_timestamp": stamp, "new": {"id": 1}}
      }),
    );
  }

  assert!(eventually(|| stamps.lock().len() == 3).await);
  assert_eq!(
    *stamps.lock(),
    vec![None, Some("2024-01-15T10:30:00+00:00".to_string()), None]
  );
}

#[tokio::test]
async fn test_subscribe_queued_behind_disconnect_does_not_reopen() {
  let (client, connector) = realtime();
  let release = connector.hold_close();
  client.channel("posts").subscribe().await;
  let late = client.channel("users");

  let closing = tokio::spawn({
    let client = client.clone();
    async move { client.disconnect().await }
  });
  assert!(eventually(|| connector.close_requested()).await);

  let subscribing = tokio::spawn({
    let late = late.clone();
    async move { late.subscribe().await }
  });
  assert!(eventually(|| late.state() == ChannelState::Subscribing).await);

  release.send(()).unwrap();
  assert!(closing.await.unwrap().is_ok());
  let response = subscribing.await.unwrap();

  assert_eq!(response.error().unwrap().kind, ErrorKind::Transport);
  assert_eq!(late.state(), ChannelState::Closed);
  assert_eq!(connector.opened(), 1);
  assert_eq!(client.connection_state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_off_any_removes_wildcard_handlers() {
  let (client, connector) = realtime();
  let seen = Arc::new(Mutex::new(Vec::new()));
  let channel = client.channel("posts");
  channel.on_any(record_ids(&seen));
  channel.off_any();
  channel.on(EventKind::Delete, record_ids(&seen));
  channel.subscribe().await;

  connector.push(0, event("posts", "INSERT", 1));
  connector.push(0, event("posts", "DELETE", 2));

  assert!(eventually(|| seen.lock().len() == 1).await);
  assert_eq!(*seen.lock(), vec![2]);
}
