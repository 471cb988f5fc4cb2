//! AeroDB Rust Client SDK
//!
//! A client for AeroDB's REST data API and realtime change feed.
//!
//! # Example
//!
//! ```no_run
//! use aerodb::{AeroDB, ClientOptions, EventKind};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> aerodb::Result<()> {
//!     let client = AeroDB::new(ClientOptions::new("https://api.example.com").with_key("anon-key"))?;
//!
//!     // Query rows; failures come back in the envelope, never as panics
//!     let admins = client
//!         .from("users")
//!         .select("id, name")
//!         .eq("role", "admin")
//!         .order("created_at", false)
//!         .limit(10)
//!         .execute()
//!         .await;
//!     match admins.into_result() {
//!         Ok(rows) => println!("Found {} admins", rows.len()),
//!         Err(err) => eprintln!("Query failed: {}", err),
//!     }
//!
//!     // Insert a row
//!     let inserted = client.from("posts").insert(json!({"title": "Hello"})).execute().await;
//!     println!("Inserted: {:?}", inserted.data());
//!
//!     // Subscribe to changes
//!     let channel = client.channel("posts");
//!     channel.on(EventKind::Insert, |payload| println!("New post: {:?}", payload.new));
//!     channel.subscribe().await;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod channel;
mod client;
mod error;
pub mod http;
pub mod protocol;
pub mod query;
pub mod realtime;
pub mod response;
pub mod socket;

pub use channel::{Channel, ChannelState, EventCallback};
pub use client::{AeroDB, ClientOptions, Credentials, StaticToken, TokenSource};
pub use error::{CompileError, Error, Result};
pub use http::{HttpResponse, HttpTransport, ReqwestTransport};
pub use protocol::{
  parse_commit_timestamp, ClientFrame, EventKind, RealtimePayload, Record, ServerFrame,
  REALTIME_PATH, REST_PATH,
};
pub use query::{
  parse_filter, table, FilterValue, HttpRequest, Method, Mode, Operator, Ordering, ParsedFilter,
  Predicate, QueryBuilder, QueryState, Scalar, RESERVED_PARAMS,
};
pub use realtime::{ConnectionState, RealtimeClient};
pub use response::{ErrorInfo, ErrorKind, Response, Rows};
pub use socket::{Connector, FrameSink, FrameStream, TungsteniteConnector};
