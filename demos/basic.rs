//! Basic example demonstrating AeroDB Rust SDK usage.
//!
//! Reads `AERODB_URL`, `AERODB_KEY` and `AERODB_SCHEMA` from the environment.

use aerodb::{AeroDB, ClientOptions, EventKind, RealtimePayload};
use serde_json::json;
use std::time::Duration;

#[tokio::main]
async fn main() -> aerodb::Result<()> {
  let client = AeroDB::new(ClientOptions::from_env()?.with_timeout(Duration::from_secs(10)))?;
  println!("Client ready: {:?}", client.options());

  // Insert a row
  let inserted = client
    .from("users")
    .insert(json!({
        "name": "Alice",
        "email": "alice@example.com",
        "active": true
    }))
    .execute()
    .await;
  match inserted.into_result() {
    Ok(rows) => println!("Inserted: {:?}", rows),
    Err(err) => println!("Insert failed: {}", err),
  }

  // Query with filters, ordering and paging
  let active = client
    .from("users")
    .select("id, name, email")
    .eq("active", true)
    .order("name", true)
    .limit(10)
    .execute()
    .await;
  if let Some(rows) = active.data() {
    println!("Active users: {}", rows.len());
  }

  // Compile errors surface in the envelope without a request
  let rejected = client.from("users").update(json!({"active": false})).execute().await;
  if let Some(err) = rejected.error() {
    println!("Rejected locally: {}", err);
  }

  // Update matching rows
  let updated = client
    .from("users")
    .eq("email", "alice@example.com")
    .update(json!({"active": false}))
    .execute()
    .await;
  println!("Updated: {:?}", updated);

  // Subscribe to changes
  let channel = client.channel("users");
  channel
    .on(EventKind::Insert, |payload: &RealtimePayload| {
      println!("New user: {:?}", payload.new);
    })
    .on(EventKind::Delete, |payload: &RealtimePayload| {
      println!("Removed user: {:?}", payload.old);
    });

  let subscribed = channel.subscribe().await;
  println!("Subscribed: {} ({})", subscribed.is_ok(), channel.state());

  tokio::time::sleep(Duration::from_secs(5)).await;

  // Delete and clean up
  let deleted = client.from("users").eq("email", "alice@example.com").delete().execute().await;
  println!("Deleted: {:?}", deleted.data());

  channel.unsubscribe().await;
  client.close().await;
  println!("Closed");
  Ok(())
}
