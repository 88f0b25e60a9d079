//! Keyspace-notification subscriptions.
//!
//! The reader owns a dedicated thread and a dedicated connection; callbacks
//! run on that thread and must not touch other components' state directly —
//! they are expected to forward into a thread-safe mailbox.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::StoreResult;
use crate::keys;

/// Spawns the subscription reader for app↔backend link changes.
///
/// `callback(key, event)` is invoked for every notification in the link
/// namespace; `event` is the Redis event name (`"set"` for link updates).
/// The reader reconnects with a one second backoff if the subscription
/// connection drops.
pub fn subscribe_backend_link_changes<F>(host: &str, port: u16, callback: F) -> JoinHandle<()>
where
    F: Fn(&str, &str) + Send + 'static,
{
    let url = format!("redis://{host}:{port}/");
    thread::Builder::new()
        .name("store-subscriber".into())
        .spawn(move || loop {
            match run_subscription(&url, keys::APP_BACKEND_LINK_DB, &callback) {
                Ok(()) => return,
                Err(e) => {
                    error!("Store subscription lost: {e}. Retrying in 1 second...");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        })
        .expect("failed to spawn store subscriber thread")
}

fn run_subscription<F>(url: &str, db: u32, callback: &F) -> StoreResult<()>
where
    F: Fn(&str, &str),
{
    let client = redis::Client::open(url)
        .map_err(|e| crate::error::StoreError::Connection(e.to_string()))?;
    let mut conn = client.get_connection()?;
    let mut pubsub = conn.as_pubsub();
    let pattern = keys::keyspace_pattern(db);
    pubsub.psubscribe(&pattern)?;
    debug!("Subscribed to keyspace pattern {pattern}");

    loop {
        let msg = pubsub.get_message()?;
        let channel = msg.get_channel_name().to_string();
        let event: String = match msg.get_payload() {
            Ok(event) => event,
            Err(e) => {
                warn!("Dropping notification with unreadable payload on {channel}: {e}");
                continue;
            }
        };
        match keys::key_from_channel(&channel) {
            Some(key) => callback(key, &event),
            None => warn!("Dropping notification with malformed channel: {channel}"),
        }
    }
}
