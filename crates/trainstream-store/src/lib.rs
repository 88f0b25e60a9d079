//! Typed facade over the Redis metadata store.
//!
//! Every component owns its own connection object; the facade never shares
//! sockets across threads. Startup connections retry forever with a one
//! second backoff, mid-flight failures surface as [`StoreError`] and callers
//! treat them as empty results.

pub mod client;
pub mod error;
pub mod keys;
pub mod subscriber;

pub use client::RedisStore;
pub use error::{StoreError, StoreResult};
pub use subscriber::subscribe_backend_link_changes;
