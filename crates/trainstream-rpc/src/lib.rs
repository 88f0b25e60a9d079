//! RPC transport for training backends.
//!
//! A single worker thread owns a ROUTER socket and multiplexes every
//! connected backend: outbound retrain requests, backend registration,
//! started/ended notifications and heartbeats. Backends are addressed by a
//! dense connection id assigned on first contact; the routing identity never
//! leaves this crate.

pub mod protocol;
pub mod service;

pub use protocol::{HeartbeatType, MessageType, RetrainRequest, RetrainType};
pub use service::{BackendAnnouncement, BackendDirectory, BackendRpcService, RpcResponse};
