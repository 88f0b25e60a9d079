//! ROUTER transport worker.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use tracing::{debug, error, info, trace, warn};

use crate::protocol::{
    decode_i32, encode_i32, parse_backend_params, HeartbeatType, MessageType,
};

/// `(msg_id, result)` pair delivered by a backend notification.
pub type RpcResponse = (i32, i32);

/// Callback invoked on the transport thread for backend notifications.
pub type ResponseCallback = Box<dyn Fn(RpcResponse) + Send>;

/// A backend's first-contact announcement, with params already parsed.
#[derive(Debug, Clone)]
pub struct BackendAnnouncement {
    pub backend_name: String,
    pub backend_version: String,
    pub app_name: String,
    pub policy_name: String,
    pub alpha: f64,
    pub beta: f64,
    pub weight: f64,
    pub connection_id: i32,
}

/// Where the transport records newly announced backends.
///
/// Implemented by the persistent store in production and by in-memory fakes
/// in tests.
pub trait BackendDirectory: Send + Sync + 'static {
    /// Persist the backend record.
    fn register_backend(&self, announcement: &BackendAnnouncement) -> Result<()>;

    /// Whether the named application is already registered.
    fn application_exists(&self, app_name: &str) -> Result<bool>;

    /// Link an existing application to the backend serving it.
    fn link_application(&self, app_name: &str, backend_name: &str) -> Result<()>;
}

struct OutboundRequest {
    connection_id: i32,
    msg_id: i32,
    frames: Vec<Vec<u8>>,
    enqueued_us: i64,
}

/// RPC service for communicating with training backends.
///
/// One worker thread owns the ROUTER socket. Producers enqueue outbound
/// requests without blocking; the worker drains the whole queue every
/// iteration and receives at most one inbound message per iteration so sends
/// are never starved.
pub struct BackendRpcService {
    active: Arc<AtomicBool>,
    next_msg_id: AtomicI32,
    queue: Arc<Mutex<VecDeque<OutboundRequest>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Default for BackendRpcService {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendRpcService {
    pub fn new() -> Self {
        Self {
            active: Arc::new(AtomicBool::new(false)),
            next_msg_id: AtomicI32::new(0),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            worker: Mutex::new(None),
        }
    }

    /// Bind the ROUTER socket and start the worker thread.
    ///
    /// `on_started` and `on_ended` fire on the worker thread for
    /// `RetrainingStarted` / `RetrainingEnded` notifications. Starting an
    /// already running service is a programming error and fails.
    pub fn start(
        &self,
        ip: &str,
        port: u16,
        on_started: ResponseCallback,
        on_ended: ResponseCallback,
        directory: Arc<dyn BackendDirectory>,
    ) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            bail!("attempted to start an already running backend RPC service");
        }

        let address = format!("tcp://{ip}:{port}");
        let context = zmq::Context::new();
        let socket = match self.bind_router(&context, &address) {
            Ok(socket) => socket,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let active = Arc::clone(&self.active);
        let queue = Arc::clone(&self.queue);
        let handle = std::thread::Builder::new()
            .name("backend-rpc".into())
            .spawn(move || {
                info!("Backend RPC worker started on {address}");
                let mut loop_state = RouterLoop {
                    socket,
                    directory,
                    on_started,
                    on_ended,
                    connections: HashMap::new(),
                    identities: HashMap::new(),
                    backend_names: HashMap::new(),
                    next_connection_id: 0,
                };
                while active.load(Ordering::SeqCst) {
                    loop_state.run_once(&queue);
                }
                info!("Backend RPC worker stopped");
            })
            .map_err(|e| {
                self.active.store(false, Ordering::SeqCst);
                anyhow::anyhow!("failed to spawn backend RPC worker thread: {e}")
            })?;

        *self.worker.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
        Ok(())
    }

    fn bind_router(&self, context: &zmq::Context, address: &str) -> Result<zmq::Socket> {
        let socket = context
            .socket(zmq::ROUTER)
            .context("failed to create ROUTER socket")?;
        socket
            .bind(address)
            .with_context(|| format!("failed to bind backend RPC socket to {address}"))?;
        Ok(socket)
    }

    /// Signal the worker and join it.
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            if let Some(handle) = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take() {
                let _ = handle.join();
            }
        }
    }

    /// Enqueue a framed request for the backend behind `connection_id`.
    ///
    /// Returns the assigned message id, or `-1` when the service is not
    /// running. Unknown connection ids are dropped by the worker with a
    /// logged error; the id is still consumed.
    pub fn send_message(&self, frames: Vec<Vec<u8>>, connection_id: i32) -> i32 {
        if !self.active.load(Ordering::SeqCst) {
            error!("Cannot send message on inactive backend RPC service. Dropping message");
            return -1;
        }
        let msg_id = self.next_msg_id.fetch_add(1, Ordering::SeqCst);
        let request = OutboundRequest {
            connection_id,
            msg_id,
            frames,
            enqueued_us: current_time_micros(),
        };
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(request);
        msg_id
    }
}

impl Drop for BackendRpcService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by the worker thread.
struct RouterLoop {
    socket: zmq::Socket,
    directory: Arc<dyn BackendDirectory>,
    on_started: ResponseCallback,
    on_ended: ResponseCallback,
    /// connection_id → routing identity
    connections: HashMap<i32, Vec<u8>>,
    /// routing identity → connection_id
    identities: HashMap<Vec<u8>, i32>,
    /// routing identity → backend name
    backend_names: HashMap<Vec<u8>, String>,
    next_connection_id: i32,
}

impl RouterLoop {
    fn run_once(&mut self, queue: &Mutex<VecDeque<OutboundRequest>>) {
        // Block for at most 1 ms, and not at all while sends are pending.
        let timeout = if queue.lock().unwrap_or_else(|p| p.into_inner()).is_empty() {
            1
        } else {
            0
        };
        let readable = {
            let mut items = [self.socket.as_poll_item(zmq::POLLIN)];
            match zmq::poll(&mut items, timeout) {
                Ok(_) => items[0].is_readable(),
                Err(e) => {
                    error!("Backend RPC poll failed: {e}");
                    false
                }
            }
        };
        // At most one receive per iteration keeps the send queue drained
        // under inbound pressure.
        if readable {
            if let Err(e) = self.receive_one() {
                warn!("Dropping inbound backend message: {e}");
            }
        }
        self.drain_sends(queue);
    }

    fn drain_sends(&mut self, queue: &Mutex<VecDeque<OutboundRequest>>) {
        loop {
            let request = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
            let Some(request) = request else { break };

            trace!(
                msg_id = request.msg_id,
                queueing_delay_us = current_time_micros() - request.enqueued_us,
                "Dequeued backend request"
            );
            let Some(identity) = self.connections.get(&request.connection_id) else {
                error!(
                    "Attempted to send message to unknown backend connection {}",
                    request.connection_id
                );
                continue;
            };

            let mut frames: Vec<Vec<u8>> = Vec::with_capacity(request.frames.len() + 4);
            frames.push(identity.clone());
            frames.push(Vec::new());
            frames.push(encode_i32(MessageType::StartRetraining as i32));
            frames.push(encode_i32(request.msg_id));
            frames.extend(request.frames);
            if let Err(e) = self.socket.send_multipart(frames, 0) {
                error!("Failed to send retrain request {}: {e}", request.msg_id);
            }
        }
    }

    fn receive_one(&mut self) -> Result<()> {
        let frames = self
            .socket
            .recv_multipart(0)
            .context("ROUTER receive failed")?;
        if frames.len() < 3 {
            bail!("message with {} frames is too short", frames.len());
        }
        let identity = frames[0].clone();
        let raw_type = decode_i32(&frames[2])?;
        let Some(message_type) = MessageType::from_i32(raw_type) else {
            bail!("unrecognized message type {raw_type}");
        };
        let known = self.identities.contains_key(&identity);

        match message_type {
            MessageType::BackendMetadata => self.handle_metadata(identity, &frames[3..]),
            MessageType::RetrainingStarted => {
                self.handle_notification(&identity, &frames[3..], "RetrainingStarted", |svc, resp| {
                    (svc.on_started)(resp)
                })
            }
            MessageType::RetrainingEnded => {
                self.handle_notification(&identity, &frames[3..], "RetrainingEnded", |svc, resp| {
                    (svc.on_ended)(resp)
                })
            }
            MessageType::BackendHeartbeat => self.send_heartbeat_response(&identity, !known),
            MessageType::StartRetraining => {
                bail!("backends must not send StartRetraining")
            }
        }
    }

    fn handle_metadata(&mut self, identity: Vec<u8>, payload: &[Vec<u8>]) -> Result<()> {
        if payload.len() < 5 {
            bail!("backend metadata needs 5 frames, got {}", payload.len());
        }
        if self.identities.contains_key(&identity) {
            // Re-announcement from a live connection changes nothing.
            return Ok(());
        }

        let text = |frame: &Vec<u8>| String::from_utf8_lossy(frame).into_owned();
        let backend_name = text(&payload[0]);
        let backend_version = text(&payload[1]);
        let app_name = text(&payload[2]);
        let policy_name = text(&payload[3]);
        let (alpha, beta, weight) = parse_backend_params(&text(&payload[4]));

        let connection_id = self.next_connection_id;
        self.next_connection_id += 1;
        self.connections.insert(connection_id, identity.clone());
        self.identities.insert(identity.clone(), connection_id);
        self.backend_names.insert(identity, backend_name.clone());

        let announcement = BackendAnnouncement {
            backend_name: backend_name.clone(),
            backend_version,
            app_name: app_name.clone(),
            policy_name,
            alpha,
            beta,
            weight,
            connection_id,
        };
        if let Err(e) = self.directory.register_backend(&announcement) {
            error!("Failed to persist backend {backend_name}: {e}");
        }
        info!(
            "New backend connected. backend:{backend_name} app:{app_name} connection:{connection_id} \
             alpha:{alpha} beta:{beta} weight:{weight}"
        );

        match self.directory.application_exists(&app_name) {
            Ok(true) => {
                if let Err(e) = self.directory.link_application(&app_name, &backend_name) {
                    error!("Failed to link {app_name} to {backend_name}: {e}");
                }
            }
            Ok(false) => {
                debug!("Application {app_name} not registered yet; link deferred");
            }
            Err(e) => error!("Failed to look up application {app_name}: {e}"),
        }
        Ok(())
    }

    fn handle_notification(
        &mut self,
        identity: &[u8],
        payload: &[Vec<u8>],
        kind: &str,
        deliver: impl Fn(&Self, RpcResponse),
    ) -> Result<()> {
        if payload.len() < 2 {
            bail!("{kind} needs 2 frames, got {}", payload.len());
        }
        let Some(backend_name) = self.backend_names.get(identity) else {
            bail!("{kind} from unknown routing identity");
        };
        let msg_id = decode_i32(&payload[0])?;
        let result = decode_i32(&payload[1])?;
        debug!("Received {kind} from {backend_name}. msg_id:{msg_id} result:{result}");
        deliver(self, (msg_id, result));
        Ok(())
    }

    fn send_heartbeat_response(&mut self, identity: &[u8], request_metadata: bool) -> Result<()> {
        let sub_type = if request_metadata {
            HeartbeatType::RequestContainerMetadata
        } else {
            HeartbeatType::KeepAlive
        };
        let frames: Vec<Vec<u8>> = vec![
            identity.to_vec(),
            Vec::new(),
            encode_i32(MessageType::BackendHeartbeat as i32),
            encode_i32(sub_type as i32),
        ];
        self.socket
            .send_multipart(frames, 0)
            .context("failed to send heartbeat response")?;
        trace!("Sent heartbeat response {sub_type:?}");
        Ok(())
    }
}

fn current_time_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}
