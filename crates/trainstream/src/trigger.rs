//! Trigger checker — the event-ordered engine deciding when retraining fires.
//!
//! All retraining state lives on one dedicated thread driven by a mailbox;
//! public operations enqueue an event and hand back the paired oneshot
//! receiver, fulfilled from inside the loop. Nothing mutable escapes the
//! thread, so per-application event ordering follows mailbox order.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use trainstream_rpc::RetrainRequest;

use crate::constants::{DEFAULT_ALPHA, DEFAULT_BETA, DEFAULT_WEIGHT};
use crate::policy::{
    Batch, PolicyRegistry, RetrainPolicy, RetrainRecord, RetrainWindow, TrainingBatch,
};
use crate::profiler::RuntimeProfiler;
use crate::util::current_time_micros;

/// Store operations the checker needs, abstracted so tests can run against
/// an in-memory implementation.
pub trait TriggerStore: Send + Sync + 'static {
    /// Name of the backend linked to the app, or `""` when unlinked.
    fn backend_link(&self, app_name: &str) -> String;

    /// Backend record as a field map; empty when the backend is unknown.
    fn backend(&self, backend_name: &str) -> HashMap<String, String>;

    /// Data ids of the app's batches with arrival in the inclusive window.
    fn retrain_data_ids(&self, app_name: &str, from_us: i64, to_us: i64) -> Vec<String>;
}

/// Outbound side of the RPC transport, as seen by the checker.
pub trait RetrainSender: Send + Sync + 'static {
    /// Enqueue framed payload for the backend behind `connection_id`;
    /// returns the message id, `-1` when the transport is down.
    fn send_message(&self, frames: Vec<Vec<u8>>, connection_id: i32) -> i32;
}

/// Lifecycle of a dispatched retrain request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InflightState {
    /// Request sent, no acknowledgement yet.
    Sent,
    /// Backend confirmed that training began.
    StartedReceived,
}

struct InflightMessage {
    send_time_us: i64,
    connection_id: i32,
    app_name: String,
    state: InflightState,
    batch_ids: Vec<String>,
    /// Most recent predecessor for the same app, `-1` for none. Completion
    /// of a message implicitly completes the whole chain behind it.
    prev_msg_link: i32,
}

/// Point-in-time copy of an app's trigger state, for tests and diagnostics.
#[derive(Debug, Clone)]
pub struct RecordSnapshot {
    pub record: RetrainRecord,
    pub inflight: Vec<InflightSnapshot>,
}

#[derive(Debug, Clone)]
pub struct InflightSnapshot {
    pub msg_id: i32,
    pub connection_id: i32,
    pub state: InflightState,
    pub prev_msg_link: i32,
}

enum Event {
    DataArrival {
        app_name: String,
        arrival_us: i64,
        data_size: i64,
        reply: oneshot::Sender<bool>,
    },
    ManualTrigger {
        app_name: String,
        reply: oneshot::Sender<i64>,
    },
    RetrainBegin {
        msg_id: i32,
        reply: oneshot::Sender<bool>,
    },
    RetrainEnd {
        msg_id: i32,
        reply: oneshot::Sender<bool>,
    },
    TimerFired {
        app_name: String,
        armed_arrival_us: i64,
    },
    BackendLinkChanged {
        app_name: String,
    },
    Inspect {
        app_name: String,
        reply: oneshot::Sender<Option<RecordSnapshot>>,
    },
    Shutdown,
}

/// Handle to the checker's event loop. Cloneable operations all enqueue and
/// return immediately; dropped receivers simply discard the fulfillment.
pub struct TriggerChecker {
    tx: mpsc::UnboundedSender<Event>,
    worker: Option<JoinHandle<()>>,
}

impl TriggerChecker {
    /// Spawn the event-loop thread.
    pub fn start(store: Arc<dyn TriggerStore>, sender: Arc<dyn RetrainSender>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let loop_tx = tx.clone();
        let worker = std::thread::Builder::new()
            .name("trigger-checker".into())
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_time()
                    .build()
                    .expect("failed to build trigger checker runtime");
                runtime.block_on(CheckerLoop::new(store, sender, loop_tx).run(rx));
            })
            .expect("failed to spawn trigger checker thread");
        Self {
            tx,
            worker: Some(worker),
        }
    }

    /// Record a fresh batch and evaluate the app's policy.
    pub fn report_data_arrival(
        &self,
        app_name: &str,
        arrival_us: i64,
        data_size: i64,
    ) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        self.send(Event::DataArrival {
            app_name: app_name.to_string(),
            arrival_us,
            data_size,
            reply,
        });
        receiver
    }

    /// Force a retrain of everything since the last dispatched window.
    ///
    /// Resolves to the accepted sample count, `0` when there is nothing to
    /// train, `-1` when the app has no trigger state yet.
    pub fn manual_trigger_retrain(&self, app_name: &str) -> oneshot::Receiver<i64> {
        let (reply, receiver) = oneshot::channel();
        self.send(Event::ManualTrigger {
            app_name: app_name.to_string(),
            reply,
        });
        receiver
    }

    /// Backend acknowledged that training for `msg_id` began.
    pub fn report_retrain_begin(&self, msg_id: i32) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        self.send(Event::RetrainBegin { msg_id, reply });
        receiver
    }

    /// Backend reported that training for `msg_id` completed.
    pub fn report_retrain_end(&self, msg_id: i32) -> oneshot::Receiver<bool> {
        let (reply, receiver) = oneshot::channel();
        self.send(Event::RetrainEnd { msg_id, reply });
        receiver
    }

    /// The store signalled a changed app↔backend link.
    pub fn notify_backend_link_changed(&self, app_name: &str) {
        self.send(Event::BackendLinkChanged {
            app_name: app_name.to_string(),
        });
    }

    /// Snapshot of an app's trigger state.
    pub fn debug_snapshot(&self, app_name: &str) -> oneshot::Receiver<Option<RecordSnapshot>> {
        let (reply, receiver) = oneshot::channel();
        self.send(Event::Inspect {
            app_name: app_name.to_string(),
            reply,
        });
        receiver
    }

    /// Stop the loop and join its thread.
    pub fn stop(&mut self) {
        let _ = self.tx.send(Event::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }

    fn send(&self, event: Event) {
        if self.tx.send(event).is_err() {
            warn!("Trigger checker is stopped; event dropped");
        }
    }
}

impl Drop for TriggerChecker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned exclusively by the event-loop thread.
struct CheckerLoop {
    store: Arc<dyn TriggerStore>,
    sender: Arc<dyn RetrainSender>,
    /// For timer tasks posting back into the mailbox.
    tx: mpsc::UnboundedSender<Event>,
    registry: PolicyRegistry,
    records: HashMap<String, RetrainRecord>,
    profilers: HashMap<String, RuntimeProfiler>,
    /// app name → registered policy name
    app_policies: HashMap<String, &'static str>,
    /// msg_id → inflight message
    inflight: HashMap<i32, InflightMessage>,
    /// app name → backend connection id
    connections: HashMap<String, i32>,
}

impl CheckerLoop {
    fn new(
        store: Arc<dyn TriggerStore>,
        sender: Arc<dyn RetrainSender>,
        tx: mpsc::UnboundedSender<Event>,
    ) -> Self {
        Self {
            store,
            sender,
            tx,
            registry: PolicyRegistry::new(),
            records: HashMap::new(),
            profilers: HashMap::new(),
            app_policies: HashMap::new(),
            inflight: HashMap::new(),
            connections: HashMap::new(),
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Event>) {
        info!("Trigger checker started");
        while let Some(event) = rx.recv().await {
            match event {
                Event::DataArrival {
                    app_name,
                    arrival_us,
                    data_size,
                    reply,
                } => self.handle_data_arrival(app_name, arrival_us, data_size, reply),
                Event::ManualTrigger { app_name, reply } => {
                    self.handle_manual_trigger(app_name, reply)
                }
                Event::RetrainBegin { msg_id, reply } => {
                    if let Some(message) = self.inflight.get_mut(&msg_id) {
                        message.state = InflightState::StartedReceived;
                    }
                    let _ = reply.send(true);
                }
                Event::RetrainEnd { msg_id, reply } => self.handle_retrain_end(msg_id, reply),
                Event::TimerFired {
                    app_name,
                    armed_arrival_us,
                } => self.handle_timer_fired(app_name, armed_arrival_us),
                Event::BackendLinkChanged { app_name } => {
                    self.handle_backend_link_changed(app_name)
                }
                Event::Inspect { app_name, reply } => {
                    let _ = reply.send(self.snapshot(&app_name));
                }
                Event::Shutdown => break,
            }
        }
        info!("Trigger checker stopped");
    }

    fn handle_data_arrival(
        &mut self,
        app_name: String,
        arrival_us: i64,
        data_size: i64,
        reply: oneshot::Sender<bool>,
    ) {
        if let Some(record) = self.records.get_mut(&app_name) {
            record.batches.push(Batch {
                arrival_us,
                size: data_size,
            });
            record.last_arrival_us = arrival_us;
        } else {
            // First arrival for the app: build its trigger state from the
            // linked backend's parameters.
            let backend_name = self.store.backend_link(&app_name);
            if backend_name.is_empty() {
                warn!("No backend found when receiving data from app {app_name}; discarding");
                let _ = reply.send(true);
                return;
            }
            let backend = self.store.backend(&backend_name);
            let field = |key: &str, default: f64| {
                backend
                    .get(key)
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(default)
            };
            let alpha = field("alpha", DEFAULT_ALPHA);
            let beta = field("beta", DEFAULT_BETA);
            let weight = field("weight", DEFAULT_WEIGHT);

            let mut record = RetrainRecord::new(arrival_us, alpha, beta, weight);
            record.batches.push(Batch {
                arrival_us,
                size: data_size,
            });
            self.records.insert(app_name.clone(), record);
            self.profilers
                .insert(app_name.clone(), RuntimeProfiler::new(alpha, beta));

            let requested = backend.get("policy").map(String::as_str).unwrap_or("");
            let policy_name = self.registry.resolve_name(requested);
            self.app_policies.insert(app_name.clone(), policy_name);

            if let Some(id) = backend.get("connection_id").and_then(|v| v.parse().ok()) {
                self.connections.insert(app_name.clone(), id);
            }
            debug!(
                "Created trigger state. app:{app_name} backend:{backend_name} policy:{policy_name} \
                 alpha:{alpha} beta:{beta} weight:{weight}"
            );
        }
        let _ = reply.send(true);
        self.check_trigger(&app_name, arrival_us);
    }

    fn handle_manual_trigger(&mut self, app_name: String, reply: oneshot::Sender<i64>) {
        let Some(record) = self.records.get(&app_name) else {
            error!("No historical data found upon manual trigger for app {app_name}");
            let _ = reply.send(-1);
            return;
        };
        // The boundary batch at the previous window's end is included.
        let last_end = record.data_to_us;
        let data_size = record.size_from(last_end);
        if data_size == 0 {
            let _ = reply.send(0);
            return;
        }
        let window = RetrainWindow::new(last_end, current_time_micros());
        self.trigger_retrain(&app_name, window);
        let _ = reply.send(data_size);
    }

    fn handle_retrain_end(&mut self, msg_id: i32, reply: oneshot::Sender<bool>) {
        let Some(message) = self.inflight.remove(&msg_id) else {
            let _ = reply.send(true);
            return;
        };
        let now_us = current_time_micros();

        // Completion of a message completes every chained predecessor.
        let mut next = message.prev_msg_link;
        while next >= 0 {
            match self.inflight.remove(&next) {
                Some(previous) => next = previous.prev_msg_link,
                None => break,
            }
        }

        let app_name = message.app_name;
        if let Some(record) = self.records.get_mut(&app_name) {
            record.finished = true;

            let erase_from = record.data_from_us;
            let erase_to = record.data_to_us;
            record
                .batches
                .retain(|b| b.arrival_us < erase_from || b.arrival_us > erase_to);

            let time_ms = (now_us - record.training_batch.dispatch_us) / 1000;
            let size = record.training_batch.size;
            if let Some(profiler) = self.profilers.get_mut(&app_name) {
                profiler.add_sample(time_ms, size);
                let (alpha, beta) = profiler.alpha_beta();
                record.alpha = alpha;
                record.beta = beta;
            }
            info!(
                "Retrain ended. app:{app_name} msg_id:{msg_id} batches:{} retrain_time_ms:{time_ms} \
                 trained_size:{size} alpha:{} beta:{}",
                message.batch_ids.len(),
                record.alpha,
                record.beta
            );
        }
        let _ = reply.send(true);

        // Chain the next retrain if the policy wants one.
        let decision = match self.records.get(&app_name) {
            Some(record) => self.policy_for(&app_name).on_retrain_finished(record),
            None => return,
        };
        if let Some(window) = decision {
            self.trigger_retrain(&app_name, window);
        }
    }

    fn handle_timer_fired(&mut self, app_name: String, armed_arrival_us: i64) {
        let window = match self.records.get(&app_name) {
            // Fire only if nothing happened since the timer was armed.
            Some(record) if record.last_arrival_us == armed_arrival_us && record.finished => {
                RetrainWindow::new(record.data_to_us + 1, armed_arrival_us)
            }
            _ => {
                debug!("Suppressing stale retrain timer for app {app_name}");
                return;
            }
        };
        debug!("Trigger retrain after timeout. app:{app_name}");
        self.trigger_retrain(&app_name, window);
    }

    fn handle_backend_link_changed(&mut self, app_name: String) {
        let backend_name = self.store.backend_link(&app_name);
        if backend_name.is_empty() {
            return;
        }
        let backend = self.store.backend(&backend_name);
        if let Some(id) = backend
            .get("connection_id")
            .and_then(|value| value.parse::<i32>().ok())
        {
            debug!("Backend link updated. app:{app_name} backend:{backend_name} connection:{id}");
            self.connections.insert(app_name, id);
        }
    }

    fn check_trigger(&mut self, app_name: &str, arrival_us: i64) {
        let (window, timeout_ms) = {
            let Some(record) = self.records.get(app_name) else {
                return;
            };
            let policy = self.policy_for(app_name);
            match policy.ready_to_retrain(record) {
                Some(window) => (Some(window), 0),
                None => (None, policy.calc_timeout(record)),
            }
        };

        if let Some(window) = window {
            self.trigger_retrain(app_name, window);
        } else if timeout_ms > 0 {
            debug!(
                "Arming retrain timer. app:{app_name} last_arrival:{arrival_us} timeout_ms:{timeout_ms}"
            );
            let tx = self.tx.clone();
            let app = app_name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(timeout_ms as u64)).await;
                let _ = tx.send(Event::TimerFired {
                    app_name: app,
                    armed_arrival_us: arrival_us,
                });
            });
        }
    }

    fn trigger_retrain(&mut self, app_name: &str, window: RetrainWindow) {
        let Some(connection_id) = self.connection_for(app_name) else {
            error!("No backend connection known for app {app_name}; dropping retrain trigger");
            return;
        };
        let batch_ids = self
            .store
            .retrain_data_ids(app_name, window.from_us, window.to_us);
        let Some(record) = self.records.get_mut(app_name) else {
            return;
        };
        let data_size = record.size_in_window(window.from_us, window.to_us);

        let request =
            RetrainRequest::new(window.from_us, window.to_us, data_size, batch_ids.clone());
        let msg_id = self.sender.send_message(request.to_frames(), connection_id);
        if msg_id < 0 {
            warn!("Transport inactive; retrain for app {app_name} was not dispatched");
            return;
        }

        let now_us = current_time_micros();
        record.data_from_us = window.from_us;
        record.data_to_us = window.to_us;
        record.training_batch = TrainingBatch {
            dispatch_us: now_us,
            size: data_size,
        };
        record.finished = false;

        // Most recent inflight message for the same app; msg_id breaks
        // same-microsecond ties.
        let prev_msg_link = self
            .inflight
            .iter()
            .filter(|(_, message)| message.app_name == app_name)
            .max_by_key(|(id, message)| (message.send_time_us, **id))
            .map(|(id, _)| *id)
            .unwrap_or(-1);
        self.inflight.insert(
            msg_id,
            InflightMessage {
                send_time_us: now_us,
                connection_id,
                app_name: app_name.to_string(),
                state: InflightState::Sent,
                batch_ids,
                prev_msg_link,
            },
        );

        info!(
            "Trigger retrain. app:{app_name} msg_id:{msg_id} data_from:{} data_to:{} data_size:{data_size}",
            window.from_us, window.to_us
        );
    }

    fn connection_for(&mut self, app_name: &str) -> Option<i32> {
        if let Some(id) = self.connections.get(app_name) {
            return Some(*id);
        }
        let backend_name = self.store.backend_link(app_name);
        if backend_name.is_empty() {
            return None;
        }
        let backend = self.store.backend(&backend_name);
        let id = backend.get("connection_id")?.parse().ok()?;
        self.connections.insert(app_name.to_string(), id);
        Some(id)
    }

    fn policy_for(&self, app_name: &str) -> Arc<dyn RetrainPolicy> {
        let name = self
            .app_policies
            .get(app_name)
            .copied()
            .unwrap_or(PolicyRegistry::DEFAULT_POLICY);
        self.registry.get(name)
    }

    fn snapshot(&self, app_name: &str) -> Option<RecordSnapshot> {
        let record = self.records.get(app_name)?.clone();
        let mut inflight: Vec<InflightSnapshot> = self
            .inflight
            .iter()
            .filter(|(_, message)| message.app_name == app_name)
            .map(|(id, message)| InflightSnapshot {
                msg_id: *id,
                connection_id: message.connection_id,
                state: message.state,
                prev_msg_link: message.prev_msg_link,
            })
            .collect();
        inflight.sort_by_key(|m| m.msg_id);
        Some(RecordSnapshot { record, inflight })
    }
}
