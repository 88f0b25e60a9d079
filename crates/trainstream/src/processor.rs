//! Data processor facade.
//!
//! The object the frontend talks to: it owns the RPC transport and the
//! trigger checker and wires the transport's completion callbacks back into
//! the checker's mailbox.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::oneshot;
use tracing::info;

use trainstream_rpc::{BackendRpcService, RpcResponse};
use trainstream_store::RedisStore;

use crate::config::Config;
use crate::store_bridge::StoreBridge;
use crate::trigger::{RetrainSender, TriggerChecker};

impl RetrainSender for BackendRpcService {
    fn send_message(&self, frames: Vec<Vec<u8>>, connection_id: i32) -> i32 {
        BackendRpcService::send_message(self, frames, connection_id)
    }
}

pub struct DataProcessor {
    rpc: Arc<BackendRpcService>,
    checker: Arc<TriggerChecker>,
}

impl DataProcessor {
    /// Start the transport and the trigger checker.
    ///
    /// Each takes its own store connection; the transport registers backends
    /// through `transport_store`, the checker reads links and batch ids
    /// through `checker_store`.
    pub fn start(
        config: &Config,
        checker_store: RedisStore,
        transport_store: RedisStore,
    ) -> Result<Self> {
        let rpc = Arc::new(BackendRpcService::new());
        let checker = Arc::new(TriggerChecker::start(
            Arc::new(StoreBridge(Arc::new(checker_store))),
            Arc::clone(&rpc) as Arc<dyn RetrainSender>,
        ));

        let on_started = {
            let checker = Arc::clone(&checker);
            Box::new(move |(msg_id, _result): RpcResponse| {
                let _ = checker.report_retrain_begin(msg_id);
            })
        };
        let on_ended = {
            let checker = Arc::clone(&checker);
            Box::new(move |(msg_id, _result): RpcResponse| {
                let _ = checker.report_retrain_end(msg_id);
            })
        };
        rpc.start(
            &config.backend_rpc.host,
            config.backend_rpc.port,
            on_started,
            on_ended,
            Arc::new(StoreBridge(Arc::new(transport_store))),
        )?;

        info!("Data processor started");
        Ok(Self { rpc, checker })
    }

    /// Record one uploaded batch; resolves once the checker has absorbed it.
    pub fn update_retrain_trigger_data(
        &self,
        app_name: &str,
        arrival_us: i64,
        data_size: i64,
    ) -> oneshot::Receiver<bool> {
        self.checker
            .report_data_arrival(app_name, arrival_us, data_size)
    }

    /// Force a retrain; resolves to the accepted sample count.
    pub fn manual_retrain(&self, app_name: &str) -> oneshot::Receiver<i64> {
        self.checker.manual_trigger_retrain(app_name)
    }

    /// Shared handle to the checker, for subscription wiring.
    pub fn checker(&self) -> Arc<TriggerChecker> {
        Arc::clone(&self.checker)
    }

    /// Stop the transport. The checker stops when its last handle drops.
    pub fn shutdown(&self) {
        self.rpc.stop();
    }
}
