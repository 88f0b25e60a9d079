//! Adapters plugging the Redis store into the core's trait seams.
//!
//! Store failures on read paths are logged and neutralized to empty results;
//! the event loop never dies on a store hiccup.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tracing::error;

use trainstream_rpc::{BackendAnnouncement, BackendDirectory};
use trainstream_store::RedisStore;

use crate::trigger::TriggerStore;

/// A store connection exposed through the core's trait seams.
pub struct StoreBridge(pub Arc<RedisStore>);

impl TriggerStore for StoreBridge {
    fn backend_link(&self, app_name: &str) -> String {
        self.0.get_backend_link(app_name).unwrap_or_else(|e| {
            error!("Backend link lookup failed for {app_name}: {e}");
            String::new()
        })
    }

    fn backend(&self, backend_name: &str) -> HashMap<String, String> {
        self.0.get_backend(backend_name).unwrap_or_else(|e| {
            error!("Backend lookup failed for {backend_name}: {e}");
            HashMap::new()
        })
    }

    fn retrain_data_ids(&self, app_name: &str, from_us: i64, to_us: i64) -> Vec<String> {
        self.0
            .get_retrain_data_ids(app_name, from_us, to_us)
            .unwrap_or_else(|e| {
                error!("Retrain data id lookup failed for {app_name}: {e}");
                Vec::new()
            })
    }
}

impl BackendDirectory for StoreBridge {
    fn register_backend(&self, announcement: &BackendAnnouncement) -> Result<()> {
        self.0.add_backend(
            &announcement.backend_name,
            &announcement.backend_version,
            &announcement.policy_name,
            announcement.alpha,
            announcement.beta,
            announcement.weight,
            announcement.connection_id,
        )?;
        Ok(())
    }

    fn application_exists(&self, app_name: &str) -> Result<bool> {
        Ok(self.0.application_exists(app_name)?)
    }

    fn link_application(&self, app_name: &str, backend_name: &str) -> Result<()> {
        self.0.set_backend_link(app_name, backend_name)?;
        Ok(())
    }
}
