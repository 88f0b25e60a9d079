//! Synchronous Redis client for trainstream metadata.

use std::collections::HashMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use rand::Rng;
use redis::{Connection, ConnectionLike};
use tracing::{debug, error, warn};

use crate::error::{StoreError, StoreResult};
use crate::keys;

/// One store connection, owned by a single component.
///
/// Methods select the namespace database before each command; the inner
/// connection is serialized behind a mutex so the owner may be shared via
/// `Arc` across its own helper tasks.
pub struct RedisStore {
    conn: Mutex<Connection>,
}

impl RedisStore {
    /// Connect, retrying forever with a one second backoff.
    ///
    /// Used at process startup where the store is a hard prerequisite.
    pub fn connect(host: &str, port: u16) -> Self {
        let url = format!("redis://{host}:{port}/");
        loop {
            match Self::try_connect(&url) {
                Ok(store) => return store,
                Err(e) => {
                    error!("Failed to connect to store at {url}: {e}. Retrying in 1 second...");
                    thread::sleep(Duration::from_secs(1));
                }
            }
        }
    }

    /// Single connection attempt.
    pub fn try_connect(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(|e| StoreError::Connection(e.to_string()))?;
        let mut conn = client.get_connection()?;
        if !conn.check_connection() {
            return Err(StoreError::Connection(format!("ping to {url} failed")));
        }
        debug!("Connected to store at {url}");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Ask the server to emit keyspace notifications.
    ///
    /// Deployments may configure this server-side instead; failures here are
    /// non-fatal for callers that do.
    pub fn enable_keyspace_notifications(&self) -> StoreResult<()> {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg("KEA")
            .query::<()>(&mut conn)?;
        Ok(())
    }

    fn with_db<T>(
        &self,
        db: u32,
        run: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> StoreResult<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|p| p.into_inner());
        redis::cmd("SELECT").arg(db).query::<()>(&mut conn)?;
        Ok(run(&mut conn)?)
    }

    /// Name of the backend linked to `app_name`, or `""` when unlinked.
    pub fn get_backend_link(&self, app_name: &str) -> StoreResult<String> {
        let link: Option<String> = self.with_db(keys::APP_BACKEND_LINK_DB, |conn| {
            redis::cmd("GET").arg(app_name).query(conn)
        })?;
        Ok(link.unwrap_or_default())
    }

    /// Link an application to a backend.
    pub fn set_backend_link(&self, app_name: &str, backend_name: &str) -> StoreResult<()> {
        self.with_db(keys::APP_BACKEND_LINK_DB, |conn| {
            redis::cmd("SET").arg(app_name).arg(backend_name).query(conn)
        })
    }

    /// Full backend record as a field map; empty when the backend is unknown.
    pub fn get_backend(&self, backend_name: &str) -> StoreResult<HashMap<String, String>> {
        self.with_db(keys::BACKEND_DB, |conn| {
            redis::cmd("HGETALL").arg(backend_name).query(conn)
        })
    }

    /// Register a backend announced over the RPC transport.
    #[allow(clippy::too_many_arguments)]
    pub fn add_backend(
        &self,
        backend_name: &str,
        backend_version: &str,
        policy: &str,
        alpha: f64,
        beta: f64,
        weight: f64,
        connection_id: i32,
    ) -> StoreResult<()> {
        self.with_db(keys::BACKEND_DB, |conn| {
            redis::cmd("HSET")
                .arg(backend_name)
                .arg("backend_version")
                .arg(backend_version)
                .arg("policy")
                .arg(policy)
                .arg("connection_id")
                .arg(connection_id)
                .arg("alpha")
                .arg(alpha)
                .arg("beta")
                .arg(beta)
                .arg("weight")
                .arg(weight)
                .query(conn)
        })
    }

    /// Whether an application record exists.
    pub fn application_exists(&self, app_name: &str) -> StoreResult<bool> {
        self.with_db(keys::APPLICATION_DB, |conn| {
            redis::cmd("EXISTS").arg(app_name).query(conn)
        })
    }

    /// Persist one uploaded batch, returning its generated data id.
    ///
    /// Each sample row is stored as one comma-terminated list entry under the
    /// data id.
    pub fn add_retrain_data(&self, timestamp_us: i64, data: &[Vec<f64>]) -> StoreResult<String> {
        let data_id = gen_retrain_data_id(timestamp_us);
        self.with_db(keys::RETRAIN_DATA_DB, |conn| {
            for row in data {
                let mut cmd = redis::cmd("RPUSH");
                cmd.arg(&data_id);
                for value in row {
                    cmd.arg(*value);
                }
                cmd.arg(keys::ITEM_DELIMITER);
                cmd.query::<i64>(conn)?;
            }
            Ok(())
        })?;
        Ok(data_id)
    }

    /// Record that `app_name` uploaded the batch `data_id` at `timestamp_us`.
    pub fn add_app_data_link(
        &self,
        app_name: &str,
        timestamp_us: i64,
        data_id: &str,
    ) -> StoreResult<()> {
        let key = keys::app_data_link_key(app_name, timestamp_us);
        self.with_db(keys::APP_DATA_LINK_DB, |conn| {
            redis::cmd("HSET")
                .arg(&key)
                .arg("app_name")
                .arg(app_name)
                .arg("timestamp")
                .arg(timestamp_us)
                .arg("data_id")
                .arg(data_id)
                .query(conn)
        })
    }

    /// Data ids of batches uploaded by `app_name` with arrival time in
    /// `[begin_timestamp_us, end_timestamp_us]`.
    pub fn get_retrain_data_ids(
        &self,
        app_name: &str,
        begin_timestamp_us: i64,
        end_timestamp_us: i64,
    ) -> StoreResult<Vec<String>> {
        let pattern = format!("{app_name}{}*", keys::ITEM_DELIMITER);
        self.with_db(keys::APP_DATA_LINK_DB, |conn| {
            let link_keys: Vec<String> = redis::cmd("KEYS").arg(&pattern).query(conn)?;
            let mut data_ids = Vec::new();
            for key in link_keys {
                let Some(ts) = key
                    .rsplit_once(keys::ITEM_DELIMITER)
                    .and_then(|(_, ts)| ts.parse::<i64>().ok())
                else {
                    warn!("Skipping malformed app-data-link key: {key}");
                    continue;
                };
                if ts >= begin_timestamp_us && ts <= end_timestamp_us {
                    let data_id: Option<String> =
                        redis::cmd("HGET").arg(&key).arg("data_id").query(conn)?;
                    if let Some(id) = data_id {
                        data_ids.push(id);
                    }
                }
            }
            Ok(data_ids)
        })
    }
}

/// Data ids are the upload timestamp plus three random digits, which keeps
/// them sortable by arrival while avoiding collisions between same-microsecond
/// uploads.
fn gen_retrain_data_id(timestamp_us: i64) -> String {
    let suffix: u16 = rand::thread_rng().gen_range(0..1000);
    format!("{timestamp_us}{suffix:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_ids_carry_timestamp_prefix() {
        let id = gen_retrain_data_id(1_000_000);
        assert!(id.starts_with("1000000"));
        assert_eq!(id.len(), "1000000".len() + 3);
    }

    #[test]
    fn data_ids_differ_across_calls() {
        let ids: Vec<String> = (0..32).map(|_| gen_retrain_data_id(42)).collect();
        let distinct: std::collections::HashSet<_> = ids.iter().collect();
        // 3 random digits: 32 draws colliding entirely would be astronomically
        // unlikely, and the timestamp prefix disambiguates across uploads.
        assert!(distinct.len() > 1);
    }
}
