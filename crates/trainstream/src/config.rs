//! Process configuration.

use serde::{Deserialize, Serialize};

use crate::constants;

/// Single configuration for the whole process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Metadata store endpoint
    pub store: EndpointConfig,
    /// Ingest HTTP frontend bind address
    pub ingest: EndpointConfig,
    /// Backend RPC transport bind address
    pub backend_rpc: EndpointConfig,
}

/// Host/port pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: EndpointConfig {
                host: "127.0.0.1".to_string(),
                port: constants::STORE_PORT,
            },
            ingest: EndpointConfig {
                host: "0.0.0.0".to_string(),
                port: constants::INGEST_FRONTEND_PORT,
            },
            backend_rpc: EndpointConfig {
                host: "0.0.0.0".to_string(),
                port: constants::RPC_BACKEND_PORT,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_platform_ports() {
        let config = Config::default();
        assert_eq!(config.ingest.port, 1339);
        assert_eq!(config.backend_rpc.port, 7001);
        assert_eq!(config.store.port, 6379);
    }
}
