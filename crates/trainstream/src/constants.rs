//! Platform-wide defaults.

/// Default port of the ingest HTTP frontend.
pub const INGEST_FRONTEND_PORT: u16 = 1339;

/// Default port the backend RPC transport binds to.
pub const RPC_BACKEND_PORT: u16 = 7001;

/// Default Redis port.
pub const STORE_PORT: u16 = 6379;

/// Cost-model defaults used until a backend supplies its own parameters.
pub const DEFAULT_ALPHA: f64 = 1.0;
pub const DEFAULT_BETA: f64 = 1.0;
pub const DEFAULT_WEIGHT: f64 = 10.0;
