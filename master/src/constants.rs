use std::time::Duration;

// ======= Authenticator =======

/// How long a resolved identity stays valid without re-consulting the chain.
pub const AUTH_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

pub const AUTH_CACHE_CAPACITY: usize = 4096;

/// Period of the background sweep that evicts expired cache entries.
pub const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ======= Worker registry =======

pub const LIVENESS_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Heartbeat age beyond which a worker is marked offline.
pub const LIVENESS_DEADLINE: Duration = Duration::from_secs(5 * 60);

pub const REGISTRY_CAPACITY: usize = 10_000;

// ======= Event bridge =======

pub const EVENT_BACKLOG_CAPACITY: usize = 1024;

// ======= Control-plane supervisor =======

pub const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const READINESS_TIMEOUT: Duration = Duration::from_secs(60);

pub const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

// ======= API gateway =======

pub const MAX_CONCURRENT_CONNECTIONS: usize = 1000;

pub const PROXY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long the registration endpoint waits for the event bridge to promote
/// a pending worker before answering 202.
pub const REGISTRATION_WAIT: Duration = Duration::from_secs(10);

/// Malformed-token rate limit per source address.
pub const RATE_LIMIT_PER_SECOND: f64 = 10.0;
pub const RATE_LIMIT_BURST: f64 = 20.0;

// ======= Chain deadlines =======

pub const CHAIN_READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const CHAIN_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

// ======= Settings environment variables =======

pub const CONFIG_ROOT: &str = "DAAS_CONFIG_ROOT";
pub const DEFAULT_CONFIG_ROOT: &str = "/etc/daas";

// ======= Process exit codes =======

pub const EXIT_ATTESTATION_FAILURE: i32 = 2;
pub const EXIT_CONTROL_PLANE_TIMEOUT: i32 = 3;
pub const EXIT_CHAIN_UNREACHABLE: i32 = 4;
