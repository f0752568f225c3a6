/// mDNS service type robots advertise their HTTP API under
pub const ROBOT_SERVICE_TYPE: &str = "_http._tcp.local.";

/// Port the robot API listens on when nothing else is known
pub const DEFAULT_PORT: u16 = 31950;

/// Poll interval used when none (or zero) is configured
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5000;

/// Upper bound for a single health probe
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 3000;

/// Device-identity probe path
pub const HEALTH_PATH: &str = "/health";

/// Server-identity probe path
pub const SERVER_HEALTH_PATH: &str = "/server/update/health";
