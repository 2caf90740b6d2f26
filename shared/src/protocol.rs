/// Port the robot API server listens on
pub const DEFAULT_PORT: u16 = 31950;

/// mDNS service type robots announce themselves under
pub const ROBOT_SERVICE_TYPE: &str = "_http._tcp.local.";

/// TXT record key carrying the advertised robot model
pub const TXT_ROBOT_MODEL: &str = "robotModel";

/// Health endpoints probed on every candidate address
pub const HEALTH_PATH: &str = "/health";
pub const SERVER_HEALTH_PATH: &str = "/server/update/health";

/// Fixed USB-link address, always polled regardless of discovery results
pub const FALLBACK_CANDIDATE_IP: &str = "fd00:0:cafe:fefe::1";

/// Background liveness cadence
pub const SLOW_POLL_INTERVAL_MS: u64 = 15_000;

/// Cadence while a robot-selection screen is actively discovering
pub const FAST_POLL_INTERVAL_MS: u64 = 3_000;

/// API path prefix of the discovery daemon
pub const API_PREFIX: &str = "/v1";
