use std::collections::HashSet;
use std::time::Duration;
use serde::Deserialize;
use shared::protocol::{
    DEFAULT_PORT, FALLBACK_CANDIDATE_IP, FAST_POLL_INTERVAL_MS, ROBOT_SERVICE_TYPE,
    SLOW_POLL_INTERVAL_MS,
};
use shared::types::Address;

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Background liveness cadence
    #[serde(default = "default_slow_interval")]
    pub health_poll_interval_ms: u64,
    /// Cadence between "discovery start" and "discovery finish"
    #[serde(default = "default_fast_interval")]
    pub fast_poll_interval_ms: u64,
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    #[serde(default = "default_notify_throttle")]
    pub notify_throttle_ms: u64,
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Announcements on other ports are ignored
    #[serde(default = "default_ports")]
    pub ports: Vec<u16>,
    #[serde(default = "default_true")]
    pub enable_mdns: bool,
    /// Operator-entered hosts, always polled
    #[serde(default)]
    pub candidates: Vec<String>,
    #[serde(default = "default_true")]
    pub include_fallback: bool,
    #[serde(default)]
    pub disable_cache: bool,
    /// Automatically finish fast discovery after this long
    #[serde(default)]
    pub discovery_timeout_secs: Option<u64>,
}

fn default_slow_interval() -> u64 {
    SLOW_POLL_INTERVAL_MS
}

fn default_fast_interval() -> u64 {
    FAST_POLL_INTERVAL_MS
}

fn default_probe_timeout() -> u64 {
    4_000
}

fn default_notify_throttle() -> u64 {
    250
}

fn default_service_type() -> String {
    ROBOT_SERVICE_TYPE.to_string()
}

fn default_ports() -> Vec<u16> {
    vec![DEFAULT_PORT]
}

fn default_true() -> bool {
    true
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            health_poll_interval_ms: default_slow_interval(),
            fast_poll_interval_ms: default_fast_interval(),
            probe_timeout_ms: default_probe_timeout(),
            notify_throttle_ms: default_notify_throttle(),
            service_type: default_service_type(),
            ports: default_ports(),
            enable_mdns: true,
            candidates: Vec::new(),
            include_fallback: true,
            disable_cache: false,
            discovery_timeout_secs: None,
        }
    }
}

impl ClientConfig {
    pub fn slow_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn fast_interval(&self) -> Duration {
        Duration::from_millis(self.fast_poll_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn notify_throttle(&self) -> Duration {
        Duration::from_millis(self.notify_throttle_ms)
    }

    pub fn discovery_timeout(&self) -> Option<Duration> {
        self.discovery_timeout_secs.map(Duration::from_secs)
    }

    /// Parsed candidates plus the fallback address, without duplicates.
    /// Entries that do not parse are logged and skipped.
    pub fn manual_addresses(&self, candidates: &[String]) -> Vec<Address> {
        let mut seen = HashSet::new();
        let fallback = self
            .include_fallback
            .then(|| Address::new(FALLBACK_CANDIDATE_IP, DEFAULT_PORT));

        candidates
            .iter()
            .filter_map(|c| {
                let parsed = Address::parse_candidate(c, DEFAULT_PORT);
                if parsed.is_none() {
                    tracing::warn!("Ignoring invalid manual address: {:?}", c);
                }
                parsed
            })
            .chain(fallback)
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }
}

/// Per-`start` configuration delta. `None` keeps the current value.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub health_poll_interval: Option<Duration>,
    pub candidates: Option<Vec<String>>,
    pub disable_cache: Option<bool>,
}
