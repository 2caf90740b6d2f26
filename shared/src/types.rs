use std::collections::BTreeMap;
use std::fmt;
use serde::{Serialize, Deserialize};

/// A candidate `(ip, port)` pair worth health-polling.
/// `ip` may also hold a hostname when it came from manual configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub ip: String,
    pub port: u16,
}

impl Address {
    pub fn new(ip: impl Into<String>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }

    /// Parse an operator-entered candidate: `host`, `host:port`,
    /// `[v6]:port` or a bare IPv6 address.
    pub fn parse_candidate(input: &str, default_port: u16) -> Option<Self> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }

        if let Some(rest) = input.strip_prefix('[') {
            let (host, tail) = rest.split_once(']')?;
            if host.is_empty() {
                return None;
            }
            let port = match tail.strip_prefix(':') {
                Some(port) => port.parse().ok()?,
                None if tail.is_empty() => default_port,
                None => return None,
            };
            return Some(Self::new(host, port));
        }

        match input.matches(':').count() {
            0 => Some(Self::new(input, default_port)),
            1 => {
                let (host, port) = input.split_once(':')?;
                if host.is_empty() {
                    return None;
                }
                Some(Self::new(host, port.parse().ok()?))
            }
            _ => Some(Self::new(input, default_port)),
        }
    }

    /// Base URL for HTTP requests, bracketing IPv6 literals
    pub fn base_url(&self) -> String {
        if self.ip.contains(':') {
            format!("http://[{}]:{}", self.ip, self.port)
        } else {
            format!("http://{}:{}", self.ip, self.port)
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ip.contains(':') {
            write!(f, "[{}]:{}", self.ip, self.port)
        } else {
            write!(f, "{}:{}", self.ip, self.port)
        }
    }
}

/// Outcome of the latest probe of one health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Ok,
    NotOk,
    Unreachable,
}

/// Payload of `GET /health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthDocument {
    pub name: String,
    pub api_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fw_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub robot_serial: Option<String>,
}

/// Payload of `GET /server/update/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerHealthDocument {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_server_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub capabilities: BTreeMap<String, String>,
}

/// Per-address reachability record, owned by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressHealthState {
    pub ip: String,
    pub port: u16,

    /// Set once any poll of this address succeeded; never cleared afterwards
    #[serde(default)]
    pub seen: bool,

    #[serde(default)]
    pub health_status: Option<HealthStatus>,
    #[serde(default)]
    pub server_health_status: Option<HealthStatus>,
    #[serde(default)]
    pub health_error: Option<String>,
    #[serde(default)]
    pub server_health_error: Option<String>,
    #[serde(default)]
    pub advertised_model: Option<String>,
}

impl AddressHealthState {
    /// A never-polled address
    pub fn unpolled(ip: impl Into<String>, port: u16) -> Self {
        Self {
            ip: ip.into(),
            port,
            seen: false,
            health_status: None,
            server_health_status: None,
            health_error: None,
            server_health_error: None,
            advertised_model: None,
        }
    }

    pub fn address(&self) -> Address {
        Address::new(self.ip.clone(), self.port)
    }

    pub fn matches(&self, ip: &str, port: u16) -> bool {
        self.ip == ip && self.port == port
    }
}

/// A logical robot, unique by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RobotRecord {
    pub name: String,
    #[serde(default)]
    pub health: Option<HealthDocument>,
    #[serde(default)]
    pub server_health: Option<ServerHealthDocument>,
    #[serde(default)]
    pub addresses: Vec<AddressHealthState>,
}

impl RobotRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            health: None,
            server_health: None,
            addresses: Vec::new(),
        }
    }

    /// True if any address currently answers `/health`
    pub fn is_connectable(&self) -> bool {
        self.addresses
            .iter()
            .any(|a| a.health_status == Some(HealthStatus::Ok))
    }
}

/// Flat per-address entry of the pre-robot-record cache format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyService {
    pub name: String,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default = "default_legacy_port")]
    pub port: u16,
    #[serde(default)]
    pub health: Option<HealthDocument>,
    #[serde(default, rename = "serverHealth")]
    pub server_health: Option<ServerHealthDocument>,
}

fn default_legacy_port() -> u16 {
    crate::protocol::DEFAULT_PORT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_candidate_forms() {
        assert_eq!(
            Address::parse_candidate("10.0.0.5", 31950),
            Some(Address::new("10.0.0.5", 31950))
        );
        assert_eq!(
            Address::parse_candidate(" robot.local:8080 ", 31950),
            Some(Address::new("robot.local", 8080))
        );
        assert_eq!(
            Address::parse_candidate("[fd00:0:cafe:fefe::1]:31950", 1),
            Some(Address::new("fd00:0:cafe:fefe::1", 31950))
        );
        assert_eq!(
            Address::parse_candidate("fd00:0:cafe:fefe::1", 31950),
            Some(Address::new("fd00:0:cafe:fefe::1", 31950))
        );
    }

    #[test]
    fn test_parse_candidate_rejects_garbage() {
        assert_eq!(Address::parse_candidate("", 31950), None);
        assert_eq!(Address::parse_candidate("host:notaport", 31950), None);
        assert_eq!(Address::parse_candidate(":31950", 31950), None);
        assert_eq!(Address::parse_candidate("[::1]x", 31950), None);
    }

    #[test]
    fn test_base_url_brackets_ipv6() {
        assert_eq!(Address::new("10.0.0.5", 31950).base_url(), "http://10.0.0.5:31950");
        assert_eq!(Address::new("fd00::1", 31950).base_url(), "http://[fd00::1]:31950");
    }

    #[test]
    fn test_health_status_wire_names() {
        assert_eq!(serde_json::to_string(&HealthStatus::NotOk).unwrap(), "\"notOk\"");
    }
}
