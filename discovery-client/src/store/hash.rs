use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{HealthStatus, RobotRecord};

/// Only reachability-relevant fields; version strings inside the health
/// documents are left out so a robot update alone does not count.
#[derive(Serialize)]
struct AddressView<'a> {
    ip: &'a str,
    port: u16,
    seen: bool,
    health_status: Option<HealthStatus>,
    server_health_status: Option<HealthStatus>,
    advertised_model: Option<&'a str>,
}

#[derive(Serialize)]
struct RobotView<'a> {
    name: &'a str,
    addresses: Vec<AddressView<'a>>,
}

/// SHA-256 digest of the robot list, independent of robot order.
pub fn compute_hash(robots: &[RobotRecord]) -> String {
    let mut indices: Vec<usize> = (0..robots.len()).collect();
    indices.sort_by(|&a, &b| robots[a].name.cmp(&robots[b].name));

    let views: Vec<RobotView<'_>> = indices
        .iter()
        .map(|&i| {
            let r = &robots[i];
            RobotView {
                name: &r.name,
                addresses: r
                    .addresses
                    .iter()
                    .map(|a| AddressView {
                        ip: &a.ip,
                        port: a.port,
                        seen: a.seen,
                        health_status: a.health_status,
                        server_health_status: a.server_health_status,
                        advertised_model: a.advertised_model.as_deref(),
                    })
                    .collect(),
            }
        })
        .collect();

    // Only strings, integers and bools: serialization cannot fail
    let json = serde_json::to_string(&views).unwrap_or_default();

    let hash = Sha256::digest(json.as_bytes());
    hex::encode(hash)
}
