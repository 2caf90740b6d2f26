pub mod db;

use anyhow::Result;
use shared::types::{AddressHealthState, LegacyService, RobotRecord};
use self::db::CacheDb;

/// Robot list to seed the store with. Prefers the current format and falls
/// back to migrating the legacy flat service list.
pub fn load_robots(db: &CacheDb) -> Result<Vec<RobotRecord>> {
    if let Some(robots) = db.get_robots()? {
        if let Some(written) = db.last_updated()? {
            tracing::info!("Loaded {} cached robots written at {}", robots.len(), written);
        }
        return Ok(robots);
    }

    match db.get_legacy_services()? {
        Some(services) => {
            let robots = migrate_legacy(services);
            tracing::info!("Migrated {} robots from legacy service cache", robots.len());
            Ok(robots)
        }
        None => Ok(Vec::new()),
    }
}

/// Group legacy per-address entries into robot records by name, keeping the
/// order in which names first appear.
pub fn migrate_legacy(services: Vec<LegacyService>) -> Vec<RobotRecord> {
    let mut robots: Vec<RobotRecord> = Vec::new();

    for service in services {
        if service.name.trim().is_empty() {
            tracing::warn!("Skipping legacy cache entry without a name");
            continue;
        }

        let index = match robots.iter().position(|r| r.name == service.name) {
            Some(i) => i,
            None => {
                robots.push(RobotRecord::new(service.name.clone()));
                robots.len() - 1
            }
        };
        let robot = &mut robots[index];

        if robot.health.is_none() {
            robot.health = service.health;
        }
        if robot.server_health.is_none() {
            robot.server_health = service.server_health;
        }

        if let Some(ip) = service.ip {
            let duplicate = robots
                .iter()
                .any(|r| r.addresses.iter().any(|a| a.matches(&ip, service.port)));
            if !duplicate {
                robots[index]
                    .addresses
                    .push(AddressHealthState::unpolled(ip, service.port));
            }
        }
    }

    robots
}
