use std::collections::HashSet;
use shared::types::{Address, AddressHealthState, HealthStatus, RobotRecord};
use crate::poller::PollResult;

/// A `{name, ip, port}` tuple surfaced by the service browser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceFound {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub advertised_model: Option<String>,
}

/// Every write to the store is one of these.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Initialize {
        robots: Vec<RobotRecord>,
        manual_addresses: Vec<Address>,
    },
    ServiceFound(ServiceFound),
    HealthPolled(PollResult),
    RemoveRobot(String),
}

/// Canonical robot model. Robots and their addresses keep the order in which
/// they first appeared.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct State {
    robots: Vec<RobotRecord>,
    manual_addresses: Vec<Address>,
}

impl State {
    pub fn new(robots: Vec<RobotRecord>, manual_addresses: Vec<Address>) -> Self {
        let mut state = Self::default();
        state.initialize(robots, manual_addresses);
        state
    }

    /// Apply one command. Returns true if the state changed.
    pub fn apply(&mut self, command: Command) -> bool {
        let before = self.clone();
        match command {
            Command::Initialize { robots, manual_addresses } => {
                self.initialize(robots, manual_addresses)
            }
            Command::ServiceFound(found) => self.service_found(found),
            Command::HealthPolled(result) => self.health_polled(result),
            Command::RemoveRobot(name) => self.remove_robot(&name),
        }
        *self != before
    }

    /// Robot records in first-appearance order
    pub fn robots(&self) -> Vec<RobotRecord> {
        self.robots.clone()
    }

    /// Every candidate address: robot addresses first, then manual ones not
    /// already covered, without duplicates
    pub fn addresses(&self) -> Vec<Address> {
        let mut seen = HashSet::new();
        self.robots
            .iter()
            .flat_map(|r| r.addresses.iter().map(AddressHealthState::address))
            .chain(self.manual_addresses.iter().cloned())
            .filter(|a| seen.insert(a.clone()))
            .collect()
    }

    pub fn robot(&self, name: &str) -> Option<&RobotRecord> {
        self.robots.iter().find(|r| r.name == name)
    }

    fn initialize(&mut self, robots: Vec<RobotRecord>, manual_addresses: Vec<Address>) {
        self.robots.clear();
        self.manual_addresses.clear();

        for seed in robots {
            if seed.name.trim().is_empty() {
                tracing::warn!("Dropping seed robot with empty name");
                continue;
            }
            let index = self.ensure_robot(&seed.name);
            let robot = &mut self.robots[index];
            if robot.health.is_none() {
                robot.health = seed.health;
            }
            if robot.server_health.is_none() {
                robot.server_health = seed.server_health;
            }
            for address in seed.addresses {
                // First claim wins while seeding
                if self.owner_of(&address.ip, address.port).is_none() {
                    self.robots[index].addresses.push(address);
                }
            }
        }

        for address in manual_addresses {
            if !self.manual_addresses.contains(&address) {
                self.manual_addresses.push(address);
            }
        }
    }

    fn service_found(&mut self, found: ServiceFound) {
        if found.name.trim().is_empty() || found.ip.trim().is_empty() {
            tracing::warn!("Ignoring malformed service announcement: {:?}", found);
            return;
        }

        let moved = self.take_address_unless_owned_by(&found.name, &found.ip, found.port);
        let index = self.ensure_robot(&found.name);
        let robot = &mut self.robots[index];

        let slot = match moved {
            Some(moved) => {
                robot.addresses.push(moved);
                robot.addresses.len() - 1
            }
            None => match robot.addresses.iter().position(|a| a.matches(&found.ip, found.port)) {
                Some(i) => i,
                None => {
                    robot.addresses.push(AddressHealthState::unpolled(found.ip.clone(), found.port));
                    robot.addresses.len() - 1
                }
            },
        };

        if let Some(model) = found.advertised_model {
            robot.addresses[slot].advertised_model = Some(model);
        }
    }

    fn health_polled(&mut self, result: PollResult) {
        let owner = self.owner_of(&result.ip, result.port).map(|i| self.robots[i].name.clone());
        let target = match (result.reported_name(), owner) {
            (Some(reported), _) => reported.to_string(),
            (None, Some(owner)) => owner,
            (None, None) => {
                tracing::debug!("Poll result for unowned address {}:{} with no identity", result.ip, result.port);
                return;
            }
        };

        let moved = self.take_address_unless_owned_by(&target, &result.ip, result.port);
        let index = self.ensure_robot(&target);
        let robot = &mut self.robots[index];

        let slot = match moved {
            Some(entry) => {
                robot.addresses.push(entry);
                robot.addresses.len() - 1
            }
            None => match robot.addresses.iter().position(|a| a.matches(&result.ip, result.port)) {
                Some(i) => i,
                None => {
                    robot.addresses.push(AddressHealthState::unpolled(result.ip.clone(), result.port));
                    robot.addresses.len() - 1
                }
            },
        };

        let address = &mut robot.addresses[slot];
        address.seen = address.seen || result.ok();
        match &result.health {
            Ok(_) => {
                address.health_status = Some(HealthStatus::Ok);
                address.health_error = None;
            }
            Err(e) => {
                address.health_status = Some(e.health_status());
                address.health_error = Some(e.to_string());
            }
        }
        match &result.server_health {
            Ok(_) => {
                address.server_health_status = Some(HealthStatus::Ok);
                address.server_health_error = None;
            }
            Err(e) => {
                address.server_health_status = Some(e.health_status());
                address.server_health_error = Some(e.to_string());
            }
        }
        if let Some(model) = result.advertised_model() {
            address.advertised_model = Some(model.to_string());
        }

        // Keep the last known documents when a poll fails
        if let Ok(health) = result.health {
            robot.health = Some(health);
        }
        if let Ok(server_health) = result.server_health {
            robot.server_health = Some(server_health);
        }
    }

    fn remove_robot(&mut self, name: &str) {
        self.robots.retain(|r| r.name != name);
    }

    fn owner_of(&self, ip: &str, port: u16) -> Option<usize> {
        self.robots
            .iter()
            .position(|r| r.addresses.iter().any(|a| a.matches(ip, port)))
    }

    /// Detach `(ip, port)` from whichever robot holds it, unless that robot is
    /// `name`. The detached record keeps its health fields.
    fn take_address_unless_owned_by(&mut self, name: &str, ip: &str, port: u16) -> Option<AddressHealthState> {
        let index = self.owner_of(ip, port)?;
        let robot = &mut self.robots[index];
        if robot.name == name {
            return None;
        }
        let position = robot.addresses.iter().position(|a| a.matches(ip, port))?;
        tracing::debug!("Moving {}:{} from {} to {}", ip, port, robot.name, name);
        Some(robot.addresses.remove(position))
    }

    fn ensure_robot(&mut self, name: &str) -> usize {
        match self.robots.iter().position(|r| r.name == name) {
            Some(i) => i,
            None => {
                self.robots.push(RobotRecord::new(name));
                self.robots.len() - 1
            }
        }
    }
}
