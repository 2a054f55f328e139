use std::collections::HashMap;
use std::time::Instant;

use log::{debug, info};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::message::{ContainerSpec, LoadInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRecord {
    pub comm_id: Address,
    /// Robot owning the container. Fixed at creation.
    pub owner: Address,
    pub home: String,
    /// Whether the container's own connection to the satellite is up.
    pub connected: bool,
}

impl ContainerRecord {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            comm_id: spec.comm_id,
            owner: spec.owner,
            home: spec.home,
            connected: false,
        }
    }

    pub fn check_owner(&self, robot: &Address) -> Result<()> {
        if &self.owner != robot {
            return Err(Error::invalid(format!(
                "container {} is not owned by {}",
                self.comm_id, robot
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RobotRecord {
    pub robot_id: Address,
    pub registered_at: Instant,
}

/// Robots and containers hosted by one satellite.
#[derive(Debug, Default)]
pub struct SatelliteRegistry {
    robots: HashMap<Address, RobotRecord>,
    containers: HashMap<Address, ContainerRecord>,
}

impl SatelliteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_robot(&mut self, robot_id: Address) -> Result<()> {
        if self.robots.contains_key(&robot_id) {
            return Err(Error::invalid(format!(
                "robot {} is already registered",
                robot_id
            )));
        }
        info!("Robot {} registered", robot_id);
        self.robots.insert(
            robot_id.clone(),
            RobotRecord {
                robot_id,
                registered_at: Instant::now(),
            },
        );
        Ok(())
    }

    pub fn unregister_robot(&mut self, robot_id: &Address) -> Result<RobotRecord> {
        let record = self
            .robots
            .remove(robot_id)
            .ok_or_else(|| Error::invalid(format!("robot {} is not registered", robot_id)))?;
        info!(
            "Robot {} unregistered after {:?}",
            robot_id,
            record.registered_at.elapsed()
        );
        Ok(record)
    }

    pub fn has_robot(&self, robot_id: &Address) -> bool {
        self.robots.contains_key(robot_id)
    }

    /// Containers are keyed by their address.
    pub fn add_container(&mut self, spec: ContainerSpec) -> Result<()> {
        if self.containers.contains_key(&spec.comm_id) {
            return Err(Error::invalid(format!(
                "container {} already exists",
                spec.comm_id
            )));
        }
        debug!("Container {} added for {}", spec.comm_id, spec.owner);
        self.containers
            .insert(spec.comm_id.clone(), ContainerRecord::new(spec));
        Ok(())
    }

    pub fn remove_container(&mut self, comm_id: &Address) -> Result<ContainerRecord> {
        self.containers
            .remove(comm_id)
            .ok_or_else(|| Error::invalid(format!("unknown container {}", comm_id)))
    }

    pub fn contains_container(&self, comm_id: &Address) -> bool {
        self.containers.contains_key(comm_id)
    }

    pub fn get_owned_container(&self, robot_id: &Address, comm_id: &Address) -> Result<&ContainerRecord> {
        let record = self
            .containers
            .get(comm_id)
            .ok_or_else(|| Error::invalid(format!("unknown container {}", comm_id)))?;
        record.check_owner(robot_id)?;
        Ok(record)
    }

    /// Clearing the flag on an unknown container is a no-op, since
    /// disconnects may trail the removal. Setting it is not.
    pub fn set_container_connected(&mut self, comm_id: &Address, connected: bool) -> Result<()> {
        match self.containers.get_mut(comm_id) {
            Some(record) => {
                record.connected = connected;
                Ok(())
            }
            None if !connected => Ok(()),
            None => Err(Error::invalid(format!("unknown container {}", comm_id))),
        }
    }

    pub fn container_ids(&self) -> Vec<Address> {
        self.containers.keys().cloned().collect()
    }

    pub fn load(&self) -> LoadInfo {
        LoadInfo {
            containers: self.containers.len(),
            robots: self.robots.len(),
        }
    }

    pub fn clear(&mut self) {
        self.robots.clear();
        self.containers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeKind;

    fn robot(uid: &str) -> Address {
        Address::new(NodeKind::Robot, uid.parse().unwrap())
    }

    fn container(uid: &str) -> Address {
        Address::new(NodeKind::Container, uid.parse().unwrap())
    }

    fn spec(comm_id: &str, owner: &str) -> ContainerSpec {
        ContainerSpec {
            comm_id: container(comm_id),
            owner: robot(owner),
            home: "/srv/robots".into(),
        }
    }

    #[test]
    fn robots_register_once_and_unregister_once() {
        let mut reg = SatelliteRegistry::new();
        reg.register_robot(robot("ROBOTA")).unwrap();
        assert!(matches!(
            reg.register_robot(robot("ROBOTA")),
            Err(Error::InvalidRequest(_))
        ));
        let record = reg.unregister_robot(&robot("ROBOTA")).unwrap();
        assert_eq!(record.robot_id, robot("ROBOTA"));
        assert!(record.registered_at.elapsed() < std::time::Duration::from_secs(60));
        assert!(matches!(
            reg.unregister_robot(&robot("ROBOTA")),
            Err(Error::InvalidRequest(_))
        ));
        assert!(matches!(
            reg.unregister_robot(&robot("NEVER0")),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn containers_are_only_visible_to_their_owner() {
        let mut reg = SatelliteRegistry::new();
        reg.add_container(spec("CONTB0", "ROBOTB")).unwrap();

        assert!(matches!(
            reg.get_owned_container(&robot("ROBOTA"), &container("CONTB0")),
            Err(Error::InvalidRequest(_))
        ));
        let record = reg
            .get_owned_container(&robot("ROBOTB"), &container("CONTB0"))
            .unwrap();
        assert_eq!(record.owner, robot("ROBOTB"));
        assert!(matches!(
            reg.get_owned_container(&robot("ROBOTB"), &container("NOPE00")),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn duplicate_container_is_rejected() {
        let mut reg = SatelliteRegistry::new();
        reg.add_container(spec("CONT00", "ROBOTA")).unwrap();
        assert!(matches!(
            reg.add_container(spec("CONT00", "ROBOTB")),
            Err(Error::InvalidRequest(_))
        ));
        assert_eq!(reg.container_ids(), vec![container("CONT00")]);
    }

    #[test]
    fn connected_flag_is_asymmetric_on_unknown_ids() {
        let mut reg = SatelliteRegistry::new();
        reg.set_container_connected(&container("GHOST0"), false).unwrap();
        assert!(matches!(
            reg.set_container_connected(&container("GHOST0"), true),
            Err(Error::InvalidRequest(_))
        ));

        reg.add_container(spec("CONT00", "ROBOTA")).unwrap();
        reg.set_container_connected(&container("CONT00"), true).unwrap();
        assert!(
            reg.get_owned_container(&robot("ROBOTA"), &container("CONT00"))
                .unwrap()
                .connected
        );
    }

    #[test]
    fn load_and_clear() {
        let mut reg = SatelliteRegistry::new();
        reg.register_robot(robot("ROBOTA")).unwrap();
        reg.add_container(spec("CONT00", "ROBOTA")).unwrap();
        reg.add_container(spec("CONT01", "ROBOTA")).unwrap();
        assert_eq!(
            reg.load(),
            LoadInfo {
                containers: 2,
                robots: 1
            }
        );

        reg.clear();
        assert_eq!(reg.load(), LoadInfo::default());
        assert!(reg.remove_container(&container("CONT00")).is_err());
    }
}
