use log::info;

use crate::address::{Address, Uid};
use crate::error::{Error, Result};
use crate::lease::LeaseTable;
use crate::message::{LoadInfo, SatelliteInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SatelliteRecord {
    pub comm_id: Address,
    pub ip: String,
    pub connected: bool,
    /// Last load advertised by the satellite.
    pub load: Option<LoadInfo>,
}

impl SatelliteRecord {
    pub fn info(&self) -> SatelliteInfo {
        SatelliteInfo {
            comm_id: self.comm_id.clone(),
            ip: self.ip.clone(),
        }
    }
}

/// Satellites known to the master, together with the lease table their
/// addresses come from.
pub struct MasterRegistry {
    satellites: Vec<SatelliteRecord>,
    leases: LeaseTable,
}

impl MasterRegistry {
    pub fn new(leases: LeaseTable) -> Self {
        Self {
            satellites: Vec::new(),
            leases,
        }
    }

    /// Ids are unique by lease, so a duplicate is an invariant violation.
    pub fn add_satellite(&mut self, comm_id: Address, ip: &str) -> Result<()> {
        if self.contains(&comm_id) {
            return Err(Error::internal(format!(
                "satellite {} is already registered",
                comm_id
            )));
        }
        info!("Satellite {} joined from {}", comm_id, ip);
        self.satellites.push(SatelliteRecord {
            comm_id,
            ip: ip.to_string(),
            connected: true,
            load: None,
        });
        Ok(())
    }

    /// Removing an unknown satellite is a no-op.
    pub fn remove_satellite(&mut self, comm_id: &Address) -> Option<SatelliteRecord> {
        let pos = self.satellites.iter().position(|s| &s.comm_id == comm_id)?;
        Some(self.satellites.remove(pos))
    }

    /// Point-in-time copy of every satellite.
    pub fn list_satellites(&self) -> Vec<SatelliteRecord> {
        self.satellites.clone()
    }

    pub fn contains(&self, comm_id: &Address) -> bool {
        self.satellites.iter().any(|s| &s.comm_id == comm_id)
    }

    pub fn update_load(&mut self, comm_id: &Address, load: LoadInfo) -> Result<()> {
        let record = self
            .satellites
            .iter_mut()
            .find(|s| &s.comm_id == comm_id)
            .ok_or_else(|| Error::invalid(format!("unknown satellite {}", comm_id)))?;
        record.load = Some(load);
        Ok(())
    }

    /// Whether `uid` is currently leased and confirmed.
    pub fn has_lease(&self, uid: &Uid) -> bool {
        self.leases.is_confirmed(uid)
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    pub fn leases_mut(&mut self) -> &mut LeaseTable {
        &mut self.leases
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use crate::address::NodeKind;

    fn registry() -> MasterRegistry {
        MasterRegistry::new(LeaseTable::new(Duration::from_secs(30), "secret"))
    }

    fn satellite(uid: &str) -> Address {
        Address::new(NodeKind::Satellite, uid.parse().unwrap())
    }

    #[test]
    fn added_satellite_is_listed_once() {
        let mut reg = registry();
        reg.add_satellite(satellite("AAAAAA"), "10.0.0.1").unwrap();
        let listed = reg.list_satellites();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].comm_id, satellite("AAAAAA"));
        assert!(listed[0].connected);
    }

    #[test]
    fn duplicate_add_is_internal_error() {
        let mut reg = registry();
        reg.add_satellite(satellite("AAAAAA"), "10.0.0.1").unwrap();
        let err = reg.add_satellite(satellite("AAAAAA"), "10.0.0.2").unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert_eq!(reg.list_satellites().len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let mut reg = registry();
        assert!(reg.remove_satellite(&satellite("AAAAAA")).is_none());
        reg.add_satellite(satellite("AAAAAA"), "10.0.0.1").unwrap();
        assert!(reg.remove_satellite(&satellite("AAAAAA")).is_some());
        assert!(reg.remove_satellite(&satellite("AAAAAA")).is_none());
        assert!(reg.list_satellites().is_empty());
    }

    #[test]
    fn snapshot_does_not_follow_later_changes() {
        let mut reg = registry();
        reg.add_satellite(satellite("AAAAAA"), "10.0.0.1").unwrap();
        let snapshot = reg.list_satellites();
        reg.add_satellite(satellite("BBBBBB"), "10.0.0.2").unwrap();
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn load_updates_need_a_known_satellite() {
        let mut reg = registry();
        let load = LoadInfo {
            containers: 2,
            robots: 1,
        };
        assert!(matches!(
            reg.update_load(&satellite("AAAAAA"), load),
            Err(Error::InvalidRequest(_))
        ));
        reg.add_satellite(satellite("AAAAAA"), "10.0.0.1").unwrap();
        reg.update_load(&satellite("AAAAAA"), load).unwrap();
        assert_eq!(reg.list_satellites()[0].load, Some(load));
    }

    #[test]
    fn has_lease_requires_confirmation() {
        let mut reg = registry();
        let uid = reg.leases_mut().issue(None, Instant::now());
        assert!(!reg.has_lease(&uid));
        reg.leases_mut().confirm(&uid, None).unwrap();
        assert!(reg.has_lease(&uid));
    }
}
