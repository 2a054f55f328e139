//! Admission of satellites into the master.

use crate::address::{self, Address};
use crate::comm::{Authenticator, CommManager, TopologyTrigger};
use crate::error::{Error, Result};
use crate::message::{ConnectDirective, MsgType};

use super::registry::MasterRegistry;

/// Accepts a satellite only if the uid part of its claimed origin is a
/// confirmed lease.
pub struct MasterGate<'a> {
    registry: &'a MasterRegistry,
}

impl<'a> MasterGate<'a> {
    pub fn new(registry: &'a MasterRegistry) -> Self {
        Self { registry }
    }
}

impl Authenticator for MasterGate<'_> {
    fn authenticate(&self, claimed_origin: &str) -> bool {
        match address::strip_prefix(claimed_origin) {
            Ok(uid) => self.registry.has_lease(&uid),
            Err(_) => false,
        }
    }
}

/// Tells a newly admitted satellite about every satellite already known,
/// then registers it.
pub struct MasterTrigger<'a> {
    comm: &'a CommManager,
    registry: &'a mut MasterRegistry,
}

impl<'a> MasterTrigger<'a> {
    pub fn new(comm: &'a CommManager, registry: &'a mut MasterRegistry) -> Self {
        Self { comm, registry }
    }
}

impl TopologyTrigger for MasterTrigger<'_> {
    fn on_admitted(&mut self, origin: &Address, ip: &str) -> Result<()> {
        // Checked up front so a duplicate never receives a directive.
        if self.registry.contains(origin) {
            return Err(Error::internal(format!(
                "satellite {} is already registered",
                origin
            )));
        }
        // Taken before insertion: the newcomer never sees itself.
        let directive = ConnectDirective {
            satellites: self
                .registry
                .list_satellites()
                .iter()
                .map(|s| s.info())
                .collect(),
        };
        self.comm.send(MsgType::Connect, origin, &directive)?;
        self.registry.add_satellite(origin.clone(), ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use tokio::sync::mpsc;

    use crate::address::NodeKind;
    use crate::comm::{ConnectionId, Link};
    use crate::lease::LeaseTable;
    use crate::message::{check, ContentCheck};

    fn registry() -> MasterRegistry {
        MasterRegistry::new(LeaseTable::new(Duration::from_secs(30), "secret"))
    }

    #[test]
    fn gate_accepts_only_confirmed_leases() {
        let mut reg = registry();
        let confirmed = reg.leases_mut().issue(None, Instant::now());
        reg.leases_mut().confirm(&confirmed, None).unwrap();
        let pending = reg.leases_mut().issue(None, Instant::now());

        let gate = MasterGate::new(&reg);
        assert!(gate.authenticate(&format!("SA{}", confirmed)));
        assert!(!gate.authenticate(&format!("SA{}", pending)));
        assert!(!gate.authenticate("SAZZZZZZ"));
        assert!(!gate.authenticate("BOGUS"));
    }

    #[test]
    fn trigger_rejects_duplicate_before_sending() {
        let mut reg = registry();
        let mut comm = CommManager::new(Address::master());
        comm.register_content_serializer(MsgType::Connect, check::<ConnectDirective> as ContentCheck);
        let origin = Address::new(NodeKind::Satellite, "AAAAAA".parse().unwrap());
        let (tx, mut rx) = mpsc::unbounded_channel();
        comm.register_connection(origin.clone(), ConnectionId::next(), Link::Satellite, tx, &[])
            .unwrap();
        reg.add_satellite(origin.clone(), "10.0.0.1").unwrap();

        let err = MasterTrigger::new(&comm, &mut reg)
            .on_admitted(&origin, "10.0.0.1")
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
        assert!(rx.try_recv().is_err());
    }
}
