//! Admission of containers and peer satellites.

use log::debug;

use crate::address::{Address, NodeKind};
use crate::comm::{Authenticator, CommManager, TopologyTrigger};
use crate::error::Result;
use crate::message::{MsgType, RouteInfo};

use super::registry::SatelliteRegistry;

/// Accepts a container connection only for a container this satellite
/// hosts.
pub struct ContainerGate<'a> {
    registry: &'a SatelliteRegistry,
}

impl<'a> ContainerGate<'a> {
    pub fn new(registry: &'a SatelliteRegistry) -> Self {
        Self { registry }
    }
}

impl Authenticator for ContainerGate<'_> {
    fn authenticate(&self, claimed_origin: &str) -> bool {
        match claimed_origin.parse::<Address>() {
            Ok(origin) => self.registry.contains_container(&origin),
            Err(_) => false,
        }
    }
}

/// Accepts any other satellite not already connected.
pub struct PeerGate<'a> {
    comm: &'a CommManager,
}

impl<'a> PeerGate<'a> {
    pub fn new(comm: &'a CommManager) -> Self {
        Self { comm }
    }
}

impl Authenticator for PeerGate<'_> {
    fn authenticate(&self, claimed_origin: &str) -> bool {
        match claimed_origin.parse::<Address>() {
            Ok(origin) => {
                origin.kind() == NodeKind::Satellite
                    && origin != *self.comm.address()
                    && !self.comm.is_connected(&origin)
            }
            Err(_) => false,
        }
    }
}

/// Marks a container's back-channel as up.
pub struct ContainerTrigger<'a> {
    registry: &'a mut SatelliteRegistry,
}

impl<'a> ContainerTrigger<'a> {
    pub fn new(registry: &'a mut SatelliteRegistry) -> Self {
        Self { registry }
    }
}

impl TopologyTrigger for ContainerTrigger<'_> {
    fn on_admitted(&mut self, origin: &Address, ip: &str) -> Result<()> {
        debug!("Container {} connected from {}", origin, ip);
        self.registry.set_container_connected(origin, true)
    }
}

/// Tells a newly meshed peer which containers are reachable through us.
pub struct SatelliteRoutingTrigger<'a> {
    comm: &'a CommManager,
    registry: &'a SatelliteRegistry,
}

impl<'a> SatelliteRoutingTrigger<'a> {
    pub fn new(comm: &'a CommManager, registry: &'a SatelliteRegistry) -> Self {
        Self { comm, registry }
    }
}

impl TopologyTrigger for SatelliteRoutingTrigger<'_> {
    fn on_admitted(&mut self, origin: &Address, _ip: &str) -> Result<()> {
        let routes = RouteInfo {
            routes: self.registry.container_ids(),
        };
        self.comm.send(MsgType::RouteInfo, origin, &routes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    use crate::comm::{ConnectionId, Link};
    use crate::message::{check, ContainerSpec, ContentCheck};

    fn addr(kind: NodeKind, uid: &str) -> Address {
        Address::new(kind, uid.parse().unwrap())
    }

    fn registry_with(comm_id: &Address) -> SatelliteRegistry {
        let mut reg = SatelliteRegistry::new();
        reg.add_container(ContainerSpec {
            comm_id: comm_id.clone(),
            owner: addr(NodeKind::Robot, "ROBOTA"),
            home: "/srv/robots/a".into(),
        })
        .unwrap();
        reg
    }

    #[test]
    fn container_gate_admits_known_containers_only() {
        let reg = registry_with(&addr(NodeKind::Container, "TESTID"));
        let gate = ContainerGate::new(&reg);
        assert!(gate.authenticate("COTESTID"));
        assert!(!gate.authenticate("BOGUS"));
        assert!(!gate.authenticate("COOTHER0"));
    }

    #[test]
    fn peer_gate_refuses_self_and_connected_peers() {
        let own = addr(NodeKind::Satellite, "SELF00");
        let peer = addr(NodeKind::Satellite, "PEER00");
        let mut comm = CommManager::new(own.clone());
        {
            let gate = PeerGate::new(&comm);
            assert!(gate.authenticate("SAPEER00"));
            assert!(!gate.authenticate("SASELF00"));
            assert!(!gate.authenticate("COPEER00"));
            assert!(!gate.authenticate("nonsense"));
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer, ConnectionId::next(), Link::Peer, tx, &[]).unwrap();
        assert!(!PeerGate::new(&comm).authenticate("SAPEER00"));
    }

    #[test]
    fn container_trigger_marks_connected() {
        let comm_id = addr(NodeKind::Container, "TESTID");
        let mut reg = registry_with(&comm_id);
        ContainerTrigger::new(&mut reg)
            .on_admitted(&comm_id, "172.17.0.2")
            .unwrap();
        let owner = addr(NodeKind::Robot, "ROBOTA");
        assert!(reg.get_owned_container(&owner, &comm_id).unwrap().connected);
    }

    #[test]
    fn routing_trigger_sends_local_containers() {
        let comm_id = addr(NodeKind::Container, "TESTID");
        let reg = registry_with(&comm_id);
        let peer = addr(NodeKind::Satellite, "PEER00");
        let mut comm = CommManager::new(addr(NodeKind::Satellite, "SELF00"));
        comm.register_content_serializer(MsgType::RouteInfo, check::<RouteInfo> as ContentCheck);
        let (tx, mut rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx, &[]).unwrap();

        SatelliteRoutingTrigger::new(&comm, &reg)
            .on_admitted(&peer, "10.0.0.2")
            .unwrap();
        let msg = rx.try_recv().unwrap();
        assert_eq!(msg.msg_type, MsgType::RouteInfo);
        let routes: RouteInfo = msg.content().unwrap();
        assert_eq!(routes.routes, vec![comm_id]);
    }
}
