//! Master node.
//!
//! The master owns the lease table and the satellite registry. It admits
//! satellites holding a confirmed lease, pushes the current satellite list
//! to every newcomer and reclaims stale leases on a fixed period.

mod admission;
mod registry;

use std::time::Instant;

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::address::{Address, NodeKind};
use crate::comm::{
    connection, request, Admission, Authenticator, CommManager, ConnectionId, Direction, Event,
    Link, Processors, TopologyTrigger,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::uid::{self, LeaseCommand};
use crate::lease::{self, LeaseTable};
use crate::message::{
    content_checks, ContainerSpec, IdConfirm, IdDelete, IdResponse, LoadInfo, Message, MsgType,
    RouteInfo, StopContainer,
};

pub use admission::{MasterGate, MasterTrigger};
pub use registry::{MasterRegistry, SatelliteRecord};

/// Message types a satellite may send to the master.
const SATELLITE_MESSAGES: &[MsgType] = &[
    MsgType::IdRequest,
    MsgType::IdConfirm,
    MsgType::IdDelete,
    MsgType::LoadInfo,
    MsgType::RouteInfo,
];

/// Operator requests handled by the master loop.
#[derive(Debug)]
pub enum Command {
    ListSatellites {
        reply: oneshot::Sender<Result<Vec<SatelliteRecord>>>,
    },
    AddContainer {
        owner: Address,
        home: String,
        satellite: Address,
        reply: oneshot::Sender<Result<Address>>,
    },
    RemoveContainer {
        comm_id: Address,
        satellite: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown,
}

pub struct MasterNode {
    comm: CommManager,
    registry: MasterRegistry,
    processors: Processors<MasterNode>,
}

impl MasterNode {
    pub fn new(leases: LeaseTable) -> Self {
        let mut comm = CommManager::new(Address::master());
        comm.register_content_serializers(content_checks());

        let mut processors = Processors::new();
        processors.register_message_processor(MsgType::IdRequest, process_id_request);
        processors.register_message_processor(MsgType::IdConfirm, process_id_confirm);
        processors.register_message_processor(MsgType::IdDelete, process_id_delete);
        processors.register_message_processor(MsgType::LoadInfo, process_load_info);
        processors.register_message_processor(MsgType::RouteInfo, process_route_info);

        Self {
            comm,
            registry: MasterRegistry::new(leases),
            processors,
        }
    }

    pub fn registry(&self) -> &MasterRegistry {
        &self.registry
    }

    pub fn handle_event(&mut self, event: Event) {
        match event {
            Event::Admit(admission) => self.admit(admission),
            Event::Inbound { from, conn, msg } => {
                if self.comm.is_current(&from, conn) {
                    self.handle_inbound(&from, msg);
                } else {
                    debug!("Ignored {} from replaced connection to {}", msg.msg_type, from);
                }
            }
            Event::Closed { peer, conn, .. } => {
                if self.comm.is_current(&peer, conn) {
                    self.on_closed(&peer);
                }
            }
        }
    }

    fn admit(&mut self, admission: Admission) {
        let Admission {
            conn,
            link,
            direction,
            claimed,
            ip,
            outbound,
            reply,
        } = admission;
        let verdict = match (link, direction) {
            (Link::Satellite, Direction::Inbound) => {
                self.admit_satellite(&claimed, &ip, conn, outbound)
            }
            _ => {
                warn!("Unexpected {:?} {:?} connection from {}", direction, link, ip);
                None
            }
        };
        let _ = reply.send(verdict);
    }

    fn admit_satellite(
        &mut self,
        claimed: &str,
        ip: &str,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Option<Address> {
        if !MasterGate::new(&self.registry).authenticate(claimed) {
            warn!("Refused satellite {:?} from {}: no confirmed lease", claimed, ip);
            return None;
        }
        let origin: Address = match claimed.parse() {
            Ok(origin) => origin,
            Err(e) => {
                warn!("Refused satellite {:?} from {}: {}", claimed, ip, e);
                return None;
            }
        };
        if origin.kind() != NodeKind::Satellite {
            warn!("Refused {} from {}: not a satellite address", origin, ip);
            return None;
        }
        if let Err(e) = self.comm.register_connection(
            origin.clone(),
            conn,
            Link::Satellite,
            outbound,
            SATELLITE_MESSAGES,
        ) {
            error!("Refused satellite {}: {}", origin, e);
            return None;
        }
        if let Err(e) = MasterTrigger::new(&self.comm, &mut self.registry).on_admitted(&origin, ip) {
            error!("Topology push to {} failed: {}", origin, e);
            self.comm.unregister_connection(&origin);
            return None;
        }
        Some(origin)
    }

    fn handle_inbound(&mut self, from: &Address, msg: Message) {
        if let Err(e) = self.comm.accept_inbound(from, &msg) {
            self.report(from, e);
            return;
        }
        if msg.dest != *self.comm.address() {
            if let Err(e) = self.comm.send_message(msg) {
                warn!("Dropped message from {}: {}", from, e);
            }
            return;
        }
        match self.processors.get(msg.msg_type) {
            Some(processor) => {
                if let Err(e) = processor(self, msg) {
                    self.report(from, e);
                }
            }
            None => warn!("No processor for {} from {}", msg.msg_type, from),
        }
    }

    fn report(&mut self, from: &Address, err: Error) {
        if err.is_fatal_to_connection() {
            error!("Tearing down connection to {}: {}", from, err);
            self.on_closed(from);
        } else {
            warn!("Rejected request from {}: {}", from, err);
        }
    }

    /// Forgets a satellite. Safe to run more than once for the same peer.
    fn on_closed(&mut self, peer: &Address) {
        self.comm.unregister_connection(peer);
        if self.registry.remove_satellite(peer).is_some() {
            info!("Satellite {} left", peer);
        }
        let leases = self.registry.leases_mut();
        leases.release(peer.uid());
        let released = leases.release_owned_by(peer);
        if !released.is_empty() {
            debug!("Released {} lease(s) held by {}", released.len(), peer);
        }
    }

    pub fn handle_lease(&mut self, cmd: LeaseCommand) {
        match cmd {
            LeaseCommand::Issue { reply } => {
                let uid = self.registry.leases_mut().issue(None, lease::now());
                let _ = reply.send(uid);
            }
            LeaseCommand::Confirm { uid, reply } => {
                let result = self.registry.leases_mut().confirm(&uid, None);
                if let Err(e) = &result {
                    warn!("Lease confirmation for {} rejected: {}", uid, e);
                }
                let _ = reply.send(result);
            }
        }
    }

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ListSatellites { reply } => {
                let _ = reply.send(Ok(self.registry.list_satellites()));
            }
            Command::AddContainer {
                owner,
                home,
                satellite,
                reply,
            } => {
                let _ = reply.send(self.add_container(owner, home, &satellite));
            }
            Command::RemoveContainer {
                comm_id,
                satellite,
                reply,
            } => {
                let _ = reply.send(self.remove_container(comm_id, &satellite));
            }
            Command::Shutdown => {}
        }
    }

    /// Leases an address for a new container on behalf of `satellite` and
    /// directs the satellite to start it.
    pub fn add_container(&mut self, owner: Address, home: String, satellite: &Address) -> Result<Address> {
        if !self.registry.contains(satellite) {
            return Err(Error::invalid(format!("unknown satellite {}", satellite)));
        }
        if owner.kind() != NodeKind::Robot {
            return Err(Error::invalid(format!("{} is not a robot", owner)));
        }
        let leases = self.registry.leases_mut();
        let uid = leases.issue(Some(satellite.clone()), lease::now());
        leases.confirm(&uid, Some(satellite))?;
        let comm_id = Address::new(NodeKind::Container, uid);
        let spec = ContainerSpec {
            comm_id: comm_id.clone(),
            owner,
            home,
        };
        if let Err(e) = self.comm.send(MsgType::StartContainer, satellite, &spec) {
            self.registry.leases_mut().release(comm_id.uid());
            return Err(e);
        }
        info!("Directed {} to start container {}", satellite, comm_id);
        Ok(comm_id)
    }

    pub fn remove_container(&mut self, comm_id: Address, satellite: &Address) -> Result<()> {
        if !self.registry.contains(satellite) {
            return Err(Error::invalid(format!("unknown satellite {}", satellite)));
        }
        self.comm
            .send(MsgType::StopContainer, satellite, &StopContainer { comm_id })
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        self.registry.leases_mut().sweep(now).len()
    }

    /// Closes every connection and drops the registry state.
    pub fn shutdown(&mut self) {
        self.comm.close_all();
        for record in self.registry.list_satellites() {
            self.registry.remove_satellite(&record.comm_id);
        }
        info!("Master state released");
    }

    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        mut commands: mpsc::Receiver<Command>,
        mut leases: mpsc::Receiver<LeaseCommand>,
    ) {
        let mut sweep = interval(self.registry.leases().sweep_period());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                Some(cmd) = leases.recv() => self.handle_lease(cmd),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                _ = sweep.tick() => {
                    self.sweep(lease::now());
                }
            }
        }
        self.shutdown();
    }
}

fn process_id_request(node: &mut MasterNode, msg: Message) -> Result<()> {
    let uid = node
        .registry
        .leases_mut()
        .issue(Some(msg.origin.clone()), lease::now());
    node.comm
        .send(MsgType::IdResponse, &msg.origin, &IdResponse { uid })
}

fn process_id_confirm(node: &mut MasterNode, msg: Message) -> Result<()> {
    let IdConfirm { uid } = msg.content()?;
    node.registry
        .leases_mut()
        .confirm(&uid, Some(&msg.origin))
}

fn process_id_delete(node: &mut MasterNode, msg: Message) -> Result<()> {
    let IdDelete { uid } = msg.content()?;
    let leases = node.registry.leases_mut();
    let owner = match leases.get(&uid) {
        Some(lease) => lease.owner.clone(),
        None => return Ok(()),
    };
    if owner.as_ref() != Some(&msg.origin) {
        return Err(Error::invalid(format!(
            "{} does not own lease {}",
            msg.origin, uid
        )));
    }
    leases.release(&uid);
    Ok(())
}

fn process_load_info(node: &mut MasterNode, msg: Message) -> Result<()> {
    let load: LoadInfo = msg.content()?;
    node.registry.update_load(&msg.origin, load)
}

fn process_route_info(_node: &mut MasterNode, msg: Message) -> Result<()> {
    let info: RouteInfo = msg.content()?;
    debug!(
        "{} routes {} container(s)",
        msg.origin,
        info.routes.len()
    );
    Ok(())
}

/// Cloneable access to a running master loop.
#[derive(Clone)]
pub struct MasterHandle {
    commands: mpsc::Sender<Command>,
}

impl MasterHandle {
    pub fn new(commands: mpsc::Sender<Command>) -> Self {
        Self { commands }
    }

    pub async fn list_satellites(&self) -> Result<Vec<SatelliteRecord>> {
        request(&self.commands, |reply| Command::ListSatellites { reply }).await
    }

    pub async fn add_container(
        &self,
        owner: Address,
        home: String,
        satellite: Address,
    ) -> Result<Address> {
        request(&self.commands, |reply| Command::AddContainer {
            owner,
            home,
            satellite,
            reply,
        })
        .await
    }

    pub async fn remove_container(&self, comm_id: Address, satellite: Address) -> Result<()> {
        request(&self.commands, |reply| Command::RemoveContainer {
            comm_id,
            satellite,
            reply,
        })
        .await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// A running master: its listeners and its node loop.
pub struct MasterService {
    handle: MasterHandle,
    listeners: Vec<JoinHandle<()>>,
    node: JoinHandle<()>,
}

impl MasterService {
    pub async fn start(config: &Config) -> Result<Self> {
        let uid_listener = TcpListener::bind(config.listen_addr(config.port_uid)).await?;
        let master_listener = TcpListener::bind(config.listen_addr(config.port_master)).await?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (leases_tx, leases_rx) = mpsc::channel(64);

        let listeners = vec![
            tokio::spawn(async move {
                if let Err(e) = uid::listen(uid_listener, leases_tx).await {
                    error!("Uid server failed: {}", e);
                }
            }),
            tokio::spawn(async move {
                if let Err(e) =
                    connection::listen(master_listener, Link::Satellite, Address::master(), events_tx).await
                {
                    error!("Satellite listener failed: {}", e);
                }
            }),
        ];

        let node = MasterNode::new(LeaseTable::new(
            config.uid_timeout(),
            config.cluster_secret.clone(),
        ));
        let node = tokio::spawn(node.run(events_rx, commands_rx, leases_rx));
        info!("Master {} up", Address::master());

        Ok(Self {
            handle: MasterHandle::new(commands_tx),
            listeners,
            node,
        })
    }

    pub fn handle(&self) -> MasterHandle {
        self.handle.clone()
    }

    /// Stops accepting connections, then lets the node loop release its
    /// state.
    pub async fn stop(self) {
        for listener in &self.listeners {
            listener.abort();
        }
        if let Err(e) = self.handle.shutdown().await {
            warn!("Master loop already gone: {}", e);
        }
        if let Err(e) = self.node.await {
            error!("Master loop failed: {}", e);
        }
    }
}
