//! Satellite node.
//!
//! A satellite hosts the containers of the robots registered with it. It
//! leases its address from the master, keeps a connection to the master,
//! meshes with every other satellite and accepts a back-channel from each
//! of its containers. Containers are reachable cluster wide through the
//! routes satellites advertise to each other.

mod admission;
mod registry;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::address::{Address, NodeKind, Uid};
use crate::comm::{
    connection, request, Admission, Authenticator, CommManager, ConnectionId, Connector, Direction,
    Event, Link, Processors, TcpConnector, TopologyTrigger,
};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::lease::uid::request_uid;
use crate::lease::{self, LeaseClient, LeaseWaiter, Resolution, MIN_PERIOD};
use crate::message::{
    content_checks, ConnectDirective, ContainerSpec, IdConfirm, IdDelete, IdResponse, Message,
    MsgType, RouteInfo, StopContainer,
};
use crate::runtime::ContainerRuntime;
use crate::store::SpecStore;

pub use admission::{ContainerGate, ContainerTrigger, PeerGate, SatelliteRoutingTrigger};
pub use registry::{ContainerRecord, RobotRecord, SatelliteRegistry};

const MASTER_MESSAGES: &[MsgType] = &[
    MsgType::Connect,
    MsgType::IdResponse,
    MsgType::StartContainer,
    MsgType::StopContainer,
];

const PEER_MESSAGES: &[MsgType] = &[MsgType::RouteInfo, MsgType::LoadInfo];

const CONTAINER_MESSAGES: &[MsgType] = &[MsgType::LoadInfo];

#[derive(Debug)]
pub enum Command {
    RegisterRobot {
        robot: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    UnregisterRobot {
        robot: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    RequestCommId {
        reply: LeaseWaiter,
    },
    AddContainer {
        spec: ContainerSpec,
        reply: oneshot::Sender<Result<()>>,
    },
    RemoveContainer {
        robot: Address,
        comm_id: Address,
        reply: oneshot::Sender<Result<()>>,
    },
    OwnedContainer {
        robot: Address,
        comm_id: Address,
        reply: oneshot::Sender<Result<ContainerRecord>>,
    },
    Shutdown,
}

pub struct SatelliteNode {
    comm: CommManager,
    registry: SatelliteRegistry,
    leases: LeaseClient,
    processors: Processors<SatelliteNode>,
    connector: Arc<dyn Connector>,
    runtime: Arc<dyn ContainerRuntime>,
    /// Port peers accept mesh connections on.
    peer_port: u16,
    load_interval: Duration,
}

impl SatelliteNode {
    pub fn new(
        address: Address,
        config: &Config,
        connector: Arc<dyn Connector>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let mut comm = CommManager::new(address);
        comm.register_content_serializers(content_checks());

        let mut processors = Processors::new();
        processors.register_message_processor(MsgType::Connect, process_connect);
        processors.register_message_processor(MsgType::IdResponse, process_id_response);
        processors.register_message_processor(MsgType::RouteInfo, process_route_info);
        processors.register_message_processor(MsgType::StartContainer, process_start_container);
        processors.register_message_processor(MsgType::StopContainer, process_stop_container);

        Self {
            comm,
            registry: SatelliteRegistry::new(),
            leases: LeaseClient::new(config.uid_timeout()),
            processors,
            connector,
            runtime,
            peer_port: config.port_satellite_satellite,
            load_interval: config.load_info_interval(),
        }
    }

    pub fn address(&self) -> &Address {
        self.comm.address()
    }

    pub fn registry(&self) -> &SatelliteRegistry {
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
            (Link::Master, Direction::Outbound) => self.admit_master(&claimed, conn, outbound),
            (Link::Peer, _) => self.admit_peer(&claimed, &ip, conn, outbound),
            (Link::Container, Direction::Inbound) => {
                self.admit_container(&claimed, &ip, conn, outbound)
            }
            _ => {
                warn!("Unexpected {:?} {:?} connection with {}", direction, link, ip);
                None
            }
        };
        let _ = reply.send(verdict);
    }

    fn admit_master(
        &mut self,
        claimed: &str,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Option<Address> {
        let master = Address::master();
        if claimed != master.to_string() {
            warn!("Refused {:?} posing as the master", claimed);
            return None;
        }
        if let Err(e) =
            self.comm
                .register_connection(master.clone(), conn, Link::Master, outbound, MASTER_MESSAGES)
        {
            error!("Refused master connection: {}", e);
            return None;
        }
        self.comm.set_default_route(Some(master.clone()));
        info!("{} connected to the master", self.comm.address());
        Some(master)
    }

    fn admit_peer(
        &mut self,
        claimed: &str,
        ip: &str,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Option<Address> {
        if !PeerGate::new(&self.comm).authenticate(claimed) {
            warn!("Refused peer {:?} from {}", claimed, ip);
            return None;
        }
        let origin = claimed.parse::<Address>().ok()?;
        if let Err(e) =
            self.comm
                .register_connection(origin.clone(), conn, Link::Peer, outbound, PEER_MESSAGES)
        {
            error!("Refused peer {}: {}", origin, e);
            return None;
        }
        if let Err(e) = SatelliteRoutingTrigger::new(&self.comm, &self.registry).on_admitted(&origin, ip) {
            error!("Route exchange with {} failed: {}", origin, e);
            self.comm.unregister_connection(&origin);
            return None;
        }
        Some(origin)
    }

    fn admit_container(
        &mut self,
        claimed: &str,
        ip: &str,
        conn: ConnectionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) -> Option<Address> {
        if !ContainerGate::new(&self.registry).authenticate(claimed) {
            warn!("Refused unknown container {:?} from {}", claimed, ip);
            return None;
        }
        let origin = claimed.parse::<Address>().ok()?;
        if let Err(e) = self.comm.register_connection(
            origin.clone(),
            conn,
            Link::Container,
            outbound,
            CONTAINER_MESSAGES,
        ) {
            error!("Refused container {}: {}", origin, e);
            return None;
        }
        if let Err(e) = ContainerTrigger::new(&mut self.registry).on_admitted(&origin, ip) {
            error!("Container {} could not be marked connected: {}", origin, e);
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
            None => debug!("Ignoring {} from {}", msg.msg_type, from),
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

    fn on_closed(&mut self, peer: &Address) {
        match self.comm.unregister_connection(peer) {
            Some(Link::Master) => {
                error!("Lost connection to the master");
                self.leases.fail_all();
            }
            Some(Link::Container) => {
                // The container may already be gone.
                let _ = self.registry.set_container_connected(peer, false);
            }
            Some(_) | None => {}
        }
    }

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::RegisterRobot { robot, reply } => {
                let _ = reply.send(self.register_robot(robot));
            }
            Command::UnregisterRobot { robot, reply } => {
                let _ = reply.send(self.registry.unregister_robot(&robot).map(|_| ()));
            }
            Command::RequestCommId { reply } => self.request_comm_id(reply),
            Command::AddContainer { spec, reply } => {
                let _ = reply.send(self.add_robot_container(spec));
            }
            Command::RemoveContainer {
                robot,
                comm_id,
                reply,
            } => {
                let _ = reply.send(self.remove_container(&robot, &comm_id).map(|_| ()));
            }
            Command::OwnedContainer {
                robot,
                comm_id,
                reply,
            } => {
                let _ = reply.send(self.registry.get_owned_container(&robot, &comm_id).cloned());
            }
            Command::Shutdown => {}
        }
    }

    pub fn register_robot(&mut self, robot: Address) -> Result<()> {
        if robot.kind() != NodeKind::Robot {
            return Err(Error::invalid(format!("{} is not a robot", robot)));
        }
        self.registry.register_robot(robot)
    }

    /// Asks the master for a fresh uid. `waiter` is answered once the
    /// matching `ID_RESPONSE` arrives.
    pub fn request_comm_id(&mut self, waiter: LeaseWaiter) {
        match self.comm.send(MsgType::IdRequest, &Address::master(), &()) {
            Ok(()) => self.leases.enqueue(waiter, lease::now()),
            Err(e) => {
                let _ = waiter.send(Err(e));
            }
        }
    }

    /// Adds a container for a robot registered here. Its address must have
    /// been leased from the master, the lease is confirmed on success.
    pub fn add_robot_container(&mut self, spec: ContainerSpec) -> Result<()> {
        if !self.registry.has_robot(&spec.owner) {
            return Err(Error::invalid(format!(
                "robot {} is not registered",
                spec.owner
            )));
        }
        self.add_container(spec, true)
    }

    fn add_container(&mut self, spec: ContainerSpec, confirm: bool) -> Result<()> {
        if spec.comm_id.kind() != NodeKind::Container {
            return Err(Error::invalid(format!(
                "{} is not a container address",
                spec.comm_id
            )));
        }
        self.registry.add_container(spec.clone())?;
        if confirm {
            let uid = spec.comm_id.uid().clone();
            if let Err(e) = self
                .comm
                .send(MsgType::IdConfirm, &Address::master(), &IdConfirm { uid })
            {
                let _ = self.registry.remove_container(&spec.comm_id);
                return Err(e);
            }
        }

        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            if let Err(e) = runtime.start(&spec).await {
                error!("Failed to start container {}: {}", spec.comm_id, e);
            }
        });
        self.advertise_routes();
        Ok(())
    }

    pub fn remove_container(&mut self, robot: &Address, comm_id: &Address) -> Result<ContainerRecord> {
        self.registry.get_owned_container(robot, comm_id)?;
        self.drop_container(comm_id)
    }

    /// Removes a container without an ownership check, hands its lease
    /// back and stops it.
    fn drop_container(&mut self, comm_id: &Address) -> Result<ContainerRecord> {
        let record = self.registry.remove_container(comm_id)?;
        self.comm.unregister_connection(comm_id);
        let uid = comm_id.uid().clone();
        if let Err(e) = self
            .comm
            .send(MsgType::IdDelete, &Address::master(), &IdDelete { uid })
        {
            warn!("Could not release lease of {}: {}", comm_id, e);
        }

        let runtime = Arc::clone(&self.runtime);
        let comm_id = comm_id.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.stop(&comm_id).await {
                error!("Failed to stop container {}: {}", comm_id, e);
            }
        });
        self.advertise_routes();
        Ok(record)
    }

    /// Sends the current container list to every peer.
    fn advertise_routes(&self) {
        let routes = RouteInfo {
            routes: self.registry.container_ids(),
        };
        for peer in self.comm.connected(Link::Peer) {
            if let Err(e) = self.comm.send(MsgType::RouteInfo, &peer, &routes) {
                warn!("Could not advertise routes to {}: {}", peer, e);
            }
        }
    }

    pub fn send_load_info(&self) {
        let master = Address::master();
        if !self.comm.is_connected(&master) {
            debug!("Not connected to the master, load report skipped");
            return;
        }
        if let Err(e) = self.comm.send(MsgType::LoadInfo, &master, &self.registry.load()) {
            warn!("Could not report load: {}", e);
        }
    }

    /// Fails uid requests the master did not answer in time.
    pub fn expire_requests(&mut self, now: Instant) -> usize {
        self.leases.expire(now)
    }

    /// Releases everything the node owns. Container stop failures are
    /// logged only.
    pub async fn shutdown(&mut self) {
        self.leases.fail_all();
        self.comm.close_all();

        let runtime = Arc::clone(&self.runtime);
        let stops = self.registry.container_ids().into_iter().map(|comm_id| {
            let runtime = Arc::clone(&runtime);
            async move {
                let result = runtime.stop(&comm_id).await;
                (comm_id, result)
            }
        });
        for (comm_id, result) in join_all(stops).await {
            if let Err(e) = result {
                warn!("Failed to stop container {}: {}", comm_id, e);
            }
        }
        self.registry.clear();
        info!("Satellite {} state released", self.comm.address());
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<Event>, mut commands: mpsc::Receiver<Command>) {
        let mut load = interval(self.load_interval.max(MIN_PERIOD));
        load.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut expiry = interval(self.leases.expiry_period());
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                Some(event) = events.recv() => self.handle_event(event),
                cmd = commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => break,
                    Some(cmd) => self.handle_command(cmd),
                },
                _ = load.tick() => self.send_load_info(),
                _ = expiry.tick() => {
                    self.expire_requests(lease::now());
                }
            }
        }
        self.shutdown().await;
    }
}

fn process_connect(node: &mut SatelliteNode, msg: Message) -> Result<()> {
    let directive: ConnectDirective = msg.content()?;
    for satellite in directive.satellites {
        if satellite.comm_id == *node.comm.address() || node.comm.is_connected(&satellite.comm_id) {
            continue;
        }
        debug!("Meshing with {} at {}", satellite.comm_id, satellite.ip);
        node.connector
            .connect(&satellite.ip, node.peer_port, Link::Peer, satellite.comm_id);
    }
    Ok(())
}

fn process_id_response(node: &mut SatelliteNode, msg: Message) -> Result<()> {
    let IdResponse { uid } = msg.content()?;
    match node.leases.resolve(uid)? {
        Resolution::Delivered => Ok(()),
        Resolution::Unclaimed(uid) => {
            info!("Handing back unclaimed uid {}", uid);
            node.comm
                .send(MsgType::IdDelete, &Address::master(), &IdDelete { uid })
        }
    }
}

fn process_route_info(node: &mut SatelliteNode, msg: Message) -> Result<()> {
    let RouteInfo { routes } = msg.content()?;
    // Containers hosted here are never reached through a peer.
    let routes: Vec<Address> = routes
        .into_iter()
        .filter(|dest| !node.registry.contains_container(dest))
        .collect();
    debug!("{} routes {} container(s)", msg.origin, routes.len());
    node.comm.set_routes(&msg.origin, routes);
    Ok(())
}

fn process_start_container(node: &mut SatelliteNode, msg: Message) -> Result<()> {
    let spec: ContainerSpec = msg.content()?;
    // Leased and confirmed by the master already.
    node.add_container(spec, false)
}

fn process_stop_container(node: &mut SatelliteNode, msg: Message) -> Result<()> {
    let StopContainer { comm_id } = msg.content()?;
    node.drop_container(&comm_id).map(|_| ())
}

/// Cloneable access to a running satellite loop.
#[derive(Clone)]
pub struct SatelliteHandle {
    address: Address,
    commands: mpsc::Sender<Command>,
    store: Arc<dyn SpecStore>,
}

impl SatelliteHandle {
    pub fn new(address: Address, commands: mpsc::Sender<Command>, store: Arc<dyn SpecStore>) -> Self {
        Self {
            address,
            commands,
            store,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub async fn register_robot(&self, robot: Address) -> Result<()> {
        request(&self.commands, |reply| Command::RegisterRobot { robot, reply }).await
    }

    pub async fn unregister_robot(&self, robot: Address) -> Result<()> {
        request(&self.commands, |reply| Command::UnregisterRobot { robot, reply }).await
    }

    pub async fn request_comm_id(&self) -> Result<Uid> {
        request(&self.commands, |reply| Command::RequestCommId { reply }).await
    }

    pub async fn add_container(&self, spec: ContainerSpec) -> Result<()> {
        request(&self.commands, |reply| Command::AddContainer { spec, reply }).await
    }

    pub async fn remove_container(&self, robot: Address, comm_id: Address) -> Result<()> {
        request(&self.commands, |reply| Command::RemoveContainer {
            robot,
            comm_id,
            reply,
        })
        .await
    }

    pub async fn owned_container(&self, robot: Address, comm_id: Address) -> Result<ContainerRecord> {
        request(&self.commands, |reply| Command::OwnedContainer {
            robot,
            comm_id,
            reply,
        })
        .await
    }

    /// Creates a container for `robot`: looks up its home folder, leases an
    /// address and adds the container under it.
    pub async fn create_container(&self, robot: Address) -> Result<Address> {
        let home = self.store.robot_home(&robot).await?;
        let uid = self.request_comm_id().await?;
        let comm_id = Address::new(NodeKind::Container, uid);
        self.add_container(ContainerSpec {
            comm_id: comm_id.clone(),
            owner: robot,
            home,
        })
        .await?;
        Ok(comm_id)
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.commands
            .send(Command::Shutdown)
            .await
            .map_err(|_| Error::ConnectionClosed)
    }
}

/// A running satellite: its listeners and its node loop.
pub struct SatelliteService {
    handle: SatelliteHandle,
    listeners: Vec<JoinHandle<()>>,
    node: JoinHandle<()>,
}

impl SatelliteService {
    /// Leases an address from the master, starts listening for peers and
    /// containers and dials the master.
    pub async fn start(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        store: Arc<dyn SpecStore>,
    ) -> Result<Self> {
        let uid = request_uid(&config.master_host, config.port_uid).await?;
        let address = Address::new(NodeKind::Satellite, uid);
        info!("Leased address {}", address);

        let peer_listener =
            TcpListener::bind(config.listen_addr(config.port_satellite_satellite)).await?;
        let container_listener =
            TcpListener::bind(config.listen_addr(config.port_satellite_container)).await?;

        let (events_tx, events_rx) = mpsc::channel(256);
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let connector = Arc::new(TcpConnector::new(address.clone(), events_tx.clone()));

        let mut listeners = Vec::new();
        for (listener, link) in [
            (peer_listener, Link::Peer),
            (container_listener, Link::Container),
        ] {
            let local = address.clone();
            let events = events_tx.clone();
            listeners.push(tokio::spawn(async move {
                if let Err(e) = connection::listen(listener, link, local, events).await {
                    error!("{:?} listener failed: {}", link, e);
                }
            }));
        }

        let node = SatelliteNode::new(address.clone(), config, connector.clone(), runtime);
        let node = tokio::spawn(node.run(events_rx, commands_rx));
        connector.connect(
            &config.master_host,
            config.port_master,
            Link::Master,
            Address::master(),
        );

        Ok(Self {
            handle: SatelliteHandle::new(address, commands_tx, store),
            listeners,
            node,
        })
    }

    pub fn handle(&self) -> SatelliteHandle {
        self.handle.clone()
    }

    /// Stops accepting connections, then lets the node loop release its
    /// state.
    pub async fn stop(self) {
        for listener in &self.listeners {
            listener.abort();
        }
        if let Err(e) = self.handle.shutdown().await {
            warn!("Satellite loop already gone: {}", e);
        }
        if let Err(e) = self.node.await {
            error!("Satellite loop failed: {}", e);
        }
    }
}
