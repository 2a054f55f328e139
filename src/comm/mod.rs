//! Communication layer shared by every node.
//!
//! Connection tasks (see [`connection`]) own the sockets and only report to
//! the node loop through [`Event`]s. The node loop owns a [`CommManager`]
//! holding the outbound side of every admitted connection, the content
//! checks registered per message type and the routing table.

pub mod connection;
mod dispatch;
pub mod frame;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};

use crate::address::Address;
use crate::error::{Error, Result};
use crate::message::{ContentCheck, Message, MsgType};

pub use connection::TcpConnector;
pub use dispatch::{Processor, Processors};

/// What sits on the other end of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Link {
    /// A satellite connected to the master.
    Satellite,
    /// The master, seen from a satellite.
    Master,
    /// Another satellite in the mesh.
    Peer,
    /// A container hosted by this satellite.
    Container,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The remote end dialed us; it has to pass the admission gate.
    Inbound,
    /// We dialed the remote end and verified who answered.
    Outbound,
}

/// Tells apart successive connections to the same peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A connection waiting for the node loop to admit it.
#[derive(Debug)]
pub struct Admission {
    pub conn: ConnectionId,
    pub link: Link,
    pub direction: Direction,
    /// Origin as claimed by the remote end, not yet validated.
    pub claimed: String,
    pub ip: String,
    pub outbound: mpsc::UnboundedSender<Message>,
    /// Answered with the admitted address, or `None` to refuse.
    pub reply: oneshot::Sender<Option<Address>>,
}

#[derive(Debug)]
pub enum Event {
    Admit(Admission),
    Inbound {
        from: Address,
        conn: ConnectionId,
        msg: Message,
    },
    Closed {
        peer: Address,
        link: Link,
        conn: ConnectionId,
    },
}

/// Admission check run before a connection is accepted. Implementations
/// must not mutate any registry.
pub trait Authenticator {
    fn authenticate(&self, claimed_origin: &str) -> bool;
}

/// One-shot step run right after a connection has been admitted.
pub trait TopologyTrigger {
    fn on_admitted(&mut self, origin: &Address, ip: &str) -> Result<()>;
}

/// Outbound connection establishment.
pub trait Connector: Send + Sync {
    /// Dials `ip:port`. The connection shows up later as an outbound
    /// [`Admission`] if the answering node is `expected`.
    fn connect(&self, ip: &str, port: u16, link: Link, expected: Address);
}

struct ConnectionHandle {
    conn: ConnectionId,
    link: Link,
    outbound: mpsc::UnboundedSender<Message>,
    approved: HashSet<MsgType>,
}

pub struct CommManager {
    address: Address,
    serializers: HashMap<MsgType, ContentCheck>,
    connections: HashMap<Address, ConnectionHandle>,
    /// Destination -> next hop.
    routes: HashMap<Address, Address>,
    default_route: Option<Address>,
}

impl CommManager {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            serializers: HashMap::new(),
            connections: HashMap::new(),
            routes: HashMap::new(),
            default_route: None,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn register_content_serializer(&mut self, msg_type: MsgType, check: ContentCheck) {
        self.serializers.insert(msg_type, check);
    }

    pub fn register_content_serializers(
        &mut self,
        serializers: impl IntoIterator<Item = (MsgType, ContentCheck)>,
    ) {
        self.serializers.extend(serializers);
    }

    fn check_content(&self, msg: &Message) -> Result<()> {
        let check = self
            .serializers
            .get(&msg.msg_type)
            .ok_or(Error::MissingSerializer(msg.msg_type))?;
        check(&msg.content)
    }

    /// Adds an admitted connection. Only `approved` message types are
    /// accepted from it.
    pub fn register_connection(
        &mut self,
        peer: Address,
        conn: ConnectionId,
        link: Link,
        outbound: mpsc::UnboundedSender<Message>,
        approved: &[MsgType],
    ) -> Result<()> {
        if self.connections.contains_key(&peer) {
            return Err(Error::internal(format!("{} is already connected", peer)));
        }
        info!("Registered {:?} connection to {}", link, peer);
        self.connections.insert(
            peer,
            ConnectionHandle {
                conn,
                link,
                outbound,
                approved: approved.iter().copied().collect(),
            },
        );
        Ok(())
    }

    /// Drops a connection and every route through it. Dropping the outbound
    /// channel lets the writer flush and close the socket.
    pub fn unregister_connection(&mut self, peer: &Address) -> Option<Link> {
        let handle = self.connections.remove(peer)?;
        self.routes.retain(|_, via| via != peer);
        if self.default_route.as_ref() == Some(peer) {
            self.default_route = None;
        }
        info!("Unregistered {:?} connection to {}", handle.link, peer);
        Some(handle.link)
    }

    pub fn is_connected(&self, peer: &Address) -> bool {
        self.connections.contains_key(peer)
    }

    /// Whether `conn` is the connection currently registered for `peer`.
    /// Events from a connection that was already replaced are stale.
    pub fn is_current(&self, peer: &Address, conn: ConnectionId) -> bool {
        self.connections.get(peer).is_some_and(|h| h.conn == conn)
    }

    #[cfg(test)]
    pub(crate) fn connection_id(&self, peer: &Address) -> Option<ConnectionId> {
        self.connections.get(peer).map(|h| h.conn)
    }

    /// Addresses of every connection of the given kind.
    pub fn connected(&self, link: Link) -> Vec<Address> {
        self.connections
            .iter()
            .filter(|(_, h)| h.link == link)
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    pub fn set_default_route(&mut self, via: Option<Address>) {
        self.default_route = via;
    }

    /// Replaces every route through `via` with `dests`.
    pub fn set_routes(&mut self, via: &Address, dests: Vec<Address>) {
        self.routes.retain(|_, hop| hop != via);
        for dest in dests {
            if dest != self.address && !self.connections.contains_key(&dest) {
                self.routes.insert(dest, via.clone());
            }
        }
    }

    pub fn route(&self, dest: &Address) -> Option<&Address> {
        if let Some((direct, _)) = self.connections.get_key_value(dest) {
            return Some(direct);
        }
        self.routes.get(dest).or(self.default_route.as_ref())
    }

    pub fn send_message(&self, msg: Message) -> Result<()> {
        self.check_content(&msg)?;
        let hop = self
            .route(&msg.dest)
            .ok_or_else(|| Error::NoRoute(msg.dest.clone()))?;
        let handle = self
            .connections
            .get(hop)
            .ok_or_else(|| Error::NoRoute(msg.dest.clone()))?;
        debug!("Sending {} to {} via {}", msg.msg_type, msg.dest, hop);
        handle.outbound.send(msg).map_err(|_| Error::ConnectionClosed)
    }

    /// Convenience for messages originating at this node.
    pub fn send<T: serde::Serialize>(
        &self,
        msg_type: MsgType,
        dest: &Address,
        content: &T,
    ) -> Result<()> {
        let msg = Message::new(msg_type, self.address.clone(), dest.clone()).with_content(content)?;
        self.send_message(msg)
    }

    /// Validates a message received from `from` before it is dispatched.
    /// A message for this node has to originate at the peer that sent it.
    pub fn accept_inbound(&self, from: &Address, msg: &Message) -> Result<()> {
        let handle = self
            .connections
            .get(from)
            .ok_or_else(|| Error::internal(format!("message from unregistered {}", from)))?;
        if !handle.approved.contains(&msg.msg_type) {
            return Err(Error::invalid(format!(
                "{} is not accepted from {}",
                msg.msg_type, from
            )));
        }
        if msg.dest == self.address && msg.origin != *from {
            return Err(Error::invalid(format!(
                "{} from {} claims to originate at {}",
                msg.msg_type, from, msg.origin
            )));
        }
        self.check_content(msg)
    }

    /// Drops every connection.
    pub fn close_all(&mut self) {
        let count = self.connections.len();
        self.connections.clear();
        self.routes.clear();
        self.default_route = None;
        info!("Closed {} connection(s)", count);
    }
}

/// Sends a command built around a fresh reply channel to a node loop and
/// waits for the answer.
pub async fn request<C, T>(
    commands: &mpsc::Sender<C>,
    make: impl FnOnce(oneshot::Sender<Result<T>>) -> C,
) -> Result<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(make(reply))
        .await
        .map_err(|_| Error::ConnectionClosed)?;
    response.await.map_err(|_| Error::ConnectionClosed)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeKind;
    use crate::message::{check, IdResponse, RouteInfo};

    fn addr(kind: NodeKind, uid: &str) -> Address {
        Address::new(kind, uid.parse().unwrap())
    }

    fn manager() -> CommManager {
        let mut comm = CommManager::new(addr(NodeKind::Satellite, "SELF00"));
        comm.register_content_serializers([
            (MsgType::RouteInfo, check::<RouteInfo> as ContentCheck),
            (MsgType::IdResponse, check::<IdResponse> as ContentCheck),
        ]);
        comm
    }

    #[test]
    fn send_requires_a_serializer() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx, &[]).unwrap();

        let err = comm.send(MsgType::LoadInfo, &peer, &()).unwrap_err();
        assert!(matches!(err, Error::MissingSerializer(MsgType::LoadInfo)));
    }

    #[test]
    fn routes_direct_then_table_then_default() {
        let mut comm = manager();
        let master = Address::master();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let container = addr(NodeKind::Container, "CONT00");
        let (master_tx, mut master_rx) = mpsc::unbounded_channel();
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        comm.register_connection(master.clone(), ConnectionId::next(), Link::Master, master_tx, &[])
            .unwrap();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, peer_tx, &[])
            .unwrap();
        comm.set_default_route(Some(master.clone()));
        comm.set_routes(&peer, vec![container.clone()]);
        assert_eq!(comm.route(&peer), Some(&peer));

        comm.send(MsgType::RouteInfo, &container, &RouteInfo::default())
            .unwrap();
        assert_eq!(peer_rx.try_recv().unwrap().dest, container);

        let elsewhere = addr(NodeKind::Container, "OTHER0");
        comm.send(MsgType::RouteInfo, &elsewhere, &RouteInfo::default())
            .unwrap();
        assert_eq!(master_rx.try_recv().unwrap().dest, elsewhere);
    }

    #[test]
    fn unregister_drops_routes_through_peer() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let container = addr(NodeKind::Container, "CONT00");
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx, &[]).unwrap();
        comm.set_routes(&peer, vec![container.clone()]);

        assert_eq!(comm.unregister_connection(&peer), Some(Link::Peer));
        assert!(comm.route(&container).is_none());
        assert_eq!(comm.unregister_connection(&peer), None);

        let err = comm
            .send(MsgType::RouteInfo, &container, &RouteInfo::default())
            .unwrap_err();
        assert!(matches!(err, Error::NoRoute(_)));
    }

    #[test]
    fn duplicate_connection_is_internal_error() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx.clone(), &[])
            .unwrap();
        let err = comm
            .register_connection(peer, ConnectionId::next(), Link::Peer, tx, &[])
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn inbound_must_be_approved_and_well_formed() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx, &[MsgType::RouteInfo])
            .unwrap();

        let ok = Message::new(MsgType::RouteInfo, peer.clone(), comm.address().clone())
            .with_content(&RouteInfo::default())
            .unwrap();
        assert!(comm.accept_inbound(&peer, &ok).is_ok());

        let garbled = Message::new(MsgType::RouteInfo, peer.clone(), comm.address().clone());
        assert!(matches!(
            comm.accept_inbound(&peer, &garbled),
            Err(Error::Codec(_))
        ));

        let unapproved = Message::new(MsgType::IdResponse, peer.clone(), comm.address().clone());
        assert!(matches!(
            comm.accept_inbound(&peer, &unapproved),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn local_messages_must_originate_at_the_sending_peer() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let other = addr(NodeKind::Satellite, "OTHER0");
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), ConnectionId::next(), Link::Peer, tx, &[MsgType::RouteInfo])
            .unwrap();

        let forged = Message::new(MsgType::RouteInfo, other.clone(), comm.address().clone())
            .with_content(&RouteInfo::default())
            .unwrap();
        assert!(matches!(
            comm.accept_inbound(&peer, &forged),
            Err(Error::InvalidRequest(_))
        ));

        // Traffic passing through may come from anywhere behind the peer.
        let relayed = Message::new(MsgType::RouteInfo, other, addr(NodeKind::Container, "CONT00"))
            .with_content(&RouteInfo::default())
            .unwrap();
        assert!(comm.accept_inbound(&peer, &relayed).is_ok());
    }

    #[test]
    fn replaced_connection_is_no_longer_current() {
        let mut comm = manager();
        let peer = addr(NodeKind::Satellite, "PEER00");
        let (first, second) = (ConnectionId::next(), ConnectionId::next());
        let (tx, _rx) = mpsc::unbounded_channel();
        comm.register_connection(peer.clone(), first, Link::Peer, tx.clone(), &[])
            .unwrap();
        assert!(comm.is_current(&peer, first));

        comm.unregister_connection(&peer);
        comm.register_connection(peer.clone(), second, Link::Peer, tx, &[])
            .unwrap();
        assert!(!comm.is_current(&peer, first));
        assert!(comm.is_current(&peer, second));
    }
}
