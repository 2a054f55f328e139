//! Wire envelope and the payloads carried in it.
//!
//! Messages are serialised using [`serde`](https://serde.rs/) as JSON and
//! exchanged between the master, the satellites and the containers. The
//! envelope is routed purely on `dest`; the `content` is opaque to the
//! router and only interpreted by the processor registered for `msg_type`.
//! A content check has to be registered for every type a node sends or
//! accepts, see [`check`].

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::address::{Address, Uid};
use crate::error::{Error, Result};

/// The closed set of control messages understood by the nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgType {
    /// Topology push from the master: satellites to mesh with.
    Connect,
    IdRequest,
    IdResponse,
    IdConfirm,
    IdDelete,
    /// Containers routed through the sending satellite.
    RouteInfo,
    LoadInfo,
    StartContainer,
    StopContainer,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::Connect => "CONNECT",
            MsgType::IdRequest => "ID_REQUEST",
            MsgType::IdResponse => "ID_RESPONSE",
            MsgType::IdConfirm => "ID_CONFIRM",
            MsgType::IdDelete => "ID_DELETE",
            MsgType::RouteInfo => "ROUTE_INFO",
            MsgType::LoadInfo => "LOAD_INFO",
            MsgType::StartContainer => "START_CONTAINER",
            MsgType::StopContainer => "STOP_CONTAINER",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MsgType,
    pub origin: Address,
    pub dest: Address,
    #[serde(default)]
    pub content: serde_json::Value,
}

impl Message {
    /// A message without content.
    pub fn new(msg_type: MsgType, origin: Address, dest: Address) -> Self {
        Self {
            msg_type,
            origin,
            dest,
            content: serde_json::Value::Null,
        }
    }

    pub fn with_content<T: Serialize>(mut self, content: &T) -> Result<Self> {
        self.content = serde_json::to_value(content)?;
        Ok(self)
    }

    pub fn content<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.content).map_err(Error::from)
    }
}

/// Content check used as the per-type serializer.
pub type ContentCheck = fn(&serde_json::Value) -> Result<()>;

/// Verifies that a content value decodes as `T`.
///
/// `check::<T>` coerces to a [`ContentCheck`] and is what nodes register
/// for each message type they handle.
pub fn check<T: DeserializeOwned>(content: &serde_json::Value) -> Result<()> {
    T::deserialize(content).map(|_| ()).map_err(Error::from)
}

/// Content checks for every message type, keyed by type.
pub fn content_checks() -> [(MsgType, ContentCheck); 9] {
    [
        (MsgType::Connect, check::<ConnectDirective>),
        (MsgType::IdRequest, check::<()>),
        (MsgType::IdResponse, check::<IdResponse>),
        (MsgType::IdConfirm, check::<IdConfirm>),
        (MsgType::IdDelete, check::<IdDelete>),
        (MsgType::RouteInfo, check::<RouteInfo>),
        (MsgType::LoadInfo, check::<LoadInfo>),
        (MsgType::StartContainer, check::<ContainerSpec>),
        (MsgType::StopContainer, check::<StopContainer>),
    ]
}

/// One entry of the satellite list pushed with `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SatelliteInfo {
    pub comm_id: Address,
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectDirective {
    pub satellites: Vec<SatelliteInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdResponse {
    pub uid: Uid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdConfirm {
    pub uid: Uid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdDelete {
    pub uid: Uid,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RouteInfo {
    pub routes: Vec<Address>,
}

/// Load advertised by a satellite to the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LoadInfo {
    pub containers: usize,
    pub robots: usize,
}

/// Everything a satellite needs to host a container. Sent with
/// `START_CONTAINER`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub comm_id: Address,
    pub owner: Address,
    pub home: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopContainer {
    pub comm_id: Address,
}
