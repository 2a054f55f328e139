//! Node addresses.
//!
//! Every entity in the cluster is identified by a fixed-width address made
//! of a two character prefix naming the kind of node, followed by a six
//! character unique identifier handed out by the master's lease service:
//!
//! ```text
//!  SA 4F09C2
//!  ^^ ^^^^^^
//!  |  uid (UID_LEN)
//!  prefix (PREFIX_LEN)
//! ```
//!
//! The master uses the well-known address `MA000000`; the uid `000000` is
//! reserved and never leased.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of characters identifying the kind of node.
pub const PREFIX_LEN: usize = 2;
/// Number of characters of the unique identifier.
pub const UID_LEN: usize = 6;
/// Total width of an address.
pub const ADDR_LEN: usize = PREFIX_LEN + UID_LEN;
/// Uid reserved for the master, never handed out as a lease.
pub const MASTER_UID: &str = "000000";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("expected {expected} characters, got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("unknown address prefix {0:?}")]
    UnknownPrefix(String),
    #[error("invalid character in {0:?}")]
    InvalidCharacter(String),
}

/// Kind of node an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Master,
    Satellite,
    Container,
    Robot,
}

impl NodeKind {
    pub fn prefix(self) -> &'static str {
        match self {
            NodeKind::Master => "MA",
            NodeKind::Satellite => "SA",
            NodeKind::Container => "CO",
            NodeKind::Robot => "RO",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "MA" => Some(NodeKind::Master),
            "SA" => Some(NodeKind::Satellite),
            "CO" => Some(NodeKind::Container),
            "RO" => Some(NodeKind::Robot),
            _ => None,
        }
    }
}

/// Unique identifier part of an address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Uid(String);

impl Uid {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_reserved(&self) -> bool {
        self.0 == MASTER_UID
    }

    /// Builds a uid from three bytes of digest, upper-case hex encoded.
    pub(crate) fn from_digest(bytes: [u8; UID_LEN / 2]) -> Self {
        Uid(hex::encode_upper(bytes))
    }
}

impl FromStr for Uid {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != UID_LEN {
            return Err(AddressError::WrongLength {
                expected: UID_LEN,
                actual: s.len(),
            });
        }
        if !s.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(AddressError::InvalidCharacter(s.to_string()));
        }
        Ok(Uid(s.to_string()))
    }
}

impl TryFrom<String> for Uid {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Uid> for String {
    fn from(uid: Uid) -> Self {
        uid.0
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A node address: kind prefix plus uid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address {
    kind: NodeKind,
    uid: Uid,
}

impl Address {
    pub fn new(kind: NodeKind, uid: Uid) -> Self {
        Self { kind, uid }
    }

    /// The well-known address of the master node.
    pub fn master() -> Self {
        Self {
            kind: NodeKind::Master,
            uid: Uid(MASTER_UID.to_string()),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    pub fn is_master(&self) -> bool {
        *self == Self::master()
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDR_LEN {
            return Err(AddressError::WrongLength {
                expected: ADDR_LEN,
                actual: s.len(),
            });
        }
        if !s.is_ascii() {
            return Err(AddressError::InvalidCharacter(s.to_string()));
        }
        let (prefix, uid) = s.split_at(PREFIX_LEN);
        let kind = NodeKind::from_prefix(prefix)
            .ok_or_else(|| AddressError::UnknownPrefix(prefix.to_string()))?;
        Ok(Self {
            kind,
            uid: uid.parse()?,
        })
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind.prefix(), self.uid)
    }
}

/// Strips exactly [`PREFIX_LEN`] characters off a raw claimed origin and
/// parses what remains as a uid. The prefix itself is not inspected.
pub fn strip_prefix(raw: &str) -> Result<Uid, AddressError> {
    if raw.len() != ADDR_LEN || !raw.is_ascii() {
        return Err(AddressError::WrongLength {
            expected: ADDR_LEN,
            actual: raw.len(),
        });
    }
    raw[PREFIX_LEN..].parse()
}
