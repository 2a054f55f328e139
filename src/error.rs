//! Error types shared by the master and satellite nodes.

use std::time::Duration;

use thiserror::Error;

use crate::address::{Address, AddressError};
use crate::message::MsgType;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Caller-facing rejection: duplicate registration, unknown id,
    /// ownership mismatch. Never fatal to the node.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Invariant violation inside the node. The connection that triggered
    /// it is torn down.
    #[error("internal error: {0}")]
    Internal(String),

    /// The lease a caller was waiting for was never answered in time.
    #[error("lease request timed out after {0:?}")]
    LeaseTimeout(Duration),

    #[error("invalid address: {0}")]
    Address(#[from] AddressError),

    #[error("no content serializer registered for {0}")]
    MissingSerializer(MsgType),

    #[error("no route to {0}")]
    NoRoute(Address),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),
}

impl Error {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidRequest(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the error should cost the offending connection its life.
    pub fn is_fatal_to_connection(&self) -> bool {
        !matches!(self, Error::InvalidRequest(_) | Error::NoRoute(_))
    }
}
