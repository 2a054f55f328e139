//! Recording stand-ins for the outbound collaborators of a node.

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::address::Address;
use crate::comm::{Connector, Link};
use crate::error::{Error, Result};
use crate::message::ContainerSpec;
use crate::runtime::ContainerRuntime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dial {
    pub ip: String,
    pub port: u16,
    pub link: Link,
    pub expected: Address,
}

/// Remembers every dial instead of opening a socket.
#[derive(Default)]
pub struct RecordingConnector {
    dials: Mutex<Vec<Dial>>,
}

impl RecordingConnector {
    pub fn dials(&self) -> Vec<Dial> {
        self.dials.lock().unwrap().clone()
    }
}

impl Connector for RecordingConnector {
    fn connect(&self, ip: &str, port: u16, link: Link, expected: Address) {
        self.dials.lock().unwrap().push(Dial {
            ip: ip.to_string(),
            port,
            link,
            expected,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCall {
    Start(ContainerSpec),
    Stop(Address),
}

/// Reports every call on a channel. Stops fail when `failing_stops` is set.
pub struct RecordingRuntime {
    calls: mpsc::UnboundedSender<RuntimeCall>,
    failing_stops: bool,
}

impl RecordingRuntime {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RuntimeCall>) {
        let (calls, rx) = mpsc::unbounded_channel();
        (
            Self {
                calls,
                failing_stops: false,
            },
            rx,
        )
    }

    pub fn failing_stops(mut self) -> Self {
        self.failing_stops = true;
        self
    }
}

#[async_trait]
impl ContainerRuntime for RecordingRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        let _ = self.calls.send(RuntimeCall::Start(spec.clone()));
        Ok(())
    }

    async fn stop(&self, comm_id: &Address) -> Result<()> {
        let _ = self.calls.send(RuntimeCall::Stop(comm_id.clone()));
        if self.failing_stops {
            return Err(Error::internal(format!("cannot stop {}", comm_id)));
        }
        Ok(())
    }
}
