use async_trait::async_trait;

use crate::address::Address;
use crate::error::Result;
use crate::message::ContainerSpec;

pub mod docker;
pub use docker::DockerRuntime;

/// Backend actually running the containers hosted by a satellite.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn start(&self, spec: &ContainerSpec) -> Result<()>;

    /// Stops and discards the container with the given address.
    async fn stop(&self, comm_id: &Address) -> Result<()>;
}
