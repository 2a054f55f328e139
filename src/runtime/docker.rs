use super::ContainerRuntime;
use crate::address::Address;
use crate::error::Result;
use crate::message::ContainerSpec;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
    StopContainerOptions,
};
use bollard::models::HostConfig;
use bollard::Docker;
use log::{debug, info};

/// Seconds a container gets to exit before it is killed.
const STOP_GRACE_SECS: i64 = 10;

/// Where the robot home folder is mounted inside the container.
const HOME_MOUNT: &str = "/home/robot";

pub struct DockerRuntime {
    image: String,
    network_name: Option<String>,
}

impl DockerRuntime {
    pub fn new(image: String, network_name: Option<String>) -> Self {
        Self {
            image,
            network_name,
        }
    }

    fn connect() -> Result<Docker> {
        // Unix socket on Linux.
        Docker::connect_with_local_defaults().map_err(Into::into)
    }

    fn container_name(comm_id: &Address) -> String {
        format!("tether-{}", comm_id).to_lowercase()
    }

    fn container_config(&self, spec: &ContainerSpec) -> Config<String> {
        Config {
            image: Some(self.image.clone()),
            env: Some(vec![
                format!("TETHER_COMM_ID={}", spec.comm_id),
                format!("TETHER_OWNER={}", spec.owner),
            ]),
            host_config: Some(HostConfig {
                binds: Some(vec![format!("{}:{}", spec.home, HOME_MOUNT)]),
                network_mode: self.network_name.clone(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ContainerSpec) -> Result<()> {
        let docker = Self::connect()?;
        let name = Self::container_name(&spec.comm_id);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        docker
            .create_container(Some(options), self.container_config(spec))
            .await?;
        debug!("Created container {} from {}", name, self.image);
        docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await?;
        info!("Container started: {} (owner {})", name, spec.owner);
        Ok(())
    }

    async fn stop(&self, comm_id: &Address) -> Result<()> {
        let docker = Self::connect()?;
        let name = Self::container_name(comm_id);
        docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await?;
        docker
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        info!("Container stopped: {}", name);
        Ok(())
    }
}
