use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::store::NodeSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Master,
    Satellite,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub role: Role,
    /// Host of the master, dialed by satellites.
    pub master_host: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<String>,
    pub port_uid: u16,
    pub port_master: u16,
    pub port_satellite_satellite: u16,
    pub port_satellite_container: u16,
    pub uid_timeout_secs: u64,
    pub load_info_interval_secs: u64,
    pub cluster_secret: String,
    pub container_image: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_name: Option<String>,
    /// Robot address -> home folder mounted into its containers.
    pub robot_homes: HashMap<String, String>,
    pub node_specs: HashMap<String, NodeSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            role: Role::Satellite,
            master_host: "127.0.0.1".into(),
            bind_ip: None,
            port_uid: 10030,
            port_master: 10010,
            port_satellite_satellite: 10020,
            port_satellite_container: 10025,
            uid_timeout_secs: 30,
            load_info_interval_secs: 10,
            cluster_secret: "default_insecure_secret".into(),
            container_image: "tether/container:latest".into(),
            network_name: None,
            robot_homes: HashMap::new(),
            node_specs: HashMap::new(),
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("tether.toml"))
            .merge(Json::file("tether.json"))
            .merge(Env::prefixed("TETHER_"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Support Docker-style secrets
        if let Ok(secret_file) = std::env::var("TETHER_CLUSTER_SECRET_FILE") {
            config.cluster_secret = std::fs::read_to_string(secret_file)?
                .trim()
                .to_string();
        }

        if let Some(ref ip) = config.bind_ip {
            ip.parse::<IpAddr>()
                .map_err(|e| anyhow::anyhow!("Invalid bind_ip: {}", e))?;
        }

        if config.uid_timeout_secs == 0 {
            anyhow::bail!("uid_timeout_secs must be positive");
        }
        if config.load_info_interval_secs == 0 {
            anyhow::bail!("load_info_interval_secs must be positive");
        }

        Ok(config)
    }

    pub fn uid_timeout(&self) -> Duration {
        Duration::from_secs(self.uid_timeout_secs)
    }

    pub fn load_info_interval(&self) -> Duration {
        Duration::from_secs(self.load_info_interval_secs)
    }

    /// Address to bind a listener for `port` to.
    pub fn listen_addr(&self, port: u16) -> String {
        format!("{}:{}", self.bind_ip.as_deref().unwrap_or("0.0.0.0"), port)
    }
}
