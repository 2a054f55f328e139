//! Lookup of robot and node specifications.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::config::Config;
use crate::error::{Error, Result};

/// Definition of a node which can be launched inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NodeSpec {
    pub package: String,
    pub name: String,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[async_trait]
pub trait SpecStore: Send + Sync {
    /// Home folder of a robot.
    async fn robot_home(&self, robot_id: &Address) -> Result<String>;

    async fn node_spec(&self, node_id: &str) -> Result<NodeSpec>;
}

/// Store answering from the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    robot_homes: HashMap<String, String>,
    node_specs: HashMap<String, NodeSpec>,
}

impl ConfigStore {
    pub fn from_config(config: &Config) -> Self {
        Self {
            robot_homes: config.robot_homes.clone(),
            node_specs: config.node_specs.clone(),
        }
    }
}

#[async_trait]
impl SpecStore for ConfigStore {
    async fn robot_home(&self, robot_id: &Address) -> Result<String> {
        self.robot_homes
            .get(&robot_id.to_string())
            .cloned()
            .ok_or_else(|| Error::invalid(format!("no home folder known for {}", robot_id)))
    }

    async fn node_spec(&self, node_id: &str) -> Result<NodeSpec> {
        self.node_specs
            .get(node_id)
            .cloned()
            .ok_or_else(|| Error::invalid(format!("unknown node {:?}", node_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeKind;

    fn store() -> ConfigStore {
        let mut config = Config::default();
        config
            .robot_homes
            .insert("ROAAAAAA".into(), "/srv/robots/a".into());
        config.node_specs.insert(
            "talker".into(),
            NodeSpec {
                package: "demo".into(),
                name: "talker".into(),
                params: BTreeMap::from([("rate".to_string(), "10".to_string())]),
            },
        );
        ConfigStore::from_config(&config)
    }

    #[tokio::test]
    async fn robot_home_lookup() {
        let store = store();
        let known = Address::new(NodeKind::Robot, "AAAAAA".parse().unwrap());
        let unknown = Address::new(NodeKind::Robot, "BBBBBB".parse().unwrap());
        assert_eq!(store.robot_home(&known).await.unwrap(), "/srv/robots/a");
        assert!(matches!(
            store.robot_home(&unknown).await,
            Err(Error::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn node_spec_lookup() {
        let store = store();
        let spec = store.node_spec("talker").await.unwrap();
        assert_eq!(spec.package, "demo");
        assert_eq!(spec.params.get("rate").map(String::as_str), Some("10"));
        assert!(store.node_spec("listener").await.is_err());
    }
}
