//! In-memory container engine for tests. Containers become healthy the
//! moment they start.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

use super::{ContainerEngine, ContainerInfo, DbContainerSpec, HealthState};
use crate::{Error, Result};

#[derive(Debug, Clone)]
struct MemContainer {
    running: bool,
    has_healthcheck: bool,
    published_port: Option<u16>,
}

#[derive(Default)]
pub struct MemEngine {
    containers: Mutex<BTreeMap<String, MemContainer>>,
    network_created: Mutex<bool>,
}

impl MemEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn network_exists(&self) -> bool {
        *self.network_created.lock()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.containers.lock().keys().cloned().collect()
    }
}

#[async_trait]
impl ContainerEngine for MemEngine {
    async fn ensure_network(&self) -> Result<()> {
        *self.network_created.lock() = true;
        Ok(())
    }

    async fn create_db_container(&self, spec: &DbContainerSpec) -> Result<()> {
        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(Error::Container(format!(
                "container name {} already in use",
                spec.name
            )));
        }
        containers.insert(
            spec.name.clone(),
            MemContainer {
                running: true,
                has_healthcheck: spec.healthcheck.is_some(),
                published_port: None,
            },
        );
        Ok(())
    }

    async fn create_proxy_container(
        &self,
        clone: &str,
        _owner: &str,
        port: u16,
        _target_port: u16,
    ) -> Result<()> {
        let name = format!("{clone}-proxy");
        let mut containers = self.containers.lock();
        if containers.contains_key(&name) {
            return Err(Error::Container(format!(
                "container name {name} already in use"
            )));
        }
        if containers.values().any(|c| c.published_port == Some(port)) {
            return Err(Error::Transient("port is already allocated".into()));
        }
        containers.insert(
            name,
            MemContainer {
                running: true,
                has_healthcheck: false,
                published_port: Some(port),
            },
        );
        Ok(())
    }

    async fn inspect_health(&self, name: &str) -> Result<HealthState> {
        let containers = self.containers.lock();
        let Some(container) = containers.get(name) else {
            return Err(Error::Container(format!("No such container: {name}")));
        };
        if !container.has_healthcheck {
            return Ok(HealthState::None);
        }
        Ok(if container.running {
            HealthState::Healthy
        } else {
            HealthState::Unhealthy
        })
    }

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        Ok(self
            .containers
            .lock()
            .iter()
            .map(|(name, c)| ContainerInfo {
                name: name.clone(),
                state: if c.running { "running" } else { "exited" }.to_string(),
                running: c.running,
                published_port: c.published_port,
            })
            .collect())
    }

    async fn stop(&self, name: &str, _grace_s: u64) -> Result<()> {
        let mut containers = self.containers.lock();
        let Some(container) = containers.get_mut(name) else {
            return Err(Error::Container(format!("No such container: {name}")));
        };
        container.running = false;
        Ok(())
    }

    async fn wait_not_running(&self, name: &str) -> Result<()> {
        let containers = self.containers.lock();
        match containers.get(name) {
            Some(container) if container.running => Err(Error::Container(format!(
                "container {name} still running after stop"
            ))),
            _ => Ok(()),
        }
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.containers.lock().remove(name);
        Ok(())
    }
}
