//! Container engine capability: lifecycle of the DB and proxy containers
//! backing each clone.
//!
//! Two containers exist per clone: the database itself (bind-mounting the
//! clone dataset) and a TCP proxy publishing a host port, both attached to a
//! shared virtual network so the proxy reaches the database by name.

use async_trait::async_trait;
use std::path::PathBuf;

use crate::Result;

mod docker;
mod mem;

pub use docker::DockerEngine;
pub use mem::MemEngine;

/// Virtual network all clone containers attach to. Created on first use.
pub const PROXY_NETWORK: &str = "zdap_proxy_net";

/// Image running the in-tree TCP proxy.
pub const PROXY_IMAGE: &str = "crholm/zdap-proxy:latest";

#[derive(Debug, Clone)]
pub struct Healthcheck {
    pub cmd: String,
    pub interval_s: u64,
    pub timeout_s: u64,
    pub start_period_s: u64,
    pub retries: u32,
}

impl Healthcheck {
    /// The tight polling profile used while waiting on a fresh database.
    pub fn aggressive(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            interval_s: 1,
            timeout_s: 1,
            start_period_s: 1,
            retries: 1,
        }
    }
}

/// Everything needed to run a database container against a dataset.
#[derive(Debug, Clone)]
pub struct DbContainerSpec {
    /// Container name; also its DNS name on the proxy network.
    pub name: String,
    pub image: String,
    pub env: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub cmd: Option<Vec<String>>,
    pub shm_bytes: Option<u64>,
    pub owner: String,
    /// Host path of the mounted dataset.
    pub mount_source: PathBuf,
    /// Mount path inside the container.
    pub mount_target: String,
    /// Port the database listens on inside the container.
    pub db_port: u16,
    pub healthcheck: Option<Healthcheck>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// The container has no healthcheck configured.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub name: String,
    pub state: String,
    pub running: bool,
    /// First host port published by the container, if any.
    pub published_port: Option<u16>,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Creates the shared proxy network if it does not exist yet. Safe to
    /// call concurrently.
    async fn ensure_network(&self) -> Result<()>;

    /// Creates and starts a database container per the spec.
    async fn create_db_container(&self, spec: &DbContainerSpec) -> Result<()>;

    /// Creates and starts the proxy container for a clone: listens on
    /// `port` (tcp+udp, published on 0.0.0.0) and forwards to
    /// `<clone>:<target_port>`.
    async fn create_proxy_container(
        &self,
        clone: &str,
        owner: &str,
        port: u16,
        target_port: u16,
    ) -> Result<()>;

    async fn inspect_health(&self, name: &str) -> Result<HealthState>;

    async fn list_containers(&self) -> Result<Vec<ContainerInfo>>;

    async fn stop(&self, name: &str, grace_s: u64) -> Result<()>;

    async fn wait_not_running(&self, name: &str) -> Result<()>;

    /// Force removes a container; removing an absent container is a no-op.
    async fn remove(&self, name: &str) -> Result<()>;
}

/// Tears down every container belonging to a clone (the DB container and
/// `<clone>-proxy` both share the clone name prefix): stop running ones with
/// no grace, wait them out, then force remove.
pub async fn destroy_clone_containers(engine: &dyn ContainerEngine, clone: &str) -> Result<()> {
    let containers = engine.list_containers().await?;
    for container in containers {
        if !container.name.starts_with(clone) {
            continue;
        }
        if container.running {
            tracing::debug!(container = %container.name, "stopping");
            engine.stop(&container.name, 0).await?;
            engine.wait_not_running(&container.name).await?;
        }
        tracing::debug!(container = %container.name, "removing");
        engine.remove(&container.name).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_destroy_clone_containers_matches_prefix() {
        let engine = MemEngine::new();
        let spec = DbContainerSpec {
            name: "zdap-pg-base-2024-01-02T03.04.05-clone-2024-01-02T04.00.00.abc".into(),
            image: "postgres:14".into(),
            env: vec![],
            entrypoint: None,
            cmd: None,
            shm_bytes: None,
            owner: "alice".into(),
            mount_source: PathBuf::from("/zdap/x"),
            mount_target: "/var/lib/postgresql/data".into(),
            db_port: 5432,
            healthcheck: None,
        };
        engine.create_db_container(&spec).await.unwrap();
        engine
            .create_proxy_container(&spec.name, "alice", 5433, 5432)
            .await
            .unwrap();
        // A container for a different clone must survive.
        let other = DbContainerSpec {
            name: "zdap-pg-base-2024-01-02T03.04.05-clone-2024-01-02T05.00.00.xyz".into(),
            ..spec.clone()
        };
        engine.create_db_container(&other).await.unwrap();

        destroy_clone_containers(&engine, &spec.name).await.unwrap();

        let names: Vec<String> = engine
            .list_containers()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(names, vec![other.name.clone()]);
    }
}
