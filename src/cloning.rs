//! Clone factory: dataset clone plus its database and proxy containers.

use chrono::NaiveDateTime;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::engine::{self, ContainerEngine, DbContainerSpec, Healthcheck};
use crate::models::PublicClone;
use crate::resource::Resource;
use crate::storage::{props, Storage};
use crate::{names, Error, Result};

pub struct CloneFactory {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ContainerEngine>,
    network_address: String,
    api_port: u16,
    create_lock: Mutex<()>,
}

impl CloneFactory {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ContainerEngine>,
        network_address: String,
        api_port: u16,
    ) -> Self {
        Self {
            storage,
            engine,
            network_address,
            api_port,
            create_lock: Mutex::new(()),
        }
    }

    /// Clones the resource's snapshot taken at `at` and starts the container
    /// pair for it.
    ///
    /// Creation is serialized process-wide so port selection and network
    /// attachment stay linearized. If a container step fails the clone
    /// dataset is left behind; it shows up in listings and can be destroyed
    /// by name.
    pub async fn create_clone(
        &self,
        owner: &str,
        resource: &Resource,
        at: NaiveDateTime,
        pooled: bool,
    ) -> Result<PublicClone> {
        let _guard = self.create_lock.lock().await;

        self.engine.ensure_network().await?;

        let snap = names::snap_name(&resource.name, at);
        let tree = self.storage.open().await?;
        if !tree.contains(&snap) {
            return Err(Error::NotFound(format!("snap {snap}")));
        }
        drop(tree);

        info!(snap = %snap, owner, "creating clone");
        let port = free_port()?;
        let (clone_name, path) = self
            .storage
            .clone_dataset(&snap, owner, port, pooled)
            .await?;
        info!(clone = %clone_name, port, "clone dataset ready");

        for (key, value) in &resource.clone_fs {
            self.storage
                .set_user_property(&clone_name, key, value)
                .await?;
        }

        let spec = DbContainerSpec {
            name: clone_name.clone(),
            image: resource.docker.image.clone(),
            env: resource.docker.env.clone(),
            entrypoint: resource.docker.entrypoint.clone(),
            cmd: resource.docker.cmd.clone(),
            shm_bytes: resource.docker.shm,
            owner: owner.to_string(),
            mount_source: path,
            mount_target: resource.docker.volume.clone(),
            db_port: resource.docker.port,
            healthcheck: Some(Healthcheck::aggressive(&resource.docker.healthcheck)),
        };
        self.engine.create_db_container(&spec).await?;
        self.engine
            .create_proxy_container(&clone_name, owner, port, resource.docker.port)
            .await?;

        let (snapped_at, created_at) = names::clone_timestamps(&clone_name)?;

        // The container pair is up; record that on the dataset. Later
        // readiness is the container's own concern.
        let tree = self.storage.open().await?;
        if tree.contains(&clone_name) {
            self.storage
                .set_user_property(&clone_name, props::HEALTHY, "true")
                .await?;
        } else {
            warn!(clone = %clone_name, "clone vanished before healthy mark");
        }

        Ok(PublicClone {
            name: clone_name,
            resource: resource.name.clone(),
            owner: owner.to_string(),
            created_at,
            snapped_at,
            expires_at: None,
            clone_pooled: pooled,
            healthy: true,
            port,
            server: self.network_address.clone(),
            api_port: self.api_port,
        })
    }
}

/// Stops and removes a clone's containers, then destroys its dataset.
pub async fn destroy_clone(
    storage: &dyn Storage,
    container_engine: &dyn ContainerEngine,
    clone: &str,
) -> Result<()> {
    info!(clone = %clone, "destroying clone");
    engine::destroy_clone_containers(container_engine, clone).await?;
    storage.destroy(clone).await
}

/// Picks a free host TCP port by binding port 0 and dropping the listener.
/// Racy by nature; a loser of the race surfaces as a transient container
/// start failure.
fn free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}
