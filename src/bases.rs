//! Base builder: turns a resource recipe into a snapshotted base dataset.
//!
//! A base is built by mounting a fresh dataset into a throwaway database
//! container, waiting for the database to come up, running the resource's
//! retrieval and creation scripts against it, tearing the container down and
//! snapshotting the result. Only one base build runs at a time; retrieval
//! scripts are cheap and disk is finite.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::info;

use crate::engine::{ContainerEngine, DbContainerSpec, HealthState, Healthcheck};
use crate::resource::Resource;
use crate::storage::Storage;
use crate::{names, Error, Result};

pub struct BaseBuilder {
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ContainerEngine>,
    config_dir: PathBuf,
    build_lock: Mutex<()>,
}

impl BaseBuilder {
    pub fn new(
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ContainerEngine>,
        config_dir: PathBuf,
    ) -> Self {
        Self {
            storage,
            engine,
            config_dir,
            build_lock: Mutex::new(()),
        }
    }

    /// Builds a fresh base for the resource and snapshots it, returning the
    /// base name. A failed step leaves the half-built dataset behind for the
    /// operator to inspect and destroy; nothing is retried.
    pub async fn create_base_and_snap(&self, resource: &Resource) -> Result<String> {
        let _guard = self.build_lock.lock().await;

        let t = chrono::Utc::now().naive_utc();
        let name = names::base_name(&resource.name, t);

        let path = self
            .storage
            .create_dataset(&name, &resource.name, t, &resource.base_fs)
            .await?;

        let spec = DbContainerSpec {
            name: name.clone(),
            image: resource.docker.image.clone(),
            env: resource.docker.env.clone(),
            entrypoint: resource.docker.entrypoint.clone(),
            cmd: resource.docker.cmd.clone(),
            shm_bytes: resource.docker.shm,
            owner: "zdapd".to_string(),
            mount_source: path,
            mount_target: resource.docker.volume.clone(),
            db_port: resource.docker.port,
            healthcheck: Some(Healthcheck::aggressive(&resource.docker.healthcheck)),
        };
        self.engine.create_db_container(&spec).await?;

        info!(container = %name, "waiting for container to become healthy");
        loop {
            match self.engine.inspect_health(&name).await? {
                HealthState::Healthy => break,
                _ => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        }
        info!(container = %name, "container is healthy");

        info!(resource = %resource.name, "retrieving data");
        let file = run_script(&self.config_dir.join(&resource.retrieval), &[]).await?;

        info!(resource = %resource.name, "creating database");
        run_script(
            &self.config_dir.join(&resource.creation),
            &[file.trim_end(), &name],
        )
        .await?;

        self.engine.stop(&name, 60).await?;
        self.engine.wait_not_running(&name).await?;
        self.engine.remove(&name).await?;

        self.storage
            .snap_dataset(&name, &resource.name, t)
            .await?;
        info!(base = %name, "base snapshotted");
        Ok(name)
    }
}

/// Runs a host-side script, returning its stdout. Stderr is passed through
/// to the daemon's own stderr so operators see script output live.
async fn run_script(script: &Path, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(script)
        .args(args)
        .stderr(std::process::Stdio::inherit())
        .output()
        .await
        .map_err(|e| Error::Script {
            script: script.display().to_string(),
            message: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(Error::Script {
            script: script.display().to_string(),
            message: format!("exit status {:?}", output.status.code()),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
