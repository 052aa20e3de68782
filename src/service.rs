//! The service: loaded resources, adapters, pools and the cron.
//!
//! One `Service` value is constructed at startup and shared with the HTTP
//! surface. Everything mutable lives behind the adapters or inside the pool
//! schedulers; the service itself is wiring.

use chrono::{NaiveDateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bases::BaseBuilder;
use crate::cloning::{self, CloneFactory};
use crate::clonepool::ClonePool;
use crate::config::Config;
use crate::engine::ContainerEngine;
use crate::models::{PublicClone, ServerResourceDetails, ServerStatus};
use crate::registry::{self, CloneRegistry};
use crate::resource::{load_resources, Resource};
use crate::status;
use crate::storage::Storage;
use crate::{names, Error, Result};

pub struct Service {
    config: Config,
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ContainerEngine>,
    registry: CloneRegistry,
    factory: Arc<CloneFactory>,
    builder: BaseBuilder,
    resources: Vec<Resource>,
    pools: HashMap<String, Arc<ClonePool>>,
    cron_jobs: Vec<(String, cron::Schedule)>,
}

impl Service {
    pub fn new(
        config: Config,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ContainerEngine>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let resources = load_resources(&config.config_dir)?;
        Self::with_resources(config, storage, engine, resources)
    }

    /// Builds a service from pre-loaded resources. Tests use this to skip
    /// the config directory.
    pub fn with_resources(
        config: Config,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ContainerEngine>,
        resources: Vec<Resource>,
    ) -> Result<Arc<Self>> {
        let factory = Arc::new(CloneFactory::new(
            storage.clone(),
            engine.clone(),
            config.network_address.clone(),
            config.api_port,
        ));
        let builder = BaseBuilder::new(
            storage.clone(),
            engine.clone(),
            config.config_dir.clone(),
        );

        let mut pools = HashMap::new();
        for resource in &resources {
            if resource.clone_pool.active() {
                let pool = ClonePool::new(
                    resource.clone(),
                    storage.clone(),
                    engine.clone(),
                    factory.clone(),
                    config.network_address.clone(),
                    config.api_port,
                );
                pools.insert(resource.name.clone(), pool);
            }
        }

        let mut cron_jobs = Vec::new();
        for resource in &resources {
            if resource.cron.is_empty() {
                continue;
            }
            let schedule: cron::Schedule = normalize_cron(&resource.cron)
                .parse()
                .map_err(|e| {
                    Error::Config(format!(
                        "bad cron expression '{}' for resource '{}': {e}",
                        resource.cron, resource.name
                    ))
                })?;
            cron_jobs.push((resource.name.clone(), schedule));
        }

        Ok(Arc::new(Self {
            registry: CloneRegistry::new(engine.clone()),
            config,
            storage,
            engine,
            factory,
            builder,
            resources,
            pools,
            cron_jobs,
        }))
    }

    /// Starts the pool schedulers (with an initial GC each) and the cron
    /// tasks.
    pub fn start(self: &Arc<Self>) {
        for (name, pool) in &self.pools {
            pool.start();
            let pool = Arc::clone(pool);
            info!(resource = %name, "triggering initial pool reconciliation");
            tokio::spawn(async move { pool.trigger_gc().await });
        }
        for (resource, schedule) in &self.cron_jobs {
            info!(
                resource = %resource,
                next = ?schedule.upcoming(Utc).next(),
                "registering base rebuild cron"
            );
            self.spawn_cron(resource.clone(), schedule.clone());
        }
    }

    fn spawn_cron(self: &Arc<Self>, resource: String, schedule: cron::Schedule) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let Some(next) = schedule.after(&now).next() else {
                    warn!(resource = %resource, "cron schedule has no future occurrences");
                    return;
                };
                let delay = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;
                service.run_cron_job(&resource).await;
            }
        });
    }

    async fn run_cron_job(&self, resource: &str) {
        info!(resource = %resource, "cron: creating base");
        if let Err(e) = self.create_base_and_snap(resource, false).await {
            error!(resource = %resource, error = %e, "cron: could not create base");
        }
    }

    /// Runs every cron entry's job now, one after another.
    pub async fn exec_all_cronjobs(&self) {
        info!("executing all cron jobs now");
        for (resource, _) in &self.cron_jobs {
            self.run_cron_job(resource).await;
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn resource(&self, name: &str) -> Result<&Resource> {
        self.resources
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| Error::NotFound(format!("resource {name}")))
    }

    pub fn pool(&self, resource: &str) -> Option<&Arc<ClonePool>> {
        self.pools.get(resource)
    }

    /// Produces a fresh `@snap` for the resource. With `use_existing_base`
    /// the newest existing base is snapshotted again instead of building a
    /// new one.
    pub async fn create_base_and_snap(&self, resource: &str, use_existing_base: bool) -> Result<()> {
        let r = self.resource(resource)?;

        if use_existing_base {
            let tree = self.storage.open().await?;
            let prefix = format!("zdap-{}-base-", r.name);
            let mut bases: Vec<String> = tree
                .list_bases()
                .into_iter()
                .filter(|d| d.name.starts_with(&prefix))
                .map(|d| d.name.clone())
                .collect();
            bases.sort();
            let Some(latest) = bases.pop() else {
                return Err(Error::NotFound(format!("base for resource '{resource}'")));
            };
            let t = Utc::now().naive_utc();
            info!(base = %latest, at = %names::format_name_ts(t), "snapping existing base");
            self.storage.snap_dataset(&latest, &r.name, t).await?;
        } else {
            self.builder.create_base_and_snap(r).await?;
        }

        if let Some(pool) = self.pools.get(resource) {
            pool.trigger_gc().await;
        }
        Ok(())
    }

    /// Clones the resource's snapshot taken at `at`, or its latest snapshot
    /// when `at` is `None`.
    pub async fn clone_resource(
        &self,
        owner: &str,
        resource: &str,
        at: Option<NaiveDateTime>,
    ) -> Result<PublicClone> {
        let r = self.resource(resource)?;
        let at = match at {
            Some(at) => at,
            None => {
                let tree = self.storage.open().await?;
                registry::latest_snap(&tree, resource)?.created_at
            }
        };
        self.factory.create_clone(owner, r, at, false).await
    }

    /// Snapshots of a resource, oldest first, each with the caller's clones.
    pub async fn resource_snaps(
        &self,
        owner: &str,
        resource: &str,
    ) -> Result<Vec<(crate::models::PublicSnap, Vec<PublicClone>)>> {
        let r = self.resource(resource)?;
        let tree = self.storage.open().await?;
        let snaps = registry::resource_snaps(&tree, &r.name)?;
        let mut grouped = registry::resource_clones(&tree, &r.name)?;

        let mut out = Vec::with_capacity(snaps.len());
        for snap in snaps {
            let clones = grouped.remove(&snap.created_at).unwrap_or_default();
            let mut owned = registry::owned_by(clones, owner);
            for clone in &mut owned {
                clone.server = self.config.network_address.clone();
                clone.api_port = self.config.api_port;
                self.registry.enrich_port(clone).await?;
            }
            out.push((snap, owned));
        }
        Ok(out)
    }

    /// All of the caller's clones of a resource, oldest first.
    pub async fn owned_clones(&self, owner: &str, resource: &str) -> Result<Vec<PublicClone>> {
        let mut clones: Vec<PublicClone> = self
            .resource_snaps(owner, resource)
            .await?
            .into_iter()
            .flat_map(|(_, clones)| clones)
            .collect();
        clones.sort_by_key(|c| c.created_at);
        Ok(clones)
    }

    /// Destroys one clone by name, containers first.
    pub async fn destroy_clone(&self, clone: &str) -> Result<()> {
        let tree = self.storage.open().await?;
        if !tree.list_clones().iter().any(|d| d.name == clone) {
            return Err(Error::NotFound(format!("clone {clone}")));
        }
        drop(tree);
        cloning::destroy_clone(self.storage.as_ref(), self.engine.as_ref(), clone).await
    }

    /// Destroys every clone of the resource owned by `owner`, returning the
    /// destroyed names.
    pub async fn destroy_owned_clones(&self, owner: &str, resource: &str) -> Result<Vec<String>> {
        let clones = self.owned_clones(owner, resource).await?;
        let mut destroyed = Vec::with_capacity(clones.len());
        for clone in clones {
            self.destroy_clone(&clone.name).await?;
            destroyed.push(clone.name);
        }
        Ok(destroyed)
    }

    /// Destroys the caller's clone created at `at`.
    pub async fn destroy_owned_clone_at(
        &self,
        owner: &str,
        resource: &str,
        at: NaiveDateTime,
    ) -> Result<String> {
        let clones = self.owned_clones(owner, resource).await?;
        let Some(clone) = clones.into_iter().find(|c| c.created_at == at) else {
            return Err(Error::NotFound(format!(
                "clone of '{resource}' created at {}",
                names::format_wire_ts(at)
            )));
        };
        self.destroy_clone(&clone.name).await?;
        Ok(clone.name)
    }

    /// Claims a pooled clone. A missing ttl falls back to the resource's
    /// default, then to its claim maximum.
    pub async fn claim(
        &self,
        resource: &str,
        ttl_s: Option<u64>,
        owner: &str,
    ) -> Result<PublicClone> {
        let r = self.resource(resource)?;
        let Some(pool) = self.pools.get(resource) else {
            return Err(Error::NotFound(format!(
                "clone pool for resource '{resource}'"
            )));
        };
        let mut ttl = ttl_s.unwrap_or(0);
        if ttl == 0 {
            ttl = r.clone_pool.default_ttl_s;
        }
        if ttl == 0 {
            ttl = r.clone_pool.claim_max_ttl_s;
        }
        pool.claim(ttl, owner).await
    }

    /// Expires a claim. A resource without a pool has nothing to expire.
    pub async fn expire_claim(&self, resource: &str, claim_id: &str) -> Result<()> {
        match self.pools.get(resource) {
            Some(pool) => pool.expire(claim_id).await,
            None => Ok(()),
        }
    }

    pub async fn server_status(&self) -> Result<ServerStatus> {
        let tree = self.storage.open().await?;
        let clones = tree.list_clones().len();
        let snaps = tree.list_snaps().len();
        drop(tree);

        let load = status::read_loadavg().unwrap_or_default();
        let mem = status::read_meminfo().unwrap_or_default();

        let mut details = std::collections::BTreeMap::new();
        let mut resource_names = Vec::with_capacity(self.resources.len());
        for r in &self.resources {
            resource_names.push(r.name.clone());
            details.insert(
                r.name.clone(),
                ServerResourceDetails {
                    name: r.name.clone(),
                    pooled_clones_available: self
                        .pools
                        .get(&r.name)
                        .map(|p| p.clones_available())
                        .unwrap_or(0),
                },
            );
        }

        Ok(ServerStatus {
            address: self.config.network_address.clone(),
            resources: resource_names,
            resource_details: details,
            snaps,
            clones,
            used_disk: self.storage.used_space().await?,
            free_disk: self.storage.free_space().await?,
            total_disk: self.storage.total_space().await?,
            free_mem: mem.free,
            used_mem: mem.used,
            cached_mem: mem.cached,
            total_mem: mem.total,
            load_1: load.load_1,
            load_5: load.load_5,
            load_15: load.load_15,
        })
    }

    /// Operator path: removes every zdap container and dataset on the host.
    pub async fn destroy_all(&self) -> Result<()> {
        for container in self.engine.list_containers().await? {
            if !container.name.starts_with("zdap-") {
                continue;
            }
            if container.running {
                self.engine.stop(&container.name, 0).await?;
                self.engine.wait_not_running(&container.name).await?;
            }
            self.engine.remove(&container.name).await?;
        }
        self.storage.destroy_all().await
    }
}

/// The cron crate wants a seconds field; resource descriptors use the
/// classic five-field form.
fn normalize_cron(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::MemEngine;
    use crate::storage::MemStorage;
    use chrono::NaiveDate;

    fn test_resource(name: &str, min: usize) -> Resource {
        let mut r: Resource = serde_yaml::from_str(&format!(
            r#"
name: {name}
retrieval: retrieve.sh
creation: create.sh
docker:
  image: postgres:14
  port: 5432
  volume: /var/lib/postgresql/data
  healthcheck: pg_isready
"#
        ))
        .unwrap();
        r.clone_pool.min_clones = min;
        r.clone_pool.max_clones = min.max(1) * 2;
        r.clone_pool.claim_max_ttl_s = 60;
        r.clone_pool.default_ttl_s = 10;
        r
    }

    fn ts(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 2)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    async fn service_with(resources: Vec<Resource>) -> (Arc<MemStorage>, Arc<Service>) {
        let storage = Arc::new(MemStorage::new());
        let engine = Arc::new(MemEngine::new());
        let service =
            Service::with_resources(Config::default(), storage.clone(), engine, resources)
                .unwrap();
        (storage, service)
    }

    async fn seed_snap(storage: &MemStorage, resource: &str, hour: u32) {
        let base = names::base_name(resource, ts(hour));
        storage
            .create_dataset(&base, resource, ts(hour), &Default::default())
            .await
            .unwrap();
        storage
            .snap_dataset(&base, resource, ts(hour))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_clone_resource_uses_latest_snap_by_default() {
        let (storage, service) = service_with(vec![test_resource("pg", 0)]).await;
        seed_snap(&storage, "pg", 3).await;
        seed_snap(&storage, "pg", 5).await;

        let clone = service.clone_resource("alice", "pg", None).await.unwrap();
        assert_eq!(clone.snapped_at, ts(5));

        let pinned = service
            .clone_resource("alice", "pg", Some(ts(3)))
            .await
            .unwrap();
        assert_eq!(pinned.snapped_at, ts(3));
    }

    #[tokio::test]
    async fn test_owned_clones_scoped_by_owner() {
        let (storage, service) = service_with(vec![test_resource("pg", 0)]).await;
        seed_snap(&storage, "pg", 3).await;

        service.clone_resource("alice", "pg", None).await.unwrap();
        service.clone_resource("bob", "pg", None).await.unwrap();

        let alices = service.owned_clones("alice", "pg").await.unwrap();
        assert_eq!(alices.len(), 1);
        assert_eq!(alices[0].owner, "alice");
        assert_eq!(alices[0].server, "localhost");

        let bobs = service.owned_clones("BOB", "pg").await.unwrap();
        assert_eq!(bobs.len(), 1);
        assert_eq!(bobs[0].owner, "bob");
    }

    #[tokio::test]
    async fn test_destroy_owned_clone_at() {
        let (storage, service) = service_with(vec![test_resource("pg", 0)]).await;
        seed_snap(&storage, "pg", 3).await;
        let clone = service.clone_resource("alice", "pg", None).await.unwrap();

        // Bob cannot destroy alice's clone.
        assert!(matches!(
            service
                .destroy_owned_clone_at("bob", "pg", clone.created_at)
                .await,
            Err(Error::NotFound(_))
        ));

        let destroyed = service
            .destroy_owned_clone_at("alice", "pg", clone.created_at)
            .await
            .unwrap();
        assert_eq!(destroyed, clone.name);
        assert!(service.owned_clones("alice", "pg").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_use_existing_base_snapshots_latest() {
        let (storage, service) = service_with(vec![test_resource("pg", 0)]).await;
        let base = names::base_name("pg", ts(3));
        storage
            .create_dataset(&base, "pg", ts(3), &Default::default())
            .await
            .unwrap();

        service.create_base_and_snap("pg", true).await.unwrap();
        let tree = storage.open().await.unwrap();
        assert!(tree.contains(&format!("{base}@snap")));
    }

    #[tokio::test]
    async fn test_claim_falls_back_to_default_ttl() {
        let (storage, service) = service_with(vec![test_resource("pg", 1)]).await;
        seed_snap(&storage, "pg", 3).await;

        let before = Utc::now().naive_utc();
        let claim = service.claim("pg", None, "bob").await.unwrap();
        let expires = claim.expires_at.unwrap();
        // default_ttl_s is 10 in the test resource.
        let delta = expires - (before + chrono::Duration::seconds(10));
        assert!(delta.num_seconds().abs() <= 1);
    }

    #[tokio::test]
    async fn test_claim_without_pool_is_not_found() {
        let (storage, service) = service_with(vec![test_resource("pg", 0)]).await;
        seed_snap(&storage, "pg", 3).await;
        assert!(matches!(
            service.claim("pg", Some(5), "bob").await,
            Err(Error::NotFound(_))
        ));
        // Expiring against a poolless resource stays a no-op.
        service.expire_claim("pg", "whatever").await.unwrap();
    }

    #[tokio::test]
    async fn test_server_status_counts() {
        let (storage, service) = service_with(vec![test_resource("pg", 1)]).await;
        seed_snap(&storage, "pg", 3).await;
        service.pool("pg").unwrap().reconcile().await;

        let status = service.server_status().await.unwrap();
        assert_eq!(status.snaps, 1);
        assert_eq!(status.clones, 1);
        assert_eq!(status.address, "localhost");
        assert_eq!(
            status.resource_details["pg"].pooled_clones_available,
            1
        );
        assert!(status.total_disk > 0);
    }

    #[test]
    fn test_normalize_cron() {
        assert_eq!(normalize_cron("0 2 * * *"), "0 0 2 * * *");
        assert_eq!(normalize_cron("30 4 * * * *"), "30 4 * * * *");
        assert!(normalize_cron("0 2 * * *").parse::<cron::Schedule>().is_ok());
    }

    #[tokio::test]
    async fn test_bad_cron_rejected() {
        let storage = Arc::new(MemStorage::new());
        let engine = Arc::new(MemEngine::new());
        let mut r = test_resource("pg", 0);
        r.cron = "not a cron".to_string();
        assert!(Service::with_resources(Config::default(), storage, engine, vec![r]).is_err());
    }
}
