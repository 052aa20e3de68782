//! Per-resource pool of pre-warmed clones.
//!
//! The pool keeps `min` claimable clones around, capped at `max` in any
//! state, and reclaims expired ones. All pool state lives in dataset user
//! properties; the scheduler task only reconciles what it reads there, so a
//! missed wake-up costs latency, never correctness.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

use crate::cloning::{destroy_clone, CloneFactory};
use crate::engine::ContainerEngine;
use crate::models::PublicClone;
use crate::registry;
use crate::resource::Resource;
use crate::storage::{props, DatasetTree, Storage};
use crate::{names, Error, Result};

/// Reconciliation period when nothing triggers a pass explicitly.
const GC_INTERVAL: Duration = Duration::from_secs(3600);

/// How long a trigger waits for the single-slot channel before being
/// dropped. Dropped triggers coalesce into whichever pass runs next.
const TRIGGER_WAIT: Duration = Duration::from_millis(1);

/// Owner recorded on clones the pool creates for itself.
const POOL_OWNER: &str = "zdapd";

pub struct ClonePool {
    resource: Resource,
    storage: Arc<dyn Storage>,
    engine: Arc<dyn ContainerEngine>,
    factory: Arc<CloneFactory>,
    network_address: String,
    api_port: u16,
    claim_lock: Mutex<()>,
    clones_available: AtomicI64,
    gc_tx: mpsc::Sender<()>,
    gc_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
}

impl ClonePool {
    pub fn new(
        resource: Resource,
        storage: Arc<dyn Storage>,
        engine: Arc<dyn ContainerEngine>,
        factory: Arc<CloneFactory>,
        network_address: String,
        api_port: u16,
    ) -> Arc<Self> {
        let (gc_tx, gc_rx) = mpsc::channel(1);
        Arc::new(Self {
            resource,
            storage,
            engine,
            factory,
            network_address,
            api_port,
            claim_lock: Mutex::new(()),
            clones_available: AtomicI64::new(0),
            gc_tx,
            gc_rx: parking_lot::Mutex::new(Some(gc_rx)),
        })
    }

    pub fn resource_name(&self) -> &str {
        &self.resource.name
    }

    /// Claimable clones as of the last reconciliation or claim.
    pub fn clones_available(&self) -> i64 {
        self.clones_available.load(Ordering::SeqCst)
    }

    /// Spawns the reconciliation loop: wakes on the hourly timer or on a GC
    /// trigger, whichever comes first.
    pub fn start(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let Some(mut rx) = self.gc_rx.lock().take() else {
            warn!(resource = %self.resource.name, "clone pool already started");
            return;
        };
        tokio::spawn(async move {
            info!(resource = %pool.resource.name, "clone pool started");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(GC_INTERVAL) => {}
                    _ = rx.recv() => {}
                }
                pool.reconcile().await;
            }
        });
    }

    /// Requests a GC pass. Edge-triggered: if a trigger is already pending
    /// this one is dropped after a brief wait.
    pub async fn trigger_gc(&self) {
        let _ = self.gc_tx.send_timeout((), TRIGGER_WAIT).await;
    }

    fn trigger_gc_after(self: &Arc<Self>, delay: Duration) {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.trigger_gc().await;
        });
    }

    /// One reconciliation pass. Failures are logged and the pool carries on;
    /// whatever was missed is observed again next pass.
    pub async fn reconcile(&self) {
        let tree = match self.storage.open().await {
            Ok(tree) => tree,
            Err(e) => {
                warn!(resource = %self.resource.name, error = %e, "could not open dataset tree");
                return;
            }
        };

        let pooled = match registry::pooled_clones(&tree, &self.resource.name) {
            Ok(pooled) => pooled,
            Err(e) => {
                warn!(resource = %self.resource.name, error = %e, "could not read pooled clones");
                return;
            }
        };

        if self.resource.clone_pool.reset_on_new_snap {
            if let Err(e) = self.expire_old_snap_clones(&tree).await {
                warn!(resource = %self.resource.name, error = %e, "could not expire clones from old snaps");
            }
        }

        let surviving = self.prune_expired(pooled).await;
        let available = surviving.iter().filter(|c| c.available()).count();
        {
            let _guard = self.claim_lock.lock().await;
            self.clones_available.store(available as i64, Ordering::SeqCst);
        }

        let pool_cfg = &self.resource.clone_pool;
        let total = surviving.len();
        let mut to_add = pool_cfg.min_clones.saturating_sub(available);
        if total + to_add > pool_cfg.max_clones {
            to_add = pool_cfg.max_clones.saturating_sub(total);
        }

        for _ in 0..to_add {
            match self.add_clone_to_pool(&tree).await {
                Ok(_) => {
                    let _guard = self.claim_lock.lock().await;
                    self.clones_available.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!(resource = %self.resource.name, error = %e, "could not add clone to pool");
                }
            }
        }
    }

    /// Claims an available pooled clone for `owner`, creating one
    /// synchronously when the pool is empty but below its cap.
    ///
    /// The clone's name is the claim id. `ttl` is clamped to the resource's
    /// `claim_max_ttl_s`.
    pub async fn claim(self: &Arc<Self>, ttl_s: u64, owner: &str) -> Result<PublicClone> {
        let _guard = self.claim_lock.lock().await;

        let tree = self.storage.open().await?;
        let mut candidate = self.first_available(&tree)?;

        let mut created_for_claim = false;
        if candidate.is_none() {
            let pooled = registry::pooled_clones(&tree, &self.resource.name)?;
            if pooled.len() >= self.resource.clone_pool.max_clones {
                return Err(Error::ClaimUnavailable(self.resource.name.clone()));
            }
            info!(resource = %self.resource.name, "pool empty, creating clone for claim");
            self.add_clone_to_pool(&tree).await?;
            created_for_claim = true;
            let tree = self.storage.open().await?;
            candidate = self.first_available(&tree)?;
        }

        let Some(mut clone) = candidate else {
            return Err(Error::ClaimUnavailable(self.resource.name.clone()));
        };

        let ttl_s = ttl_s.min(self.resource.clone_pool.claim_max_ttl_s);
        let expires = Utc::now().naive_utc() + chrono::Duration::seconds(ttl_s as i64);
        self.storage
            .set_user_property(&clone.name, props::EXPIRES, &names::format_name_ts(expires))
            .await?;
        self.storage
            .set_user_property(&clone.name, props::OWNER, owner)
            .await?;
        self.trigger_gc_after(Duration::from_secs(ttl_s));
        // A clone created for this claim was never counted as available, so
        // only a pre-existing clone decrements the published counter.
        if !created_for_claim {
            self.clones_available.fetch_sub(1, Ordering::SeqCst);
        }

        clone.expires_at = Some(expires);
        clone.owner = owner.to_string();
        clone.server = self.network_address.clone();
        clone.api_port = self.api_port;

        self.trigger_gc().await;
        info!(resource = %self.resource.name, clone = %clone.name, owner, ttl_s, "clone claimed");
        Ok(clone)
    }

    /// Releases a claim by expiring its clone now. Safe to repeat.
    pub async fn expire(&self, claim_id: &str) -> Result<()> {
        let tree = self.storage.open().await?;
        let pooled = registry::pooled_clones(&tree, &self.resource.name)?;
        if !pooled.iter().any(|c| c.name == claim_id) {
            return Err(Error::NotFound(format!("claim {claim_id}")));
        }
        let now = Utc::now().naive_utc();
        self.storage
            .set_user_property(claim_id, props::EXPIRES, &names::format_name_ts(now))
            .await?;
        self.trigger_gc().await;
        info!(resource = %self.resource.name, clone = %claim_id, "claim expired");
        Ok(())
    }

    fn first_available(&self, tree: &DatasetTree) -> Result<Option<PublicClone>> {
        let pooled = registry::pooled_clones(tree, &self.resource.name)?;
        Ok(pooled.into_iter().find(|c| c.available()))
    }

    async fn add_clone_to_pool(&self, tree: &DatasetTree) -> Result<PublicClone> {
        let snap = registry::latest_snap(tree, &self.resource.name)?;
        info!(resource = %self.resource.name, snap = %snap.name, "adding clone to pool");
        self.factory
            .create_clone(POOL_OWNER, &self.resource, snap.created_at, true)
            .await
    }

    /// Expires pooled clones built from anything but the latest snapshot.
    /// They are destroyed by the pass that observes the new expiry.
    async fn expire_old_snap_clones(&self, tree: &DatasetTree) -> Result<()> {
        let _guard = self.claim_lock.lock().await;
        let pooled = registry::pooled_clones(tree, &self.resource.name)?;
        let latest = registry::latest_snap(tree, &self.resource.name)?;
        for clone in pooled {
            if clone.snapped_at == latest.created_at {
                continue;
            }
            info!(clone = %clone.name, "expiring clone from superseded snap");
            let now = Utc::now().naive_utc();
            if let Err(e) = self
                .storage
                .set_user_property(&clone.name, props::EXPIRES, &names::format_name_ts(now))
                .await
            {
                warn!(clone = %clone.name, error = %e, "could not expire clone");
            } else {
                self.trigger_gc().await;
            }
        }
        Ok(())
    }

    /// Destroys clones whose expiry has passed, best effort, and returns the
    /// survivors.
    async fn prune_expired(&self, pooled: Vec<PublicClone>) -> Vec<PublicClone> {
        let now = Utc::now().naive_utc();
        let mut surviving = Vec::with_capacity(pooled.len());
        for clone in pooled {
            let expired = clone.expires_at.is_some_and(|at| at <= now);
            if !expired {
                surviving.push(clone);
                continue;
            }
            if let Err(e) =
                destroy_clone(self.storage.as_ref(), self.engine.as_ref(), &clone.name).await
            {
                warn!(clone = %clone.name, error = %e, "could not destroy expired clone");
            }
        }
        surviving
    }
}
