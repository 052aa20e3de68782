//! Read-only views over the dataset tree.
//!
//! Decodes dataset names and user properties into the public clone/snapshot
//! models. Listing is a pure read of authoritative state; the only cache is
//! a short-lived container list used to recover the proxy port for clones
//! created before the port property existed.

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::engine::{ContainerEngine, ContainerInfo};
use crate::models::{PublicClone, PublicSnap};
use crate::storage::{props, DatasetInfo, DatasetTree};
use crate::{names, Error, Result};

/// How long one container listing keeps serving port lookups.
const CONTAINER_CACHE_TTL: Duration = Duration::from_secs(2);

pub fn decode_clone(info: &DatasetInfo) -> Result<PublicClone> {
    let (name_snapped, name_created) = names::clone_timestamps(&info.name)?;
    let created_at = match info.prop(props::CREATED) {
        Some(v) => names::parse_name_ts(v)?,
        None => name_created,
    };
    let snapped_at = match info.prop(props::SNAPPED) {
        Some(v) => names::parse_name_ts(v)?,
        None => name_snapped,
    };
    let expires_at = match info.prop(props::EXPIRES) {
        Some(v) if !v.is_empty() => Some(names::parse_name_ts(v)?),
        _ => None,
    };
    Ok(PublicClone {
        name: info.name.clone(),
        resource: info.prop(props::RESOURCE).unwrap_or_default().to_string(),
        owner: info.prop(props::OWNER).unwrap_or_default().to_string(),
        created_at,
        snapped_at,
        expires_at,
        clone_pooled: info.prop(props::POOLED) == Some("true"),
        healthy: info.prop(props::HEALTHY) == Some("true"),
        port: info
            .prop(props::PORT)
            .and_then(|p| p.parse().ok())
            .unwrap_or(0),
        server: String::new(),
        api_port: 0,
    })
}

pub fn decode_snap(info: &DatasetInfo) -> Result<PublicSnap> {
    let created_at = match info.prop(props::CREATED) {
        Some(v) => names::parse_name_ts(v)?,
        None => {
            let ts = names::timestamps_in(&info.name);
            let Some(first) = ts.first() else {
                return Err(Error::InvalidArgument(format!(
                    "snap name '{}' has no timestamp",
                    info.name
                )));
            };
            names::parse_name_ts(first)?
        }
    };
    Ok(PublicSnap {
        name: info.name.clone(),
        resource: info.prop(props::RESOURCE).unwrap_or_default().to_string(),
        created_at,
    })
}

pub fn list_clones(tree: &DatasetTree) -> Result<Vec<PublicClone>> {
    tree.list_clones().into_iter().map(decode_clone).collect()
}

pub fn list_snaps(tree: &DatasetTree) -> Result<Vec<PublicSnap>> {
    tree.list_snaps().into_iter().map(decode_snap).collect()
}

/// Snapshots of one resource, sorted oldest first.
pub fn resource_snaps(tree: &DatasetTree, resource: &str) -> Result<Vec<PublicSnap>> {
    let prefix = format!("zdap-{resource}-base-");
    let mut snaps: Vec<PublicSnap> = tree
        .list_snaps()
        .into_iter()
        .filter(|d| d.name.starts_with(&prefix))
        .map(decode_snap)
        .collect::<Result<_>>()?;
    snaps.sort_by_key(|s| s.created_at);
    Ok(snaps)
}

/// The most recent snapshot for a resource.
pub fn latest_snap(tree: &DatasetTree, resource: &str) -> Result<PublicSnap> {
    resource_snaps(tree, resource)?
        .pop()
        .ok_or_else(|| Error::NotFound(format!("snap for resource '{resource}'")))
}

/// Clones of one resource grouped by the snapshot they were cut from.
pub fn resource_clones(
    tree: &DatasetTree,
    resource: &str,
) -> Result<BTreeMap<NaiveDateTime, Vec<PublicClone>>> {
    let prefix = format!("zdap-{resource}-base-");
    let mut grouped: BTreeMap<NaiveDateTime, Vec<PublicClone>> = BTreeMap::new();
    for info in tree.list_clones() {
        if !info.name.starts_with(&prefix) {
            continue;
        }
        let clone = decode_clone(info)?;
        let (snapped, _) = names::clone_timestamps(&info.name)?;
        grouped.entry(snapped).or_default().push(clone);
    }
    for clones in grouped.values_mut() {
        clones.sort_by_key(|c| c.created_at);
    }
    Ok(grouped)
}

/// Pooled clones of one resource.
pub fn pooled_clones(tree: &DatasetTree, resource: &str) -> Result<Vec<PublicClone>> {
    Ok(list_clones(tree)?
        .into_iter()
        .filter(|c| c.clone_pooled && c.resource == resource)
        .collect())
}

/// Case-insensitive owner filter used by every owner-scoped listing.
pub fn owned_by(clones: Vec<PublicClone>, owner: &str) -> Vec<PublicClone> {
    let owner = owner.to_lowercase();
    clones
        .into_iter()
        .filter(|c| c.owner.to_lowercase() == owner)
        .collect()
}

/// Registry handle holding the container-list cache.
pub struct CloneRegistry {
    engine: Arc<dyn ContainerEngine>,
    containers: Mutex<Option<(Instant, Vec<ContainerInfo>)>>,
}

impl CloneRegistry {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            containers: Mutex::new(None),
        }
    }

    async fn containers(&self) -> Result<Vec<ContainerInfo>> {
        {
            let cached = self.containers.lock();
            if let Some((at, containers)) = cached.as_ref() {
                if at.elapsed() < CONTAINER_CACHE_TTL {
                    return Ok(containers.clone());
                }
            }
        }
        let fresh = self.engine.list_containers().await?;
        *self.containers.lock() = Some((Instant::now(), fresh.clone()));
        Ok(fresh)
    }

    /// Resolves a clone's published proxy port from the container engine.
    pub async fn clone_port(&self, clone: &str) -> Result<u16> {
        let proxy = format!("{clone}-proxy");
        let containers = self.containers().await?;
        containers
            .iter()
            .find(|c| c.name.ends_with(&proxy))
            .and_then(|c| c.published_port)
            .ok_or_else(|| Error::NotFound(format!("proxy container for {clone}")))
    }

    /// Fills `port` via container inspection for clones missing the port
    /// property.
    pub async fn enrich_port(&self, clone: &mut PublicClone) -> Result<()> {
        if clone.port == 0 {
            clone.port = self.clone_port(&clone.name).await?;
        }
        Ok(())
    }
}
