//! In-memory storage with the same clone/snapshot parentage rules as ZFS.
//!
//! Backs the test suites; mirrors the real adapter closely enough that the
//! pool scheduler and registry run unmodified against it.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{destroy_plan, props, DatasetInfo, DatasetTree, Storage};
use crate::names;
use crate::{Error, Result};

const TOTAL_SPACE: u64 = 1 << 40;
const SPACE_PER_DATASET: u64 = 256 << 20;

#[derive(Debug, Clone)]
struct MemDataset {
    origin: Option<String>,
    mountpoint: Option<String>,
    props: BTreeMap<String, String>,
}

#[derive(Default)]
pub struct MemStorage {
    datasets: Mutex<BTreeMap<String, MemDataset>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn tree_locked(datasets: &BTreeMap<String, MemDataset>) -> DatasetTree {
        DatasetTree {
            datasets: datasets
                .iter()
                .map(|(name, ds)| DatasetInfo {
                    name: name.clone(),
                    origin: ds.origin.clone(),
                    mountpoint: ds.mountpoint.clone(),
                    props: ds.props.clone(),
                })
                .collect(),
        }
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn create_dataset(
        &self,
        name: &str,
        resource: &str,
        created_at: NaiveDateTime,
        fs_props: &BTreeMap<String, String>,
    ) -> Result<PathBuf> {
        let mut datasets = self.datasets.lock();
        if datasets.contains_key(name) {
            return Err(Error::storage(name, "dataset already exists"));
        }
        let mut prop_map = fs_props.clone();
        prop_map.insert(props::RESOURCE.to_string(), resource.to_string());
        prop_map.insert(
            props::CREATED.to_string(),
            names::format_name_ts(created_at),
        );
        let mountpoint = format!("/zdap/{name}");
        datasets.insert(
            name.to_string(),
            MemDataset {
                origin: None,
                mountpoint: Some(mountpoint.clone()),
                props: prop_map,
            },
        );
        Ok(PathBuf::from(mountpoint))
    }

    async fn snap_dataset(
        &self,
        base: &str,
        resource: &str,
        created_at: NaiveDateTime,
    ) -> Result<()> {
        let mut datasets = self.datasets.lock();
        if !datasets.contains_key(base) {
            return Err(Error::storage(base, "dataset does not exist"));
        }
        let snap = format!("{base}@snap");
        if datasets.contains_key(&snap) {
            return Err(Error::storage(&snap, "dataset already exists"));
        }
        let mut prop_map = BTreeMap::new();
        prop_map.insert(props::RESOURCE.to_string(), resource.to_string());
        prop_map.insert(
            props::CREATED.to_string(),
            names::format_name_ts(created_at),
        );
        datasets.insert(
            snap,
            MemDataset {
                origin: None,
                mountpoint: None,
                props: prop_map,
            },
        );
        Ok(())
    }

    async fn clone_dataset(
        &self,
        snap: &str,
        owner: &str,
        port: u16,
        pooled: bool,
    ) -> Result<(String, PathBuf)> {
        let mut datasets = self.datasets.lock();
        let Some((base, _)) = snap.split_once('@') else {
            return Err(Error::InvalidArgument(format!(
                "snap name '{snap}' is not properly formatted"
            )));
        };
        let Some(snap_ds) = datasets.get(snap) else {
            return Err(Error::storage(snap, "snapshot does not exist"));
        };
        let resource = snap_ds
            .props
            .get(props::RESOURCE)
            .cloned()
            .unwrap_or_default();
        let snapped_at = snap_ds
            .props
            .get(props::CREATED)
            .cloned()
            .unwrap_or_default();

        let created = Utc::now().naive_utc();
        let clone_name = format!(
            "{base}-clone-{}.{}",
            names::format_name_ts(created),
            names::clone_suffix()
        );
        if datasets.contains_key(&clone_name) {
            return Err(Error::storage(&clone_name, "dataset already exists"));
        }

        let mut prop_map = BTreeMap::new();
        prop_map.insert(props::OWNER.to_string(), owner.to_string());
        prop_map.insert(props::CREATED.to_string(), names::format_name_ts(created));
        prop_map.insert(props::RESOURCE.to_string(), resource);
        prop_map.insert(props::SNAPPED.to_string(), snapped_at);
        prop_map.insert(props::POOLED.to_string(), pooled.to_string());
        prop_map.insert(props::PORT.to_string(), port.to_string());

        let mountpoint = format!("/zdap/{clone_name}");
        datasets.insert(
            clone_name.clone(),
            MemDataset {
                origin: Some(snap.to_string()),
                mountpoint: Some(mountpoint.clone()),
                props: prop_map,
            },
        );
        Ok((clone_name, PathBuf::from(mountpoint)))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let mut datasets = self.datasets.lock();
        let tree = Self::tree_locked(&datasets);
        for ds in destroy_plan(&tree, name) {
            datasets.remove(&ds);
        }
        Ok(())
    }

    async fn destroy_all(&self) -> Result<()> {
        let mut datasets = self.datasets.lock();
        let tree = Self::tree_locked(&datasets);
        let mut roots: Vec<String> = tree
            .datasets
            .iter()
            .filter(|d| !d.name.contains('/') && !d.name.contains('@') && d.origin.is_none())
            .map(|d| d.name.clone())
            .collect();
        roots.sort_by_key(|name| (name.len(), name.clone()));
        for root in roots {
            for ds in destroy_plan(&tree, &root) {
                datasets.remove(&ds);
            }
        }
        Ok(())
    }

    async fn set_user_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let mut datasets = self.datasets.lock();
        let Some(ds) = datasets.get_mut(dataset) else {
            return Err(Error::storage(dataset, "dataset does not exist"));
        };
        ds.props.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn open(&self) -> Result<DatasetTree> {
        Ok(Self::tree_locked(&self.datasets.lock()))
    }

    async fn used_space(&self) -> Result<u64> {
        Ok(self.datasets.lock().len() as u64 * SPACE_PER_DATASET)
    }

    async fn free_space(&self) -> Result<u64> {
        Ok(TOTAL_SPACE - self.used_space().await?)
    }

    async fn total_space(&self) -> Result<u64> {
        Ok(TOTAL_SPACE)
    }
}
