//! Storage capability: copy-on-write dataset create/snapshot/clone/destroy.
//!
//! The daemon keeps no database; dataset names and user properties are the
//! authoritative state. This module defines the capability trait, the
//! decoded tree handle reads go through, and the property keys.

use async_trait::async_trait;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::names;
use crate::Result;

mod mem;
mod zfs;

pub use mem::MemStorage;
pub use zfs::ZfsStorage;

/// User property keys carried on zdap datasets.
pub mod props {
    pub const CREATED: &str = "zdap:created_at";
    pub const OWNER: &str = "zdap:owner";
    pub const RESOURCE: &str = "zdap:resource";
    pub const SNAPPED: &str = "zdap:snapped_at";
    pub const POOLED: &str = "zdap:clone_pooled";
    pub const PORT: &str = "zdap:port";
    pub const EXPIRES: &str = "zdap:expires_at";
    pub const HEALTHY: &str = "zdap:healthy";
}

/// One dataset as listed from the pool, name relative to the pool root.
#[derive(Debug, Clone)]
pub struct DatasetInfo {
    pub name: String,
    /// The snapshot this dataset was cloned from, if any.
    pub origin: Option<String>,
    pub mountpoint: Option<String>,
    pub props: BTreeMap<String, String>,
}

impl DatasetInfo {
    pub fn prop(&self, key: &str) -> Option<&str> {
        self.props.get(key).map(String::as_str)
    }
}

/// A point-in-time snapshot of the dataset tree.
///
/// Produced by [`Storage::open`]; dropped when done. All listings filter it
/// by the canonical name regexes.
#[derive(Debug, Clone, Default)]
pub struct DatasetTree {
    pub datasets: Vec<DatasetInfo>,
}

impl DatasetTree {
    pub fn get(&self, name: &str) -> Option<&DatasetInfo> {
        self.datasets.iter().find(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.datasets.iter().map(|d| d.name.clone()).collect()
    }

    pub fn list_bases(&self) -> Vec<&DatasetInfo> {
        self.datasets
            .iter()
            .filter(|d| names::is_base(&d.name))
            .collect()
    }

    pub fn list_snaps(&self) -> Vec<&DatasetInfo> {
        self.datasets
            .iter()
            .filter(|d| names::is_snap(&d.name))
            .collect()
    }

    pub fn list_clones(&self) -> Vec<&DatasetInfo> {
        self.datasets
            .iter()
            .filter(|d| names::is_clone(&d.name))
            .collect()
    }
}

/// Datasets to destroy, in order, so that dependents always precede the
/// dataset they depend on: clones first, then snapshots, then child
/// filesystems, then the dataset itself. Unknown names yield an empty plan,
/// which is what makes destroy idempotent.
pub fn destroy_plan(tree: &DatasetTree, name: &str) -> Vec<String> {
    let mut plan = Vec::new();
    collect_destroy(tree, name, &mut plan);
    plan
}

fn collect_destroy(tree: &DatasetTree, name: &str, plan: &mut Vec<String>) {
    if !tree.contains(name) || plan.iter().any(|p| p == name) {
        return;
    }
    let snap_prefix = format!("{name}@");
    let child_prefix = format!("{name}/");

    // Clones hanging off this dataset (or off this snapshot directly).
    let clones: Vec<String> = tree
        .datasets
        .iter()
        .filter(|d| {
            d.origin
                .as_deref()
                .is_some_and(|o| o == name || o.starts_with(&snap_prefix))
        })
        .map(|d| d.name.clone())
        .collect();
    for clone in clones {
        collect_destroy(tree, &clone, plan);
    }

    let snaps: Vec<String> = tree
        .datasets
        .iter()
        .filter(|d| d.name.starts_with(&snap_prefix))
        .map(|d| d.name.clone())
        .collect();
    for snap in snaps {
        collect_destroy(tree, &snap, plan);
    }

    let children: Vec<String> = tree
        .datasets
        .iter()
        .filter(|d| {
            d.name
                .strip_prefix(&child_prefix)
                .is_some_and(|rest| !rest.contains('/') && !rest.contains('@'))
        })
        .map(|d| d.name.clone())
        .collect();
    for child in children {
        collect_destroy(tree, &child, plan);
    }

    plan.push(name.to_string());
}

/// Copy-on-write dataset operations.
///
/// Mutating operations serialize behind a single writer lock inside each
/// implementation; `open` and the space accessors take it shared.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Creates a mounted filesystem carrying `zdap:resource` and
    /// `zdap:created_at`, returning its mountpoint. Name collisions fail.
    async fn create_dataset(
        &self,
        name: &str,
        resource: &str,
        created_at: NaiveDateTime,
        fs_props: &BTreeMap<String, String>,
    ) -> Result<PathBuf>;

    /// Creates `<base>@snap` copying the resource and creation time onto it.
    async fn snap_dataset(
        &self,
        base: &str,
        resource: &str,
        created_at: NaiveDateTime,
    ) -> Result<()>;

    /// Clones a snapshot into `<base>-clone-<now>.<rand3>`, setting owner,
    /// resource, timestamps, pooling flag and proxy port, and mounting it.
    async fn clone_dataset(
        &self,
        snap: &str,
        owner: &str,
        port: u16,
        pooled: bool,
    ) -> Result<(String, PathBuf)>;

    /// Recursively unmounts and destroys a dataset and everything depending
    /// on it. A second destroy of the same name is a no-op.
    async fn destroy(&self, name: &str) -> Result<()>;

    /// Destroys every non-clone root, shortest path first.
    async fn destroy_all(&self) -> Result<()>;

    async fn set_user_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;

    /// Reads the whole tree once. Drop the returned handle when done.
    async fn open(&self) -> Result<DatasetTree>;

    async fn used_space(&self) -> Result<u64>;
    async fn free_space(&self) -> Result<u64>;
    async fn total_space(&self) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ds(name: &str, origin: Option<&str>) -> DatasetInfo {
        DatasetInfo {
            name: name.to_string(),
            origin: origin.map(str::to_string),
            mountpoint: None,
            props: BTreeMap::new(),
        }
    }

    #[test]
    fn test_destroy_plan_orders_dependents_first() {
        let base = "zdap-pg-base-2024-01-02T03.04.05";
        let snap = "zdap-pg-base-2024-01-02T03.04.05@snap";
        let clone = "zdap-pg-base-2024-01-02T03.04.05-clone-2024-01-02T04.00.00.abc";
        let tree = DatasetTree {
            datasets: vec![ds(base, None), ds(snap, None), ds(clone, Some(snap))],
        };

        let plan = destroy_plan(&tree, base);
        assert_eq!(plan, vec![clone, snap, base]);
    }

    #[test]
    fn test_destroy_plan_unknown_dataset_is_empty() {
        let tree = DatasetTree::default();
        assert!(destroy_plan(&tree, "zdap-pg-base-2024-01-02T03.04.05").is_empty());
    }

    #[test]
    fn test_destroy_plan_child_filesystems() {
        let tree = DatasetTree {
            datasets: vec![ds("a", None), ds("a/b", None), ds("a/b/c", None)],
        };
        assert_eq!(destroy_plan(&tree, "a"), vec!["a/b/c", "a/b", "a"]);
    }
}
