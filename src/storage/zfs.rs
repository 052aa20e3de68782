//! ZFS-backed storage, driving the `zfs` and `zpool` command line tools.
//!
//! Output is requested in parsable form (`-Hp`) and read as tab-separated
//! columns. Dataset names are stored relative to the pool; the pool prefix
//! is attached on the way out and stripped on the way in.

use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::debug;

use super::{destroy_plan, props, DatasetInfo, DatasetTree, Storage};
use crate::names;
use crate::{Error, Result};

/// Tree listing columns, in the order they are parsed.
const TREE_COLUMNS: &str = "name,origin,mountpoint,\
zdap:created_at,zdap:owner,zdap:resource,zdap:snapped_at,\
zdap:clone_pooled,zdap:port,zdap:expires_at,zdap:healthy";

pub struct ZfsStorage {
    pool: String,
    lock: RwLock<()>,
}

impl ZfsStorage {
    pub fn new(pool: impl Into<String>) -> Self {
        Self {
            pool: pool.into(),
            lock: RwLock::new(()),
        }
    }

    fn full(&self, name: &str) -> String {
        format!("{}/{}", self.pool, name)
    }

    async fn zfs(&self, dataset: &str, args: &[&str]) -> Result<String> {
        run_tool("zfs", dataset, args).await
    }

    async fn read_tree(&self) -> Result<DatasetTree> {
        let out = self
            .zfs(
                &self.pool,
                &[
                    "list",
                    "-Hp",
                    "-t",
                    "filesystem,snapshot",
                    "-r",
                    "-o",
                    TREE_COLUMNS,
                    &self.pool,
                ],
            )
            .await?;
        Ok(parse_tree(&self.pool, &out))
    }

    async fn set_props(&self, dataset: &str, pairs: &[(&str, String)]) -> Result<()> {
        let full = self.full(dataset);
        let mut args = vec!["set".to_string()];
        for (key, value) in pairs {
            args.push(format!("{key}={value}"));
        }
        args.push(full.clone());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.zfs(&full, &args).await?;
        Ok(())
    }

    /// Mounts the dataset if ZFS has not already done so and returns the
    /// mountpoint. On any failure the dataset is unmounted before the error
    /// propagates so no mountpoint leaks.
    async fn mount_and_resolve(&self, dataset: &str) -> Result<PathBuf> {
        let full = self.full(dataset);
        match self.try_mount(&full).await {
            Ok(()) => {}
            Err(e) => {
                let _ = self.try_unmount(&full).await;
                return Err(e);
            }
        }
        match self
            .zfs(&full, &["get", "-Hp", "-o", "value", "mountpoint", &full])
            .await
        {
            Ok(out) => {
                let mp = out.trim();
                if mp.is_empty() || mp == "legacy" || mp == "none" || mp == "-" {
                    let _ = self.try_unmount(&full).await;
                    return Err(Error::storage(dataset, "dataset has no mountpoint"));
                }
                Ok(PathBuf::from(mp))
            }
            Err(e) => {
                let _ = self.try_unmount(&full).await;
                Err(e)
            }
        }
    }

    async fn try_mount(&self, full: &str) -> Result<()> {
        match self.zfs(full, &["mount", full]).await {
            Ok(_) => Ok(()),
            Err(Error::Storage { message, .. }) if message.contains("already mounted") => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn try_unmount(&self, full: &str) -> Result<()> {
        match self.zfs(full, &["unmount", "-f", full]).await {
            Ok(_) => Ok(()),
            // Snapshots and already unmounted datasets both end up here.
            Err(Error::Storage { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn get_prop(&self, dataset: &str, key: &str) -> Result<String> {
        let full = self.full(dataset);
        let out = self
            .zfs(&full, &["get", "-Hp", "-o", "value", key, &full])
            .await?;
        let value = out.trim().to_string();
        if value.is_empty() || value == "-" {
            return Err(Error::storage(dataset, format!("property {key} is unset")));
        }
        Ok(value)
    }

    async fn destroy_planned(&self, tree: &DatasetTree, name: &str) -> Result<()> {
        for ds in destroy_plan(tree, name) {
            let full = self.full(&ds);
            if !ds.contains('@') {
                self.try_unmount(&full).await?;
            }
            debug!(dataset = %full, "destroying");
            match self.zfs(&full, &["destroy", &full]).await {
                Ok(_) => {}
                Err(Error::Storage { message, .. }) if message.contains("does not exist") => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn pool_stats(&self) -> Result<(u64, u64, u64)> {
        let out = run_tool(
            "zpool",
            &self.pool,
            &["list", "-Hp", "-o", "allocated,free,size", &self.pool],
        )
        .await?;
        let fields: Vec<&str> = out.split_whitespace().collect();
        if fields.len() != 3 {
            return Err(Error::storage(
                &self.pool,
                format!("unexpected zpool list output: {out:?}"),
            ));
        }
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|e| Error::storage(&self.pool, format!("bad zpool number '{s}': {e}")))
        };
        Ok((parse(fields[0])?, parse(fields[1])?, parse(fields[2])?))
    }
}

async fn run_tool(tool: &str, dataset: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(tool).args(args).output().await?;
    if !output.status.success() {
        return Err(Error::storage(
            dataset,
            format!(
                "{tool} {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

fn parse_tree(pool: &str, out: &str) -> DatasetTree {
    let prefix = format!("{pool}/");
    let mut datasets = Vec::new();
    for line in out.lines() {
        let cols: Vec<&str> = line.split('\t').collect();
        if cols.len() < 11 {
            continue;
        }
        let Some(name) = cols[0].strip_prefix(&prefix) else {
            // The pool root itself.
            continue;
        };
        let origin = match cols[1] {
            "-" => None,
            o => o.strip_prefix(&prefix).map(str::to_string),
        };
        let mountpoint = match cols[2] {
            "-" | "legacy" | "none" => None,
            m => Some(m.to_string()),
        };
        let keys = [
            props::CREATED,
            props::OWNER,
            props::RESOURCE,
            props::SNAPPED,
            props::POOLED,
            props::PORT,
            props::EXPIRES,
            props::HEALTHY,
        ];
        let mut prop_map = BTreeMap::new();
        for (key, value) in keys.iter().zip(&cols[3..11]) {
            if *value != "-" && !value.is_empty() {
                prop_map.insert(key.to_string(), value.to_string());
            }
        }
        datasets.push(DatasetInfo {
            name: name.to_string(),
            origin,
            mountpoint,
            props: prop_map,
        });
    }
    DatasetTree { datasets }
}

#[async_trait]
impl Storage for ZfsStorage {
    async fn create_dataset(
        &self,
        name: &str,
        resource: &str,
        created_at: NaiveDateTime,
        fs_props: &BTreeMap<String, String>,
    ) -> Result<PathBuf> {
        let _guard = self.lock.write().await;
        let full = self.full(name);

        let mut args = vec!["create".to_string()];
        for (key, value) in fs_props {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(full.clone());
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.zfs(&full, &arg_refs).await?;

        let setup = self
            .set_props(
                name,
                &[
                    (props::RESOURCE, resource.to_string()),
                    (props::CREATED, names::format_name_ts(created_at)),
                ],
            )
            .await;
        if let Err(e) = setup {
            let _ = self.try_unmount(&full).await;
            return Err(e);
        }
        self.mount_and_resolve(name).await
    }

    async fn snap_dataset(
        &self,
        base: &str,
        resource: &str,
        created_at: NaiveDateTime,
    ) -> Result<()> {
        let _guard = self.lock.write().await;
        let snap = format!("{base}@snap");
        let full = self.full(&snap);
        self.zfs(&full, &["snapshot", &full]).await?;
        self.set_props(
            &snap,
            &[
                (props::RESOURCE, resource.to_string()),
                (props::CREATED, names::format_name_ts(created_at)),
            ],
        )
        .await
    }

    async fn clone_dataset(
        &self,
        snap: &str,
        owner: &str,
        port: u16,
        pooled: bool,
    ) -> Result<(String, PathBuf)> {
        let _guard = self.lock.write().await;

        let Some((base, _)) = snap.split_once('@') else {
            return Err(Error::InvalidArgument(format!(
                "snap name '{snap}' is not properly formatted"
            )));
        };
        let resource = self.get_prop(snap, props::RESOURCE).await?;
        let snapped_at = self.get_prop(snap, props::CREATED).await?;

        let created = Utc::now().naive_utc();
        let clone_name = format!(
            "{base}-clone-{}.{}",
            names::format_name_ts(created),
            names::clone_suffix()
        );

        let full_snap = self.full(snap);
        let full_clone = self.full(&clone_name);
        self.zfs(&full_clone, &["clone", &full_snap, &full_clone])
            .await?;

        let setup = self
            .set_props(
                &clone_name,
                &[
                    (props::OWNER, owner.to_string()),
                    (props::CREATED, names::format_name_ts(created)),
                    (props::RESOURCE, resource),
                    (props::SNAPPED, snapped_at),
                    (props::POOLED, pooled.to_string()),
                    (props::PORT, port.to_string()),
                ],
            )
            .await;
        if let Err(e) = setup {
            let _ = self.try_unmount(&full_clone).await;
            return Err(e);
        }

        let mountpoint = self.mount_and_resolve(&clone_name).await?;
        Ok((clone_name, mountpoint))
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        let tree = self.read_tree().await?;
        self.destroy_planned(&tree, name).await
    }

    async fn destroy_all(&self) -> Result<()> {
        let _guard = self.lock.write().await;
        let tree = self.read_tree().await?;

        let mut roots: Vec<&DatasetInfo> = tree
            .datasets
            .iter()
            .filter(|d| !d.name.contains('/') && !d.name.contains('@') && d.origin.is_none())
            .collect();
        roots.sort_by_key(|d| (d.name.len(), d.name.clone()));

        let mut gone: Vec<String> = Vec::new();
        for root in roots {
            if gone.iter().any(|g| g == &root.name) {
                continue;
            }
            for ds in destroy_plan(&tree, &root.name) {
                gone.push(ds);
            }
            self.destroy_planned(&tree, &root.name).await?;
        }
        Ok(())
    }

    async fn set_user_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.write().await;
        self.set_props(dataset, &[(key, value.to_string())]).await
    }

    async fn open(&self) -> Result<DatasetTree> {
        let _guard = self.lock.read().await;
        self.read_tree().await
    }

    async fn used_space(&self) -> Result<u64> {
        let _guard = self.lock.read().await;
        Ok(self.pool_stats().await?.0)
    }

    async fn free_space(&self) -> Result<u64> {
        let _guard = self.lock.read().await;
        Ok(self.pool_stats().await?.1)
    }

    async fn total_space(&self) -> Result<u64> {
        let _guard = self.lock.read().await;
        Ok(self.pool_stats().await?.2)
    }
}
