//! Resource descriptors and their on-disk `*.resource.yml` form.
//!
//! A resource is an immutable recipe: how to produce a base dataset for a
//! database (image, retrieval/creation scripts, healthcheck), how clones of
//! it should run, and an optional pre-warmed clone pool policy.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

/// Applied when `claim_max_ttl_s` is left unset: 25 hours.
pub const DEFAULT_CLAIM_MAX_TTL_S: u64 = 90_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub name: String,
    #[serde(default)]
    pub alias: String,
    /// Cron expression scheduling base rebuilds; empty disables the job.
    #[serde(default)]
    pub cron: String,
    /// Host-side executable producing the data to load, resolved relative to
    /// the config dir. Its stdout becomes the first creation-script argument.
    pub retrieval: String,
    /// Host-side executable loading the retrieved data into the running base
    /// container. Args: retrieval output, base dataset name.
    pub creation: String,
    pub docker: DockerSpec,
    /// Filesystem properties set on base datasets at creation.
    #[serde(default)]
    pub base_fs: BTreeMap<String, String>,
    /// Filesystem properties set on clone datasets after cloning.
    #[serde(default)]
    pub clone_fs: BTreeMap<String, String>,
    #[serde(default)]
    pub clone_pool: ClonePoolSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSpec {
    pub image: String,
    /// Port the database listens on inside the container.
    pub port: u16,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
    /// Mount path for the dataset inside the container.
    pub volume: String,
    /// Shell command reporting database readiness.
    pub healthcheck: String,
    /// Optional /dev/shm size in bytes.
    #[serde(default)]
    pub shm: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ClonePoolSpec {
    /// Pre-warmed clones to keep available. The pool is active iff > 0.
    #[serde(rename = "min", default)]
    pub min_clones: usize,
    /// Hard cap on pooled clones in any state.
    #[serde(rename = "max", default)]
    pub max_clones: usize,
    #[serde(default)]
    pub claim_max_ttl_s: u64,
    #[serde(default)]
    pub default_ttl_s: u64,
    /// Expire pooled clones built from superseded snapshots.
    #[serde(default)]
    pub reset_on_new_snap: bool,
}

impl ClonePoolSpec {
    pub fn active(&self) -> bool {
        self.min_clones > 0
    }
}

fn resource_name_reg() -> &'static Regex {
    static REG: OnceLock<Regex> = OnceLock::new();
    REG.get_or_init(|| Regex::new("^[a-z0-9][a-z0-9-]*$").unwrap())
}

impl Resource {
    /// Applies load-time defaults and checks the fields a broken descriptor
    /// would otherwise smuggle into dataset names and shell commands.
    pub fn validate(&mut self) -> Result<()> {
        if !resource_name_reg().is_match(&self.name) {
            return Err(Error::Config(format!(
                "resource name '{}' must match [a-z0-9][a-z0-9-]*",
                self.name
            )));
        }
        if self.docker.image.is_empty() {
            return Err(Error::Config(format!(
                "resource '{}' has no docker image",
                self.name
            )));
        }
        if self.docker.volume.is_empty() {
            return Err(Error::Config(format!(
                "resource '{}' has no docker volume path",
                self.name
            )));
        }
        if self.docker.port == 0 {
            return Err(Error::Config(format!(
                "resource '{}' has no docker port",
                self.name
            )));
        }
        if self.clone_pool.active() && self.clone_pool.max_clones < self.clone_pool.min_clones {
            return Err(Error::Config(format!(
                "resource '{}' clone_pool max {} is below min {}",
                self.name, self.clone_pool.max_clones, self.clone_pool.min_clones
            )));
        }
        if self.clone_pool.claim_max_ttl_s == 0 {
            self.clone_pool.claim_max_ttl_s = DEFAULT_CLAIM_MAX_TTL_S;
        }
        Ok(())
    }
}

/// Loads every `*.resource.yml` under `dir`, walking subdirectories.
pub fn load_resources(dir: &Path) -> Result<Vec<Resource>> {
    let mut paths = Vec::new();
    collect_resource_files(dir, &mut paths)?;
    paths.sort();

    let mut resources: Vec<Resource> = Vec::new();
    for path in paths {
        let body = std::fs::read_to_string(&path)?;
        let mut resource: Resource = serde_yaml::from_str(&body)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        resource.validate()?;
        if resources.iter().any(|r| r.name == resource.name) {
            return Err(Error::Config(format!(
                "duplicate resource name '{}' in {}",
                resource.name,
                path.display()
            )));
        }
        resources.push(resource);
    }
    Ok(resources)
}

fn collect_resource_files(dir: &Path, out: &mut Vec<std::path::PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_resource_files(&path, out)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".resource.yml"))
        {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    const POSTGRES_YML: &str = r#"
name: postgres-trade
alias: pgt
cron: "0 2 * * *"
retrieval: scripts/retrieve.sh
creation: scripts/create.sh
docker:
  image: postgres:14
  port: 5432
  env:
    - POSTGRES_PASSWORD=zdap
  volume: /var/lib/postgresql/data
  healthcheck: pg_isready -U postgres
clone_pool:
  min: 8
  max: 16
  default_ttl_s: 600
  reset_on_new_snap: true
"#;

    #[test]
    fn test_parse_resource_yaml() {
        let mut r: Resource = serde_yaml::from_str(POSTGRES_YML).unwrap();
        r.validate().unwrap();
        assert_eq!(r.name, "postgres-trade");
        assert_eq!(r.alias, "pgt");
        assert_eq!(r.clone_pool.min_clones, 8);
        assert_eq!(r.clone_pool.max_clones, 16);
        assert!(r.clone_pool.reset_on_new_snap);
        assert_eq!(r.docker.port, 5432);
    }

    #[test]
    fn test_claim_max_ttl_default_applied() {
        let mut r: Resource = serde_yaml::from_str(POSTGRES_YML).unwrap();
        r.validate().unwrap();
        assert_eq!(r.clone_pool.claim_max_ttl_s, DEFAULT_CLAIM_MAX_TTL_S);
    }

    #[test]
    fn test_bad_resource_name_rejected() {
        let mut r: Resource = serde_yaml::from_str(POSTGRES_YML).unwrap();
        r.name = "Bad Name!".to_string();
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_pool_max_below_min_rejected() {
        let mut r: Resource = serde_yaml::from_str(POSTGRES_YML).unwrap();
        r.clone_pool.min_clones = 4;
        r.clone_pool.max_clones = 2;
        assert!(r.validate().is_err());
    }

    #[test]
    fn test_load_resources_walks_subdirectories() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("nested");
        fs::create_dir(&nested).unwrap();
        fs::write(nested.join("postgres-trade.resource.yml"), POSTGRES_YML).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let resources = load_resources(dir.path()).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "postgres-trade");
    }

    #[test]
    fn test_load_resources_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.resource.yml"), POSTGRES_YML).unwrap();
        fs::write(dir.path().join("b.resource.yml"), POSTGRES_YML).unwrap();
        assert!(load_resources(dir.path()).is_err());
    }
}
