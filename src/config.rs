//! Daemon configuration

use std::path::PathBuf;

/// Settings for a zdap daemon instance.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the copy-on-write pool holding all zdap datasets.
    pub zfs_pool: String,
    /// Directory containing `*.resource.yml` descriptors and their scripts.
    pub config_dir: PathBuf,
    /// Address clients should use to reach clones on this host.
    pub network_address: String,
    /// Port the HTTP API listens on and advertises to clients.
    pub api_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zfs_pool: "zdap".to_string(),
            config_dir: PathBuf::from("./resources"),
            network_address: "localhost".to_string(),
            api_port: 43210,
        }
    }
}

impl Config {
    pub fn validate(&self) -> crate::Result<()> {
        if self.zfs_pool.is_empty() {
            return Err(crate::Error::Config("zfs_pool cannot be empty".into()));
        }
        if self.network_address.is_empty() {
            return Err(crate::Error::Config(
                "network_address cannot be empty".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.api_port, 43210);
    }

    #[test]
    fn test_empty_pool_rejected() {
        let config = Config {
            zfs_pool: String::new(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
