//! Process-level RDMA settings.
//!
//! One immutable [`RdmaConfig`] is handed to the device context when it is
//! opened and lives as long as that context.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RdmaError, Result};

/// Prefix for environment overrides read by [`RdmaConfig::from_env`].
pub const ENV_PREFIX: &str = "NETRDMA_";

/// RDMA transport configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RdmaConfig {
    /// When false the owning process uses its non-RDMA path and no hardware
    /// is touched.
    pub enabled: bool,
    /// RDMA device name (e.g., "mlx5_0").
    pub device: String,
    /// Port number on the device, starting at 1.
    pub port: u8,
    /// Index into the port's GID table used for addressing.
    pub gid_index: u8,
    /// Size of the shared buffer registered with the device.
    pub shm_size: usize,
    /// Path whose presence signals that the listener's info is published.
    pub ready_file: PathBuf,
    /// Path holding the listener's serialized connection info.
    pub info_file: PathBuf,
    /// Upper bound on waiting for the peer during listen/connect.
    pub rendezvous_timeout_ms: u64,
    /// First sleep between side-channel polls.
    pub poll_initial_ms: u64,
    /// Ceiling for the exponential poll backoff.
    pub poll_max_ms: u64,
    /// Completion queue depth.
    pub cq_depth: u32,
    /// Outstanding send work requests per queue pair.
    pub max_send_wr: u32,
    /// Completions fetched per poll while draining.
    pub drain_batch: usize,
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            device: "mlx5_0".to_string(),
            port: 1,
            gid_index: 0,
            shm_size: 64 * 1024 * 1024,
            ready_file: PathBuf::from("/tmp/netrdma.ready"),
            info_file: PathBuf::from("/tmp/netrdma.info"),
            rendezvous_timeout_ms: 30_000,
            poll_initial_ms: 1,
            poll_max_ms: 100,
            cq_depth: 1024,
            max_send_wr: 256,
            drain_batch: 32,
        }
    }
}

impl RdmaConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| RdmaError::InvalidConfig {
            reason: format!("cannot read {}: {}", path.display(), e),
        })?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: RdmaConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| RdmaError::InvalidConfig {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| RdmaError::InvalidConfig {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(RdmaError::InvalidConfig {
                    reason: format!("unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NETRDMA_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(std::env::vars())
    }

    /// Applies `NETRDMA_*` overrides from an arbitrary key/value source.
    pub fn with_overrides<I, K, V>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "ENABLED" => self.enabled = parse_bool(name, value)?,
                "DEVICE" => self.device = value.to_string(),
                "PORT" => self.port = parse_num(name, value)?,
                "GID_INDEX" => self.gid_index = parse_num(name, value)?,
                "SHM_SIZE" => self.shm_size = parse_num(name, value)?,
                "READY_FILE" => self.ready_file = PathBuf::from(value),
                "INFO_FILE" => self.info_file = PathBuf::from(value),
                "TIMEOUT_MS" => self.rendezvous_timeout_ms = parse_num(name, value)?,
                "POLL_INITIAL_MS" => self.poll_initial_ms = parse_num(name, value)?,
                "POLL_MAX_MS" => self.poll_max_ms = parse_num(name, value)?,
                "CQ_DEPTH" => self.cq_depth = parse_num(name, value)?,
                "MAX_SEND_WR" => self.max_send_wr = parse_num(name, value)?,
                "DRAIN_BATCH" => self.drain_batch = parse_num(name, value)?,
                _ => tracing::debug!(variable = name, "ignoring unknown netrdma variable"),
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Rejects settings the device context could never honor.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(RdmaError::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.device.is_empty() {
            return invalid("device name is empty");
        }
        if self.port == 0 {
            return invalid("port numbers start at 1");
        }
        if self.shm_size == 0 {
            return invalid("shm_size must be non-zero");
        }
        if self.ready_file.as_os_str().is_empty() || self.info_file.as_os_str().is_empty() {
            return invalid("side channel paths must be set");
        }
        if self.ready_file == self.info_file {
            return invalid("ready_file and info_file must differ");
        }
        if self.cq_depth == 0 || self.max_send_wr == 0 || self.drain_batch == 0 {
            return invalid("queue depths must be non-zero");
        }
        if self.poll_initial_ms == 0 || self.poll_initial_ms > self.poll_max_ms {
            return invalid("poll backoff bounds are inverted or zero");
        }
        Ok(())
    }

    /// How long each side waits for its peer.
    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    /// First delay between side-channel polls.
    pub fn poll_initial(&self) -> Duration {
        Duration::from_millis(self.poll_initial_ms)
    }

    /// Cap on the delay between polls.
    pub fn poll_max(&self) -> Duration {
        Duration::from_millis(self.poll_max_ms)
    }
}

fn parse_num<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| RdmaError::InvalidConfig {
        reason: format!("{}{} is not a valid number: {:?}", ENV_PREFIX, name, value),
    })
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(RdmaError::InvalidConfig {
            reason: format!("{}{} is not a boolean: {:?}", ENV_PREFIX, name, value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = RdmaConfig::default();
        assert!(config.enabled);
        assert_eq!(config.device, "mlx5_0");
        assert_eq!(config.port, 1);
        assert_eq!(config.gid_index, 0);
        assert_eq!(config.shm_size, 64 * 1024 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars = vec![
            ("NETRDMA_DEVICE", "mock0"),
            ("NETRDMA_PORT", "2"),
            ("NETRDMA_GID_INDEX", "3"),
            ("NETRDMA_SHM_SIZE", "4096"),
            ("NETRDMA_ENABLED", "off"),
            ("NETRDMA_READY_FILE", "/run/a.ready"),
            ("HOME", "/root"),
        ];
        let config = RdmaConfig::default().with_overrides(vars).unwrap();
        assert_eq!(config.device, "mock0");
        assert_eq!(config.port, 2);
        assert_eq!(config.gid_index, 3);
        assert_eq!(config.shm_size, 4096);
        assert!(!config.enabled);
        assert_eq!(config.ready_file, PathBuf::from("/run/a.ready"));
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let err = RdmaConfig::default()
            .with_overrides(vec![("NETRDMA_PORT", "one")])
            .unwrap_err();
        assert!(matches!(err, RdmaError::InvalidConfig { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_size() {
        let config = RdmaConfig {
            shm_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_port_zero_and_shared_paths() {
        let config = RdmaConfig {
            port: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RdmaConfig {
            ready_file: PathBuf::from("/tmp/same"),
            info_file: PathBuf::from("/tmp/same"),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
device = "mock0"
port = 1
gid_index = 0
shm_size = 4096
ready_file = "/tmp/x.ready"
info_file = "/tmp/x.info"
rendezvous_timeout_ms = 500
            "#
        )
        .unwrap();

        let config = RdmaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device, "mock0");
        assert_eq!(config.shm_size, 4096);
        assert_eq!(config.rendezvous_timeout(), Duration::from_millis(500));
        assert_eq!(config.cq_depth, 1024);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"device": "mock1", "port": 2, "enabled": false}}"#).unwrap();

        let config = RdmaConfig::from_file(file.path()).unwrap();
        assert_eq!(config.device, "mock1");
        assert_eq!(config.port, 2);
        assert!(!config.enabled);
    }

    #[test]
    fn test_from_file_unknown_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        assert!(RdmaConfig::from_file(file.path()).is_err());
    }
}
