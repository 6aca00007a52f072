//! Runtime configuration for gpu-lease.
//!
//! Configuration can be loaded from a JSON file or constructed
//! programmatically. All knobs (durable-state paths, lock timing,
//! inventory scraping) live here.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "gpu-lease",
    about = "Advisory exclusive-use leases for shared GPU partitions",
    version
)]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "/etc/gpu-lease.json")]
    pub config: PathBuf,

    /// Installation prefix holding the ledger and lock marker.
    #[arg(long)]
    pub prefix: Option<PathBuf>,

    /// Owner pid to act on behalf of (default: the parent process).
    #[arg(long)]
    pub owner: Option<u32>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Claim a free partition and print its identifier.
    Acquire,

    /// Drop the owner's claim, if any.
    Release,

    /// Show every partition with its claim state.
    Status,

    /// Claim a partition, export it, and exec a workload in place.
    Run {
        /// Command and arguments to exec.
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem locations for durable state.
    pub paths: PathsConfig,

    /// Gate acquisition tuning.
    pub lock: LockConfig,

    /// Partition discovery settings.
    pub inventory: InventoryConfig,
}

/// Where the ledger, lock marker, and allowlist live.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Installation prefix for durable state.
    pub prefix: PathBuf,

    /// Ledger file name under the prefix.
    pub ledger_file: String,

    /// Lock marker file name under the prefix.
    pub lock_file: String,

    /// Allowlist location; defaults to `<prefix>/allowlist`.
    pub allowlist: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            prefix: PathBuf::from("/var/lib/gpu-lease"),
            ledger_file: "leases".to_string(),
            lock_file: "leases.lock".to_string(),
            allowlist: None,
        }
    }
}

/// Gate acquisition timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Total time to wait for the gate before giving up, in ms.
    pub timeout_ms: u64,

    /// Poll interval while the gate is held elsewhere, in ms.
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            retry_interval_ms: 100,
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

/// Inventory command and scraping settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Listing command to run.
    pub command: String,

    /// Arguments passed to the listing command.
    pub args: Vec<String>,

    /// Keyword tagging partition lines in the listing output.
    pub keyword: String,

    /// Environment variable exported by `run` to pin the workload.
    pub env_var: String,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            command: "nvidia-smi".to_string(),
            args: vec!["-L".to_string()],
            keyword: "MIG".to_string(),
            env_var: "CUDA_VISIBLE_DEVICES".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults
    /// when the file is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }

    /// Full path of the claim ledger.
    pub fn ledger_path(&self) -> PathBuf {
        self.paths.prefix.join(&self.paths.ledger_file)
    }

    /// Full path of the lock marker.
    pub fn lock_path(&self) -> PathBuf {
        self.paths.prefix.join(&self.paths.lock_file)
    }

    /// Full path of the allowlist file.
    pub fn allowlist_path(&self) -> PathBuf {
        self.paths
            .allowlist
            .clone()
            .unwrap_or_else(|| self.paths.prefix.join("allowlist"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.lock.timeout_ms, 10_000);
        assert_eq!(cfg.inventory.keyword, "MIG");
        assert_eq!(cfg.ledger_path(), PathBuf::from("/var/lib/gpu-lease/leases"));
        assert_eq!(
            cfg.lock_path(),
            PathBuf::from("/var/lib/gpu-lease/leases.lock")
        );
    }

    #[test]
    fn test_allowlist_defaults_under_prefix() {
        let cfg = Config::default();
        assert_eq!(
            cfg.allowlist_path(),
            PathBuf::from("/var/lib/gpu-lease/allowlist")
        );

        let mut cfg = Config::default();
        cfg.paths.allowlist = Some(PathBuf::from("/etc/eligible-partitions"));
        assert_eq!(
            cfg.allowlist_path(),
            PathBuf::from("/etc/eligible-partitions")
        );
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{"lock": {"timeout_ms": 500}}"#).unwrap();
        assert_eq!(cfg.lock.timeout_ms, 500);
        assert_eq!(cfg.lock.retry_interval_ms, 100);
        assert_eq!(cfg.inventory.command, "nvidia-smi");
    }

    #[test]
    fn test_missing_config_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let cfg = Config::load(&tmp.path().join("gpu-lease.json")).unwrap();
        assert_eq!(cfg.inventory.keyword, "MIG");
    }
}
