use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::{ChatvaultError, ChatvaultResult};
use crate::key_record::KdfParams;
use crate::types::{BackupDestination, BackupFrequency};

/// Top-level configuration (loaded from chatvault.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatvaultConfig {
    pub logging: LoggingConfig,
    pub account: AccountConfig,
    pub storage: StorageConfig,
    pub third_party: ThirdPartyConfig,
    pub kdf: KdfConfig,
    pub backup: BackupConfig,
    pub auto_backup: AutoBackupConfig,
    pub settings: SettingsConfig,
}

impl ChatvaultConfig {
    pub fn from_toml_str(s: &str) -> ChatvaultResult<Self> {
        toml::from_str(s).map_err(|e| ChatvaultError::Config(format!("parsing config: {e}")))
    }

    /// Load from `path`, falling back to defaults when the file is missing.
    pub fn load(path: &Path) -> ChatvaultResult<Self> {
        if !path.exists() {
            tracing::warn!(
                "config file not found: {}  (using defaults)",
                path.display()
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| ChatvaultError::Config(format!("{}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountConfig {
    /// Account identifier; scopes remote paths
    pub account_id: String,
    /// Local ledger file (key records, history, activity log)
    pub state_file: PathBuf,
}

/// First-party (our servers) S3-compatible storage
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    /// Root prefix inside the bucket
    pub root: String,
    /// Enforce HTTPS (error on HTTP endpoints)
    pub enforce_tls: bool,
}

/// Third-party storage, reached through an OpenDAL service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThirdPartyConfig {
    /// Provider destination string: "google_drive", "icloud", "third_party:<name>"
    pub provider: String,
    /// OpenDAL scheme backing the provider (e.g. "fs", "s3")
    pub scheme: String,
    /// Root prefix inside the provider
    pub root: String,
    /// Scheme-specific options passed to OpenDAL
    pub options: BTreeMap<String, String>,
}

/// Argon2id parameters for newly created keys
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KdfConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl KdfConfig {
    pub fn params(&self) -> KdfParams {
        KdfParams {
            mem_cost_kib: self.argon2_mem_cost_kib,
            time_cost: self.argon2_time_cost,
            parallelism: self.argon2_parallelism,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Maximum chunk payload size in bytes (a single oversized message still
    /// gets a chunk of its own)
    pub max_chunk_bytes: usize,
    /// zstd-compress chunk payloads before sealing
    pub compress: bool,
    pub compression_level: i32,
    /// Chunk uploads in flight at once
    pub upload_concurrency: usize,
    /// Attempts per chunk before giving up
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoBackupConfig {
    pub enabled: bool,
    pub frequency: BackupFrequency,
    /// Only run automatic backups on Wi-Fi
    pub wifi_only: bool,
}

/// User-selected backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    pub backups_enabled: bool,
    pub destination: BackupDestination,
    pub third_party_acknowledged: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self {
            account_id: "default".into(),
            state_file: PathBuf::from("~/.local/share/chatvault/state.json"),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "chatvault".into(),
            root: "backups".into(),
            enforce_tls: false,
        }
    }
}

impl Default for ThirdPartyConfig {
    fn default() -> Self {
        Self {
            provider: "google_drive".into(),
            scheme: "fs".into(),
            root: "chatvault".into(),
            options: BTreeMap::new(),
        }
    }
}

impl Default for KdfConfig {
    fn default() -> Self {
        let params = KdfParams::default();
        Self {
            argon2_mem_cost_kib: params.mem_cost_kib,
            argon2_time_cost: params.time_cost,
            argon2_parallelism: params.parallelism,
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            max_chunk_bytes: 1024 * 1024,
            compress: true,
            compression_level: 3,
            upload_concurrency: 4,
            max_attempts: 5,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 10_000,
        }
    }
}

impl Default for AutoBackupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: BackupFrequency::Daily,
            wifi_only: true,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            backups_enabled: true,
            destination: BackupDestination::OurServers,
            third_party_acknowledged: false,
        }
    }
}
