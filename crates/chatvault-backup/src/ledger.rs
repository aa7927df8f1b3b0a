//! Local persistent state: key records, backup history, activity log, settings.
//!
//! A single JSON file, rewritten atomically (temp file + rename) on every
//! mutation. Readers take a shared lock and get clones, so the UI can read
//! history while a backup runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId, BackupType};

use crate::error::Operation;
use crate::settings::BackupSettings;

/// Activity entries kept on disk
const MAX_ACTIVITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationReason {
    KeyRotation,
    DestinationChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum BackupOutcome {
    Completed,
    Migrated { reason: MigrationReason },
}

/// One completed backup. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHistoryEntry {
    pub backup_id: BackupId,
    pub destination: BackupDestination,
    pub backup_type: BackupType,
    pub parent_id: Option<BackupId>,
    /// Key the backup is sealed under
    pub key_id: String,
    /// Unix timestamp (ms) of the archive
    pub created_at: u64,
    /// Unix timestamp (ms) the destination confirmed the upload
    pub completed_at: u64,
    /// Sealed bytes stored remotely
    pub byte_size: u64,
    pub message_count: u64,
    pub chunk_count: usize,
    pub outcome: BackupOutcome,
}

/// One attempted operation, successful or not
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEntry {
    pub at: u64,
    pub operation: Operation,
    pub destination: Option<BackupDestination>,
    pub backup_id: Option<BackupId>,
    pub success: bool,
    /// Failure reason; never key material
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LedgerData {
    #[serde(default)]
    key_records: Vec<KeyRecord>,
    #[serde(default)]
    current_key_id: Option<String>,
    #[serde(default)]
    history: Vec<BackupHistoryEntry>,
    #[serde(default)]
    activity: Vec<ActivityEntry>,
    #[serde(default)]
    settings: Option<BackupSettings>,
}

pub struct Ledger {
    /// `None` keeps everything in memory
    path: Option<PathBuf>,
    data: RwLock<LedgerData>,
}

impl Ledger {
    /// Load or create a ledger at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading ledger: {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("parsing ledger: {}", path.display()))?
        } else {
            LedgerData::default()
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            data: RwLock::new(data),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            data: RwLock::new(LedgerData::default()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LedgerData> {
        self.data.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` and persist. On a failed write the in-memory state is
    /// rolled back so memory and disk never disagree.
    fn mutate<T>(&self, f: impl FnOnce(&mut LedgerData) -> T) -> Result<T> {
        let mut guard: RwLockWriteGuard<'_, LedgerData> =
            self.data.write().unwrap_or_else(|e| e.into_inner());
        let before = guard.clone();
        let out = f(&mut guard);
        if let Err(e) = self.flush(&guard) {
            *guard = before;
            return Err(e);
        }
        Ok(out)
    }

    fn flush(&self, data: &LedgerData) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating ledger dir: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(data).context("serializing ledger")?;
        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, json)
            .with_context(|| format!("writing ledger temp: {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("renaming ledger: {}", path.display()))?;
        Ok(())
    }

    // ── Keys ─────────────────────────────────────────────────────────────────

    pub fn current_key(&self) -> Option<KeyRecord> {
        let data = self.read();
        let id = data.current_key_id.as_ref()?;
        data.key_records.iter().find(|r| &r.key_id == id).cloned()
    }

    pub fn key_record(&self, key_id: &str) -> Option<KeyRecord> {
        self.read()
            .key_records
            .iter()
            .find(|r| r.key_id == key_id)
            .cloned()
    }

    pub fn key_records(&self) -> Vec<KeyRecord> {
        self.read().key_records.clone()
    }

    /// Append a key record (if new) and make it current.
    pub fn install_key(&self, record: KeyRecord) -> Result<()> {
        self.mutate(|data| {
            if !data.key_records.iter().any(|r| r.key_id == record.key_id) {
                data.key_records.push(record.clone());
            }
            data.current_key_id = Some(record.key_id);
        })
    }

    // ── History ──────────────────────────────────────────────────────────────

    pub fn history(&self) -> Vec<BackupHistoryEntry> {
        self.read().history.clone()
    }

    pub fn history_for(&self, destination: &BackupDestination) -> Vec<BackupHistoryEntry> {
        self.read()
            .history
            .iter()
            .filter(|e| &e.destination == destination)
            .cloned()
            .collect()
    }

    pub fn entry(&self, backup_id: &BackupId) -> Option<BackupHistoryEntry> {
        self.read()
            .history
            .iter()
            .find(|e| &e.backup_id == backup_id)
            .cloned()
    }

    /// Newest backup at `destination` sealed under `key_id`
    pub fn latest_for(
        &self,
        destination: &BackupDestination,
        key_id: &str,
    ) -> Option<BackupHistoryEntry> {
        self.read()
            .history
            .iter()
            .filter(|e| &e.destination == destination && e.key_id == key_id)
            .max_by_key(|e| (e.created_at, e.completed_at))
            .cloned()
    }

    /// Append a completed backup. Returns false if the id is already recorded.
    pub fn append_history(&self, entry: BackupHistoryEntry) -> Result<bool> {
        self.mutate(|data| {
            if data.history.iter().any(|e| e.backup_id == entry.backup_id) {
                return false;
            }
            data.history.push(entry);
            true
        })
    }

    /// Append a migration backup and switch the current key in one write.
    pub fn commit_key_rotation(&self, record: KeyRecord, entry: BackupHistoryEntry) -> Result<()> {
        self.mutate(|data| {
            if !data.key_records.iter().any(|r| r.key_id == record.key_id) {
                data.key_records.push(record.clone());
            }
            data.current_key_id = Some(record.key_id);
            if !data.history.iter().any(|e| e.backup_id == entry.backup_id) {
                data.history.push(entry);
            }
        })
    }

    /// Remove entries for `ids` at `destination`. Returns how many were removed.
    pub fn remove_history(&self, destination: &BackupDestination, ids: &[BackupId]) -> Result<usize> {
        self.mutate(|data| {
            let before = data.history.len();
            data.history
                .retain(|e| !(&e.destination == destination && ids.contains(&e.backup_id)));
            before - data.history.len()
        })
    }

    // ── Activity ─────────────────────────────────────────────────────────────

    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.read().activity.clone()
    }

    pub fn record_activity(&self, entry: ActivityEntry) -> Result<()> {
        self.mutate(|data| {
            data.activity.push(entry);
            if data.activity.len() > MAX_ACTIVITY {
                let excess = data.activity.len() - MAX_ACTIVITY;
                data.activity.drain(..excess);
            }
        })
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn settings(&self) -> Option<BackupSettings> {
        self.read().settings.clone()
    }

    pub fn save_settings(&self, settings: &BackupSettings) -> Result<()> {
        self.mutate(|data| data.settings = Some(settings.clone()))
    }
}
