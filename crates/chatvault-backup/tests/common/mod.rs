//! Shared fixtures: in-memory destinations, fast KDF settings, and an
//! adapter wrapper that counts calls, injects transient failures and slows
//! uploads down.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opendal::Operator;

use chatvault_backup::{BackupOrchestrator, Ledger, StaticSource};
use chatvault_core::config::ChatvaultConfig;
use chatvault_core::key_record::KeyRecord;
use chatvault_core::types::{BackupDestination, BackupId, MessageRecord, ThirdPartyProvider};
use chatvault_core::wire::{BlobRef, EncryptedChunk, SealedManifest};
use chatvault_storage::{
    ChunkReceipt, DestinationAdapter, OurServersAdapter, RemoteBackupSummary, StorageError,
    ThirdPartyAdapter,
};

pub const PIN: &str = "48213976";
pub const OTHER_PIN: &str = "59320187";

pub fn memory_op() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

/// Light Argon2id and near-zero backoff so tests run quickly
pub fn fast_config() -> ChatvaultConfig {
    let mut config = ChatvaultConfig::default();
    config.kdf.argon2_mem_cost_kib = 1024;
    config.kdf.argon2_time_cost = 1;
    config.kdf.argon2_parallelism = 1;
    config.backup.max_attempts = 3;
    config.backup.retry_base_delay_ms = 1;
    config.backup.retry_max_delay_ms = 5;
    config
}

pub fn msg(id: &str, ts: i64, content: &str) -> MessageRecord {
    MessageRecord {
        id: id.into(),
        conversation_id: "conv-1".into(),
        sender_id: "alice".into(),
        content: content.into(),
        timestamp: ts,
    }
}

/// Three messages handed over out of order
pub fn three_messages() -> Vec<MessageRecord> {
    vec![
        msg("m2", 1_700_000_002_000, "see you at noon"),
        msg("m1", 1_700_000_001_000, "lunch tomorrow?"),
        msg("m3", 1_700_000_003_000, "👍"),
    ]
}

/// `n` messages of roughly `size` bytes each
pub fn many_messages(n: usize, size: usize) -> Vec<MessageRecord> {
    (0..n)
        .map(|i| msg(&format!("m{i:04}"), 1_700_000_000_000 + i as i64, &"x".repeat(size)))
        .collect()
}

pub fn transient(action: &str) -> StorageError {
    StorageError::Unavailable {
        destination: "test".into(),
        action: action.into(),
        message: "connection reset".into(),
        transient: true,
    }
}

/// Wraps a real adapter with call counting and fault injection.
pub struct TestAdapter {
    inner: Arc<dyn DestinationAdapter>,
    calls: AtomicUsize,
    chunk_puts: AtomicUsize,
    chunk_gets: AtomicUsize,
    /// The next `n` put_chunk calls fail transiently
    failing_puts: AtomicU32,
    /// Every put_chunk fails transiently while set
    always_fail_puts: std::sync::atomic::AtomicBool,
    put_delay_ms: AtomicU64,
}

impl TestAdapter {
    pub fn new(inner: Arc<dyn DestinationAdapter>) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
            chunk_puts: AtomicUsize::new(0),
            chunk_gets: AtomicUsize::new(0),
            failing_puts: AtomicU32::new(0),
            always_fail_puts: std::sync::atomic::AtomicBool::new(false),
            put_delay_ms: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }

    /// Successful and failed put_chunk attempts
    pub fn chunk_puts(&self) -> usize {
        self.chunk_puts.load(Ordering::SeqCst)
    }

    pub fn chunk_gets(&self) -> usize {
        self.chunk_gets.load(Ordering::SeqCst)
    }

    pub fn fail_next_puts(&self, n: u32) {
        self.failing_puts.store(n, Ordering::SeqCst);
    }

    pub fn fail_all_puts(&self, on: bool) {
        self.always_fail_puts.store(on, Ordering::SeqCst);
    }

    pub fn slow_puts(&self, delay: Duration) {
        self.put_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn hit(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DestinationAdapter for TestAdapter {
    fn destination(&self) -> &BackupDestination {
        self.inner.destination()
    }

    async fn put_chunk(&self, chunk: &EncryptedChunk) -> Result<ChunkReceipt, StorageError> {
        self.hit();
        self.chunk_puts.fetch_add(1, Ordering::SeqCst);
        let delay = self.put_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.always_fail_puts.load(Ordering::SeqCst) {
            return Err(transient("put_chunk"));
        }
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(transient("put_chunk"));
        }
        self.inner.put_chunk(chunk).await
    }

    async fn chunk_exists(&self, blob: &BlobRef) -> Result<bool, StorageError> {
        self.hit();
        self.inner.chunk_exists(blob).await
    }

    async fn get_chunk(&self, blob: &BlobRef) -> Result<Vec<u8>, StorageError> {
        self.hit();
        self.chunk_gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_chunk(blob).await
    }

    async fn put_manifest(&self, manifest: &SealedManifest) -> Result<BackupId, StorageError> {
        self.hit();
        self.inner.put_manifest(manifest).await
    }

    async fn get_manifest(&self, id: &BackupId) -> Result<SealedManifest, StorageError> {
        self.hit();
        self.inner.get_manifest(id).await
    }

    async fn delete(&self, id: &BackupId) -> Result<(), StorageError> {
        self.hit();
        self.inner.delete(id).await
    }

    async fn list(&self) -> Result<Vec<RemoteBackupSummary>, StorageError> {
        self.hit();
        self.inner.list().await
    }

    async fn put_key_record(&self, record: &KeyRecord) -> Result<(), StorageError> {
        self.hit();
        self.inner.put_key_record(record).await
    }

    async fn get_key_record(&self, key_id: &str) -> Result<KeyRecord, StorageError> {
        self.hit();
        self.inner.get_key_record(key_id).await
    }
}

/// An orchestrator wired to in-memory destinations
pub struct Harness {
    pub orchestrator: BackupOrchestrator,
    pub source: Arc<StaticSource>,
    /// Our servers, wrapped
    pub ours: Arc<TestAdapter>,
    /// Raw operator behind `ours`, for tampering with stored objects
    pub ours_op: Operator,
    pub ours_prefix: String,
    /// Google Drive through a second in-memory operator
    pub drive: Arc<TestAdapter>,
}

impl Harness {
    pub fn new(messages: Vec<MessageRecord>) -> Self {
        Self::with_config(fast_config(), messages)
    }

    pub fn with_config(config: ChatvaultConfig, messages: Vec<MessageRecord>) -> Self {
        Self::with_ledger(config, Ledger::in_memory(), messages)
    }

    pub fn with_ledger(config: ChatvaultConfig, ledger: Ledger, messages: Vec<MessageRecord>) -> Self {
        let source = Arc::new(StaticSource::new(messages));
        let orchestrator = BackupOrchestrator::new(&config, ledger, source.clone());

        let servers = OurServersAdapter::new(memory_op(), "backups", "acct-1");
        let ours_op = servers.operator().clone();
        let ours_prefix = servers.prefix().to_string();
        let ours = Arc::new(TestAdapter::new(Arc::new(servers)));

        let drive = Arc::new(TestAdapter::new(Arc::new(ThirdPartyAdapter::new(
            ThirdPartyProvider::GoogleDrive,
            memory_op(),
            "chatvault",
            "acct-1",
        ))));

        orchestrator.register_adapter(ours.clone());
        orchestrator.register_adapter(drive.clone());
        Self {
            orchestrator,
            source,
            ours,
            ours_op,
            ours_prefix,
            drive,
        }
    }

    /// A second orchestrator with an empty ledger, reading the same destinations
    pub fn new_device(&self) -> BackupOrchestrator {
        let orchestrator = BackupOrchestrator::new(
            &fast_config(),
            Ledger::in_memory(),
            Arc::new(StaticSource::default()),
        );
        orchestrator.register_adapter(self.ours.clone());
        orchestrator.register_adapter(self.drive.clone());
        orchestrator
    }

    pub fn drive_destination() -> BackupDestination {
        BackupDestination::ThirdParty(ThirdPartyProvider::GoogleDrive)
    }

    pub fn manifest_path(&self, id: &BackupId) -> String {
        format!("{}/manifests/{id}.json", self.ours_prefix)
    }

    pub fn chunk_path(&self, hash: &str) -> String {
        format!("{}/chunks/{hash}", self.ours_prefix)
    }
}
