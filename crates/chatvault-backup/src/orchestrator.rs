//! Backup orchestrator: the single entry point for every backup, restore,
//! migration and delete.
//!
//! Runs are serialized by a run-lock taken with `try_lock`; a second request
//! while one is active fails with `BackupInProgress` instead of queueing.
//! The `BackupKey` is derived at the start of a run, moved into the stage
//! that needs it, and dropped (zeroized) before the run returns on every path.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use futures::stream::{self, StreamExt};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use chatvault_archive::{ArchiveBuilder, BuiltArchive, Compression};
use chatvault_core::config::{BackupConfig, ChatvaultConfig};
use chatvault_core::key_record::{KdfParams, KeyRecord};
use chatvault_core::now_millis;
use chatvault_core::types::{
    sort_messages, BackupDestination, BackupId, BackupType, MessageRecord,
};
use chatvault_core::wire::SealedManifest;
use chatvault_crypto::{
    create_key_record, header_matches_key, seal_manifest, unlock, BackupKey, BackupSecret,
    ChunkAad, CryptoError, EnvelopeCipher,
};
use chatvault_storage::{check_health, DestinationAdapter, RemoteBackupSummary, StorageError};

use crate::error::{BackupError, BackupErrorKind, Operation};
use crate::ledger::{
    ActivityEntry, BackupHistoryEntry, BackupOutcome, Ledger, MigrationReason,
};
use crate::progress::{ProgressEvent, ProgressFn};
use crate::restore::{open_sealed, RestoreEngine};
use crate::retry::{RetryError, RetryPolicy};
use crate::schedule::AutoBackupPolicy;
use crate::settings::BackupSettings;
use crate::source::MessageSource;
use crate::state::{RunState, RunTracker};
use crate::task::BackupTask;

/// "Backup now"
pub struct BackupRequest {
    pub secret: BackupSecret,
    /// Defaults to the selected destination
    pub destination: Option<BackupDestination>,
    pub backup_type: BackupType,
    pub progress: Option<ProgressFn>,
}

impl BackupRequest {
    pub fn new(secret: BackupSecret, backup_type: BackupType) -> Self {
        Self {
            secret,
            destination: None,
            backup_type,
            progress: None,
        }
    }

    pub fn to(mut self, destination: BackupDestination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

pub struct RestoreRequest {
    pub secret: BackupSecret,
    pub destination: BackupDestination,
    pub backup_id: BackupId,
    pub progress: Option<ProgressFn>,
}

impl RestoreRequest {
    pub fn new(secret: BackupSecret, destination: BackupDestination, backup_id: BackupId) -> Self {
        Self {
            secret,
            destination,
            backup_id,
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// A backup known either remotely or in the ledger
#[derive(Debug, Clone)]
struct StoredBackup {
    id: BackupId,
    parent_id: Option<BackupId>,
    created_at: u64,
}

/// Everything a full or incremental write needs once the key is unlocked
struct WritePlan<'a> {
    key: BackupKey,
    record: &'a KeyRecord,
    adapter: &'a dyn DestinationAdapter,
    built: BuiltArchive,
    outcome: BackupOutcome,
}

struct Inner {
    backup_cfg: BackupConfig,
    kdf: KdfParams,
    retry: RetryPolicy,
    auto: RwLock<AutoBackupPolicy>,
    settings: RwLock<BackupSettings>,
    ledger: Ledger,
    source: Arc<dyn MessageSource>,
    adapters: RwLock<HashMap<BackupDestination, Arc<dyn DestinationAdapter>>>,
    run_lock: Arc<Mutex<()>>,
    stage_tx: watch::Sender<RunState>,
}

#[derive(Clone)]
pub struct BackupOrchestrator {
    inner: Arc<Inner>,
}

impl BackupOrchestrator {
    /// Settings persisted in the ledger take precedence over the config file.
    pub fn new(config: &ChatvaultConfig, ledger: Ledger, source: Arc<dyn MessageSource>) -> Self {
        let settings = ledger
            .settings()
            .unwrap_or_else(|| BackupSettings::from_config(&config.settings));
        let (stage_tx, _) = watch::channel(RunState::Idle);
        Self {
            inner: Arc::new(Inner {
                backup_cfg: config.backup.clone(),
                kdf: config.kdf.params(),
                retry: RetryPolicy::from_config(&config.backup),
                auto: RwLock::new(AutoBackupPolicy::from_config(&config.auto_backup)),
                settings: RwLock::new(settings),
                ledger,
                source,
                adapters: RwLock::new(HashMap::new()),
                run_lock: Arc::new(Mutex::new(())),
                stage_tx,
            }),
        }
    }

    pub fn register_adapter(&self, adapter: Arc<dyn DestinationAdapter>) {
        let destination = adapter.destination().clone();
        info!(destination = %destination, "storage adapter registered");
        self.inner
            .adapters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(destination, adapter);
    }

    fn adapter(
        &self,
        destination: &BackupDestination,
    ) -> Result<Arc<dyn DestinationAdapter>, BackupErrorKind> {
        self.inner
            .adapters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(destination)
            .cloned()
            .ok_or_else(|| BackupErrorKind::UnknownDestination(destination.clone()))
    }

    // ── Read-only views (safe while a run is active) ─────────────────────────

    pub fn settings(&self) -> BackupSettings {
        self.inner
            .settings
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_key(&self) -> Option<KeyRecord> {
        self.inner.ledger.current_key()
    }

    pub fn history(&self) -> Vec<BackupHistoryEntry> {
        self.inner.ledger.history()
    }

    pub fn activity(&self) -> Vec<ActivityEntry> {
        self.inner.ledger.activity()
    }

    /// Stage of the current (or last) run
    pub fn stage(&self) -> RunState {
        self.inner.stage_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.inner.stage_tx.subscribe()
    }

    /// What the destination itself lists. Needs no key.
    pub async fn remote_history(
        &self,
        destination: &BackupDestination,
    ) -> Result<Vec<RemoteBackupSummary>, StorageError> {
        let adapter = self
            .adapter(destination)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        adapter.list().await
    }

    /// Whether `destination` is registered and reachable
    pub async fn check_destination(
        &self,
        destination: &BackupDestination,
    ) -> Result<(), StorageError> {
        let adapter = self
            .adapter(destination)
            .map_err(|e| StorageError::Config(e.to_string()))?;
        check_health(adapter.as_ref()).await
    }

    // ── Settings ─────────────────────────────────────────────────────────────

    pub fn set_enabled(&self, enabled: bool) -> Result<(), BackupError> {
        self.update_settings(|s| s.enabled = enabled)
    }

    /// Record that the user accepted `destination`'s risk notice.
    pub fn acknowledge_third_party_risk(
        &self,
        destination: &BackupDestination,
    ) -> Result<(), BackupError> {
        self.update_settings(|s| s.acknowledge(destination))
    }

    pub fn set_auto_backup(&self, policy: AutoBackupPolicy) {
        *self.inner.auto.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    /// Whether an automatic backup should run now
    pub fn auto_backup_due(&self, now: u64, on_wifi: bool) -> bool {
        let settings = self.settings();
        if !settings.enabled || self.inner.ledger.current_key().is_none() {
            return false;
        }
        let last = self
            .inner
            .ledger
            .history_for(&settings.destination)
            .iter()
            .map(|e| e.completed_at)
            .max();
        self.inner
            .auto
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_due(last, now, on_wifi)
    }

    fn update_settings(&self, f: impl FnOnce(&mut BackupSettings)) -> Result<(), BackupError> {
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let mut next = settings.clone();
        f(&mut next);
        self.inner
            .ledger
            .save_settings(&next)
            .map_err(|e| BackupError {
                operation: Operation::Setup,
                stage: RunState::Idle,
                kind: BackupErrorKind::Ledger(format!("{e:#}")),
            })?;
        *settings = next;
        Ok(())
    }

    // ── Run bookkeeping ──────────────────────────────────────────────────────

    fn try_acquire(&self, operation: Operation) -> Result<OwnedMutexGuard<()>, BackupError> {
        self.inner
            .run_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| BackupError {
                operation,
                stage: self.stage(),
                kind: BackupErrorKind::BackupInProgress,
            })
    }

    fn record_activity<T>(
        &self,
        operation: Operation,
        destination: Option<&BackupDestination>,
        backup_id: Option<BackupId>,
        result: &Result<T, BackupError>,
    ) {
        let entry = ActivityEntry {
            at: now_millis(),
            operation,
            destination: destination.cloned(),
            backup_id,
            success: result.is_ok(),
            detail: result.as_ref().err().map(|e| e.to_string()),
        };
        if let Err(e) = self.inner.ledger.record_activity(entry) {
            warn!(error = %format!("{e:#}"), "failed to record activity");
        }
    }

    // ── Key setup ────────────────────────────────────────────────────────────

    /// "Set up backup PIN": create the key, upload its record, make it current.
    pub async fn setup_secret(&self, secret: BackupSecret) -> Result<KeyRecord, BackupError> {
        let guard = self.try_acquire(Operation::Setup);
        let destination = self.settings().destination;
        let result = match guard {
            Ok(_guard) => {
                let mut tracker = RunTracker::new(Operation::Setup, &self.inner.stage_tx, None);
                let result = self.setup_flow(&mut tracker, secret, &destination).await;
                tracker.finish(result)
            }
            Err(e) => Err(e),
        };
        self.record_activity(Operation::Setup, Some(&destination), None, &result);
        result
    }

    async fn setup_flow(
        &self,
        tracker: &mut RunTracker<'_>,
        secret: BackupSecret,
        destination: &BackupDestination,
    ) -> Result<KeyRecord, BackupError> {
        if self.inner.ledger.current_key().is_some() {
            return Err(tracker.error(BackupErrorKind::KeyAlreadyConfigured));
        }
        let adapter = self.usable_adapter(destination).map_err(|k| tracker.error(k))?;

        tracker.enter(RunState::DerivingKey);
        let params = self.inner.kdf;
        let created_at = now_millis();
        let (key, record) =
            derive_blocking(move || create_key_record(secret, &params, created_at))
                .await
                .map_err(|k| tracker.error(k))?;
        drop(key);

        tracker.enter(RunState::Uploading);
        let cancel = CancellationToken::new();
        self.inner
            .retry
            .run(&cancel, "put_key_record", || adapter.put_key_record(&record))
            .await
            .map_err(|e| tracker.error(e.into_unavailable()))?;
        self.inner
            .ledger
            .install_key(record.clone())
            .map_err(|e| tracker.error(ledger_error(e)))?;

        info!(key_id = %record.key_id, destination = %destination, "backup key set up");
        Ok(record)
    }

    /// Adapter for a destination the user has cleared for use
    fn usable_adapter(
        &self,
        destination: &BackupDestination,
    ) -> Result<Arc<dyn DestinationAdapter>, BackupErrorKind> {
        if !self.settings().is_acknowledged(destination) {
            return Err(BackupErrorKind::RiskNotAcknowledged(destination.clone()));
        }
        self.adapter(destination)
    }

    // ── Backup ───────────────────────────────────────────────────────────────

    /// "Backup now". Appends a history entry only once the destination has
    /// confirmed every chunk and the manifest.
    pub async fn start_backup(
        &self,
        request: BackupRequest,
        cancel: CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        match self.try_acquire(Operation::Backup) {
            Ok(_guard) => self.run_backup(request, cancel).await,
            Err(e) => {
                let destination = request
                    .destination
                    .unwrap_or_else(|| self.settings().destination);
                let result = Err(e);
                self.record_activity(Operation::Backup, Some(&destination), None, &result);
                result
            }
        }
    }

    /// Run a backup on its own task. The run-lock is taken before spawning.
    pub fn spawn_backup(
        &self,
        request: BackupRequest,
    ) -> Result<BackupTask<BackupHistoryEntry>, BackupError> {
        let guard = self.try_acquire(Operation::Backup)?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_backup(request, token).await
        });
        Ok(BackupTask::new(Operation::Backup, cancel, handle))
    }

    async fn run_backup(
        &self,
        request: BackupRequest,
        cancel: CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        let destination = request
            .destination
            .clone()
            .unwrap_or_else(|| self.settings().destination);
        let span = info_span!(
            "backup_run",
            run_id = %Uuid::new_v4(),
            destination = %destination,
            backup_type = %request.backup_type,
        );
        async {
            let mut tracker = RunTracker::new(
                Operation::Backup,
                &self.inner.stage_tx,
                request.progress.clone(),
            );
            let result = self
                .backup_flow(&mut tracker, request, &destination, &cancel)
                .await;
            let result = tracker.finish(result);
            self.record_activity(
                Operation::Backup,
                Some(&destination),
                result.as_ref().ok().map(|e| e.backup_id),
                &result,
            );
            result
        }
        .instrument(span)
        .await
    }

    async fn backup_flow(
        &self,
        tracker: &mut RunTracker<'_>,
        request: BackupRequest,
        destination: &BackupDestination,
        cancel: &CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        if !self.settings().enabled {
            return Err(tracker.error(BackupErrorKind::BackupsDisabled));
        }
        let adapter = self.usable_adapter(destination).map_err(|k| tracker.error(k))?;

        tracker.enter(RunState::DerivingKey);
        let (key, record) = self
            .unlock_or_create(request.secret)
            .await
            .map_err(|k| tracker.error(k))?;
        check_cancel(cancel, tracker)?;

        tracker.enter(RunState::Building);
        let messages = self.load_messages().await.map_err(|k| tracker.error(k))?;
        let parent = match request.backup_type {
            BackupType::Full => None,
            BackupType::Incremental => {
                match self.inner.ledger.latest_for(destination, &record.key_id) {
                    Some(entry) => {
                        let engine = RestoreEngine::new(adapter.as_ref(), &self.inner.retry, cancel);
                        let sealed = engine
                            .fetch_manifest(&entry.backup_id, |missing| {
                                BackupErrorKind::IncompleteChain { missing }
                            })
                            .await
                            .map_err(|k| tracker.error(k))?;
                        let manifest = open_sealed(&key, &sealed)
                            .map_err(|_| tracker.error(BackupErrorKind::Authentication))?;
                        Some(manifest)
                    }
                    None => {
                        info!("no previous backup under this key, running a full backup");
                        None
                    }
                }
            }
        };
        let builder = self.archive_builder();
        let built = match &parent {
            Some(parent) => builder.build_incremental(&messages, parent),
            None => builder.build_full(&messages),
        }
        .map_err(|e| tracker.error(BackupErrorKind::Internal(e.to_string())))?;
        check_cancel(cancel, tracker)?;

        let entry = self
            .write_backup(
                tracker,
                WritePlan {
                    key,
                    record: &record,
                    adapter: adapter.as_ref(),
                    built,
                    outcome: BackupOutcome::Completed,
                },
                cancel,
            )
            .await?;

        let appended = self
            .inner
            .ledger
            .append_history(entry.clone())
            .map_err(|e| tracker.error(ledger_error(e)))?;
        if !appended {
            warn!(backup_id = %entry.backup_id, "backup already recorded in history");
        }
        Ok(entry)
    }

    /// Unlock the current key, or create one on first use.
    async fn unlock_or_create(
        &self,
        secret: BackupSecret,
    ) -> Result<(BackupKey, KeyRecord), BackupErrorKind> {
        match self.inner.ledger.current_key() {
            Some(record) => {
                let for_unlock = record.clone();
                let key = derive_blocking(move || unlock(secret, &for_unlock)).await?;
                Ok((key, record))
            }
            None => {
                let params = self.inner.kdf;
                let created_at = now_millis();
                let (key, record) =
                    derive_blocking(move || create_key_record(secret, &params, created_at))
                        .await?;
                self.inner
                    .ledger
                    .install_key(record.clone())
                    .map_err(ledger_error)?;
                info!(key_id = %record.key_id, "backup key created on first use");
                Ok((key, record))
            }
        }
    }

    async fn load_messages(&self) -> Result<Vec<MessageRecord>, BackupErrorKind> {
        self.inner
            .source
            .load_messages()
            .await
            .map_err(|e| BackupErrorKind::MessageStore(format!("{e:#}")))
    }

    fn archive_builder(&self) -> ArchiveBuilder {
        let cfg = &self.inner.backup_cfg;
        let compression = if cfg.compress {
            Compression::Zstd
        } else {
            Compression::None
        };
        ArchiveBuilder::new(cfg.max_chunk_bytes).with_compression(compression, cfg.compression_level)
    }

    /// Encrypting → Uploading → Verifying. Returns the history entry to
    /// record; the caller appends it.
    async fn write_backup(
        &self,
        tracker: &mut RunTracker<'_>,
        plan: WritePlan<'_>,
        cancel: &CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        let WritePlan {
            key,
            record,
            adapter,
            built,
            outcome,
        } = plan;
        let manifest = built.manifest;
        let backup_id = manifest.backup_id;

        tracker.enter(RunState::Encrypting);
        let cipher = EnvelopeCipher::new(&key).map_err(|e| tracker.error(e.into()))?;
        let mut chunks = Vec::with_capacity(built.payloads.len());
        for payload in &built.payloads {
            check_cancel(cancel, tracker)?;
            let aad = ChunkAad::new(backup_id, payload.sequence);
            chunks.push(
                cipher
                    .seal(&payload.bytes, &aad)
                    .map_err(|e| tracker.error(e.into()))?,
            );
        }
        let blobs = chunks.iter().map(|c| c.blob_ref()).collect();
        let header = manifest.header(record.clone(), blobs);
        let body = manifest
            .to_bytes()
            .map_err(|e| tracker.error(BackupErrorKind::Internal(e.to_string())))?;
        let sealed = seal_manifest(&key, header, &body).map_err(|e| tracker.error(e.into()))?;
        drop(cipher);
        drop(key);

        tracker.enter(RunState::Uploading);
        let retry = &self.inner.retry;
        retry
            .run(cancel, "put_key_record", || adapter.put_key_record(record))
            .await
            .map_err(|e| tracker.error(e.into_kind()))?;

        let total = chunks.len();
        let bytes_total: u64 = chunks.iter().map(|c| c.len() as u64).sum();
        let concurrency = self.inner.backup_cfg.upload_concurrency.max(1);
        let upload_futs: Vec<_> = chunks
            .iter()
            .map(|chunk| async move {
                if cancel.is_cancelled() {
                    return Err(RetryError::Cancelled);
                }
                retry
                    .run(cancel, "put_chunk", || adapter.put_chunk(chunk))
                    .await
                    .map(|_| chunk.len() as u64)
            })
            .collect();
        let mut uploads = stream::iter(upload_futs).buffer_unordered(concurrency);
        let mut index = 0usize;
        let mut bytes_uploaded = 0u64;
        while let Some(result) = uploads.next().await {
            let len = result.map_err(|e| tracker.error(e.into_kind()))?;
            index += 1;
            bytes_uploaded += len;
            tracker.emit(&ProgressEvent::ChunkUploaded {
                index,
                total,
                bytes_uploaded,
                bytes_total,
            });
        }
        drop(uploads);
        check_cancel(cancel, tracker)?;

        retry
            .run(cancel, "put_manifest", || adapter.put_manifest(&sealed))
            .await
            .map_err(|e| tracker.error(e.into_kind()))?;

        tracker.enter(RunState::Verifying);
        self.verify_stored(adapter, &sealed, cancel)
            .await
            .map_err(|k| tracker.error(k))?;

        let entry = BackupHistoryEntry {
            backup_id,
            destination: adapter.destination().clone(),
            backup_type: manifest.backup_type,
            parent_id: manifest.parent_id,
            key_id: record.key_id.clone(),
            created_at: manifest.created_at,
            completed_at: now_millis(),
            byte_size: sealed.header.total_bytes(),
            message_count: manifest.message_count,
            chunk_count: total,
            outcome,
        };
        info!(
            backup_id = %backup_id,
            backup_type = %entry.backup_type,
            chunks = total,
            bytes = entry.byte_size,
            messages = entry.message_count,
            "backup stored"
        );
        Ok(entry)
    }

    /// Read the manifest back and confirm every blob it lists is present.
    async fn verify_stored(
        &self,
        adapter: &dyn DestinationAdapter,
        sealed: &SealedManifest,
        cancel: &CancellationToken,
    ) -> Result<(), BackupErrorKind> {
        let retry = &self.inner.retry;
        let id = sealed.backup_id();
        let stored = retry
            .run(cancel, "get_manifest", || adapter.get_manifest(&id))
            .await
            .map_err(|e| e.into_kind())?;
        if stored != *sealed {
            return Err(BackupErrorKind::DestinationUnavailable(format!(
                "stored manifest {id} does not match what was written"
            )));
        }
        for blob in &sealed.header.blobs {
            let present = retry
                .run(cancel, "chunk_exists", || adapter.chunk_exists(blob))
                .await
                .map_err(|e| e.into_kind())?;
            if !present {
                return Err(BackupErrorKind::DestinationUnavailable(format!(
                    "chunk {id}-{} missing after upload",
                    blob.sequence
                )));
            }
        }
        Ok(())
    }

    // ── Restore ──────────────────────────────────────────────────────────────

    /// Restore `backup_id` and its ancestors. The secret is checked against
    /// the local key record before the destination is contacted.
    pub async fn restore(
        &self,
        request: RestoreRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<MessageRecord>, BackupError> {
        match self.try_acquire(Operation::Restore) {
            Ok(_guard) => self.run_restore(request, cancel).await,
            Err(e) => {
                let result = Err(e);
                self.record_activity(
                    Operation::Restore,
                    Some(&request.destination),
                    Some(request.backup_id),
                    &result,
                );
                result
            }
        }
    }

    pub fn spawn_restore(
        &self,
        request: RestoreRequest,
    ) -> Result<BackupTask<Vec<MessageRecord>>, BackupError> {
        let guard = self.try_acquire(Operation::Restore)?;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let this = self.clone();
        let handle = tokio::spawn(async move {
            let _guard = guard;
            this.run_restore(request, token).await
        });
        Ok(BackupTask::new(Operation::Restore, cancel, handle))
    }

    async fn run_restore(
        &self,
        request: RestoreRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<MessageRecord>, BackupError> {
        let destination = request.destination.clone();
        let backup_id = request.backup_id;
        let span = info_span!(
            "restore_run",
            run_id = %Uuid::new_v4(),
            destination = %destination,
            backup_id = %backup_id,
        );
        async {
            let mut tracker = RunTracker::new(
                Operation::Restore,
                &self.inner.stage_tx,
                request.progress.clone(),
            );
            let result = self.restore_flow(&mut tracker, request, &cancel).await;
            let result = tracker.finish(result);
            self.record_activity(Operation::Restore, Some(&destination), Some(backup_id), &result);
            result
        }
        .instrument(span)
        .await
    }

    async fn restore_flow(
        &self,
        tracker: &mut RunTracker<'_>,
        request: RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageRecord>, BackupError> {
        let RestoreRequest {
            secret,
            destination,
            backup_id,
            ..
        } = request;
        let adapter = self.adapter(&destination).map_err(|k| tracker.error(k))?;
        let engine = RestoreEngine::new(adapter.as_ref(), &self.inner.retry, cancel);

        tracker.enter(RunState::DerivingKey);
        secret.validate().map_err(|e| tracker.error(e.into()))?;
        let (key, target) = self
            .unlock_for_restore(tracker, &engine, secret, &destination, &backup_id)
            .await?;
        check_cancel(cancel, tracker)?;

        let messages = engine.restore(&key, target, tracker).await;
        drop(key);
        messages
    }

    /// Derive the key for a stored backup and fetch its manifest.
    ///
    /// With a local key record the secret is verified before any fetch. A
    /// backup unknown to the ledger (restoring on a new device) carries its
    /// key record in the manifest header, so that one manifest is fetched
    /// first and the secret is checked before any chunk is read.
    async fn unlock_for_restore(
        &self,
        tracker: &mut RunTracker<'_>,
        engine: &RestoreEngine<'_>,
        secret: BackupSecret,
        destination: &BackupDestination,
        backup_id: &BackupId,
    ) -> Result<(BackupKey, SealedManifest), BackupError> {
        let ledger = &self.inner.ledger;
        let local_record = ledger
            .entry(backup_id)
            .filter(|e| &e.destination == destination)
            .and_then(|e| ledger.key_record(&e.key_id));

        match local_record {
            Some(record) => {
                let key = derive_blocking(move || unlock(secret, &record))
                    .await
                    .map_err(|k| tracker.error(k))?;
                tracker.enter(RunState::Fetching);
                let target = engine
                    .fetch_manifest(backup_id, BackupErrorKind::BackupNotFound)
                    .await
                    .map_err(|k| tracker.error(k))?;
                let matches = header_matches_key(&key, &target.header)
                    .map_err(|e| tracker.error(e.into()))?;
                if !matches {
                    return Err(tracker.error(BackupErrorKind::CorruptBackup {
                        chunk_id: format!("manifest {backup_id}"),
                    }));
                }
                Ok((key, target))
            }
            None => {
                tracker.enter(RunState::Fetching);
                let target = engine
                    .fetch_manifest(backup_id, BackupErrorKind::BackupNotFound)
                    .await
                    .map_err(|k| tracker.error(k))?;
                tracker.enter(RunState::DerivingKey);
                let record = target.header.key.clone();
                let key = derive_blocking(move || unlock(secret, &record))
                    .await
                    .map_err(|k| tracker.error(k))?;
                Ok((key, target))
            }
        }
    }

    // ── Migration ────────────────────────────────────────────────────────────

    /// Re-encrypt everything under a new secret.
    ///
    /// The newest chain under the current key at `destination` is restored,
    /// merged with the live message set and written there as a full backup
    /// under the new key. Other destinations are not touched. The
    /// new key becomes current only once that backup is stored. Old backups
    /// stay under the old key until deleted explicitly.
    pub async fn rotate_secret(
        &self,
        old: BackupSecret,
        new: BackupSecret,
        destination: BackupDestination,
        cancel: CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        let guard = self.try_acquire(Operation::Migration);
        let result = match guard {
            Ok(_guard) => {
                let span = info_span!(
                    "migration_run",
                    run_id = %Uuid::new_v4(),
                    destination = %destination,
                    reason = "key_rotation",
                );
                async {
                    let mut tracker =
                        RunTracker::new(Operation::Migration, &self.inner.stage_tx, None);
                    let result = self
                        .rotate_flow(&mut tracker, old, new, &destination, &cancel)
                        .await;
                    tracker.finish(result)
                }
                .instrument(span)
                .await
            }
            Err(e) => Err(e),
        };
        self.record_activity(
            Operation::Migration,
            Some(&destination),
            result.as_ref().ok().map(|e| e.backup_id),
            &result,
        );
        result
    }

    async fn rotate_flow(
        &self,
        tracker: &mut RunTracker<'_>,
        old: BackupSecret,
        new: BackupSecret,
        destination: &BackupDestination,
        cancel: &CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        let adapter = self.usable_adapter(destination).map_err(|k| tracker.error(k))?;
        let current = self
            .inner
            .ledger
            .current_key()
            .ok_or_else(|| tracker.error(BackupErrorKind::NoKeyConfigured))?;

        tracker.enter(RunState::DerivingKey);
        new.validate().map_err(|e| tracker.error(e.into()))?;
        let for_unlock = current.clone();
        let old_key = derive_blocking(move || unlock(old, &for_unlock))
            .await
            .map_err(|k| tracker.error(k))?;
        let params = self.inner.kdf;
        let created_at = now_millis();
        let (new_key, new_record) =
            derive_blocking(move || create_key_record(new, &params, created_at))
                .await
                .map_err(|k| tracker.error(k))?;
        check_cancel(cancel, tracker)?;

        let restored = self
            .restore_latest(tracker, adapter.as_ref(), destination, &current, &old_key, cancel)
            .await;
        drop(old_key);
        let restored = restored?;

        let entry = self
            .migrate_into(
                tracker,
                restored,
                new_key,
                &new_record,
                adapter.as_ref(),
                MigrationReason::KeyRotation,
                cancel,
            )
            .await?;

        self.inner
            .ledger
            .commit_key_rotation(new_record.clone(), entry.clone())
            .map_err(|e| tracker.error(ledger_error(e)))?;
        info!(
            old_key_id = %current.key_id,
            new_key_id = %new_record.key_id,
            backup_id = %entry.backup_id,
            "backup key rotated"
        );
        Ok(entry)
    }

    /// Move backups to `new_destination` and select it.
    ///
    /// Without a key there is nothing to migrate and the destination is just
    /// switched. Selecting the current destination again is a no-op.
    pub async fn change_destination(
        &self,
        secret: BackupSecret,
        new_destination: BackupDestination,
        cancel: CancellationToken,
    ) -> Result<Option<BackupHistoryEntry>, BackupError> {
        let old_destination = self.settings().destination;
        if old_destination == new_destination {
            return Ok(None);
        }
        let guard = self.try_acquire(Operation::Migration);
        let result = match guard {
            Ok(_guard) => {
                let span = info_span!(
                    "migration_run",
                    run_id = %Uuid::new_v4(),
                    destination = %new_destination,
                    reason = "destination_change",
                );
                async {
                    let mut tracker =
                        RunTracker::new(Operation::Migration, &self.inner.stage_tx, None);
                    let result = self
                        .change_destination_flow(
                            &mut tracker,
                            secret,
                            &old_destination,
                            &new_destination,
                            &cancel,
                        )
                        .await;
                    tracker.finish(result)
                }
                .instrument(span)
                .await
            }
            Err(e) => Err(e),
        };
        self.record_activity(
            Operation::Migration,
            Some(&new_destination),
            result.as_ref().ok().and_then(|e| e.as_ref().map(|e| e.backup_id)),
            &result,
        );
        result
    }

    async fn change_destination_flow(
        &self,
        tracker: &mut RunTracker<'_>,
        secret: BackupSecret,
        old_destination: &BackupDestination,
        new_destination: &BackupDestination,
        cancel: &CancellationToken,
    ) -> Result<Option<BackupHistoryEntry>, BackupError> {
        let new_adapter = self
            .usable_adapter(new_destination)
            .map_err(|k| tracker.error(k))?;
        let Some(record) = self.inner.ledger.current_key() else {
            self.select_destination(new_destination)
                .map_err(|e| tracker.error(e.kind))?;
            info!(destination = %new_destination, "destination selected");
            return Ok(None);
        };

        tracker.enter(RunState::DerivingKey);
        let for_unlock = record.clone();
        let key = derive_blocking(move || unlock(secret, &for_unlock))
            .await
            .map_err(|k| tracker.error(k))?;
        check_cancel(cancel, tracker)?;

        let restored = match self.inner.ledger.latest_for(old_destination, &record.key_id) {
            Some(_) => {
                let old_adapter = self.adapter(old_destination).map_err(|k| tracker.error(k))?;
                self.restore_latest(
                    tracker,
                    old_adapter.as_ref(),
                    old_destination,
                    &record,
                    &key,
                    cancel,
                )
                .await?
            }
            None => Vec::new(),
        };

        let entry = self
            .migrate_into(
                tracker,
                restored,
                key,
                &record,
                new_adapter.as_ref(),
                MigrationReason::DestinationChange,
                cancel,
            )
            .await?;
        self.inner
            .ledger
            .append_history(entry.clone())
            .map_err(|e| tracker.error(ledger_error(e)))?;
        self.select_destination(new_destination)
            .map_err(|e| tracker.error(e.kind))?;
        info!(
            from = %old_destination,
            to = %new_destination,
            backup_id = %entry.backup_id,
            "backups moved to new destination"
        );
        Ok(Some(entry))
    }

    fn select_destination(&self, destination: &BackupDestination) -> Result<(), BackupError> {
        self.update_settings(|s| s.destination = destination.clone())
    }

    /// Restore the newest chain under `record` at `destination`, if any.
    async fn restore_latest(
        &self,
        tracker: &mut RunTracker<'_>,
        adapter: &dyn DestinationAdapter,
        destination: &BackupDestination,
        record: &KeyRecord,
        key: &BackupKey,
        cancel: &CancellationToken,
    ) -> Result<Vec<MessageRecord>, BackupError> {
        let Some(latest) = self.inner.ledger.latest_for(destination, &record.key_id) else {
            return Ok(Vec::new());
        };
        tracker.enter(RunState::Fetching);
        let engine = RestoreEngine::new(adapter, &self.inner.retry, cancel);
        let target = engine
            .fetch_manifest(&latest.backup_id, |missing| {
                BackupErrorKind::IncompleteChain { missing }
            })
            .await
            .map_err(|k| tracker.error(k))?;
        engine.restore(key, target, tracker).await
    }

    /// Merge restored and live messages into a full backup under `key`.
    #[allow(clippy::too_many_arguments)]
    async fn migrate_into(
        &self,
        tracker: &mut RunTracker<'_>,
        restored: Vec<MessageRecord>,
        key: BackupKey,
        record: &KeyRecord,
        adapter: &dyn DestinationAdapter,
        reason: MigrationReason,
        cancel: &CancellationToken,
    ) -> Result<BackupHistoryEntry, BackupError> {
        tracker.enter(RunState::Building);
        let live = self.load_messages().await.map_err(|k| tracker.error(k))?;
        let messages = merge_messages(restored, live);
        let built = self
            .archive_builder()
            .build_full(&messages)
            .map_err(|e| tracker.error(BackupErrorKind::Internal(e.to_string())))?;
        check_cancel(cancel, tracker)?;

        self.write_backup(
            tracker,
            WritePlan {
                key,
                record,
                adapter,
                built,
                outcome: BackupOutcome::Migrated { reason },
            },
            cancel,
        )
        .await
    }

    // ── Delete ───────────────────────────────────────────────────────────────

    /// Delete a backup and every incremental built on it, remote first.
    /// Returns the deleted ids, newest first.
    pub async fn delete_backup(
        &self,
        destination: &BackupDestination,
        backup_id: &BackupId,
    ) -> Result<Vec<BackupId>, BackupError> {
        let target = *backup_id;
        self.run_delete(destination, move |known| {
            if !known.iter().any(|b| b.id == target) {
                return Err(BackupErrorKind::BackupNotFound(target));
            }
            Ok(with_descendants(known, &[target]))
        })
        .await
    }

    /// "Delete all backups" at `destination`
    pub async fn delete_all_backups(
        &self,
        destination: &BackupDestination,
    ) -> Result<Vec<BackupId>, BackupError> {
        self.run_delete(destination, |known| {
            let all: Vec<BackupId> = known.iter().map(|b| b.id).collect();
            Ok(with_descendants(known, &all))
        })
        .await
    }

    /// Keep the newest `keep` full chains and delete older ones.
    pub async fn prune_backups(
        &self,
        destination: &BackupDestination,
        keep: usize,
    ) -> Result<Vec<BackupId>, BackupError> {
        self.run_delete(destination, move |known| {
            let mut roots: Vec<&StoredBackup> =
                known.iter().filter(|b| b.parent_id.is_none()).collect();
            roots.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
            let doomed: Vec<BackupId> = roots.iter().skip(keep).map(|b| b.id).collect();
            Ok(with_descendants(known, &doomed))
        })
        .await
    }

    async fn run_delete<F>(
        &self,
        destination: &BackupDestination,
        select: F,
    ) -> Result<Vec<BackupId>, BackupError>
    where
        F: FnOnce(&[StoredBackup]) -> Result<Vec<BackupId>, BackupErrorKind>,
    {
        let result = match self.try_acquire(Operation::Delete) {
            Ok(_guard) => {
                let span = info_span!(
                    "delete_run",
                    run_id = %Uuid::new_v4(),
                    destination = %destination,
                );
                async {
                    let mut tracker = RunTracker::new(Operation::Delete, &self.inner.stage_tx, None);
                    let result = self.delete_flow(&mut tracker, destination, select).await;
                    tracker.finish(result)
                }
                .instrument(span)
                .await
            }
            Err(e) => Err(e),
        };
        self.record_activity(Operation::Delete, Some(destination), None, &result);
        result
    }

    async fn delete_flow<F>(
        &self,
        tracker: &mut RunTracker<'_>,
        destination: &BackupDestination,
        select: F,
    ) -> Result<Vec<BackupId>, BackupError>
    where
        F: FnOnce(&[StoredBackup]) -> Result<Vec<BackupId>, BackupErrorKind>,
    {
        tracker.enter(RunState::Deleting);
        let adapter = self.adapter(destination).map_err(|k| tracker.error(k))?;
        // Deletes run to completion; the token only satisfies the retry loop.
        let cancel = CancellationToken::new();
        let retry = &self.inner.retry;

        let remote = retry
            .run(&cancel, "list", || adapter.list())
            .await
            .map_err(|e| tracker.error(e.into_unavailable()))?;
        let mut known: Vec<StoredBackup> = remote
            .iter()
            .map(|s| StoredBackup {
                id: s.backup_id,
                parent_id: s.parent_id,
                created_at: s.created_at,
            })
            .collect();
        for entry in self.inner.ledger.history_for(destination) {
            if !known.iter().any(|b| b.id == entry.backup_id) {
                known.push(StoredBackup {
                    id: entry.backup_id,
                    parent_id: entry.parent_id,
                    created_at: entry.created_at,
                });
            }
        }

        let ids = select(&known).map_err(|k| tracker.error(k))?;

        let mut deleted = Vec::with_capacity(ids.len());
        let mut failure = None;
        for id in &ids {
            match retry.run(&cancel, "delete", || adapter.delete(id)).await {
                Ok(()) => deleted.push(*id),
                Err(e) => {
                    failure = Some(e.into_unavailable());
                    break;
                }
            }
        }
        // Drop ledger entries only for what is gone remotely.
        let removed = self
            .inner
            .ledger
            .remove_history(destination, &deleted)
            .map_err(|e| tracker.error(ledger_error(e)))?;
        if let Some(kind) = failure {
            warn!(deleted = deleted.len(), requested = ids.len(), "delete stopped early");
            return Err(tracker.error(kind));
        }

        info!(deleted = deleted.len(), ledger_entries = removed, "backups deleted");
        Ok(deleted)
    }
}

/// Run a key derivation off the async runtime.
async fn derive_blocking<T, F>(f: F) -> Result<T, BackupErrorKind>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, CryptoError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupErrorKind::Internal(format!("key derivation task: {e}")))?
        .map_err(BackupErrorKind::from)
}

fn check_cancel(cancel: &CancellationToken, tracker: &RunTracker<'_>) -> Result<(), BackupError> {
    if cancel.is_cancelled() {
        return Err(tracker.error(BackupErrorKind::Cancelled));
    }
    Ok(())
}

fn ledger_error(e: anyhow::Error) -> BackupErrorKind {
    BackupErrorKind::Ledger(format!("{e:#}"))
}

/// Live records win over restored ones with the same id.
fn merge_messages(restored: Vec<MessageRecord>, live: Vec<MessageRecord>) -> Vec<MessageRecord> {
    let mut by_id: BTreeMap<String, MessageRecord> = restored
        .into_iter()
        .map(|m| (m.id.clone(), m))
        .collect();
    for m in live {
        by_id.insert(m.id.clone(), m);
    }
    let mut messages: Vec<MessageRecord> = by_id.into_values().collect();
    sort_messages(&mut messages);
    messages
}

/// `roots` plus every backup descending from them, newest first
fn with_descendants(known: &[StoredBackup], roots: &[BackupId]) -> Vec<BackupId> {
    let mut selected: HashSet<BackupId> = roots.iter().copied().collect();
    loop {
        let before = selected.len();
        for b in known {
            if b.parent_id.is_some_and(|p| selected.contains(&p)) {
                selected.insert(b.id);
            }
        }
        if selected.len() == before {
            break;
        }
    }
    let mut ordered: Vec<&StoredBackup> = known.iter().filter(|b| selected.contains(&b.id)).collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
    ordered.into_iter().map(|b| b.id).collect()
}
