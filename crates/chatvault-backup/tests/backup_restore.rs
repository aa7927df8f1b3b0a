//! End-to-end backup and restore against in-memory destinations

mod common;

use std::sync::{Arc, Mutex};

use chatvault_backup::{
    BackupErrorKind, BackupOrchestrator, BackupOutcome, BackupRequest, Ledger, ProgressEvent,
    ProgressFn, RestoreRequest, RunState, StaticSource,
};
use chatvault_core::types::{BackupDestination, BackupType};
use chatvault_crypto::BackupSecret;
use common::*;
use tokio_util::sync::CancellationToken;

fn backup(kind: BackupType) -> BackupRequest {
    BackupRequest::new(BackupSecret::pin(PIN), kind)
}

fn restore_ours(id: chatvault_core::types::BackupId) -> RestoreRequest {
    RestoreRequest::new(BackupSecret::pin(PIN), BackupDestination::OurServers, id)
}

#[tokio::test]
async fn three_messages_roundtrip_in_timestamp_order() {
    let h = Harness::new(three_messages());

    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(entry.backup_type, BackupType::Full);
    assert_eq!(entry.message_count, 3);
    assert_eq!(entry.chunk_count, 1);
    assert_eq!(entry.outcome, BackupOutcome::Completed);
    assert_eq!(entry.destination, BackupDestination::OurServers);
    assert_eq!(h.orchestrator.history(), vec![entry.clone()]);
    assert_eq!(h.orchestrator.stage(), RunState::Completed);

    let restored = h
        .orchestrator
        .restore(restore_ours(entry.backup_id), CancellationToken::new())
        .await
        .unwrap();
    let ids: Vec<_> = restored.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m3"]);
    assert_eq!(restored[2].content, "👍");
}

#[tokio::test]
async fn first_backup_creates_and_uploads_key_record() {
    let h = Harness::new(three_messages());
    assert!(h.orchestrator.current_key().is_none());

    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let record = h.orchestrator.current_key().unwrap();
    assert_eq!(entry.key_id, record.key_id);
    let remote = chatvault_storage::DestinationAdapter::get_key_record(h.ours.as_ref(), &record.key_id)
        .await
        .unwrap();
    assert_eq!(remote, record);
}

#[tokio::test]
async fn progress_reports_stages_and_chunks() {
    let mut config = fast_config();
    config.backup.max_chunk_bytes = 512;
    config.backup.compress = false;
    let h = Harness::with_config(config, many_messages(12, 200));

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let progress: ProgressFn = Arc::new(move |e: &ProgressEvent| sink.lock().unwrap().push(e.clone()));

    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full).with_progress(progress), CancellationToken::new())
        .await
        .unwrap();
    assert!(entry.chunk_count > 1);

    let events = events.lock().unwrap();
    let stages: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::Stage(s) => Some(s.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(
        stages,
        vec![
            RunState::DerivingKey,
            RunState::Building,
            RunState::Encrypting,
            RunState::Uploading,
            RunState::Verifying,
            RunState::Completed,
        ]
    );

    let uploads: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::ChunkUploaded {
                index,
                total,
                bytes_uploaded,
                bytes_total,
            } => Some((*index, *total, *bytes_uploaded, *bytes_total)),
            _ => None,
        })
        .collect();
    assert_eq!(uploads.len(), entry.chunk_count);
    let (index, total, uploaded, bytes_total) = *uploads.last().unwrap();
    assert_eq!(index, total);
    assert_eq!(uploaded, bytes_total);
    assert_eq!(bytes_total, entry.byte_size);
}

#[tokio::test]
async fn unchanged_incremental_has_no_chunks_and_restores_parent_state() {
    let h = Harness::new(three_messages());
    let full = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let incremental = h
        .orchestrator
        .start_backup(backup(BackupType::Incremental), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(incremental.backup_type, BackupType::Incremental);
    assert_eq!(incremental.parent_id, Some(full.backup_id));
    assert_eq!(incremental.chunk_count, 0);
    assert_eq!(incremental.message_count, 0);

    let restored = h
        .orchestrator
        .restore(restore_ours(incremental.backup_id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(restored.len(), 3);
}

#[tokio::test]
async fn incremental_carries_only_changes_and_chain_applies_them() {
    let h = Harness::new(three_messages());
    h.orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let mut messages = three_messages();
    messages[1].content = "lunch tomorrow? (edited)".into();
    messages.push(msg("m4", 1_700_000_004_000, "on my way"));
    h.source.replace(messages);

    let incremental = h
        .orchestrator
        .start_backup(backup(BackupType::Incremental), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(incremental.message_count, 2);

    let restored = h
        .orchestrator
        .restore(restore_ours(incremental.backup_id), CancellationToken::new())
        .await
        .unwrap();
    let view: Vec<_> = restored
        .iter()
        .map(|m| (m.id.as_str(), m.content.as_str()))
        .collect();
    assert_eq!(
        view,
        vec![
            ("m1", "lunch tomorrow? (edited)"),
            ("m2", "see you at noon"),
            ("m3", "👍"),
            ("m4", "on my way"),
        ]
    );
}

#[tokio::test]
async fn incremental_without_parent_falls_back_to_full() {
    let h = Harness::new(three_messages());
    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Incremental), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(entry.backup_type, BackupType::Full);
    assert_eq!(entry.parent_id, None);
    assert_eq!(entry.message_count, 3);
}

#[tokio::test]
async fn multi_chunk_backup_roundtrips_with_compression() {
    let mut config = fast_config();
    config.backup.max_chunk_bytes = 2048;
    config.backup.upload_concurrency = 3;
    let messages = many_messages(50, 300);
    let h = Harness::with_config(config, messages.clone());

    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();
    assert!(entry.chunk_count > 3);

    let restored = h
        .orchestrator
        .restore(restore_ours(entry.backup_id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(restored, messages);
}

#[tokio::test]
async fn restore_on_new_device_uses_key_record_from_header() {
    let h = Harness::new(three_messages());
    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let fresh = BackupOrchestrator::new(
        &fast_config(),
        Ledger::in_memory(),
        Arc::new(StaticSource::default()),
    );
    fresh.register_adapter(h.ours.clone());

    let restored = fresh
        .restore(restore_ours(entry.backup_id), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(restored.len(), 3);

    let err = fresh
        .restore(
            RestoreRequest::new(
                BackupSecret::pin(OTHER_PIN),
                BackupDestination::OurServers,
                entry.backup_id,
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::InvalidSecret));
}

#[tokio::test]
async fn spawned_restore_returns_messages() {
    let h = Harness::new(three_messages());
    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let task = h
        .orchestrator
        .spawn_restore(restore_ours(entry.backup_id))
        .unwrap();
    let restored = task.join().await.unwrap();
    assert_eq!(restored.len(), 3);
}

#[tokio::test]
async fn remote_history_mirrors_the_ledger() {
    let h = Harness::new(three_messages());
    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();

    let remote = h
        .orchestrator
        .remote_history(&BackupDestination::OurServers)
        .await
        .unwrap();
    assert_eq!(remote.len(), 1);
    assert_eq!(remote[0].backup_id, entry.backup_id);
    assert_eq!(remote[0].message_count, 3);
    assert_eq!(remote[0].byte_size, entry.byte_size);
    assert_eq!(remote[0].key_id, entry.key_id);
}

#[tokio::test]
async fn ledger_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let h = Harness::with_ledger(fast_config(), Ledger::open(&path).unwrap(), three_messages());
    let entry = h
        .orchestrator
        .start_backup(backup(BackupType::Full), CancellationToken::new())
        .await
        .unwrap();
    drop(h);

    let ledger = Ledger::open(&path).unwrap();
    assert_eq!(ledger.history(), vec![entry.clone()]);
    assert_eq!(ledger.current_key().unwrap().key_id, entry.key_id);
    let raw = std::fs::read_to_string(&path).unwrap();
    assert!(!raw.contains(PIN));
}
