//! Restore fails closed: wrong secret, tampering, broken chains

mod common;

use chatvault_backup::{BackupErrorKind, BackupRequest, Operation, RestoreRequest, RunState};
use chatvault_core::types::{BackupDestination, BackupId, BackupType};
use chatvault_core::wire::SealedManifest;
use chatvault_crypto::BackupSecret;
use chatvault_storage::DestinationAdapter;
use common::*;
use tokio_test::assert_err;
use tokio_util::sync::CancellationToken;

async fn backup(h: &Harness, kind: BackupType) -> chatvault_backup::BackupHistoryEntry {
    h.orchestrator
        .start_backup(
            BackupRequest::new(BackupSecret::pin(PIN), kind),
            CancellationToken::new(),
        )
        .await
        .unwrap()
}

async fn restore(h: &Harness, pin: &str, id: BackupId) -> Result<Vec<chatvault_core::types::MessageRecord>, chatvault_backup::BackupError> {
    h.orchestrator
        .restore(
            RestoreRequest::new(BackupSecret::pin(pin), BackupDestination::OurServers, id),
            CancellationToken::new(),
        )
        .await
}

#[tokio::test]
async fn wrong_pin_fails_before_any_fetch() {
    let h = Harness::new(three_messages());
    let entry = backup(&h, BackupType::Full).await;
    h.ours.reset_calls();

    let err = restore(&h, OTHER_PIN, entry.backup_id).await.unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::InvalidSecret));
    assert_eq!(err.operation, Operation::Restore);
    assert_eq!(err.stage, RunState::DerivingKey);
    assert_eq!(h.ours.calls(), 0);
}

#[tokio::test]
async fn wrong_pin_on_unrecorded_backup_fetches_no_chunks() {
    let h = Harness::new(three_messages());
    let entry = backup(&h, BackupType::Full).await;
    let device = h.new_device();
    h.ours.reset_calls();

    let err = assert_err!(
        device
            .restore(
                RestoreRequest::new(
                    BackupSecret::pin(OTHER_PIN),
                    BackupDestination::OurServers,
                    entry.backup_id,
                ),
                CancellationToken::new(),
            )
            .await
    );
    assert!(matches!(err.kind(), BackupErrorKind::InvalidSecret));
    assert_eq!(err.stage, RunState::DerivingKey);
    // Only the manifest was read.
    assert_eq!(h.ours.calls(), 1);
    assert_eq!(h.ours.chunk_gets(), 0);
}

#[tokio::test]
async fn tampered_chunk_names_the_chunk() {
    let h = Harness::new(three_messages());
    let entry = backup(&h, BackupType::Full).await;

    let sealed = h.ours.get_manifest(&entry.backup_id).await.unwrap();
    let path = h.chunk_path(&sealed.header.blobs[0].hash);
    let mut bytes = h.ours_op.read(&path).await.unwrap().to_vec();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    h.ours_op.write(&path, bytes).await.unwrap();

    let err = restore(&h, PIN, entry.backup_id).await.unwrap_err();
    match err.kind() {
        BackupErrorKind::CorruptBackup { chunk_id } => {
            assert_eq!(chunk_id, &format!("{}-0", entry.backup_id))
        }
        other => panic!("expected CorruptBackup, got {other:?}"),
    }
    assert!(err.kind().is_integrity());
    assert!(matches!(h.orchestrator.stage(), RunState::Failed(_)));
}

#[tokio::test]
async fn tampered_manifest_header_is_detected() {
    let h = Harness::new(three_messages());
    let entry = backup(&h, BackupType::Full).await;

    let mut sealed = h.ours.get_manifest(&entry.backup_id).await.unwrap();
    sealed.header.message_count = 300;
    h.ours_op
        .write(&h.manifest_path(&entry.backup_id), sealed.to_bytes().unwrap())
        .await
        .unwrap();

    let err = restore(&h, PIN, entry.backup_id).await.unwrap_err();
    match err.kind() {
        BackupErrorKind::CorruptBackup { chunk_id } => {
            assert_eq!(chunk_id, &format!("manifest {}", entry.backup_id))
        }
        other => panic!("expected CorruptBackup, got {other:?}"),
    }
}

#[tokio::test]
async fn chunk_swapped_between_backups_is_rejected() {
    let h = Harness::new(three_messages());
    let first = backup(&h, BackupType::Full).await;
    h.source.replace(vec![msg("x1", 5, "other backup")]);
    let second = backup(&h, BackupType::Full).await;

    // Graft the second backup's sealed chunk under the first backup's blob key.
    let a: SealedManifest = h.ours.get_manifest(&first.backup_id).await.unwrap();
    let b: SealedManifest = h.ours.get_manifest(&second.backup_id).await.unwrap();
    let foreign = h
        .ours_op
        .read(&h.chunk_path(&b.header.blobs[0].hash))
        .await
        .unwrap()
        .to_vec();
    h.ours_op
        .write(&h.chunk_path(&a.header.blobs[0].hash), foreign)
        .await
        .unwrap();

    let err = restore(&h, PIN, first.backup_id).await.unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::CorruptBackup { .. }));
}

#[tokio::test]
async fn missing_parent_fails_with_incomplete_chain() {
    let h = Harness::new(three_messages());
    let full = backup(&h, BackupType::Full).await;
    let mut messages = three_messages();
    messages.push(msg("m4", 1_700_000_004_000, "new"));
    h.source.replace(messages);
    let incremental = backup(&h, BackupType::Incremental).await;
    assert_eq!(incremental.parent_id, Some(full.backup_id));

    h.ours_op
        .delete(&h.manifest_path(&full.backup_id))
        .await
        .unwrap();

    let err = restore(&h, PIN, incremental.backup_id).await.unwrap_err();
    match err.kind() {
        BackupErrorKind::IncompleteChain { missing } => assert_eq!(*missing, full.backup_id),
        other => panic!("expected IncompleteChain, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_chunk_is_corrupt_backup() {
    let h = Harness::new(three_messages());
    let entry = backup(&h, BackupType::Full).await;
    let sealed = h.ours.get_manifest(&entry.backup_id).await.unwrap();
    h.ours_op
        .delete(&h.chunk_path(&sealed.header.blobs[0].hash))
        .await
        .unwrap();

    let err = restore(&h, PIN, entry.backup_id).await.unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::CorruptBackup { .. }));
}

#[tokio::test]
async fn unknown_backup_is_not_found() {
    let h = Harness::new(three_messages());
    backup(&h, BackupType::Full).await;

    let missing = BackupId::from_bytes([0xEE; 16]);
    let err = restore(&h, PIN, missing).await.unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::BackupNotFound(id) if *id == missing));
}

#[tokio::test]
async fn incremental_against_tampered_parent_is_not_built() {
    let h = Harness::new(three_messages());
    let full = backup(&h, BackupType::Full).await;

    let mut sealed = h.ours.get_manifest(&full.backup_id).await.unwrap();
    sealed.header.created_at += 1;
    h.ours_op
        .write(&h.manifest_path(&full.backup_id), sealed.to_bytes().unwrap())
        .await
        .unwrap();

    let err = h
        .orchestrator
        .start_backup(
            BackupRequest::new(BackupSecret::pin(PIN), BackupType::Incremental),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::Authentication));
    assert_eq!(err.stage, RunState::Building);
    assert_eq!(h.orchestrator.history().len(), 1);
}
