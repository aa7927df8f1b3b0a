//! Cancellation, retry, run-lock and policy failures

mod common;

use std::sync::Arc;
use std::time::Duration;

use chatvault_backup::{
    BackupErrorKind, BackupRequest, Operation, ProgressEvent, ProgressFn, RestoreRequest,
    RunState,
};
use chatvault_core::types::{BackupDestination, BackupType};
use chatvault_crypto::BackupSecret;
use common::*;
use tokio_util::sync::CancellationToken;

fn backup() -> BackupRequest {
    BackupRequest::new(BackupSecret::pin(PIN), BackupType::Full)
}

#[tokio::test]
async fn cancel_mid_upload_leaves_no_history_and_releases_lock() {
    let mut config = fast_config();
    config.backup.max_chunk_bytes = 512;
    config.backup.compress = false;
    config.backup.upload_concurrency = 1;
    let h = Harness::with_config(config, many_messages(12, 200));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let progress: ProgressFn = Arc::new(move |e: &ProgressEvent| {
        if matches!(e, ProgressEvent::ChunkUploaded { .. }) {
            trigger.cancel();
        }
    });

    let err = h
        .orchestrator
        .start_backup(backup().with_progress(progress), cancel)
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::Cancelled));
    assert_eq!(err.operation, Operation::Backup);
    assert_eq!(err.stage, RunState::Uploading);
    assert_eq!(h.orchestrator.stage(), RunState::Cancelled);
    assert!(h.orchestrator.history().is_empty());
    assert_eq!(h.ours.chunk_puts(), 1);

    // The run-lock was released.
    let entry = h
        .orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.orchestrator.history(), vec![entry]);
}

#[tokio::test]
async fn cancelled_spawned_backup_ends_cancelled() {
    let mut config = fast_config();
    config.backup.max_chunk_bytes = 512;
    config.backup.compress = false;
    config.backup.upload_concurrency = 1;
    let h = Harness::with_config(config, many_messages(12, 200));
    h.ours.slow_puts(Duration::from_millis(50));

    let mut stages = h.orchestrator.subscribe();
    let task = h.orchestrator.spawn_backup(backup()).unwrap();
    stages
        .wait_for(|s| *s == RunState::Uploading)
        .await
        .unwrap();
    task.cancel();

    let err = task.join().await.unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::Cancelled));
    assert!(h.orchestrator.history().is_empty());
}

#[tokio::test]
async fn transient_failures_are_retried_per_chunk() {
    let h = Harness::new(three_messages());
    h.ours.fail_next_puts(2);

    let entry = h
        .orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(entry.chunk_count, 1);
    assert_eq!(h.ours.chunk_puts(), 3);
    assert_eq!(h.orchestrator.history().len(), 1);
}

#[tokio::test]
async fn exhausted_retries_fail_without_history() {
    let h = Harness::new(three_messages());
    h.ours.fail_all_puts(true);

    let err = h
        .orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap_err();
    match err.kind() {
        BackupErrorKind::BackupFailed { attempts, .. } => assert_eq!(*attempts, 3),
        other => panic!("expected BackupFailed, got {other:?}"),
    }
    assert_eq!(err.stage, RunState::Uploading);
    assert!(err.to_string().starts_with("backup failed during upload"));
    assert!(h.orchestrator.history().is_empty());
    assert!(matches!(h.orchestrator.stage(), RunState::Failed(_)));

    let remote = h
        .orchestrator
        .remote_history(&BackupDestination::OurServers)
        .await
        .unwrap();
    assert!(remote.is_empty(), "no manifest may be written");
}

#[tokio::test]
async fn second_run_while_active_is_rejected() {
    let mut config = fast_config();
    config.backup.max_chunk_bytes = 512;
    config.backup.compress = false;
    config.backup.upload_concurrency = 1;
    let h = Harness::with_config(config, many_messages(6, 200));
    h.ours.slow_puts(Duration::from_millis(30));

    let task = h.orchestrator.spawn_backup(backup()).unwrap();

    let err = h
        .orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::BackupInProgress));

    let err = h
        .orchestrator
        .restore(
            RestoreRequest::new(
                BackupSecret::pin(PIN),
                BackupDestination::OurServers,
                chatvault_core::types::BackupId::from_bytes([0; 16]),
            ),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::BackupInProgress));
    assert!(h.orchestrator.spawn_backup(backup()).is_err());

    let entry = task.join().await.unwrap();
    assert_eq!(h.orchestrator.history(), vec![entry]);
}

#[tokio::test]
async fn weak_secret_is_rejected_before_anything_is_stored() {
    let h = Harness::new(three_messages());
    for weak in [
        BackupSecret::pin("123456"),
        BackupSecret::pin("111111"),
        BackupSecret::pin("4821"),
        BackupSecret::passphrase("too short"),
    ] {
        let err = h
            .orchestrator
            .start_backup(
                BackupRequest::new(weak, BackupType::Full),
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err.kind(), BackupErrorKind::WeakSecret(_)));
        assert_eq!(err.stage, RunState::DerivingKey);
    }
    assert!(h.orchestrator.current_key().is_none());
    assert_eq!(h.ours.calls(), 0);
}

#[tokio::test]
async fn wrong_pin_backup_is_invalid_secret() {
    let h = Harness::new(three_messages());
    h.orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap();
    h.ours.reset_calls();

    let err = h
        .orchestrator
        .start_backup(
            BackupRequest::new(BackupSecret::pin(OTHER_PIN), BackupType::Full),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::InvalidSecret));
    assert_eq!(h.ours.calls(), 0);
}

#[tokio::test]
async fn third_party_requires_acknowledgement() {
    let h = Harness::new(three_messages());
    let drive = Harness::drive_destination();

    let err = h
        .orchestrator
        .start_backup(backup().to(drive.clone()), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::RiskNotAcknowledged(d) if *d == drive));
    assert!(drive.risk_notice().unwrap().contains("Google Drive"));

    h.orchestrator.acknowledge_third_party_risk(&drive).unwrap();
    let entry = h
        .orchestrator
        .start_backup(backup().to(drive.clone()), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(entry.destination, drive);
    assert!(h.drive.chunk_puts() > 0);
    assert_eq!(h.ours.chunk_puts(), 0);
}

#[tokio::test]
async fn disabled_backups_fail_and_unknown_destination_is_reported() {
    let h = Harness::new(three_messages());
    h.orchestrator.set_enabled(false).unwrap();
    let err = h
        .orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::BackupsDisabled));

    h.orchestrator.set_enabled(true).unwrap();
    let icloud: BackupDestination = "icloud".parse().unwrap();
    h.orchestrator.acknowledge_third_party_risk(&icloud).unwrap();
    let err = h
        .orchestrator
        .start_backup(backup().to(icloud), CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err.kind(), BackupErrorKind::UnknownDestination(_)));
}

#[tokio::test]
async fn activity_log_records_failures_without_secrets() {
    let h = Harness::new(three_messages());
    h.orchestrator
        .start_backup(backup(), CancellationToken::new())
        .await
        .unwrap();
    let _ = h
        .orchestrator
        .start_backup(
            BackupRequest::new(BackupSecret::pin(OTHER_PIN), BackupType::Full),
            CancellationToken::new(),
        )
        .await;

    let activity = h.orchestrator.activity();
    assert_eq!(activity.len(), 2);
    assert!(activity[0].success);
    assert!(activity[0].backup_id.is_some());
    assert!(!activity[1].success);
    let detail = activity[1].detail.as_deref().unwrap();
    assert!(detail.contains("key derivation"));
    assert!(!detail.contains(OTHER_PIN));
    assert!(!detail.contains(PIN));
}
