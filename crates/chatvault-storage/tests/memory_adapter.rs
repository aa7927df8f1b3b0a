//! Adapter contract tests against OpenDAL's in-memory service

use chatvault_core::key_record::{KdfParams, KeyRecord, KeySalt, KeyVerifier};
use chatvault_core::types::{BackupDestination, BackupId, BackupType, ThirdPartyProvider};
use chatvault_core::wire::{BlobRef, EncryptedChunk, ManifestHeader, SealedManifest};
use chatvault_storage::{
    check_health, DestinationAdapter, OurServersAdapter, StorageError, ThirdPartyAdapter,
};
use futures::StreamExt;
use tokio_test::{assert_err, assert_ok};
use opendal::Operator;

fn memory_op() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

fn key_record() -> KeyRecord {
    KeyRecord::new(
        KeySalt::from_bytes([1; 16]),
        KdfParams::default(),
        KeyVerifier::from_bytes([2; 32]),
        1,
    )
}

fn chunk(id: u8, seq: u64) -> EncryptedChunk {
    EncryptedChunk {
        chunk_id: format!("{id}-{seq}"),
        sequence: seq,
        blob: vec![id; 48 + seq as usize],
        blob_hash: format!("{id:02x}{seq:062x}"),
    }
}

fn sealed(id: u8, created_at: u64, chunks: &[EncryptedChunk]) -> SealedManifest {
    SealedManifest {
        header: ManifestHeader {
            version: 1,
            backup_id: BackupId::from_bytes([id; 16]),
            created_at,
            backup_type: BackupType::Full,
            parent_id: None,
            key: key_record(),
            message_count: 3,
            blobs: chunks.iter().map(EncryptedChunk::blob_ref).collect(),
        },
        body: "b3BhcXVl".into(),
    }
}

#[tokio::test]
async fn upload_download_roundtrip() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    let chunks = vec![chunk(7, 0), chunk(7, 1)];
    let manifest = sealed(7, 100, &chunks);

    let id = adapter.upload(&manifest, &chunks).await.unwrap();
    assert_eq!(id, manifest.backup_id());

    let (fetched, stream) = adapter.download(&id).await.unwrap();
    assert_eq!(fetched, manifest);
    let blobs: Vec<_> = stream.collect::<Vec<_>>().await;
    assert_eq!(blobs.len(), 2);
    for (blob, original) in blobs.into_iter().zip(&chunks) {
        let blob = blob.unwrap();
        assert_eq!(blob.bytes, original.blob);
        assert_eq!(blob.blob, original.blob_ref());
    }
}

#[tokio::test]
async fn put_chunk_is_idempotent() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    let c = chunk(1, 0);
    assert!(adapter.put_chunk(&c).await.unwrap().stored);
    assert!(!adapter.put_chunk(&c).await.unwrap().stored);
    assert!(adapter.chunk_exists(&c.blob_ref()).await.unwrap());
}

#[tokio::test]
async fn delete_is_idempotent_and_removes_chunks() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    let chunks = vec![chunk(3, 0)];
    let manifest = sealed(3, 1, &chunks);
    let id = adapter.upload(&manifest, &chunks).await.unwrap();

    assert_ok!(adapter.delete(&id).await);
    assert!(!assert_ok!(adapter.chunk_exists(&chunks[0].blob_ref()).await));
    assert!(matches!(
        adapter.get_manifest(&id).await,
        Err(StorageError::NotFound(_))
    ));
    assert_ok!(adapter.delete(&id).await);
}

#[tokio::test]
async fn list_returns_summaries_oldest_first() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    assert!(adapter.list().await.unwrap().is_empty());

    for (id, ts) in [(9u8, 300u64), (4, 100), (6, 200)] {
        let chunks = vec![chunk(id, 0)];
        adapter.upload(&sealed(id, ts, &chunks), &chunks).await.unwrap();
    }
    let listed = adapter.list().await.unwrap();
    let times: Vec<_> = listed.iter().map(|s| s.created_at).collect();
    assert_eq!(times, vec![100, 200, 300]);
    assert_eq!(listed[0].chunk_count, 1);
    assert_eq!(listed[0].key_id, key_record().key_id);
    assert_eq!(listed[0].byte_size, 48);
}

#[tokio::test]
async fn accounts_are_isolated() {
    let op = memory_op();
    let a = OurServersAdapter::new(op.clone(), "backups", "alice");
    let b = OurServersAdapter::new(op, "backups", "bob");
    let chunks = vec![chunk(5, 0)];
    a.upload(&sealed(5, 1, &chunks), &chunks).await.unwrap();
    assert_eq!(a.list().await.unwrap().len(), 1);
    assert!(b.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn key_records_roundtrip() {
    let adapter = ThirdPartyAdapter::new(ThirdPartyProvider::GoogleDrive, memory_op(), "cv", "acct");
    let record = key_record();
    adapter.put_key_record(&record).await.unwrap();
    assert_eq!(adapter.get_key_record(&record.key_id).await.unwrap(), record);
    assert!(adapter.get_key_record("missing").await.unwrap_err().is_not_found());
    assert_eq!(
        adapter.destination(),
        &BackupDestination::ThirdParty(ThirdPartyProvider::GoogleDrive)
    );
}

#[tokio::test]
async fn missing_manifest_is_not_found() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    let err = adapter
        .get_manifest(&BackupId::from_bytes([0xEE; 16]))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!err.is_transient());
}

#[tokio::test]
async fn health_check_on_memory_backend() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    check_health(&adapter).await.unwrap();
}

#[tokio::test]
async fn interrupted_delete_leaves_no_dangling_manifest() {
    let adapter = OurServersAdapter::new(memory_op(), "backups", "acct");
    let chunks = vec![chunk(8, 0), chunk(8, 1)];
    let id = assert_ok!(adapter.upload(&sealed(8, 1, &chunks), &chunks).await);

    // State after the manifest step of a delete that stopped before the chunks.
    let manifest_path = format!("{}/manifests/{id}.json", adapter.prefix());
    assert_ok!(adapter.operator().delete(&manifest_path).await);

    let err = assert_err!(adapter.get_manifest(&id).await);
    assert!(err.is_not_found());
    assert!(assert_ok!(adapter.list().await).is_empty());
    assert!(assert_ok!(adapter.chunk_exists(&chunks[0].blob_ref()).await));

    // Retrying the delete succeeds; the orphaned chunks stay for pruning.
    assert_ok!(adapter.delete(&id).await);
}
