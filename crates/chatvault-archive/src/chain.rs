//! Reassembling a message set from a manifest chain
//!
//! Manifests are applied root first; a later manifest's record replaces an
//! earlier one with the same id. Nothing is returned until the whole chain
//! has been applied.

use std::collections::BTreeMap;

use chatvault_core::types::{sort_messages, BackupId, MessageRecord};

use crate::error::ArchiveError;
use crate::manifest::BackupManifest;

#[derive(Debug)]
pub struct ChainAssembler {
    expected: Vec<BackupId>,
    applied: usize,
    records: BTreeMap<String, MessageRecord>,
}

impl ChainAssembler {
    /// Prepare to rebuild `target` from its ancestors plus itself.
    pub fn new(target: &BackupManifest) -> Self {
        let mut expected = target.ancestors.clone();
        expected.push(target.backup_id);
        Self {
            expected,
            applied: 0,
            records: BTreeMap::new(),
        }
    }

    /// Manifest ids to apply, root first
    pub fn expected(&self) -> &[BackupId] {
        &self.expected
    }

    /// Apply the next manifest in the chain with its decoded records.
    pub fn apply(
        &mut self,
        manifest: &BackupManifest,
        records: Vec<MessageRecord>,
    ) -> Result<(), ArchiveError> {
        let Some(want) = self.expected.get(self.applied) else {
            return Err(ArchiveError::BrokenChain(format!(
                "unexpected manifest {} after end of chain",
                manifest.backup_id
            )));
        };
        if manifest.backup_id != *want {
            return Err(ArchiveError::BrokenChain(format!(
                "expected manifest {want}, got {}",
                manifest.backup_id
            )));
        }
        let want_parent = self
            .applied
            .checked_sub(1)
            .and_then(|i| self.expected.get(i))
            .copied();
        if manifest.parent_id != want_parent {
            return Err(ArchiveError::BrokenChain(format!(
                "manifest {} does not link to its predecessor",
                manifest.backup_id
            )));
        }

        for record in records {
            self.records.insert(record.id.clone(), record);
        }
        self.applied += 1;
        Ok(())
    }

    /// Finish once every manifest has been applied.
    pub fn finish(self) -> Result<Vec<MessageRecord>, ArchiveError> {
        if self.applied != self.expected.len() {
            return Err(ArchiveError::BrokenChain(format!(
                "applied {} of {} manifests",
                self.applied,
                self.expected.len()
            )));
        }
        let mut messages: Vec<MessageRecord> = self.records.into_values().collect();
        sort_messages(&mut messages);
        Ok(messages)
    }
}
