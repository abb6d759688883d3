use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use crate::{
    blob::{tree::Tree, BlobType, BlobTypeMap},
    crypto::hasher::hash,
    error::RepositoryErrorKind,
    id::Id,
    index::ReadIndex,
    repofile::snapshotfile::SnapshotFile,
    repository::{ArchiveRepository, RepositoryConfig, SaveBlobResponse},
    PackratResult,
};

pub(super) mod constants {
    /// Per-blob overhead of the repository storage format (nonce + MAC).
    pub(super) const BLOB_OVERHEAD: u64 = 32;
}

/// An [`ArchiveRepository`] keeping all blobs and snapshots in memory.
///
/// Blobs are content-addressed and deduplicated like in a real repository,
/// with a fixed per-blob storage overhead. Useful for tests, examples and
/// dry runs; real repositories live behind the same trait in the
/// repository crates.
#[derive(Debug)]
pub struct InMemoryRepository {
    /// The repository configuration.
    config: RepositoryConfig,
    /// All saved blobs by type and id.
    blobs: Mutex<BlobTypeMap<HashMap<Id, Vec<u8>>>>,
    /// All saved snapshots by id.
    snapshots: Mutex<HashMap<Id, SnapshotFile>>,
    /// Whether the pack uploader was started.
    uploader_started: AtomicBool,
    /// Let this many blob saves succeed, then fail every save.
    fail_blobs_after: Mutex<Option<u64>>,
}

impl InMemoryRepository {
    /// Creates a new repository with a random id and chunker polynomial.
    ///
    /// # Errors
    ///
    /// * If no suitable chunker polynomial could be found.
    pub fn new() -> PackratResult<Self> {
        Ok(Self::with_config(RepositoryConfig::random()?))
    }

    /// Creates a new repository using the given configuration.
    #[must_use]
    pub fn with_config(config: RepositoryConfig) -> Self {
        Self {
            config,
            blobs: Mutex::new(BlobTypeMap::default()),
            snapshots: Mutex::new(HashMap::new()),
            uploader_started: AtomicBool::new(false),
            fail_blobs_after: Mutex::new(None),
        }
    }

    /// Makes the next `count` blob saves succeed and every following one fail.
    ///
    /// This simulates a repository whose storage goes away mid-backup.
    pub fn fail_blobs_after(&self, count: u64) {
        *self.fail_blobs_after.lock().unwrap() = Some(count);
    }

    /// Removes the given blob, simulating a damaged repository.
    pub fn remove_blob(&self, tpe: BlobType, id: &Id) {
        _ = self.blobs.lock().unwrap()[tpe].remove(id);
    }

    /// Returns the contents of the given blob, if present.
    #[must_use]
    pub fn blob(&self, tpe: BlobType, id: &Id) -> Option<Vec<u8>> {
        self.blobs.lock().unwrap()[tpe].get(id).cloned()
    }

    /// Number of blobs of the given type.
    #[must_use]
    pub fn blob_count(&self, tpe: BlobType) -> usize {
        self.blobs.lock().unwrap()[tpe].len()
    }

    /// Returns the snapshot with the given id, if present.
    #[must_use]
    pub fn snapshot(&self, id: &Id) -> Option<SnapshotFile> {
        self.snapshots.lock().unwrap().get(id).cloned()
    }

    /// Whether the pack uploader was started.
    #[must_use]
    pub fn uploader_started(&self) -> bool {
        self.uploader_started.load(Ordering::SeqCst)
    }
}

impl ReadIndex for InMemoryRepository {
    fn lookup_blob_size(&self, tpe: BlobType, id: &Id) -> Option<u32> {
        self.blobs.lock().unwrap()[tpe]
            .get(id)
            .map(|blob| u32::try_from(blob.len()).unwrap_or(u32::MAX))
    }
}

impl ArchiveRepository for InMemoryRepository {
    fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    fn start_pack_uploader(&self) {
        self.uploader_started.store(true, Ordering::SeqCst);
    }

    fn save_blob(&self, tpe: BlobType, data: &[u8]) -> PackratResult<SaveBlobResponse> {
        {
            let mut fail_after = self.fail_blobs_after.lock().unwrap();
            if let Some(remaining) = fail_after.as_mut() {
                if *remaining == 0 {
                    return Err(RepositoryErrorKind::SavingBlobFailed(
                        "repository storage is gone".to_string(),
                    )
                    .into());
                }
                *remaining -= 1;
            }
        }

        let id = hash(data);
        let mut blobs = self.blobs.lock().unwrap();
        let known = blobs[tpe].contains_key(&id);
        if !known {
            _ = blobs[tpe].insert(id, data.to_vec());
        }

        Ok(SaveBlobResponse {
            id,
            known,
            length: data.len() as u64,
            size_in_repo: data.len() as u64 + constants::BLOB_OVERHEAD,
        })
    }

    fn load_tree(&self, id: &Id) -> PackratResult<Tree> {
        let data = self
            .blob(BlobType::Tree, id)
            .ok_or(RepositoryErrorKind::TreeNotFound(*id))?;
        Tree::from_slice(&data)
    }

    fn flush(&self) -> PackratResult<()> {
        Ok(())
    }

    fn save_snapshot(&self, snap: &SnapshotFile) -> PackratResult<Id> {
        let data = serde_json::to_vec(snap).map_err(|err| {
            RepositoryErrorKind::SavingBlobFailed(format!("serializing snapshot failed: {err}"))
        })?;
        let id = hash(&data);
        let mut snap = snap.clone();
        snap.id = id;
        _ = self.snapshots.lock().unwrap().insert(id, snap);
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_blob_deduplicates_passes() {
        let repo = InMemoryRepository::new().unwrap();

        let first = repo.save_blob(BlobType::Data, b"foobar").unwrap();
        let second = repo.save_blob(BlobType::Data, b"foobar").unwrap();

        assert!(!first.known);
        assert!(second.known);
        assert_eq!(first.id, second.id);
        assert_eq!(first.length, 6);
        assert_eq!(first.size_in_repo, 38);
        assert_eq!(repo.blob_count(BlobType::Data), 1);
    }

    #[test]
    fn test_blob_types_have_separate_namespaces_passes() {
        let repo = InMemoryRepository::new().unwrap();

        let data = repo.save_blob(BlobType::Data, b"foobar").unwrap();
        let tree = repo.save_blob(BlobType::Tree, b"foobar").unwrap();

        assert_eq!(data.id, tree.id);
        assert!(!tree.known);
        assert!(repo.has_data(&data.id));
        assert!(repo.has_tree(&data.id));
    }

    #[test]
    fn test_load_missing_tree_fails() {
        let repo = InMemoryRepository::new().unwrap();

        assert!(repo.load_tree(&Id::random()).is_err());
    }

    #[test]
    fn test_fail_blobs_after_passes() {
        let repo = InMemoryRepository::new().unwrap();
        repo.fail_blobs_after(1);

        assert!(repo.save_blob(BlobType::Data, b"one").is_ok());
        assert!(repo.save_blob(BlobType::Data, b"two").is_err());
    }
}
