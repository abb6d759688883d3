pub(crate) mod in_memory;

use serde_derive::{Deserialize, Serialize};

use crate::{
    blob::tree::Tree, blob::BlobType, error::RepositoryErrorKind, id::Id, index::ReadIndex,
    repofile::snapshotfile::SnapshotFile, PackratResult,
};

/// Repository-wide configuration the archiver needs.
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    /// Repository version
    pub version: u32,

    /// The [`Id`] identifying the repository
    pub id: Id,

    /// The chunker polynomial used to chunk data, hex-encoded
    pub chunker_polynomial: String,
}

impl RepositoryConfig {
    /// Creates a new configuration with a random id and polynomial.
    ///
    /// # Errors
    ///
    /// * If no suitable polynomial could be found.
    pub fn random() -> PackratResult<Self> {
        Ok(Self {
            version: 1,
            id: Id::random(),
            chunker_polynomial: format!("{:x}", crate::chunker::random_poly()?),
        })
    }

    /// Get the chunker polynomial.
    ///
    /// # Errors
    ///
    /// * [`RepositoryErrorKind::ParsingPolynomialFailed`] - If the stored polynomial is not parsable.
    ///
    /// [`RepositoryErrorKind::ParsingPolynomialFailed`]: crate::error::RepositoryErrorKind::ParsingPolynomialFailed
    pub fn poly(&self) -> PackratResult<u64> {
        Ok(u64::from_str_radix(&self.chunker_polynomial, 16).map_err(|err| {
            RepositoryErrorKind::ParsingPolynomialFailed(self.chunker_polynomial.clone(), err)
        })?)
    }
}

/// The response of a blob save.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveBlobResponse {
    /// The content-addressed id of the blob.
    pub id: Id,
    /// Whether the blob was already present in the repository.
    pub known: bool,
    /// The uncompressed length of the blob.
    pub length: u64,
    /// The number of bytes the blob occupies in the repository.
    pub size_in_repo: u64,
}

/// The narrow repository interface the archiver works against.
///
/// Pack assembly, encryption, compression and index persistence all live
/// behind this trait; the archiver only submits content-addressed blobs and
/// retrieves trees.
pub trait ArchiveRepository: ReadIndex + Sync {
    /// The repository configuration.
    fn config(&self) -> &RepositoryConfig;

    /// Begin background upload of packs.
    fn start_pack_uploader(&self);

    /// Store the given data as a blob of the given type.
    ///
    /// Saving is idempotent: storing content which is already present
    /// returns the existing id with `known = true` and does not grow the
    /// repository.
    ///
    /// # Errors
    ///
    /// If the blob could not be stored.
    fn save_blob(&self, tpe: BlobType, data: &[u8]) -> PackratResult<SaveBlobResponse>;

    /// Fetch and deserialize the tree with the given id.
    ///
    /// # Errors
    ///
    /// If the tree is not present or could not be deserialized.
    fn load_tree(&self, id: &Id) -> PackratResult<Tree>;

    /// Wait until all outstanding packs are durably stored.
    ///
    /// # Errors
    ///
    /// If flushing fails.
    fn flush(&self) -> PackratResult<()>;

    /// Persist the snapshot record as an unpacked file.
    ///
    /// # Errors
    ///
    /// If the snapshot could not be stored.
    fn save_snapshot(&self, snap: &SnapshotFile) -> PackratResult<Id>;
}
