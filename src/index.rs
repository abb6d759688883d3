use crate::{blob::BlobType, id::Id};

/// Read access to the repository's blob index.
///
/// The index answers whether a blob is already present in the repository,
/// which is what allows unchanged files to be skipped without reading them.
pub trait ReadIndex {
    /// Returns the uncompressed size of the given blob, if it is present.
    fn lookup_blob_size(&self, tpe: BlobType, id: &Id) -> Option<u32>;

    /// Returns whether the given blob is present.
    fn has_blob(&self, tpe: BlobType, id: &Id) -> bool {
        self.lookup_blob_size(tpe, id).is_some()
    }

    /// Returns whether the given data blob is present.
    fn has_data(&self, id: &Id) -> bool {
        self.has_blob(BlobType::Data, id)
    }

    /// Returns whether the given tree blob is present.
    fn has_tree(&self, id: &Id) -> bool {
        self.has_blob(BlobType::Tree, id)
    }
}
