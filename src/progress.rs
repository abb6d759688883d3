use std::{path::Path, time::Duration};

use crate::{archiver::ItemStats, backend::node::Node};

/// Observability hooks fired by the archiver while a snapshot is created.
///
/// All hooks may be called from arbitrary worker threads and must be safe
/// under concurrent calls. Implementations should return quickly, as some
/// hooks are fired with internal locks held by the caller close by.
pub trait ArchiveProgress: Send + Sync {
    /// A file is about to be read.
    fn start_file(&self, _path: &Path) {}

    /// Reading a file has finished; its chunks may still be uploading.
    fn complete_reading(&self, _path: &Path) {}

    /// A blob of the given uncompressed size has been processed.
    fn complete_blob(&self, _bytes: u64) {}

    /// An item has been fully saved.
    ///
    /// `previous` is the matching node of the parent snapshot, if any;
    /// `current` is the node as archived now.
    fn complete_item(
        &self,
        _path: &Path,
        _previous: Option<&Node>,
        _current: Option<&Node>,
        _stats: &ItemStats,
        _duration: Duration,
    ) {
    }
}

/// An [`ArchiveProgress`] implementation which reports nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoProgress;

impl ArchiveProgress for NoProgress {}
