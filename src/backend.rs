pub(crate) mod local;
pub(crate) mod node;

use std::{
    ffi::OsString,
    io::Read,
    path::{Path, PathBuf},
};

use crate::{backend::node::Node, PackratResult};

/// A [`SourceFs`] is a filesystem which can be read from for a backup.
///
/// Opening never follows symlinks: the first open of every path uses
/// no-follow semantics so that a symlink is archived as a symlink even if
/// it is swapped in concurrently.
pub trait SourceFs: Sync {
    /// The file handle type of this filesystem.
    type File: SourceFile;

    /// Open the given path for metadata access without following symlinks.
    ///
    /// The returned handle allows to stat the entry and, for directories, to
    /// list its entry names. Regular files additionally support
    /// [`SourceFile::make_readable`] to prepare reading file contents.
    ///
    /// # Errors
    ///
    /// If the path could not be opened.
    fn open_file(&self, path: &Path) -> PackratResult<Self::File>;

    /// Turn the given path into an absolute path.
    ///
    /// # Errors
    ///
    /// If the current directory could not be determined.
    fn abs(&self, path: &Path) -> PackratResult<PathBuf>;
}

/// An open file handle within a [`SourceFs`].
///
/// The handle owns the underlying resource; dropping it closes the file.
pub trait SourceFile: Read + Send {
    /// Stat the open handle.
    ///
    /// For handles backed by an open file descriptor this queries the
    /// descriptor, not the path, so a concurrent rename or swap of the path
    /// cannot change what is being reported.
    ///
    /// # Errors
    ///
    /// If the metadata could not be queried.
    fn stat(&self, name: &std::ffi::OsStr) -> PackratResult<Node>;

    /// List the names of the directory entries of this handle.
    ///
    /// # Errors
    ///
    /// If the handle is not a directory or the directory could not be read.
    fn read_dir_names(&self) -> PackratResult<Vec<OsString>>;

    /// Prepare an opened handle for reading file contents.
    ///
    /// # Errors
    ///
    /// If the handle cannot be read, e.g. because it is metadata-only.
    fn make_readable(&mut self) -> PackratResult<()>;
}
