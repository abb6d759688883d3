//! Error types and Result module.

use std::{
    ffi::OsString,
    num::ParseIntError,
    path::PathBuf,
};

use displaydoc::Display;
use thiserror::Error;

use crate::id::Id;

/// Result type that is being returned from methods that can fail and thus have [`PackratError`]s.
pub type PackratResult<T> = Result<T, PackratError>;

// [`PackratError`] is public, but opaque and easy to keep compatible.
#[derive(Error, Debug)]
#[error(transparent)]
/// Errors that can result from packrat.
pub struct PackratError(#[from] PackratErrorKind);

// Accessors for anything we do want to expose publicly.
impl PackratError {
    /// Expose the inner error kind.
    ///
    /// This is useful for matching on the error kind.
    pub fn into_inner(self) -> PackratErrorKind {
        self.0
    }

    /// Checks whether this error is the cancellation error.
    ///
    /// Cancellation is always fatal and must not be downgraded by an error hook.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self.0,
            PackratErrorKind::Archiver(ArchiverErrorKind::Cancelled)
        )
    }

    /// Checks whether this error stems from a file which does not exist (anymore).
    ///
    /// Entries which vanish between `readdir` and `open` are silently skipped.
    #[must_use]
    pub fn is_file_not_found(&self) -> bool {
        let io_err = match &self.0 {
            PackratErrorKind::LocalFs(
                LocalFsErrorKind::OpeningFileFailed(err)
                | LocalFsErrorKind::QueryingMetadataFailed(err)
                | LocalFsErrorKind::ReadingDirectoryFailed(err)
                | LocalFsErrorKind::ReadingLinkTargetFailed(err),
            ) => err,
            PackratErrorKind::StdIo(err) => err,
            _ => return false,
        };
        io_err.kind() == std::io::ErrorKind::NotFound
    }
}

/// [`PackratErrorKind`] describes the errors that can happen while creating a snapshot.
///
/// This is a non-exhaustive enum, so additional variants may be added in future. It is
/// recommended to match against the wildcard `_` instead of listing all possible variants,
/// to avoid problems when new variants are added.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum PackratErrorKind {
    /// [`ArchiverErrorKind`] describes the errors that can be returned from the archiver
    #[error(transparent)]
    Archiver(#[from] ArchiverErrorKind),

    /// [`TargetTreeErrorKind`] describes the errors that can be returned while planning the target tree
    #[error(transparent)]
    TargetTree(#[from] TargetTreeErrorKind),

    /// [`TreeErrorKind`] describes the errors that can come up dealing with Trees
    #[error(transparent)]
    Tree(#[from] TreeErrorKind),

    /// [`ChunkerErrorKind`] describes the errors that can happen while chunking file contents
    #[error(transparent)]
    Chunker(#[from] ChunkerErrorKind),

    /// [`IdErrorKind`] describes the errors that can be returned by processing IDs
    #[error(transparent)]
    Id(#[from] IdErrorKind),

    /// [`NodeErrorKind`] describes the errors that can be returned by an action utilizing a node
    #[error(transparent)]
    Node(#[from] NodeErrorKind),

    /// [`LocalFsErrorKind`] describes the errors that can be returned by actions on the local filesystem
    #[error(transparent)]
    LocalFs(#[from] LocalFsErrorKind),

    /// [`SnapshotFileErrorKind`] describes the errors that can be returned for `SnapshotFile`s
    #[error(transparent)]
    SnapshotFile(#[from] SnapshotFileErrorKind),

    /// [`RepositoryErrorKind`] describes the errors that can be returned by processing Repositories
    #[error(transparent)]
    Repository(#[from] RepositoryErrorKind),

    /// [`std::io::Error`]
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

/// [`ArchiverErrorKind`] describes the errors that can be returned from the archiver
#[derive(Error, Debug, Display)]
pub enum ArchiverErrorKind {
    /// snapshot is empty
    EmptySnapshot,
    /// file `{0:?}` changed type, refusing to archive
    FileTypeChanged(PathBuf),
    /// operation was cancelled
    Cancelled,
    /// blobs of file `{0:?}` are missing from the index
    BlobsMissing(PathBuf),
    /// saving blob for `{0:?}` failed: {1:?}
    SavingBlobFailed(PathBuf, Box<PackratError>),
    /// tree for `{0:?}` was saved without a subtree id
    MissingSubtreeId(PathBuf),
}

/// [`TargetTreeErrorKind`] describes the errors that can be returned while planning the target tree
#[derive(Error, Debug, Display)]
pub enum TargetTreeErrorKind {
    /// target `{0:?}` resolves to no path components
    EmptyPathComponents(PathBuf),
    /// target `{0:?}` is not valid unicode
    NonUnicodePath(PathBuf),
    /// cleaning target `{0:?}` failed: `{1:?}`
    CleaningTargetFailed(PathBuf, std::io::Error),
    /// cannot unroll tree: collision on `{0}` between `{1:?}` and `{2:?}`
    UnrollCollision(String, PathBuf, PathBuf),
}

/// [`TreeErrorKind`] describes the errors that can come up dealing with Trees
#[derive(Error, Debug, Display)]
pub enum TreeErrorKind {
    /// serializing the tree failed: `{0:?}`
    SerializingTreeFailed(serde_json::Error),
    /// deserializing the tree failed: `{0:?}`
    DeserializingTreeFailed(serde_json::Error),
    /// tree nodes are not ordered: two different nodes named `{0}`
    NotOrdered(String),
}

/// [`ChunkerErrorKind`] describes the errors that can happen while chunking file contents
#[derive(Error, Debug, Display)]
pub enum ChunkerErrorKind {
    /// reading the file to chunk failed: `{0:?}`
    FromIoError(#[from] std::io::Error),
    /// no suitable polynomial found
    NoSuitablePolynomialFound,
}

/// [`IdErrorKind`] describes the errors that can be returned by processing IDs
#[derive(Error, Debug, Display)]
pub enum IdErrorKind {
    /// Hex error: `{0:?}`
    HexError(#[from] hex::FromHexError),
    /// empty hex string
    EmptyHexString,
    /// non-ASCII hex string
    NonAsciiHexString,
    /// parsing id from string `{0}` failed
    ParsingIdFromStringFailed(String),
}

/// [`NodeErrorKind`] describes the errors that can be returned by an action utilizing a node
#[derive(Error, Debug, Display)]
pub enum NodeErrorKind {
    /// unexpected EOF in escape sequence
    UnexpectedEOF,
    /// invalid unicode codepoint in escape sequence
    InvalidUnicode,
    /// unrecognized escape sequence
    UnrecognizedEscape,
    /// parsing hex failed: `{0:?}`
    FromParseIntError(#[from] ParseIntError),
}

/// [`LocalFsErrorKind`] describes the errors that can be returned by actions on the local filesystem
#[derive(Error, Debug, Display)]
pub enum LocalFsErrorKind {
    /// opening file failed: `{0:?}`
    OpeningFileFailed(std::io::Error),
    /// querying metadata failed: `{0:?}`
    QueryingMetadataFailed(std::io::Error),
    /// reading directory failed: `{0:?}`
    ReadingDirectoryFailed(std::io::Error),
    /// reading link target failed: `{0:?}`
    ReadingLinkTargetFailed(std::io::Error),
    /// determining the current directory failed: `{0:?}`
    DeterminingCurrentDirFailed(std::io::Error),
    /// cleaning path failed: `{0:?}`
    CleaningPathFailed(std::io::Error),
    /// file handle is metadata-only and cannot be made readable
    NotReadable,
    /// path is no directory
    PathIsNoDirectory,
    /// integer conversion failed: `{0:?}`
    FromTryFromIntError(#[from] std::num::TryFromIntError),
}

/// [`SnapshotFileErrorKind`] describes the errors that can be returned for `SnapshotFile`s
#[derive(Error, Debug, Display)]
pub enum SnapshotFileErrorKind {
    /// non-unicode path `{0:?}`
    NonUnicodePath(PathBuf),
    /// non-unicode hostname `{0:?}`
    NonUnicodeHostname(OsString),
    /// out of range for duration: `{0:?}`
    OutOfRange(#[from] chrono::OutOfRangeError),
    /// removing dots from path failed: `{0:?}`
    RemovingDotsFromPathFailed(std::io::Error),
    /// canonicalizing path failed: `{0:?}`
    CanonicalizingPathFailed(std::io::Error),
    /// reading description file failed: `{0:?}`
    ReadingDescriptionFailed(std::io::Error),
}

/// [`RepositoryErrorKind`] describes the errors that can be returned by processing Repositories
#[derive(Error, Debug, Display)]
pub enum RepositoryErrorKind {
    /// parsing polynomial `{0}` failed: `{1:?}`
    ParsingPolynomialFailed(String, ParseIntError),
    /// tree `{0:?}` is not present in the repository
    TreeNotFound(Id),
    /// saving blob failed: `{0}`
    SavingBlobFailed(String),
}

trait PackratErrorMarker: std::error::Error {}

impl PackratErrorMarker for ArchiverErrorKind {}
impl PackratErrorMarker for TargetTreeErrorKind {}
impl PackratErrorMarker for TreeErrorKind {}
impl PackratErrorMarker for ChunkerErrorKind {}
impl PackratErrorMarker for IdErrorKind {}
impl PackratErrorMarker for NodeErrorKind {}
impl PackratErrorMarker for LocalFsErrorKind {}
impl PackratErrorMarker for SnapshotFileErrorKind {}
impl PackratErrorMarker for RepositoryErrorKind {}
impl PackratErrorMarker for std::io::Error {}

impl<E> From<E> for PackratError
where
    E: PackratErrorMarker,
    PackratErrorKind: From<E>,
{
    fn from(value: E) -> Self {
        Self(PackratErrorKind::from(value))
    }
}
