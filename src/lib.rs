/*!
A library for deduplicated backups, inspired by [`restic`](https://restic.net/).

# Overview

This crate implements the archiver core of a content-addressed, deduplicating
backup system: given a set of filesystem targets and an optional parent
snapshot, it walks the filesystem, splits file contents into variable-size
chunks using content-defined chunking, deduplicates chunks against the
repository, serializes directory metadata as tree objects and produces a
snapshot referencing the root tree.

The repository itself (pack files, encryption, index persistence) as well as
exclude rules and progress rendering are external collaborators behind narrow
traits: [`ArchiveRepository`], [`SourceFs`], [`Select`] and
[`ArchiveProgress`].

# Example - create a snapshot into an in-memory repository

```rust
use packrat_core::{
    Archiver, BackupOptions, InMemoryRepository, LocalFs, NoProgress, PathList, SelectAll,
    SnapshotOptions,
};

let dir = tempfile::tempdir().unwrap();
std::fs::write(dir.path().join("hello"), b"hello world").unwrap();

let repo = InMemoryRepository::new().unwrap();
let fs = LocalFs::default();

let archiver = Archiver::new(&repo, &fs, &SelectAll, &NoProgress, BackupOptions::default()).unwrap();
let snap = SnapshotOptions::default().to_snapshot().unwrap();
let source = PathList::from_strings([dir.path().to_str().unwrap()]);

let (snap, summary) = archiver.snapshot(&source, snap, None).unwrap();
assert!(snap.is_some());
assert_eq!(summary.files_new, 1);
```

# Crate features

This crate exposes a feature for controlling dependency usage.

*   **clap** -
    Enables a dependency on the `clap` crate and enables parsing the option
    structs from the commandline. This feature is disabled by default.
*/

#![forbid(unsafe_code)]
#![warn(
    rust_2018_idioms,
    trivial_casts,
    unused_lifetimes,
    unused_qualifications,
    clippy::nursery,
    bad_style,
    dead_code,
    improper_ctypes,
    missing_copy_implementations,
    missing_debug_implementations,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    trivial_numeric_casts,
    unused_results,
    unused_extern_crates,
    unused_import_braces,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true,
    clippy::cast_lossless,
    clippy::default_trait_access,
    clippy::doc_markdown,
    clippy::manual_string_new,
    clippy::match_same_arms,
    clippy::semicolon_if_nothing_returned,
    clippy::trivially_copy_pass_by_ref
)]
#![allow(clippy::module_name_repetitions, clippy::redundant_pub_crate)]

pub(crate) mod archiver;
pub(crate) mod backend;
pub(crate) mod blob;
pub(crate) mod chunker;
pub(crate) mod crypto;
pub mod error;
pub(crate) mod id;
pub(crate) mod index;
pub(crate) mod progress;
pub(crate) mod repofile;
pub(crate) mod repository;

// packrat_core Public API
pub use crate::{
    archiver::{
        future::CancelToken,
        parent::ChangeIgnore,
        Archiver, BackupOptions, ItemStats, Select, SelectAll,
    },
    backend::{
        local::{LocalFs, LocalSourceSaveOptions},
        node::{ExtendedAttribute, Metadata, Node, NodeType},
        SourceFile, SourceFs,
    },
    blob::{tree::Tree, BlobType, BlobTypeMap, Initialize, ALL_BLOB_TYPES},
    chunker::random_poly,
    crypto::hasher::hash,
    error::{PackratError, PackratErrorKind, PackratResult},
    id::{HexId, Id},
    index::ReadIndex,
    progress::{ArchiveProgress, NoProgress},
    repofile::snapshotfile::{
        DeleteOption, PathList, SnapshotFile, SnapshotOptions, SnapshotSummary, StringList,
    },
    repository::{
        in_memory::InMemoryRepository, ArchiveRepository, RepositoryConfig, SaveBlobResponse,
    },
};
