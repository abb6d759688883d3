//! End-to-end snapshot tests against temporary directories and an in-memory repository.

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
};

use anyhow::Result;
use pretty_assertions::assert_eq;
use simplelog::{Config, LevelFilter, SimpleLogger};

use packrat_core::{
    ArchiveRepository, Archiver, BackupOptions, BlobType, InMemoryRepository, LocalFs, Node,
    NodeType, NoProgress, PackratResult, PathList, Select, SelectAll, SnapshotFile,
    SnapshotOptions, SnapshotSummary, Tree,
};

/// What a snapshot looks like from the outside, reconstructed from the repository.
#[derive(Debug, PartialEq, Eq)]
enum Entry {
    File(Vec<u8>),
    Dir,
    Symlink(PathBuf),
}

fn restore_view(repo: &InMemoryRepository, tree: &packrat_core::Id) -> BTreeMap<PathBuf, Entry> {
    let mut view = BTreeMap::new();
    collect_entries(repo, tree, Path::new("/"), &mut view);
    view
}

fn collect_entries(
    repo: &InMemoryRepository,
    tree: &packrat_core::Id,
    prefix: &Path,
    view: &mut BTreeMap<PathBuf, Entry>,
) {
    let tree = repo.load_tree(tree).unwrap();

    // names must be strictly ascending within every tree blob
    let names: Vec<_> = tree.nodes.iter().map(|node| node.name.clone()).collect();
    let mut sorted = names.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(names, sorted, "tree nodes are not sorted in {prefix:?}");

    for node in &tree.nodes {
        let path = prefix.join(node.name());
        match &node.node_type {
            NodeType::File => {
                let mut data = Vec::new();
                for id in node.content.iter().flatten() {
                    data.extend_from_slice(&repo.blob(BlobType::Data, id).expect("missing blob"));
                }
                assert_eq!(data.len() as u64, node.meta.size);
                let _ = view.insert(path, Entry::File(data));
            }
            NodeType::Dir => {
                let subtree = node.subtree.expect("dir node without subtree");
                collect_entries(repo, &subtree, &path, view);
                let _ = view.insert(path, Entry::Dir);
            }
            NodeType::Symlink { .. } => {
                let _ = view.insert(path, Entry::Symlink(node.node_type.to_link().to_path_buf()));
            }
            _ => {
                let _ = view.insert(path, Entry::Dir);
            }
        }
    }
}

// make the archiver's `debug!`/`warn!` output visible when running the tests
fn init_logger() {
    let _ = SimpleLogger::init(LevelFilter::Debug, Config::default());
}

fn snapshot(
    repo: &InMemoryRepository,
    target: &Path,
    opts: BackupOptions,
    parent: Option<&SnapshotFile>,
) -> PackratResult<(Option<SnapshotFile>, SnapshotSummary)> {
    init_logger();
    let fs = LocalFs::default();
    let archiver = Archiver::new(repo, &fs, &SelectAll, &NoProgress, opts)?;
    let snap = SnapshotOptions::default().host("testhost").to_snapshot()?;
    let source = PathList::from_strings([target.to_str().unwrap()]);
    archiver.snapshot(&source, snap, parent)
}

// Tests comparing tree ids across runs use relative targets: absolute
// targets make the plan span ancestors like `/tmp` whose metadata other
// processes change at any time. Relative targets need a controlled working
// directory, and the working directory is per-process, hence the lock.
static CWD_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

fn with_cwd<T>(dir: &Path, f: impl FnOnce() -> T) -> T {
    let _guard = CWD_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir).unwrap();
    let result = f();
    std::env::set_current_dir(previous).unwrap();
    result
}

fn fixture_in(root: &Path) -> Result<()> {
    fs::create_dir_all(root)?;
    fs::write(root.join("foobar"), b"foobar")?;
    fs::write(root.join("empty"), b"")?;
    fs::create_dir(root.join("sub"))?;
    fs::write(root.join("sub/file"), b"contents of sub/file")?;
    fs::create_dir(root.join("sub/empty-dir"))?;
    #[cfg(unix)]
    std::os::unix::fs::symlink("foobar", root.join("link"))?;
    Ok(())
}

fn fixture() -> Result<tempfile::TempDir> {
    let dir = tempfile::tempdir()?;
    fixture_in(dir.path())?;
    Ok(dir)
}

#[test]
fn test_snapshot_restores_fixture() -> Result<()> {
    let dir = fixture()?;
    let repo = InMemoryRepository::new()?;

    let (snap, summary) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;
    let snap = snap.expect("snapshot should be written");

    assert!(repo.uploader_started());
    assert!(!snap.id.is_null());
    assert_eq!(repo.snapshot(&snap.id).unwrap().tree, snap.tree);
    assert_eq!(snap.hostname, "testhost");
    assert_eq!(
        snap.paths.formatln(),
        dir.path().to_str().unwrap().to_string()
    );

    let view = restore_view(&repo, &snap.tree);
    let root = Path::new("/").join(dir.path().strip_prefix("/")?);
    assert_eq!(view[&root.join("foobar")], Entry::File(b"foobar".to_vec()));
    assert_eq!(view[&root.join("empty")], Entry::File(Vec::new()));
    assert_eq!(
        view[&root.join("sub/file")],
        Entry::File(b"contents of sub/file".to_vec())
    );
    assert_eq!(view[&root.join("sub/empty-dir")], Entry::Dir);
    #[cfg(unix)]
    assert_eq!(view[&root.join("link")], Entry::Symlink("foobar".into()));

    assert_eq!(summary.files_new, if cfg!(unix) { 4 } else { 3 });
    assert_eq!(summary.files_changed, 0);
    assert_eq!(summary.files_unmodified, 0);
    assert!(summary.dirs_new > 0);
    assert_eq!(summary.total_bytes_processed, 26);

    Ok(())
}

#[test]
fn test_single_file_stats() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("targetfile"), b"foobar")?;
    let repo = InMemoryRepository::new()?;

    let (_, summary) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;

    assert_eq!(summary.data_blobs, 1);
    assert_eq!(summary.data_added_files, 6);
    // 32 bytes of per-blob storage overhead on top of the 6 content bytes
    assert_eq!(summary.data_added_files_packed, 38);
    assert!(summary.tree_blobs > 0);
    assert_eq!(repo.blob_count(BlobType::Data), 1);

    Ok(())
}

#[test]
fn test_empty_file_saves_no_blobs() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("empty"), b"")?;
    let repo = InMemoryRepository::new()?;

    let (snap, summary) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;

    assert_eq!(repo.blob_count(BlobType::Data), 0);
    assert_eq!(summary.data_blobs, 0);

    let view = restore_view(&repo, &snap.unwrap().tree);
    assert!(view.values().any(|entry| entry == &Entry::File(Vec::new())));

    Ok(())
}

#[test]
fn test_empty_dir_saves_empty_tree() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::create_dir(dir.path().join("void"))?;
    let repo = InMemoryRepository::new()?;

    let (snap, _) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;

    // find the node for `void` and check it references the empty tree
    let mut tree_id = snap.unwrap().tree;
    let void = loop {
        let tree = repo.load_tree(&tree_id).unwrap();
        assert_eq!(tree.nodes.len(), 1);
        let node = &tree.nodes[0];
        if node.name() == "void" {
            break node.clone();
        }
        tree_id = node.subtree.expect("expected a dir node");
    };

    let subtree = void.subtree.expect("empty dir should have a subtree");
    assert_eq!(repo.load_tree(&subtree).unwrap().nodes.len(), 0);

    Ok(())
}

#[test]
fn test_snapshots_are_deterministic() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixture_in(&dir.path().join("data"))?;
    let repo = InMemoryRepository::new()?;

    let (first, second) = with_cwd(dir.path(), || -> Result<_> {
        let (first, _) = snapshot(&repo, Path::new("data"), BackupOptions::default(), None)?;
        let data_blobs = repo.blob_count(BlobType::Data);
        let tree_blobs = repo.blob_count(BlobType::Tree);

        let (second, _) = snapshot(&repo, Path::new("data"), BackupOptions::default(), None)?;

        // everything deduplicated: the second run adds no blobs at all
        assert_eq!(repo.blob_count(BlobType::Data), data_blobs);
        assert_eq!(repo.blob_count(BlobType::Tree), tree_blobs);
        Ok((first.unwrap(), second.unwrap()))
    })?;

    assert_eq!(first.tree, second.tree);

    Ok(())
}

#[test]
fn test_parent_skips_reading_unchanged_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixture_in(&dir.path().join("data"))?;
    let repo = InMemoryRepository::new()?;

    let (first, first_summary, second, summary) = with_cwd(dir.path(), || -> Result<_> {
        let (first, first_summary) =
            snapshot(&repo, Path::new("data"), BackupOptions::default(), None)?;
        let first = first.unwrap();
        let (second, summary) = snapshot(
            &repo,
            Path::new("data"),
            BackupOptions::default(),
            Some(&first),
        )?;
        Ok((first, first_summary, second.unwrap(), summary))
    })?;

    assert_eq!(second.tree, first.tree);
    assert_eq!(second.parent, Some(first.id));
    assert_eq!(summary.files_unmodified, first_summary.files_new);
    assert_eq!(summary.files_new, 0);
    assert_eq!(summary.files_changed, 0);
    assert_eq!(summary.dirs_unmodified, first_summary.dirs_new);
    assert_eq!(summary.data_blobs, 0);
    assert_eq!(summary.tree_blobs, 0);

    Ok(())
}

#[test]
fn test_skip_if_unchanged_writes_no_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fixture_in(&dir.path().join("data"))?;
    let repo = InMemoryRepository::new()?;

    let (second, summary) = with_cwd(dir.path(), || -> Result<_> {
        let (first, _) = snapshot(&repo, Path::new("data"), BackupOptions::default(), None)?;
        let first = first.unwrap();
        snapshot(
            &repo,
            Path::new("data"),
            BackupOptions::default().skip_if_unchanged(true),
            Some(&first),
        )
        .map_err(Into::into)
    })?;

    assert!(second.is_none());
    assert_eq!(summary.files_unmodified, if cfg!(unix) { 4 } else { 3 });

    Ok(())
}

#[test]
fn test_modified_file_is_reread() -> Result<()> {
    let dir = fixture()?;
    let repo = InMemoryRepository::new()?;

    let (first, _) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;
    let first = first.unwrap();

    // mtime granularity can be coarse, make sure the size changes as well
    fs::write(dir.path().join("foobar"), b"changed!")?;

    let (second, summary) = snapshot(&repo, dir.path(), BackupOptions::default(), Some(&first))?;

    assert_eq!(summary.files_changed, 1);
    assert_eq!(summary.files_unmodified, if cfg!(unix) { 3 } else { 2 });
    assert_eq!(summary.files_new, 0);
    assert_eq!(summary.data_blobs, 1);

    let view = restore_view(&repo, &second.unwrap().tree);
    assert!(view
        .values()
        .any(|entry| entry == &Entry::File(b"changed!".to_vec())));

    Ok(())
}

/// A selector which drops all entries.
struct ExcludeEverything;

impl Select for ExcludeEverything {
    fn select_by_name(&self, _path: &Path) -> bool {
        false
    }
}

#[test]
fn test_all_excluded_yields_empty_snapshot_error() -> Result<()> {
    init_logger();
    let dir = tempfile::tempdir()?;
    fixture_in(&dir.path().join("data"))?;
    let repo = InMemoryRepository::new()?;
    let fs = LocalFs::default();

    // a relative target keeps the plan free of ancestor directories, so
    // excluding everything leaves the root tree without any nodes
    let result = with_cwd(dir.path(), || {
        let archiver = Archiver::new(
            &repo,
            &fs,
            &ExcludeEverything,
            &NoProgress,
            BackupOptions::default(),
        )?;
        let snap = SnapshotOptions::default().to_snapshot()?;
        archiver.snapshot(&PathList::from_strings(["data"]), snap, None)
    });

    assert!(result.is_err());
    assert!(result
        .unwrap_err()
        .to_string()
        .contains("snapshot is empty"));

    Ok(())
}

/// A selector which counts errors and downgrades all of them.
#[derive(Default)]
struct IgnoreErrors(AtomicUsize);

impl Select for IgnoreErrors {
    fn error(&self, _path: &Path, _err: packrat_core::PackratError) -> PackratResult<()> {
        let _ = self.0.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_missing_parent_blobs_cause_reread() -> Result<()> {
    let dir = fixture()?;
    let repo = InMemoryRepository::new()?;

    let (first, _) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;
    let first = first.unwrap();

    // damage the repository: drop the blob holding "foobar"
    let foobar = walk_to_file(&repo, &first.tree, "foobar").expect("foobar node");
    let foobar_id = foobar.content.unwrap()[0];
    repo.remove_blob(BlobType::Data, &foobar_id);

    init_logger();
    let hook = IgnoreErrors::default();
    let fs = LocalFs::default();
    let archiver = Archiver::new(&repo, &fs, &hook, &NoProgress, BackupOptions::default())?;
    let snap = SnapshotOptions::default().to_snapshot()?;
    let source = PathList::from_strings([dir.path().to_str().unwrap()]);

    let (second, summary) = archiver.snapshot(&source, snap, Some(&first))?;

    // the file was re-read and the blob is back; stats reflect only the
    // newly added blob, the file itself still counts as unmodified
    assert!(second.is_some());
    assert!(repo.blob(BlobType::Data, &foobar_id).is_some());
    assert_eq!(summary.data_blobs, 1);
    assert_eq!(summary.files_new, 0);
    assert_eq!(summary.files_changed, 0);
    assert_eq!(hook.0.load(Ordering::SeqCst), 1);

    Ok(())
}

fn walk_to_file(repo: &InMemoryRepository, tree: &packrat_core::Id, name: &str) -> Option<Node> {
    let tree = repo.load_tree(tree).ok()?;
    for node in &tree.nodes {
        if node.name() == name && node.is_file() {
            return Some(node.clone());
        }
        if let Some(subtree) = node.subtree {
            if let Some(found) = walk_to_file(repo, &subtree, name) {
                return Some(found);
            }
        }
    }
    None
}

#[test]
fn test_save_blob_error_fails_snapshot() -> Result<()> {
    let dir = tempfile::tempdir()?;
    for i in 0..9 {
        // distinct contents, so every file submits its own blob
        fs::write(dir.path().join(format!("file-{i}")), format!("content {i}"))?;
    }
    let repo = InMemoryRepository::new()?;
    repo.fail_blobs_after(4);

    let opts = BackupOptions::default()
        .read_concurrency(2_usize)
        .save_blob_concurrency(1_usize);
    let err = snapshot(&repo, dir.path(), opts, None).unwrap_err();

    assert!(!err.is_cancelled());
    assert!(err.to_string().contains("repository storage is gone"));

    Ok(())
}

#[cfg(unix)]
#[test]
fn test_sockets_are_skipped() -> Result<()> {
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("file"), b"data")?;
    let _listener = std::os::unix::net::UnixListener::bind(dir.path().join("sock"))?;
    let repo = InMemoryRepository::new()?;

    let (snap, summary) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;

    let view = restore_view(&repo, &snap.unwrap().tree);
    assert!(!view.keys().any(|path| path.ends_with("sock")));
    assert_eq!(summary.files_new, 1);

    Ok(())
}

#[test]
fn test_vanished_file_is_skipped_silently() -> Result<()> {
    // a file which disappears between readdir and open is skipped without
    // consulting the error hook; deleting it before the walk reaches it is
    // not reliably racy, so only assert the simple case: a snapshot over a
    // directory whose entry vanished after planning still succeeds.
    init_logger();
    let dir = tempfile::tempdir()?;
    fs::write(dir.path().join("stays"), b"here")?;
    let missing = dir.path().join("never-there");
    let repo = InMemoryRepository::new()?;

    let fs_src = LocalFs::default();
    let archiver = Archiver::new(
        &repo,
        &fs_src,
        &SelectAll,
        &NoProgress,
        BackupOptions::default(),
    )?;
    let snap = SnapshotOptions::default().to_snapshot()?;
    let source = PathList::from_strings([
        dir.path().join("stays").to_str().unwrap(),
        missing.to_str().unwrap(),
    ]);

    let (snap, summary) = archiver.snapshot(&source, snap, None)?;

    assert!(snap.is_some());
    assert_eq!(summary.files_new, 1);

    Ok(())
}

#[test]
fn test_tags_and_excludes_are_recorded() -> Result<()> {
    init_logger();
    let dir = fixture()?;
    let repo = InMemoryRepository::new()?;
    let fs = LocalFs::default();

    let opts = BackupOptions::default().excludes(vec!["*.tmp".to_string()]);
    let archiver = Archiver::new(&repo, &fs, &SelectAll, &NoProgress, opts)?;
    let snap = SnapshotOptions::default()
        .add_tags("nightly,offsite")?
        .to_snapshot()?;
    let source = PathList::from_strings([dir.path().to_str().unwrap()]);

    let (snap, _) = archiver.snapshot(&source, snap, None)?;
    let snap = snap.unwrap();

    assert_eq!(snap.excludes, ["*.tmp"]);
    assert_eq!(snap.tags.formatln(), "nightly\noffsite");
    assert!(snap.summary.is_some());

    let stored = repo.snapshot(&snap.id).unwrap();
    assert_eq!(stored.excludes, snap.excludes);

    Ok(())
}

#[test]
fn test_tree_roundtrip_through_repository() -> Result<()> {
    let dir = fixture()?;
    let repo = InMemoryRepository::new()?;

    let (snap, _) = snapshot(&repo, dir.path(), BackupOptions::default(), None)?;
    let snap = snap.unwrap();

    // the root tree must round-trip bit-exact through serialization
    let root: Tree = repo.load_tree(&snap.tree)?;
    let (_, id) = root.serialize()?;
    assert_eq!(id, snap.tree);

    Ok(())
}
