pub(crate) mod blob_saver;
pub(crate) mod buffer_pool;
pub(crate) mod file_saver;
pub(crate) mod future;
pub(crate) mod parent;
pub(crate) mod tree;
pub(crate) mod tree_saver;

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Instant,
};

use chrono::Local;
use derive_setters::Setters;
use enumset::EnumSet;
use log::{debug, info, trace, warn};
use serde_derive::{Deserialize, Serialize};

use crate::{
    archiver::{
        blob_saver::BlobSaver,
        buffer_pool::BufferPool,
        file_saver::FileSaver,
        future::{CancelToken, FutureNode, SavedItem},
        parent::{file_changed, load_parent_subtree, ChangeIgnore},
        tree::TargetTree,
        tree_saver::{TreeChild, TreeSaver},
    },
    backend::{
        node::{escape_file_name, Metadata, Node, NodeType},
        SourceFile, SourceFs,
    },
    blob::{tree::Tree, BlobType},
    chunker,
    error::ArchiverErrorKind,
    index::ReadIndex,
    progress::ArchiveProgress,
    repofile::snapshotfile::{PathList, SnapshotFile, SnapshotSummary},
    repository::ArchiveRepository,
    PackratResult,
};

pub(super) mod constants {
    /// Files opened and read at the same time.
    ///
    /// Two concurrent readers maximize throughput on rotational and network
    /// filesystems without hurting SSDs.
    pub(super) const DEFAULT_READ_CONCURRENCY: usize = 2;
}

/// Decides which entries are archived and whether per-item errors abort the snapshot.
///
/// All hooks may be called from arbitrary worker threads.
pub trait Select: Send + Sync {
    /// Pre-stat filter: called with the absolute path before the entry is opened.
    fn select_by_name(&self, _path: &Path) -> bool {
        true
    }

    /// Post-stat filter: called with the absolute path and the node built from its metadata.
    fn select(&self, _path: &Path, _node: &Node) -> bool {
        true
    }

    /// Downgradable error hook.
    ///
    /// Returning `Ok(())` drops the offending item and continues the
    /// snapshot; returning an error fails the snapshot with it.
    fn error(&self, _path: &Path, err: crate::PackratError) -> PackratResult<()> {
        Err(err)
    }
}

/// A [`Select`] implementation which archives everything and fails on every error.
#[derive(Clone, Copy, Debug, Default)]
pub struct SelectAll;

impl Select for SelectAll {}

/// Per-item counters: blobs and bytes newly added to the repository.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ItemStats {
    /// New data blobs added for this item
    pub data_blobs: u64,
    /// Uncompressed bytes of new data blobs
    pub data_size: u64,
    /// Bytes the new data blobs occupy in the repository
    pub data_size_packed: u64,
    /// New tree blobs added for this item
    pub tree_blobs: u64,
    /// Uncompressed bytes of new tree blobs
    pub tree_size: u64,
    /// Bytes the new tree blobs occupy in the repository
    pub tree_size_packed: u64,
}

impl ItemStats {
    /// Counts one newly added blob of the given type.
    pub(crate) fn add(&mut self, tpe: BlobType, size: u64, size_packed: u64) {
        match tpe {
            BlobType::Data => {
                self.data_blobs += 1;
                self.data_size += size;
                self.data_size_packed += size_packed;
            }
            BlobType::Tree => {
                self.tree_blobs += 1;
                self.tree_size += size;
                self.tree_size_packed += size_packed;
            }
        }
    }

    /// Adds the stats to the summary
    fn apply(self, summary: &mut SnapshotSummary) {
        summary.data_blobs += self.data_blobs;
        summary.tree_blobs += self.tree_blobs;
        summary.data_added += self.data_size + self.tree_size;
        summary.data_added_packed += self.data_size_packed + self.tree_size_packed;
        summary.data_added_files += self.data_size;
        summary.data_added_files_packed += self.data_size_packed;
        summary.data_added_trees += self.tree_size;
        summary.data_added_trees_packed += self.tree_size_packed;
    }
}

/// Options for the `Archiver`.
#[cfg_attr(feature = "clap", derive(clap::Parser))]
#[derive(Clone, Default, Debug, Deserialize, Serialize, Setters)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
#[setters(into, strip_option)]
pub struct BackupOptions {
    /// Attributes to ignore when checking whether a file changed w.r.t. the parent snapshot
    #[cfg_attr(feature = "clap", clap(skip))]
    pub ignore_flags: EnumSet<ChangeIgnore>,

    /// Skip writing of the snapshot if nothing changed w.r.t. the parent snapshot
    #[cfg_attr(feature = "clap", clap(long))]
    pub skip_if_unchanged: bool,

    /// Exclude patterns in effect; recorded in the snapshot
    #[cfg_attr(feature = "clap", clap(skip))]
    pub excludes: Vec<String>,

    /// Number of files opened and read at the same time (default: 2)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    pub read_concurrency: Option<usize>,

    /// Number of blob saver threads (default: number of cores)
    #[cfg_attr(feature = "clap", clap(long, value_name = "N"))]
    pub save_blob_concurrency: Option<usize>,
}

/// Tracks the snapshot summary and relays per-item completions.
pub(crate) struct ItemReporter<'a> {
    /// The running summary, protected by a short-held mutex.
    summary: Mutex<SnapshotSummary>,
    pub(crate) progress: &'a dyn ArchiveProgress,
    pub(crate) select: &'a dyn Select,
}

impl<'a> ItemReporter<'a> {
    fn new(
        summary: SnapshotSummary,
        progress: &'a dyn ArchiveProgress,
        select: &'a dyn Select,
    ) -> Self {
        Self {
            summary: Mutex::new(summary),
            progress,
            select,
        }
    }

    /// Records the completion of one item in the summary.
    ///
    /// The item counts as new, changed or unchanged by comparing the parent
    /// node against the node as archived now.
    pub(crate) fn complete_item(
        &self,
        path: &Path,
        previous: Option<&Node>,
        current: Option<&Node>,
        stats: ItemStats,
        processed: u64,
        start: Instant,
    ) {
        self.progress
            .complete_item(path, previous, current, &stats, start.elapsed());

        let mut summary = self.summary.lock().unwrap();
        stats.apply(&mut summary);

        let Some(current) = current else {
            return;
        };
        if current.is_dir() {
            summary.total_dirs_processed += 1;
            summary.total_dirsize_processed += processed;
            match previous {
                None => {
                    debug!("new       tree: {}", path.display());
                    summary.dirs_new += 1;
                }
                Some(previous) if previous == current => {
                    debug!("unchanged tree: {}", path.display());
                    summary.dirs_unmodified += 1;
                }
                Some(_) => {
                    debug!("changed   tree: {}", path.display());
                    summary.dirs_changed += 1;
                }
            }
        } else {
            summary.total_files_processed += 1;
            summary.total_bytes_processed += processed;
            match previous {
                None => {
                    debug!("new       file: {}", path.display());
                    summary.files_new += 1;
                }
                Some(previous) if previous == current => {
                    debug!("unchanged file: {}", path.display());
                    summary.files_unmodified += 1;
                }
                Some(_) => {
                    debug!("changed   file: {}", path.display());
                    summary.files_changed += 1;
                }
            }
        }
    }

    fn into_summary(self) -> SnapshotSummary {
        self.summary.into_inner().unwrap()
    }
}

/// The `Archiver` is responsible for archiving files and trees.
///
/// It walks the planned targets, reads and chunks changed files, reuses
/// unchanged ones from the parent snapshot and assembles everything into
/// tree blobs up to one root tree, which the returned snapshot references.
///
/// # Type Parameters
///
/// * `R` - The repository to write to.
/// * `FS` - The filesystem to read from.
#[allow(missing_debug_implementations)]
pub struct Archiver<'a, R: ArchiveRepository, FS: SourceFs> {
    /// The repository to write to.
    repo: &'a R,

    /// The filesystem to read from.
    fs: &'a FS,

    /// The selection and error hooks.
    select: &'a dyn Select,

    /// The observability hooks.
    progress: &'a dyn ArchiveProgress,

    /// The options to use.
    opts: BackupOptions,

    /// The chunker polynomial of the repository.
    poly: u64,

    /// The cancellation token observed by all workers.
    cancel: CancelToken,
}

impl<'a, R: ArchiveRepository, FS: SourceFs> Archiver<'a, R, FS>
where
    FS::File: 'a,
{
    /// Creates a new `Archiver`.
    ///
    /// # Errors
    ///
    /// * If the repository's chunker polynomial is not parsable.
    pub fn new(
        repo: &'a R,
        fs: &'a FS,
        select: &'a dyn Select,
        progress: &'a dyn ArchiveProgress,
        opts: BackupOptions,
    ) -> PackratResult<Self> {
        let poly = repo.config().poly()?;
        Ok(Self {
            repo,
            fs,
            select,
            progress,
            opts,
            poly,
            cancel: CancelToken::new(),
        })
    }

    /// The cancellation token of this archiver.
    ///
    /// Cancelling it makes a running [`Archiver::snapshot`] drain its worker
    /// pools and return the cancellation error; no snapshot is written.
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Drives one snapshot from start to finish.
    ///
    /// # Arguments
    ///
    /// * `source` - The targets to archive.
    /// * `snap` - The prepared snapshot to fill and save.
    /// * `parent` - The parent snapshot used to skip reading unchanged files.
    ///
    /// # Returns
    ///
    /// The saved snapshot and the summary. The snapshot is `None` iff
    /// `skip_if_unchanged` is set and the root tree equals the parent's.
    ///
    /// # Errors
    ///
    /// * [`ArchiverErrorKind::EmptySnapshot`] - If the final root tree contains zero nodes.
    /// * [`TargetTreeErrorKind::EmptyPathComponents`] - If a target resolves to no path components and cannot be expanded.
    /// * Any fatal error raised by a selector, the filesystem or the repository.
    ///
    /// [`ArchiverErrorKind::EmptySnapshot`]: crate::error::ArchiverErrorKind::EmptySnapshot
    /// [`TargetTreeErrorKind::EmptyPathComponents`]: crate::error::TargetTreeErrorKind::EmptyPathComponents
    pub fn snapshot(
        &self,
        source: &PathList,
        mut snap: SnapshotFile,
        parent: Option<&SnapshotFile>,
    ) -> PackratResult<(Option<SnapshotFile>, SnapshotSummary)> {
        let mut summary = snap.summary.take().unwrap_or_default();
        summary.backup_start = Local::now();

        let targets = self.resolve_targets(source)?;
        if targets.is_empty() {
            return Err(ArchiverErrorKind::EmptySnapshot.into());
        }
        snap.paths.set_paths(&targets)?;
        snap.excludes.clone_from(&self.opts.excludes);

        let plan = TargetTree::new(self.fs, &targets)?;

        // A parent which cannot be loaded is only an optimization gone: log
        // it through the error hook, then proceed without a parent.
        let parent_tree = parent.and_then(|parent| match self.repo.load_tree(&parent.tree) {
            Ok(tree) => Some(tree),
            Err(err) => {
                warn!("error loading parent tree {}, ignoring it", parent.tree);
                if let Err(err) = self.select.error(Path::new("/"), err) {
                    warn!("ignoring error from error callback: {err}");
                }
                None
            }
        });
        match parent {
            Some(parent) => info!("using parent {}", parent.id),
            None => info!("using no parent"),
        };

        let read_concurrency = self
            .opts
            .read_concurrency
            .unwrap_or(constants::DEFAULT_READ_CONCURRENCY);
        let save_blob_concurrency = self.opts.save_blob_concurrency.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        });
        // a tree worker must be available whenever a file worker releases
        let tree_concurrency = save_blob_concurrency + read_concurrency;

        self.repo.start_pack_uploader();

        let pool = BufferPool::new(
            read_concurrency + save_blob_concurrency,
            chunker::constants::MAX_SIZE,
        );
        let reporter = ItemReporter::new(summary, self.progress, self.select);
        let cancel = self.cancel.clone();

        let saved = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            let blob_saver = BlobSaver::start(
                scope,
                &mut handles,
                self.repo,
                &pool,
                &cancel,
                save_blob_concurrency,
            );
            let file_saver = FileSaver::start(
                scope,
                &mut handles,
                blob_saver.clone(),
                &reporter,
                &pool,
                self.poly,
                &cancel,
                read_concurrency,
            );
            let tree_saver = TreeSaver::start(
                scope,
                &mut handles,
                blob_saver,
                &reporter,
                &cancel,
                tree_concurrency,
            );

            let run = SnapshotRun {
                repo: self.repo,
                fs: self.fs,
                select: self.select,
                reporter: &reporter,
                ignore_flags: self.opts.ignore_flags,
                file_saver,
                tree_saver,
                cancel: &cancel,
            };

            let previous_root = parent.map(|parent| {
                let mut node = Node::new_node(OsStr::new(""), NodeType::Dir, Metadata::default());
                node.subtree = Some(parent.tree);
                node
            });
            let result = run
                .save_tree(
                    Path::new("/"),
                    &plan,
                    parent_tree.as_ref(),
                    previous_root.as_ref(),
                )
                .and_then(|future| future.take(&cancel));
            if result.is_err() {
                cancel.cancel();
            }
            // closing the job channels lets all workers drain and exit
            drop(run);

            let mut worker_err: Option<crate::PackratError> = None;
            for handle in handles {
                if let Err(err) = handle.join().expect("worker thread should not panic") {
                    match &worker_err {
                        Some(prev) if !prev.is_cancelled() => {}
                        _ if err.is_cancelled() && worker_err.is_some() => {}
                        _ => worker_err = Some(err),
                    }
                }
            }
            match worker_err {
                // secondary cancellation errors must not shadow the root cause
                Some(err) if !err.is_cancelled() => Err(err),
                Some(err) => result.and(Err(err)),
                None => result,
            }
        })?;

        self.repo.flush()?;

        let root_id = saved
            .node
            .subtree
            .ok_or_else(|| ArchiverErrorKind::MissingSubtreeId(PathBuf::from("/")))?;
        let mut summary = reporter.into_summary();

        if root_id == Tree::empty_id() {
            return Err(ArchiverErrorKind::EmptySnapshot.into());
        }

        if self.opts.skip_if_unchanged && Some(root_id) == parent.map(|parent| parent.tree) {
            info!("snapshot is unchanged, skipping snapshot creation");
            summary.finalize(snap.time)?;
            return Ok((None, summary));
        }

        snap.tree = root_id;
        snap.parent = parent.map(|parent| parent.id);
        summary.finalize(snap.time)?;
        snap.summary = Some(summary.clone());

        let id = self.repo.save_snapshot(&snap)?;
        snap.id = id;
        info!("saved snapshot {id}");

        Ok((Some(snap), summary))
    }

    /// Normalizes the targets: cleans each, expands volume-only targets and
    /// replaces targets without path components by their directory listing.
    fn resolve_targets(&self, source: &PathList) -> PackratResult<Vec<PathBuf>> {
        let mut targets = Vec::new();
        for target in source.paths() {
            if target.as_os_str().is_empty() {
                return Err(crate::error::TargetTreeErrorKind::EmptyPathComponents(target).into());
            }
            let target = expand_volume_target(target);
            if tree::path_components(&tree::clean_path(&target)?, false)?.is_empty() {
                // `.`-style target: archive its contents instead
                let file = self.fs.open_file(&target)?;
                let mut names = file.read_dir_names()?;
                names.sort();
                for name in names {
                    targets.push(target.join(name));
                }
            } else {
                targets.push(target);
            }
        }
        Ok(targets)
    }
}

/// Expands a volume-name-only target (e.g. `C:`) with the volume separator.
fn expand_volume_target(target: PathBuf) -> PathBuf {
    use std::path::Component;
    let mut comps = target.components();
    match (comps.next(), comps.next()) {
        (Some(Component::Prefix(_)), None) => {
            let mut expanded = target.into_os_string();
            expanded.push(std::path::MAIN_SEPARATOR_STR);
            expanded.into()
        }
        _ => target,
    }
}

/// The per-snapshot scheduler state: the worker pools plus everything the
/// walk needs to dispatch work.
struct SnapshotRun<'run, R, FS: SourceFs> {
    repo: &'run R,
    fs: &'run FS,
    select: &'run dyn Select,
    reporter: &'run ItemReporter<'run>,
    ignore_flags: EnumSet<ChangeIgnore>,
    file_saver: FileSaver<FS::File>,
    tree_saver: TreeSaver,
    cancel: &'run CancelToken,
}

impl<R: ArchiveRepository, FS: SourceFs> SnapshotRun<'_, R, FS> {
    /// Walks one planned subtree and submits it to the tree saver.
    ///
    /// `parent_tree` is the parent snapshot's listing matching this subtree,
    /// `previous` the directory node the parent stored for it.
    fn save_tree(
        &self,
        sn_path: &Path,
        plan: &TargetTree,
        parent_tree: Option<&Tree>,
        previous: Option<&Node>,
    ) -> PackratResult<FutureNode> {
        let start = Instant::now();
        trace!("entering {}", sn_path.display());

        let mut items = Vec::new();
        for (name, subtree) in &plan.children {
            let child_sn = sn_path.join(name);
            let child_prev = find_in_tree(parent_tree, OsStr::new(name));
            if let Some(path) = &subtree.path {
                if let Some(future) = self.save(&child_sn, path, child_prev)? {
                    items.push(TreeChild {
                        sn_path: child_sn,
                        future,
                    });
                }
            } else {
                let child_tree = child_prev.and_then(|prev| load_parent_subtree(self.repo, prev));
                let future =
                    self.save_tree(&child_sn, subtree, child_tree.as_ref(), child_prev)?;
                items.push(TreeChild {
                    sn_path: child_sn,
                    future,
                });
            }
        }

        let node = if let Some(fi_path) = &plan.fi_path {
            match self.node_from_path(fi_path, sn_path) {
                Ok(node) => node,
                Err(err) => {
                    self.select.error(fi_path, err)?;
                    Node::new_node(
                        sn_path.file_name().unwrap_or_default(),
                        NodeType::Dir,
                        Metadata::default(),
                    )
                }
            }
        } else {
            // the synthetic root of the snapshot
            Node::new_node(OsStr::new(""), NodeType::Dir, Metadata::default())
        };

        self.tree_saver
            .save(sn_path.to_path_buf(), node, previous.cloned(), items, start)
    }

    /// Saves one entry: applies the selectors, detects changes against the
    /// parent snapshot and dispatches by file type.
    ///
    /// Returns `None` if the entry is excluded.
    fn save(
        &self,
        sn_path: &Path,
        target: &Path,
        previous: Option<&Node>,
    ) -> PackratResult<Option<FutureNode>> {
        let start = Instant::now();
        let abs_target = self.fs.abs(target)?;

        if !self.select.select_by_name(&abs_target) {
            debug!("{} is excluded by name", abs_target.display());
            return Ok(None);
        }

        let file = match self.fs.open_file(target) {
            Ok(file) => file,
            Err(err) if err.is_file_not_found() => {
                // listed by readdir, but vanished since
                return Ok(None);
            }
            Err(err) => {
                self.select.error(&abs_target, err)?;
                return Ok(None);
            }
        };

        let name = sn_path.file_name().unwrap_or_default();
        let node = match file.stat(name) {
            Ok(node) => node,
            Err(err) => {
                self.select.error(&abs_target, err)?;
                return Ok(None);
            }
        };

        if !self.select.select(&abs_target, &node) {
            debug!("{} is excluded", abs_target.display());
            return Ok(None);
        }

        match node.node_type {
            NodeType::File => {
                self.save_regular_file(sn_path, target, &abs_target, file, node, previous, start)
            }
            NodeType::Dir => {
                let mut names = match file.read_dir_names() {
                    Ok(names) => names,
                    Err(err) => {
                        self.select.error(&abs_target, err)?;
                        return Ok(None);
                    }
                };
                names.sort();
                drop(file);

                let parent_tree = previous.and_then(|prev| load_parent_subtree(self.repo, prev));
                let mut items = Vec::new();
                for entry in names {
                    let child_sn = sn_path.join(&entry);
                    let child_target = target.join(&entry);
                    let child_prev = find_in_tree(parent_tree.as_ref(), &entry);
                    if let Some(future) = self.save(&child_sn, &child_target, child_prev)? {
                        items.push(TreeChild {
                            sn_path: child_sn,
                            future,
                        });
                    }
                }
                let future = self.tree_saver.save(
                    sn_path.to_path_buf(),
                    node,
                    previous.cloned(),
                    items,
                    start,
                )?;
                Ok(Some(future))
            }
            // sockets are never archived
            NodeType::Socket => Ok(None),
            // symlinks, devices and fifos are archived from their metadata alone
            _ => {
                self.reporter.complete_item(
                    sn_path,
                    previous,
                    Some(&node),
                    ItemStats::default(),
                    0,
                    start,
                );
                Ok(Some(FutureNode::ready(Ok(SavedItem {
                    node,
                    stats: ItemStats::default(),
                }))))
            }
        }
    }

    /// Saves a regular file, reusing the parent's content when it is unchanged.
    #[allow(clippy::too_many_arguments)]
    fn save_regular_file(
        &self,
        sn_path: &Path,
        target: &Path,
        abs_target: &Path,
        mut file: FS::File,
        node: Node,
        previous: Option<&Node>,
        start: Instant,
    ) -> PackratResult<Option<FutureNode>> {
        if let Some(parent_node) = previous {
            if !file_changed(&node, parent_node, self.ignore_flags) {
                if parent_node
                    .content
                    .iter()
                    .flatten()
                    .all(|id| self.repo.has_data(id))
                {
                    // reuse the parent's blobs without reading the file
                    let mut node = node;
                    node.content.clone_from(&parent_node.content);
                    self.reporter.complete_item(
                        sn_path,
                        previous,
                        Some(&node),
                        ItemStats::default(),
                        node.meta.size,
                        start,
                    );
                    return Ok(Some(FutureNode::ready(Ok(SavedItem {
                        node,
                        stats: ItemStats::default(),
                    }))));
                }
                self.select.error(
                    abs_target,
                    ArchiverErrorKind::BlobsMissing(abs_target.to_path_buf()).into(),
                )?;
                // fall through: re-read the file as if it had changed
            }
        }

        if let Err(err) = file.make_readable() {
            self.select.error(abs_target, err)?;
            return Ok(None);
        }

        // re-stat to detect a swap of the file between open and read
        let name = sn_path.file_name().unwrap_or_default();
        let node = match file.stat(name) {
            Ok(node) => node,
            Err(err) => {
                self.select.error(abs_target, err)?;
                return Ok(None);
            }
        };
        if !node.is_file() {
            return Err(ArchiverErrorKind::FileTypeChanged(abs_target.to_path_buf()).into());
        }

        let future = self.file_saver.save(
            sn_path.to_path_buf(),
            target.to_path_buf(),
            file,
            node,
            previous.cloned(),
            start,
        )?;
        Ok(Some(future))
    }

    /// Builds the directory node for a synthetic tree from its stat path.
    fn node_from_path(&self, fi_path: &Path, sn_path: &Path) -> PackratResult<Node> {
        let file = self.fs.open_file(fi_path)?;
        file.stat(sn_path.file_name().unwrap_or_default())
    }
}

/// Looks up a node by (unescaped) name in a parent tree.
fn find_in_tree<'t>(tree: Option<&'t Tree>, name: &OsStr) -> Option<&'t Node> {
    tree.and_then(|tree| tree.find(&escape_file_name(name)))
}
