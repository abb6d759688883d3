use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::{Scope, ScopedJoinHandle},
    time::Instant,
};

use bytesize::ByteSize;
use crossbeam_channel::{bounded, Sender};
use log::trace;

use crate::{
    archiver::{
        blob_saver::{BlobSaver, SaveBlobJob},
        future::{CancelToken, FutureNode, FutureResult, SavedItem},
        ItemReporter, ItemStats,
    },
    backend::node::Node,
    blob::{tree::Tree, BlobType},
    error::{ArchiverErrorKind, TreeErrorKind},
    repository::SaveBlobResponse,
    PackratResult,
};

/// One child of a tree job: the snapshot path (for error reporting) and the
/// future carrying the child's node.
pub(crate) struct TreeChild {
    pub(crate) sn_path: PathBuf,
    pub(crate) future: FutureNode,
}

/// One tree to be assembled, serialized and saved.
struct TreeJob {
    /// The path of the tree within the snapshot.
    sn_path: PathBuf,
    /// The directory node; its subtree id is filled in on completion.
    node: Node,
    /// The matching node of the parent snapshot, if any.
    previous: Option<Node>,
    /// The futures of all children, in lexicographic order.
    items: Vec<TreeChild>,
    /// The result slot of the tree's future.
    tx: Sender<FutureResult>,
    /// When processing of this item started.
    start: Instant,
}

/// The `TreeSaver` awaits child futures, serializes the tree and saves it as
/// a tree blob.
///
/// The pool is sized larger than the file saver pool so that a tree worker
/// is always available once a file worker releases; otherwise finished
/// subtrees could pile up behind busy file reads.
pub(crate) struct TreeSaver {
    tx: Sender<TreeJob>,
}

impl TreeSaver {
    /// Starts `concurrency` tree workers on the given scope.
    pub(crate) fn start<'scope, 'env>(
        scope: &'scope Scope<'scope, 'env>,
        handles: &mut Vec<ScopedJoinHandle<'scope, PackratResult<()>>>,
        blob_saver: BlobSaver<'env>,
        reporter: &'env ItemReporter<'env>,
        cancel: &CancelToken,
        concurrency: usize,
    ) -> Self {
        let (tx, rx) = bounded::<TreeJob>(0);

        for _ in 0..concurrency {
            let rx = rx.clone();
            let blob_saver = blob_saver.clone();
            let cancel = cancel.clone();
            handles.push(scope.spawn(move || {
                for job in rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if let Err(err) = save_tree(job, &blob_saver, reporter, &cancel) {
                        cancel.cancel();
                        return Err(err);
                    }
                }
                Ok(())
            }));
        }

        Self { tx }
    }

    /// Submits a tree, blocking until a worker is free.
    ///
    /// # Errors
    ///
    /// * [`ArchiverErrorKind::Cancelled`] - If the workers have gone away.
    ///
    /// [`ArchiverErrorKind::Cancelled`]: crate::error::ArchiverErrorKind::Cancelled
    pub(crate) fn save(
        &self,
        sn_path: PathBuf,
        node: Node,
        previous: Option<Node>,
        items: Vec<TreeChild>,
        start: Instant,
    ) -> PackratResult<FutureNode> {
        let (future, tx) = FutureNode::pending();
        self.tx
            .send(TreeJob {
                sn_path,
                node,
                previous,
                items,
                tx,
                start,
            })
            .map_err(|_| ArchiverErrorKind::Cancelled)?;
        Ok(future)
    }
}

/// The state of one tree while its serialized blob is in flight.
struct TreeSaveState<'env> {
    node: Mutex<Option<Node>>,
    previous: Option<Node>,
    sn_path: PathBuf,
    /// The size of the serialized tree.
    dirsize: u64,
    tx: Sender<FutureResult>,
    start: Instant,
    reporter: &'env ItemReporter<'env>,
}

impl TreeSaveState<'_> {
    /// Completion callback of the tree blob save.
    fn complete(&self, response: SaveBlobResponse) {
        let Some(mut node) = self.node.lock().unwrap().take() else {
            return;
        };
        node.subtree = Some(response.id);

        let mut stats = ItemStats::default();
        if !response.known {
            stats.add(BlobType::Tree, response.length, response.size_in_repo);
        }

        self.reporter.complete_item(
            &self.sn_path,
            self.previous.as_ref(),
            Some(&node),
            stats,
            self.dirsize,
            self.start,
        );
        _ = self.tx.send(Ok(SavedItem { node, stats }));
    }
}

/// Assembles one tree from its child futures and submits it as a tree blob.
fn save_tree<'env>(
    job: TreeJob,
    blob_saver: &BlobSaver<'env>,
    reporter: &'env ItemReporter<'env>,
    cancel: &CancelToken,
) -> PackratResult<()> {
    let TreeJob {
        sn_path,
        node,
        previous,
        items,
        tx,
        start,
    } = job;

    trace!("finishing {}", sn_path.display());

    let mut tree = Tree::new();
    for item in items {
        match item.future.take(cancel) {
            Ok(saved) => {
                if let Some(existing) = tree.find(&saved.node.name) {
                    if existing == &saved.node {
                        // the exact same node was produced twice, e.g. by overlapping targets
                        if let Err(err) = reporter.select.error(
                            &item.sn_path,
                            TreeErrorKind::NotOrdered(saved.node.name.clone()).into(),
                        ) {
                            log::warn!(
                                "ignoring duplicate node {}: {err}",
                                item.sn_path.display()
                            );
                        }
                        continue;
                    }
                    return Err(TreeErrorKind::NotOrdered(saved.node.name).into());
                }
                tree.insert(saved.node)?;
            }
            Err(err) => {
                if err.is_cancelled() {
                    return Err(err);
                }
                // offer the failed item to the error hook; dropping it keeps
                // the snapshot going without this entry
                reporter.select.error(&item.sn_path, err)?;
            }
        }
    }

    let (chunk, id) = tree.serialize()?;
    let dirsize = chunk.len() as u64;
    trace!(
        "saving tree {} {id} ({})",
        sn_path.display(),
        ByteSize(dirsize)
    );

    let state = Arc::new(TreeSaveState {
        node: Mutex::new(Some(node)),
        previous,
        sn_path: sn_path.clone(),
        dirsize,
        tx,
        start,
        reporter,
    });
    blob_saver.save(SaveBlobJob {
        tpe: BlobType::Tree,
        buf: chunk,
        filename: sn_path,
        done: Box::new(move |response| state.complete(response)),
    })?;

    Ok(())
}
