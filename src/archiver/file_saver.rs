use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::{Scope, ScopedJoinHandle},
    time::Instant,
};

use crossbeam_channel::{bounded, Sender};
use rustic_cdc::Rabin64;

use crate::{
    archiver::{
        blob_saver::{BlobSaver, SaveBlobJob},
        buffer_pool::BufferPool,
        future::{CancelToken, FutureNode, FutureResult, SavedItem},
        ItemReporter, ItemStats,
    },
    backend::{node::Node, SourceFile},
    blob::BlobType,
    chunker::ChunkIter,
    error::ArchiverErrorKind,
    id::Id,
    PackratResult,
};

/// One file to be read, chunked and saved.
struct FileJob<H> {
    /// The path of the file within the snapshot.
    sn_path: PathBuf,
    /// The path of the file on the filesystem.
    path: PathBuf,
    /// The open file handle. The saver owns it and closes it on every exit path.
    file: H,
    /// The node built from the stat of the handle.
    node: Node,
    /// The matching node of the parent snapshot, if any.
    previous: Option<Node>,
    /// The result slot of the file's future.
    tx: Sender<FutureResult>,
    /// When processing of this item started.
    start: Instant,
}

/// The `FileSaver` reads files, chunks them and hands the chunks to the blob saver.
///
/// The job channel is unbuffered: queueing a new file blocks the scheduler
/// until a worker is free, which caps the number of open files at the
/// read concurrency.
pub(crate) struct FileSaver<H> {
    tx: Sender<FileJob<H>>,
}

impl<H: SourceFile> FileSaver<H> {
    /// Starts `concurrency` file workers on the given scope.
    pub(crate) fn start<'scope, 'env>(
        scope: &'scope Scope<'scope, 'env>,
        handles: &mut Vec<ScopedJoinHandle<'scope, PackratResult<()>>>,
        blob_saver: BlobSaver<'env>,
        reporter: &'env ItemReporter<'env>,
        pool: &'env BufferPool,
        poly: u64,
        cancel: &CancelToken,
        concurrency: usize,
    ) -> Self
    where
        H: 'env,
    {
        let (tx, rx) = bounded::<FileJob<H>>(0);

        for _ in 0..concurrency {
            let rx = rx.clone();
            let blob_saver = blob_saver.clone();
            let cancel = cancel.clone();
            handles.push(scope.spawn(move || {
                // each worker owns one reusable rolling hash
                let rabin = Rabin64::new_with_polynom(6, &poly);
                for job in rx.iter() {
                    if cancel.is_cancelled() {
                        // dropping the job resolves its future with the cancellation error
                        continue;
                    }
                    save_file(job, &blob_saver, reporter, pool, rabin.clone());
                }
                Ok(())
            }));
        }

        Self { tx }
    }

    /// Submits a file, blocking until a worker is free.
    ///
    /// # Errors
    ///
    /// * [`ArchiverErrorKind::Cancelled`] - If the workers have gone away.
    ///
    /// [`ArchiverErrorKind::Cancelled`]: crate::error::ArchiverErrorKind::Cancelled
    pub(crate) fn save(
        &self,
        sn_path: PathBuf,
        path: PathBuf,
        file: H,
        node: Node,
        previous: Option<Node>,
        start: Instant,
    ) -> PackratResult<FutureNode> {
        let (future, tx) = FutureNode::pending();
        self.tx
            .send(FileJob {
                sn_path,
                path,
                file,
                node,
                previous,
                tx,
                start,
            })
            .map_err(|_| ArchiverErrorKind::Cancelled)?;
        Ok(future)
    }
}

/// The shared state of one file while its chunks are in flight.
struct FileSaveState<'env> {
    inner: Mutex<FileStateInner>,
    /// Number of outstanding completions: one per submitted chunk plus one
    /// for the reading phase itself.
    pending: AtomicUsize,
    tx: Sender<FutureResult>,
    sn_path: PathBuf,
    previous: Option<Node>,
    start: Instant,
    reporter: &'env ItemReporter<'env>,
}

struct FileStateInner {
    /// The node of the file; taken on completion.
    node: Option<Node>,
    /// The content ids, filled slot by slot as chunk saves complete.
    content: Vec<Id>,
    /// The accumulated stats of this file.
    stats: ItemStats,
    /// The accumulated file size, as read.
    size: u64,
    /// Set once the file failed; inhibits completion.
    failed: bool,
}

impl FileSaveState<'_> {
    /// Reserves the content slot for the next chunk.
    fn reserve_slot(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        inner.content.push(Id::default());
        inner.content.len() - 1
    }

    /// Completion callback of one chunk save.
    fn complete_blob(&self, idx: usize, response: crate::repository::SaveBlobResponse) {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.failed {
                inner.content[idx] = response.id;
                inner.size += response.length;
                if !response.known {
                    inner
                        .stats
                        .add(BlobType::Data, response.length, response.size_in_repo);
                }
            }
        }
        self.reporter.progress.complete_blob(response.length);
        self.complete_one();
    }

    /// Releases one pending completion; the last one seals and emits the node.
    fn complete_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.failed {
            return;
        }
        let Some(mut node) = inner.node.take() else {
            return;
        };
        node.content = Some(std::mem::take(&mut inner.content));
        node.meta.size = inner.size;
        let stats = inner.stats;
        drop(inner);

        self.reporter.complete_item(
            &self.sn_path,
            self.previous.as_ref(),
            Some(&node),
            stats,
            node.meta.size,
            self.start,
        );
        _ = self.tx.send(Ok(SavedItem { node, stats }));
    }

    /// Fails the file: the future resolves with `err` and no chunk callback
    /// can complete the node anymore.
    fn fail(&self, err: crate::PackratError) {
        self.inner.lock().unwrap().failed = true;
        _ = self.tx.send(Err(err));
    }
}

/// Reads and chunks one file, submitting every chunk to the blob saver.
fn save_file<'env, H: SourceFile>(
    job: FileJob<H>,
    blob_saver: &BlobSaver<'env>,
    reporter: &'env ItemReporter<'env>,
    pool: &BufferPool,
    rabin: Rabin64,
) {
    let FileJob {
        sn_path,
        path,
        mut file,
        node,
        previous,
        tx,
        start,
    } = job;

    reporter.progress.start_file(&sn_path);

    let size_hint = usize::try_from(node.meta.size).unwrap_or(usize::MAX);
    let state = Arc::new(FileSaveState {
        inner: Mutex::new(FileStateInner {
            node: Some(node),
            content: Vec::new(),
            stats: ItemStats::default(),
            size: 0,
            failed: false,
        }),
        pending: AtomicUsize::new(1),
        tx,
        sn_path,
        previous,
        start,
        reporter,
    });

    match chunk_file(&mut file, size_hint, &state, blob_saver, pool, rabin, &path) {
        Ok(()) => {
            reporter.progress.complete_reading(&state.sn_path);
            state.complete_one();
        }
        Err(err) => state.fail(err),
    }
    // the file handle is dropped, and thereby closed, here
}

fn chunk_file<'env, H: SourceFile>(
    file: &mut H,
    size_hint: usize,
    state: &Arc<FileSaveState<'env>>,
    blob_saver: &BlobSaver<'env>,
    pool: &BufferPool,
    rabin: Rabin64,
    path: &Path,
) -> PackratResult<()> {
    for chunk in ChunkIter::new(file, size_hint, rabin, pool) {
        let chunk = chunk?;
        let idx = state.reserve_slot();
        _ = state.pending.fetch_add(1, Ordering::SeqCst);

        let chunk_state = Arc::clone(state);
        blob_saver.save(SaveBlobJob {
            tpe: BlobType::Data,
            buf: chunk,
            filename: path.to_path_buf(),
            done: Box::new(move |response| chunk_state.complete_blob(idx, response)),
        })?;
    }
    Ok(())
}
