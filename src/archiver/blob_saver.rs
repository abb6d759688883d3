use std::{
    path::PathBuf,
    thread::{Scope, ScopedJoinHandle},
};

use crossbeam_channel::{bounded, Sender};

use crate::{
    archiver::{buffer_pool::BufferPool, future::CancelToken},
    blob::BlobType,
    error::ArchiverErrorKind,
    repository::{ArchiveRepository, SaveBlobResponse},
    PackratResult,
};

/// Completion callback of a blob save job.
pub(crate) type BlobDoneFn<'env> = Box<dyn FnOnce(SaveBlobResponse) + Send + 'env>;

/// One blob to be saved.
pub(crate) struct SaveBlobJob<'env> {
    /// The blob type to save the buffer as.
    pub(crate) tpe: BlobType,
    /// The blob contents. Ownership moves to the saver, which recycles the buffer.
    pub(crate) buf: Vec<u8>,
    /// The file this blob belongs to, used to tag errors.
    pub(crate) filename: PathBuf,
    /// Called with the save response once the blob is stored.
    pub(crate) done: BlobDoneFn<'env>,
}

/// The `BlobSaver` is an idempotent single-writer gate for blob storage.
///
/// The repository is the source of truth for uniqueness: the saver always
/// calls [`ArchiveRepository::save_blob`] and reports whether the blob was
/// already known. Jobs are submitted on an unbuffered channel; workers exit
/// cleanly when the channel closes.
#[derive(Clone)]
pub(crate) struct BlobSaver<'env> {
    tx: Sender<SaveBlobJob<'env>>,
}

impl<'env> BlobSaver<'env> {
    /// Starts `concurrency` saver workers on the given scope.
    pub(crate) fn start<'scope, R: ArchiveRepository + Sync>(
        scope: &'scope Scope<'scope, 'env>,
        handles: &mut Vec<ScopedJoinHandle<'scope, PackratResult<()>>>,
        repo: &'env R,
        pool: &'env BufferPool,
        cancel: &CancelToken,
        concurrency: usize,
    ) -> Self {
        let (tx, rx) = bounded::<SaveBlobJob<'env>>(0);

        for _ in 0..concurrency {
            let rx = rx.clone();
            let cancel = cancel.clone();
            handles.push(scope.spawn(move || {
                for job in rx.iter() {
                    if cancel.is_cancelled() {
                        // drain pending submissions without saving
                        continue;
                    }
                    let SaveBlobJob {
                        tpe,
                        buf,
                        filename,
                        done,
                    } = job;
                    match repo.save_blob(tpe, &buf) {
                        Ok(response) => {
                            done(response);
                            pool.put(buf);
                        }
                        Err(err) => {
                            cancel.cancel();
                            return Err(
                                ArchiverErrorKind::SavingBlobFailed(filename, Box::new(err)).into()
                            );
                        }
                    }
                }
                Ok(())
            }));
        }

        Self { tx }
    }

    /// Submits a job, blocking until a worker is free.
    ///
    /// # Errors
    ///
    /// * [`ArchiverErrorKind::Cancelled`] - If the workers have gone away.
    ///
    /// [`ArchiverErrorKind::Cancelled`]: crate::error::ArchiverErrorKind::Cancelled
    pub(crate) fn save(&self, job: SaveBlobJob<'env>) -> PackratResult<()> {
        self.tx
            .send(job)
            .map_err(|_| ArchiverErrorKind::Cancelled.into())
    }
}
