/// Background sidecar writer
///
/// Safe write-throughs enqueue the image id; a worker task collects the
/// stored edit on the blocking pool (SQLite is synchronous) and writes the
/// JSON next to the raw file. A job for an image that is already pending is
/// coalesced into the pending one.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::error::StoreError;
use crate::state::edit::SidecarDocument;
use crate::state::library::Library;

#[derive(Debug)]
enum SidecarJob {
    Write(i32),
    /// Answered once every job queued before it is done
    Flush(oneshot::Sender<()>),
}

#[derive(Debug, Clone)]
pub struct SidecarWriter {
    tx: mpsc::Sender<SidecarJob>,
    pending: Arc<Mutex<HashSet<i32>>>,
}

impl SidecarWriter {
    /// Spawn the worker on `handle`.
    pub fn start(handle: &Handle, library: Arc<Library>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = Arc::new(Mutex::new(HashSet::new()));
        handle.spawn(run_worker(rx, library, Arc::clone(&pending)));
        Self { tx, pending }
    }

    /// Queue a sidecar write for `imgid`.
    ///
    /// # Returns
    /// * `true` if a new job was queued, `false` if one was already pending
    ///   or the queue is full
    pub fn enqueue(&self, imgid: i32) -> bool {
        if !self.pending.lock().insert(imgid) {
            tracing::trace!("[sidecar] write for image {} already pending", imgid);
            return false;
        }

        match self.tx.try_send(SidecarJob::Write(imgid)) {
            Ok(()) => true,
            Err(err) => {
                self.pending.lock().remove(&imgid);
                tracing::warn!("[sidecar] could not queue image {}: {}", imgid, err);
                false
            }
        }
    }

    pub fn is_pending(&self, imgid: i32) -> bool {
        self.pending.lock().contains(&imgid)
    }

    /// Wait until every job queued so far has been processed.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(SidecarJob::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_worker(mut rx: mpsc::Receiver<SidecarJob>, library: Arc<Library>, pending: Arc<Mutex<HashSet<i32>>>) {
    while let Some(job) = rx.recv().await {
        match job {
            SidecarJob::Write(imgid) => {
                // Later edits must trigger a fresh job from here on
                pending.lock().remove(&imgid);
                if let Err(e) = write_sidecar(Arc::clone(&library), imgid).await {
                    tracing::warn!("[sidecar] failed to write sidecar for image {}: {}", imgid, e);
                }
            }
            SidecarJob::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    tracing::debug!("[sidecar] worker stopped");
}

async fn write_sidecar(library: Arc<Library>, imgid: i32) -> Result<(), StoreError> {
    // Spawn blocking because the catalog queries are synchronous
    let doc = task::spawn_blocking(move || SidecarDocument::collect(&library, imgid))
        .await??
        .ok_or(StoreError::MissingImage(imgid))?;

    let Some(path) = sidecar_path(&doc) else {
        tracing::debug!("[sidecar] image {} has no location on disk, skipping", imgid);
        return Ok(());
    };

    tokio::fs::write(&path, doc.to_json()?).await?;
    tracing::debug!("[sidecar] wrote {}", path.display());
    Ok(())
}

fn sidecar_path(doc: &SidecarDocument) -> Option<std::path::PathBuf> {
    if doc.folder.is_empty() || doc.filename.is_empty() {
        return None;
    }
    let fullpath = std::path::Path::new(&doc.folder).join(&doc.filename);
    Some(SidecarDocument::path_for(&fullpath))
}
