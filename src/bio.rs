// src/bio.rs

//! The background I/O worker pool (spec.md §1 "consumed as a job-submission
//! interface", §5's three FIFO job categories). Generalizes the teacher's
//! pattern, in `aof_writer.rs` and `tasks/persistence.rs`, of one
//! dedicated Tokio task owning a resource and draining an `mpsc` channel in
//! arrival order, rather than spawning an unbounded task per job.

use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// The three job categories spec.md §5 requires to be FIFO *within* each
/// category, but independent of one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BioCategory {
    Fsync,
    CloseAof,
    Unlink,
}

/// One queued background job.
pub enum BioJob {
    Fsync {
        fd: std::sync::Arc<std::fs::File>,
        done: Option<oneshot::Sender<std::io::Result<()>>>,
    },
    CloseAof {
        fd: std::sync::Arc<std::fs::File>,
    },
    Unlink {
        path: PathBuf,
    },
}

impl BioJob {
    fn category(&self) -> BioCategory {
        match self {
            BioJob::Fsync { .. } => BioCategory::Fsync,
            BioJob::CloseAof { .. } => BioCategory::CloseAof,
            BioJob::Unlink { .. } => BioCategory::Unlink,
        }
    }
}

/// The job-submission interface the Writer and Rewriter depend on. A default
/// implementation ([`TokioBio`]) is provided; tests may substitute a
/// synchronous stand-in that runs jobs inline.
pub trait BackgroundIo: Send + Sync {
    fn submit(&self, job: BioJob);

    /// Submits an FSYNC job and returns a future resolving once it completes,
    /// used by the WAIT_REWRITE→ON drain point (spec.md §5).
    fn submit_fsync_and_wait(
        &self,
        fd: std::sync::Arc<std::fs::File>,
    ) -> oneshot::Receiver<std::io::Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.submit(BioJob::Fsync {
            fd,
            done: Some(tx),
        });
        rx
    }
}

/// One dedicated Tokio task per category, each draining its own bounded
/// `mpsc` channel strictly in arrival order, the direct generalization of
/// the teacher's single AOF-writer task pattern to three independent queues.
pub struct TokioBio {
    fsync_tx: mpsc::Sender<BioJob>,
    close_tx: mpsc::Sender<BioJob>,
    unlink_tx: mpsc::Sender<BioJob>,
}

const QUEUE_CAPACITY: usize = 1024;

impl TokioBio {
    pub fn spawn() -> Self {
        let (fsync_tx, fsync_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (close_tx, close_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (unlink_tx, unlink_rx) = mpsc::channel(QUEUE_CAPACITY);

        tokio::spawn(run_category(BioCategory::Fsync, fsync_rx));
        tokio::spawn(run_category(BioCategory::CloseAof, close_rx));
        tokio::spawn(run_category(BioCategory::Unlink, unlink_rx));

        Self {
            fsync_tx,
            close_tx,
            unlink_tx,
        }
    }
}

impl BackgroundIo for TokioBio {
    fn submit(&self, job: BioJob) {
        let sender = match job.category() {
            BioCategory::Fsync => &self.fsync_tx,
            BioCategory::CloseAof => &self.close_tx,
            BioCategory::Unlink => &self.unlink_tx,
        };
        if sender.try_send(job).is_err() {
            warn!("background I/O queue full or closed; job dropped");
        }
    }
}

async fn run_category(category: BioCategory, mut rx: mpsc::Receiver<BioJob>) {
    while let Some(job) = rx.recv().await {
        match job {
            BioJob::Fsync { fd, done } => {
                let result = tokio::task::spawn_blocking(move || fd.sync_all())
                    .await
                    .unwrap_or_else(|e| Err(std::io::Error::other(e)));
                if let Some(done) = done {
                    let _ = done.send(result);
                }
            }
            BioJob::CloseAof { fd } => {
                drop(fd);
                debug!(?category, "closed AOF file descriptor in background");
            }
            BioJob::Unlink { path } => {
                let p = path.clone();
                let result = tokio::task::spawn_blocking(move || std::fs::remove_file(&p)).await;
                if let Err(e) = result.unwrap_or_else(|je| Err(std::io::Error::other(je))) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "background unlink failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn fsync_job_reports_completion() {
        let bio = TokioBio::spawn();
        let mut tmp = NamedTempFile::new().unwrap();
        tmp.write_all(b"hello").unwrap();
        let fd = std::sync::Arc::new(tmp.reopen().unwrap());
        let rx = bio.submit_fsync_and_wait(fd);
        let result = rx.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn unlink_job_removes_the_file() {
        let bio = TokioBio::spawn();
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.into_temp_path().keep().unwrap();
        bio.submit(BioJob::Unlink { path: path.clone() });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unlink_missing_file_does_not_panic() {
        let bio = TokioBio::spawn();
        bio.submit(BioJob::Unlink {
            path: PathBuf::from("/nonexistent/path/for/sure"),
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }
}
