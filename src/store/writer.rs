//! Background image writer pool.
//!
//! Image blobs are large and have no ordering requirement (files are named
//! by timestamp), so they are handed off to a small pool of worker tasks
//! reading from a shared queue. The connection receive loop must never wait
//! on image I/O; only queue admission happens on the caller's task.

use crate::error::{AppResult, CaptureError};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

struct WriteJob {
    path: PathBuf,
    bytes: Vec<u8>,
}

/// Handle to the writer pool. Cheap to share behind an `Arc`.
pub struct FrameWriter {
    tx: Mutex<Option<mpsc::UnboundedSender<WriteJob>>>,
    pending: Arc<AtomicUsize>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl FrameWriter {
    /// Spawn `worker_count` background workers. Must be called from within a
    /// tokio runtime.
    pub fn spawn(worker_count: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel::<WriteJob>();
        let rx = Arc::new(Mutex::new(rx));
        let pending = Arc::new(AtomicUsize::new(0));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let rx = Arc::clone(&rx);
                let pending = Arc::clone(&pending);
                tokio::spawn(worker_loop(worker, rx, pending))
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            pending,
            workers: Mutex::new(workers),
        }
    }

    /// Queue one image write. Never blocks beyond queue admission; fails only
    /// when the pool has already been shut down.
    pub async fn enqueue(&self, path: PathBuf, bytes: Vec<u8>) -> AppResult<()> {
        let guard = self.tx.lock().await;
        let tx = guard.as_ref().ok_or(CaptureError::WriterClosed)?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(WriteJob { path, bytes }).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            return Err(CaptureError::WriterClosed);
        }
        Ok(())
    }

    /// Number of queued or in-flight writes.
    pub fn queue_len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Wait until the queue has been observed empty, polling rather than
    /// tracking completion. Best-effort liveness: an item enqueued
    /// concurrently with the last poll can slip past. Returns `false` on
    /// timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending.load(Ordering::Acquire) > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }

    /// Close the queue, then join the workers. Workers finish any items
    /// still sitting in the closed queue before exiting; after `timeout`
    /// unfinished writes are abandoned so shutdown latency stays bounded.
    pub async fn shutdown(&self, timeout: Duration) {
        if self.tx.lock().await.take().is_none() {
            return;
        }

        if !self.drain(timeout).await {
            warn!(
                pending = self.queue_len(),
                "frame writer shut down with unwritten images"
            );
        }

        let workers = std::mem::take(&mut *self.workers.lock().await);
        for handle in workers {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("frame writer worker did not exit in time");
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<WriteJob>>>,
    pending: Arc<AtomicUsize>,
) {
    loop {
        // The lock is held only while waiting for the next job; the write
        // itself runs unlocked so workers overlap on I/O.
        let job = { rx.lock().await.recv().await };
        let Some(job) = job else { break };

        if let Err(e) = tokio::fs::write(&job.path, &job.bytes).await {
            error!(worker, path = %job.path.display(), "failed to write frame: {e}");
        }
        pending.fetch_sub(1, Ordering::AcqRel);
    }
    debug!(worker, "frame writer worker exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn writes_queued_images() {
        let dir = tempdir().unwrap();
        let writer = FrameWriter::spawn(2);

        for i in 0..20 {
            let path = dir.path().join(format!("{i}.jpg"));
            writer.enqueue(path, vec![i as u8; 64]).await.unwrap();
        }

        assert!(writer.drain(Duration::from_secs(5)).await);
        for i in 0..20 {
            let bytes = std::fs::read(dir.path().join(format!("{i}.jpg"))).unwrap();
            assert_eq!(bytes.len(), 64);
        }
        writer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_write_does_not_stop_the_pool() {
        let dir = tempdir().unwrap();
        let writer = FrameWriter::spawn(1);

        // First job targets a directory that does not exist.
        writer
            .enqueue(dir.path().join("missing/sub/0.jpg"), vec![1, 2, 3])
            .await
            .unwrap();
        writer
            .enqueue(dir.path().join("1.jpg"), vec![4, 5, 6])
            .await
            .unwrap();

        assert!(writer.drain(Duration::from_secs(5)).await);
        assert!(dir.path().join("1.jpg").exists());
        assert!(!dir.path().join("missing/sub/0.jpg").exists());
        writer.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_finishes_items_left_in_closed_queue() {
        let dir = tempdir().unwrap();
        let writer = FrameWriter::spawn(1);

        for i in 0..50 {
            let path = dir.path().join(format!("{i}.jpg"));
            writer.enqueue(path, vec![0u8; 1024]).await.unwrap();
        }
        writer.shutdown(Duration::from_secs(10)).await;

        let written = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(written, 50);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_rejected() {
        let writer = FrameWriter::spawn(1);
        writer.shutdown(Duration::from_secs(1)).await;
        let err = writer
            .enqueue(PathBuf::from("x.jpg"), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::WriterClosed));
    }
}
