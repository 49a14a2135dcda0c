use job_server_core::Job;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Returned when the dispatch loop is gone; hands the job back
#[derive(Error, Debug)]
#[error("Dispatch queue is closed")]
pub struct QueueClosed(pub Job);

/// Sending half of the dispatch queue.
///
/// Unbounded and FIFO: `enqueue` never waits. Each enqueue corresponds to
/// one upcoming attempt, so a job may pass through several times over its
/// retry lifetime.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
}

/// Receiving half, owned by the dispatch loop
pub struct DispatchReceiver {
    rx: mpsc::UnboundedReceiver<Job>,
    depth: Arc<AtomicUsize>,
}

impl DispatchQueue {
    pub fn unbounded() -> (DispatchQueue, DispatchReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let depth = Arc::new(AtomicUsize::new(0));

        (
            DispatchQueue {
                tx,
                depth: depth.clone(),
            },
            DispatchReceiver { rx, depth },
        )
    }

    /// Push a job for its next attempt
    pub fn enqueue(&self, job: Job) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::SeqCst);
        self.tx.send(job).map_err(|mpsc::error::SendError(job)| {
            self.depth.fetch_sub(1, Ordering::SeqCst);
            QueueClosed(job)
        })
    }

    /// Jobs waiting to be dispatched
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl DispatchReceiver {
    /// Wait for the next job; `None` once every sender is gone and the queue is drained
    pub async fn dequeue(&mut self) -> Option<Job> {
        let job = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }

    /// Take a job if one is waiting
    pub fn try_dequeue(&mut self) -> Option<Job> {
        let job = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::SeqCst);
        Some(job)
    }
}
