//! Fixed set of execution slots.
//!
//! A slot is handed to each running job and returns itself to the pool when
//! dropped, including when the job task unwinds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug)]
pub struct WorkerPool {
    node_id: String,
    size: usize,
    free: Vec<usize>,
    returned_tx: mpsc::UnboundedSender<usize>,
    returned_rx: mpsc::UnboundedReceiver<usize>,
    busy: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// `node_id` prefixes every slot's worker id, e.g. `node-3f2a-w1`
    pub fn new(node_id: impl Into<String>, size: usize) -> Self {
        let (returned_tx, returned_rx) = mpsc::unbounded_channel();
        Self {
            node_id: node_id.into(),
            size,
            free: (0..size).rev().collect(),
            returned_tx,
            returned_rx,
            busy: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently running a job
    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    fn collect_returned(&mut self) {
        while let Ok(index) = self.returned_rx.try_recv() {
            self.free.push(index);
        }
    }

    pub fn try_acquire(&mut self) -> Option<WorkerSlot> {
        self.collect_returned();
        let index = self.free.pop()?;
        self.busy.fetch_add(1, Ordering::SeqCst);
        Some(WorkerSlot {
            worker_id: format!("{}-w{}", self.node_id, index),
            index,
            returned_tx: self.returned_tx.clone(),
            busy: Arc::clone(&self.busy),
        })
    }
}

#[derive(Debug)]
pub struct WorkerSlot {
    worker_id: String,
    index: usize,
    returned_tx: mpsc::UnboundedSender<usize>,
    busy: Arc<AtomicUsize>,
}

impl WorkerSlot {
    /// Lease holder id written to `locked_by`
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.busy.fetch_sub(1, Ordering::SeqCst);
        let _ = self.returned_tx.send(self.index);
    }
}
