use crate::domain::market::slice::{FrontierBatch, Slice};
use std::collections::VecDeque;
use std::sync::Arc;

/// Turns frontier batches into slices and keeps a short history for diagnostic snapshots.
pub struct SliceAggregator {
    history: VecDeque<Arc<Slice>>,
    depth: usize,
    emitted: u64,
}

impl SliceAggregator {
    pub fn new(depth: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(depth),
            depth,
            emitted: 0,
        }
    }

    pub fn aggregate(&mut self, batch: FrontierBatch) -> Arc<Slice> {
        let slice = Arc::new(Slice::from(batch));
        if self.depth > 0 {
            if self.history.len() == self.depth {
                self.history.pop_front();
            }
            self.history.push_back(slice.clone());
        }
        self.emitted += 1;
        slice
    }

    /// Most recent slices, oldest first.
    pub fn recent(&self) -> Vec<Slice> {
        self.history.iter().map(|s| s.as_ref().clone()).collect()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}
