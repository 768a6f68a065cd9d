//! Cross-batch hazard tracking.
//!
//! Batches from any context in the process may touch the same surfaces;
//! a single shared tracker records, per surface, the last writing batch
//! and the batches still reading it. Starting work that would form a
//! read-after-write or write-after-write hazard forces the earlier batch
//! to be submitted first. Callers hold the tracker's lock across the
//! check-and-record sequence.

use crate::batch::BatchId;
use crate::surface::SurfaceId;
use kiln_core::alloc::HashMap;

#[derive(Debug, Default)]
pub struct DependencyTracker {
    writers: HashMap<SurfaceId, BatchId>,
    readers: HashMap<SurfaceId, Vec<BatchId>>,
}

impl DependencyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `batch` touching `surface` conflicts with a prior batch.
    pub fn would_conflict(&self, surface: SurfaceId, batch: BatchId, write: bool) -> bool {
        if let Some(&writer) = self.writers.get(&surface)
            && writer != batch
        {
            return true;
        }
        if write
            && let Some(readers) = self.readers.get(&surface)
            && readers.iter().any(|&r| r != batch)
        {
            return true;
        }
        false
    }

    /// Records a read and returns the writer that must be flushed first,
    /// if any.
    pub fn note_read(&mut self, surface: SurfaceId, batch: BatchId) -> Option<BatchId> {
        let readers = self.readers.entry(surface).or_default();
        if !readers.contains(&batch) {
            readers.push(batch);
        }
        self.writers.get(&surface).copied().filter(|&w| w != batch)
    }

    /// Records a write and returns every batch that must be flushed
    /// first (prior writer and readers).
    pub fn note_write(&mut self, surface: SurfaceId, batch: BatchId) -> Vec<BatchId> {
        let mut flush = Vec::new();
        if let Some(readers) = self.readers.get(&surface) {
            flush.extend(readers.iter().copied().filter(|&r| r != batch));
        }
        if let Some(&writer) = self.writers.get(&surface)
            && writer != batch
            && !flush.contains(&writer)
        {
            flush.push(writer);
        }
        self.writers.insert(surface, batch);
        flush
    }

    /// Drops every record of a submitted batch; ring order now carries
    /// its hazards.
    pub fn forget_batch(&mut self, batch: BatchId) {
        self.writers.retain(|_, &mut w| w != batch);
        for readers in self.readers.values_mut() {
            readers.retain(|&r| r != batch);
        }
        self.readers.retain(|_, readers| !readers.is_empty());
    }
}
