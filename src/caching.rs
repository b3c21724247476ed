//! Caching classes and the batched attribute stage
//!
//! Freshly allocated low-memory pages arrive write-back cached and must be
//! transitioned to the class the caller asked for. Transitions are costly
//! (cross-CPU TLB invalidate), so [`CachingStage`] batches contiguous
//! stretches of the output array and reprograms them in one call.

use crate::backend::MemoryBackend;
use crate::run::PageRef;
use crate::PoolError;

/// Whether this target can reprogram linear-mapping attributes. Off x86
/// the primitives are no-ops and the write-combined/uncached global
/// buckets are never selected.
pub const HAVE_CACHING_ATTRS: bool = cfg!(any(target_arch = "x86", target_arch = "x86_64"));

/// CPU mapping attributes of a run.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum Caching {
    /// Ordinary write-back cached mapping.
    Cached,
    /// Write-combined: unsnooped, writes buffered.
    WriteCombined,
    /// Fully uncached.
    Uncached,
}

pub const NUM_CACHING_TYPES: usize = 3;

impl Caching {
    pub fn index(self) -> usize {
        match self {
            Caching::Cached => 0,
            Caching::WriteCombined => 1,
            Caching::Uncached => 2,
        }
    }

    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Caching::Cached,
            1 => Caching::WriteCombined,
            2 => Caching::Uncached,
            _ => panic!("caching index {} out of range", index),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Caching::Cached => "cached",
            Caching::WriteCombined => "wc",
            Caching::Uncached => "uc",
        }
    }
}

/// Pending-transition window over the caller's output array.
///
/// Pages between `start` and the end of the array are fresh low-memory
/// pages still in write-back state. Pooled runs are already in class and
/// high-memory runs have no linear mapping; both force a flush of the
/// pending window and are then skipped past.
pub struct CachingStage {
    start: usize,
}

impl CachingStage {
    pub fn new() -> Self {
        Self { start: 0 }
    }

    /// Transition every pending page to `target` in one batch.
    pub fn flush(
        &mut self,
        pages: &[PageRef],
        target: Caching,
        backend: &dyn MemoryBackend,
    ) -> Result<(), PoolError> {
        let window = &pages[self.start..];
        self.start = pages.len();
        if window.is_empty() || !HAVE_CACHING_ATTRS {
            return Ok(());
        }

        let ok = match target {
            Caching::Cached => true,
            Caching::WriteCombined => backend.set_pages_wc(window),
            Caching::Uncached => backend.set_pages_uc(window),
        };
        if ok {
            Ok(())
        } else {
            // Attribute reprogramming fails when the mapping cannot be
            // split; surface it like any other exhausted allocation.
            Err(PoolError::OutOfMemory)
        }
    }

    /// Exclude everything before `end` from the pending window.
    pub fn skip_to(&mut self, end: usize) {
        self.start = end;
    }
}

impl Default for CachingStage {
    fn default() -> Self {
        Self::new()
    }
}
