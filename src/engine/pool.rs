//! Scratch buffers shared between patch workers.

use std::sync::Mutex;

use crate::engine::patch::PatchScratch;

/// A stack of reusable [`PatchScratch`] buffers.
///
/// Workers check a buffer out for one patch and return it afterwards. An
/// empty stack hands out a fresh buffer instead of blocking.
pub(crate) struct ScratchPool {
    free: Mutex<Vec<PatchScratch>>,
}

impl ScratchPool {
    pub fn new(workers: usize) -> Self {
        let free = (0..workers.max(1)).map(|_| PatchScratch::default()).collect();
        Self {
            free: Mutex::new(free),
        }
    }

    /// Runs `f` with a checked-out buffer.
    pub fn with<R>(&self, f: impl FnOnce(&mut PatchScratch) -> R) -> R {
        let taken = self.free.lock().ok().and_then(|mut free| free.pop());
        let mut scratch = taken.unwrap_or_default();
        let out = f(&mut scratch);
        if let Ok(mut free) = self.free.lock() {
            free.push(scratch);
        }
        out
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.free.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::ScratchPool;

    #[test]
    fn buffers_are_returned() {
        let pool = ScratchPool::new(2);
        assert_eq!(pool.available(), 2);
        let n = pool.with(|_| pool.with(|_| pool.with(|_| pool.available())));
        assert_eq!(n, 0);
        assert_eq!(pool.available(), 3);
    }
}
