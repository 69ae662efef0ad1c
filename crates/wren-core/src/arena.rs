// Scratch Arena: Per-device caching allocator for kernel temporaries
//
// Kernels need short-lived buffers: transposed filter copies, widened
// accumulators, intermediate gradients. They allocate them through a
// `ScratchGuard` opened on the device context. Each `ScratchBuf` borrows the
// arena, so the borrow checker guarantees it cannot outlive the call that
// created it, and its storage goes back to the arena's free list when it is
// dropped, on success and error paths alike.
//
// Freed buffers are cached by (dtype, length) and handed out again, zeroed,
// on the next request of the same size. An optional byte limit bounds the
// cache: a returned buffer that would push it past the limit is freed
// instead. `empty_cache` drops everything cached.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::dtype::{DType, WithDType};
use crate::tensor::Storage;

/// Snapshot of the arena's allocation statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Buffers currently handed out and not yet returned.
    pub live_buffers: usize,
    /// Buffers sitting in the free lists.
    pub cached_buffers: usize,
    /// Total bytes held in the free lists.
    pub cached_bytes: usize,
    /// Allocations served from the cache.
    pub hits: u64,
    /// Allocations that needed a fresh buffer.
    pub misses: u64,
}

#[derive(Debug, Default)]
struct FreeLists {
    buffers: HashMap<(DType, usize), Vec<Storage>>,
    bytes: usize,
}

/// Caching allocator owned by a `DeviceContext`.
#[derive(Debug, Default)]
pub struct ScratchArena {
    free: Mutex<FreeLists>,
    max_cached_bytes: Option<usize>,
    live: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ScratchArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arena whose cache never holds more than `bytes`.
    pub fn with_limit(bytes: usize) -> Self {
        ScratchArena {
            max_cached_bytes: Some(bytes),
            ..Self::default()
        }
    }

    pub fn max_cached_bytes(&self) -> Option<usize> {
        self.max_cached_bytes
    }

    /// Open an allocation scope.
    pub fn guard(&self) -> ScratchGuard<'_> {
        ScratchGuard { arena: self }
    }

    fn take<T: WithDType>(&self, n: usize) -> Vec<T> {
        self.live.fetch_add(1, Ordering::Relaxed);
        let cached = self.free.lock().ok().and_then(|mut free| {
            let buf = free.buffers.get_mut(&(T::DTYPE, n)).and_then(|stack| stack.pop())?;
            free.bytes -= n * T::DTYPE.size_in_bytes();
            Some(buf)
        });
        match cached.and_then(T::from_storage) {
            Some(mut v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                v.fill(T::zero());
                v
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                vec![T::zero(); n]
            }
        }
    }

    fn give_back<T: WithDType>(&self, data: Vec<T>) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        let n = data.len();
        let bytes = n * T::DTYPE.size_in_bytes();
        if let Ok(mut free) = self.free.lock() {
            if self.max_cached_bytes.is_some_and(|max| free.bytes + bytes > max) {
                return;
            }
            free.bytes += bytes;
            free.buffers
                .entry((T::DTYPE, n))
                .or_default()
                .push(T::into_storage(data));
        }
    }

    /// Drop every cached buffer.
    pub fn empty_cache(&self) {
        if let Ok(mut free) = self.free.lock() {
            let released = free.bytes;
            free.buffers.clear();
            free.bytes = 0;
            tracing::debug!(released, "scratch cache emptied");
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let (cached_buffers, cached_bytes) = self
            .free
            .lock()
            .map(|free| (free.buffers.values().map(Vec::len).sum::<usize>(), free.bytes))
            .unwrap_or((0, 0));
        ArenaStats {
            live_buffers: self.live.load(Ordering::Relaxed),
            cached_buffers,
            cached_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

/// Allocation scope tied to one kernel call.
pub struct ScratchGuard<'a> {
    arena: &'a ScratchArena,
}

impl<'a> ScratchGuard<'a> {
    /// Allocate `n` zeroed elements.
    pub fn alloc<T: WithDType>(&self, n: usize) -> ScratchBuf<'a, T> {
        ScratchBuf {
            data: self.arena.take(n),
            arena: self.arena,
        }
    }

    /// Allocate a copy of `src`.
    pub fn alloc_copy<T: WithDType>(&self, src: &[T]) -> ScratchBuf<'a, T> {
        let mut buf = self.alloc(src.len());
        buf.copy_from_slice(src);
        buf
    }
}

/// A scratch buffer that returns itself to the arena on drop.
pub struct ScratchBuf<'a, T: WithDType> {
    data: Vec<T>,
    arena: &'a ScratchArena,
}

impl<T: WithDType> Deref for ScratchBuf<'_, T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T: WithDType> DerefMut for ScratchBuf<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.data
    }
}

impl<T: WithDType> Drop for ScratchBuf<'_, T> {
    fn drop(&mut self) {
        self.arena.give_back(std::mem::take(&mut self.data));
    }
}
