//! Bounded pool of reusable block buffers
//!
//! Buffers are move-only values: `acquire` transfers ownership out of the
//! pool and `release` transfers it back, so double-release and
//! use-after-release cannot be expressed. Contents are not re-zeroed on
//! reuse; every read path overwrites the full buffer.

use crate::raw_io::ALIGNMENT;
use parking_lot::Mutex;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// An owned block-sized buffer over an alignment-padded allocation
///
/// The visible length is exactly the block size; the allocation behind it
/// is padded to [`ALIGNMENT`] so the same buffer works with O_DIRECT.
pub struct BlockBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The allocation is exclusively owned; handing it to another thread is fine.
#[allow(unsafe_code)]
unsafe impl Send for BlockBuf {}

impl BlockBuf {
    /// Allocate a zeroed buffer of `len` visible bytes
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or allocation fails.
    #[must_use]
    pub(crate) fn zeroed(len: usize) -> Self {
        assert!(len > 0, "block buffers cannot be empty");
        let padded = len.div_ceil(ALIGNMENT) * ALIGNMENT;
        let layout =
            Layout::from_size_align(padded, ALIGNMENT).expect("invalid block buffer layout");

        #[allow(unsafe_code)]
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };

        Self { ptr, len, layout }
    }

    /// Visible length in bytes (the block size)
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Block buffers are never empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// View the buffer contents
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr(), self.len)
        }
    }

    /// View the buffer contents mutably
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        #[allow(unsafe_code)]
        unsafe {
            std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len)
        }
    }
}

impl Drop for BlockBuf {
    fn drop(&mut self) {
        #[allow(unsafe_code)]
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::ops::Deref for BlockBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl std::ops::DerefMut for BlockBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl AsRef<[u8]> for BlockBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for BlockBuf {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl std::fmt::Debug for BlockBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBuf").field("len", &self.len).finish()
    }
}

/// Bounded cache of idle block buffers
///
/// `acquire` hands out the most recently released buffer (warm in cache)
/// or allocates; `release` keeps at most `max_idle` buffers and frees the
/// rest immediately. The lock is independent of the readahead engine lock
/// so pool traffic never blocks prefetch scheduling.
pub struct BufferPool {
    idle: Mutex<Vec<BlockBuf>>,
    block_size: usize,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool handing out `block_size`-sized buffers
    #[must_use]
    pub fn new(block_size: usize, max_idle: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            block_size,
            max_idle,
        }
    }

    /// Take a buffer out of the pool, allocating if none is idle
    #[must_use]
    pub fn acquire(&self) -> BlockBuf {
        if let Some(buf) = self.idle.lock().pop() {
            return buf;
        }
        BlockBuf::zeroed(self.block_size)
    }

    /// Return a buffer; freed immediately once `max_idle` are already idle
    pub fn release(&self, buf: BlockBuf) {
        debug_assert_eq!(buf.len(), self.block_size);
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(buf);
        }
        // Dropping past the guard frees the buffer outside the pool lock.
    }

    /// Number of idle buffers currently held
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Size of the buffers this pool manages
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_zeroed() {
        let pool = BufferPool::new(4096, 64);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 4096);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_release_then_acquire_is_lifo() {
        let pool = BufferPool::new(512, 64);

        let mut a = pool.acquire();
        let mut b = pool.acquire();
        a[0] = 0x0a;
        b[0] = 0x0b;
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle_count(), 2);

        // Most recently released comes back first
        let first = pool.acquire();
        assert_eq!(first[0], 0x0b);
        let second = pool.acquire();
        assert_eq!(second[0], 0x0a);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_excess_releases_are_freed() {
        let pool = BufferPool::new(512, 64);

        let bufs: Vec<BlockBuf> = (0..65).map(|_| BlockBuf::zeroed(512)).collect();
        for buf in bufs {
            pool.release(buf);
        }
        // The 65th release is dropped, not retained
        assert_eq!(pool.idle_count(), 64);
    }

    #[test]
    fn test_buffer_alignment() {
        let buf = BlockBuf::zeroed(4096);
        assert_eq!(buf.as_slice().as_ptr() as usize % ALIGNMENT, 0);

        // Visible length is exact even when the allocation is padded
        let odd = BlockBuf::zeroed(1000);
        assert_eq!(odd.len(), 1000);
    }
}
