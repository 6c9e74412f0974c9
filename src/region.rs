//! Zeroed, aligned heap memory shared between the host and the device side
//! of a queue.
//!
//! Accesses go through raw pointers with `&self`: the two sides never touch
//! the same bytes at the same time because the queue indices (published
//! through registers with release/acquire ordering) hand each element from
//! producer to consumer.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::ptr::{self, NonNull};

use crate::error::MailboxError;

/// Heap-backed region standing in for coherent DMA memory.
pub struct HeapRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

impl HeapRegion {
    /// Allocate a zeroed region of `size` bytes aligned to `align`.
    pub fn new_zeroed(size: usize, align: usize) -> Result<Self, MailboxError> {
        if size == 0 {
            return Err(MailboxError::InvalidArgument("zero-sized region"));
        }
        let layout = Layout::from_size_align(size, align)
            .map_err(|_| MailboxError::InvalidArgument("invalid region alignment"))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(MailboxError::OutOfMemory { size })?;
        Ok(Self {
            base,
            len: size,
            layout,
        })
    }

    /// Returns the base pointer of the region.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `src` into the region at byte offset `off`.
    pub fn write_bytes(&self, off: usize, src: &[u8]) {
        self.check(off, src.len());
        // SAFETY: bounds checked above; src cannot alias the region because
        // the region is only reachable through raw pointers.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(off), src.len()) }
    }

    /// Copy bytes out of the region starting at byte offset `off`.
    pub fn read_bytes(&self, off: usize, dst: &mut [u8]) {
        self.check(off, dst.len());
        // SAFETY: bounds checked above.
        unsafe { ptr::copy_nonoverlapping(self.as_ptr().add(off), dst.as_mut_ptr(), dst.len()) }
    }

    #[inline]
    fn check(&self, off: usize, len: usize) {
        assert!(
            off.checked_add(len).is_some_and(|end| end <= self.len),
            "access {off}+{len} out of bounds (len={})",
            self.len
        );
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: allocated in new_zeroed with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for HeapRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

// SAFETY: the region is plain bytes; ordering between users is provided by
// the queue index protocol.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}
