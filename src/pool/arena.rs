use super::PoolError;
use super::block::Block;
use super::stats;
use super::vm::{PlatformVmOps, VmOps};
use std::ptr::NonNull;

/// The bulk storage tier: one contiguous reservation holding a pool's
/// initial blocks, committed up front, released wholesale at teardown.
pub(crate) struct BlockArena<T> {
    /// First block, aligned for `Block<T>`.
    base: NonNull<Block<T>>,
    /// Number of blocks.
    len: usize,
    /// Original pointer from reserve (may differ from base due to alignment).
    raw: NonNull<u8>,
    /// Full reservation size including alignment padding.
    raw_len: usize,
}

// Safety: the arena owns its reservation outright.
unsafe impl<T: Send> Send for BlockArena<T> {}

impl<T> BlockArena<T> {
    pub(crate) fn new(count: usize) -> Result<Self, PoolError> {
        debug_assert!(count > 0);
        let block_size = std::mem::size_of::<Block<T>>();
        let align = std::mem::align_of::<Block<T>>();

        // Reserve extra for alignment (mmap is only page-aligned, which may
        // be insufficient for an over-aligned element type).
        let bytes = block_size
            .checked_mul(count)
            .and_then(|b| b.checked_add(align))
            .ok_or(PoolError::CapacityOverflow { blocks: count })?;
        let raw_len = bytes.next_multiple_of(PlatformVmOps::page_size());

        // Safety: FFI call to reserve memory.
        let raw = unsafe { PlatformVmOps::reserve(raw_len)? };
        // Safety: FFI call to commit the freshly reserved range.
        if let Err(e) = unsafe { PlatformVmOps::commit(raw, raw_len) } {
            // Safety: releasing the range we just reserved.
            unsafe { drop(PlatformVmOps::release(raw, raw_len)) };
            return Err(e.into());
        }

        let raw_addr = raw.as_ptr() as usize;
        let aligned = (raw_addr + align - 1) & !(align - 1);
        // Safety: aligned is within the committed range and non-null.
        let base = unsafe { NonNull::new_unchecked(aligned as *mut Block<T>) };

        stats::TOTAL_RESERVED.add(raw_len);
        stats::TOTAL_COMMITTED.add(raw_len);
        stats::ARENA_COMMITTED.add(raw_len);

        Ok(Self {
            base,
            len: count,
            raw,
            raw_len,
        })
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn block(&self, index: usize) -> NonNull<Block<T>> {
        debug_assert!(index < self.len);
        // Safety: index is within the carved range.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(index)) }
    }
}

impl<T> Drop for BlockArena<T> {
    fn drop(&mut self) {
        // Safety: releasing the reservation this arena owns; the owner has
        // already disposed of the elements.
        unsafe {
            drop(PlatformVmOps::release(self.raw, self.raw_len));
        }
        stats::TOTAL_RESERVED.sub(self.raw_len);
        stats::TOTAL_COMMITTED.sub(self.raw_len);
        stats::ARENA_COMMITTED.sub(self.raw_len);
    }
}
