use super::block::Block;
use super::free_stack::{StackNode, TaggedStack};
use super::stats;
use crate::sync::atomic::AtomicUsize;
use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

/// One extra block for an `ObjectPool`.
#[repr(C)]
pub(crate) struct BlockNode<T> {
    pub(crate) block: Block<T>,
    /// Teardown-stack link. Never used for reuse.
    retire: AtomicUsize,
}

// Safety: `retire` is reserved for the allocator's teardown stack; the
// embedded block's own link belongs to the owning pool.
unsafe impl<T> StackNode for BlockNode<T> {
    fn link(&self) -> &AtomicUsize {
        &self.retire
    }

    unsafe fn init_link(node: *mut Self) {
        // Safety: caller provides exclusive access to uninitialized node.
        unsafe { (&raw mut (*node).retire).write(AtomicUsize::new(0)) };
    }
}

/// One extra chunk's worth of blocks for a `CachedPool`.
#[repr(C)]
pub(crate) struct ArrayNode<T, const N: usize> {
    pub(crate) blocks: [Block<T>; N],
    /// Teardown-stack link. Never used for reuse.
    retire: AtomicUsize,
}

// Safety: same discipline as `BlockNode`.
unsafe impl<T, const N: usize> StackNode for ArrayNode<T, N> {
    fn link(&self) -> &AtomicUsize {
        &self.retire
    }

    unsafe fn init_link(node: *mut Self) {
        // Safety: caller provides exclusive access to uninitialized node.
        unsafe { (&raw mut (*node).retire).write(AtomicUsize::new(0)) };
    }
}

/// The growth tier: hands out brand-new heap nodes and remembers every one
/// of them — on an internal stack used only at teardown — so the owning
/// pool can destroy and free them all when it is dropped.
///
/// This allocator never reuses nodes for pool traffic (that reuse happens
/// one layer up, through the pool's own free structures) and never returns
/// a node to the OS before teardown.
pub(crate) struct OverflowAllocator<N: StackNode> {
    created: TaggedStack<N>,
}

impl<N: StackNode> OverflowAllocator<N> {
    pub(crate) fn new() -> Self {
        Self {
            created: TaggedStack::new(),
        }
    }

    /// Heap-allocate a raw node.
    ///
    /// The payload is uninitialized (only the teardown link is written).
    /// The caller must initialize the payload and then [`record`](Self::record)
    /// the node; a node whose initialization panics is merely leaked, never
    /// walked at teardown. Returns `None` if the heap allocation fails.
    pub(crate) fn alloc_raw(&self) -> Option<NonNull<N>> {
        let layout = Layout::new::<N>();
        // Safety: node layouts are never zero-sized (they carry a link word).
        let raw = unsafe { alloc(layout) };
        let node = NonNull::new(raw.cast::<N>())?;
        // Safety: fresh exclusive allocation.
        unsafe { N::init_link(node.as_ptr()) };
        Some(node)
    }

    /// Remember a fully initialized node for teardown.
    ///
    /// # Safety
    ///
    /// `node` must come from [`alloc_raw`](Self::alloc_raw) on this
    /// allocator, with its payload fully initialized, and must be recorded
    /// exactly once.
    pub(crate) unsafe fn record(&self, node: NonNull<N>) {
        // Safety: the node outlives the stack — it is freed only through
        // take_retired/free_node or our Drop.
        unsafe { self.created.push(node) };
        stats::OVERFLOW_NODES.add(1);
    }

    /// Detach one recorded node at teardown. The caller takes ownership and
    /// must dispose of the payload, then call [`free_node`](Self::free_node).
    pub(crate) fn take_retired(&mut self) -> Option<NonNull<N>> {
        self.created.pop()
    }

    /// Free a node obtained from [`take_retired`](Self::take_retired).
    ///
    /// # Safety
    ///
    /// `node` must come from `take_retired` on this allocator and its
    /// payload must already be disposed of.
    pub(crate) unsafe fn free_node(node: NonNull<N>) {
        // Safety: allocated in alloc_raw with the same layout.
        unsafe { dealloc(node.as_ptr().cast::<u8>(), Layout::new::<N>()) };
        stats::OVERFLOW_NODES.sub(1);
    }
}

impl<N: StackNode> Drop for OverflowAllocator<N> {
    fn drop(&mut self) {
        // Backstop only: the owning pool walks take_retired first and
        // disposes of payloads. Anything left here is raw storage.
        while let Some(node) = self.created.pop() {
            // Safety: node was allocated in alloc_raw and is off all lists.
            unsafe { Self::free_node(node) };
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::Ordering;

    #[test]
    fn test_alloc_records_every_node() {
        let mut overflow = OverflowAllocator::<BlockNode<u64>>::new();
        let mut handed_out = Vec::new();
        for _ in 0..8 {
            let node = overflow.alloc_raw().unwrap();
            // Safety: payload is ours to initialize; recorded once, after init.
            unsafe {
                (&raw mut (*node.as_ptr()).block).write(Block::new_allocated(1));
                overflow.record(node);
            }
            handed_out.push(node.as_ptr() as usize);
        }

        let mut retired = Vec::new();
        while let Some(node) = overflow.take_retired() {
            retired.push(node.as_ptr() as usize);
            // Safety: payload is a plain u64 block, nothing to dispose.
            unsafe { OverflowAllocator::<BlockNode<u64>>::free_node(node) };
        }

        retired.sort_unstable();
        handed_out.sort_unstable();
        assert_eq!(retired, handed_out);
    }

    #[test]
    fn test_nodes_are_distinct() {
        let overflow = OverflowAllocator::<BlockNode<u32>>::new();
        let a = overflow.alloc_raw().unwrap();
        let b = overflow.alloc_raw().unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        // Safety: payloads initialized before recording.
        unsafe {
            (&raw mut (*a.as_ptr()).block).write(Block::new_allocated(1));
            (&raw mut (*b.as_ptr()).block).write(Block::new_allocated(1));
            overflow.record(a);
            overflow.record(b);
        }
        // Drop backstop frees both.
    }

    #[test]
    fn test_array_node_layout_usable() {
        let mut overflow = OverflowAllocator::<ArrayNode<u32, 4>>::new();
        let node = overflow.alloc_raw().unwrap();
        // Safety: exclusive raw payload; recorded once, after init.
        unsafe {
            for i in 0..4 {
                let block = &raw mut (*node.as_ptr()).blocks[i];
                block.write(Block::new_free(9));
                (*block).element_ptr().write(i as u32);
            }
            for i in 0..4 {
                assert_eq!(*(*node.as_ptr()).blocks[i].element_ptr(), i as u32);
            }
            overflow.record(node);
        }
        let retired = overflow.take_retired().unwrap();
        assert_eq!(retired.as_ptr(), node.as_ptr());
        // Safety: payload is plain data.
        unsafe { OverflowAllocator::<ArrayNode<u32, 4>>::free_node(retired) };
    }

    #[test]
    fn test_overflow_gauge_balance() {
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        let before = stats::OVERFLOW_NODES.load(Ordering::Relaxed);
        {
            let overflow = OverflowAllocator::<BlockNode<u8>>::new();
            let a = overflow.alloc_raw().unwrap();
            let b = overflow.alloc_raw().unwrap();
            // Safety: payloads initialized before recording.
            unsafe {
                (&raw mut (*a.as_ptr()).block).write(Block::new_allocated(1));
                (&raw mut (*b.as_ptr()).block).write(Block::new_allocated(1));
                overflow.record(a);
                overflow.record(b);
            }
            assert_eq!(stats::OVERFLOW_NODES.load(Ordering::Relaxed), before + 2);
        }
        assert_eq!(stats::OVERFLOW_NODES.load(Ordering::Relaxed), before);
    }
}
