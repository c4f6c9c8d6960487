use super::block::Block;
use super::free_stack::StackNode;
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::ptr::NonNull;

/// A fixed-capacity batch of blocks with exactly one owner at a time: a
/// thread (via its TLS slot), or nobody — parked full on the shared chunk
/// stack or empty in the chunk manager.
///
/// `push`/`pop` are plain non-atomic operations; correctness relies
/// entirely on the single-owner invariant. The link words are atomics only
/// because blocks and chunks share their link type with the lock-free
/// stacks; all stores here are Relaxed and visibility to the next owner
/// rides the chunk stack's Release/Acquire CAS.
pub(crate) struct Chunk<T, const N: usize> {
    head: *mut Block<T>,
    len: usize,
    /// Shared chunk-stack link.
    link: AtomicUsize,
}

// Safety: a chunk only carries pointers into pool-owned storage; moving it
// between threads transfers exclusive ownership of those blocks.
unsafe impl<T: Send, const N: usize> Send for Chunk<T, N> {}

impl<T, const N: usize> Chunk<T, N> {
    pub(crate) fn new() -> Self {
        Self {
            head: std::ptr::null_mut(),
            len: 0,
            link: AtomicUsize::new(0),
        }
    }

    /// Add a block. Fails (returns `false`) at capacity.
    pub(crate) fn push(&mut self, block: NonNull<Block<T>>) -> bool {
        if self.len == N {
            return false;
        }
        // Safety: the block is exclusively owned by our owner thread.
        unsafe { block.as_ref() }
            .link()
            .store(self.head as usize, Ordering::Relaxed);
        self.head = block.as_ptr();
        self.len += 1;
        true
    }

    /// Remove the most recently pushed block, or `None` if empty.
    pub(crate) fn pop(&mut self) -> Option<NonNull<Block<T>>> {
        let node = NonNull::new(self.head)?;
        // Safety: blocks on our private list are exclusively owned.
        let next = unsafe { node.as_ref() }.link().load(Ordering::Relaxed);
        self.head = next as *mut Block<T>;
        self.len -= 1;
        Some(node)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

// Safety: `link` is reserved for the shared chunk stack; a chunk's private
// list uses the blocks' own link words, never this one.
unsafe impl<T, const N: usize> StackNode for Chunk<T, N> {
    fn link(&self) -> &AtomicUsize {
        &self.link
    }

    unsafe fn init_link(node: *mut Self) {
        // Safety: caller provides exclusive access to uninitialized node.
        unsafe { (&raw mut (*node).link).write(AtomicUsize::new(0)) };
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    fn boxed_block(code: u64) -> NonNull<Block<u32>> {
        NonNull::from(Box::leak(Box::new(Block::new_free(code))))
    }

    unsafe fn free_block(block: NonNull<Block<u32>>) {
        // Safety: block came from boxed_block and is off every list.
        drop(unsafe { Box::from_raw(block.as_ptr()) });
    }

    #[test]
    fn test_chunk_lifo_and_bounds() {
        let mut chunk = Chunk::<u32, 3>::new();
        assert!(chunk.pop().is_none());

        let blocks: Vec<_> = (0..4).map(|_| boxed_block(1)).collect();

        assert!(chunk.push(blocks[0]));
        assert!(chunk.push(blocks[1]));
        assert!(chunk.push(blocks[2]));
        assert_eq!(chunk.len(), 3);
        // At capacity: push fails and the chunk is untouched.
        assert!(!chunk.push(blocks[3]));
        assert_eq!(chunk.len(), 3);

        assert_eq!(chunk.pop().unwrap(), blocks[2]);
        assert_eq!(chunk.pop().unwrap(), blocks[1]);
        assert_eq!(chunk.pop().unwrap(), blocks[0]);
        assert!(chunk.pop().is_none());

        for block in blocks {
            // Safety: Test code.
            unsafe { free_block(block) };
        }
    }

    #[test]
    fn test_chunk_refill_after_drain() {
        let mut chunk = Chunk::<u32, 2>::new();
        let a = boxed_block(1);
        let b = boxed_block(1);

        assert!(chunk.push(a));
        assert!(chunk.pop().is_some());
        assert!(chunk.push(b));
        assert!(chunk.push(a));
        assert_eq!(chunk.len(), 2);
        assert!(chunk.pop().is_some());
        assert!(chunk.pop().is_some());

        // Safety: Test code.
        unsafe {
            free_block(a);
            free_block(b);
        }
    }
}
