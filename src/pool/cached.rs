use super::PoolError;
use super::arena::BlockArena;
use super::block::{Block, Factory, InPlace, Mode, Prefill};
use super::chunk::Chunk;
use super::free_stack::TaggedStack;
use super::object_pool::ObjectPool;
use super::overflow::{ArrayNode, OverflowAllocator};
use crate::sync::atomic::{AtomicUsize, Ordering};
use crate::tls::TlsSlot;
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(feature = "guard")]
use super::stats::Counter;

/// Default number of blocks per chunk.
pub const DEFAULT_CHUNK_BLOCKS: usize = 400;

/// Ceiling for the chunk-shell manager. Effectively unbounded: shells are
/// tiny and one exists per chunk of elements.
const SHELL_POOL_MAX: usize = usize::MAX >> 8;

/// Guarded-build usage counters for a [`CachedPool`].
#[cfg(feature = "guard")]
#[derive(Debug, Clone, Copy)]
pub struct ChunkStats {
    /// Chunks ever materialized (bulk + growth).
    pub total_chunks: usize,
    /// Chunks currently owned by threads.
    pub chunks_in_use: usize,
    /// Blocks currently held by callers.
    pub live_blocks: usize,
}

/// An [`ObjectPool`] variant that batches blocks into fixed-capacity
/// [`Chunk`]s and keeps one chunk private to each thread.
///
/// Most allocate/release traffic touches only the calling thread's chunk —
/// no shared state at all. Shared structures (the stack of full chunks,
/// the chunk-shell manager, the growth counter) are touched once per
/// `CHUNK_BLOCKS` operations, when a chunk drains or fills. That is the
/// whole trade: a little per-thread slack for an order-of-magnitude drop
/// in cross-thread contention.
///
/// Capacity is accounted in whole chunks; `max` is rounded up to a chunk
/// multiple.
pub struct CachedPool<T, M: Mode<T> = Prefill, const CHUNK_BLOCKS: usize = DEFAULT_CHUNK_BLOCKS> {
    arena: Option<BlockArena<T>>,
    /// Sealed, block-filled chunks with no owner.
    full_chunks: TaggedStack<Chunk<T, CHUNK_BLOCKS>>,
    /// Recycles empty chunk shells.
    shells: ObjectPool<Chunk<T, CHUNK_BLOCKS>, Prefill>,
    arrays: OverflowAllocator<ArrayNode<T, CHUNK_BLOCKS>>,
    /// Growth chunks claimed so far; saturates at `claim_max`.
    claimed: AtomicUsize,
    claim_max: usize,
    slot: TlsSlot,
    factory: Factory<T>,
    #[cfg(feature = "guard")]
    code: u64,
    #[cfg(feature = "guard")]
    total_chunks: Counter,
    #[cfg(feature = "guard")]
    chunks_in_use: Counter,
    #[cfg(feature = "guard")]
    live: Counter,
    _mode: PhantomData<M>,
}

// Safety: the pool owns all block and chunk storage; elements cross
// threads by pointer, hence T: Send.
unsafe impl<T: Send, M: Mode<T>, const N: usize> Send for CachedPool<T, M, N> {}
// Safety: shared mutation is confined to the chunk stack top, the shell
// pool, the claim counter and the guard words; thread-local chunks are
// private by construction.
unsafe impl<T: Send, M: Mode<T>, const N: usize> Sync for CachedPool<T, M, N> {}

fn parallelism() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

impl<T, M: Mode<T>, const CHUNK_BLOCKS: usize> CachedPool<T, M, CHUNK_BLOCKS> {
    /// Create a pool holding `initial` blocks up front (rounded up to whole
    /// chunks) with a hard ceiling of `max` blocks (likewise rounded up).
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidCapacity`] if `initial > max` or `max == 0`;
    /// [`PoolError::Vm`] if a bulk reservation fails.
    pub fn new<F>(initial: usize, max: usize, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        const { assert!(CHUNK_BLOCKS > 0, "CHUNK_BLOCKS must be non-zero") };

        if initial > max || max == 0 {
            return Err(PoolError::InvalidCapacity { initial, max });
        }

        let initial_chunks = initial.div_ceil(CHUNK_BLOCKS);
        let max_chunks = max.div_ceil(CHUNK_BLOCKS);

        // Shell headroom: one empty shell per thread can be in flight on
        // top of the initial chunks.
        let shells = ObjectPool::new(initial_chunks + parallelism(), SHELL_POOL_MAX, || {
            Chunk::new()
        })?;

        let mut pool = Self {
            arena: None,
            full_chunks: TaggedStack::new(),
            shells,
            arrays: OverflowAllocator::new(),
            claimed: AtomicUsize::new(0),
            claim_max: max_chunks - initial_chunks,
            slot: TlsSlot::new(),
            factory: Box::new(factory),
            #[cfg(feature = "guard")]
            code: super::next_pool_code(),
            #[cfg(feature = "guard")]
            total_chunks: Counter::new(),
            #[cfg(feature = "guard")]
            chunks_in_use: Counter::new(),
            #[cfg(feature = "guard")]
            live: Counter::new(),
            _mode: PhantomData,
        };

        if initial_chunks > 0 {
            let arena = BlockArena::new(initial_chunks * CHUNK_BLOCKS)?;
            for c in 0..initial_chunks {
                let Some(shell) = pool.shells.allocate() else {
                    unreachable!("shell pool is sized for the initial chunks")
                };
                // Safety: a freshly allocated shell is exclusively ours.
                let chunk = unsafe { &mut *shell.as_ptr() };
                for i in 0..CHUNK_BLOCKS {
                    let block = arena.block(c * CHUNK_BLOCKS + i);
                    // Safety: committed arena memory, unaliased during
                    // construction.
                    unsafe {
                        block.as_ptr().write(Block::new_free(pool.pool_code()));
                        M::init_pooled_slot(block.as_ref().element_ptr(), || (pool.factory)());
                    }
                    let pushed = chunk.push(block);
                    debug_assert!(pushed);
                }
                // Safety: chunk shells outlive the stack (shell pool field).
                unsafe { pool.full_chunks.push(shell) };
            }
            pool.arena = Some(arena);
        }

        #[cfg(feature = "guard")]
        pool.total_chunks.add(initial_chunks);

        Ok(pool)
    }

    #[cfg(feature = "guard")]
    #[inline]
    fn pool_code(&self) -> u64 {
        self.code
    }

    #[cfg(not(feature = "guard"))]
    #[inline]
    fn pool_code(&self) -> u64 {
        0
    }

    #[inline]
    fn tls_chunk(&self) -> Option<NonNull<Chunk<T, CHUNK_BLOCKS>>> {
        NonNull::new(self.slot.get() as *mut Chunk<T, CHUNK_BLOCKS>)
    }

    /// Take an element from the pool.
    ///
    /// Returns `None` only when the pool is exhausted (every chunk is in
    /// use and all growth chunks are claimed). Exhaustion is definitive
    /// until some element is released.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        self.allocate_impl(|| (self.factory)())
    }

    fn allocate_impl<F: FnOnce() -> T>(&self, make: F) -> Option<NonNull<T>> {
        let mut chunk = match self.tls_chunk() {
            Some(chunk) => chunk,
            None => {
                let chunk = self.chunk_alloc()?;
                self.slot.set(chunk.as_ptr() as usize);
                chunk
            }
        };

        // Safety: the TLS chunk is exclusively owned by this thread.
        let block = match unsafe { chunk.as_mut() }.pop() {
            Some(block) => block,
            None => {
                // Drained: hand the empty shell back, fetch a full chunk.
                // Safety: the drained shell is exclusively ours.
                unsafe { self.release_shell(chunk) };
                let Some(fresh) = self.chunk_alloc() else {
                    self.slot.set(0);
                    return None;
                };
                self.slot.set(fresh.as_ptr() as usize);
                chunk = fresh;
                // Safety: as above; chunk_alloc only returns full chunks.
                match unsafe { chunk.as_mut() }.pop() {
                    Some(block) => block,
                    None => {
                        debug_assert!(false, "chunk_alloc returned a non-full chunk");
                        // Safety: chunk_alloc fills every chunk it returns.
                        unsafe { std::hint::unreachable_unchecked() }
                    }
                }
            }
        };

        // Safety: a popped block is exclusively ours until released.
        let block_ref = unsafe { block.as_ref() };
        #[cfg(feature = "guard")]
        block_ref.mark_allocated(self.code);
        let slot = block_ref.element_ptr();
        // Safety: slot is valid and exclusively owned.
        unsafe { M::fill_on_allocate(slot, make) };
        #[cfg(feature = "guard")]
        self.live.add(1);
        NonNull::new(slot)
    }

    /// Obtain a full chunk: recycle one from the shared stack, or claim a
    /// growth slot and build one from a fresh block array.
    fn chunk_alloc(&self) -> Option<NonNull<Chunk<T, CHUNK_BLOCKS>>> {
        if let Some(chunk) = self.full_chunks.pop() {
            #[cfg(feature = "guard")]
            self.chunks_in_use.add(1);
            return Some(chunk);
        }

        // Claim-then-check with a compensating decrement on overshoot, so
        // the counter never overcounts and saturates once exhausted.
        let prev = self.claimed.fetch_add(1, Ordering::Relaxed);
        if prev >= self.claim_max {
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        let Some(array) = self.arrays.alloc_raw() else {
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            return None;
        };

        // Construct every block before the array becomes reachable from
        // anywhere (a panicking constructor leaks the array, nothing more).
        // Safety: the array payload is uninitialized and exclusively ours.
        unsafe {
            for i in 0..CHUNK_BLOCKS {
                let block = &raw mut (*array.as_ptr()).blocks[i];
                block.write(Block::new_free(self.pool_code()));
                M::init_pooled_slot((*block).element_ptr(), || (self.factory)());
            }
            self.arrays.record(array);
        }

        let Some(shell) = self.shells.allocate() else {
            // The array stays retired for teardown; give the claim back.
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            return None;
        };
        // Safety: a freshly allocated shell is exclusively ours.
        let chunk = unsafe { &mut *shell.as_ptr() };
        for i in 0..CHUNK_BLOCKS {
            // Safety: array blocks were initialized above and are unowned.
            let block = unsafe { NonNull::new_unchecked(&raw mut (*array.as_ptr()).blocks[i]) };
            let pushed = chunk.push(block);
            debug_assert!(pushed);
        }

        #[cfg(feature = "guard")]
        {
            self.total_chunks.add(1);
            self.chunks_in_use.add(1);
        }
        Some(shell)
    }

    /// Return a drained shell to the chunk manager.
    ///
    /// # Safety
    ///
    /// `shell` must have come from this pool's shell manager and be
    /// exclusively owned by the caller.
    unsafe fn release_shell(&self, shell: NonNull<Chunk<T, CHUNK_BLOCKS>>) {
        // Safety: upheld by caller.
        let ok = unsafe { self.shells.release(shell) };
        debug_assert!(ok, "shell failed guard validation on release");
    }

    /// Return an element to the pool.
    ///
    /// Validation behaves exactly as [`ObjectPool::release`]: guarded
    /// builds reject double releases, foreign-pool pointers and wild
    /// pointers with `false`; fast builds detect nothing.
    ///
    /// # Safety
    ///
    /// Same contract as [`ObjectPool::release`].
    ///
    /// # Panics
    ///
    /// Panics if the global heap cannot produce an empty chunk shell for
    /// the calling thread.
    pub unsafe fn release(&self, ptr: NonNull<T>) -> bool {
        // Safety: caller guarantees ptr is an element pointer.
        let block = unsafe { Block::from_element(ptr) };
        // Safety: block stays valid for the pool's lifetime.
        let block_ref = unsafe { block.as_ref() };

        #[cfg(feature = "guard")]
        {
            if !block_ref.try_claim_release(self.code) {
                return false;
            }
            self.live.sub(1);
        }

        // Safety: we won the release claim; the element is ours to clear.
        unsafe { M::clear_on_release(block_ref.element_ptr()) };

        let mut chunk = match self.tls_chunk() {
            Some(chunk) => chunk,
            None => {
                let Some(fresh) = self.shells.allocate() else {
                    panic!("chunk shell allocation failed during release");
                };
                self.slot.set(fresh.as_ptr() as usize);
                fresh
            }
        };

        // Safety: the TLS chunk is exclusively owned by this thread.
        if !unsafe { chunk.as_mut() }.push(block) {
            // Sealed full: publish it and continue in a fresh shell.
            // Safety: chunk shells outlive the stack.
            unsafe { self.full_chunks.push(chunk) };
            #[cfg(feature = "guard")]
            self.chunks_in_use.sub(1);

            let Some(fresh) = self.shells.allocate() else {
                panic!("chunk shell allocation failed during release");
            };
            // Safety: a freshly allocated shell is exclusively ours.
            let pushed = unsafe { &mut *fresh.as_ptr() }.push(block);
            debug_assert!(pushed);
            self.slot.set(fresh.as_ptr() as usize);
        }
        true
    }

    /// Hard ceiling on simultaneously live elements (whole chunks).
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.as_ref().map_or(0, BlockArena::len) + self.claim_max * CHUNK_BLOCKS
    }

    /// Growth chunks claimed beyond the bulk arena so far.
    #[must_use]
    pub fn overflow_claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed).min(self.claim_max)
    }

    /// Usage counters (guarded builds only).
    #[cfg(feature = "guard")]
    #[must_use]
    pub fn chunk_stats(&self) -> ChunkStats {
        ChunkStats {
            total_chunks: self.total_chunks.get(),
            chunks_in_use: self.chunks_in_use.get(),
            live_blocks: self.live.get(),
        }
    }
}

impl<T, const CHUNK_BLOCKS: usize> CachedPool<T, InPlace, CHUNK_BLOCKS> {
    /// Take an element, constructing it with `make` instead of the pool's
    /// stored factory.
    pub fn allocate_with<F: FnOnce() -> T>(&self, make: F) -> Option<NonNull<T>> {
        self.allocate_impl(make)
    }
}

impl<T, M: Mode<T>, const CHUNK_BLOCKS: usize> Drop for CachedPool<T, M, CHUNK_BLOCKS> {
    fn drop(&mut self) {
        #[cfg(feature = "guard")]
        if M::DROPS_ON_RELEASE {
            debug_assert_eq!(
                self.live.get(),
                0,
                "pool dropped with live allocations; their elements will never be dropped"
            );
        }

        // Every block ever created lives in the arena or in a retired
        // array — including blocks sitting inside chunks that threads never
        // handed back. Prefill: all of them hold constructed elements.
        // InPlace: free slots are raw and drop_at_teardown is a no-op;
        // anything still held by a caller is the caller's leak.
        if let Some(arena) = self.arena.take() {
            for i in 0..arena.len() {
                // Safety: exclusive access in Drop; mode contract holds.
                unsafe { M::drop_at_teardown(arena.block(i).as_ref().element_ptr()) };
            }
        }
        while let Some(node) = self.arrays.take_retired() {
            // Safety: exclusive access; retired arrays are always fully
            // constructed before being recorded.
            unsafe {
                for i in 0..CHUNK_BLOCKS {
                    M::drop_at_teardown((*node.as_ptr()).blocks[i].element_ptr());
                }
                OverflowAllocator::<ArrayNode<T, CHUNK_BLOCKS>>::free_node(node);
            }
        }
        // `shells` drops itself (chunk shells carry no element state) and
        // the TLS slot's Drop invalidates any stale thread-local pointers.
    }
}
