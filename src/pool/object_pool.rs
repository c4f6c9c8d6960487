use super::PoolError;
use super::arena::BlockArena;
use super::block::{Block, Factory, InPlace, Mode, Prefill};
use super::free_stack::TaggedStack;
use super::overflow::{BlockNode, OverflowAllocator};
use crate::sync::atomic::{AtomicUsize, Ordering};
use std::marker::PhantomData;
use std::ptr::NonNull;

#[cfg(feature = "guard")]
use super::stats::Counter;

/// Guarded-build usage counters for one pool.
#[cfg(feature = "guard")]
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    /// Elements currently held by callers.
    pub live: usize,
    /// Elements ever materialized (bulk + overflow).
    pub total: usize,
}

/// A lock-free pool of fixed-type elements.
///
/// Storage is two-tier: a bulk arena of `initial` blocks reserved at
/// construction, plus individually heap-allocated overflow blocks grown
/// lazily up to `max`. Freed blocks recycle through a lock-free free
/// stack; nothing is returned to the OS before the pool is dropped.
///
/// `M` selects the element lifecycle at the type level: [`Prefill`]
/// (construct once, recycle live elements) or [`InPlace`] (construct on
/// allocate, drop on release).
pub struct ObjectPool<T, M: Mode<T> = Prefill> {
    free: TaggedStack<Block<T>>,
    arena: Option<BlockArena<T>>,
    overflow: OverflowAllocator<BlockNode<T>>,
    /// Overflow blocks claimed so far; saturates at `claim_max`.
    claimed: AtomicUsize,
    claim_max: usize,
    factory: Factory<T>,
    #[cfg(feature = "guard")]
    code: u64,
    #[cfg(feature = "guard")]
    live: Counter,
    #[cfg(feature = "guard")]
    total: Counter,
    _mode: PhantomData<M>,
}

// Safety: the pool owns all block storage; elements cross threads by
// pointer, hence T: Send. The factory is Send + Sync by construction.
unsafe impl<T: Send, M: Mode<T>> Send for ObjectPool<T, M> {}
// Safety: shared mutation is confined to the free-stack top, the claim
// counter and the guard words — all atomics.
unsafe impl<T: Send, M: Mode<T>> Sync for ObjectPool<T, M> {}

impl<T, M: Mode<T>> ObjectPool<T, M> {
    /// Create a pool with `initial` blocks up front and a hard ceiling of
    /// `max` blocks.
    ///
    /// `factory` constructs elements: for every bulk and overflow block in
    /// [`Prefill`] mode, and for plain [`allocate`](Self::allocate) calls
    /// in [`InPlace`] mode.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidCapacity`] if `initial > max` or `max == 0`;
    /// [`PoolError::Vm`] if the bulk reservation fails.
    pub fn new<F>(initial: usize, max: usize, factory: F) -> Result<Self, PoolError>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        if initial > max || max == 0 {
            return Err(PoolError::InvalidCapacity { initial, max });
        }

        let mut pool = Self {
            free: TaggedStack::new(),
            arena: None,
            overflow: OverflowAllocator::new(),
            claimed: AtomicUsize::new(0),
            claim_max: max - initial,
            factory: Box::new(factory),
            #[cfg(feature = "guard")]
            code: super::next_pool_code(),
            #[cfg(feature = "guard")]
            live: Counter::new(),
            #[cfg(feature = "guard")]
            total: Counter::new(),
            _mode: PhantomData,
        };

        if initial > 0 {
            let arena = BlockArena::new(initial)?;
            for i in 0..initial {
                let block = arena.block(i);
                // Safety: committed arena memory, unaliased during
                // construction; blocks outlive the free stack.
                unsafe {
                    block.as_ptr().write(Block::new_free(pool.pool_code()));
                    M::init_pooled_slot(block.as_ref().element_ptr(), || (pool.factory)());
                    pool.free.push(block);
                }
            }
            pool.arena = Some(arena);
        }

        #[cfg(feature = "guard")]
        pool.total.add(initial);

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

    /// Take an element from the pool.
    ///
    /// Returns `None` only when the pool is exhausted — all `max` blocks
    /// are live. Exhaustion is definitive until some element is released;
    /// it is not a transient condition to retry.
    pub fn allocate(&self) -> Option<NonNull<T>> {
        self.allocate_impl(|| (self.factory)())
    }

    fn allocate_impl<F: FnOnce() -> T>(&self, make: F) -> Option<NonNull<T>> {
        if let Some(block) = self.free.pop() {
            // Safety: a popped block is exclusively ours until released.
            let block_ref = unsafe { block.as_ref() };
            #[cfg(feature = "guard")]
            block_ref.mark_allocated(self.code);
            let slot = block_ref.element_ptr();
            // Safety: slot is valid and exclusively owned.
            unsafe { M::fill_on_allocate(slot, make) };
            #[cfg(feature = "guard")]
            self.live.add(1);
            return NonNull::new(slot);
        }
        self.grow(make)
    }

    #[cold]
    fn grow<F: FnOnce() -> T>(&self, make: F) -> Option<NonNull<T>> {
        // Claim-then-check: check-then-increment would race. An overshoot
        // is compensated with a decrement, so the counter never overcounts
        // and saturates at claim_max once the pool is exhausted.
        let prev = self.claimed.fetch_add(1, Ordering::Relaxed);
        if prev >= self.claim_max {
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            return None;
        }

        let Some(node) = self.overflow.alloc_raw() else {
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            return None;
        };

        // Safety: the node payload is uninitialized and exclusively ours;
        // it is recorded for teardown only once fully constructed (a
        // panicking constructor leaks the node instead of exposing an
        // uninitialized slot to the teardown walk).
        let slot = unsafe {
            let block = &raw mut (*node.as_ptr()).block;
            block.write(Block::new_allocated(self.pool_code()));
            let slot = (*block).element_ptr();
            slot.write(make());
            self.overflow.record(node);
            slot
        };

        #[cfg(feature = "guard")]
        {
            self.total.add(1);
            self.live.add(1);
        }
        NonNull::new(slot)
    }

    /// Return an element to the pool.
    ///
    /// In guarded builds the block is validated first: a double release, a
    /// pointer from a different pool instance, or memory that never came
    /// from a pool returns `false` and mutates nothing. In fast builds no
    /// validation happens and such misuse is undefined behavior.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer obtained from this pool type's `allocate`
    /// (guarded builds reject wrong-pool and already-released pointers; in
    /// fast builds `ptr` must come from *this* pool and be live).
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
        // Safety: pool blocks outlive the free stack.
        unsafe { self.free.push(block) };
        true
    }

    /// Hard ceiling on simultaneously live elements.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.arena.as_ref().map_or(0, BlockArena::len) + self.claim_max
    }

    /// Overflow blocks claimed beyond the bulk arena so far.
    #[must_use]
    pub fn overflow_claimed(&self) -> usize {
        self.claimed.load(Ordering::Relaxed).min(self.claim_max)
    }

    /// Usage counters (guarded builds only).
    #[cfg(feature = "guard")]
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            live: self.live.get(),
            total: self.total.get(),
        }
    }
}

impl<T> ObjectPool<T, InPlace> {
    /// Take an element, constructing it with `make` instead of the pool's
    /// stored factory. The overflow path uses `make` as well.
    pub fn allocate_with<F: FnOnce() -> T>(&self, make: F) -> Option<NonNull<T>> {
        self.allocate_impl(make)
    }
}

impl<T, M: Mode<T>> Drop for ObjectPool<T, M> {
    fn drop(&mut self) {
        #[cfg(feature = "guard")]
        if M::DROPS_ON_RELEASE {
            debug_assert_eq!(
                self.live.get(),
                0,
                "pool dropped with live allocations; their elements will never be dropped"
            );
        }

        // Prefill: every block ever materialized holds a constructed
        // element (release keeps them alive). InPlace: free slots are raw
        // and drop_at_teardown is a no-op.
        if let Some(arena) = self.arena.take() {
            for i in 0..arena.len() {
                // Safety: exclusive access in Drop; mode contract holds.
                unsafe { M::drop_at_teardown(arena.block(i).as_ref().element_ptr()) };
            }
        }
        while let Some(node) = self.overflow.take_retired() {
            // Safety: exclusive access; overflow blocks were fully
            // initialized before being handed out.
            unsafe {
                M::drop_at_teardown((*node.as_ptr()).block.element_ptr());
                OverflowAllocator::<BlockNode<T>>::free_node(node);
            }
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::sync::atomic::{AtomicUsize as TestCounter, Ordering as TestOrdering};

    #[test]
    fn test_invalid_capacity_rejected() {
        assert!(matches!(
            ObjectPool::<u32>::new(4, 2, || 0),
            Err(PoolError::InvalidCapacity { initial: 4, max: 2 })
        ));
        assert!(matches!(
            ObjectPool::<u32>::new(0, 0, || 0),
            Err(PoolError::InvalidCapacity { .. })
        ));
    }

    #[test]
    fn test_capacity_bound_pure_overflow() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // init=0, max=3: exactly 3 allocations succeed, the 4th is None.
        let pool = ObjectPool::<u64, InPlace>::new(0, 3, || 0).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.overflow_claimed(), 3);

        // Safety: pointers came from this pool.
        unsafe {
            assert!(pool.release(a));
            assert!(pool.release(b));
            assert!(pool.release(c));
        }
    }

    #[test]
    fn test_exhaustion_is_terminal_until_release() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u32, InPlace>::new(1, 2, || 7).unwrap();

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        for _ in 0..16 {
            assert!(pool.allocate().is_none());
        }

        // Safety: a came from this pool.
        unsafe { assert!(pool.release(a)) };
        let c = pool.allocate().unwrap();

        // Safety: cleanup.
        unsafe {
            assert!(pool.release(b));
            assert!(pool.release(c));
        }
    }

    #[test]
    fn test_bulk_then_overflow_then_recycle() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u64>::new(2, 4, || 0).unwrap();
        assert_eq!(pool.capacity(), 4);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.overflow_claimed(), 2);
        assert!(pool.allocate().is_none());

        for ptr in held.drain(..) {
            // Safety: pointers came from this pool.
            unsafe { assert!(pool.release(ptr)) };
        }

        // Recycled capacity, no further growth.
        for _ in 0..4 {
            held.push(pool.allocate().unwrap());
        }
        assert_eq!(pool.overflow_claimed(), 2);
        for ptr in held {
            // Safety: pointers came from this pool.
            unsafe { assert!(pool.release(ptr)) };
        }
    }

    #[test]
    fn test_prefill_recycles_element_state() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u64>::new(1, 1, || 10).unwrap();

        let a = pool.allocate().unwrap();
        // Safety: exclusive element access between allocate and release.
        unsafe {
            assert_eq!(*a.as_ref(), 10);
            *a.as_ptr() = 42;
            assert!(pool.release(a));
        }

        // Prefill keeps the element alive across recycling.
        let b = pool.allocate().unwrap();
        // Safety: as above.
        unsafe {
            assert_eq!(*b.as_ref(), 42);
            assert!(pool.release(b));
        }
    }

    #[cfg(feature = "guard")]
    #[test]
    fn test_double_release_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u32>::new(2, 2, || 0).unwrap();

        let a = pool.allocate().unwrap();
        // Safety: a came from this pool.
        unsafe {
            assert!(pool.release(a));
            assert!(!pool.release(a));
            assert!(!pool.release(a));
        }
    }

    #[cfg(feature = "guard")]
    #[test]
    fn test_foreign_pool_release_rejected() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool_a = ObjectPool::<u32>::new(1, 1, || 0).unwrap();
        let pool_b = ObjectPool::<u32>::new(1, 1, || 0).unwrap();

        let a = pool_a.allocate().unwrap();
        // Safety: guarded release validates identity.
        unsafe {
            assert!(!pool_b.release(a));
            // pool_a still accepts it: the failed release mutated nothing.
            assert!(pool_a.release(a));
        }
    }

    #[cfg(feature = "guard")]
    #[test]
    fn test_stats_track_live_and_total() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u32, InPlace>::new(1, 3, || 0).unwrap();
        assert_eq!(pool.stats().total, 1);
        assert_eq!(pool.stats().live, 0);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().total, 2); // one bulk + one overflow

        // Safety: cleanup.
        unsafe {
            pool.release(a);
            pool.release(b);
        }
        assert_eq!(pool.stats().live, 0);
    }

    #[test]
    fn test_inplace_constructs_and_drops_per_cycle() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();

        static BUILT: TestCounter = TestCounter::new(0);
        static DROPPED: TestCounter = TestCounter::new(0);

        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, TestOrdering::Relaxed);
            }
        }

        BUILT.store(0, TestOrdering::Relaxed);
        DROPPED.store(0, TestOrdering::Relaxed);

        let pool = ObjectPool::<Probe, InPlace>::new(2, 2, || {
            BUILT.fetch_add(1, TestOrdering::Relaxed);
            Probe
        })
        .unwrap();
        // InPlace builds nothing up front.
        assert_eq!(BUILT.load(TestOrdering::Relaxed), 0);

        let a = pool.allocate().unwrap();
        assert_eq!(BUILT.load(TestOrdering::Relaxed), 1);
        // Safety: a came from this pool.
        unsafe { assert!(pool.release(a)) };
        assert_eq!(DROPPED.load(TestOrdering::Relaxed), 1);

        drop(pool);
        // Teardown adds nothing: every element already dropped at release.
        assert_eq!(BUILT.load(TestOrdering::Relaxed), 1);
        assert_eq!(DROPPED.load(TestOrdering::Relaxed), 1);
    }

    #[test]
    fn test_prefill_teardown_drops_all_elements() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();

        static DROPPED: TestCounter = TestCounter::new(0);

        struct Probe;
        impl Drop for Probe {
            fn drop(&mut self) {
                DROPPED.fetch_add(1, TestOrdering::Relaxed);
            }
        }

        DROPPED.store(0, TestOrdering::Relaxed);
        {
            let pool = ObjectPool::<Probe>::new(3, 5, || Probe).unwrap();
            // Pull one overflow element into existence, then return it.
            let mut held = Vec::new();
            for _ in 0..4 {
                held.push(pool.allocate().unwrap());
            }
            for ptr in held {
                // Safety: pointers came from this pool.
                unsafe { assert!(pool.release(ptr)) };
            }
            assert_eq!(DROPPED.load(TestOrdering::Relaxed), 0);
        }
        // 3 bulk + 1 overflow elements dropped at teardown.
        assert_eq!(DROPPED.load(TestOrdering::Relaxed), 4);
    }

    #[cfg(all(feature = "guard", debug_assertions))]
    #[test]
    #[should_panic(expected = "live allocations")]
    fn test_inplace_drop_with_live_allocation_asserts() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u32, InPlace>::new(1, 1, || 0).unwrap();
        let _leaked = pool.allocate().unwrap();
        drop(pool);
    }

    #[test]
    fn test_initial_equals_max_never_grows() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        let pool = ObjectPool::<u8>::new(2, 2, || 0).unwrap();
        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert!(pool.allocate().is_none());
        assert_eq!(pool.overflow_claimed(), 0);
        // Safety: cleanup.
        unsafe {
            pool.release(a);
            pool.release(b);
        }
    }
}
