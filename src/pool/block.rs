use super::free_stack::StackNode;
use crate::sync::atomic::AtomicUsize;
use std::cell::UnsafeCell;
use std::mem::{MaybeUninit, offset_of};
use std::ptr::NonNull;

#[cfg(feature = "guard")]
use crate::sync::atomic::{AtomicU64, Ordering};

/// Boxed element constructor shared by a pool and its growth paths.
pub(crate) type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Storage for one pooled element plus its bookkeeping.
///
/// Guarded layout (`guard` feature, default):
///
/// ```text
///   pre   — owning pool's identity code, written when the block enters
///           the pool, never rewritten
///   slot  — element storage
///   next  — intrusive link (free stack or a chunk's private list)
///   post  — state word: code when allocated, !code when free
/// ```
///
/// The fast layout drops `pre`/`post` entirely; release then performs no
/// validation and misuse is undefined behavior.
#[repr(C)]
pub(crate) struct Block<T> {
    #[cfg(feature = "guard")]
    pre: u64,
    slot: UnsafeCell<MaybeUninit<T>>,
    next: AtomicUsize,
    #[cfg(feature = "guard")]
    post: AtomicU64,
}

impl<T> Block<T> {
    /// A block in the free state (guarded: `post = !code`).
    pub(crate) fn new_free(code: u64) -> Self {
        #[cfg(not(feature = "guard"))]
        let _ = code;
        Self {
            #[cfg(feature = "guard")]
            pre: code,
            slot: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicUsize::new(0),
            #[cfg(feature = "guard")]
            post: AtomicU64::new(!code),
        }
    }

    /// A block born allocated (guarded: `post = code`) — the overflow path
    /// hands fresh blocks straight to the caller.
    pub(crate) fn new_allocated(code: u64) -> Self {
        #[cfg(not(feature = "guard"))]
        let _ = code;
        Self {
            #[cfg(feature = "guard")]
            pre: code,
            slot: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicUsize::new(0),
            #[cfg(feature = "guard")]
            post: AtomicU64::new(code),
        }
    }

    #[inline]
    pub(crate) fn element_ptr(&self) -> *mut T {
        self.slot.get().cast::<T>()
    }

    /// Recover the owning block from an element pointer.
    ///
    /// # Safety
    ///
    /// `element` must have been produced by `element_ptr` on a live block.
    #[inline]
    pub(crate) unsafe fn from_element(element: NonNull<T>) -> NonNull<Block<T>> {
        // Safety: element sits at the fixed slot offset inside its block.
        unsafe { element.byte_sub(offset_of!(Block<T>, slot)).cast() }
    }

    /// Flip a freshly popped block to the allocated state.
    #[cfg(feature = "guard")]
    #[inline]
    pub(crate) fn mark_allocated(&self, code: u64) {
        // The popping thread owns the block exclusively; ordering rides the
        // stack's Release/Acquire CAS.
        self.post.store(code, Ordering::Relaxed);
    }

    /// Validate and claim a release.
    ///
    /// Returns `false` — leaving the block untouched — for a double free
    /// (`post` already `!code`), memory that was never handed out by a pool
    /// (`pre != post`), or a block owned by a different pool instance
    /// (`pre != code`). The state check and the free-transition are one
    /// compare-and-swap, so of two racing releases exactly one wins.
    #[cfg(feature = "guard")]
    pub(crate) fn try_claim_release(&self, code: u64) -> bool {
        let pre = self.pre;
        let post = self.post.load(Ordering::Acquire);
        if pre != post {
            return false;
        }
        if pre != code {
            return false;
        }
        self.post
            .compare_exchange(code, !code, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }
}

// Safety: the link word belongs to whichever free stack or chunk currently
// holds the block; pools never put one block in two places.
unsafe impl<T> StackNode for Block<T> {
    fn link(&self) -> &AtomicUsize {
        &self.next
    }

    unsafe fn init_link(node: *mut Self) {
        // Safety: caller provides exclusive access to uninitialized node.
        unsafe { (&raw mut (*node).next).write(AtomicUsize::new(0)) };
    }
}

// ---------------------------------------------------------------------------
// Construction modes
// ---------------------------------------------------------------------------

mod sealed {
    pub trait Sealed {}
}

/// Elements are constructed once — in bulk at pool construction, lazily at
/// overflow growth — and recycled as-is. `release` keeps the element alive;
/// teardown drops every pool-owned element.
pub struct Prefill;

/// Blocks stay raw while free. `allocate` constructs a fresh element,
/// `release` drops it in place. Teardown drops nothing; anything never
/// released is the caller's leak.
pub struct InPlace;

impl sealed::Sealed for Prefill {}
impl sealed::Sealed for InPlace {}

/// Element lifecycle policy, selected at the type level so the hot path
/// carries no mode branch. Sealed: `Prefill` and `InPlace` are the only
/// implementations.
pub trait Mode<T>: sealed::Sealed + 'static {
    /// Whether `release` drops the element (and therefore every element
    /// must be released before the pool is).
    const DROPS_ON_RELEASE: bool;

    /// A raw block enters free pool storage (arena carve-up, chunk fill).
    ///
    /// # Safety
    ///
    /// `slot` must be valid for writes and exclusively owned.
    unsafe fn init_pooled_slot<F: FnOnce() -> T>(slot: *mut T, make: F);

    /// A block has been popped for the caller.
    ///
    /// # Safety
    ///
    /// `slot` must be exclusively owned; for `Prefill` it must already hold
    /// a live element.
    unsafe fn fill_on_allocate<F: FnOnce() -> T>(slot: *mut T, make: F);

    /// The caller returned the block.
    ///
    /// # Safety
    ///
    /// `slot` must be exclusively owned; for `InPlace` it must hold a live
    /// element.
    unsafe fn clear_on_release(slot: *mut T);

    /// Pool teardown reached a block in pool-owned storage.
    ///
    /// # Safety
    ///
    /// Exclusive access; for `Prefill` the slot must hold a live element.
    unsafe fn drop_at_teardown(slot: *mut T);
}

impl<T> Mode<T> for Prefill {
    const DROPS_ON_RELEASE: bool = false;

    #[inline]
    unsafe fn init_pooled_slot<F: FnOnce() -> T>(slot: *mut T, make: F) {
        // Safety: upheld by caller.
        unsafe { slot.write(make()) };
    }

    #[inline]
    unsafe fn fill_on_allocate<F: FnOnce() -> T>(_slot: *mut T, _make: F) {}

    #[inline]
    unsafe fn clear_on_release(_slot: *mut T) {}

    #[inline]
    unsafe fn drop_at_teardown(slot: *mut T) {
        // Safety: upheld by caller.
        unsafe { slot.drop_in_place() };
    }
}

impl<T> Mode<T> for InPlace {
    const DROPS_ON_RELEASE: bool = true;

    #[inline]
    unsafe fn init_pooled_slot<F: FnOnce() -> T>(_slot: *mut T, _make: F) {}

    #[inline]
    unsafe fn fill_on_allocate<F: FnOnce() -> T>(slot: *mut T, make: F) {
        // Safety: upheld by caller.
        unsafe { slot.write(make()) };
    }

    #[inline]
    unsafe fn clear_on_release(slot: *mut T) {
        // Safety: upheld by caller.
        unsafe { slot.drop_in_place() };
    }

    #[inline]
    unsafe fn drop_at_teardown(_slot: *mut T) {}
}
