pub(crate) mod arena;
pub(crate) mod block;
pub(crate) mod cached;
pub(crate) mod chunk;
pub(crate) mod free_stack;
pub(crate) mod integration;
pub(crate) mod object_pool;
pub(crate) mod overflow;
pub(crate) mod stats;
pub(crate) mod vm;

use std::fmt;
use vm::VmError;

#[cfg(feature = "guard")]
use crate::sync::atomic::{AtomicU64, Ordering};

/// Construction-time failure. Fatal: the pool was not built and there is
/// no partial-construction state to recover.
///
/// Exhaustion and invalid releases are not errors of this type — they are
/// signaled in-band (`None` from allocate, `false` from release).
#[derive(Debug)]
pub enum PoolError {
    /// `initial > max`, or `max == 0`.
    InvalidCapacity { initial: usize, max: usize },
    /// The requested block count does not fit in an address-space
    /// reservation size.
    CapacityOverflow { blocks: usize },
    /// The bulk reservation or commit failed.
    Vm(VmError),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::InvalidCapacity { initial, max } => {
                write!(f, "invalid pool capacity: initial={initial}, max={max}")
            }
            PoolError::CapacityOverflow { blocks } => {
                write!(f, "pool arena size overflows usize: {blocks} blocks")
            }
            PoolError::Vm(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Vm(e) => Some(e),
            PoolError::InvalidCapacity { .. } | PoolError::CapacityOverflow { .. } => None,
        }
    }
}

impl From<VmError> for PoolError {
    fn from(e: VmError) -> Self {
        PoolError::Vm(e)
    }
}

// Process-wide pool identity source: monotonic, one increment per pool
// construction, never zero.
#[cfg(feature = "guard")]
crate::sync::static_atomic! {
    static POOL_CODE: AtomicU64 = AtomicU64::new(0);
}

#[cfg(feature = "guard")]
pub(crate) fn next_pool_code() -> u64 {
    POOL_CODE.fetch_add(1, Ordering::Relaxed) + 1
}

#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
