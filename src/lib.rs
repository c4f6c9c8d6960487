#[cfg(not(target_pointer_width = "64"))]
compile_error!("blockpool supports only 64-bit targets.");

pub(crate) mod sync;
pub(crate) mod tls;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// pools
pub use pool::cached::{CachedPool, DEFAULT_CHUNK_BLOCKS};
pub use pool::object_pool::ObjectPool;

// construction modes
pub use pool::block::{InPlace, Mode, Prefill};

// errors
pub use pool::PoolError;
pub use pool::vm::VmError;

// diagnostics
pub use pool::stats::{VmStats, snapshot as vm_stats};

#[cfg(feature = "guard")]
pub use pool::cached::ChunkStats;
#[cfg(feature = "guard")]
pub use pool::object_pool::PoolStats;
