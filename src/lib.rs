#[cfg(not(target_pointer_width = "64"))]
compile_error!("hpool supports only 64-bit targets.");

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod pool;

// handles
pub use pool::allocator::{
    Allocator, BOUNDARY_INDEX, BOUNDARY_SIZE, DEFAULT_ALIGN, MAX_INDEX, MIN_ALLOC,
};
pub use pool::mempool::Pool;

// global bootstrap
pub use pool::global::{initialize, terminate};

// errors/stats
pub use pool::page::PoolError;
pub use pool::stats::{PoolStats, snapshot};
