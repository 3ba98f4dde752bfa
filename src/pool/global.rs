use super::allocator::{Allocator, BOUNDARY_SIZE};
use super::mempool::Pool;
use super::page::PoolError;
use crate::sync::Mutex;
use std::ptr::NonNull;

/// Process-wide root pool and its allocator.
struct Bootstrap {
    pool: NonNull<Pool>,
    allocator: NonNull<Allocator>,
}

// Safety: access is serialised by the BOOTSTRAP mutex, and the allocator
// carries its own mutex when the `threaded` feature is enabled.
unsafe impl Send for Bootstrap {}

crate::sync::static_mutex! {
    static BOOTSTRAP: Mutex<Option<Bootstrap>> = Mutex::new(None);
}

/// Retention cap installed on the global allocator, in boundary units.
const GLOBAL_MAX_FREE_UNITS: usize = 100;

/// Create the global allocator and root pool.
///
/// Idempotent once successful. The root pool becomes the implicit parent for
/// [`Pool::create`] calls that pass no parent, and owns the global allocator.
/// With the `threaded` feature a mutex is installed on that allocator so
/// pools on different threads can share it.
///
/// # Errors
///
/// Returns `PoolError` if the root pool's backing block cannot be obtained;
/// the library is left uninitialized.
///
/// # Panics
///
/// Panics if the bootstrap lock is poisoned.
pub fn initialize() -> Result<(), PoolError> {
    let mut slot = BOOTSTRAP.lock().unwrap();
    if slot.is_some() {
        return Ok(());
    }

    let allocator = Allocator::create();
    // Safety: the allocator is fresh and unshared; a failed pool creation
    // leaves nothing referencing it.
    let pool = match unsafe { Pool::create_internal(std::ptr::null_mut(), allocator) } {
        Ok(p) => p,
        Err(e) => {
            // Safety: see above.
            unsafe { Allocator::destroy(allocator) };
            return Err(e);
        }
    };

    // Safety: still single-threaded bootstrap; nothing else can see the
    // allocator until the slot below is filled.
    unsafe {
        Allocator::max_free_set(allocator, GLOBAL_MAX_FREE_UNITS * BOUNDARY_SIZE);
        #[cfg(feature = "threaded")]
        Allocator::install_mutex(allocator);
        (*allocator.as_ptr()).owner = pool.as_ptr();
    }

    *slot = Some(Bootstrap { pool, allocator });
    Ok(())
}

/// Tear down the global root pool and, through ownership, its allocator.
///
/// A no-op when [`initialize`] has not succeeded. Every pool parented to the
/// root must be gone by now; they are destroyed with it otherwise.
///
/// # Panics
///
/// Panics if the bootstrap lock is poisoned.
pub fn terminate() {
    let taken = BOOTSTRAP.lock().unwrap().take();
    if let Some(boot) = taken {
        // Destroying the root destroys the owned allocator with it.
        // Safety: the handle came out of the slot, so nothing else holds it.
        unsafe { Pool::destroy(boot.pool) };
    }
}

/// The global root pool, if bootstrapped.
pub(crate) fn root_pool() -> Option<NonNull<Pool>> {
    BOOTSTRAP.lock().unwrap().as_ref().map(|b| b.pool)
}
