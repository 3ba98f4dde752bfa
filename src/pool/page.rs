use std::fmt;
use std::ptr::NonNull;

/// Errors surfaced by pool and allocator operations.
#[derive(Debug)]
pub enum PoolError {
    /// The page source could not produce a block of the requested size.
    MapFailed(std::io::Error),
    /// A requested size wrapped the address-sized counter once rounded up
    /// for headers and alignment. Carries the original request.
    SizeOverflow(usize),
    /// A pool was requested with neither a parent nor an allocator before
    /// `initialize()` established the global root.
    Uninitialized,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::MapFailed(e) => write!(f, "page mapping failed: {e}"),
            PoolError::SizeOverflow(size) => {
                write!(f, "allocation size {size} overflows when rounded")
            }
            PoolError::Uninitialized => {
                write!(f, "no parent or allocator given and the global root is not initialized")
            }
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::MapFailed(e) => Some(e),
            PoolError::SizeOverflow(_) | PoolError::Uninitialized => None,
        }
    }
}

/// Abstract interface for obtaining and returning coarse page blocks.
///
/// Callers round `size` to a multiple of `BOUNDARY_SIZE` before asking;
/// the returned region is writable and not necessarily zeroed.
pub(crate) trait PageOps {
    /// Obtain a page-aligned writable region of exactly `size` bytes.
    unsafe fn obtain(size: usize) -> Result<NonNull<u8>, PoolError>;

    /// Return a region previously produced by [`obtain`](Self::obtain) with
    /// the same `size`. Best-effort; callers drop the result.
    unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError>;

    /// Granularity of the underlying source.
    fn granularity() -> usize;
}

pub(crate) struct PlatformPages;

#[cfg(all(feature = "mapped-pages", unix, not(any(loom, miri))))]
mod mapped {
    use super::{NonNull, PageOps, PlatformPages, PoolError};
    use std::io;

    impl PageOps for PlatformPages {
        unsafe fn obtain(size: usize) -> Result<NonNull<u8>, PoolError> {
            if size == 0 {
                return Err(PoolError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(PoolError::MapFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(PoolError::MapFailed(io::Error::other("mmap returned null"))),
            }
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError> {
            // Safety: FFI call to munmap. The caller passes the exact length
            // it obtained the block with.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), size) } != 0 {
                return Err(PoolError::MapFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn granularity() -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // SAFETY/PORTABILITY: this crate supports only 64-bit targets; page size fits in
                // usize there.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Heap-backed page source.
//
// Selected when the `mapped-pages` feature is off, on non-unix targets, and
// always under loom/Miri, which run inside a single process where real
// mmap syscalls are unavailable or unwanted. Every "page block" is a plain
// heap allocation aligned to BOUNDARY_SIZE, which satisfies the alignment
// the node layout relies on.
// ---------------------------------------------------------------------------
#[cfg(not(all(feature = "mapped-pages", unix, not(any(loom, miri)))))]
mod heap {
    use super::{NonNull, PageOps, PlatformPages, PoolError};
    use crate::pool::allocator::BOUNDARY_SIZE;
    use std::io;

    impl PageOps for PlatformPages {
        unsafe fn obtain(size: usize) -> Result<NonNull<u8>, PoolError> {
            if size == 0 {
                return Err(PoolError::MapFailed(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "zero-size mapping",
                )));
            }
            let layout = std::alloc::Layout::from_size_align(size, BOUNDARY_SIZE)
                .map_err(|e| PoolError::MapFailed(io::Error::other(e)))?;
            // Safety: layout has non-zero size.
            let ptr = unsafe { std::alloc::alloc(layout) };
            NonNull::new(ptr).ok_or_else(|| {
                PoolError::MapFailed(io::Error::new(
                    io::ErrorKind::OutOfMemory,
                    "alloc returned null",
                ))
            })
        }

        unsafe fn release(ptr: NonNull<u8>, size: usize) -> Result<(), PoolError> {
            let layout = std::alloc::Layout::from_size_align(size, BOUNDARY_SIZE)
                .map_err(|e| PoolError::MapFailed(io::Error::other(e)))?;
            // Safety: ptr was allocated with the same layout via `obtain`.
            unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
            Ok(())
        }

        fn granularity() -> usize {
            BOUNDARY_SIZE
        }
    }
}
