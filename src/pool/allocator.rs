use super::mempool::Pool;
use super::page::{PageOps, PlatformPages, PoolError};
use super::stats;
use crate::sync::atomic::Ordering;
use crate::sync::{Mutex, MutexGuard};
#[cfg(debug_assertions)]
use fixedbitset::FixedBitSet;
use std::ptr::{self, NonNull};

/// log2 of the boundary size; all block sizing happens in multiples of
/// `1 << BOUNDARY_INDEX`.
pub const BOUNDARY_INDEX: u32 = 12;
/// Page granularity used for sizing and size-class indexing.
pub const BOUNDARY_SIZE: usize = 1 << BOUNDARY_INDEX;
/// Smallest block ever handed out by the allocator.
pub const MIN_ALLOC: usize = 2 * BOUNDARY_SIZE;
/// Number of freelist slots. Slot 0 is the oversize sink; slot `k >= 1`
/// caches blocks of `(k + 1) * BOUNDARY_SIZE` bytes.
pub const MAX_INDEX: usize = 20;
/// Alignment of every pointer handed out by a pool.
pub const DEFAULT_ALIGN: usize = 8;

/// Round `size` up to a multiple of `boundary` (a power of two). Wraps on
/// overflow; callers on request paths use checked arithmetic instead.
pub(crate) const fn align_up(size: usize, boundary: usize) -> usize {
    size.wrapping_add(boundary - 1) & !(boundary - 1)
}

pub(crate) const NODE_HEADER_SIZE: usize = align_up(size_of::<Node>(), DEFAULT_ALIGN);

/// Header written at the start of every page block.
///
/// The usable body spans `[block + NODE_HEADER_SIZE, endp)`. `ref_` points at
/// whichever slot currently holds the `next` link to this node, so unlinking
/// is O(1) without a prev pointer.
#[repr(C)]
pub(crate) struct Node {
    pub(crate) next: *mut Node,
    pub(crate) ref_: *mut *mut Node,
    /// Size class: boundary units in this block, minus one.
    pub(crate) index: u32,
    /// Residual tail capacity in boundary units; orders a pool's ring.
    pub(crate) free_index: u32,
    /// Bump cursor.
    pub(crate) first_avail: *mut u8,
    /// End of the usable region.
    pub(crate) endp: *mut u8,
}

impl Node {
    /// Start of the usable body.
    pub(crate) unsafe fn body(node: *mut Node) -> *mut u8 {
        // Safety: the caller guarantees `node` heads a live block of at least
        // NODE_HEADER_SIZE bytes.
        unsafe { node.cast::<u8>().add(NODE_HEADER_SIZE) }
    }

    /// Bytes left between the bump cursor and the end of the block.
    pub(crate) unsafe fn free_space(node: *mut Node) -> usize {
        // Safety: first_avail never moves past endp.
        unsafe { (*node).endp as usize - (*node).first_avail as usize }
    }

    /// Total block size for a size class.
    pub(crate) fn size(index: u32) -> usize {
        (index as usize + 1) << BOUNDARY_INDEX
    }
}

/// A cache of reusable page blocks organized as size-class freelists, plus an
/// oversize sink in slot 0.
///
/// Whether a freed block is cached or returned to the page source is decided
/// by the retention cap (`max_free_set`). The allocator itself is
/// unsynchronized unless a mutex is installed; see [`Allocator::install_mutex`].
pub struct Allocator {
    /// One past the highest non-empty non-sink slot; 0 when all are empty.
    pub(crate) max_index: usize,
    /// Retention cap in boundary units; 0 means never give blocks back.
    pub(crate) max_free_index: usize,
    /// Remaining credit below the cap. Range: 0..=max_free_index when capped.
    pub(crate) current_free_index: usize,
    /// The pool whose destruction destroys this allocator, if any.
    pub(crate) owner: *mut Pool,
    pub(crate) mutex: Option<Mutex<()>>,
    pub(crate) free: [*mut Node; MAX_INDEX],
    /// Mirror of slot occupancy, cross-checked against the lists after every
    /// locked mutation.
    #[cfg(debug_assertions)]
    occupancy: FixedBitSet,
}

impl Allocator {
    /// Produce a fresh allocator: every freelist slot empty, no retention
    /// cap, no mutex, no owner.
    ///
    /// Destroy with [`Allocator::destroy`]; dropping the handle leaks the
    /// header and any cached blocks.
    #[must_use]
    pub fn create() -> NonNull<Allocator> {
        let boxed = Box::new(Allocator {
            max_index: 0,
            max_free_index: 0,
            current_free_index: 0,
            owner: ptr::null_mut(),
            mutex: None,
            free: [ptr::null_mut(); MAX_INDEX],
            #[cfg(debug_assertions)]
            occupancy: FixedBitSet::with_capacity(MAX_INDEX),
        });
        NonNull::from(Box::leak(boxed))
    }

    /// Release every cached block to the page source, then the allocator's
    /// own header.
    ///
    /// # Safety
    /// - `this` must come from [`Allocator::create`] and must not be used
    ///   afterwards.
    /// - No live pool may still reference the allocator.
    pub unsafe fn destroy(this: NonNull<Allocator>) {
        let a = this.as_ptr();
        // Safety: we have exclusive ownership of the allocator and its lists.
        unsafe {
            for slot in 0..MAX_INDEX {
                let mut node = (*a).free[slot];
                while !node.is_null() {
                    let next = (*node).next;
                    let size = Node::size((*node).index);
                    stats::sub_saturating(&stats::FREELIST_CACHED, size);
                    stats::sub_saturating(&stats::TOTAL_MAPPED, size);
                    drop(PlatformPages::release(
                        NonNull::new_unchecked(node.cast::<u8>()),
                        size,
                    ));
                    node = next;
                }
            }
            drop(Box::from_raw(a));
        }
    }

    /// Install a mutex that serialises freelist and child-list mutations, so
    /// pools sharing this allocator may live on different threads.
    ///
    /// # Safety
    /// Must happen before the allocator is shared between threads.
    pub unsafe fn install_mutex(this: NonNull<Allocator>) {
        // Safety: exclusive access per the contract above.
        unsafe { (*this.as_ptr()).mutex = Some(Mutex::new(())) };
    }

    /// Set the retention cap. `in_size` is converted to boundary units; the
    /// outstanding credit is carried over and clamped to the new cap.
    ///
    /// # Safety
    /// `this` must be a live allocator handle.
    pub unsafe fn max_free_set(this: NonNull<Allocator>, in_size: usize) {
        let a = this.as_ptr();
        // Safety: mutations below happen under the allocator's lock.
        unsafe {
            let _guard = Self::lock(a);

            let max_free_index = align_up(in_size, BOUNDARY_SIZE) >> BOUNDARY_INDEX;
            let current = (*a)
                .current_free_index
                .wrapping_add(max_free_index)
                .wrapping_sub((*a).max_free_index);
            (*a).max_free_index = max_free_index;
            (*a).current_free_index = current.min(max_free_index);
        }
    }

    /// Acquire the allocator's mutex, if one is installed.
    pub(crate) unsafe fn lock<'a>(a: *mut Allocator) -> Option<MutexGuard<'a, ()>> {
        // Safety: the caller guarantees `a` is live; the guard borrows the
        // mutex for as long as the caller holds it.
        unsafe { (*a).mutex.as_ref() }.map(|m| m.lock().unwrap())
    }

    /// Hand out a block whose usable span holds at least `in_size` bytes.
    ///
    /// Prefers a cached block of the right size class, falling back to the
    /// oversize sink and finally the page source.
    ///
    /// # Safety
    /// `this` must be a live allocator handle; unsynchronized calls require a
    /// mutex (or a single thread).
    pub(crate) unsafe fn alloc(
        this: NonNull<Allocator>,
        in_size: usize,
    ) -> Result<NonNull<Node>, PoolError> {
        let a = this.as_ptr();

        // Round up to the next boundary with room for the node header, but
        // always hand out at least MIN_ALLOC.
        let size = in_size
            .checked_add(NODE_HEADER_SIZE)
            .and_then(|s| s.checked_next_multiple_of(BOUNDARY_SIZE))
            .ok_or(PoolError::SizeOverflow(in_size))?;
        let size = size.max(MIN_ALLOC);

        let index = (size >> BOUNDARY_INDEX) - 1;
        if index > u32::MAX as usize {
            // The node header stores the class in 32 bits.
            return Err(PoolError::SizeOverflow(in_size));
        }

        let mut reused: *mut Node = ptr::null_mut();
        {
            // Safety: freelist reads and mutations happen under the lock; the
            // page source is only consulted after it is dropped.
            let _guard = unsafe { Self::lock(a) };
            unsafe {
                if index < (*a).max_index {
                    // First fit upward from the preferred slot. The max_index
                    // invariant guarantees the scan stops at an occupied slot.
                    let max_index = (*a).max_index;
                    let mut i = index;
                    while i < max_index && (*a).free[i].is_null() {
                        i += 1;
                    }
                    if i < max_index {
                        let node = (*a).free[i];
                        (*a).free[i] = (*node).next;
                        if (*a).free[i].is_null() {
                            #[cfg(debug_assertions)]
                            (*a).occupancy.set(i, false);
                            if i + 1 == max_index {
                                // Emptied the topmost slot; rescan downward.
                                let mut top = i;
                                while top > 1 && (*a).free[top - 1].is_null() {
                                    top -= 1;
                                }
                                (*a).max_index = if top > 1 { top } else { 0 };
                            }
                        }
                        Self::credit(a, node);
                        reused = node;
                    }
                } else if !(*a).free[0].is_null() {
                    // The sink is ordered by ascending index; the first node
                    // that is large enough is the best fit.
                    let mut slot: *mut *mut Node = &raw mut (*a).free[0];
                    while !(*slot).is_null() && ((**slot).index as usize) < index {
                        slot = &raw mut (**slot).next;
                    }
                    let node = *slot;
                    if !node.is_null() {
                        *slot = (*node).next;
                        #[cfg(debug_assertions)]
                        if (*a).free[0].is_null() {
                            (*a).occupancy.set(0, false);
                        }
                        Self::credit(a, node);
                        reused = node;
                    }
                }
                #[cfg(debug_assertions)]
                Self::debug_check(a);
            }
        }

        if !reused.is_null() {
            // Safety: the node was unlinked above and is exclusively ours.
            unsafe {
                (*reused).next = ptr::null_mut();
                (*reused).free_index = 0;
                (*reused).first_avail = Node::body(reused);
                return Ok(NonNull::new_unchecked(reused));
            }
        }

        // Nothing suitable cached; map a fresh block.
        // Safety: size is a non-zero boundary multiple.
        let raw = unsafe { PlatformPages::obtain(size)? };
        stats::TOTAL_MAPPED.fetch_add(size, Ordering::Relaxed);
        let node = raw.as_ptr().cast::<Node>();
        // Safety: the mapping is at least NODE_HEADER_SIZE bytes and
        // boundary-aligned, so the header write is in bounds and aligned.
        unsafe {
            node.write(Node {
                next: ptr::null_mut(),
                ref_: ptr::null_mut(),
                index: index as u32,
                free_index: 0,
                first_avail: raw.as_ptr().add(NODE_HEADER_SIZE),
                endp: raw.as_ptr().add(size),
            });
            Ok(NonNull::new_unchecked(node))
        }
    }

    /// Take back a null-terminated `next`-linked list of blocks.
    ///
    /// Blocks are cached in their size-class slot (or the sink) while credit
    /// under the retention cap remains; the rest go back to the page source,
    /// outside the lock.
    ///
    /// # Safety
    /// Every node on `list` must have come from this allocator and must not
    /// be reachable from any pool afterwards.
    pub(crate) unsafe fn free_list(this: NonNull<Allocator>, list: *mut Node) {
        let a = this.as_ptr();
        let mut evict: *mut Node = ptr::null_mut();
        {
            // Safety: freelist mutations under the lock.
            let _guard = unsafe { Self::lock(a) };
            unsafe {
                let mut max_index = (*a).max_index;
                let max_free_index = (*a).max_free_index;
                let mut current_free_index = (*a).current_free_index;

                let mut node = list;
                while !node.is_null() {
                    let next = (*node).next;
                    let index = (*node).index as usize;

                    if max_free_index != 0 && index + 1 > current_free_index {
                        // Over the retention cap; release below, outside the
                        // lock.
                        (*node).next = evict;
                        evict = node;
                    } else if index < MAX_INDEX {
                        (*node).next = (*a).free[index];
                        (*a).free[index] = node;
                        #[cfg(debug_assertions)]
                        (*a).occupancy.insert(index);
                        if index + 1 > max_index {
                            max_index = index + 1;
                        }
                        current_free_index = current_free_index.saturating_sub(index + 1);
                        stats::FREELIST_CACHED.fetch_add(Node::size((*node).index), Ordering::Relaxed);
                    } else {
                        // Oversize: insert into the sink keeping ascending
                        // index order.
                        let mut slot: *mut *mut Node = &raw mut (*a).free[0];
                        while !(*slot).is_null() && (**slot).index < (*node).index {
                            slot = &raw mut (**slot).next;
                        }
                        (*node).next = *slot;
                        *slot = node;
                        #[cfg(debug_assertions)]
                        (*a).occupancy.insert(0);
                        current_free_index = current_free_index.saturating_sub(index + 1);
                        stats::FREELIST_CACHED.fetch_add(Node::size((*node).index), Ordering::Relaxed);
                    }

                    node = next;
                }

                (*a).max_index = max_index;
                (*a).current_free_index = current_free_index;
                #[cfg(debug_assertions)]
                Self::debug_check(a);
            }
        }

        // Safety: evicted nodes were unlinked above and belong to nobody.
        unsafe {
            while !evict.is_null() {
                let next = (*evict).next;
                let size = Node::size((*evict).index);
                stats::sub_saturating(&stats::TOTAL_MAPPED, size);
                drop(PlatformPages::release(
                    NonNull::new_unchecked(evict.cast::<u8>()),
                    size,
                ));
                evict = next;
            }
        }
    }

    /// Credit a reused node's boundary units back against the retention cap.
    unsafe fn credit(a: *mut Allocator, node: *mut Node) {
        // Safety: called with the allocator lock held.
        unsafe {
            (*a).current_free_index += (*node).index as usize + 1;
            if (*a).current_free_index > (*a).max_free_index {
                (*a).current_free_index = (*a).max_free_index;
            }
            stats::sub_saturating(&stats::FREELIST_CACHED, Node::size((*node).index));
        }
    }

    #[cfg(debug_assertions)]
    unsafe fn debug_check(a: *mut Allocator) {
        // Safety: called with the allocator lock held.
        unsafe {
            for k in 0..MAX_INDEX {
                debug_assert_eq!(
                    (*a).occupancy.contains(k),
                    !(*a).free[k].is_null(),
                    "occupancy mask out of sync at slot {k}"
                );
            }
            let top = (1..MAX_INDEX).rev().find(|&k| !(*a).free[k].is_null());
            debug_assert_eq!((*a).max_index, top.map_or(0, |k| k + 1));
            for k in 1..MAX_INDEX {
                let mut node = (*a).free[k];
                while !node.is_null() {
                    debug_assert_eq!((*node).index as usize, k, "wrong class in slot {k}");
                    node = (*node).next;
                }
            }
            let mut node = (*a).free[0];
            let mut last = 0u32;
            while !node.is_null() {
                debug_assert!((*node).index >= last, "sink out of ascending order");
                last = (*node).index;
                node = (*node).next;
            }
        }
    }

    /// Sum of `(index + 1)` over every cached node.
    #[cfg(test)]
    pub(crate) unsafe fn cached_units(this: NonNull<Allocator>) -> usize {
        let a = this.as_ptr();
        let mut units = 0;
        // Safety: test-only walk; callers serialise access.
        unsafe {
            for slot in 0..MAX_INDEX {
                let mut node = (*a).free[slot];
                while !node.is_null() {
                    units += (*node).index as usize + 1;
                    node = (*node).next;
                }
            }
        }
        units
    }

    #[cfg(test)]
    pub(crate) unsafe fn cached_node_count(this: NonNull<Allocator>) -> usize {
        let a = this.as_ptr();
        let mut count = 0;
        // Safety: test-only walk; callers serialise access.
        unsafe {
            for slot in 0..MAX_INDEX {
                let mut node = (*a).free[slot];
                while !node.is_null() {
                    count += 1;
                    node = (*node).next;
                }
            }
        }
        count
    }

    #[cfg(test)]
    pub(crate) unsafe fn sink_indices(this: NonNull<Allocator>) -> Vec<u32> {
        let mut out = Vec::new();
        // Safety: test-only walk; callers serialise access.
        unsafe {
            let mut node = (*this.as_ptr()).free[0];
            while !node.is_null() {
                out.push((*node).index);
                node = (*node).next;
            }
        }
        out
    }
}
