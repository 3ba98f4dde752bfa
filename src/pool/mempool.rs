use super::allocator::{
    Allocator, BOUNDARY_INDEX, BOUNDARY_SIZE, DEFAULT_ALIGN, MIN_ALLOC, NODE_HEADER_SIZE, Node,
    align_up,
};
use super::page::PoolError;
use super::stats;
use std::ptr::{self, NonNull};

pub(crate) const POOL_HEADER_SIZE: usize = align_up(size_of::<Pool>(), DEFAULT_ALIGN);

/// Insert `node` before `point` in its ring.
unsafe fn list_insert(node: *mut Node, point: *mut Node) {
    // Safety: both nodes are live and `point` is on a well-formed ring.
    unsafe {
        (*node).ref_ = (*point).ref_;
        *(*node).ref_ = node;
        (*node).next = point;
        (*point).ref_ = &raw mut (*node).next;
    }
}

/// Remove `node` from its ring.
unsafe fn list_remove(node: *mut Node) {
    // Safety: `node` is linked; its back-reference inverse holds.
    unsafe {
        debug_assert_eq!(*(*node).ref_, node, "stale back-reference");
        *(*node).ref_ = (*node).next;
        (*(*node).next).ref_ = (*node).ref_;
    }
}

/// A node of the pool tree.
///
/// The header lives inside the body of the pool's own first page block (the
/// self node), so a pool is fully described by the blocks it allocates. The
/// ring of blocks hanging off `active` serves bump allocations; parent/child
/// links form the destruction cascade.
///
/// A pool must be driven from one thread at a time. Different pools sharing
/// one allocator may run concurrently once a mutex is installed on it.
pub struct Pool {
    parent: *mut Pool,
    child: *mut Pool,
    sibling: *mut Pool,
    ref_: *mut *mut Pool,
    allocator: *mut Allocator,
    /// Head of the ring; always the current bump target.
    active: *mut Node,
    /// The node whose body contains this header.
    self_node: *mut Node,
    /// Cursor just past the header, restored on clear.
    self_first_avail: *mut u8,
}

impl Pool {
    /// Create a pool.
    ///
    /// With no `parent` the pool attaches to the global root (see
    /// [`initialize`](crate::initialize)); with no `allocator` it inherits the
    /// parent's. Fails with [`PoolError::Uninitialized`] when neither can be
    /// resolved.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the backing block cannot be obtained.
    ///
    /// # Safety
    /// `parent` and `allocator` must be live handles; the returned pool must
    /// be destroyed before either of them.
    pub unsafe fn create(
        parent: Option<NonNull<Pool>>,
        allocator: Option<NonNull<Allocator>>,
    ) -> Result<NonNull<Pool>, PoolError> {
        let parent = match parent {
            Some(p) => p.as_ptr(),
            None => super::global::root_pool().map_or(ptr::null_mut(), NonNull::as_ptr),
        };
        let allocator = match allocator {
            Some(a) => a,
            None => {
                if parent.is_null() {
                    return Err(PoolError::Uninitialized);
                }
                // Safety: parent is live per the contract above.
                unsafe { NonNull::new_unchecked((*parent).allocator) }
            }
        };
        // Safety: forwarded contract.
        unsafe { Self::create_internal(parent, allocator) }
    }

    /// Create a pool with no parent.
    ///
    /// Without an explicit allocator a fresh one is created and owned: it is
    /// destroyed together with the pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` if the backing block cannot be obtained.
    ///
    /// # Safety
    /// `allocator`, if given, must be a live handle that outlives the pool.
    pub unsafe fn create_unmanaged(
        allocator: Option<NonNull<Allocator>>,
    ) -> Result<NonNull<Pool>, PoolError> {
        let (pool_allocator, owned) = match allocator {
            Some(a) => (a, false),
            None => (Allocator::create(), true),
        };
        // Safety: forwarded contract; the fresh allocator is unshared.
        let pool = match unsafe { Self::create_internal(ptr::null_mut(), pool_allocator) } {
            Ok(p) => p,
            Err(e) => {
                if owned {
                    // Safety: nothing else references the allocator yet.
                    unsafe { Allocator::destroy(pool_allocator) };
                }
                return Err(e);
            }
        };
        if owned {
            // Safety: the allocator is still unshared at this point.
            unsafe { (*pool_allocator.as_ptr()).owner = pool.as_ptr() };
        }
        Ok(pool)
    }

    pub(crate) unsafe fn create_internal(
        parent: *mut Pool,
        allocator: NonNull<Allocator>,
    ) -> Result<NonNull<Pool>, PoolError> {
        // Safety: the fresh node is exclusively ours until it is linked below.
        unsafe {
            let node = Allocator::alloc(allocator, MIN_ALLOC - NODE_HEADER_SIZE)?.as_ptr();
            (*node).next = node;
            (*node).ref_ = &raw mut (*node).next;

            // The pool header claims the start of the node's body.
            let pool = (*node).first_avail.cast::<Pool>();
            let body = (*node).first_avail.add(POOL_HEADER_SIZE);
            (*node).first_avail = body;
            pool.write(Pool {
                parent: ptr::null_mut(),
                child: ptr::null_mut(),
                sibling: ptr::null_mut(),
                ref_: ptr::null_mut(),
                allocator: allocator.as_ptr(),
                active: node,
                self_node: node,
                self_first_avail: body,
            });

            if !parent.is_null() {
                // Child-list updates go through the parent's allocator mutex.
                let _guard = Allocator::lock((*parent).allocator);

                (*pool).sibling = (*parent).child;
                if !(*pool).sibling.is_null() {
                    (*(*pool).sibling).ref_ = &raw mut (*pool).sibling;
                }
                (*parent).child = pool;
                (*pool).ref_ = &raw mut (*parent).child;
                (*pool).parent = parent;
            }

            stats::LIVE_POOLS.add(1);
            Ok(NonNull::new_unchecked(pool))
        }
    }

    /// Bump-allocate `in_size` bytes, aligned to [`DEFAULT_ALIGN`].
    ///
    /// # Errors
    ///
    /// Returns `PoolError` on size overflow or page-source exhaustion.
    ///
    /// # Safety
    /// `this` must be a live pool driven by at most one thread.
    pub unsafe fn alloc(this: NonNull<Pool>, in_size: usize) -> Result<NonNull<u8>, PoolError> {
        let pool = this.as_ptr();
        let size = in_size
            .checked_next_multiple_of(DEFAULT_ALIGN)
            .ok_or(PoolError::SizeOverflow(in_size))?;

        // Safety: ring mutations below stay within this pool's own nodes;
        // the allocator call synchronises itself.
        unsafe {
            let active = (*pool).active;

            // Fast path: the active node has room.
            if size <= Node::free_space(active) {
                let mem = (*active).first_avail;
                (*active).first_avail = mem.add(size);
                return Ok(NonNull::new_unchecked(mem));
            }

            // The node after the head has the most residual space of the
            // rest of the ring; only if it cannot serve do we go to the
            // allocator.
            let mut node = (*active).next;
            if size <= Node::free_space(node) {
                list_remove(node);
            } else {
                node = Allocator::alloc(NonNull::new_unchecked((*pool).allocator), size)?.as_ptr();
            }

            (*node).free_index = 0;

            let mem = (*node).first_avail;
            (*node).first_avail = mem.add(size);

            list_insert(node, active);
            (*pool).active = node;

            // Reposition the old head by its residual capacity so the ring
            // stays ordered by non-increasing free_index behind the new head.
            let free_index = ((align_up(Node::free_space(active) + 1, BOUNDARY_SIZE)
                - BOUNDARY_SIZE)
                >> BOUNDARY_INDEX) as u32;
            (*active).free_index = free_index;

            let mut at = (*active).next;
            if free_index < (*at).free_index {
                loop {
                    at = (*at).next;
                    if free_index >= (*at).free_index {
                        break;
                    }
                }
                list_remove(active);
                list_insert(active, at);
            }

            Ok(NonNull::new_unchecked(mem))
        }
    }

    /// As [`Pool::alloc`], zeroed.
    ///
    /// # Errors
    ///
    /// Returns `PoolError` on size overflow or page-source exhaustion.
    ///
    /// # Safety
    /// As [`Pool::alloc`].
    pub unsafe fn calloc(this: NonNull<Pool>, in_size: usize) -> Result<NonNull<u8>, PoolError> {
        // Safety: forwarded contract; the span was just handed out.
        unsafe {
            let mem = Self::alloc(this, in_size)?;
            ptr::write_bytes(mem.as_ptr(), 0, in_size);
            Ok(mem)
        }
    }

    /// Destroy all subpools, then recycle every block except the self node,
    /// resetting the pool to its freshly-created state.
    ///
    /// # Safety
    /// `this` must be a live pool; pointers previously handed out become
    /// dangling.
    pub unsafe fn clear(this: NonNull<Pool>) {
        let pool = this.as_ptr();
        // Safety: subpools detach themselves as they are destroyed, so the
        // loop always sees a valid head.
        unsafe {
            while !(*pool).child.is_null() {
                Self::destroy(NonNull::new_unchecked((*pool).child));
            }

            let active = (*pool).self_node;
            (*pool).active = active;
            (*active).first_avail = (*pool).self_first_avail;

            if (*active).next == active {
                return;
            }

            // Cut the ring open behind the self node and hand the remainder
            // to the allocator as one null-terminated list.
            *(*active).ref_ = ptr::null_mut();
            Allocator::free_list(
                NonNull::new_unchecked((*pool).allocator),
                (*active).next,
            );
            (*active).next = active;
            (*active).ref_ = &raw mut (*active).next;
        }
    }

    /// Destroy the pool: cascade through subpools, unlink from the parent,
    /// return every block (self node included) to the allocator, and destroy
    /// the allocator too when this pool owns it.
    ///
    /// # Safety
    /// `this` must be a live pool and must not be used afterwards.
    pub unsafe fn destroy(this: NonNull<Pool>) {
        let pool = this.as_ptr();
        // Safety: see the step comments; the pool header is not touched after
        // its node is handed back.
        unsafe {
            while !(*pool).child.is_null() {
                Self::destroy(NonNull::new_unchecked((*pool).child));
            }

            if !(*pool).parent.is_null() {
                let _guard = Allocator::lock((*(*pool).parent).allocator);

                *(*pool).ref_ = (*pool).sibling;
                if !(*pool).sibling.is_null() {
                    (*(*pool).sibling).ref_ = (*pool).ref_;
                }
            }

            // The header lives inside the self node; copy out everything that
            // must survive the free below.
            let allocator = NonNull::new_unchecked((*pool).allocator);
            let active = (*pool).self_node;
            let owned = (*allocator.as_ptr()).owner == pool;

            // Terminate the ring at the self node's predecessor, then give
            // the whole chain (self node first) back.
            *(*active).ref_ = ptr::null_mut();
            Allocator::free_list(allocator, active);
            stats::sub_saturating(&stats::LIVE_POOLS, 1);

            if owned {
                Allocator::destroy(allocator);
            }
        }
    }

    #[cfg(test)]
    pub(crate) unsafe fn allocator_of(this: NonNull<Pool>) -> NonNull<Allocator> {
        // Safety: test-only read of a live pool.
        unsafe { NonNull::new_unchecked((*this.as_ptr()).allocator) }
    }

    #[cfg(test)]
    pub(crate) unsafe fn child_count(this: NonNull<Pool>) -> usize {
        let mut count = 0;
        // Safety: test-only walk of a live pool's child list.
        unsafe {
            let mut child = (*this.as_ptr()).child;
            while !child.is_null() {
                count += 1;
                child = (*child).sibling;
            }
        }
        count
    }

    /// Ring free indices starting at the active node, following `next`.
    #[cfg(test)]
    pub(crate) unsafe fn ring_free_indices(this: NonNull<Pool>) -> Vec<u32> {
        let mut out = Vec::new();
        // Safety: test-only walk of a live pool's ring.
        unsafe {
            let head = (*this.as_ptr()).active;
            let mut node = head;
            loop {
                debug_assert_eq!(*(*node).ref_, node, "ring back-reference broken");
                out.push((*node).free_index);
                node = (*node).next;
                if node == head {
                    break;
                }
            }
        }
        out
    }

    #[cfg(test)]
    pub(crate) unsafe fn ring_len(this: NonNull<Pool>) -> usize {
        // Safety: forwarded to the ring walk above.
        unsafe { Self::ring_free_indices(this).len() }
    }

    #[cfg(test)]
    pub(crate) unsafe fn self_reset_state(this: NonNull<Pool>) -> (bool, bool) {
        // Safety: test-only read of a live pool.
        unsafe {
            let p = this.as_ptr();
            (
                (*p).active == (*p).self_node,
                (*(*p).self_node).first_avail == (*p).self_first_avail,
            )
        }
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_basic_alloc() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let ptr = Pool::alloc(pool, 32).unwrap();
            assert_eq!(ptr.as_ptr() as usize % DEFAULT_ALIGN, 0);

            // The span must be writable.
            ptr.as_ptr().write_bytes(0xAB, 32);
            assert_eq!(*ptr.as_ptr().add(31), 0xAB);

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_alloc_zero_bytes() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let ptr = Pool::alloc(pool, 0).unwrap();
            assert_eq!(ptr.as_ptr() as usize % DEFAULT_ALIGN, 0);
            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_alloc_size_overflow() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let err = Pool::alloc(pool, usize::MAX - 3).unwrap_err();
            assert!(matches!(err, PoolError::SizeOverflow(_)));
            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_many_small_allocs_distinct_and_aligned() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();

            let mut addrs = Vec::with_capacity(10_000);
            for i in 0u32..10_000 {
                let ptr = Pool::alloc(pool, 40).unwrap();
                assert_eq!(ptr.as_ptr() as usize % 8, 0);
                ptr.as_ptr().cast::<u32>().write(i);
                addrs.push(ptr.as_ptr() as usize);
            }

            // Distinct and non-overlapping: sorted gaps are at least the
            // rounded allocation size.
            let mut sorted = addrs.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted.len(), 10_000);
            for w in sorted.windows(2) {
                assert!(w[1] - w[0] >= 40, "allocations overlap");
            }

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_single_oversize_alloc() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let ptr = Pool::alloc(pool, 100_000).unwrap();

            // Both ends of the span must be writable.
            ptr.as_ptr().write(1);
            ptr.as_ptr().add(100_000 - 1).write(2);
            assert_eq!(*ptr.as_ptr(), 1);
            assert_eq!(*ptr.as_ptr().add(100_000 - 1), 2);

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_calloc_zeroes() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();

            // Dirty the arena, recycle it, then calloc over the reused bytes.
            let dirty = Pool::alloc(pool, 4096).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 4096);
            Pool::clear(pool);

            let ptr = Pool::calloc(pool, 4096).unwrap();
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), 4096);
            assert!(slice.iter().all(|&b| b == 0));

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_clear_resets_to_self() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let allocator = Pool::allocator_of(pool);

            // Spill into several fresh nodes.
            for _ in 0..6 {
                drop(Pool::alloc(pool, 8100).unwrap());
            }
            assert!(Pool::ring_len(pool) > 1);

            Pool::clear(pool);
            assert_eq!(Pool::ring_len(pool), 1);
            assert_eq!(Pool::self_reset_state(pool), (true, true));
            assert!(
                Allocator::cached_node_count(allocator) >= 6,
                "cleared nodes must land in the allocator"
            );

            // Idempotent: a second clear with no intervening alloc changes
            // nothing.
            let cached = Allocator::cached_node_count(allocator);
            Pool::clear(pool);
            assert_eq!(Pool::ring_len(pool), 1);
            assert_eq!(Pool::self_reset_state(pool), (true, true));
            assert_eq!(Allocator::cached_node_count(allocator), cached);

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_alloc_after_clear_reuses_cached_nodes() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();
            let allocator = Pool::allocator_of(pool);

            for _ in 0..4 {
                drop(Pool::alloc(pool, 8100).unwrap());
            }
            Pool::clear(pool);
            let cached = Allocator::cached_node_count(allocator);
            assert!(cached >= 4);

            // The next spill must come from the cache, not the page source.
            drop(Pool::alloc(pool, 8100).unwrap());
            assert_eq!(Allocator::cached_node_count(allocator), cached - 1);

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_ring_stays_ordered() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let pool = Pool::create_unmanaged(None).unwrap();

            // A mixed workload that spills across many nodes with varying
            // leftovers.
            let mut size = 100usize;
            for _ in 0..200 {
                drop(Pool::alloc(pool, size).unwrap());
                size = (size * 7 + 123) % 9000;
            }

            // Behind the head, residual capacity never increases; the walk
            // itself checks every back-reference.
            let indices = Pool::ring_free_indices(pool);
            for w in indices[1..].windows(2) {
                assert!(w[0] >= w[1], "ring out of order: {indices:?}");
            }

            Pool::destroy(pool);
        }
    }

    #[test]
    fn test_child_cascade_destroy() {
        let _guard = crate::pool::TEST_MUTEX.write().unwrap();
        // Safety: Test code.
        unsafe {
            let root = Pool::create_unmanaged(None).unwrap();
            let live_before = stats::LIVE_POOLS.get();

            let a = Pool::create(Some(root), None).unwrap();
            let _b = Pool::create(Some(a), None).unwrap();
            let _c = Pool::create(Some(a), None).unwrap();
            assert_eq!(Pool::child_count(root), 1);
            assert_eq!(Pool::child_count(a), 2);
            assert_eq!(stats::LIVE_POOLS.get(), live_before + 3);

            // Destroying the middle of the tree takes its whole subtree and
            // unlinks it from the root.
            Pool::destroy(a);
            assert_eq!(Pool::child_count(root), 0);
            assert_eq!(stats::LIVE_POOLS.get(), live_before);

            Pool::destroy(root);
        }
    }

    #[test]
    fn test_destroy_unlinks_middle_sibling() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let root = Pool::create_unmanaged(None).unwrap();

            let c1 = Pool::create(Some(root), None).unwrap();
            let c2 = Pool::create(Some(root), None).unwrap();
            let c3 = Pool::create(Some(root), None).unwrap();
            assert_eq!(Pool::child_count(root), 3);

            // The child list is LIFO, so c2 sits in the middle.
            Pool::destroy(c2);
            assert_eq!(Pool::child_count(root), 2);

            Pool::destroy(c3);
            Pool::destroy(c1);
            assert_eq!(Pool::child_count(root), 0);

            Pool::destroy(root);
        }
    }

    #[test]
    fn test_child_inherits_allocator() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let root = Pool::create_unmanaged(None).unwrap();
            let child = Pool::create(Some(root), None).unwrap();
            assert_eq!(
                Pool::allocator_of(root).as_ptr(),
                Pool::allocator_of(child).as_ptr()
            );
            Pool::destroy(root);
        }
    }

    #[test]
    fn test_clear_destroys_children() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let root = Pool::create_unmanaged(None).unwrap();
            drop(Pool::create(Some(root), None).unwrap());
            drop(Pool::create(Some(root), None).unwrap());
            assert_eq!(Pool::child_count(root), 2);

            Pool::clear(root);
            assert_eq!(Pool::child_count(root), 0);

            Pool::destroy(root);
        }
    }

    #[test]
    fn test_unmanaged_with_external_allocator() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            let allocator = Allocator::create();
            let pool = Pool::create_unmanaged(Some(allocator)).unwrap();
            drop(Pool::alloc(pool, 64).unwrap());
            Pool::destroy(pool);

            // The pool did not own the allocator, so it is still usable; the
            // pool's nodes are parked in its freelists.
            assert!(Allocator::cached_node_count(allocator) >= 1);
            Allocator::destroy(allocator);
        }
    }

    #[test]
    fn test_owned_allocator_destroyed_with_pool() {
        let _guard = crate::pool::TEST_MUTEX.read().unwrap();
        // Safety: Test code.
        unsafe {
            // No external allocator: the pool creates and owns one, and
            // destroy must tear both down without touching freed memory.
            let pool = Pool::create_unmanaged(None).unwrap();
            drop(Pool::alloc(pool, 1024).unwrap());
            drop(Pool::create(Some(pool), None).unwrap());
            Pool::destroy(pool);
        }
    }
}
