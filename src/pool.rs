//! The reference-counted physical page pool.

use crate::{
    error::{OutOfMemory, Result},
    sync::KSpinLock,
};

/// The size of a single page in memory.
pub const PAGE_SIZE: usize = 4096;

/// Byte pattern written over a page while it sits in the pool.
///
/// Any owner still reading a page after releasing its last reference sees
/// this junk instead of its old contents, which turns a dangling reference
/// into a loud failure instead of a silent stale read.
pub const FREE_FILL: u8 = 1;

/// Byte pattern written over a page as it is handed out by [`KPagePool::allocate`].
///
/// Distinct from [`FREE_FILL`] so that a caller consuming uninitialized
/// memory cannot mistake leftover pool contents for data it wrote itself.
pub const ALLOC_FILL: u8 = 5;

/// A page-aligned `[start, end)` range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageSpan {
    start: usize,
    end: usize,
}
impl PageSpan {
    /// Construct a span from its bounds.
    ///
    /// # Panics
    /// Panics if either bound is not page-aligned or if the bounds are out of
    /// order.
    pub fn new(start: usize, end: usize) -> Self {
        assert!(
            start % PAGE_SIZE == 0,
            "span start {start:#x} is not page-aligned"
        );
        assert!(end % PAGE_SIZE == 0, "span end {end:#x} is not page-aligned");
        assert!(start <= end, "span bounds {start:#x}..{end:#x} are reversed");
        Self { start, end }
    }

    /// The first address in the span.
    pub fn start(self) -> usize {
        self.start
    }

    /// One past the last address in the span.
    pub fn end(self) -> usize {
        self.end
    }

    /// The number of whole pages in the span.
    pub fn page_count(self) -> usize {
        (self.end - self.start) / PAGE_SIZE
    }

    /// Get whether the given physical address falls inside the span.
    pub fn contains(self, pa: usize) -> bool {
        (self.start..self.end).contains(&pa)
    }
}

/// A page handed out by [`KPagePool::allocate`].
///
/// The address is always page-aligned and inside the pool's managed span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageAddr(usize);
impl PageAddr {
    /// The page's physical address.
    pub fn addr(self) -> usize {
        self.0
    }

    /// The page as a raw pointer to its first byte.
    pub fn as_ptr(self) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.0)
    }
}

/// What a call to [`KPagePool::release`] did to the page.
///
/// The interesting transitions are reaching zero owners and reaching exactly
/// one owner; they cannot happen on the same call, so this is an enum rather
/// than a pair of flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "a NowExclusive outcome obligates the caller to restore write permission"]
pub enum ReleaseOutcome {
    /// The last owner is gone; the page was scrubbed and returned to the
    /// pool.
    Freed,
    /// Exactly one owner remains. The pool cannot find that owner's mapping
    /// (a physical page may be mapped at different virtual addresses in
    /// different address spaces), so the caller, which is tearing down the
    /// other mapping and knows which one survives, must clear the
    /// copy-on-write marker there, grant write permission, and invalidate
    /// the translation cache.
    NowExclusive,
    /// Two or more owners remain; the page stays copy-on-write.
    StillShared,
}
impl ReleaseOutcome {
    /// Get whether the page returned to the pool.
    pub fn became_free(self) -> bool {
        matches!(self, Self::Freed)
    }

    /// Get whether the page just dropped to a single owner.
    pub fn became_exclusive(self) -> bool {
        matches!(self, Self::NowExclusive)
    }
}

/// Lock-guarded allocator state.
///
/// The free stack and the reference counts are two views of one fact
/// (`refcount[i] == 0` exactly when `i` is on the stack once), so they live
/// behind a single lock and are only ever mutated together.
struct PoolState<const N: usize> {
    /// Number of owners of each page; 0 means the page is in the pool.
    refcount: [u32; N],
    /// Indices of free pages, last-freed on top.
    ///
    /// The original design threaded a linked list through the free pages'
    /// own bytes; an index stack in a separate array keeps the O(1)
    /// push/pop without storing pointers inside unallocated memory.
    free: [u32; N],
    /// Number of live entries in `free`.
    free_len: usize,
}

/// A pool of `N` physical pages with per-page reference counts.
///
/// One pool is constructed at boot over the kernel's free RAM and shared by
/// reference with every caller. All operations are synchronous, bounded, and
/// serialized by one internal spin lock; none of them ever blocks waiting
/// for memory.
pub struct KPagePool<const N: usize> {
    /// First address of the managed range.
    base: usize,
    /// All mutable state, behind the single exclusive lock.
    state: KSpinLock<PoolState<N>>,
}

impl<const N: usize> KPagePool<N> {
    /// Construct the pool over `span`, seeding every page as free.
    ///
    /// Each page is scrubbed with [`FREE_FILL`] and pushed onto the free
    /// stack in one pass under a single lock acquisition. Allocation is only
    /// possible once this returns, so no caller can observe a half-seeded
    /// pool.
    ///
    /// # Panics
    /// Panics if `span` does not cover exactly `N` pages.
    ///
    /// # Safety
    /// The caller grants the pool exclusive access to the memory in `span`
    /// for the pool's entire lifetime; nothing else may read or write it
    /// except through pages the pool has handed out.
    pub unsafe fn new(span: PageSpan) -> Self {
        assert!(
            span.page_count() == N,
            "span covers {} pages, pool manages {N}",
            span.page_count()
        );
        let pool = Self {
            base: span.start(),
            state: KSpinLock::new(PoolState {
                refcount: [0; N],
                free: [0; N],
                free_len: 0,
            }),
        };
        let mut state = pool.state.lock();
        for index in 0..N {
            // SAFETY:
            // The caller granted us exclusive access to the span, and this
            // page hasn't been handed out yet.
            unsafe { scrub(pool.page_ptr(index), FREE_FILL) };
            state.free[index] = index as u32;
        }
        state.free_len = N;
        drop(state);
        log::debug!("page pool managing {N} pages at {:#x}", pool.base);
        pool
    }

    /// The managed range.
    pub fn span(&self) -> PageSpan {
        PageSpan {
            start: self.base,
            end: self.base + N * PAGE_SIZE,
        }
    }

    /// Allocate one page, scrubbed with [`ALLOC_FILL`] and owned solely by
    /// the caller (count 1).
    ///
    /// An empty pool returns [`OutOfMemory`] immediately; this never waits
    /// for another owner to release a page.
    ///
    /// # Panics
    /// Panics if the popped page's count is not zero. A non-zero count on a
    /// free-stack entry means the allocator's own state is corrupt, and
    /// nothing built on top of it can be trusted to continue.
    #[expect(
        clippy::panic_in_result_fn,
        reason = "A corrupt free stack is fatal, not an error the caller can handle"
    )]
    pub fn allocate(&self) -> Result<PageAddr> {
        let index;
        {
            let mut state = self.state.lock();
            let Some(top) = state.free_len.checked_sub(1) else {
                return Err(OutOfMemory);
            };
            state.free_len = top;
            index = state.free[top] as usize;
            let count = state.refcount[index];
            assert!(
                count == 0,
                "allocate: page {:#x} came off the free stack with {count} live references",
                self.base + index * PAGE_SIZE
            );
            state.refcount[index] = 1;
        }
        // The scrub happens outside the lock: the count is already 1, so no
        // other context can free or hand out this page underneath us.
        let page = self.page_ptr(index);
        // SAFETY:
        // We are the page's only owner until we return it.
        unsafe { scrub(page, ALLOC_FILL) };
        log::trace!("allocated page {:#x}", page.addr());
        Ok(PageAddr(page.addr()))
    }

    /// Allocate one page and zero it.
    pub fn allocate_zeroed(&self) -> Result<PageAddr> {
        let page = self.allocate()?;
        // SAFETY:
        // We are the page's only owner until we return it.
        unsafe { page.as_ptr().write_bytes(0, PAGE_SIZE) };
        Ok(page)
    }

    /// Add an owner to an allocated page.
    ///
    /// Called when a mapping to the page is duplicated rather than copied,
    /// e.g. when fork shares a parent's page copy-on-write with the child.
    ///
    /// # Panics
    /// Panics if `pa` is outside the managed range, or if the page is
    /// currently free: gaining an owner without an allocation means some
    /// caller is holding a stale address.
    pub fn retain(&self, pa: usize) {
        let index = self
            .index_of(pa)
            .unwrap_or_else(|| panic!("retain: {pa:#x} is outside the managed range"));
        let mut state = self.state.lock();
        let count = state.refcount[index];
        assert!(count != 0, "retain: page {pa:#x} has no owners");
        state.refcount[index] = count + 1;
    }

    /// Remove an owner from an allocated page.
    ///
    /// Called whenever a mapping to the page goes away: process exit,
    /// fork-failure cleanup, or a write fault replacing a shared mapping
    /// with a private copy. When the last owner goes, the page is scrubbed
    /// with [`FREE_FILL`] and returned to the pool; when exactly one owner
    /// is left, the caller is told so it can make that mapping writable
    /// again (see [`ReleaseOutcome::NowExclusive`]).
    ///
    /// # Panics
    /// Panics if `pa` is outside the managed range, or if the page is
    /// already free (a double release).
    pub fn release(&self, pa: usize) -> ReleaseOutcome {
        let index = self
            .index_of(pa)
            .unwrap_or_else(|| panic!("release: {pa:#x} is outside the managed range"));
        let mut state = self.state.lock();
        let count = state.refcount[index];
        assert!(count != 0, "release: page {pa:#x} is already free");
        let count = count - 1;
        state.refcount[index] = count;
        match count {
            0 => {
                // Scrub while still holding the lock: the moment the push is
                // visible, a concurrent allocate may pop this page, and it
                // must never observe a half-scrubbed one.
                // SAFETY:
                // The count is 0 and the page is not yet on the free stack,
                // so no other context can reach it.
                unsafe { scrub(self.page_ptr(index), FREE_FILL) };
                let top = state.free_len;
                state.free[top] = index as u32;
                state.free_len = top + 1;
                log::trace!("freed page {pa:#x}");
                ReleaseOutcome::Freed
            }
            1 => ReleaseOutcome::NowExclusive,
            _ => ReleaseOutcome::StillShared,
        }
    }

    /// The number of pages currently in the pool.
    pub fn free_count(&self) -> usize {
        self.state.lock().free_len
    }

    /// The current owner count of the page containing `pa`.
    ///
    /// # Panics
    /// Panics if `pa` is outside the managed range.
    pub fn ref_count(&self, pa: usize) -> u32 {
        let index = self
            .index_of(pa)
            .unwrap_or_else(|| panic!("ref_count: {pa:#x} is outside the managed range"));
        self.state.lock().refcount[index]
    }

    /// Resolve a physical address to the index of its containing page, or
    /// `None` if it lies outside the managed range.
    fn index_of(&self, pa: usize) -> Option<usize> {
        let index = pa.checked_sub(self.base)? / PAGE_SIZE;
        (index < N).then_some(index)
    }

    /// The first byte of the page at `index`.
    fn page_ptr(&self, index: usize) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.base + index * PAGE_SIZE)
    }
}

/// Fill one whole page with `fill`.
///
/// # Safety
/// The caller must have exclusive access to the `PAGE_SIZE` bytes at `page`.
unsafe fn scrub(page: *mut u8, fill: u8) {
    // SAFETY:
    // Exclusive access per this function's contract.
    unsafe { page.write_bytes(fill, PAGE_SIZE) };
}
