//! Test coverage of sharing, release signaling, and fatal contract
//! violations.

use kpalloc::{KPagePool, PAGE_SIZE, PageSpan, ReleaseOutcome};

/// A page-aligned, page-sized chunk of backing memory.
#[repr(align(4096))]
#[derive(Clone, Copy)]
struct RawPage([u8; PAGE_SIZE]);

/// Run `test` against a pool seeded over `N` pages of fresh backing memory.
fn with_pool<const N: usize>(test: impl FnOnce(&KPagePool<N>)) {
    let mut backing = vec![RawPage([0xAA; PAGE_SIZE]); N].into_boxed_slice();
    let start = backing.as_mut_ptr().cast::<u8>().expose_provenance();
    let span = PageSpan::new(start, start + N * PAGE_SIZE);
    // SAFETY:
    // `backing` lives until this function returns and is only touched
    // through the pool from here on.
    let pool = unsafe { KPagePool::<N>::new(span) };
    test(&pool);
}

#[test]
fn test_sole_owner_release_frees() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        let outcome = pool.release(page.addr());
        assert_eq!(outcome, ReleaseOutcome::Freed);
        assert!(outcome.became_free());
        assert!(!outcome.became_exclusive());
        assert_eq!(pool.free_count(), 2);
    });
}

#[test]
fn test_share_then_tear_down() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        // A second owner appears, as at fork time.
        pool.retain(page.addr());
        assert_eq!(pool.ref_count(page.addr()), 2);

        // The first tear-down leaves one owner, which must be told to
        // restore write permission on the surviving mapping.
        let outcome = pool.release(page.addr());
        assert_eq!(outcome, ReleaseOutcome::NowExclusive);
        assert!(outcome.became_exclusive());
        assert!(!outcome.became_free());
        assert_eq!(pool.ref_count(page.addr()), 1);

        // The second tear-down frees the page.
        assert_eq!(pool.release(page.addr()), ReleaseOutcome::Freed);
        assert_eq!(pool.ref_count(page.addr()), 0);

        // And the page is allocatable again, with its count reset.
        let reused = pool.allocate().expect("freed page should be reusable");
        assert_eq!(pool.ref_count(reused.addr()), 1);
    });
}

#[test]
fn test_three_owners_still_shared() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        pool.retain(page.addr());
        pool.retain(page.addr());
        assert_eq!(
            pool.release(page.addr()),
            ReleaseOutcome::StillShared,
            "dropping from 3 to 2 owners signals nothing"
        );
        assert_eq!(pool.release(page.addr()), ReleaseOutcome::NowExclusive);
        assert_eq!(pool.release(page.addr()), ReleaseOutcome::Freed);
    });
}

#[test]
fn test_interior_address_resolves_to_its_page() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        // Counts are tracked per page, not per byte.
        pool.retain(page.addr() + 123);
        assert_eq!(pool.ref_count(page.addr()), 2);
        assert_eq!(
            pool.release(page.addr() + PAGE_SIZE - 1),
            ReleaseOutcome::NowExclusive
        );
        assert_eq!(pool.release(page.addr()), ReleaseOutcome::Freed);
    });
}

#[test]
#[should_panic(expected = "has no owners")]
fn test_retain_of_free_page_is_fatal() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        assert!(pool.release(page.addr()).became_free());
        // The address is stale now; gaining an owner must abort, not no-op.
        pool.retain(page.addr());
    });
}

#[test]
#[should_panic(expected = "already free")]
fn test_double_release_is_fatal() {
    with_pool::<2>(|pool| {
        let page = pool.allocate().expect("pool shouldn't be empty");
        assert!(pool.release(page.addr()).became_free());
        let _ = pool.release(page.addr());
    });
}

#[test]
#[should_panic(expected = "outside the managed range")]
fn test_retain_out_of_range_is_fatal() {
    with_pool::<2>(|pool| {
        pool.retain(pool.span().end());
    });
}

#[test]
#[should_panic(expected = "outside the managed range")]
fn test_release_out_of_range_is_fatal() {
    with_pool::<2>(|pool| {
        let _ = pool.release(pool.span().start().wrapping_sub(PAGE_SIZE));
    });
}
