//! Cycle boundaries: sweeping leftovers at the mark-complete handoff,
//! draining every cache at teardown, and reuse across cycles.

mod common;

use common::*;
use fromspace_pool::{PageAge, PoolOptions};
use std::sync::Arc;

#[test]
fn leftover_pages_are_swept_and_deferred() {
    with_mock(|| {
        let pool = pool_with(PoolOptions {
            page_size: 1024,
            free_batch: 2,
            fsp_capacity: 16,
            cpu_shards: 2,
        });
        let p1 = page_with_objects(1024, PageAge::Eden, &[104]);
        let p2 = page_with_objects(1024, PageAge::Eden, &[104, 104]);
        let p3 = page_with_objects(1024, PageAge::Eden, &[104, 96, 104]);
        for p in [&p1, &p2, &p3] {
            pool.add_page(p.clone());
        }
        pool.install_target(PageAge::Survivor1, empty_page(1024, PageAge::Survivor1));

        // Evacuate only the first page.
        let got = pool.alloc_page().unwrap();
        assert!(Arc::ptr_eq(&got, &p1));

        set_mark_complete(true);
        pool.reset_start();

        // Every record is done once the sweep has run, and the untouched
        // records still carry their whole live load.
        for p in [&p1, &p2, &p3] {
            let f = pool.forwarding_of(p).unwrap();
            assert!(f.is_done());
        }
        assert_eq!(pool.forwarding_of(&p2).unwrap().deferred_bytes(), 208);
        assert_eq!(pool.forwarding_of(&p3).unwrap().deferred_bytes(), 304);

        // The two untouched pages carry all their live bytes over.
        let deferred = pool.reset_end();
        assert_eq!(deferred, 208 + 304);

        // Both swept pages went back to the allocator through the shared
        // list drain; p1 went to the caller and is not among them.
        let freed = freed_pages();
        assert_eq!(freed.len(), 2);
        assert!(freed.iter().any(|p| Arc::ptr_eq(p, &p2)));
        assert!(freed.iter().any(|p| Arc::ptr_eq(p, &p3)));

        // The used target slot was reprovisioned with relocation flags.
        let allocs = target_allocs();
        assert_eq!(allocs.len(), 1);
        let (age, flags) = allocs[0];
        assert_eq!(age, PageAge::Survivor1);
        assert!(flags.non_blocking() && flags.alloc_with_old_seqnum() && flags.gc_relocation());

        assert_eq!(pool.pages(), 0);
        assert_eq!(pool.pages_at_relocate_start(), 0);
        assert!(pool.fsp_depleted());
        assert_eq!(pool.cache_size(), 0);
    });
}

#[test]
fn swept_pages_serve_the_cache_during_mark_complete() {
    with_mock(|| {
        let pool = new_pool();
        let p1 = page_with_objects(1024, PageAge::Eden, &[96]);
        let p2 = page_with_objects(1024, PageAge::Eden, &[96]);
        pool.add_page(p1.clone());
        pool.add_page(p2.clone());

        set_mark_complete(true);
        pool.reset_start();
        assert_eq!(pool.cache_size(), 2);

        // During mark-complete the shared shard backs both entry points.
        let from_cache = pool.alloc_page().expect("shared list should serve");
        assert!(Arc::ptr_eq(&from_cache, &p1) || Arc::ptr_eq(&from_cache, &p2));
        assert!(pool.free_page());
        assert_eq!(freed_pages().len(), 1);
        assert_eq!(pool.cache_size(), 0);

        assert!(pool.alloc_page().is_none());
        assert!(!pool.free_page());

        let deferred = pool.reset_end();
        assert_eq!(deferred, 192);
    });
}

#[test]
fn the_pool_is_reusable_across_cycles() {
    with_mock(|| {
        let pool = new_pool();

        for cycle in 0..3 {
            let page = page_with_objects(1024, PageAge::Eden, &[104, 96]);
            pool.add_page(page.clone());
            pool.install_target(PageAge::Survivor1, empty_page(1024, PageAge::Survivor1));
            assert_eq!(pool.pages_at_relocate_start(), 1, "cycle {}", cycle);

            assert!(pool.free_page());
            let f = pool.forwarding_of(&page).unwrap();
            assert_eq!(f.evacuated_bytes(), 200);

            set_mark_complete(true);
            pool.reset_start();
            assert_eq!(pool.reset_end(), 0);
            set_mark_complete(false);

            assert!(pool.fsp_depleted());
            assert_eq!(pool.pages(), 0);
        }
    });
}

#[test]
fn statistics_readouts_follow_the_cycles() {
    with_mock(|| {
        let pool = new_pool();

        // One full cycle that evacuates everything.
        let page = page_with_objects(1024, PageAge::Eden, &[104, 96]);
        pool.add_page(page);
        pool.install_target(PageAge::Survivor1, empty_page(1024, PageAge::Survivor1));
        assert!(pool.free_page());
        set_mark_complete(true);
        pool.reset_start();
        pool.reset_end();
        set_mark_complete(false);

        // One page of 1024 with 200 live: 824 bytes came free.
        assert_eq!(pool.reclaimed_avg(), 824);

        // A new cycle's projection uses the decayed survival rate.
        let next = page_with_objects(1024, PageAge::Eden, &[104, 96]);
        pool.add_page(next);
        assert_eq!(pool.pages(), 1);
        let projected = pool.to_be_free_in_bytes();
        assert!(projected > 0 && projected <= 1024);
    });
}
