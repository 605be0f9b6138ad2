//! Mock runtime shared by the integration tests: every collaborator of the
//! pool is backed by a leaked arena and static bookkeeping, so tests can
//! observe what the pool handed to the allocator and how often the in-place
//! compactor ran.
#![allow(dead_code)]

use lazy_static::lazy_static;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use fromspace_pool::{
    AllocFlags, Address, Forwarding, FromSpacePool, Page, PageAge, PageType, PoolOptions, Runtime,
};

pub struct MockRuntime;

#[derive(Default)]
struct MockState {
    freed: Vec<Arc<Page>>,
    target_allocs: Vec<(PageAge, AllocFlags)>,
    compactions: usize,
}

lazy_static! {
    static ref STATE: Mutex<MockState> = Mutex::new(MockState::default());
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

static MARK_COMPLETE: AtomicBool = AtomicBool::new(false);
static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static CPU_ID: usize = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % MockRuntime::CPUS;
}

impl MockRuntime {
    const CPUS: usize = 4;
}

fn arena_alloc(bytes: usize) -> Address {
    let words = (bytes + 7) / 8;
    let buf: Box<[usize]> = vec![0usize; words].into_boxed_slice();
    let ptr = Box::leak(buf).as_mut_ptr();
    unsafe { Address::from_usize(ptr as usize) }
}

impl Runtime for MockRuntime {
    fn alloc_page(
        _ptype: PageType,
        size: usize,
        flags: AllocFlags,
        age: PageAge,
    ) -> Option<Arc<Page>> {
        STATE.lock().unwrap().target_allocs.push((age, flags));
        Some(Arc::new(Page::new(arena_alloc(size), size, age)))
    }

    fn free_page(page: Arc<Page>) {
        STATE.lock().unwrap().freed.push(page);
    }

    fn free_empty_pages(pages: Vec<Arc<Page>>) {
        STATE.lock().unwrap().freed.extend(pages);
    }

    fn compact_in_place(forwarding: &Forwarding) -> usize {
        STATE.lock().unwrap().compactions += 1;
        let page = forwarding.page();
        // Objects already forwarded out stay forwarded; the rest survive in
        // place, slid to the bottom of the page.
        let mut surviving = 0;
        for addr in page.live_map().iter() {
            if forwarding.lookup(addr).is_none() {
                surviving += Self::object_size(addr);
            }
        }
        page.set_top(page.start() + surviving);
        surviving
    }

    fn is_phase_mark_complete() -> bool {
        MARK_COMPLETE.load(Ordering::Acquire)
    }

    fn cpu_id() -> usize {
        CPU_ID.with(|id| *id)
    }

    fn cpu_count() -> usize {
        Self::CPUS
    }

    fn object_size(addr: Address) -> usize {
        // The first word of every mock object holds its size.
        unsafe { addr.load::<usize>() }
    }

    fn object_copy_disjoint(from: Address, to: Address, size: usize) {
        unsafe {
            std::ptr::copy_nonoverlapping(from.to_ptr::<u8>(), to.to_mut_ptr::<u8>(), size);
        }
    }
}

/// Serializes tests against the shared mock state and resets it.
pub fn with_mock(test: impl FnOnce()) {
    let _guard: MutexGuard<'_, ()> = SERIAL.lock().unwrap_or_else(|e| e.into_inner());
    let _ = env_logger::builder().is_test(true).try_init();
    *STATE.lock().unwrap() = MockState::default();
    MARK_COMPLETE.store(false, Ordering::Release);
    test();
}

pub fn set_mark_complete(complete: bool) {
    MARK_COMPLETE.store(complete, Ordering::Release);
}

pub fn freed_pages() -> Vec<Arc<Page>> {
    STATE.lock().unwrap().freed.clone()
}

pub fn target_allocs() -> Vec<(PageAge, AllocFlags)> {
    STATE.lock().unwrap().target_allocs.clone()
}

pub fn compactions() -> usize {
    STATE.lock().unwrap().compactions
}

/// A small-page pool: 1 KiB pages, two shards, batch of 4.
pub fn new_pool() -> FromSpacePool<MockRuntime> {
    pool_with(PoolOptions {
        page_size: 1024,
        free_batch: 4,
        fsp_capacity: 16,
        cpu_shards: 2,
    })
}

pub fn pool_with(options: PoolOptions) -> FromSpacePool<MockRuntime> {
    FromSpacePool::new(options)
}

/// An empty page backed by real memory.
pub fn empty_page(size: usize, age: PageAge) -> Arc<Page> {
    Arc::new(Page::new(arena_alloc(size), size, age))
}

/// A from-page populated with live objects of the given sizes, laid out
/// back to back from the page start. Each object's first word is its size.
pub fn page_with_objects(size: usize, age: PageAge, objects: &[usize]) -> Arc<Page> {
    let page = empty_page(size, age);
    let mut addr = page.start();
    for &object_size in objects {
        assert!(object_size >= 8 && object_size % 8 == 0);
        unsafe { addr.store::<usize>(object_size) };
        page.mark_live(addr, object_size);
        addr = addr + object_size;
    }
    assert!(addr <= page.end(), "objects overflow the page");
    page
}
