//! The from-space pool: owns every from-space page of the current relocation
//! cycle and coordinates the racing roles that evacuate, compact and recycle
//! them.
//!
//! Lock ordering, never reversed: target install lock, then the in-placed
//! list, then a free-list shard, then a forwarding's condition lock.

use crossbeam::utils::CachePadded;
use enum_map::EnumMap;
use log::{debug, info, trace};

use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::forwarding::Forwarding;
use crate::forwarding_table::ForwardingCursor;
use crate::options::PoolOptions;
use crate::page::{AllocFlags, Page, PageAge, PageType};
use crate::runtime::Runtime;
use crate::stats::SampleSeq;
use crate::util::Address;

mod free_list;
use free_list::FreeList;

/// Outcome of reclaiming a page out of the pool.
enum Reclaim {
    /// The empty page, handed to the caller.
    Page(Arc<Page>),
    /// The page's worth of memory was recycled or is about to come free.
    Recycled,
}

/// Continuation of the claim/evacuate protocol for one index.
enum Step {
    /// Move on to the next index.
    Advance,
    /// Retry the same index from before the claim.
    Retry,
    /// No target page can be installed; stop scanning.
    GiveUp,
    /// A page was freed.
    Reclaimed(Reclaim),
}

pub struct FromSpacePool<R: Runtime> {
    options: PoolOptions,

    /// Records, not pages: a page object may be handed out while another
    /// thread is still iterating, so the index must outlive page ownership.
    fsp: spin::RwLock<Vec<Arc<Forwarding>>>,
    fsp_pages: AtomicUsize,
    /// Smallest index below which every record is done. Monotonic.
    fsp_start: AtomicUsize,

    /// In-placed pages are guaranteed to survive, so they queue here per
    /// destination age and are the cheapest source of new targets.
    in_placed_pages: Mutex<EnumMap<PageAge, Vec<Arc<Page>>>>,

    /// Current evacuation target per age.
    target: EnumMap<PageAge, spin::RwLock<Option<Arc<Page>>>>,
    target_guard: Mutex<()>,

    per_cpu_free_list: Vec<CachePadded<FreeList>>,
    shared_free_list: FreeList,

    /// Dead bytes still held by the pool; the director reads this to adjust
    /// the start of the next cycle.
    size_in_bytes: AtomicUsize,
    evacuated_bytes: AtomicUsize,
    in_placed_bytes: AtomicUsize,
    deferrable_bytes: AtomicUsize,
    evacuated_page_count: AtomicUsize,
    in_placed_page_count: AtomicUsize,

    stat_fsp_percent_evacuated: SampleSeq,
    stat_to_be_freed_in_bytes: SampleSeq,

    _p: PhantomData<R>,
}

impl<R: Runtime> FromSpacePool<R> {
    pub fn new(options: PoolOptions) -> Self {
        let shards = options.cpu_shards.max(1);
        let per_cpu_free_list = (0..shards)
            .map(|_| CachePadded::new(FreeList::new()))
            .collect();
        let fsp = spin::RwLock::new(Vec::with_capacity(options.fsp_capacity));
        Self {
            options,
            fsp,
            fsp_pages: AtomicUsize::new(0),
            fsp_start: AtomicUsize::new(0),
            in_placed_pages: Mutex::new(EnumMap::default()),
            target: EnumMap::default(),
            target_guard: Mutex::new(()),
            per_cpu_free_list,
            shared_free_list: FreeList::new(),
            size_in_bytes: AtomicUsize::new(0),
            evacuated_bytes: AtomicUsize::new(0),
            in_placed_bytes: AtomicUsize::new(0),
            deferrable_bytes: AtomicUsize::new(0),
            evacuated_page_count: AtomicUsize::new(0),
            in_placed_page_count: AtomicUsize::new(0),
            stat_fsp_percent_evacuated: SampleSeq::new(),
            stat_to_be_freed_in_bytes: SampleSeq::new(),
            _p: PhantomData,
        }
    }

    //////////////////////////////////////////////////////////////
    // Readouts. Weak consistency is fine for all of these.
    //////////////////////////////////////////////////////////////

    /// From-space pages not yet resolved this cycle.
    pub fn pages(&self) -> usize {
        self.fsp_pages.load(Ordering::Acquire)
            - self.evacuated_page_count.load(Ordering::Acquire)
            - self.in_placed_page_count.load(Ordering::Acquire)
    }

    pub fn pages_at_relocate_start(&self) -> usize {
        self.fsp_pages.load(Ordering::Acquire)
    }

    pub fn fsp_depleted(&self) -> bool {
        self.fsp_pages.load(Ordering::Acquire) <= self.fsp_start.load(Ordering::Acquire)
    }

    /// Projection of how many bytes the remaining pages will yield, based on
    /// the decayed survival rate of previous cycles.
    pub fn to_be_free_in_bytes(&self) -> usize {
        let survival =
            self.stat_fsp_percent_evacuated.davg() + self.stat_fsp_percent_evacuated.dvariance();
        let fraction = (1.0 - survival).max(0.0);
        (self.pages() as f64 * self.options.page_size as f64 * fraction) as usize
    }

    pub fn reclaimed_avg(&self) -> usize {
        self.stat_to_be_freed_in_bytes.davg() as usize
    }

    pub fn cache_size(&self) -> usize {
        let mut size = self.shared_free_list.len();
        for shard in &self.per_cpu_free_list {
            size += shard.len();
        }
        size
    }

    //////////////////////////////////////////////////////////////
    // Registration and cycle boundaries (single-threaded contexts).
    //////////////////////////////////////////////////////////////

    /// Register a from-page at mark-complete. Its survivors are promoted one
    /// age step on evacuation.
    pub fn add_page(&self, page: Arc<Page>) {
        let to_age = page.age().promoted();
        let page_size = page.size();
        let live_bytes = page.live_bytes();
        debug_assert!(live_bytes <= page_size);

        self.fsp.write().push(Arc::new(Forwarding::new(page, to_age)));
        self.fsp_pages.fetch_add(1, Ordering::Release);
        self.size_in_bytes
            .fetch_add(page_size - live_bytes, Ordering::Relaxed);
        self.deferrable_bytes.fetch_add(live_bytes, Ordering::Relaxed);
    }

    /// The index is the side lookup from a page to its forwarding.
    pub fn forwarding_of(&self, page: &Arc<Page>) -> Option<Arc<Forwarding>> {
        self.fsp
            .read()
            .iter()
            .find(|f| Arc::ptr_eq(f.page(), page))
            .cloned()
    }

    /// The outer driver seeds the initial evacuation target for an age.
    pub fn install_target(&self, age: PageAge, page: Arc<Page>) {
        trace!("installing target for {:?}: {}", age, page.start());
        self.store_target(age, Some(page));
    }

    /// Sweep every record nobody is working on into the shared free list.
    /// Runs in the mark-complete handoff for the next cycle.
    pub fn reset_start(&self) {
        let mut freed = self.shared_free_list.locked();

        let mut evacuated_bytes = 0;
        let fsp = self.fsp.read();
        for f in fsp.iter() {
            if f.claim2() && f.claim() {
                f.mark_done(true);
                evacuated_bytes += f.evacuated_bytes();
                // These can be any age now.
                freed.push(f.page().clone());
            }
        }
        self.evacuated_bytes
            .fetch_add(evacuated_bytes, Ordering::Relaxed);
    }

    /// Cycle teardown: drain every cache, reprovision targets, and report how
    /// many live bytes were deferred to the next cycle.
    pub fn reset_end(&self) -> usize {
        let fsp_pages = self.fsp_pages.load(Ordering::Acquire);
        let deferrable_bytes = self.deferrable_bytes.load(Ordering::Relaxed);
        if fsp_pages != 0 {
            self.stat_to_be_freed_in_bytes
                .add((fsp_pages * self.options.page_size - deferrable_bytes) as f64);
        }

        let evacuated_bytes = self.evacuated_bytes.load(Ordering::Relaxed);
        let in_placed_bytes = self.in_placed_bytes.load(Ordering::Relaxed);
        let deferred_bytes =
            deferrable_bytes.saturating_sub(evacuated_bytes + in_placed_bytes);

        {
            // Clear all in-placed pages.
            let mut in_placed = self.in_placed_pages.lock().unwrap();
            for (_, list) in in_placed.iter_mut() {
                list.clear();
            }
        }

        {
            // Reset all target pages.
            let _guard = self.target_guard.lock().unwrap();
            self.reset_target();
        }

        // Remove all pages from the free lists.
        let batch = self.options.free_batch;
        self.shared_free_list
            .drain_batched(batch, R::free_empty_pages);
        for shard in &self.per_cpu_free_list {
            shard.drain_batched(batch, R::free_empty_pages);
        }

        if deferrable_bytes != 0 && fsp_pages != 0 {
            self.stat_fsp_percent_evacuated.add(
                (evacuated_bytes + in_placed_bytes) as f64
                    / (fsp_pages * self.options.page_size) as f64,
            );
        }

        info!("FSP: deferrable bytes:  {}", deferrable_bytes);
        info!("FSP: deferred bytes:    {}", deferred_bytes);
        info!("FSP: evacuated bytes:   {}", evacuated_bytes);

        // Reset counters for the next cycle.
        self.fsp_pages.store(0, Ordering::Release);
        self.fsp_start.store(0, Ordering::Release);
        self.size_in_bytes.store(0, Ordering::Relaxed);
        self.evacuated_bytes.store(0, Ordering::Relaxed);
        self.in_placed_bytes.store(0, Ordering::Relaxed);
        self.deferrable_bytes.store(0, Ordering::Relaxed);
        self.evacuated_page_count.store(0, Ordering::Relaxed);
        self.in_placed_page_count.store(0, Ordering::Relaxed);
        self.fsp.write().clear();

        deferred_bytes
    }

    //////////////////////////////////////////////////////////////
    // Worker entry points.
    //////////////////////////////////////////////////////////////

    /// Obtain an empty page derived from a fully evacuated from-page, or
    /// null if the pool cannot produce one (backpressure: the caller falls
    /// through to the external allocator).
    pub fn alloc_page(&self) -> Option<Arc<Page>> {
        if let Some(page) = self.take_from_cache() {
            return Some(page);
        }
        if !self.fsp_depleted() && !R::is_phase_mark_complete() {
            return match self.alloc_page_inner(true) {
                Some(Reclaim::Page(page)) => Some(page),
                _ => None,
            };
        }
        None
    }

    /// Free a page's worth of memory back to the collector: either a cached
    /// empty page is returned to the allocator, or a from-page is evacuated
    /// to become one.
    pub fn free_page(&self) -> bool {
        if let Some(page) = self.take_from_cache() {
            R::free_page(page);
            return true;
        }
        if !self.fsp_depleted() && !R::is_phase_mark_complete() {
            return self.alloc_page_inner(false).is_some();
        }
        false
    }

    /// Resolve a specific page that must survive in place (it holds a pinned
    /// object). The loser of the claim race waits for the winner to finish.
    pub fn compact_in_place(&self, f: &Arc<Forwarding>) {
        debug_assert!(!R::is_phase_mark_complete());
        if self.claim_and_remove_specific(f) {
            assert_eq!(f.ref_count(), -1, "in-place claim must be exclusive");

            if f.is_evacuated() {
                f.release_page();
                self.free_claimed_page(f, false);
            } else {
                let bytes_in_placed = R::compact_in_place(f);
                self.inc_in_placed_page_count_and_bytes(bytes_in_placed, f);
                f.release_page();
                f.mark_in_place();
                f.mark_done(true);
                debug_assert_eq!(f.ref_count(), 0);
                self.append_to_in_placed_pages(f.page().clone(), f.to_age());
            }
        } else {
            // Someone else won the race to resolve this page; by the time
            // the wait returns they are done with it.
            f.wait_until_done();
        }
    }

    //////////////////////////////////////////////////////////////
    // Claim protocol.
    //////////////////////////////////////////////////////////////

    fn claim_and_remove_specific(&self, f: &Forwarding) -> bool {
        if f.in_place_relocation_claim_page(true) {
            let claimed = f.claim();
            debug_assert!(claimed, "exclusive rc holder must win the write claim");
            true
        } else {
            false
        }
    }

    /// Exclusively claim some not-yet-started page, preferring a matching
    /// age on the first pass.
    fn claim_and_remove_any_page(&self, age: PageAge) -> Option<Arc<Forwarding>> {
        debug_assert!(!R::is_phase_mark_complete());

        for attempt in 0..2 {
            let fsp = self.fsp.read();
            for i in self.fsp_start.load(Ordering::Acquire)..fsp.len() {
                let f = &fsp[i];
                if attempt == 0 && f.to_age() != age {
                    continue;
                }
                if f.is_done() {
                    continue;
                }
                if f.is_claim2() {
                    continue;
                }
                if f.in_place_relocation_claim_page(false) {
                    let claimed = f.claim();
                    debug_assert!(claimed, "exclusive rc holder must win the write claim");
                    return Some(f.clone());
                }
            }
        }

        None
    }

    fn try_claim_page(&self, i: usize, update_fsp: &mut bool) -> Option<Arc<Forwarding>> {
        let f = self.fsp.read()[i].clone();

        if f.is_done() {
            if *update_fsp {
                self.update_fsp_start(i + 1);
            }
            return None;
        }

        if !f.claim2() {
            *update_fsp = false;
            return None;
        }

        if !f.retain_page() {
            // Either it is being retired, or it is fully evacuated and the
            // free path will advance past it.
            debug_assert!(f.ref_count() <= 0 || f.is_evacuated() || f.is_done());
            f.unclaim2();
            return None;
        }

        Some(f)
    }

    fn update_fsp_start(&self, new_start: usize) {
        let _ = self
            .fsp_start
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |old| {
                if new_start > old {
                    Some(new_start)
                } else {
                    None
                }
            });
    }

    /// Free a fully evacuated page if we can zero its count, otherwise give
    /// up one hold and retry against the remaining holders. Success from the
    /// retry propagates to the caller.
    fn try_free_if_evacuated_else_release(
        &self,
        f: &Arc<Forwarding>,
        from_rc: i32,
        want_page: bool,
    ) -> Option<Reclaim> {
        if f.try_fast_zero_rc(from_rc) {
            let claimed = f.claim();
            assert!(claimed, "fast-zero winner must take the write claim");
            return Some(match self.free_claimed_page(f, want_page) {
                Some(page) => Reclaim::Page(page),
                None => Reclaim::Recycled,
            });
        }
        if from_rc > 1 {
            f.release_page();
            return self.try_free_if_evacuated_else_release(f, from_rc - 1, want_page);
        }
        None
    }

    /// Retire a claimed, fully resolved page: hand it to the caller or
    /// recycle it into the local free-list shard.
    fn free_claimed_page(&self, f: &Forwarding, want_page: bool) -> Option<Arc<Page>> {
        debug_assert!(f.is_claimed());
        let page = f.page().clone();
        self.inc_evacuated_page_count_and_bytes(f.evacuated_bytes(), f);

        let result = if want_page {
            Some(page)
        } else {
            let shard = &self.per_cpu_free_list[R::cpu_id() % self.per_cpu_free_list.len()];
            if let Err(dropped) = shard.try_push(page) {
                // Never stall the producer; losing one recyclable page is
                // cheaper than blocking here.
                debug!("free-list shard busy, dropping page {}", dropped.start());
            }
            None
        };

        f.mark_done(true);
        result
    }

    //////////////////////////////////////////////////////////////
    // Evacuation.
    //////////////////////////////////////////////////////////////

    fn load_target(&self, age: PageAge) -> Option<Arc<Page>> {
        self.target[age].read().clone()
    }

    fn store_target(&self, age: PageAge, page: Option<Arc<Page>>) {
        *self.target[age].write() = page;
    }

    fn same_target(a: &Option<Arc<Page>>, b: &Option<Arc<Page>>) -> bool {
        match (a, b) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    fn alloc_object_atomic(&self, size: usize, age: PageAge) -> Option<Address> {
        self.load_target(age)?.alloc_object_atomic(size)
    }

    /// Copy live objects in ascending address order onto the current target,
    /// resuming from `livemap_cursor` if a previous call ran out of target
    /// space. Returns the bytes this invocation installed; on target
    /// exhaustion the cursor records the address to resume from.
    fn evacuate_page(&self, f: &Forwarding, livemap_cursor: &mut Option<Address>) -> usize {
        let mut evacuated_bytes = 0;
        let start_from = livemap_cursor.unwrap_or_else(|| f.page().start());
        let age = f.to_age();
        let mut cursor = ForwardingCursor::default();

        for from_addr in f.page().live_map().iter_from(start_from) {
            if f.find(from_addr, &mut cursor).is_some() {
                continue;
            }
            let unaligned_size = R::object_size(from_addr);

            let to_addr = match self.alloc_object_atomic(unaligned_size, age) {
                Some(to_addr) => to_addr,
                None => {
                    // Remember where we stopped evacuating.
                    *livemap_cursor = Some(from_addr);
                    return evacuated_bytes;
                }
            };

            R::object_copy_disjoint(from_addr, to_addr, unaligned_size);
            let final_addr = f.insert(from_addr, to_addr, &mut cursor);
            if final_addr == to_addr {
                evacuated_bytes += unaligned_size;
            }
        }

        evacuated_bytes
    }

    /// Drive one index through claim, evacuation and disposal.
    fn evacuate_index(
        &self,
        i: usize,
        update_fsp: &mut bool,
        livemap_cursor: &mut Option<Address>,
        want_page: bool,
    ) -> Step {
        let f = match self.try_claim_page(i, update_fsp) {
            Some(f) => f,
            None => return Step::Advance,
        };
        let age = f.to_age();

        loop {
            let page_we_evacuate_onto = self.load_target(age);

            let evacuated_bytes = self.evacuate_page(&f, livemap_cursor);

            // If the page is now fully evacuated...
            if f.inc_evacuated_bytes(evacuated_bytes) {
                // ...try to free it: the expected count is the pool's
                // reference plus our own retain.
                if let Some(reclaim) = self.try_free_if_evacuated_else_release(&f, 2, want_page) {
                    return Step::Reclaimed(reclaim);
                }
                if want_page {
                    // Reset the cursor; we continue on a different page.
                    *livemap_cursor = None;
                    return Step::Advance;
                }
                // The page is fully evacuated; the remaining holder's
                // release retires it, so the free request is satisfied.
                return Step::Reclaimed(Reclaim::Recycled);
            }

            // Evacuation stalled, which always means the target filled.
            let target = self.load_target(age);
            if !Self::same_target(&target, &page_we_evacuate_onto) {
                // Someone already installed a new target; the kept cursor
                // resumes exactly where we left off.
                continue;
            }

            // Back out before possibly installing a new target ourselves.
            f.unclaim2();
            f.release_page();
            *livemap_cursor = None;

            {
                let _guard = self.target_guard.lock().unwrap();

                // A new target appeared while we blocked on the guard.
                if !Self::same_target(&self.load_target(age), &target) {
                    return Step::Retry;
                }
                // We won the race to install a new target.
                if let Some(new_target) = self.install_new_target(age) {
                    trace!("new target for {:?}: {}", age, new_target.start());
                    self.store_target(age, Some(new_target));
                    return Step::Retry;
                }
            }

            // No target page to be had anywhere; give up.
            return Step::GiveUp;
        }
    }

    /// Scan the index for a page we can turn into a free one. Each pass
    /// either frees a page, advances a page's evacuation, or installs a new
    /// target, so the scan terminates.
    fn alloc_page_inner(&self, want_page: bool) -> Option<Reclaim> {
        let mut update_fsp = true;
        let mut livemap_cursor: Option<Address> = None;
        let fsp_pages = self.fsp_pages.load(Ordering::Acquire);

        let mut i = self.fsp_start.load(Ordering::Acquire);
        while i < fsp_pages {
            match self.evacuate_index(i, &mut update_fsp, &mut livemap_cursor, want_page) {
                Step::Advance => {
                    i = (i + 1).max(self.fsp_start.load(Ordering::Acquire));
                }
                Step::Retry => {}
                Step::GiveUp => break,
                Step::Reclaimed(reclaim) => return Some(reclaim),
            }
        }

        None
    }

    //////////////////////////////////////////////////////////////
    // Target installation and page recycling.
    //////////////////////////////////////////////////////////////

    fn take_from_cache(&self) -> Option<Arc<Page>> {
        let shards = self.per_cpu_free_list.len();
        let cpu_id = R::cpu_id();
        for i in 0..shards {
            if let Some(page) = self.per_cpu_free_list[(cpu_id + i) % shards].pop() {
                return Some(page);
            }
        }

        if R::is_phase_mark_complete() {
            return self.shared_free_list.pop();
        }
        None
    }

    /// Produce a new target page for `age`. In-placed pages cost no copying
    /// and go first; only when they are exhausted do we pay for an in-place
    /// compaction of a from-page.
    fn install_new_target(&self, age: PageAge) -> Option<Arc<Page>> {
        {
            let mut in_placed = self.in_placed_pages.lock().unwrap();
            if let Some(page) = in_placed[age].pop() {
                return Some(page);
            }
        }

        let f = self.claim_and_remove_any_page(age)?;
        let bytes_in_placed = R::compact_in_place(&f);
        self.inc_in_placed_page_count_and_bytes(bytes_in_placed, &f);

        assert_eq!(f.ref_count(), -1, "in-place claim must be exclusive");
        f.release_page();
        f.mark_in_place();
        f.mark_done(true);
        debug_assert_eq!(f.ref_count(), 0);

        let page = f.page().clone();
        page.reset_age(age);
        Some(page)
    }

    fn append_to_in_placed_pages(&self, page: Arc<Page>, age: PageAge) {
        self.in_placed_pages.lock().unwrap()[age].push(page);
    }

    /// Reprovision the target of every age that was in use this cycle with a
    /// fresh page for the next one. Caller holds the target lock.
    fn reset_target(&self) {
        for (age, slot) in self.target.iter() {
            let mut slot = slot.write();
            if slot.is_some() {
                let mut flags = AllocFlags::new();
                flags.set_non_blocking();
                flags.set_alloc_with_old_seqnum();
                flags.set_gc_relocation();
                *slot = R::alloc_page(PageType::Small, self.options.page_size, flags, age);
            }
        }
    }

    //////////////////////////////////////////////////////////////
    // Accounting.
    //////////////////////////////////////////////////////////////

    fn inc_evacuated_page_count_and_bytes(&self, bytes_evacuated: usize, f: &Forwarding) {
        self.evacuated_page_count.fetch_add(1, Ordering::Relaxed);
        self.evacuated_bytes
            .fetch_add(bytes_evacuated, Ordering::Relaxed);
        self.size_in_bytes
            .fetch_sub(f.size() - f.live_bytes(), Ordering::Relaxed);
    }

    fn inc_in_placed_page_count_and_bytes(&self, bytes_in_placed: usize, f: &Forwarding) {
        self.in_placed_page_count.fetch_add(1, Ordering::Relaxed);
        self.in_placed_bytes
            .fetch_add(bytes_in_placed, Ordering::Relaxed);
        self.size_in_bytes
            .fetch_sub(f.size() - f.live_bytes(), Ordering::Relaxed);
    }
}
