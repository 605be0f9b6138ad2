//! Forwarding record: per from-page relocation state. Three acquirable
//! tokens govern a page's lifecycle:
//!
//! * `retain_page` / `release_page`: a positive reference count held by
//!   readers and the evacuating worker.
//! * `claim2`: the single-winner "I will evacuate this page" token.
//! * `claim`: the one-shot exclusive token required to free the page or
//!   compact it in place. Exclusivity is the ref count at -1, reachable only
//!   by CAS from an expected non-negative count.
//!
//! The count starts at 1: the pool itself references the record from
//! registration until the page is freed or swept.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::forwarding_table::{ForwardingCursor, ForwardingTable};
use crate::page::{Page, PageAge};
use crate::util::Address;

pub struct Forwarding {
    page: Arc<Page>,
    from_age: PageAge,
    to_age: PageAge,
    live_bytes: usize,
    evacuated_bytes: AtomicUsize,
    ref_count: AtomicI32,
    claimed: AtomicBool,
    claimed2: AtomicBool,
    done: AtomicBool,
    evacuated: AtomicBool,
    in_place: AtomicBool,
    table: ForwardingTable,
    // One latch serves both the done condition and ref-count waits.
    sync: Mutex<()>,
    cond: Condvar,
}

impl Forwarding {
    pub fn new(page: Arc<Page>, to_age: PageAge) -> Self {
        let from_age = page.age();
        let live_bytes = page.live_bytes();
        let table = ForwardingTable::new(page.live_map().live_objects());
        Self {
            page,
            from_age,
            to_age,
            live_bytes,
            evacuated_bytes: AtomicUsize::new(0),
            ref_count: AtomicI32::new(1),
            claimed: AtomicBool::new(false),
            claimed2: AtomicBool::new(false),
            done: AtomicBool::new(false),
            evacuated: AtomicBool::new(false),
            in_place: AtomicBool::new(false),
            table,
            sync: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub fn page(&self) -> &Arc<Page> {
        &self.page
    }

    pub fn from_age(&self) -> PageAge {
        self.from_age
    }

    pub fn to_age(&self) -> PageAge {
        self.to_age
    }

    pub fn is_promotion(&self) -> bool {
        self.from_age != self.to_age
    }

    pub fn size(&self) -> usize {
        self.page.size()
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes
    }

    pub fn evacuated_bytes(&self) -> usize {
        self.evacuated_bytes.load(Ordering::Acquire)
    }

    /// Live bytes this record would carry over to the next cycle if the page
    /// were left as-is now.
    pub fn deferred_bytes(&self) -> usize {
        self.live_bytes - self.evacuated_bytes().min(self.live_bytes)
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Take a shared hold on the page. Fails once the record is done,
    /// fully evacuated, or exclusively claimed.
    pub fn retain_page(&self) -> bool {
        if self.is_done() || self.is_evacuated() {
            return false;
        }
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |rc| {
                if rc > 0 {
                    Some(rc + 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    /// Drop a hold: a positive count decrements, an exclusive claim steps
    /// back to 0. Waiters parked on the ref count are woken once only the
    /// pool's reference (or less) remains.
    pub fn release_page(&self) {
        let mut rc = self.ref_count.load(Ordering::SeqCst);
        loop {
            let next = match rc {
                1.. => rc - 1,
                -1 => 0,
                _ => panic!("release_page on idle forwarding (rc {})", rc),
            };
            match self.ref_count.compare_exchange_weak(
                rc,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    if next <= 1 {
                        let _guard = self.sync.lock().unwrap();
                        self.cond.notify_all();
                    }
                    return;
                }
                Err(actual) => rc = actual,
            }
        }
    }

    /// One-shot exclusive write claim.
    pub fn claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// One-shot work claim: the winner commits to evacuating this page.
    pub fn claim2(&self) -> bool {
        self.claimed2
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_claim2(&self) -> bool {
        self.claimed2.load(Ordering::Acquire)
    }

    /// Roll back a work claim. Only the winner may do this, and only before
    /// any irreversible state change.
    pub fn unclaim2(&self) {
        let was = self.claimed2.swap(false, Ordering::SeqCst);
        debug_assert!(was, "unclaim2 without a claim");
    }

    /// Fast path to exclusivity for a fully evacuated page: CAS the expected
    /// count straight to -1, consuming the pool's reference and the caller's
    /// hold in one step.
    pub fn try_fast_zero_rc(&self, expected: i32) -> bool {
        debug_assert!(expected > 0);
        debug_assert!(self.is_evacuated());
        self.ref_count
            .compare_exchange(expected, -1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Exclusive claim for in-place compaction. Parks until only the pool's
    /// reference remains, then brings the count 1 -> -1, consuming it. Fails
    /// once the record is done or write-claimed elsewhere, or (unless
    /// `return_if_evacuated`) once it is fully evacuated.
    pub fn in_place_relocation_claim_page(&self, return_if_evacuated: bool) -> bool {
        let mut guard = self.sync.lock().unwrap();
        loop {
            // A winner releases the count before publishing done; checking
            // the write claim keeps a racing claimer from re-taking it.
            if self.is_done() || self.is_claimed() {
                return false;
            }
            if !return_if_evacuated && self.is_evacuated() {
                return false;
            }
            if self
                .ref_count
                .compare_exchange(1, -1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
            guard = self.cond.wait(guard).unwrap();
        }
    }

    /// Account evacuation progress. Returns true exactly when this call
    /// completes the page; the evacuated flag is set before returning.
    pub fn inc_evacuated_bytes(&self, bytes: usize) -> bool {
        let total = self.evacuated_bytes.fetch_add(bytes, Ordering::SeqCst) + bytes;
        debug_assert!(
            total <= self.live_bytes,
            "evacuated {} of {} live bytes",
            total,
            self.live_bytes
        );
        if total >= self.live_bytes {
            self.mark_evacuated();
            true
        } else {
            false
        }
    }

    pub fn mark_evacuated(&self) {
        debug_assert!(self.evacuated_bytes() >= self.live_bytes);
        self.evacuated.store(true, Ordering::Release);
    }

    pub fn is_evacuated(&self) -> bool {
        self.evacuated.load(Ordering::Acquire)
    }

    pub fn mark_in_place(&self) {
        self.in_place.store(true, Ordering::Release);
    }

    pub fn is_in_place(&self) -> bool {
        self.in_place.load(Ordering::Acquire)
    }

    /// Retire the record. All terminal state (evacuated bytes, flags) must be
    /// written before this; observers pairing an acquire load of `done` see
    /// them finalized.
    pub fn mark_done(&self, notify: bool) {
        self.done.store(true, Ordering::Release);
        if notify {
            let _guard = self.sync.lock().unwrap();
            self.cond.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub fn wait_until_done(&self) {
        let mut guard = self.sync.lock().unwrap();
        while !self.is_done() {
            guard = self.cond.wait(guard).unwrap();
        }
    }

    pub fn find(&self, from: Address, cursor: &mut ForwardingCursor) -> Option<Address> {
        self.table.find(from, cursor)
    }

    pub fn insert(&self, from: Address, to: Address, cursor: &mut ForwardingCursor) -> Address {
        self.table.insert(from, to, cursor)
    }

    pub fn lookup(&self, from: Address) -> Option<Address> {
        self.table.lookup(from)
    }
}
