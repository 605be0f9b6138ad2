//! Page: the unit of reclamation handed out by the external allocator. The
//! pool shares pages through `Arc`; identity comparisons use `Arc::ptr_eq`.

use atomic::{Atomic, Ordering};
use bytemuck::NoUninit;
use enum_map::Enum;

use std::sync::atomic::AtomicUsize;

use crate::live_map::LiveMap;
use crate::util::constants::BYTES_IN_GRANULE;
use crate::util::Address;

/// Destination age ladder for the young generation. Evacuating a page moves
/// its survivors one step up; `Old` is terminal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Enum, NoUninit)]
pub enum PageAge {
    Eden,
    Survivor1,
    Survivor2,
    Survivor3,
    Survivor4,
    Old,
}

impl PageAge {
    pub fn promoted(self) -> PageAge {
        match self {
            PageAge::Eden => PageAge::Survivor1,
            PageAge::Survivor1 => PageAge::Survivor2,
            PageAge::Survivor2 => PageAge::Survivor3,
            PageAge::Survivor3 => PageAge::Survivor4,
            PageAge::Survivor4 | PageAge::Old => PageAge::Old,
        }
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, NoUninit)]
pub enum PageType {
    Small,
    Medium,
    Large,
}

/// Allocation flags passed to the external page allocator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocFlags(u8);

impl AllocFlags {
    const NON_BLOCKING: u8 = 1 << 0;
    const ALLOC_WITH_OLD_SEQNUM: u8 = 1 << 1;
    const GC_RELOCATION: u8 = 1 << 2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_non_blocking(&mut self) {
        self.0 |= Self::NON_BLOCKING;
    }

    pub fn set_alloc_with_old_seqnum(&mut self) {
        self.0 |= Self::ALLOC_WITH_OLD_SEQNUM;
    }

    pub fn set_gc_relocation(&mut self) {
        self.0 |= Self::GC_RELOCATION;
    }

    pub fn non_blocking(self) -> bool {
        self.0 & Self::NON_BLOCKING != 0
    }

    pub fn alloc_with_old_seqnum(self) -> bool {
        self.0 & Self::ALLOC_WITH_OLD_SEQNUM != 0
    }

    pub fn gc_relocation(self) -> bool {
        self.0 & Self::GC_RELOCATION != 0
    }
}

pub struct Page {
    start: Address,
    size: usize,
    age: Atomic<PageAge>,
    /// Bump pointer for to-space allocation. `start` when the page is empty.
    top: AtomicUsize,
    live_bytes: AtomicUsize,
    live_map: LiveMap,
}

impl Page {
    pub fn new(start: Address, size: usize, age: PageAge) -> Self {
        debug_assert!(start.is_aligned_to(BYTES_IN_GRANULE));
        debug_assert!(size % BYTES_IN_GRANULE == 0);
        Self {
            start,
            size,
            age: Atomic::new(age),
            top: AtomicUsize::new(start.as_usize()),
            live_bytes: AtomicUsize::new(0),
            live_map: LiveMap::new(start, size),
        }
    }

    pub fn start(&self) -> Address {
        self.start
    }

    pub fn end(&self) -> Address {
        self.start + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn age(&self) -> PageAge {
        self.age.load(Ordering::Acquire)
    }

    /// Reinstalled as a target of a different age after in-place compaction.
    pub fn reset_age(&self, age: PageAge) {
        self.age.store(age, Ordering::Release);
    }

    pub fn top(&self) -> Address {
        unsafe { Address::from_usize(self.top.load(Ordering::Acquire)) }
    }

    /// Used by the in-place compactor to leave the bump pointer past the
    /// surviving objects.
    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.start && top <= self.end());
        self.top.store(top.as_usize(), Ordering::Release);
    }

    pub fn remaining(&self) -> usize {
        self.end() - self.top()
    }

    /// Bump-allocate `size` bytes (granule aligned). Lock-free: a single CAS
    /// on the bump pointer, so concurrent evacuators can share the target.
    pub fn alloc_object_atomic(&self, size: usize) -> Option<Address> {
        let aligned = (size + BYTES_IN_GRANULE - 1) & !(BYTES_IN_GRANULE - 1);
        let end = self.end().as_usize();
        self.top
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |top| {
                if top + aligned <= end {
                    Some(top + aligned)
                } else {
                    None
                }
            })
            .ok()
            .map(|old| unsafe { Address::from_usize(old) })
    }

    /// Marker handoff: record one surviving object at `addr`.
    pub fn mark_live(&self, addr: Address, bytes: usize) {
        self.live_map.set(addr);
        self.live_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    pub fn live_map(&self) -> &LiveMap {
        &self.live_map
    }
}
