//! Forwarding table: an open-addressed map from surviving from-addresses to
//! their to-addresses. Inserts are CAS-linearized: the first mapping for an
//! address wins and every racing inserter is handed the winning address.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::util::Address;

const EMPTY: usize = 0;

struct Slot {
    from: AtomicUsize,
    to: AtomicUsize,
}

/// Probe token. `find` leaves it at the slot where the search ended so a
/// following `insert` of the same address continues there instead of
/// re-probing from the hash.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardingCursor(usize);

pub struct ForwardingTable {
    slots: Box<[Slot]>,
    mask: usize,
}

impl ForwardingTable {
    /// Sized to twice the live object count so probe chains stay short and
    /// the table can never fill.
    pub fn new(live_objects: usize) -> Self {
        let capacity = (live_objects * 2).next_power_of_two().max(2);
        let slots = (0..capacity)
            .map(|_| Slot {
                from: AtomicUsize::new(EMPTY),
                to: AtomicUsize::new(EMPTY),
            })
            .collect();
        Self {
            slots,
            mask: capacity - 1,
        }
    }

    fn hash(&self, from: Address) -> usize {
        // Fibonacci hashing over the granule index.
        let index = (from.as_usize() >> 3) as u64;
        (index.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 32) as usize & self.mask
    }

    /// A claimed slot publishes its to-address after the claim; a reader that
    /// observes the claim spins briefly for the publication.
    fn wait_for_publish(slot: &Slot) -> Address {
        loop {
            let to = slot.to.load(Ordering::Acquire);
            if to != EMPTY {
                return unsafe { Address::from_usize(to) };
            }
            std::hint::spin_loop();
        }
    }

    /// Look up `from`. On a miss the cursor is left at the empty slot that
    /// terminated the probe.
    pub fn find(&self, from: Address, cursor: &mut ForwardingCursor) -> Option<Address> {
        debug_assert!(!from.is_zero());
        let mut index = self.hash(from);
        loop {
            let slot = &self.slots[index];
            match slot.from.load(Ordering::Acquire) {
                EMPTY => {
                    cursor.0 = index;
                    return None;
                }
                claimed if claimed == from.as_usize() => {
                    cursor.0 = index;
                    return Some(Self::wait_for_publish(slot));
                }
                _ => index = (index + 1) & self.mask,
            }
        }
    }

    /// Install `from -> to`, continuing the probe from the cursor a preceding
    /// `find(from, ..)` left behind. Returns the mapping that survives: `to`
    /// if we won, the racing winner's address if we lost.
    pub fn insert(&self, from: Address, to: Address, cursor: &mut ForwardingCursor) -> Address {
        debug_assert!(!from.is_zero() && !to.is_zero());
        let mut index = cursor.0;
        loop {
            let slot = &self.slots[index];
            match slot.from.compare_exchange(
                EMPTY,
                from.as_usize(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    slot.to.store(to.as_usize(), Ordering::Release);
                    cursor.0 = index;
                    return to;
                }
                Err(claimed) if claimed == from.as_usize() => {
                    cursor.0 = index;
                    return Self::wait_for_publish(slot);
                }
                Err(_) => index = (index + 1) & self.mask,
            }
        }
    }

    /// Convenience for verification walks: a fresh-cursor lookup.
    pub fn lookup(&self, from: Address) -> Option<Address> {
        self.find(from, &mut ForwardingCursor::default())
    }
}
