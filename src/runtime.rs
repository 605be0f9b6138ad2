//! The seam to the embedding collector. Everything the pool needs from the
//! outside world comes in through static methods on one trait, so a test can
//! inject mock collaborators by instantiating the pool over a mock runtime.

use std::sync::Arc;

use crate::forwarding::Forwarding;
use crate::page::{AllocFlags, Page, PageAge, PageType};
use crate::util::Address;

pub trait Runtime: 'static + Sized + Send + Sync {
    /// Allocate a fresh page from the underlying page allocator. A
    /// non-blocking request may fail.
    fn alloc_page(ptype: PageType, size: usize, flags: AllocFlags, age: PageAge)
        -> Option<Arc<Page>>;

    /// Return a single empty page to the underlying allocator.
    fn free_page(page: Arc<Page>);

    /// Return a batch of empty pages. Called with no pool lock held.
    fn free_empty_pages(pages: Vec<Arc<Page>>);

    /// Rewrite the page's surviving objects within its own storage. Must
    /// leave the page's bump pointer immediately past the survivors (so the
    /// page can serve as an evacuation target) and return the surviving
    /// byte count.
    fn compact_in_place(forwarding: &Forwarding) -> usize;

    /// Generation phase oracle.
    fn is_phase_mark_complete() -> bool;

    fn cpu_id() -> usize;
    fn cpu_count() -> usize;

    fn object_size(addr: Address) -> usize;

    /// Copy `size` bytes between non-overlapping regions.
    fn object_copy_disjoint(from: Address, to: Address, size: usize);
}
