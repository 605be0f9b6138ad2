//! Free-list shards for recycled empty pages. One shard per CPU plus a
//! shared shard; sharding keeps the hot recycle path off a single lock.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::page::Page;

pub struct FreeList {
    list: Mutex<Vec<Arc<Page>>>,
}

impl FreeList {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, page: Arc<Page>) {
        self.list.lock().unwrap().push(page);
    }

    /// Producer path: never blocks. On contention the page is handed back to
    /// the caller to dispose of.
    pub fn try_push(&self, page: Arc<Page>) -> Result<(), Arc<Page>> {
        match self.list.try_lock() {
            Ok(mut guard) => {
                guard.push(page);
                Ok(())
            }
            Err(_) => Err(page),
        }
    }

    pub fn pop(&self) -> Option<Arc<Page>> {
        self.list.lock().unwrap().pop()
    }

    pub fn len(&self) -> usize {
        self.list.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().unwrap().is_empty()
    }

    pub fn locked(&self) -> MutexGuard<'_, Vec<Arc<Page>>> {
        self.list.lock().unwrap()
    }

    /// Drain every page, delivering them in batches with the shard lock
    /// dropped across the callback so producers are not blocked behind the
    /// external allocator.
    pub fn drain_batched(&self, batch_size: usize, mut flush: impl FnMut(Vec<Arc<Page>>)) {
        debug_assert!(batch_size > 0);
        let mut batch = Vec::new();
        let mut guard = self.list.lock().unwrap();
        loop {
            let page = match guard.pop() {
                Some(page) => page,
                None => break,
            };
            drop(guard);

            batch.push(page);
            if batch.len() == batch_size {
                flush(std::mem::take(&mut batch));
            }

            guard = match self.list.try_lock() {
                Ok(reacquired) => reacquired,
                Err(_) => {
                    // A producer holds the shard; flush what we have before
                    // parking behind them.
                    if !batch.is_empty() {
                        flush(std::mem::take(&mut batch));
                    }
                    self.list.lock().unwrap()
                }
            };
        }
        drop(guard);
        if !batch.is_empty() {
            flush(batch);
        }
    }
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageAge;
    use crate::util::Address;

    fn page(index: usize) -> Arc<Page> {
        Arc::new(Page::new(
            unsafe { Address::from_usize(0x100000 + index * 0x1000) },
            0x1000,
            PageAge::Eden,
        ))
    }

    #[test]
    fn push_pop() {
        let list = FreeList::new();
        assert!(list.is_empty());
        let p = page(0);
        list.push(p.clone());
        assert_eq!(list.len(), 1);
        let popped = list.pop().unwrap();
        assert!(Arc::ptr_eq(&p, &popped));
        assert!(list.pop().is_none());
    }

    #[test]
    fn try_push_succeeds_uncontended() {
        let list = FreeList::new();
        assert!(list.try_push(page(0)).is_ok());
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn try_push_returns_the_page_on_contention() {
        let list = FreeList::new();
        let guard = list.locked();
        let p = page(0);
        let rejected = list.try_push(p.clone()).unwrap_err();
        assert!(Arc::ptr_eq(&p, &rejected));
        drop(guard);
        assert!(list.try_push(p).is_ok());
    }

    #[test]
    fn drain_batches_at_the_boundary() {
        let list = FreeList::new();
        for i in 0..10 {
            list.push(page(i));
        }
        let mut batches = Vec::new();
        list.drain_batched(4, |batch| batches.push(batch.len()));
        assert_eq!(batches, vec![4, 4, 2]);
        assert!(list.is_empty());
    }

    #[test]
    fn drain_of_empty_list_flushes_nothing() {
        let list = FreeList::new();
        let mut calls = 0;
        list.drain_batched(4, |_| calls += 1);
        assert_eq!(calls, 0);
    }
}
