//! Blocks new page opens while a deletion is in flight (spec §4.2's
//! `DeletePageStorage`: "marks the page busy, waits for it to close,
//! deletes its storage, then releases waiters").

use std::collections::HashMap;

use ledgerdb_types::PageId;
use parking_lot::Mutex;

type Waiter = Box<dyn FnOnce() + Send>;

/// Tracks which pages are currently busy (storage being deleted) and
/// queues callbacks to run once each becomes available again.
#[derive(Default)]
pub struct PageAvailabilityManager {
    busy: Mutex<HashMap<PageId, Vec<Waiter>>>,
}

impl PageAvailabilityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `page_id` busy. Idempotent.
    pub fn mark_busy(&self, page_id: PageId) {
        self.busy.lock().entry(page_id).or_default();
    }

    pub fn is_busy(&self, page_id: &PageId) -> bool {
        self.busy.lock().contains_key(page_id)
    }

    /// Runs `callback` now if `page_id` isn't busy, or queues it to run
    /// the next time [`Self::mark_available`] is called for that page.
    pub fn on_page_available(&self, page_id: PageId, callback: impl FnOnce() + Send + 'static) {
        let mut guard = self.busy.lock();
        if let Some(waiters) = guard.get_mut(&page_id) {
            waiters.push(Box::new(callback));
            return;
        }
        drop(guard);
        callback();
    }

    /// Clears the busy mark and returns every callback queued while it was set.
    /// Callers run the returned waiters outside of any lock this manager holds.
    #[must_use]
    pub fn mark_available(&self, page_id: &PageId) -> Vec<Waiter> {
        self.busy.lock().remove(page_id).unwrap_or_default()
    }
}
