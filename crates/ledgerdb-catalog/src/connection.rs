//! Coalesces every client's connection count for one page into a single
//! open/unused transition (spec §4.2's `PageConnectionNotifier`):
//! `LedgerManager` holds at most one `PageStorage` per page no matter how
//! many external callers and internal callers (e.g. a pending sync) are
//! using it concurrently.

use parking_lot::Mutex;

/// What a connection-count change means for the page as a whole.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ConnectionEvent {
    /// No transition: some other connection is still (or was already) open.
    None,
    /// The page went from zero connections to one.
    Opened,
    /// The page went from one connection to zero.
    Unused,
}

#[derive(Default)]
struct Counts {
    external: u64,
    internal: u64,
}

impl Counts {
    fn total(&self) -> u64 {
        self.external + self.internal
    }
}

/// Tracks external (client-visible) and internal (e.g. sync-driven)
/// connections to one page and reports the open/0-to-1 and
/// unused/1-to-0 transitions a single shared `PageStorage` needs.
#[derive(Default)]
pub struct PageConnectionNotifier {
    counts: Mutex<Counts>,
}

impl PageConnectionNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new external (client) connection.
    pub fn external_open(&self) -> ConnectionEvent {
        let mut counts = self.counts.lock();
        let was_zero = counts.total() == 0;
        counts.external += 1;
        if was_zero {
            ConnectionEvent::Opened
        } else {
            ConnectionEvent::None
        }
    }

    /// Releases one external connection.
    pub fn external_close(&self) -> ConnectionEvent {
        let mut counts = self.counts.lock();
        debug_assert!(counts.external > 0, "external_close without a matching external_open");
        counts.external = counts.external.saturating_sub(1);
        if counts.total() == 0 {
            ConnectionEvent::Unused
        } else {
            ConnectionEvent::None
        }
    }

    /// Registers a new internal connection (held by sync or cleanup bookkeeping).
    pub fn internal_acquire(&self) -> ConnectionEvent {
        let mut counts = self.counts.lock();
        let was_zero = counts.total() == 0;
        counts.internal += 1;
        if was_zero {
            ConnectionEvent::Opened
        } else {
            ConnectionEvent::None
        }
    }

    /// Releases one internal connection.
    pub fn internal_release(&self) -> ConnectionEvent {
        let mut counts = self.counts.lock();
        debug_assert!(counts.internal > 0, "internal_release without a matching internal_acquire");
        counts.internal = counts.internal.saturating_sub(1);
        if counts.total() == 0 {
            ConnectionEvent::Unused
        } else {
            ConnectionEvent::None
        }
    }

    /// True while at least one external connection is open.
    pub fn is_externally_open(&self) -> bool {
        self.counts.lock().external > 0
    }

    /// Total connections, external and internal.
    pub fn total_connections(&self) -> u64 {
        self.counts.lock().total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_open_of_any_kind_reports_opened() {
        let notifier = PageConnectionNotifier::new();
        assert_eq!(notifier.external_open(), ConnectionEvent::Opened);
        assert_eq!(notifier.internal_acquire(), ConnectionEvent::None);
    }

    #[test]
    fn last_close_of_any_kind_reports_unused() {
        let notifier = PageConnectionNotifier::new();
        notifier.external_open();
        notifier.internal_acquire();
        assert_eq!(notifier.internal_release(), ConnectionEvent::None);
        assert_eq!(notifier.external_close(), ConnectionEvent::Unused);
    }

    #[test]
    fn external_open_state_tracks_only_external_connections() {
        let notifier = PageConnectionNotifier::new();
        notifier.internal_acquire();
        assert!(!notifier.is_externally_open());
        notifier.external_open();
        assert!(notifier.is_externally_open());
    }
}
