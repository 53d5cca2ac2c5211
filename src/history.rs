//! Fixed-size record of blocked connections and DNS queries.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

/// Default number of entries kept.
pub const DEFAULT_REJECT_HISTORY_SIZE: usize = 500;

/// One blocked request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectEntry {
    /// `tcp`, `udp` or `dns`
    pub network: &'static str,
    pub host: String,
    pub process: Option<String>,
    pub time: SystemTime,
}

/// Ring buffer of [`RejectEntry`].
///
/// Writers claim a slot with one atomic increment and lock only that slot.
#[derive(Debug)]
pub struct RejectHistory {
    slots: Box<[Mutex<Option<RejectEntry>>]>,
    next: AtomicUsize,
}

impl Default for RejectHistory {
    fn default() -> Self {
        Self::new(DEFAULT_REJECT_HISTORY_SIZE)
    }
}

impl RejectHistory {
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1)).map(|_| Mutex::new(None)).collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, network: &'static str, host: impl Into<String>, process: Option<String>) {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        *self.slots[index].lock() = Some(RejectEntry {
            network,
            host: host.into(),
            process,
            time: SystemTime::now(),
        });
    }

    /// Entries oldest first.
    pub fn entries(&self) -> Vec<RejectEntry> {
        let start = self.next.load(Ordering::Relaxed) % self.slots.len();
        let (newer, older) = self.slots.split_at(start);
        older
            .iter()
            .chain(newer)
            .filter_map(|slot| slot.lock().clone())
            .collect()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Total pushes since creation, including overwritten ones.
    pub fn total(&self) -> usize {
        self.next.load(Ordering::Relaxed)
    }
}
