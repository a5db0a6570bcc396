//! Reference counted registration of event loops as dispatch targets.
//!
//! Objects living on an event loop register with the filter when created and
//! deregister when dropped. The loop only dispatches posted events while at
//! least one registration for it remains, so events arriving after the last
//! object has gone are discarded.
use std::{
    collections::HashMap,
    sync::{
        Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::debug;

/// Identifies an [`EventLoop`](crate::event_loop::EventLoop)
pub type LoopId = u64;

#[derive(Default)]
pub struct EventFilter {
    registrations: Mutex<HashMap<LoopId, usize>>,
    next_loop: AtomicU64,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<LoopId, usize>> {
        self.registrations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue the id for a new event loop
    pub fn allocate_loop_id(&self) -> LoopId {
        self.next_loop.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Register one more user of `loop_id`
    ///
    /// Returns true if this installed the filter, i.e. it was the first.
    pub fn add_filter(&self, loop_id: LoopId) -> bool {
        let mut registrations = self.lock();
        let count = registrations.entry(loop_id).or_insert(0);
        *count += 1;
        if *count == 1 {
            debug!("Installed event filter on loop {loop_id}");
            true
        } else {
            false
        }
    }

    /// Drop one user of `loop_id`
    ///
    /// Returns true if this removed the filter, i.e. it was the last.
    pub fn delete_filter(&self, loop_id: LoopId) -> bool {
        let mut registrations = self.lock();
        let Some(count) = registrations.get_mut(&loop_id) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            registrations.remove(&loop_id);
            debug!("Removed event filter from loop {loop_id}");
            true
        } else {
            false
        }
    }

    pub fn is_installed(&self, loop_id: LoopId) -> bool {
        self.lock().contains_key(&loop_id)
    }

    pub fn ref_count(&self, loop_id: LoopId) -> usize {
        self.lock().get(&loop_id).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_installed_while_referenced() {
        let filter = EventFilter::new();
        assert!(!filter.is_installed(1));
        assert!(filter.add_filter(1));
        assert!(!filter.add_filter(1));
        assert!(filter.add_filter(2));
        assert_eq!(filter.ref_count(1), 2);

        assert!(!filter.delete_filter(1));
        assert!(filter.is_installed(1));
        assert!(filter.delete_filter(1));
        assert!(!filter.is_installed(1));
        assert_eq!(filter.ref_count(1), 0);
        // Unbalanced removal does nothing
        assert!(!filter.delete_filter(1));
        assert!(filter.is_installed(2));
    }
}
