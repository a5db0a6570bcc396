//! Callback handles that survive their owner.
//!
//! Every native CA request carries a single `u64` word of user data, handed
//! back verbatim when the library calls us from one of its own threads. That
//! callback may arrive after the object that made the request has been torn
//! down, so the word cannot be a pointer. Instead it is an encoded [`CaRef`],
//! an index into a [`CaRefRegistry`] slot plus the slot generation at the time
//! of issue.
//!
//! Discarding a handle bumps the slot generation, so any callback still in
//! flight resolves to `None` and is dropped. Discarded slots are kept on a FIFO
//! free list and are only recycled after a grace period, so that a recycled
//! slot is never handed out while the library may still be delivering for
//! its previous user.
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use tracing::{debug, error, warn};

/// A generation-tagged handle into a [`CaRefRegistry`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CaRef {
    pub index: u32,
    pub generation: u32,
}

impl CaRef {
    /// Pack into the user data word passed through the native library
    pub fn to_user_data(self) -> u64 {
        (u64::from(self.index) << 32) | u64::from(self.generation)
    }
    pub fn from_user_data(user: u64) -> Self {
        CaRef {
            index: (user >> 32) as u32,
            generation: (user & 0xFFFF_FFFF) as u32,
        }
    }
}

impl fmt::Display for CaRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    owner: Weak<T>,
    /// Channel the owner is using, once the native library has issued one
    channel: Option<u64>,
    discarded: bool,
    idle_since: Option<Instant>,
    /// PV name, for diagnostics only
    pv: String,
}

struct Slots<T> {
    slots: Vec<Slot<T>>,
    free_list: VecDeque<u32>,
}

/// Arena of [`CaRef`] slots, shared between the consumer and callback threads
pub struct CaRefRegistry<T> {
    inner: Mutex<Slots<T>>,
    reuse_grace: Duration,
}

impl<T> CaRefRegistry<T> {
    pub fn new(reuse_grace: Duration) -> Self {
        CaRefRegistry {
            inner: Mutex::new(Slots {
                slots: Vec::new(),
                free_list: VecDeque::new(),
            }),
            reuse_grace,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn reuse_grace(&self) -> Duration {
        self.reuse_grace
    }

    /// Issue a handle for `owner`
    ///
    /// The oldest discarded slot is recycled if it has been idle for longer
    /// than the grace period, otherwise a new slot is allocated.
    pub fn acquire(&self, owner: &Arc<T>) -> CaRef {
        let mut inner = self.lock();
        let reusable = inner.free_list.front().is_some_and(|&index| {
            inner.slots[index as usize]
                .idle_since
                .is_some_and(|idle| idle.elapsed() >= self.reuse_grace)
        });
        if reusable && let Some(index) = inner.free_list.pop_front() {
            let slot = &mut inner.slots[index as usize];
            slot.owner = Arc::downgrade(owner);
            slot.channel = None;
            slot.discarded = false;
            slot.idle_since = None;
            slot.pv.clear();
            debug!("Reusing CaRef slot {index} at generation {}", slot.generation);
            return CaRef {
                index,
                generation: slot.generation,
            };
        }
        let index = inner.slots.len() as u32;
        inner.slots.push(Slot {
            generation: 0,
            owner: Arc::downgrade(owner),
            channel: None,
            discarded: false,
            idle_since: None,
            pv: String::new(),
        });
        CaRef {
            index,
            generation: 0,
        }
    }

    /// Retire a handle. Any callback still carrying it will no longer resolve.
    ///
    /// Returns false if the handle was already stale.
    pub fn discard(&self, caref: CaRef) -> bool {
        let mut inner = self.lock();
        let Some(slot) = inner.slots.get_mut(caref.index as usize) else {
            error!("Attempt to discard CaRef {caref} outside the registry");
            return false;
        };
        if slot.discarded || slot.generation != caref.generation {
            warn!("CaRef {caref} discarded twice");
            return false;
        }
        slot.discarded = true;
        slot.idle_since = Some(Instant::now());
        slot.generation = slot.generation.wrapping_add(1);
        slot.owner = Weak::new();
        inner.free_list.push_back(caref.index);
        true
    }

    /// Find the owner of a handle arriving with a callback for `channel`
    ///
    /// Returns `None` for anything that should not be delivered: handles that
    /// were never issued, late callbacks for discarded handles, callbacks
    /// without a channel or for a channel other than the one recorded, and
    /// owners that have already been dropped.
    pub fn resolve(&self, caref: CaRef, channel: u64) -> Option<Arc<T>> {
        let inner = self.lock();
        let Some(slot) = inner.slots.get(caref.index as usize) else {
            error!("Callback with corrupt CaRef {caref}; ignoring");
            return None;
        };
        if slot.discarded || slot.generation != caref.generation {
            warn!(
                "Dropping late callback for discarded CaRef {caref} (slot now generation {}, PV '{}')",
                slot.generation, slot.pv
            );
            return None;
        }
        if channel == 0 {
            warn!("Dropping callback for CaRef {caref} with no channel");
            return None;
        }
        if let Some(recorded) = slot.channel
            && recorded != channel
        {
            warn!(
                "Dropping very late callback for CaRef {caref}: channel {channel} is not current channel {recorded}"
            );
            return None;
        }
        let owner = slot.owner.upgrade();
        if owner.is_none() {
            warn!("Dropping callback for CaRef {caref}: owner has gone");
        }
        owner
    }

    /// Record the channel the owner is now using
    pub fn set_channel(&self, caref: CaRef, channel: u64) -> bool {
        let mut inner = self.lock();
        match inner.slots.get_mut(caref.index as usize) {
            Some(slot) if !slot.discarded && slot.generation == caref.generation => {
                slot.channel = Some(channel);
                true
            }
            _ => false,
        }
    }

    pub fn set_pv(&self, caref: CaRef, pv: &str) {
        let mut inner = self.lock();
        if let Some(slot) = inner.slots.get_mut(caref.index as usize)
            && slot.generation == caref.generation
        {
            slot.pv = pv.to_string();
        }
    }

    pub fn pv(&self, caref: CaRef) -> Option<String> {
        let inner = self.lock();
        inner
            .slots
            .get(caref.index as usize)
            .filter(|slot| slot.generation == caref.generation)
            .map(|slot| slot.pv.clone())
    }

    /// Number of slots ever allocated
    pub fn capacity(&self) -> usize {
        self.lock().slots.len()
    }

    /// Number of handles currently issued
    pub fn in_use(&self) -> usize {
        let inner = self.lock();
        inner.slots.len() - inner.free_list.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tracing_test::traced_test;

    #[test]
    fn user_data_word() {
        let caref = CaRef {
            index: 7,
            generation: u32::MAX,
        };
        assert_eq!(CaRef::from_user_data(caref.to_user_data()), caref);
    }

    #[test]
    fn resolves_until_discarded() {
        let registry = CaRefRegistry::new(Duration::from_secs(5));
        let owner = Arc::new("owner");
        let caref = registry.acquire(&owner);
        assert!(registry.set_channel(caref, 11));
        assert_eq!(registry.resolve(caref, 11).as_deref(), Some(&"owner"));
        assert!(registry.discard(caref));
        assert!(registry.resolve(caref, 11).is_none());
        assert!(!registry.discard(caref));
        assert!(!registry.set_channel(caref, 12));
    }

    #[traced_test]
    #[test]
    fn late_callback_is_logged() {
        let registry = CaRefRegistry::new(Duration::from_secs(5));
        let owner = Arc::new(1u8);
        let caref = registry.acquire(&owner);
        registry.set_pv(caref, "TEST:PV");
        registry.discard(caref);
        assert!(registry.resolve(caref, 3).is_none());
        assert!(logs_contain("Dropping late callback"));
    }

    #[test]
    fn rejects_bad_callbacks() {
        let registry = CaRefRegistry::new(Duration::from_secs(5));
        let owner = Arc::new(());
        let caref = registry.acquire(&owner);
        // Before a channel is recorded any nonzero channel is accepted
        assert!(registry.resolve(caref, 4).is_some());
        registry.set_channel(caref, 5);
        assert!(registry.resolve(caref, 0).is_none());
        assert!(registry.resolve(caref, 4).is_none());
        assert!(
            registry
                .resolve(
                    CaRef {
                        index: 99,
                        generation: 0
                    },
                    5
                )
                .is_none()
        );
        drop(owner);
        assert!(registry.resolve(caref, 5).is_none());
    }

    #[test]
    fn slots_reused_only_after_grace() {
        let registry = CaRefRegistry::new(Duration::from_secs(3600));
        let owner = Arc::new(());
        let first = registry.acquire(&owner);
        registry.discard(first);
        let second = registry.acquire(&owner);
        assert_ne!(first.index, second.index);
        assert_eq!(registry.capacity(), 2);
        assert_eq!(registry.in_use(), 1);
    }

    #[test]
    fn reuse_is_fifo_with_fresh_state() {
        let registry = CaRefRegistry::new(Duration::ZERO);
        let owner = Arc::new(());
        let a = registry.acquire(&owner);
        let b = registry.acquire(&owner);
        registry.set_pv(a, "A");
        registry.set_channel(a, 100);
        registry.discard(a);
        registry.discard(b);

        let reused = registry.acquire(&owner);
        assert_eq!(reused.index, a.index);
        assert_ne!(reused.generation, a.generation);
        assert_eq!(registry.pv(reused).as_deref(), Some(""));
        // The recorded channel was cleared, so a new one is accepted
        assert!(registry.resolve(reused, 200).is_some());
        assert!(registry.resolve(a, 100).is_none());
        assert_eq!(registry.acquire(&owner).index, b.index);
    }

    #[test]
    fn concurrent_acquire_and_discard() {
        let registry = Arc::new(CaRefRegistry::new(Duration::ZERO));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    let owner = Arc::new(());
                    for _ in 0..100 {
                        let caref = registry.acquire(&owner);
                        assert!(registry.resolve(caref, 1).is_some());
                        assert!(registry.discard(caref));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(registry.in_use(), 0);
    }
}
