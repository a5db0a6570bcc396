//! Single consumer event loop for marshalling callbacks.
//!
//! Callback threads never touch object state directly. They queue their
//! notification on the object, then [`post`](EventLoopHandle::post) the
//! object's id to the loop. The thread owning the [`EventLoop`] drains those
//! posts in order and asks each object to process its queue, and fires any
//! connection timers that have expired.
use std::{
    collections::HashMap,
    future,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::event_filter::{EventFilter, LoopId};

/// Something that can receive events from an [`EventLoop`]
pub trait EventTarget: Send + Sync {
    /// Handle the next queued notification
    fn process_event(&self);
    /// The connection timer started for this target has run out
    fn timer_expired(&self);
}

enum LoopMessage {
    Posted(u64),
    /// Timers changed; recompute the next deadline
    Wake,
}

#[derive(Default)]
struct LoopShared {
    targets: Mutex<HashMap<u64, Weak<dyn EventTarget>>>,
    timers: Mutex<HashMap<u64, Instant>>,
}

impl LoopShared {
    fn targets(&self) -> MutexGuard<'_, HashMap<u64, Weak<dyn EventTarget>>> {
        self.targets.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn timers(&self) -> MutexGuard<'_, HashMap<u64, Instant>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable, thread-safe access to an [`EventLoop`]
#[derive(Clone)]
pub struct EventLoopHandle {
    id: LoopId,
    sender: mpsc::UnboundedSender<LoopMessage>,
    shared: Arc<LoopShared>,
}

impl EventLoopHandle {
    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Notify the loop that `object` has something queued
    pub fn post(&self, object: u64) {
        if self.sender.send(LoopMessage::Posted(object)).is_err() {
            trace!("Event loop {} has gone; dropping post for {object}", self.id);
        }
    }

    pub fn register(&self, object: u64, target: Weak<dyn EventTarget>) {
        self.shared.targets().insert(object, target);
    }

    pub fn unregister(&self, object: u64) {
        self.shared.targets().remove(&object);
        self.shared.timers().remove(&object);
    }

    /// Start, or restart, the connection timer for `object`
    pub fn start_timer(&self, object: u64, timeout: Duration) {
        self.shared.timers().insert(object, Instant::now() + timeout);
        let _ = self.sender.send(LoopMessage::Wake);
    }

    pub fn stop_timer(&self, object: u64) {
        self.shared.timers().remove(&object);
    }

    pub fn has_timer(&self, object: u64) -> bool {
        self.shared.timers().contains_key(&object)
    }
}

/// The consuming side of the loop
pub struct EventLoop {
    id: LoopId,
    filter: Arc<EventFilter>,
    receiver: mpsc::UnboundedReceiver<LoopMessage>,
    handle: EventLoopHandle,
}

impl EventLoop {
    pub fn new(filter: Arc<EventFilter>) -> Self {
        let id = filter.allocate_loop_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        EventLoop {
            id,
            filter,
            receiver,
            handle: EventLoopHandle {
                id,
                sender,
                shared: Arc::new(LoopShared::default()),
            },
        }
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    fn dispatch(&self, object: u64) -> bool {
        if !self.filter.is_installed(self.id) {
            trace!("No filter installed on loop {}; discarding event", self.id);
            return false;
        }
        let target = self.handle.shared.targets().get(&object).cloned();
        match target.and_then(|t| t.upgrade()) {
            Some(target) => {
                target.process_event();
                true
            }
            None => {
                trace!("Discarding event for departed object {object}");
                false
            }
        }
    }

    fn fire_timers(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let mut timers = self.handle.shared.timers();
            let expired: Vec<u64> = timers
                .iter()
                .filter(|(_, deadline)| **deadline <= now)
                .map(|(object, _)| *object)
                .collect();
            for object in &expired {
                timers.remove(object);
            }
            expired
        };
        for object in expired {
            let target = self.handle.shared.targets().get(&object).cloned();
            if let Some(target) = target.and_then(|t| t.upgrade()) {
                debug!("Connection timer expired for object {object}");
                target.timer_expired();
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.handle.shared.timers().values().min().copied()
    }

    /// Dispatch everything posted so far and fire expired timers
    ///
    /// Returns the number of events delivered.
    pub fn process_pending(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(message) = self.receiver.try_recv() {
            if let LoopMessage::Posted(object) = message
                && self.dispatch(object)
            {
                delivered += 1;
            }
        }
        self.fire_timers();
        delivered
    }

    /// Run until cancelled, sleeping until the next post or timer deadline
    pub async fn run(&mut self, cancel: CancellationToken) {
        loop {
            self.process_pending();
            let deadline = self.next_deadline();
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = self.receiver.recv() => message,
                _ = sleep_until(deadline) => continue,
            };
            match message {
                Some(LoopMessage::Posted(object)) => {
                    self.dispatch(object);
                }
                Some(LoopMessage::Wake) => (),
                None => break,
            }
        }
        debug!("Event loop {} stopped", self.id);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counter {
        events: AtomicUsize,
        timers: AtomicUsize,
    }

    impl EventTarget for Counter {
        fn process_event(&self) {
            self.events.fetch_add(1, Ordering::SeqCst);
        }
        fn timer_expired(&self) {
            self.timers.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn target(counter: &Arc<Counter>) -> Weak<dyn EventTarget> {
        let target: Arc<dyn EventTarget> = counter.clone();
        Arc::downgrade(&target)
    }

    #[test]
    fn dispatch_requires_filter_and_target() {
        let filter = Arc::new(EventFilter::new());
        let mut event_loop = EventLoop::new(filter.clone());
        let handle = event_loop.handle();
        let counter = Arc::new(Counter::default());
        handle.register(1, target(&counter));

        handle.post(1);
        assert_eq!(event_loop.process_pending(), 0);

        filter.add_filter(event_loop.id());
        handle.post(1);
        handle.post(1);
        handle.post(2);
        assert_eq!(event_loop.process_pending(), 2);
        assert_eq!(counter.events.load(Ordering::SeqCst), 2);

        handle.unregister(1);
        handle.post(1);
        assert_eq!(event_loop.process_pending(), 0);
    }

    #[test]
    fn dropped_target_is_skipped() {
        let filter = Arc::new(EventFilter::new());
        let mut event_loop = EventLoop::new(filter.clone());
        filter.add_filter(event_loop.id());
        let counter = Arc::new(Counter::default());
        event_loop.handle().register(5, target(&counter));
        drop(counter);
        event_loop.handle().post(5);
        assert_eq!(event_loop.process_pending(), 0);
    }

    #[test]
    fn timers_fire_once() {
        let filter = Arc::new(EventFilter::new());
        let mut event_loop = EventLoop::new(filter);
        let handle = event_loop.handle();
        let counter = Arc::new(Counter::default());
        handle.register(3, target(&counter));
        handle.start_timer(3, Duration::ZERO);
        assert!(handle.has_timer(3));
        event_loop.process_pending();
        event_loop.process_pending();
        assert_eq!(counter.timers.load(Ordering::SeqCst), 1);
        assert!(!handle.has_timer(3));

        handle.start_timer(3, Duration::from_secs(60));
        handle.stop_timer(3);
        event_loop.process_pending();
        assert_eq!(counter.timers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_wakes_for_timers_and_cancels() {
        let filter = Arc::new(EventFilter::new());
        let mut event_loop = EventLoop::new(filter.clone());
        filter.add_filter(event_loop.id());
        let handle = event_loop.handle();
        let counter = Arc::new(Counter::default());
        handle.register(1, target(&counter));
        handle.start_timer(1, Duration::from_millis(20));
        handle.post(1);

        let cancel = CancellationToken::new();
        let stopper = cancel.clone();
        let watched = counter.clone();
        tokio::spawn(async move {
            while watched.timers.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            stopper.cancel();
        });
        tokio::time::timeout(Duration::from_secs(5), event_loop.run(cancel))
            .await
            .unwrap();
        assert_eq!(counter.events.load(Ordering::SeqCst), 1);
        assert_eq!(counter.timers.load(Ordering::SeqCst), 1);
    }
}
