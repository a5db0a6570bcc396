//! What a [`QcaObject`](crate::QcaObject) emits, and how.
//!
//! Every signal goes out on a [`SignalPair`]: an unbounded channel per
//! receiver for those that want every emission in order, and a watch channel
//! holding the latest one for receivers that only care about the current
//! state. A slow receiver only grows its own queue; nothing is dropped.
use std::{
    fmt,
    sync::{Mutex, PoisonError},
    time::SystemTime,
};

use tokio::sync::{mpsc, watch};

use crate::{
    alarm::AlarmInfo,
    connection::{ChannelState, LinkState},
    generic::Generic,
};

#[derive(Debug)]
pub struct SignalPair<T>
where
    T: Clone,
{
    listeners: Mutex<Vec<mpsc::UnboundedSender<T>>>,
    watch: watch::Sender<Option<T>>,
}

impl<T> SignalPair<T>
where
    T: Clone,
{
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            watch: watch::Sender::new(None),
        }
    }

    /// Emit a value to all receivers, and return the number of listeners
    ///
    /// The latest value is kept even if nobody is listening yet. Receivers
    /// that have been dropped are forgotten.
    pub fn send(&self, value: T) -> usize {
        self.watch.send_replace(Some(value.clone()));
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        listeners.retain(|listener| listener.send(value.clone()).is_ok());
        listeners.len() + self.watch.receiver_count()
    }

    /// Receive every value sent from now on
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn watch(&self) -> watch::Receiver<Option<T>> {
        self.watch.subscribe()
    }

    pub fn latest(&self) -> Option<T> {
        self.watch.borrow().clone()
    }
}

impl<T> Default for SignalPair<T>
where
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A new value, with the alarm state and time it carried
#[derive(Debug, Clone, PartialEq)]
pub struct DataUpdate {
    /// Absent when a read or subscription failed
    pub value: Option<Generic>,
    pub alarm: AlarmInfo,
    pub timestamp: SystemTime,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub channel_state: ChannelState,
    pub link_state: LinkState,
}

impl ConnectionInfo {
    pub fn is_channel_connected(&self) -> bool {
        self.channel_state == ChannelState::Connected
    }
    pub fn is_link_up(&self) -> bool {
        self.link_state == LinkState::Up
    }
}

impl Default for ConnectionInfo {
    fn default() -> Self {
        ConnectionInfo {
            channel_state: ChannelState::NeverConnected,
            link_state: LinkState::Down,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Warning,
    Error,
}

/// A message meant for the person using the widget
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub kind: MessageKind,
    pub text: String,
    /// The PV the message concerns
    pub source: String,
}

impl UserMessage {
    pub fn warning(source: &str, text: impl Into<String>) -> Self {
        UserMessage {
            kind: MessageKind::Warning,
            text: text.into(),
            source: source.to_string(),
        }
    }
    pub fn error(source: &str, text: impl Into<String>) -> Self {
        UserMessage {
            kind: MessageKind::Error,
            text: text.into(),
            source: source.to_string(),
        }
    }
}

impl fmt::Display for UserMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            MessageKind::Warning => "Warning",
            MessageKind::Error => "Error",
        };
        write!(f, "{kind}: {} ({})", self.text, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_kept_without_listeners() {
        let signal = SignalPair::new();
        assert_eq!(signal.send(1u32), 0);
        assert_eq!(signal.latest(), Some(1));
        let mut receiver = signal.subscribe();
        let watcher = signal.watch();
        assert_eq!(signal.send(2), 2);
        assert_eq!(receiver.try_recv().unwrap(), 2);
        assert_eq!(*watcher.borrow(), Some(2));
    }

    #[test]
    fn slow_receivers_lose_nothing() {
        let signal = SignalPair::new();
        let mut receiver = signal.subscribe();
        for n in 0..1000u32 {
            signal.send(n);
        }
        let received: Vec<u32> = std::iter::from_fn(|| receiver.try_recv().ok()).collect();
        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn dropped_receivers_are_forgotten() {
        let signal = SignalPair::new();
        let receiver = signal.subscribe();
        let mut kept = signal.subscribe();
        assert_eq!(signal.send(1u32), 2);
        drop(receiver);
        assert_eq!(signal.send(2), 1);
        assert_eq!(kept.try_recv().unwrap(), 1);
        assert_eq!(kept.try_recv().unwrap(), 2);
    }
}
