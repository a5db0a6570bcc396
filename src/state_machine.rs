//! Request state machines for connection, subscription, read and write.
//!
//! Each machine holds the state it is in, the last state requested, and three
//! flags shared by all of them: `pending` (a request is with the library),
//! `active` (the library has confirmed it, set by the caller from callbacks)
//! and `expired` (the connection timer fired). The transition rules live on
//! the state enums via [`MachineState`]; the side effects are performed
//! through [`MachineOps`] by whoever owns the machine.
use std::fmt;

use tracing::{debug, trace};

/// Side effects a state machine may ask its owner to perform
pub trait MachineOps {
    /// Returns false if the channel could not be created
    fn create_channel(&mut self) -> bool;
    fn delete_channel(&mut self);
    fn start_connection_timer(&mut self);
    fn stop_connection_timer(&mut self);
    fn create_subscription(&mut self) -> bool;
    fn read_channel(&mut self) -> bool;
    fn write_channel(&mut self) -> bool;
}

/// A family of states with their transition rule
pub trait MachineState: Copy + Eq + fmt::Debug {
    const INITIAL: Self;

    /// Apply `requested` to the machine. `connected` is whether the channel
    /// is currently connected. Returns false if the request was rejected.
    fn transition<O: MachineOps>(
        machine: &mut StateMachine<Self>,
        requested: Self,
        connected: bool,
        ops: &mut O,
    ) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateMachine<S> {
    pub current: S,
    pub requested: S,
    pub pending: bool,
    pub active: bool,
    pub expired: bool,
    /// A request arrived while disconnected and waits for the connection
    pub deferred: bool,
}

impl<S: MachineState> Default for StateMachine<S> {
    fn default() -> Self {
        StateMachine {
            current: S::INITIAL,
            requested: S::INITIAL,
            pending: false,
            active: false,
            expired: false,
            deferred: false,
        }
    }
}

impl<S: MachineState> StateMachine<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn process<O: MachineOps>(&mut self, requested: S, connected: bool, ops: &mut O) -> bool {
        self.requested = requested;
        let from = self.current;
        let accepted = S::transition(self, requested, connected, ops);
        if from != self.current {
            debug!("{from:?} -> {:?} (requested {requested:?})", self.current);
        } else if !accepted {
            trace!("{from:?}: request {requested:?} rejected");
        }
        accepted
    }

    /// Clear a deferred request, returning whether there was one
    pub fn take_deferred(&mut self) -> bool {
        std::mem::take(&mut self.deferred)
    }

    /// Return to the initial state, forgetting any request
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    ConnectFail,
    ConnectionExpired,
}

impl ConnectionState {
    fn create<O: MachineOps>(machine: &mut StateMachine<Self>, ops: &mut O) -> bool {
        if ops.create_channel() {
            machine.pending = true;
            machine.current = ConnectionState::Disconnected;
            ops.start_connection_timer();
            true
        } else {
            machine.pending = false;
            machine.current = ConnectionState::ConnectFail;
            false
        }
    }
}

impl MachineState for ConnectionState {
    const INITIAL: Self = ConnectionState::Disconnected;

    fn transition<O: MachineOps>(
        machine: &mut StateMachine<Self>,
        requested: Self,
        _connected: bool,
        ops: &mut O,
    ) -> bool {
        use ConnectionState::*;
        match (machine.current, requested) {
            (Disconnected, Connected) => {
                if machine.active {
                    machine.pending = false;
                    ops.stop_connection_timer();
                    machine.current = Connected;
                    true
                } else if !machine.pending {
                    Self::create(machine, ops)
                } else {
                    false
                }
            }
            (Disconnected, ConnectionExpired) => {
                if machine.pending && machine.expired {
                    machine.pending = false;
                    machine.expired = false;
                    ops.stop_connection_timer();
                    ops.delete_channel();
                    machine.current = ConnectionExpired;
                    true
                } else {
                    false
                }
            }
            (Connected, Disconnected) => {
                // The link dropped; the library reconnects the same channel
                // by itself, so the channel is kept
                machine.current = Disconnected;
                true
            }
            (ConnectFail | ConnectionExpired, Connected) => {
                machine.active = false;
                machine.expired = false;
                Self::create(machine, ops)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Unsubscribed,
    Subscribed,
    SubscribedRead,
    SubscribeSuccess,
    SubscribeFail,
}

impl MachineState for SubscriptionState {
    const INITIAL: Self = SubscriptionState::Unsubscribed;

    fn transition<O: MachineOps>(
        machine: &mut StateMachine<Self>,
        requested: Self,
        connected: bool,
        ops: &mut O,
    ) -> bool {
        use SubscriptionState::*;
        match (machine.current, requested) {
            (Unsubscribed | SubscribeFail, Subscribed) => {
                if machine.pending {
                    false
                } else if !connected {
                    machine.deferred = true;
                    true
                } else if ops.create_subscription() {
                    machine.pending = true;
                    machine.deferred = false;
                    true
                } else {
                    machine.current = SubscribeFail;
                    false
                }
            }
            (Unsubscribed | SubscribeFail, SubscribeSuccess | SubscribedRead) => {
                machine.pending = false;
                machine.active = true;
                machine.expired = false;
                machine.current = Subscribed;
                true
            }
            (Subscribed | SubscribedRead, SubscribeSuccess | SubscribedRead) => {
                machine.current = Subscribed;
                true
            }
            (_, SubscribeFail) => {
                if machine.pending {
                    machine.pending = false;
                    machine.active = false;
                    machine.current = SubscribeFail;
                }
                // A failed update on a live subscription leaves it live
                true
            }
            _ => false,
        }
    }
}

/// Generate the rules for a one-shot request machine
macro_rules! impl_one_shot_state {
    ($state:ident, $idle:ident, $busy:ident, $fail:ident, $op:ident) => {
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        pub enum $state {
            $idle,
            $busy,
            $fail,
        }

        impl MachineState for $state {
            const INITIAL: Self = $state::$idle;

            fn transition<O: MachineOps>(
                machine: &mut StateMachine<Self>,
                requested: Self,
                connected: bool,
                ops: &mut O,
            ) -> bool {
                use $state::*;
                match (machine.current, requested) {
                    (_, $busy) if machine.pending => false,
                    ($idle | $fail, $busy) => {
                        if !connected {
                            machine.deferred = true;
                            true
                        } else if ops.$op() {
                            machine.pending = true;
                            machine.deferred = false;
                            machine.current = $busy;
                            true
                        } else {
                            machine.current = $fail;
                            false
                        }
                    }
                    ($busy, $idle) => {
                        machine.pending = false;
                        machine.current = $idle;
                        true
                    }
                    ($busy, $fail) => {
                        machine.pending = false;
                        machine.current = $fail;
                        true
                    }
                    _ => false,
                }
            }
        }
    };
}

impl_one_shot_state!(ReadState, Idle, Reading, ReadingFail, read_channel);
impl_one_shot_state!(WriteState, Idle, Writing, WritingFail, write_channel);

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<&'static str>,
        fail: bool,
    }

    impl MachineOps for Recorder {
        fn create_channel(&mut self) -> bool {
            self.calls.push("create_channel");
            !self.fail
        }
        fn delete_channel(&mut self) {
            self.calls.push("delete_channel");
        }
        fn start_connection_timer(&mut self) {
            self.calls.push("start_timer");
        }
        fn stop_connection_timer(&mut self) {
            self.calls.push("stop_timer");
        }
        fn create_subscription(&mut self) -> bool {
            self.calls.push("create_subscription");
            !self.fail
        }
        fn read_channel(&mut self) -> bool {
            self.calls.push("read_channel");
            !self.fail
        }
        fn write_channel(&mut self) -> bool {
            self.calls.push("write_channel");
            !self.fail
        }
    }

    #[test]
    fn connection_request_then_callback() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<ConnectionState>::new();
        assert!(machine.process(ConnectionState::Connected, false, &mut ops));
        assert!(machine.pending);
        assert_eq!(machine.current, ConnectionState::Disconnected);
        // Duplicate while pending
        assert!(!machine.process(ConnectionState::Connected, false, &mut ops));

        machine.active = true;
        assert!(machine.process(ConnectionState::Connected, true, &mut ops));
        assert_eq!(machine.current, ConnectionState::Connected);
        assert!(!machine.pending);
        assert_eq!(ops.calls, ["create_channel", "start_timer", "stop_timer"]);

        // Link loss reported by the library
        machine.active = false;
        assert!(machine.process(ConnectionState::Disconnected, false, &mut ops));
        assert_eq!(machine.current, ConnectionState::Disconnected);
        assert_eq!(ops.calls.len(), 3);

        // And the same channel coming back
        machine.active = true;
        assert!(machine.process(ConnectionState::Connected, true, &mut ops));
        assert_eq!(machine.current, ConnectionState::Connected);
        assert_eq!(ops.calls, ["create_channel", "start_timer", "stop_timer", "stop_timer"]);
    }

    #[test]
    fn connection_expiry_is_terminal_until_retried() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<ConnectionState>::new();
        machine.process(ConnectionState::Connected, false, &mut ops);
        // Not expired yet
        assert!(!machine.process(ConnectionState::ConnectionExpired, false, &mut ops));
        machine.expired = true;
        assert!(machine.process(ConnectionState::ConnectionExpired, false, &mut ops));
        assert_eq!(machine.current, ConnectionState::ConnectionExpired);
        assert!(!machine.pending);
        assert_eq!(
            ops.calls,
            ["create_channel", "start_timer", "stop_timer", "delete_channel"]
        );
        // A late connection callback does not revive it
        machine.active = true;
        assert!(!machine.process(ConnectionState::Disconnected, true, &mut ops));
        assert_eq!(machine.current, ConnectionState::ConnectionExpired);

        // Explicit retry
        machine.active = false;
        assert!(machine.process(ConnectionState::Connected, false, &mut ops));
        assert_eq!(machine.current, ConnectionState::Disconnected);
        assert!(machine.pending);
    }

    #[test]
    fn connection_create_failure() {
        let mut ops = Recorder {
            fail: true,
            ..Default::default()
        };
        let mut machine = StateMachine::<ConnectionState>::new();
        assert!(!machine.process(ConnectionState::Connected, false, &mut ops));
        assert_eq!(machine.current, ConnectionState::ConnectFail);
        ops.fail = false;
        assert!(machine.process(ConnectionState::Connected, false, &mut ops));
        assert_eq!(machine.current, ConnectionState::Disconnected);
    }

    #[test]
    fn subscription_deferred_until_connected() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<SubscriptionState>::new();
        assert!(machine.process(SubscriptionState::Subscribed, false, &mut ops));
        assert!(ops.calls.is_empty());
        assert!(machine.take_deferred());
        assert!(machine.process(SubscriptionState::Subscribed, true, &mut ops));
        assert_eq!(ops.calls, ["create_subscription"]);
        assert!(!machine.process(SubscriptionState::Subscribed, true, &mut ops));

        assert!(machine.process(SubscriptionState::SubscribeSuccess, true, &mut ops));
        assert_eq!(machine.current, SubscriptionState::Subscribed);
        assert!(machine.process(SubscriptionState::SubscribedRead, true, &mut ops));
        assert_eq!(machine.current, SubscriptionState::Subscribed);
        assert!(!machine.pending);
        // Already subscribed
        assert!(!machine.process(SubscriptionState::Subscribed, true, &mut ops));
    }

    #[test]
    fn subscription_failure_allows_retry() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<SubscriptionState>::new();
        machine.process(SubscriptionState::Subscribed, true, &mut ops);
        machine.process(SubscriptionState::SubscribeFail, true, &mut ops);
        assert_eq!(machine.current, SubscriptionState::SubscribeFail);
        assert!(machine.process(SubscriptionState::Subscribed, true, &mut ops));
        assert_eq!(ops.calls, ["create_subscription", "create_subscription"]);
    }

    #[test]
    fn write_rejected_while_pending() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<WriteState>::new();
        assert!(machine.process(WriteState::Writing, true, &mut ops));
        assert!(!machine.process(WriteState::Writing, true, &mut ops));
        assert_eq!(ops.calls, ["write_channel"]);
        assert!(machine.process(WriteState::Idle, true, &mut ops));
        assert!(machine.process(WriteState::Writing, true, &mut ops));
        assert!(machine.process(WriteState::WritingFail, true, &mut ops));
        assert_eq!(machine.current, WriteState::WritingFail);
        assert!(machine.process(WriteState::Writing, true, &mut ops));
        assert_eq!(ops.calls.len(), 3);
    }

    #[test]
    fn read_deferred_and_failed_issue() {
        let mut ops = Recorder::default();
        let mut machine = StateMachine::<ReadState>::new();
        assert!(machine.process(ReadState::Reading, false, &mut ops));
        assert!(machine.deferred);
        assert_eq!(machine.current, ReadState::Idle);
        ops.fail = true;
        assert!(!machine.process(ReadState::Reading, true, &mut ops));
        assert_eq!(machine.current, ReadState::ReadingFail);
        assert!(!machine.pending);
    }
}
