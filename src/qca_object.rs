//! The object a consumer holds for one PV.
//!
//! A [`QcaObject`] owns a [`CaObject`] and the four request state machines.
//! Notifications from the callback threads are queued on the object and
//! posted to its [`EventLoop`](crate::event_loop::EventLoop); the machines are
//! only driven, and signals only emitted, when the loop hands the object its
//! queue or when the consumer makes a request. Notifications are processed
//! in the order they were queued.
use std::{
    collections::VecDeque,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, debug_span, warn};

use crate::{
    alarm::{ALARM_CONDITION_NAMES, AlarmInfo},
    backend::CaError,
    connection::{ChannelState, RequestError},
    context::QcaContext,
    dbr::Limit,
    event_filter::EventFilter,
    event_loop::{EventLoopHandle, EventTarget},
    generic::{Generic, GenericType},
    object::{CaCallback, CaObject, CallbackReason, SignalCallback},
    record::CaRecord,
    signals::{ConnectionInfo, DataUpdate, SignalPair, UserMessage},
    state_machine::{
        ConnectionState, MachineOps, ReadState, StateMachine, SubscriptionState, WriteState,
    },
};

/// A request a consumer can make of a [`QcaObject`]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Operation {
    Connect,
    Subscribe,
    Read,
    Write,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Connect => "Connect",
            Operation::Subscribe => "Subscribe",
            Operation::Read => "Read",
            Operation::Write => "Write",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QcaError {
    #[error("{operation} on {record} rejected: a request is already in progress")]
    Rejected { operation: Operation, record: String },
    #[error("{operation} on {record} failed: {source}")]
    Failed {
        operation: Operation,
        record: String,
        source: RequestError,
    },
}

/// Copies of the four request state machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineSnapshot {
    pub connection: StateMachine<ConnectionState>,
    pub subscription: StateMachine<SubscriptionState>,
    pub read: StateMachine<ReadState>,
    pub write: StateMachine<WriteState>,
}

/// Static information gathered from the updates received
#[derive(Debug, Clone, Default)]
struct StaticInfo {
    egu: String,
    enumerations: Vec<String>,
    precision: i16,
    data_type: Option<GenericType>,
}

#[derive(Default)]
struct Machines {
    connection: StateMachine<ConnectionState>,
    subscription: StateMachine<SubscriptionState>,
    read: StateMachine<ReadState>,
    write: StateMachine<WriteState>,
    /// Value of the outstanding, or deferred, write
    write_value: Option<Generic>,
    last_connection: ConnectionInfo,
    info: StaticInfo,
}

struct QcaInner {
    id: u64,
    record_name: String,
    ca: Arc<CaObject>,
    pending: Arc<Mutex<VecDeque<CaCallback>>>,
    machines: Mutex<Machines>,
    event_loop: EventLoopHandle,
    connection_timeout: Duration,
    data_changed: SignalPair<DataUpdate>,
    connection_changed: SignalPair<ConnectionInfo>,
    user_messages: SignalPair<UserMessage>,
}

/// Performs the side effects the machines ask for, remembering the last
/// request error so it can be reported to the caller
struct Ops<'a> {
    inner: &'a QcaInner,
    write_value: Option<Generic>,
    error: Option<RequestError>,
}

impl<'a> Ops<'a> {
    fn new(inner: &'a QcaInner, write_value: Option<Generic>) -> Self {
        Ops {
            inner,
            write_value,
            error: None,
        }
    }

    fn outcome(&mut self, operation: Operation, result: Result<(), RequestError>) -> bool {
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("{operation} on {} failed: {e}", self.inner.record_name);
                self.error = Some(e);
                false
            }
        }
    }
}

impl MachineOps for Ops<'_> {
    fn create_channel(&mut self) -> bool {
        let result = self.inner.ca.set_channel(&self.inner.record_name);
        self.outcome(Operation::Connect, result)
    }
    fn delete_channel(&mut self) {
        self.inner.ca.remove_channel();
    }
    fn start_connection_timer(&mut self) {
        self.inner
            .event_loop
            .start_timer(self.inner.id, self.inner.connection_timeout);
    }
    fn stop_connection_timer(&mut self) {
        self.inner.event_loop.stop_timer(self.inner.id);
    }
    fn create_subscription(&mut self) -> bool {
        let result = self.inner.ca.start_subscription();
        self.outcome(Operation::Subscribe, result)
    }
    fn read_channel(&mut self) -> bool {
        let result = self.inner.ca.read_channel();
        self.outcome(Operation::Read, result)
    }
    fn write_channel(&mut self) -> bool {
        let result = match &self.write_value {
            Some(value) => self.inner.ca.write_channel(value),
            None => Err(RequestError::Failed(CaError::Internal(
                "No value to write".to_string(),
            ))),
        };
        self.outcome(Operation::Write, result)
    }
}

impl QcaInner {
    fn machines(&self) -> MutexGuard<'_, Machines> {
        self.machines.lock().unwrap_or_else(PoisonError::into_inner)
    }
    fn pending(&self) -> MutexGuard<'_, VecDeque<CaCallback>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_connected(&self) -> bool {
        self.ca.connection().channel_state() == ChannelState::Connected
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            channel_state: self.ca.connection().channel_state(),
            link_state: self.ca.connection().link_state(),
        }
    }

    fn message(&self, message: UserMessage) {
        debug!("{message}");
        self.user_messages.send(message);
    }

    /// Emit the connection state if it changed since last emitted
    fn emit_connection(&self, machines: &mut Machines) {
        let info = self.connection_info();
        if info != machines.last_connection {
            machines.last_connection = info;
            self.connection_changed.send(info);
        }
    }

    fn emit_data(&self, machines: &mut Machines, record: Option<CaRecord>) {
        let Some(record) = record else {
            return;
        };
        // Records keep their static information across TIME updates
        machines.info = StaticInfo {
            egu: record.units.clone(),
            enumerations: record.enum_strings.clone(),
            precision: record.precision,
            data_type: record.value.as_ref().map(Generic::get_type),
        };
        self.data_changed.send(DataUpdate {
            timestamp: record.time_stamp(),
            alarm: record.alarm,
            value: record.value,
        });
    }

    fn emit_failure(&self, operation: Operation, error: Option<CaError>) {
        let text = match error {
            Some(error) => format!("{operation} failed: {error}"),
            None => format!("{operation} failed"),
        };
        if matches!(operation, Operation::Subscribe | Operation::Read) {
            self.emit_no_data();
        }
        self.message(UserMessage::warning(&self.record_name, text));
    }

    fn emit_no_data(&self) {
        self.data_changed.send(DataUpdate {
            value: None,
            alarm: AlarmInfo::undefined(),
            timestamp: SystemTime::now(),
        });
    }

    /// Issue requests that were made while the channel was down
    fn replay_deferred(&self, machines: &mut Machines, ops: &mut Ops<'_>) {
        let connected = self.is_connected();
        if machines.subscription.take_deferred() {
            debug!("Issuing deferred subscription");
            machines
                .subscription
                .process(SubscriptionState::Subscribed, connected, ops);
        }
        if machines.read.take_deferred() {
            debug!("Issuing deferred read");
            machines.read.process(ReadState::Reading, connected, ops);
        }
        if machines.write.take_deferred() {
            debug!("Issuing deferred write");
            machines.write.process(WriteState::Writing, connected, ops);
        }
    }

    fn request(&self, operation: Operation, value: Option<Generic>) -> Result<(), QcaError> {
        let _span = debug_span!("request", pv = %self.record_name).entered();
        let mut machines = self.machines();
        if operation == Operation::Write && !machines.write.pending {
            machines.write_value = value;
        }
        let connected = self.is_connected();
        let mut ops = Ops::new(self, machines.write_value.clone());
        let accepted = match operation {
            Operation::Connect => {
                machines
                    .connection
                    .process(ConnectionState::Connected, false, &mut ops)
            }
            Operation::Subscribe => {
                machines
                    .subscription
                    .process(SubscriptionState::Subscribed, connected, &mut ops)
            }
            Operation::Read => machines
                .read
                .process(ReadState::Reading, connected, &mut ops),
            Operation::Write => machines
                .write
                .process(WriteState::Writing, connected, &mut ops),
        };
        let error = ops.error.take();
        if accepted {
            return Ok(());
        }
        let record = self.record_name.clone();
        match error {
            Some(source) => {
                if operation == Operation::Write {
                    machines.write_value = None;
                }
                if matches!(operation, Operation::Subscribe | Operation::Read) {
                    self.emit_no_data();
                }
                self.message(UserMessage::error(
                    &self.record_name,
                    format!("{operation} failed: {source}"),
                ));
                Err(QcaError::Failed {
                    operation,
                    record,
                    source,
                })
            }
            None => {
                warn!("{operation} on {record} rejected: a request is already in progress");
                self.message(UserMessage::warning(
                    &self.record_name,
                    format!("{operation} rejected: a request is already in progress"),
                ));
                Err(QcaError::Rejected { operation, record })
            }
        }
    }
}

impl EventTarget for QcaInner {
    fn process_event(&self) {
        let Some(callback) = self.pending().pop_front() else {
            return;
        };
        let _span = debug_span!("event", pv = %self.record_name, reason = %callback.reason).entered();
        let mut machines = self.machines();
        let connected = self.is_connected();
        let mut ops = Ops::new(self, machines.write_value.clone());
        match callback.reason {
            CallbackReason::ConnectionUp => {
                if matches!(
                    machines.connection.current,
                    ConnectionState::ConnectFail | ConnectionState::ConnectionExpired
                ) {
                    debug!("Ignoring connection of an abandoned channel");
                    return;
                }
                machines.connection.active = true;
                machines
                    .connection
                    .process(ConnectionState::Connected, true, &mut ops);
                self.emit_connection(&mut machines);
                self.replay_deferred(&mut machines, &mut ops);
            }
            CallbackReason::ConnectionDown => {
                machines.connection.active = false;
                machines
                    .connection
                    .process(ConnectionState::Disconnected, false, &mut ops);
                self.emit_connection(&mut machines);
                self.message(UserMessage::warning(&self.record_name, "Connection lost"));
            }
            CallbackReason::ConnectionUnknown => (),
            CallbackReason::SubscriptionSuccess => {
                let requested = if machines.subscription.current == SubscriptionState::Subscribed {
                    SubscriptionState::SubscribedRead
                } else {
                    SubscriptionState::SubscribeSuccess
                };
                machines.subscription.process(requested, connected, &mut ops);
                self.emit_data(&mut machines, callback.record);
            }
            CallbackReason::SubscriptionFail => {
                machines
                    .subscription
                    .process(SubscriptionState::SubscribeFail, connected, &mut ops);
                self.emit_failure(Operation::Subscribe, callback.error);
            }
            CallbackReason::ReadSuccess => {
                machines.read.process(ReadState::Idle, connected, &mut ops);
                self.emit_data(&mut machines, callback.record);
            }
            CallbackReason::ReadFail => {
                machines
                    .read
                    .process(ReadState::ReadingFail, connected, &mut ops);
                self.emit_failure(Operation::Read, callback.error);
            }
            CallbackReason::WriteSuccess => {
                if machines.write.process(WriteState::Idle, connected, &mut ops) {
                    machines.write_value = None;
                }
            }
            CallbackReason::WriteFail => {
                machines
                    .write
                    .process(WriteState::WritingFail, connected, &mut ops);
                machines.write_value = None;
                self.emit_failure(Operation::Write, callback.error);
            }
            CallbackReason::Exception => {
                let text = match callback.error {
                    Some(error) => format!("Channel Access exception: {error}"),
                    None => "Channel Access exception".to_string(),
                };
                self.message(UserMessage::error(&self.record_name, text));
            }
        }
        self.emit_connection(&mut machines);
    }

    fn timer_expired(&self) {
        let _span = debug_span!("timer", pv = %self.record_name).entered();
        let mut machines = self.machines();
        machines.connection.expired = true;
        let mut ops = Ops::new(self, None);
        if machines
            .connection
            .process(ConnectionState::ConnectionExpired, false, &mut ops)
        {
            warn!(
                "{} did not connect within {:?}",
                self.record_name, self.connection_timeout
            );
            self.message(UserMessage::error(
                &self.record_name,
                format!(
                    "Channel did not connect within {:.1}s",
                    self.connection_timeout.as_secs_f32()
                ),
            ));
            self.emit_connection(&mut machines);
        } else {
            machines.connection.expired = false;
        }
    }
}

/// One PV as seen by a consumer
///
/// Created on the thread running its event loop. Connecting starts at once;
/// [`subscribe`](QcaObject::subscribe), [`single_shot_read`](QcaObject::single_shot_read)
/// and [`write_data`](QcaObject::write_data) requests made before the channel
/// connects are issued when it does. Dropping the object closes the channel,
/// and callbacks still in flight for it are discarded.
pub struct QcaObject {
    inner: Arc<QcaInner>,
    filter: Arc<EventFilter>,
}

impl QcaObject {
    pub fn new(record_name: &str, context: &QcaContext, event_loop: &EventLoopHandle) -> Self {
        let id = context.allocate_object_id();
        let pending: Arc<Mutex<VecDeque<CaCallback>>> = Arc::default();
        let signal: SignalCallback = {
            let pending = pending.clone();
            let event_loop = event_loop.clone();
            Arc::new(move |callback: CaCallback| {
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back(callback);
                event_loop.post(id);
            })
        };
        let inner = Arc::new(QcaInner {
            id,
            record_name: record_name.to_string(),
            ca: CaObject::new(
                context.native_context().clone(),
                context.registry().clone(),
                signal,
            ),
            pending,
            machines: Mutex::default(),
            event_loop: event_loop.clone(),
            connection_timeout: context.config().connection_timeout,
            data_changed: SignalPair::new(),
            connection_changed: SignalPair::new(),
            user_messages: SignalPair::new(),
        });
        let target: Arc<dyn EventTarget> = inner.clone();
        event_loop.register(id, Arc::downgrade(&target));
        context.event_filter().add_filter(event_loop.id());

        let object = QcaObject {
            inner,
            filter: context.event_filter().clone(),
        };
        if let Err(e) = object.inner.request(Operation::Connect, None) {
            debug!("Initial connection of {record_name}: {e}");
        }
        object
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }
    pub fn record_name(&self) -> &str {
        &self.inner.record_name
    }
    /// Whether this is the alarm status field of a record
    pub fn is_stat_field(&self) -> bool {
        self.inner.record_name.ends_with(".STAT")
    }

    /// Start a subscription, issued once connected
    pub fn subscribe(&self) -> Result<(), QcaError> {
        self.inner.request(Operation::Subscribe, None)
    }
    /// Read the value once, issued once connected
    pub fn single_shot_read(&self) -> Result<(), QcaError> {
        self.inner.request(Operation::Read, None)
    }
    /// Write a value. Rejected while a previous write is outstanding.
    pub fn write_data(&self, value: impl Into<Generic>) -> Result<(), QcaError> {
        self.inner.request(Operation::Write, Some(value.into()))
    }
    /// Try again after a failed or timed out connection
    pub fn reconnect(&self) -> Result<(), QcaError> {
        self.inner.request(Operation::Connect, None)
    }

    pub fn data_changed(&self) -> mpsc::UnboundedReceiver<DataUpdate> {
        self.inner.data_changed.subscribe()
    }
    pub fn data_watch(&self) -> watch::Receiver<Option<DataUpdate>> {
        self.inner.data_changed.watch()
    }
    pub fn last_data(&self) -> Option<DataUpdate> {
        self.inner.data_changed.latest()
    }
    pub fn connection_changed(&self) -> mpsc::UnboundedReceiver<ConnectionInfo> {
        self.inner.connection_changed.subscribe()
    }
    pub fn connection_watch(&self) -> watch::Receiver<Option<ConnectionInfo>> {
        self.inner.connection_changed.watch()
    }
    pub fn user_messages(&self) -> mpsc::UnboundedReceiver<UserMessage> {
        self.inner.user_messages.subscribe()
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.inner.connection_info()
    }
    pub fn machines(&self) -> MachineSnapshot {
        let machines = self.inner.machines();
        MachineSnapshot {
            connection: machines.connection.clone(),
            subscription: machines.subscription.clone(),
            read: machines.read.clone(),
            write: machines.write.clone(),
        }
    }

    /// Engineering units
    pub fn egu(&self) -> String {
        self.inner.machines().info.egu.clone()
    }
    /// Enumeration strings; all the alarm conditions for a `.STAT` field
    pub fn enumerations(&self) -> Vec<String> {
        if self.is_stat_field() {
            return ALARM_CONDITION_NAMES.iter().map(|s| s.to_string()).collect();
        }
        self.inner.machines().info.enumerations.clone()
    }
    pub fn precision(&self) -> i16 {
        self.inner.machines().info.precision
    }
    pub fn data_type(&self) -> GenericType {
        self.inner
            .machines()
            .info
            .data_type
            .unwrap_or(GenericType::Unknown)
    }
    /// Whether an update has arrived to establish the data type
    pub fn data_type_known(&self) -> bool {
        self.inner.machines().info.data_type.is_some()
    }
    pub fn alarm(&self) -> AlarmInfo {
        self.inner.ca.alarm()
    }

    pub fn host_name(&self) -> String {
        self.inner.ca.host_name()
    }
    pub fn field_type(&self) -> String {
        self.inner.ca.field_type()
    }
    pub fn element_count(&self) -> usize {
        self.inner.ca.element_count()
    }
    pub fn display_limits(&self) -> Limit {
        self.inner.ca.display_limit()
    }
    pub fn alarm_limits(&self) -> Limit {
        self.inner.ca.alarm_limit()
    }
    pub fn warning_limits(&self) -> Limit {
        self.inner.ca.warning_limit()
    }
    pub fn control_limits(&self) -> Limit {
        self.inner.ca.control_limit()
    }

    pub fn write_with_callback(&self) -> bool {
        self.inner.ca.write_with_callback()
    }
    pub fn set_write_with_callback(&self, enable: bool) {
        self.inner.ca.set_write_with_callback(enable);
    }
}

impl fmt::Debug for QcaObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QcaObject")
            .field("id", &self.inner.id)
            .field("record_name", &self.inner.record_name)
            .finish()
    }
}

impl Drop for QcaObject {
    fn drop(&mut self) {
        let inner = &self.inner;
        inner.ca.remove_channel();
        inner.pending().clear();
        inner.event_loop.unregister(inner.id);
        self.filter.delete_filter(inner.event_loop.id());
        debug!("Released {}", inner.record_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::SimulatedIoc, context::Config};

    #[test]
    fn stat_fields_have_every_alarm_condition() {
        let ioc = SimulatedIoc::new(1).unwrap();
        let context = QcaContext::new(Arc::new(ioc), Config::default());
        let event_loop = context.event_loop();
        let object = QcaObject::new("PUMP:1.STAT", &context, &event_loop.handle());
        assert!(object.is_stat_field());
        let names = object.enumerations();
        assert_eq!(names.len(), 22);
        assert_eq!(names[3], "HIHI");
        assert!(!object.data_type_known());
    }

    #[test]
    fn rejection_names_the_operation() {
        let error = QcaError::Rejected {
            operation: Operation::Write,
            record: "TEST:PV".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Write on TEST:PV rejected: a request is already in progress"
        );
    }
}
