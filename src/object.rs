//! Binding of a channel to its decoded record, and the callback trampolines.
//!
//! A [`CaObject`] owns one [`CaConnection`] and the [`CaRecord`] built from
//! what arrives on it. The handlers it passes to the native library only
//! carry an encoded [`CaRef`]; when invoked they resolve it back to the object,
//! decode the payload under the record lock and report the outcome through the
//! object's signal callback. Anything that fails to resolve is dropped.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use tracing::{debug, debug_span, trace, warn};

use crate::{
    alarm::AlarmInfo,
    backend::{
        CaError, ConnectionArgs, ConnectionHandler, ConnectionOp, EventArgs, EventHandler,
        ExceptionArgs, ExceptionHandler,
    },
    caref::{CaRef, CaRefRegistry},
    connection::{CaConnection, NativeContext, RequestError},
    dbr::{Dbr, DbrCategory, DbrType, Limit},
    generic::{Generic, GenericType},
    record::CaRecord,
};

/// Why the signal callback is being invoked
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallbackReason {
    SubscriptionSuccess,
    SubscriptionFail,
    ReadSuccess,
    ReadFail,
    WriteSuccess,
    WriteFail,
    Exception,
    ConnectionUp,
    ConnectionDown,
    ConnectionUnknown,
}

impl CallbackReason {
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            CallbackReason::ConnectionUp
                | CallbackReason::ConnectionDown
                | CallbackReason::ConnectionUnknown
        )
    }
}

impl fmt::Display for CallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One notification from the callback threads
///
/// Data reasons carry a copy of the record as it was after the update, owned
/// by the receiver.
#[derive(Debug, Clone)]
pub struct CaCallback {
    pub reason: CallbackReason,
    pub record: Option<CaRecord>,
    /// The library error, for failures and exceptions
    pub error: Option<CaError>,
}

impl CaCallback {
    pub fn new(reason: CallbackReason) -> Self {
        CaCallback {
            reason,
            record: None,
            error: None,
        }
    }
    fn with_record(reason: CallbackReason, record: CaRecord) -> Self {
        CaCallback {
            reason,
            record: Some(record),
            error: None,
        }
    }
    fn with_error(reason: CallbackReason, error: CaError) -> Self {
        CaCallback {
            reason,
            record: None,
            error: Some(error),
        }
    }
}

pub type SignalCallback = Arc<dyn Fn(CaCallback) + Send + Sync>;

/// Which request an event handler is answering
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Request {
    Subscription,
    Read,
    Write,
}

impl Request {
    fn reasons(&self) -> (CallbackReason, CallbackReason) {
        match self {
            Request::Subscription => (
                CallbackReason::SubscriptionSuccess,
                CallbackReason::SubscriptionFail,
            ),
            Request::Read => (CallbackReason::ReadSuccess, CallbackReason::ReadFail),
            Request::Write => (CallbackReason::WriteSuccess, CallbackReason::WriteFail),
        }
    }
}

/// A channel, the record decoded from it, and where to report changes
pub struct CaObject {
    connection: CaConnection,
    record: Mutex<CaRecord>,
    registry: Arc<CaRefRegistry<CaObject>>,
    caref: Mutex<Option<CaRef>>,
    signal: SignalCallback,
}

impl CaObject {
    pub fn new(
        context: Arc<NativeContext>,
        registry: Arc<CaRefRegistry<CaObject>>,
        signal: SignalCallback,
    ) -> Arc<Self> {
        Arc::new(CaObject {
            connection: CaConnection::new(context),
            record: Mutex::new(CaRecord::default()),
            registry,
            caref: Mutex::new(None),
            signal,
        })
    }

    fn record(&self) -> MutexGuard<'_, CaRecord> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_ref(&self) -> Option<CaRef> {
        *self.caref.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// User data word for requests on the current channel
    fn user(&self) -> Result<u64, RequestError> {
        self.current_ref()
            .map(CaRef::to_user_data)
            .ok_or(RequestError::ChannelDisconnected)
    }

    pub fn connection(&self) -> &CaConnection {
        &self.connection
    }

    /// Start connecting to the PV `name`
    ///
    /// A fresh [`CaRef`] is issued for every channel, so callbacks still
    /// arriving for an earlier channel can never be delivered.
    pub fn set_channel(self: &Arc<Self>, name: &str) -> Result<(), RequestError> {
        self.connection
            .establish_context(Self::exception_handler(Arc::downgrade(self)))?;
        let caref = {
            let mut current = self.caref.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(old) = current.take() {
                self.registry.discard(old);
            }
            let caref = self.registry.acquire(self);
            *current = Some(caref);
            caref
        };
        self.registry.set_pv(caref, name);
        *self.record() = CaRecord::new(name);

        match self.connection.establish_channel(
            Self::connection_handler(self.registry.clone()),
            name,
            caref.to_user_data(),
        ) {
            Ok(channel) => {
                self.registry.set_channel(caref, channel);
                Ok(())
            }
            Err(e) => {
                self.release_ref();
                Err(e)
            }
        }
    }

    /// Subscribe for updates, reading the static information first
    pub fn start_subscription(&self) -> Result<(), RequestError> {
        let native = self
            .connection
            .channel_type()
            .ok_or(RequestError::ChannelDisconnected)?;
        self.connection.establish_subscription(
            Self::event_handler(self.registry.clone(), Request::Subscription),
            DbrType::new(native, DbrCategory::Control),
            DbrType::new(native, DbrCategory::Time),
            self.user()?,
        )
    }

    /// Read the channel once, with full static information
    pub fn read_channel(&self) -> Result<(), RequestError> {
        let native = self
            .connection
            .channel_type()
            .ok_or(RequestError::ChannelDisconnected)?;
        self.connection.read_channel(
            Self::event_handler(self.registry.clone(), Request::Read),
            DbrType::new(native, DbrCategory::Control),
            self.user()?,
        )
    }

    /// Write a value in its own type; the server converts it as needed
    ///
    /// Without write-with-callback there is no completion from the library,
    /// so success is signalled as soon as the write is sent.
    pub fn write_channel(&self, value: &Generic) -> Result<(), RequestError> {
        let value = match value.get_type() {
            GenericType::UnsignedLong => value
                .convert_to(GenericType::Long)
                .map_err(|_| RequestError::Failed(CaError::BadType))?,
            _ => value.clone(),
        };
        let dbr = Dbr::Basic(value);
        let data_type = dbr
            .data_type()
            .ok_or(RequestError::Failed(CaError::BadType))?;
        let (count, payload) = dbr.to_bytes()?;
        self.connection.write_channel(
            Self::event_handler(self.registry.clone(), Request::Write),
            data_type,
            count,
            &payload,
            self.user()?,
        )?;
        if !self.connection.write_with_callback() {
            (self.signal)(CaCallback::new(CallbackReason::WriteSuccess));
        }
        Ok(())
    }

    /// Close the channel. Callbacks still in flight for it are dropped.
    pub fn remove_channel(&self) {
        self.connection.remove_channel();
        self.release_ref();
        self.record().valid = false;
    }

    fn release_ref(&self) {
        if let Some(caref) = self
            .caref
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            self.registry.discard(caref);
        }
    }

    /// Whether a callback for `channel` belongs to the live channel
    fn is_live_channel(&self, channel: u64) -> bool {
        let live = self.connection.channel_id();
        if live != 0 && live != channel {
            warn!("Dropping callback for stale channel {channel}, now using {live}");
            return false;
        }
        true
    }

    fn connection_handler(registry: Arc<CaRefRegistry<CaObject>>) -> ConnectionHandler {
        Arc::new(move |args: ConnectionArgs| {
            let _span = debug_span!("connection", cid = args.channel).entered();
            let Some(object) = registry.resolve(CaRef::from_user_data(args.user), args.channel)
            else {
                return;
            };
            if !object.is_live_channel(args.channel) {
                return;
            }
            object.connection.apply_connection_event(args.channel, args.op);
            let reason = match args.op {
                ConnectionOp::Up => {
                    object.record().native_type = object.connection.channel_type();
                    CallbackReason::ConnectionUp
                }
                ConnectionOp::Down => {
                    object.record().valid = false;
                    CallbackReason::ConnectionDown
                }
            };
            debug!("Channel {} is {:?}", args.channel, args.op);
            (object.signal)(CaCallback::new(reason));
        })
    }

    fn event_handler(registry: Arc<CaRefRegistry<CaObject>>, request: Request) -> EventHandler {
        Arc::new(move |args: EventArgs| {
            let _span = debug_span!("event", cid = args.channel).entered();
            let Some(object) = registry.resolve(CaRef::from_user_data(args.user), args.channel)
            else {
                return;
            };
            if !object.is_live_channel(args.channel) {
                return;
            }
            object.on_event(request, args);
        })
    }

    fn exception_handler(object: Weak<CaObject>) -> ExceptionHandler {
        Arc::new(move |args: ExceptionArgs| {
            let Some(object) = object.upgrade() else {
                return;
            };
            if let Some(channel) = args.channel
                && !object.is_live_channel(channel)
            {
                return;
            }
            warn!("CA exception ({}): {}", args.context, args.error);
            (object.signal)(CaCallback::with_error(CallbackReason::Exception, args.error));
        })
    }

    fn on_event(&self, request: Request, args: EventArgs) {
        let (success, fail) = request.reasons();
        if let Err(error) = args.status {
            debug!("{request:?} failed: {error}");
            (self.signal)(CaCallback::with_error(fail, error));
            return;
        }
        if request == Request::Write {
            (self.signal)(CaCallback::new(success));
            return;
        }
        let dbr = match Dbr::from_bytes(args.data_type, args.count, &args.data) {
            Ok(dbr) => dbr,
            Err(e) => {
                warn!("Could not decode {request:?} data: {e}");
                (self.signal)(CaCallback::new(fail));
                return;
            }
        };
        let copy = {
            let mut record = self.record();
            record.apply(dbr);
            record.clone()
        };
        trace!("{request:?} update for {}", copy.name);
        (self.signal)(CaCallback::with_record(success, copy));
    }

    pub fn is_first_update(&self) -> bool {
        self.record().is_first_update()
    }
    pub fn record_copy(&self) -> CaRecord {
        self.record().clone()
    }
    pub fn enum_state_count(&self) -> usize {
        self.record().enum_strings.len()
    }
    pub fn enum_state(&self, index: usize) -> Option<String> {
        self.record().enum_strings.get(index).cloned()
    }
    pub fn precision(&self) -> i16 {
        self.record().precision
    }
    pub fn units(&self) -> String {
        self.record().units.clone()
    }
    /// Kind of the last value received
    pub fn value_type(&self) -> GenericType {
        self.record()
            .value
            .as_ref()
            .map(Generic::get_type)
            .unwrap_or(GenericType::Unknown)
    }
    pub fn time_stamp_seconds(&self) -> u32 {
        self.record().timestamp.seconds
    }
    pub fn time_stamp_nanoseconds(&self) -> u32 {
        self.record().timestamp.nanoseconds
    }
    pub fn alarm(&self) -> AlarmInfo {
        self.record().alarm
    }
    pub fn alarm_status(&self) -> i16 {
        self.record().alarm.status
    }
    pub fn alarm_severity(&self) -> i16 {
        self.record().alarm.severity as i16
    }
    pub fn display_limit(&self) -> Limit {
        self.record().display_limit
    }
    pub fn alarm_limit(&self) -> Limit {
        self.record().alarm_limit
    }
    pub fn warning_limit(&self) -> Limit {
        self.record().warning_limit
    }
    pub fn control_limit(&self) -> Limit {
        self.record().control_limit
    }
    pub fn host_name(&self) -> String {
        self.connection.host_name()
    }
    pub fn field_type(&self) -> String {
        self.connection.field_type()
    }
    pub fn element_count(&self) -> usize {
        self.connection.element_count()
    }
    pub fn write_with_callback(&self) -> bool {
        self.connection.write_with_callback()
    }
    pub fn set_write_with_callback(&self, enable: bool) {
        self.connection.set_write_with_callback(enable);
    }
}

impl Drop for CaObject {
    fn drop(&mut self) {
        self.connection.remove_channel();
        self.release_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CaBackend, CaStatus, ChannelInfo, MonitorMask, SimulatedIoc};
    use std::{sync::mpsc, time::Duration};

    const WAIT: Duration = Duration::from_secs(5);

    struct Fixture {
        ioc: SimulatedIoc,
        registry: Arc<CaRefRegistry<CaObject>>,
        object: Arc<CaObject>,
        callbacks: mpsc::Receiver<CaCallback>,
    }

    fn fixture() -> Fixture {
        let ioc = SimulatedIoc::new(2).unwrap();
        let context = Arc::new(NativeContext::new(Arc::new(ioc.clone())));
        let registry = Arc::new(CaRefRegistry::new(Duration::ZERO));
        let (tx, callbacks) = mpsc::channel();
        let tx = Mutex::new(tx);
        let object = CaObject::new(
            context,
            registry.clone(),
            Arc::new(move |callback| {
                let _ = tx.lock().unwrap().send(callback);
            }),
        );
        Fixture {
            ioc,
            registry,
            object,
            callbacks,
        }
    }

    impl Fixture {
        fn next(&self) -> CaCallback {
            self.callbacks.recv_timeout(WAIT).unwrap()
        }
    }

    #[test]
    fn subscription_delivers_decoded_records() {
        let f = fixture();
        f.ioc
            .add_pv_with(
                "TEST:PV",
                crate::backend::sim::SimPv::new(3.0f64)
                    .units("mm")
                    .precision(2),
            )
            .unwrap();
        f.object.set_channel("TEST:PV").unwrap();
        assert_eq!(f.next().reason, CallbackReason::ConnectionUp);
        assert_eq!(f.object.field_type(), "DBF_DOUBLE");

        f.object.start_subscription().unwrap();
        let first = f.next();
        assert_eq!(first.reason, CallbackReason::SubscriptionSuccess);
        let record = first.record.unwrap();
        assert!(record.is_first_update());
        assert_eq!(record.units, "mm");
        assert_eq!(record.precision, 2);

        // The TIME subscription starts with the current value
        let initial = f.next().record.unwrap();
        assert_eq!(initial.value, Some(Generic::from(3.0f64)));
        assert!(initial.timestamp.is_set());

        f.ioc.set_value("TEST:PV", 4.5f64).unwrap();
        let update = f.next().record.unwrap();
        assert_eq!(update.value, Some(Generic::from(4.5f64)));
        assert_eq!(update.units, "mm");
        assert_eq!(f.object.value_type(), GenericType::Double);
    }

    #[test]
    fn write_without_callback_completes_at_once() {
        let f = fixture();
        f.ioc.add_pv("OUT", 0i32).unwrap();
        f.object.set_channel("OUT").unwrap();
        f.next();
        assert!(!f.object.write_with_callback());
        f.object.write_channel(&Generic::from(7u32)).unwrap();
        assert_eq!(f.next().reason, CallbackReason::WriteSuccess);
        assert_eq!(f.ioc.value("OUT"), Some(Generic::from(7i32)));

        f.object.set_write_with_callback(true);
        f.object.write_channel(&Generic::from("9")).unwrap();
        assert_eq!(f.next().reason, CallbackReason::WriteSuccess);
        assert_eq!(f.ioc.value("OUT"), Some(Generic::from(9i32)));
    }

    #[test]
    fn late_callbacks_after_removal_are_dropped() {
        let f = fixture();
        f.ioc.add_pv("TEST:PV", 1i16).unwrap();
        f.ioc.pause_callbacks();
        f.object.set_channel("TEST:PV").unwrap();
        f.object.remove_channel();
        assert_eq!(f.registry.in_use(), 0);
        f.ioc.resume_callbacks();
        assert!(f.callbacks.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn requests_need_a_connected_channel() {
        let f = fixture();
        assert_eq!(
            f.object.read_channel(),
            Err(RequestError::ChannelDisconnected)
        );
        f.object.set_channel("MISSING").unwrap();
        assert_eq!(
            f.object.start_subscription(),
            Err(RequestError::ChannelDisconnected)
        );
        assert_eq!(
            f.object.write_channel(&Generic::from(1.0f64)),
            Err(RequestError::ChannelDisconnected)
        );
    }

    #[test]
    fn exceptions_reach_the_channel_owner() {
        let f = fixture();
        f.ioc.add_pv("TEST:PV", 1i16).unwrap();
        f.object.set_channel("TEST:PV").unwrap();
        f.next();
        let channel = f.object.connection().channel_id();
        f.ioc.raise_exception(Some(channel), CaError::Timeout, "test");
        let callback = f.next();
        assert_eq!(callback.reason, CallbackReason::Exception);
        assert_eq!(callback.error, Some(CaError::Timeout));
    }

    /// Holds `create_channel` open until the connection callback has run
    struct EarlyConnect(SimulatedIoc);

    impl CaBackend for EarlyConnect {
        fn create_context(&self, exception_handler: ExceptionHandler) -> CaStatus {
            self.0.create_context(exception_handler)
        }
        fn create_channel(
            &self,
            name: &str,
            handler: ConnectionHandler,
            user: u64,
        ) -> Result<u64, CaError> {
            let (tx, rx) = mpsc::channel();
            let tx = Mutex::new(tx);
            let forward: ConnectionHandler = Arc::new(move |args| {
                handler(args);
                let _ = tx.lock().unwrap().send(());
            });
            let channel = self.0.create_channel(name, forward, user)?;
            rx.recv_timeout(WAIT).unwrap();
            Ok(channel)
        }
        fn clear_channel(&self, channel: u64) -> CaStatus {
            self.0.clear_channel(channel)
        }
        fn create_subscription(
            &self,
            channel: u64,
            data_type: DbrType,
            count: usize,
            mask: MonitorMask,
            handler: EventHandler,
            user: u64,
        ) -> Result<u64, CaError> {
            self.0
                .create_subscription(channel, data_type, count, mask, handler, user)
        }
        fn clear_subscription(&self, subscription: u64) -> CaStatus {
            self.0.clear_subscription(subscription)
        }
        fn get_callback(
            &self,
            channel: u64,
            data_type: DbrType,
            count: usize,
            handler: EventHandler,
            user: u64,
        ) -> CaStatus {
            self.0.get_callback(channel, data_type, count, handler, user)
        }
        fn put(&self, channel: u64, data_type: DbrType, count: usize, data: &[u8]) -> CaStatus {
            self.0.put(channel, data_type, count, data)
        }
        fn put_callback(
            &self,
            channel: u64,
            data_type: DbrType,
            count: usize,
            data: &[u8],
            handler: EventHandler,
            user: u64,
        ) -> CaStatus {
            self.0
                .put_callback(channel, data_type, count, data, handler, user)
        }
        fn channel_info(&self, channel: u64) -> Option<ChannelInfo> {
            self.0.channel_info(channel)
        }
    }

    #[test]
    fn connection_up_before_channel_id_returned() {
        let ioc = SimulatedIoc::new(1).unwrap();
        ioc.add_pv("TEST:PV", 2.5f64).unwrap();
        let context = Arc::new(NativeContext::new(Arc::new(EarlyConnect(ioc.clone()))));
        let registry = Arc::new(CaRefRegistry::new(Duration::ZERO));
        let (tx, callbacks) = mpsc::channel();
        let tx = Mutex::new(tx);
        let object = CaObject::new(
            context,
            registry,
            Arc::new(move |callback| {
                let _ = tx.lock().unwrap().send(callback);
            }),
        );

        object.set_channel("TEST:PV").unwrap();
        let up = callbacks.recv_timeout(WAIT).unwrap();
        assert_eq!(up.reason, CallbackReason::ConnectionUp);
        assert_eq!(object.field_type(), "DBF_DOUBLE");
        assert_eq!(object.element_count(), 1);
        assert!(!object.host_name().is_empty());

        object.start_subscription().unwrap();
        assert_eq!(
            callbacks.recv_timeout(WAIT).unwrap().reason,
            CallbackReason::SubscriptionSuccess
        );
        let initial = callbacks.recv_timeout(WAIT).unwrap().record.unwrap();
        assert_eq!(initial.value, Some(Generic::from(2.5f64)));
    }
}
