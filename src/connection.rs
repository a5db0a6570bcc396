//! A single PV channel on top of a [`CaBackend`].
//!
//! [`CaConnection`] tracks what is known about one channel: whether the link
//! to the server is up, the CA channel state, the native field type and
//! element count. It never blocks waiting for the library; every request is
//! issued and answered later through the handler passed with it.
use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::{
    backend::{
        CaBackend, CaError, ChannelInfo, ConnectionHandler, ConnectionOp, EventArgs, EventHandler,
        ExceptionHandler, MonitorMask,
    },
    dbr::{DbrBasicType, DbrEncodeError, DbrType},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum LinkState {
    Up,
    Down,
    Unknown,
}

impl From<u8> for LinkState {
    fn from(value: u8) -> Self {
        match value {
            0 => LinkState::Up,
            1 => LinkState::Down,
            _ => LinkState::Unknown,
        }
    }
}

impl From<LinkState> for u8 {
    fn from(value: LinkState) -> Self {
        match value {
            LinkState::Up => 0,
            LinkState::Down => 1,
            LinkState::Unknown => 2,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum ChannelState {
    NeverConnected,
    PreviouslyConnected,
    Connected,
    Closed,
    Unknown,
}

impl From<u8> for ChannelState {
    fn from(value: u8) -> Self {
        match value {
            0 => ChannelState::NeverConnected,
            1 => ChannelState::PreviouslyConnected,
            2 => ChannelState::Connected,
            3 => ChannelState::Closed,
            _ => ChannelState::Unknown,
        }
    }
}

impl From<ChannelState> for u8 {
    fn from(value: ChannelState) -> Self {
        match value {
            ChannelState::NeverConnected => 0,
            ChannelState::PreviouslyConnected => 1,
            ChannelState::Connected => 2,
            ChannelState::Closed => 3,
            ChannelState::Unknown => 4,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelState::NeverConnected => "never connected",
            ChannelState::PreviouslyConnected => "previously connected",
            ChannelState::Connected => "connected",
            ChannelState::Closed => "closed",
            ChannelState::Unknown => "unknown",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Channel is not connected")]
    ChannelDisconnected,
    #[error("No CA context has been established")]
    NoContext,
    #[error("A channel is already active on this connection")]
    ChannelActive,
    #[error("A subscription is already active on this connection")]
    AlreadySubscribed,
    #[error("Request failed: {0}")]
    Failed(CaError),
    #[error("Cannot encode value: {0}")]
    Encode(#[from] DbrEncodeError),
}

impl From<CaError> for RequestError {
    fn from(value: CaError) -> Self {
        match value {
            CaError::Disconnected => RequestError::ChannelDisconnected,
            CaError::NoContext => RequestError::NoContext,
            other => RequestError::Failed(other),
        }
    }
}

/// The process-wide native client context
///
/// The library context is created on first use, and exceptions it reports
/// are routed to the connection owning the channel concerned.
pub struct NativeContext {
    backend: Arc<dyn CaBackend>,
    created: Mutex<bool>,
    routes: Arc<Mutex<HashMap<u64, ExceptionHandler>>>,
}

impl NativeContext {
    pub fn new(backend: Arc<dyn CaBackend>) -> Self {
        NativeContext {
            backend,
            created: Mutex::new(false),
            routes: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn backend(&self) -> &Arc<dyn CaBackend> {
        &self.backend
    }

    pub fn is_created(&self) -> bool {
        *self.created.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the library context if this is the first request for it
    fn ensure(&self) -> Result<(), CaError> {
        let mut created = self.created.lock().unwrap_or_else(PoisonError::into_inner);
        if *created {
            return Ok(());
        }
        let routes = self.routes.clone();
        self.backend.create_context(Arc::new(move |args| {
            let handler = args.channel.and_then(|channel| {
                routes
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get(&channel)
                    .cloned()
            });
            match handler {
                Some(handler) => handler(args),
                None => warn!("CA exception ({}): {}", args.context, args.error),
            }
        }))?;
        debug!("Created CA client context");
        *created = true;
        Ok(())
    }

    fn add_route(&self, channel: u64, handler: ExceptionHandler) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(channel, handler);
    }

    fn remove_route(&self, channel: u64) {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&channel);
    }
}

/// Subscription bookkeeping, shared with the deferred subscribe step
#[derive(Default)]
struct SubscriptionSlot {
    active: AtomicBool,
    id: AtomicU64,
}

/// One channel, and the requests made on it
pub struct CaConnection {
    context: Arc<NativeContext>,
    exception_handler: Mutex<Option<ExceptionHandler>>,
    context_active: AtomicBool,
    link_state: AtomicU8,
    channel_state: AtomicU8,
    channel_id: AtomicU64,
    subscription: Arc<SubscriptionSlot>,
    write_with_callback: AtomicBool,
    info: Mutex<ChannelInfo>,
}

impl CaConnection {
    pub fn new(context: Arc<NativeContext>) -> Self {
        CaConnection {
            context,
            exception_handler: Mutex::new(None),
            context_active: AtomicBool::new(false),
            link_state: AtomicU8::new(LinkState::Down.into()),
            channel_state: AtomicU8::new(ChannelState::NeverConnected.into()),
            channel_id: AtomicU64::new(0),
            subscription: Arc::new(SubscriptionSlot::default()),
            write_with_callback: AtomicBool::new(false),
            info: Mutex::new(ChannelInfo::default()),
        }
    }

    fn info(&self) -> MutexGuard<'_, ChannelInfo> {
        self.info.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn backend(&self) -> &Arc<dyn CaBackend> {
        self.context.backend()
    }

    fn require_connected(&self) -> Result<u64, RequestError> {
        let channel = self.channel_id();
        if channel == 0 || self.channel_state() != ChannelState::Connected {
            return Err(RequestError::ChannelDisconnected);
        }
        Ok(channel)
    }

    /// Join the native context, creating it if nobody has yet
    ///
    /// Exceptions raised for this connection's channel go to
    /// `exception_handler`. Repeated calls do nothing.
    pub fn establish_context(&self, exception_handler: ExceptionHandler) -> Result<(), RequestError> {
        if self.context_active.load(Ordering::Acquire) {
            return Ok(());
        }
        self.context.ensure()?;
        *self
            .exception_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(exception_handler);
        self.context_active.store(true, Ordering::Release);
        Ok(())
    }

    /// Start connecting to `name`, returning the new channel id
    ///
    /// Connection changes are reported to `handler` with `user` attached.
    pub fn establish_channel(
        &self,
        handler: ConnectionHandler,
        name: &str,
        user: u64,
    ) -> Result<u64, RequestError> {
        if !self.context_active.load(Ordering::Acquire) {
            return Err(RequestError::NoContext);
        }
        if self.channel_id() != 0 {
            return Err(RequestError::ChannelActive);
        }
        self.channel_state
            .store(ChannelState::NeverConnected.into(), Ordering::Release);
        self.link_state
            .store(LinkState::Down.into(), Ordering::Release);
        let channel = self.backend().create_channel(name, handler, user)?;
        self.channel_id.store(channel, Ordering::Release);
        if let Some(handler) = self
            .exception_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            self.context.add_route(channel, handler);
        }
        debug!("Created channel {channel} for {name}");
        Ok(channel)
    }

    /// Subscribe to value and alarm changes
    ///
    /// The static information is fetched first as a one-shot `initial` read,
    /// passed to `handler`, and only then is the `update` subscription made.
    /// Both deliver to `handler`.
    pub fn establish_subscription(
        &self,
        handler: EventHandler,
        initial: DbrType,
        update: DbrType,
        user: u64,
    ) -> Result<(), RequestError> {
        let channel = self.require_connected()?;
        if self.subscription.active.swap(true, Ordering::AcqRel) {
            return Err(RequestError::AlreadySubscribed);
        }
        let backend = self.backend().clone();
        let slot = self.subscription.clone();
        let forward = handler.clone();
        let first: EventHandler = Arc::new(move |args: EventArgs| {
            let succeeded = args.status.is_ok();
            forward(args);
            if !succeeded {
                slot.active.store(false, Ordering::Release);
                return;
            }
            match backend.create_subscription(
                channel,
                update,
                0,
                MonitorMask::value_alarm(),
                forward.clone(),
                user,
            ) {
                Ok(id) => {
                    slot.id.store(id, Ordering::Release);
                    if let Err(e) = backend.flush() {
                        debug!("Could not flush subscription on channel {channel}: {e}");
                    }
                }
                Err(e) => {
                    debug!("Could not subscribe to channel {channel} after initial read: {e}");
                    slot.active.store(false, Ordering::Release);
                }
            }
        });
        if let Err(e) = self.backend().get_callback(channel, initial, 0, first, user) {
            self.subscription.active.store(false, Ordering::Release);
            return Err(e.into());
        }
        self.backend().flush()?;
        Ok(())
    }

    /// Read the channel once
    pub fn read_channel(
        &self,
        handler: EventHandler,
        data_type: DbrType,
        user: u64,
    ) -> Result<(), RequestError> {
        let channel = self.require_connected()?;
        self.backend()
            .get_callback(channel, data_type, 0, handler, user)?;
        self.backend().flush()?;
        Ok(())
    }

    /// Write an encoded payload of `count` elements of `data_type`
    ///
    /// `handler` is only called if the connection writes with callback.
    pub fn write_channel(
        &self,
        handler: EventHandler,
        data_type: DbrType,
        count: usize,
        payload: &[u8],
        user: u64,
    ) -> Result<(), RequestError> {
        let channel = self.require_connected()?;
        if self.write_with_callback() {
            self.backend()
                .put_callback(channel, data_type, count, payload, handler, user)?;
        } else {
            self.backend().put(channel, data_type, count, payload)?;
        }
        self.backend().flush()?;
        Ok(())
    }

    /// Close the channel and its subscription
    pub fn remove_channel(&self) {
        let channel = self.channel_id.swap(0, Ordering::AcqRel);
        if channel != 0 {
            let subscription = self.subscription.id.swap(0, Ordering::AcqRel);
            if subscription != 0
                && let Err(e) = self.backend().clear_subscription(subscription)
            {
                trace!("Clearing subscription {subscription}: {e}");
            }
            if let Err(e) = self.backend().clear_channel(channel) {
                debug!("Clearing channel {channel}: {e}");
            }
            self.context.remove_route(channel);
            debug!("Removed channel {channel}");
        }
        self.subscription.active.store(false, Ordering::Release);
        self.link_state
            .store(LinkState::Down.into(), Ordering::Release);
        self.channel_state
            .store(ChannelState::Closed.into(), Ordering::Release);
    }

    /// Record a connection change reported by the library
    ///
    /// The only place link and channel state change other than teardown.
    /// `channel` is the id the library reported, which may arrive before
    /// `establish_channel` has returned it.
    pub(crate) fn apply_connection_event(&self, channel: u64, op: ConnectionOp) {
        match op {
            ConnectionOp::Up => {
                if let Some(info) = self.backend().channel_info(channel) {
                    *self.info() = info;
                }
                self.link_state.store(LinkState::Up.into(), Ordering::Release);
                self.channel_state
                    .store(ChannelState::Connected.into(), Ordering::Release);
            }
            ConnectionOp::Down => {
                self.link_state
                    .store(LinkState::Down.into(), Ordering::Release);
                self.channel_state
                    .store(ChannelState::PreviouslyConnected.into(), Ordering::Release);
            }
        }
    }

    pub fn link_state(&self) -> LinkState {
        self.link_state.load(Ordering::Acquire).into()
    }
    pub fn channel_state(&self) -> ChannelState {
        self.channel_state.load(Ordering::Acquire).into()
    }
    pub fn channel_id(&self) -> u64 {
        self.channel_id.load(Ordering::Acquire)
    }
    pub fn has_context(&self) -> bool {
        self.context_active.load(Ordering::Acquire)
    }
    pub fn is_subscribed(&self) -> bool {
        self.subscription.active.load(Ordering::Acquire)
    }
    /// Native type of the channel, once it has connected
    pub fn channel_type(&self) -> Option<DbrBasicType> {
        self.info().field_type
    }
    pub fn element_count(&self) -> usize {
        self.info().element_count
    }
    pub fn host_name(&self) -> String {
        self.info().host_name.clone()
    }
    /// Database field type name, e.g. `DBF_DOUBLE`
    pub fn field_type(&self) -> String {
        self.channel_type()
            .map(|t| t.field_type_name().to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string())
    }
    pub fn write_with_callback(&self) -> bool {
        self.write_with_callback.load(Ordering::Acquire)
    }
    pub fn set_write_with_callback(&self, enable: bool) {
        self.write_with_callback.store(enable, Ordering::Release);
    }
}

impl Drop for CaConnection {
    fn drop(&mut self) {
        if self.channel_id() != 0 {
            self.remove_channel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{ConnectionArgs, SimulatedIoc},
        dbr::{Dbr, DbrCategory},
        generic::Generic,
    };
    use std::{sync::mpsc, time::Duration};

    const WAIT: Duration = Duration::from_secs(5);

    fn connection() -> (SimulatedIoc, CaConnection) {
        let ioc = SimulatedIoc::new(1).unwrap();
        let context = Arc::new(NativeContext::new(Arc::new(ioc.clone())));
        (ioc, CaConnection::new(context))
    }

    fn ignore_events() -> EventHandler {
        Arc::new(|_| {})
    }

    #[test]
    fn never_connected_requests_are_refused() {
        let (_ioc, connection) = connection();
        let double = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        assert_eq!(
            connection.read_channel(ignore_events(), double, 0),
            Err(RequestError::ChannelDisconnected)
        );
        assert_eq!(
            connection.write_channel(ignore_events(), double, 1, &[0u8; 8], 0),
            Err(RequestError::ChannelDisconnected)
        );
        assert_eq!(
            connection.establish_subscription(ignore_events(), double, double, 0),
            Err(RequestError::ChannelDisconnected)
        );
        assert_eq!(connection.channel_state(), ChannelState::NeverConnected);
        assert_eq!(connection.field_type(), "UNKNOWN");
        // Safe to remove a channel that never existed
        connection.remove_channel();
        assert_eq!(connection.channel_state(), ChannelState::Closed);
    }

    #[test]
    fn channel_requires_context() {
        let (_ioc, connection) = connection();
        assert_eq!(
            connection.establish_channel(Arc::new(|_| {}), "PV", 0),
            Err(RequestError::NoContext)
        );
        connection.establish_context(Arc::new(|_| {})).unwrap();
        connection.establish_context(Arc::new(|_| {})).unwrap();
        assert!(connection.has_context());
        connection
            .establish_channel(Arc::new(|_| {}), "PV", 0)
            .unwrap();
        assert_eq!(
            connection.establish_channel(Arc::new(|_| {}), "PV", 0),
            Err(RequestError::ChannelActive)
        );
    }

    #[test]
    fn subscription_reads_control_then_time() {
        let (ioc, connection) = connection();
        let connection = Arc::new(connection);
        ioc.add_pv("TEST:PV", 1.5f64).unwrap();
        connection.establish_context(Arc::new(|_| {})).unwrap();

        let (tx, rx) = mpsc::channel::<ConnectionArgs>();
        let tx = Mutex::new(tx);
        connection
            .establish_channel(
                Arc::new(move |args| {
                    let _ = tx.lock().unwrap().send(args);
                }),
                "TEST:PV",
                0,
            )
            .unwrap();
        let args = rx.recv_timeout(WAIT).unwrap();
        connection.apply_connection_event(args.channel, args.op);
        assert_eq!(connection.channel_state(), ChannelState::Connected);
        assert_eq!(connection.link_state(), LinkState::Up);
        assert_eq!(connection.field_type(), "DBF_DOUBLE");
        assert_eq!(connection.element_count(), 1);

        let (tx, rx) = mpsc::channel::<EventArgs>();
        let tx = Mutex::new(tx);
        let ctrl = DbrType::new(DbrBasicType::Double, DbrCategory::Control);
        let time = DbrType::new(DbrBasicType::Double, DbrCategory::Time);
        connection
            .establish_subscription(
                Arc::new(move |args| {
                    let _ = tx.lock().unwrap().send(args);
                }),
                ctrl,
                time,
                0,
            )
            .unwrap();
        assert!(connection.is_subscribed());
        assert_eq!(rx.recv_timeout(WAIT).unwrap().data_type, ctrl);
        let update = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(update.data_type, time);
        let dbr = Dbr::from_bytes(update.data_type, update.count, &update.data).unwrap();
        assert_eq!(dbr.value(), &Generic::from(1.5f64));
        assert_eq!(
            connection.establish_subscription(ignore_events(), ctrl, time, 0),
            Err(RequestError::AlreadySubscribed)
        );

        connection.remove_channel();
        assert!(!connection.is_subscribed());
        assert_eq!(ioc.channel_count(), 0);
        assert_eq!(ioc.subscription_count(), 0);
    }

    #[test]
    fn subscription_survives_a_failed_flush() {
        let (ioc, connection) = connection();
        ioc.add_pv("TEST:PV", 7i32).unwrap();
        connection.establish_context(Arc::new(|_| {})).unwrap();
        let (tx, rx) = mpsc::channel::<ConnectionArgs>();
        let tx = Mutex::new(tx);
        connection
            .establish_channel(
                Arc::new(move |args| {
                    let _ = tx.lock().unwrap().send(args);
                }),
                "TEST:PV",
                0,
            )
            .unwrap();
        let args = rx.recv_timeout(WAIT).unwrap();
        connection.apply_connection_event(args.channel, args.op);

        // Hold the initial read so the update subscription is made while
        // flushing fails
        ioc.pause_callbacks();
        let (tx, rx) = mpsc::channel::<EventArgs>();
        let tx = Mutex::new(tx);
        let ctrl = DbrType::new(DbrBasicType::Long, DbrCategory::Control);
        let time = DbrType::new(DbrBasicType::Long, DbrCategory::Time);
        connection
            .establish_subscription(
                Arc::new(move |args| {
                    let _ = tx.lock().unwrap().send(args);
                }),
                ctrl,
                time,
                0,
            )
            .unwrap();
        ioc.set_flush_error(Some(CaError::Disconnected));
        ioc.resume_callbacks();

        assert_eq!(rx.recv_timeout(WAIT).unwrap().data_type, ctrl);
        assert_eq!(rx.recv_timeout(WAIT).unwrap().data_type, time);
        assert!(connection.is_subscribed());
        assert_eq!(ioc.subscription_count(), 1);
    }
}
