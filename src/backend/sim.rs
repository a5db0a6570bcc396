//! An in-process IOC serving PVs from memory.
//!
//! [`SimulatedIoc`] implements [`CaBackend`] without any network: PVs are
//! held in a map, requests are answered by encoding real DBR payloads, and
//! every callback is delivered from one of the simulator's own worker
//! threads, as the native library would. Callbacks for a given channel always
//! go to the same worker, so they arrive in the order they were issued.
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::{
    CaBackend, CaError, CaStatus, ChannelInfo, ConnectionArgs, ConnectionHandler, ConnectionOp,
    EventArgs, EventHandler, ExceptionArgs, ExceptionHandler, MonitorMask,
};
use crate::{
    dbr::{Dbr, DbrBasicType, DbrCategory, DbrGraphics, DbrType, EpicsTimeStamp, Limit, Status},
    generic::{Generic, GenericError, GenericType},
    utils::wrapping_inplace_add,
};

type Job = Box<dyn FnOnce() + Send>;

/// Host name reported for every simulated channel
pub const SIM_HOST_NAME: &str = "localhost:5064";

#[derive(Debug, Error)]
pub enum SimError {
    #[error("PV '{0}' already exists")]
    AlreadyExists(String),
    #[error("No PV named '{0}'")]
    NoSuchPv(String),
    #[error("{0} values cannot be served over CA")]
    Unrepresentable(GenericType),
    #[error(transparent)]
    Value(#[from] GenericError),
}

/// A simulated record, with its value and metadata
#[derive(Clone, Debug)]
pub struct SimPv {
    value: Generic,
    status: Status,
    timestamp: EpicsTimeStamp,
    graphics: DbrGraphics,
    control: Limit,
    online: bool,
    writable: bool,
}

impl SimPv {
    pub fn new(value: impl Into<Generic>) -> Self {
        SimPv {
            value: value.into(),
            status: Status::default(),
            timestamp: EpicsTimeStamp::now(),
            graphics: DbrGraphics::default(),
            control: Limit::default(),
            online: true,
            writable: true,
        }
    }
    pub fn units(mut self, units: &str) -> Self {
        self.graphics.units = units.to_string();
        self
    }
    pub fn precision(mut self, precision: i16) -> Self {
        self.graphics.precision = precision;
        self
    }
    pub fn display_limits(mut self, lower: f64, upper: f64) -> Self {
        self.graphics.display_limit = Limit::new(lower, upper);
        self
    }
    pub fn alarm_limits(mut self, lower: f64, upper: f64) -> Self {
        self.graphics.alarm_limit = Limit::new(lower, upper);
        self
    }
    pub fn warning_limits(mut self, lower: f64, upper: f64) -> Self {
        self.graphics.warning_limit = Limit::new(lower, upper);
        self
    }
    pub fn control_limits(mut self, lower: f64, upper: f64) -> Self {
        self.control = Limit::new(lower, upper);
        self
    }
    pub fn enum_strings(mut self, strings: &[&str]) -> Self {
        self.graphics.enum_strings = strings.iter().map(|s| s.to_string()).collect();
        self
    }
    pub fn read_only(mut self) -> Self {
        self.writable = false;
        self
    }

    fn native_type(&self) -> Option<DbrBasicType> {
        DbrBasicType::for_generic(self.value.get_type())
    }

    /// Load the value as the requested DBR type
    fn load(&self, data_type: DbrType, count: usize) -> Result<Dbr, CaError> {
        if count > self.value.array_count() {
            return Err(CaError::BadCount);
        }
        let value = match data_type.basic_type {
            DbrBasicType::String => Generic::String(self.value.to_strings()),
            basic => self
                .value
                .parse_into(basic.generic_type())
                .map_err(|_| CaError::BadType)?,
        };
        let status = self.status;
        Ok(match data_type.category {
            DbrCategory::Basic => Dbr::Basic(value),
            DbrCategory::Status => Dbr::Status { status, value },
            DbrCategory::Time => Dbr::Time {
                status,
                timestamp: self.timestamp,
                value,
            },
            DbrCategory::Graphics => Dbr::Graphics {
                status,
                graphics: self.graphics.clone(),
                value,
            },
            DbrCategory::Control => Dbr::Control {
                status,
                graphics: self.graphics.clone(),
                control: self.control,
                value,
            },
        })
    }

    /// Store a value, converting it to the native type of the record
    fn store(&mut self, value: &Generic) -> Result<(), GenericError> {
        self.value = value.parse_into(self.value.get_type())?;
        self.timestamp = EpicsTimeStamp::now();
        Ok(())
    }

    fn event(&self, channel: u64, user: u64, data_type: DbrType, count: usize) -> EventArgs {
        let encoded = self
            .load(data_type, count)
            .and_then(|dbr| dbr.to_bytes().map_err(|_| CaError::BadType));
        match encoded {
            Ok((count, data)) => EventArgs {
                channel,
                user,
                status: Ok(()),
                data_type,
                count,
                data,
            },
            Err(error) => EventArgs {
                channel,
                user,
                status: Err(error),
                data_type,
                count: 0,
                data: Vec::new(),
            },
        }
    }
}

struct SimChannel {
    name: String,
    handler: ConnectionHandler,
    user: u64,
    connected: bool,
}

struct SimSubscription {
    channel: u64,
    data_type: DbrType,
    count: usize,
    mask: MonitorMask,
    handler: EventHandler,
    user: u64,
}

struct SimState {
    exception_handler: Option<ExceptionHandler>,
    pvs: HashMap<String, SimPv>,
    channels: HashMap<u64, SimChannel>,
    subscriptions: HashMap<u64, SimSubscription>,
    next_id: u64,
    /// While set, callbacks are held back instead of delivered
    paused: bool,
    held: Vec<(u64, Job)>,
    /// Returned by every flush while set
    flush_error: Option<CaError>,
}

struct SimShared {
    state: Mutex<SimState>,
    workers: Vec<mpsc::UnboundedSender<Job>>,
}

impl SimShared {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a callback on the worker owning `channel`
    ///
    /// Always called with the state lock held, so that callbacks for one
    /// channel are queued in the order the state changed.
    fn dispatch(&self, state: &mut SimState, channel: u64, job: Job) {
        if state.paused {
            state.held.push((channel, job));
            return;
        }
        let worker = &self.workers[(channel % self.workers.len() as u64) as usize];
        if worker.send(job).is_err() {
            warn!("Simulated IOC worker for channel {channel} has stopped");
        }
    }

    /// Send an update to every subscription on `name` whose mask matches
    fn notify(&self, state: &mut SimState, name: &str, value_changed: bool, alarm_changed: bool) {
        let Some(pv) = state.pvs.get(name) else {
            return;
        };
        let mut jobs: Vec<(u64, Job)> = Vec::new();
        for subscription in state.subscriptions.values() {
            let Some(channel) = state.channels.get(&subscription.channel) else {
                continue;
            };
            if channel.name != name || !channel.connected {
                continue;
            }
            if !(value_changed && subscription.mask.value || alarm_changed && subscription.mask.alarm)
            {
                continue;
            }
            let args = pv.event(
                subscription.channel,
                subscription.user,
                subscription.data_type,
                subscription.count,
            );
            let handler = subscription.handler.clone();
            jobs.push((subscription.channel, Box::new(move || handler(args))));
        }
        // Subscription ids are issued in order, keep delivery in that order too
        jobs.sort_by_key(|(channel, _)| *channel);
        for (channel, job) in jobs {
            self.dispatch(state, channel, job);
        }
    }

    /// Connect or disconnect every channel open on `name`
    fn set_channels(&self, state: &mut SimState, name: &str, connected: bool) {
        let op = if connected {
            ConnectionOp::Up
        } else {
            ConnectionOp::Down
        };
        let mut jobs: Vec<(u64, Job)> = Vec::new();
        for (&id, channel) in state.channels.iter_mut() {
            if channel.name != name || channel.connected == connected {
                continue;
            }
            channel.connected = connected;
            let handler = channel.handler.clone();
            let args = ConnectionArgs {
                channel: id,
                user: channel.user,
                op,
            };
            jobs.push((id, Box::new(move || handler(args))));
        }
        jobs.sort_by_key(|(channel, _)| *channel);
        for (channel, job) in jobs {
            self.dispatch(state, channel, job);
        }
    }
}

/// In-memory CA server and client library in one
///
/// Cloning gives another handle onto the same IOC. The worker threads stop
/// once every handle has been dropped.
#[derive(Clone)]
pub struct SimulatedIoc {
    shared: Arc<SimShared>,
}

impl SimulatedIoc {
    /// Start an IOC delivering callbacks from `workers` threads
    pub fn new(workers: usize) -> io::Result<Self> {
        let mut senders = Vec::new();
        for n in 0..workers.max(1) {
            let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
            thread::Builder::new()
                .name(format!("sim-ioc-{n}"))
                .spawn(move || {
                    while let Some(job) = rx.blocking_recv() {
                        job();
                    }
                    trace!("Simulated IOC worker {n} exiting");
                })?;
            senders.push(tx);
        }
        Ok(SimulatedIoc {
            shared: Arc::new(SimShared {
                state: Mutex::new(SimState {
                    exception_handler: None,
                    pvs: HashMap::new(),
                    channels: HashMap::new(),
                    subscriptions: HashMap::new(),
                    next_id: 1,
                    paused: false,
                    held: Vec::new(),
                    flush_error: None,
                }),
                workers: senders,
            }),
        })
    }

    /// Serve a new PV holding `value`
    pub fn add_pv(&self, name: &str, value: impl Into<Generic>) -> Result<(), SimError> {
        self.add_pv_with(name, SimPv::new(value))
    }

    /// Serve a new PV with full metadata. Channels already searching for the
    /// name connect.
    pub fn add_pv_with(&self, name: &str, mut pv: SimPv) -> Result<(), SimError> {
        if pv.value.get_type() == GenericType::UnsignedLong {
            pv.value = pv.value.convert_to(GenericType::Long)?;
        }
        if pv.native_type().is_none() {
            return Err(SimError::Unrepresentable(pv.value.get_type()));
        }
        let mut state = self.shared.lock();
        if state.pvs.contains_key(name) {
            return Err(SimError::AlreadyExists(name.to_string()));
        }
        let online = pv.online;
        state.pvs.insert(name.to_string(), pv);
        debug!("Simulated IOC: Serving {name}");
        if online {
            self.shared.set_channels(&mut state, name, true);
        }
        Ok(())
    }

    /// Store a new value, timestamped now, and notify subscribers
    pub fn set_value(&self, name: &str, value: impl Into<Generic>) -> Result<(), SimError> {
        let mut state = self.shared.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| SimError::NoSuchPv(name.to_string()))?;
        pv.store(&value.into())?;
        trace!("Simulated IOC: {name} = {}", pv.value);
        self.shared.notify(&mut state, name, true, false);
        Ok(())
    }

    /// Store a value with an explicit alarm state and timestamp
    pub fn set_value_with(
        &self,
        name: &str,
        value: impl Into<Generic>,
        status: Status,
        timestamp: EpicsTimeStamp,
    ) -> Result<(), SimError> {
        let mut state = self.shared.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| SimError::NoSuchPv(name.to_string()))?;
        pv.store(&value.into())?;
        let alarm_changed = pv.status != status;
        pv.status = status;
        pv.timestamp = timestamp;
        self.shared.notify(&mut state, name, true, alarm_changed);
        Ok(())
    }

    pub fn set_alarm(&self, name: &str, status: i16, severity: i16) -> Result<(), SimError> {
        let mut state = self.shared.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| SimError::NoSuchPv(name.to_string()))?;
        pv.status = Status { status, severity };
        pv.timestamp = EpicsTimeStamp::now();
        self.shared.notify(&mut state, name, false, true);
        Ok(())
    }

    /// Take a PV off the network, or bring it back
    ///
    /// Channels on the PV see a connection change. Subscriptions survive, and
    /// are sent the current value again on reconnection.
    pub fn set_online(&self, name: &str, online: bool) -> Result<(), SimError> {
        let mut state = self.shared.lock();
        let pv = state
            .pvs
            .get_mut(name)
            .ok_or_else(|| SimError::NoSuchPv(name.to_string()))?;
        if pv.online == online {
            return Ok(());
        }
        pv.online = online;
        debug!(
            "Simulated IOC: {name} going {}",
            if online { "online" } else { "offline" }
        );
        self.shared.set_channels(&mut state, name, online);
        if online {
            self.shared.notify(&mut state, name, true, true);
        }
        Ok(())
    }

    /// Report an asynchronous exception through the context handler
    pub fn raise_exception(&self, channel: Option<u64>, error: CaError, context: &str) {
        let mut state = self.shared.lock();
        let Some(handler) = state.exception_handler.clone() else {
            warn!("Simulated IOC: Exception raised with no context: {error}");
            return;
        };
        let args = ExceptionArgs {
            channel,
            error,
            context: context.to_string(),
        };
        self.shared
            .dispatch(&mut state, channel.unwrap_or(0), Box::new(move || handler(args)));
    }

    /// Hold back all callbacks until [`SimulatedIoc::resume_callbacks`]
    pub fn pause_callbacks(&self) {
        self.shared.lock().paused = true;
    }

    /// Deliver everything held back, in order
    pub fn resume_callbacks(&self) {
        let mut state = self.shared.lock();
        state.paused = false;
        let held = std::mem::take(&mut state.held);
        for (channel, job) in held {
            self.shared.dispatch(&mut state, channel, job);
        }
    }

    /// Make every flush fail with `error`, or succeed again with `None`
    pub fn set_flush_error(&self, error: Option<CaError>) {
        self.shared.lock().flush_error = error;
    }

    pub fn value(&self, name: &str) -> Option<Generic> {
        self.shared.lock().pvs.get(name).map(|pv| pv.value.clone())
    }

    pub fn channel_count(&self) -> usize {
        self.shared.lock().channels.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.lock().subscriptions.len()
    }

    /// Look up a connected channel and the PV it is attached to
    fn connected_pv<'a>(state: &'a SimState, channel: u64) -> Result<&'a SimPv, CaError> {
        let chan = state.channels.get(&channel).ok_or(CaError::BadChannel)?;
        if !chan.connected {
            return Err(CaError::Disconnected);
        }
        state.pvs.get(&chan.name).ok_or(CaError::Disconnected)
    }

    /// Apply a put, returning the PV name written to
    fn write(
        &self,
        state: &mut SimState,
        channel: u64,
        data_type: DbrType,
        count: usize,
        data: &[u8],
    ) -> Result<String, CaError> {
        let pv = Self::connected_pv(state, channel)?;
        if !pv.writable {
            return Err(CaError::NoWriteAccess);
        }
        let value = Dbr::from_bytes(data_type, count, data)
            .map_err(|_| CaError::BadType)?
            .take_value();
        let name = state
            .channels
            .get(&channel)
            .map(|c| c.name.clone())
            .ok_or(CaError::BadChannel)?;
        let pv = state.pvs.get_mut(&name).ok_or(CaError::Disconnected)?;
        pv.store(&value).map_err(|_| CaError::BadType)?;
        debug!("Simulated IOC: Write {name} = {}", pv.value);
        Ok(name)
    }
}

impl CaBackend for SimulatedIoc {
    fn create_context(&self, exception_handler: ExceptionHandler) -> CaStatus {
        let mut state = self.shared.lock();
        if state.exception_handler.is_some() {
            debug!("Simulated IOC: Replacing context exception handler");
        }
        state.exception_handler = Some(exception_handler);
        Ok(())
    }

    fn create_channel(
        &self,
        name: &str,
        handler: ConnectionHandler,
        user: u64,
    ) -> Result<u64, CaError> {
        let mut state = self.shared.lock();
        if state.exception_handler.is_none() {
            return Err(CaError::NoContext);
        }
        if name.is_empty() {
            return Err(CaError::BadChannel);
        }
        let channel = wrapping_inplace_add(&mut state.next_id);
        let connected = state.pvs.get(name).is_some_and(|pv| pv.online);
        state.channels.insert(
            channel,
            SimChannel {
                name: name.to_string(),
                handler: handler.clone(),
                user,
                connected,
            },
        );
        debug!("Simulated IOC: Channel {channel} created for {name}");
        if connected {
            let args = ConnectionArgs {
                channel,
                user,
                op: ConnectionOp::Up,
            };
            self.shared
                .dispatch(&mut state, channel, Box::new(move || handler(args)));
        }
        Ok(channel)
    }

    fn clear_channel(&self, channel: u64) -> CaStatus {
        let mut state = self.shared.lock();
        if state.channels.remove(&channel).is_none() {
            return Err(CaError::BadChannel);
        }
        state.subscriptions.retain(|_, s| s.channel != channel);
        debug!("Simulated IOC: Channel {channel} cleared");
        Ok(())
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
        let mut state = self.shared.lock();
        let args = Self::connected_pv(&state, channel)?.event(channel, user, data_type, count);
        let id = wrapping_inplace_add(&mut state.next_id);
        state.subscriptions.insert(
            id,
            SimSubscription {
                channel,
                data_type,
                count,
                mask,
                handler: handler.clone(),
                user,
            },
        );
        debug!("Simulated IOC: Subscription {id} on channel {channel} as {data_type} ({mask})");
        // Subscribers are always sent the current value first
        self.shared
            .dispatch(&mut state, channel, Box::new(move || handler(args)));
        Ok(id)
    }

    fn clear_subscription(&self, subscription: u64) -> CaStatus {
        match self.shared.lock().subscriptions.remove(&subscription) {
            Some(_) => Ok(()),
            None => Err(CaError::BadChannel),
        }
    }

    fn get_callback(
        &self,
        channel: u64,
        data_type: DbrType,
        count: usize,
        handler: EventHandler,
        user: u64,
    ) -> CaStatus {
        let mut state = self.shared.lock();
        let args = Self::connected_pv(&state, channel)?.event(channel, user, data_type, count);
        self.shared
            .dispatch(&mut state, channel, Box::new(move || handler(args)));
        Ok(())
    }

    fn put(&self, channel: u64, data_type: DbrType, count: usize, data: &[u8]) -> CaStatus {
        let mut state = self.shared.lock();
        let name = self.write(&mut state, channel, data_type, count, data)?;
        self.shared.notify(&mut state, &name, true, false);
        Ok(())
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
        let mut state = self.shared.lock();
        Self::connected_pv(&state, channel)?;
        let status = match self.write(&mut state, channel, data_type, count, data) {
            Ok(name) => {
                self.shared.notify(&mut state, &name, true, false);
                Ok(())
            }
            Err(CaError::NoWriteAccess) => return Err(CaError::NoWriteAccess),
            Err(error) => Err(error),
        };
        let args = EventArgs {
            channel,
            user,
            status,
            data_type,
            count,
            data: Vec::new(),
        };
        self.shared
            .dispatch(&mut state, channel, Box::new(move || handler(args)));
        Ok(())
    }

    fn channel_info(&self, channel: u64) -> Option<ChannelInfo> {
        let state = self.shared.lock();
        let chan = state.channels.get(&channel)?;
        let pv = state.pvs.get(&chan.name);
        Some(ChannelInfo {
            field_type: pv.and_then(SimPv::native_type),
            element_count: pv.map(|pv| pv.value.array_count()).unwrap_or(0),
            host_name: if chan.connected {
                SIM_HOST_NAME.to_string()
            } else {
                String::new()
            },
            connected: chan.connected,
        })
    }

    fn flush(&self) -> CaStatus {
        match &self.shared.lock().flush_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}
