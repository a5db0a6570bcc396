//! The seam to a native Channel Access client library.
//!
//! A [`CaBackend`] mirrors the C API of `libca`: a context, channels
//! identified by raw `u64` ids, subscriptions, one-shot gets and puts. Every
//! request that completes asynchronously takes a handler and a `u64` user word;
//! the library later invokes the handler with that word from one of its own
//! threads. Nothing here may assume which thread that is.
use std::{fmt, sync::Arc};

use thiserror::Error;

use crate::dbr::{DbrBasicType, DbrType};

pub mod sim;

pub use sim::{SimError, SimPv, SimulatedIoc};

/// Failure codes reported by the native library
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaError {
    #[error("Virtual circuit disconnect")]
    Disconnected,
    #[error("The data type specified is invalid")]
    BadType,
    #[error("Read access denied")]
    NoReadAccess,
    #[error("Write access denied")]
    NoWriteAccess,
    #[error("Invalid element count requested")]
    BadCount,
    #[error("Invalid channel identifier")]
    BadChannel,
    #[error("User specified timeout on IO operation expired")]
    Timeout,
    #[error("A CA context already exists")]
    ContextExists,
    #[error("No CA context has been created")]
    NoContext,
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Completion status of an asynchronous request
pub type CaStatus = Result<(), CaError>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnectionOp {
    Up,
    Down,
}

/// Delivered to a channel's connection handler
#[derive(Debug, Clone)]
pub struct ConnectionArgs {
    pub channel: u64,
    pub user: u64,
    pub op: ConnectionOp,
}

/// Delivered for gets, subscription updates and put completions
///
/// `data` is the raw DBR payload, empty for put completions and failures.
#[derive(Debug, Clone)]
pub struct EventArgs {
    pub channel: u64,
    pub user: u64,
    pub status: CaStatus,
    pub data_type: DbrType,
    pub count: usize,
    pub data: Vec<u8>,
}

/// Delivered to the context exception handler
#[derive(Debug, Clone)]
pub struct ExceptionArgs {
    /// Channel the exception concerns, if any
    pub channel: Option<u64>,
    pub error: CaError,
    pub context: String,
}

pub type ConnectionHandler = Arc<dyn Fn(ConnectionArgs) + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(EventArgs) + Send + Sync>;
pub type ExceptionHandler = Arc<dyn Fn(ExceptionArgs) + Send + Sync>;

/// Which kinds of change trigger a subscription update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorMask {
    pub value: bool,
    pub log: bool,
    pub alarm: bool,
    pub property: bool,
}

impl MonitorMask {
    /// Value and alarm changes, as widgets subscribe
    pub fn value_alarm() -> Self {
        MonitorMask {
            value: true,
            log: false,
            alarm: true,
            property: false,
        }
    }
}

impl Default for MonitorMask {
    fn default() -> Self {
        MonitorMask::value_alarm()
    }
}

impl fmt::Display for MonitorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut flags = String::new();
        for (set, c) in [
            (self.value, 'v'),
            (self.log, 'l'),
            (self.alarm, 'a'),
            (self.property, 'p'),
        ] {
            if set {
                flags.push(c);
            }
        }
        f.write_str(&flags)
    }
}

/// What the library knows about a channel
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChannelInfo {
    pub field_type: Option<DbrBasicType>,
    pub element_count: usize,
    pub host_name: String,
    pub connected: bool,
}

/// A native CA client library
pub trait CaBackend: Send + Sync {
    /// Create the client context. Exceptions not tied to a request are
    /// delivered to `exception_handler`.
    fn create_context(&self, exception_handler: ExceptionHandler) -> CaStatus;

    /// Start connecting a channel, returning its id immediately
    fn create_channel(
        &self,
        name: &str,
        handler: ConnectionHandler,
        user: u64,
    ) -> Result<u64, CaError>;

    /// Disconnect and forget a channel. No further callbacks are issued for it
    /// once this returns, other than any already being delivered.
    fn clear_channel(&self, channel: u64) -> CaStatus;

    /// Subscribe to updates, returning the subscription id
    fn create_subscription(
        &self,
        channel: u64,
        data_type: DbrType,
        count: usize,
        mask: MonitorMask,
        handler: EventHandler,
        user: u64,
    ) -> Result<u64, CaError>;

    fn clear_subscription(&self, subscription: u64) -> CaStatus;

    /// Read once; `count` of zero means the native element count
    fn get_callback(
        &self,
        channel: u64,
        data_type: DbrType,
        count: usize,
        handler: EventHandler,
        user: u64,
    ) -> CaStatus;

    /// Write without completion notification
    fn put(&self, channel: u64, data_type: DbrType, count: usize, data: &[u8]) -> CaStatus;

    /// Write, with `handler` called once the server has processed it
    fn put_callback(
        &self,
        channel: u64,
        data_type: DbrType,
        count: usize,
        data: &[u8],
        handler: EventHandler,
        user: u64,
    ) -> CaStatus;

    fn channel_info(&self, channel: u64) -> Option<ChannelInfo>;

    /// Send any buffered requests
    fn flush(&self) -> CaStatus {
        Ok(())
    }
}
