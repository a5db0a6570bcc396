//! Connection and data streaming core for EPICS Channel Access clients.
//!
//! This crate sits between a Channel Access client library, which calls back
//! on threads of its own, and consumers (typically display widgets) that want
//! to deal with one PV at a time from a single thread. It is layered as:
//!
//! - [`Generic`], a typed value container with the conversions consumers need.
//! - [`dbr`], decoding the `DBR_*` payloads delivered with each callback.
//! - [`CaRefRegistry`], handing out generation-checked handles that are passed
//!   to the library as callback user data instead of pointers, so callbacks for
//!   objects that have gone away are dropped rather than delivered.
//! - [`CaConnection`], owning the context, channel and subscription handles and
//!   the link and channel state.
//! - [`CaObject`], the callback trampolines that decode data into a
//!   [`CaRecord`] and report each outcome as a [`CaCallback`].
//! - [`QcaObject`], which queues those notifications, hands them to its
//!   [`EventLoop`] to be processed in order, drives the request
//!   [state machines](state_machine), and emits data, connection and user
//!   message signals.
//!
//! The library itself is abstracted as [`CaBackend`]. A [`SimulatedIoc`] is
//! included which serves PVs from memory, calling back from worker threads
//! much as a real client library would.
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use caflow::{Config, QcaContext, QcaObject, SimulatedIoc};
//!
//! # fn main() -> std::io::Result<()> {
//! let ioc = SimulatedIoc::new(2)?;
//! ioc.add_pv("TEST:PV", 3.14f64).unwrap();
//!
//! let context = QcaContext::new(Arc::new(ioc), Config::default());
//! let mut event_loop = context.event_loop();
//! let pv = QcaObject::new("TEST:PV", &context, &event_loop.handle());
//! let mut data = pv.data_changed();
//! pv.subscribe().unwrap();
//!
//! // Normally driven by `EventLoop::run`
//! while data.try_recv().is_err() {
//!     event_loop.process_pending();
//! }
//! # Ok(())
//! # }
//! ```

pub mod alarm;
pub mod backend;
pub mod caref;
pub mod connection;
pub mod context;
pub mod dbr;
pub mod event_filter;
pub mod event_loop;
pub mod generic;
pub mod object;
pub mod qca_object;
pub mod record;
pub mod signals;
pub mod state_machine;
mod utils;

pub use crate::alarm::{AlarmInfo, AlarmSeverity};
pub use crate::backend::{CaBackend, CaError, SimulatedIoc};
pub use crate::caref::{CaRef, CaRefRegistry};
pub use crate::connection::{CaConnection, ChannelState, LinkState, RequestError};
pub use crate::context::{Config, QcaContext};
pub use crate::event_loop::{EventLoop, EventLoopHandle};
pub use crate::generic::{Generic, GenericError, GenericType};
pub use crate::object::{CaCallback, CaObject, CallbackReason};
pub use crate::qca_object::{Operation, QcaError, QcaObject};
pub use crate::record::CaRecord;
pub use crate::signals::{ConnectionInfo, DataUpdate, MessageKind, UserMessage};
