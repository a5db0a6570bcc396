//! Configuration and the shared registry every object is created from.
use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use crate::{
    backend::CaBackend,
    caref::CaRefRegistry,
    connection::NativeContext,
    event_filter::EventFilter,
    event_loop::EventLoop,
    object::CaObject,
    utils::{get_default_connection_timeout, get_default_reuse_grace},
};

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// How long a channel may take to connect before it is abandoned
    pub connection_timeout: Duration,
    /// How long a discarded callback handle rests before reuse
    pub reuse_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            connection_timeout: Duration::from_secs(3),
            reuse_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Read the configuration from `QE_*` environment variables
    ///
    /// Values that are not a usable number of seconds keep the default.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Config {
            connection_timeout: Duration::try_from_secs_f32(get_default_connection_timeout())
                .unwrap_or(defaults.connection_timeout),
            reuse_grace: Duration::try_from_secs_f32(get_default_reuse_grace())
                .unwrap_or(defaults.reuse_grace),
        }
    }
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
    pub fn with_reuse_grace(mut self, grace: Duration) -> Self {
        self.reuse_grace = grace;
        self
    }
}

/// Everything the objects of one client share
///
/// Holds the native context, the callback handle registry and the event
/// filter registry. Independent contexts do not interact.
pub struct QcaContext {
    native: Arc<NativeContext>,
    registry: Arc<CaRefRegistry<CaObject>>,
    filter: Arc<EventFilter>,
    config: Config,
    next_object: AtomicU64,
}

impl QcaContext {
    pub fn new(backend: Arc<dyn CaBackend>, config: Config) -> Self {
        QcaContext {
            native: Arc::new(NativeContext::new(backend)),
            registry: Arc::new(CaRefRegistry::new(config.reuse_grace)),
            filter: Arc::new(EventFilter::new()),
            config,
            next_object: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
    pub fn backend(&self) -> &Arc<dyn CaBackend> {
        self.native.backend()
    }
    pub fn native_context(&self) -> &Arc<NativeContext> {
        &self.native
    }
    pub fn registry(&self) -> &Arc<CaRefRegistry<CaObject>> {
        &self.registry
    }
    pub fn event_filter(&self) -> &Arc<EventFilter> {
        &self.filter
    }

    /// Whether the native library context has been created yet
    pub fn context_created(&self) -> bool {
        self.native.is_created()
    }

    /// A new event loop dispatching for objects of this context
    pub fn event_loop(&self) -> EventLoop {
        EventLoop::new(self.filter.clone())
    }

    pub(crate) fn allocate_object_id(&self) -> u64 {
        self.next_object.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_overrides_defaults() {
        let config = Config::default()
            .with_connection_timeout(Duration::from_millis(100));
        assert_eq!(config.connection_timeout, Duration::from_millis(100));
        assert_eq!(config.reuse_grace, Duration::from_secs(5));
    }
}
