use std::sync::Arc;

use crate::control::SupervisorHandle;
use crate::error::SupervisorError;
use crate::logger::{LogSink, Sinks};
use crate::parse::SupervisorConfig;
use crate::runtime::Supervisor;
use crate::socket::SocketDataHandler;

/// Builds a [`Supervisor`] from a config plus the options that cannot live in a
/// config file (log sinks, socket data handler).
pub struct SupervisorBuilder {
    config: SupervisorConfig,
    syslog: Option<Arc<dyn LogSink>>,
    errlog: Option<Arc<dyn LogSink>>,
    on_socket_data: Option<SocketDataHandler>,
    event_capacity: usize,
}

impl SupervisorBuilder {
    pub fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            syslog: None,
            errlog: None,
            on_socket_data: None,
            event_capacity: 256,
        }
    }

    /// Sink for informational messages and the child's stdout.
    pub fn with_syslog(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.syslog = Some(sink);
        self
    }

    /// Sink for errors and the child's stderr. Defaults to the syslog sink.
    pub fn with_errlog(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.errlog = Some(sink);
        self
    }

    /// Receives raw bytes sent by socket clients. Without it, client data is
    /// read and discarded and no `socketdata` event fires.
    pub fn with_socket_data_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&[u8], &SupervisorHandle) + Send + Sync + 'static,
    {
        self.on_socket_data = Some(Arc::new(handler));
        self
    }

    /// How many undelivered events a slow subscriber may lag behind.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validates the config and constructs the supervisor. Nothing runs yet.
    pub fn build(self) -> Result<Supervisor, SupervisorError> {
        let config = self.config.validated()?;
        Ok(Supervisor::new(
            config,
            Sinks::new(self.syslog, self.errlog),
            self.on_socket_data,
            self.event_capacity,
        ))
    }
}
