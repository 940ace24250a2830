/* src/lib.rs */

// Re-export modules for both binary and tests
pub mod builder;
pub mod control;
pub mod error;
pub mod event;
pub mod installer;
pub mod logger;
pub mod parse;
pub mod policy;
pub mod protocol;
pub mod runtime;
pub mod shell;
pub mod socket;
pub mod watch;

pub use builder::SupervisorBuilder;
pub use control::{Status, SupervisorHandle};
pub use error::{ConfigError, SupervisorError};
pub use event::Event;
pub use logger::LogSink;
pub use parse::SupervisorConfig;
pub use policy::RestartLimit;
pub use runtime::{ExitInfo, Supervisor, Termination};
