#[allow(clippy::module_inception)]
mod parse;

pub use parse::{parser, Config, SupervisorConfig};
pub(crate) use parse::duration_secs;
