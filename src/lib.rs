pub mod backend;
pub mod clienv;
pub mod config;
pub mod counters;
pub mod daemon;
pub mod error;
pub mod logging;

pub use config::DaemonConfig;
pub use error::{BackendError, DaemonError, ProtocolError, Result};
