//! cpacfstatsd - privileged daemon fronting the CPACF activity counters
//!
//! Unprivileged clients connect to a local socket, send one query and read a
//! stream of answers until the daemon closes the connection.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               cpacfstatsd                │
//! ├──────────────────────────────────────────┤
//! │  server   │  dispatch   │  lifecycle     │
//! │  (socket) │  (streams)  │  (pid, detach) │
//! ├──────────────────────────────────────────┤
//! │          Backend (perf / memory)         │
//! └──────────────────────────────────────────┘
//! ```
//!
//! One connection is served at a time. A termination signal unblocks the
//! backend and the accept loop exits once the in-flight connection is done.

pub mod client;
pub mod dispatch;
pub mod lifecycle;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use client::DaemonClient;
pub use dispatch::{AnswerSink, DispatchOutcome, Dispatcher};
pub use lifecycle::{daemonize, PidFile, PidGuard};
pub use protocol::{Answer, Query, PROTOCOL_VERSION};
pub use server::DaemonServer;
pub use shutdown::{stop_on_signal, Shutdown};
