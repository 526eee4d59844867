//! Session daemon
//!
//! A per-user process that keeps unlocked values in memory and answers over
//! a unix socket. It is a cache: killing it only means the next `get` reports
//! `locked` again.

pub mod client;
pub mod protocol;
pub mod server;
pub mod spawn;

pub use client::DaemonClient;
pub use protocol::{Request, Response, SessionEntry};
pub use server::{DaemonServer, SessionTable};

/// Name used for the socket, pid and log files
pub const DAEMON_NAME: &str = "keyrack";
