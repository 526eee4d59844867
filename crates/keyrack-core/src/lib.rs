//! keyrack-core - Shared functionality for keyrack
//!
//! Where keyrack keeps its per-user state, and how it finds out whether
//! the session daemon is alive.

pub mod daemon;
pub mod paths;
pub mod process;

pub use daemon::{DaemonInfo, DaemonStatus};
pub use paths::Paths;
