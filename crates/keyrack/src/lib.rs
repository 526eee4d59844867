//! keyrack - Credential resolver for humans and agents
//!
//! "A key you are not allowed to see does not exist."
//!
//! A repo declares which keys it needs (`keyrack.yml`). Each machine keeps
//! an encrypted index of where those keys live (the host manifest) and a
//! set of vaults that hold them. `get` resolves a key through that chain,
//! with a session daemon caching unlocked values so agents never prompt a
//! human twice.
//!
//! Two invariants hold everywhere: a key's grade never silently degrades,
//! and known long-lived token shapes are blocked unless explicitly allowed.

pub mod atomic;
pub mod config;
pub mod daemon;
pub mod envelope;
pub mod error;
pub mod firewall;
pub mod grade;
pub mod grant;
pub mod host;
pub mod mech;
pub mod prompt;
pub mod rack;
pub mod repo_manifest;
pub mod secret;
pub mod session;
pub mod slug;
pub mod vault;

pub use error::{ErrorKind, KeyrackError, Result};
pub use grant::{GetRequest, Grant, GrantResolver, GrantStatus};
pub use rack::{Keyrack, SetRequest};
pub use secret::SecretValue;
pub use slug::Slug;
