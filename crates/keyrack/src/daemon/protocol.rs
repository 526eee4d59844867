//! Daemon wire protocol
//!
//! One JSON request per connection, written then half-closed; one JSON
//! response read to end of stream.

use crate::mech::Mechanism;
use crate::secret::SecretValue;
use crate::slug::Slug;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value held by the daemon for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    pub slug: Slug,
    pub value: SecretValue,
    pub mech: Mechanism,
    pub expires_at: DateTime<Utc>,
}

impl SessionEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Status,
    Unlock {
        #[serde(default)]
        owner: Option<String>,
        entries: Vec<SessionEntry>,
    },
    Get {
        #[serde(default)]
        owner: Option<String>,
        slug: Slug,
    },
    /// Clears one key, one env, or (both unset) every entry of the owner
    Relock {
        #[serde(default)]
        owner: Option<String>,
        #[serde(default)]
        env: Option<String>,
        #[serde(default)]
        slug: Option<Slug>,
    },
    Stop,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Unlock { .. } => "unlock",
            Self::Get { .. } => "get",
            Self::Relock { .. } => "relock",
            Self::Stop => "stop",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        pid: u32,
        entries: usize,
        started_at: DateTime<Utc>,
    },
    Unlocked {
        count: usize,
    },
    Value {
        entry: Option<SessionEntry>,
    },
    Relocked {
        count: usize,
    },
    Stopping,
    Error {
        message: String,
    },
}
