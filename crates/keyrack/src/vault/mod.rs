//! Vault adapters
//!
//! A vault is where a key's stored value lives. Every backend implements
//! the same `Vault` contract; the grant resolver and the unlock service only
//! ever see `&dyn Vault`, picked by the `VaultKind` recorded on a host entry.
//!
//! | kind          | stores            | unlock needed        |
//! |---------------|-------------------|----------------------|
//! | `os.envvar`   | nothing (env)     | no                   |
//! | `os.direct`   | plaintext file    | no                   |
//! | `os.secure`   | age file per key  | yes, per process     |
//! | `os.daemon`   | session memory    | via `keyrack unlock` |
//! | `1password`   | reference (exid)  | `op signin`          |
//! | `aws.iam.sso` | profile (exid)    | `aws sso login`      |

pub mod aws_sso;
pub mod daemon;
pub mod direct;
pub mod envvar;
pub mod onepassword;
pub mod secure;

use crate::error::{KeyrackError, Result};
use crate::grade::{Duration, Grade, Protection};
use crate::mech::Mechanism;
use crate::secret::SecretValue;
use crate::slug::Slug;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VaultKind {
    #[serde(rename = "os.envvar")]
    OsEnvvar,
    #[serde(rename = "os.direct")]
    OsDirect,
    #[serde(rename = "os.secure")]
    OsSecure,
    #[serde(rename = "os.daemon")]
    OsDaemon,
    #[serde(rename = "1password")]
    OnePassword,
    #[serde(rename = "aws.iam.sso")]
    AwsIamSso,
}

impl VaultKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OsEnvvar => "os.envvar",
            Self::OsDirect => "os.direct",
            Self::OsSecure => "os.secure",
            Self::OsDaemon => "os.daemon",
            Self::OnePassword => "1password",
            Self::AwsIamSso => "aws.iam.sso",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::OsEnvvar,
            Self::OsDirect,
            Self::OsSecure,
            Self::OsDaemon,
            Self::OnePassword,
            Self::AwsIamSso,
        ]
    }

    pub fn protection(&self) -> Protection {
        match self {
            Self::OsEnvvar | Self::OsDirect => Protection::Plaintext,
            _ => Protection::Encrypted,
        }
    }

    /// Backends that keep a reference (`exid`) instead of a value
    pub fn requires_exid(&self) -> bool {
        matches!(self, Self::OnePassword | Self::AwsIamSso)
    }

    /// Backends whose values `unlock` copies into the session daemon
    pub fn is_unlockable(&self) -> bool {
        matches!(self, Self::OsSecure | Self::OsDirect)
    }
}

impl fmt::Display for VaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VaultKind {
    type Err = KeyrackError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let kind = match s.as_str() {
            "os.envvar" | "envvar" => Self::OsEnvvar,
            "os.direct" | "direct" => Self::OsDirect,
            "os.secure" | "secure" => Self::OsSecure,
            "os.daemon" | "daemon" => Self::OsDaemon,
            "1password" | "op" => Self::OnePassword,
            "aws.iam.sso" | "aws-sso" => Self::AwsIamSso,
            _ => {
                return Err(KeyrackError::InvalidInput(format!(
                    "unknown vault '{}' (expected one of: {})",
                    s,
                    Self::all()
                        .iter()
                        .map(|k| k.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )))
            }
        };
        Ok(kind)
    }
}

/// Grade of a key stored in `vault` and granted through `mech`
pub fn grade_of(vault: VaultKind, mech: Mechanism) -> Grade {
    let duration = match vault {
        VaultKind::OsDaemon => Duration::Transient,
        _ => mech.duration(),
    };
    Grade::new(vault.protection(), duration)
}

/// Arguments of `Vault::get`
#[derive(Debug, Clone, Copy)]
pub struct VaultGet<'a> {
    pub slug: &'a Slug,
    pub exid: Option<&'a str>,
    pub vault_recipient: Option<&'a str>,
}

/// Arguments of `Vault::set`
#[derive(Debug, Clone)]
pub struct VaultSet<'a> {
    pub slug: &'a Slug,
    pub value: &'a SecretValue,
    pub env: &'a str,
    pub org: &'a str,
    pub exid: Option<&'a str>,
    /// Session expiry from `max_duration`; only the daemon vault keeps it
    pub expires_at: Option<DateTime<Utc>>,
    pub vault_recipient: Option<&'a str>,
    /// Public keys of the host manifest, the default encryption target
    pub recipients: &'a [String],
}

/// A stored value and its expiry, if the backend tracks one
#[derive(Debug, Clone)]
pub struct Stored {
    pub value: SecretValue,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Stored {
    pub fn new(value: SecretValue) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }
}

#[async_trait]
pub trait Vault: Send + Sync {
    fn kind(&self) -> VaultKind;

    /// Make `get` possible in this process. `silent` forbids prompting.
    async fn unlock(&self, passphrase: Option<&SecretValue>, silent: bool) -> Result<()>;

    async fn is_unlocked(&self) -> bool;

    /// `Ok(None)` when nothing is stored under the slug
    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>>;

    async fn set(&self, req: VaultSet<'_>) -> Result<()>;

    async fn del(&self, slug: &Slug, exid: Option<&str>) -> Result<()>;

    /// Forget whatever `unlock` made available; returns how many keys
    async fn relock(&self, _slug: Option<&Slug>) -> Result<usize> {
        Ok(0)
    }

    /// What the operator runs when this vault reports locked
    fn unlock_hint(&self, env: &str, owner: Option<&str>) -> String {
        match owner {
            Some(owner) => format!("run `keyrack unlock --env {} --for {}`", env, owner),
            None => format!("run `keyrack unlock --env {}`", env),
        }
    }
}

/// One adapter per kind, shared for the lifetime of a command
#[derive(Clone)]
pub struct VaultRegistry {
    vaults: HashMap<VaultKind, Arc<dyn Vault>>,
}

impl VaultRegistry {
    pub fn new(vaults: Vec<Arc<dyn Vault>>) -> Self {
        Self {
            vaults: vaults.into_iter().map(|v| (v.kind(), v)).collect(),
        }
    }

    pub fn get(&self, kind: VaultKind) -> Result<&dyn Vault> {
        self.vaults
            .get(&kind)
            .map(|v| v.as_ref())
            .ok_or_else(|| KeyrackError::vault(kind.as_str(), "no adapter registered"))
    }

    pub fn all(&self) -> impl Iterator<Item = &dyn Vault> {
        self.vaults.values().map(|v| v.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in VaultKind::all() {
            assert_eq!(kind.as_str().parse::<VaultKind>().unwrap(), *kind);
            let json = serde_json::to_string(kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
        assert_eq!("secure".parse::<VaultKind>().unwrap(), VaultKind::OsSecure);
        assert!("keychain".parse::<VaultKind>().is_err());
    }

    #[test]
    fn test_grade_of() {
        assert_eq!(
            grade_of(VaultKind::OsSecure, Mechanism::PermanentViaReplica),
            Grade::new(Protection::Encrypted, Duration::Permanent)
        );
        assert_eq!(
            grade_of(VaultKind::OsDirect, Mechanism::PermanentViaReplica),
            Grade::new(Protection::Plaintext, Duration::Permanent)
        );
        assert_eq!(
            grade_of(VaultKind::AwsIamSso, Mechanism::EphemeralViaAwsSso),
            Grade::new(Protection::Encrypted, Duration::Ephemeral)
        );
        assert_eq!(
            grade_of(VaultKind::OsDaemon, Mechanism::PermanentViaReplica).duration,
            Duration::Transient
        );
    }
}
