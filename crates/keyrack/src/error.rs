//! Error types for keyrack
//!
//! Every structural failure is a `KeyrackError`. The outcomes of a `get`
//! (locked, absent, blocked) are not errors; see [`crate::grant::Grant`].
//!
//! Messages describe what failed, never what a secret value was.

use std::path::PathBuf;
use thiserror::Error;

/// Broad classification used for exit codes and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input: manifest, pubkey, label, duration
    Validation,
    /// A referenced file or record does not exist
    NotFound,
    /// An operation would weaken protection
    Security,
    /// Vault, daemon or external exchange failed at runtime
    Runtime,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not-found",
            Self::Security => "security",
            Self::Runtime => "runtime",
        }
    }
}

#[derive(Error, Debug)]
pub enum KeyrackError {
    #[error("malformed manifest {path}: {reason}")]
    MalformedManifest { path: PathBuf, reason: String },

    #[error("invalid public key: {0}")]
    InvalidPubkey(String),

    #[error("recipient label already in use: {0}")]
    DuplicateRecipient(String),

    #[error("cannot remove recipient '{0}': a host manifest needs at least one recipient")]
    LastRecipient(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid duration '{0}': expected <n>s|m|h|d|w")]
    InvalidDuration(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("key '{key}' is declared in several envs ({envs}); pass --env")]
    AmbiguousEnv { key: String, envs: String },

    #[error("extended keyrack not found: {0}")]
    ExtendsNotFound(PathBuf),

    #[error("repo manifest not found: {0}")]
    RepoManifestNotFound(PathBuf),

    #[error("recipient not found: {0}")]
    RecipientNotFound(String),

    #[error("host manifest not initialized for {owner}")]
    HostManifestNotFound { owner: String },

    #[error("circular extends: {0}")]
    CircularExtends(String),

    #[error("grade degradation blocked for {slug}: {reason}")]
    GradeDegraded { slug: String, reason: String },

    #[error("grade requirement not met for {slug}: {reason}")]
    GradeUnsatisfied { slug: String, reason: String },

    #[error("unlock failed: {0}")]
    UnlockFailed(String),

    #[error("vault {vault} unavailable: {reason}")]
    VaultUnavailable { vault: String, reason: String },

    #[error("daemon unavailable: {0}")]
    DaemonUnavailable(String),

    #[error("daemon did not answer within {0}ms")]
    DaemonTimeout(u64),

    #[error("{mech} exchange failed: {reason}")]
    MechExchange { mech: String, reason: String },

    #[error("{mech} is not authorized yet")]
    MechNotAuthorized { mech: String, fix: String },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, KeyrackError>;

impl KeyrackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedManifest { .. }
            | Self::InvalidPubkey(_)
            | Self::DuplicateRecipient(_)
            | Self::LastRecipient(_)
            | Self::InvalidKey(_)
            | Self::InvalidDuration(_)
            | Self::InvalidInput(_)
            | Self::AmbiguousEnv { .. } => ErrorKind::Validation,

            Self::ExtendsNotFound(_)
            | Self::RepoManifestNotFound(_)
            | Self::RecipientNotFound(_)
            | Self::HostManifestNotFound { .. } => ErrorKind::NotFound,

            Self::CircularExtends(_)
            | Self::GradeDegraded { .. }
            | Self::GradeUnsatisfied { .. } => ErrorKind::Security,

            Self::UnlockFailed(_)
            | Self::VaultUnavailable { .. }
            | Self::DaemonUnavailable(_)
            | Self::DaemonTimeout(_)
            | Self::MechExchange { .. }
            | Self::MechNotAuthorized { .. }
            | Self::Encryption(_)
            | Self::Decryption(_)
            | Self::Serialization(_)
            | Self::Io(_) => ErrorKind::Runtime,
        }
    }

    /// Actionable hint for the operator, when one exists
    pub fn fix(&self) -> Option<String> {
        match self {
            Self::HostManifestNotFound { owner } if owner == "default" => {
                Some("run `keyrack init`".to_string())
            }
            Self::HostManifestNotFound { owner } => {
                Some(format!("run `keyrack init --for {}`", owner))
            }
            Self::RepoManifestNotFound(_) => {
                Some("create keyrack.yml or pass --at <path>".to_string())
            }
            Self::UnlockFailed(_) => Some(
                "check the passphrase, or configure an identity listed by the host manifest recipients"
                    .to_string(),
            ),
            Self::LastRecipient(_) => {
                Some("add another recipient with `keyrack recipient set` first".to_string())
            }
            Self::AmbiguousEnv { .. } => Some("pass --env <env>".to_string()),
            Self::GradeDegraded { .. } => Some(
                "store the key in a vault and mechanism at least as strict as before".to_string(),
            ),
            Self::GradeUnsatisfied { .. } => Some(
                "choose a vault/mech that meets the grade declared in keyrack.yml".to_string(),
            ),
            Self::MechNotAuthorized { fix, .. } => Some(fix.clone()),
            Self::DaemonUnavailable(_) | Self::DaemonTimeout(_) => {
                Some("run `keyrack unlock` to start a session".to_string())
            }
            _ => None,
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedManifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn vault(vault: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::VaultUnavailable {
            vault: vault.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn mech(mech: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MechExchange {
            mech: mech.into(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for KeyrackError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds_follow_taxonomy() {
        assert_eq!(
            KeyrackError::DuplicateRecipient("ci".into()).kind(),
            ErrorKind::Validation
        );
        assert_eq!(
            KeyrackError::ExtendsNotFound("a.yml".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            KeyrackError::CircularExtends("a -> b -> a".into()).kind(),
            ErrorKind::Security
        );
        assert_eq!(KeyrackError::DaemonTimeout(500).kind(), ErrorKind::Runtime);
    }

    #[test]
    fn test_unlock_failure_is_not_a_lookup_outcome() {
        let err = KeyrackError::UnlockFailed("wrong passphrase".into());
        assert_eq!(err.kind(), ErrorKind::Runtime);
        assert!(err.fix().is_some());
    }

    #[test]
    fn test_extends_message() {
        let err = KeyrackError::ExtendsNotFound("../shared/keyrack.yml".into());
        assert!(err.to_string().contains("extended keyrack not found"));
    }

    #[test]
    fn test_owner_fix_hint() {
        let err = KeyrackError::HostManifestNotFound {
            owner: "ci".to_string(),
        };
        assert_eq!(err.fix().as_deref(), Some("run `keyrack init --for ci`"));
    }
}
