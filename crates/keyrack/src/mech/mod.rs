//! Credential mechanisms
//!
//! A mechanism says how a stored value becomes the credential handed to a
//! caller:
//! - `PERMANENT_VIA_REPLICA`: the stored value is the credential
//! - `EPHEMERAL_VIA_GITHUB_APP`: app key → installation token
//! - `EPHEMERAL_VIA_AWS_SSO`: sso profile → session credentials
//! - `EPHEMERAL_VIA_GITHUB_OIDC`: audience → actions id token
//!
//! Every strategy returns the same `MechOutput`, so the grant resolver never
//! cares which protocol produced a credential.

pub mod aws_sso;
pub mod github_app;
pub mod github_oidc;

use crate::error::{KeyrackError, Result};
use crate::grade::Duration;
use crate::secret::SecretValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Mechanism {
    PermanentViaReplica,
    EphemeralViaGithubApp,
    EphemeralViaAwsSso,
    EphemeralViaGithubOidc,
}

impl Mechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PermanentViaReplica => "PERMANENT_VIA_REPLICA",
            Self::EphemeralViaGithubApp => "EPHEMERAL_VIA_GITHUB_APP",
            Self::EphemeralViaAwsSso => "EPHEMERAL_VIA_AWS_SSO",
            Self::EphemeralViaGithubOidc => "EPHEMERAL_VIA_GITHUB_OIDC",
        }
    }

    pub fn all() -> &'static [Self] {
        &[
            Self::PermanentViaReplica,
            Self::EphemeralViaGithubApp,
            Self::EphemeralViaAwsSso,
            Self::EphemeralViaGithubOidc,
        ]
    }

    /// Lifetime of the credentials this mechanism grants
    pub fn duration(&self) -> Duration {
        match self {
            Self::PermanentViaReplica => Duration::Permanent,
            _ => Duration::Ephemeral,
        }
    }

    pub fn is_replica(&self) -> bool {
        matches!(self, Self::PermanentViaReplica)
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mechanism {
    type Err = KeyrackError;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_uppercase().replace(['-', '.'], "_");
        Self::all()
            .iter()
            .copied()
            .find(|m| m.as_str() == normalized)
            .ok_or_else(|| {
                KeyrackError::InvalidInput(format!(
                    "unknown mechanism '{}' (expected one of: {})",
                    s,
                    Self::all()
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

/// Normalized result of every mechanism
#[derive(Debug, Clone)]
pub struct MechOutput {
    pub value: SecretValue,
    pub expires_at: Option<DateTime<Utc>>,
}

/// External endpoints and tools the ephemeral mechanisms talk to
#[derive(Debug, Clone)]
pub struct MechContext {
    pub http: reqwest::Client,
    pub github_api: String,
    pub aws_cli: String,
    /// `(ACTIONS_ID_TOKEN_REQUEST_URL, ACTIONS_ID_TOKEN_REQUEST_TOKEN)`
    pub oidc_request: Option<(String, SecretValue)>,
}

impl MechContext {
    pub fn from_env() -> Self {
        let oidc_request = match (
            std::env::var(github_oidc::REQUEST_URL_ENV),
            std::env::var(github_oidc::REQUEST_TOKEN_ENV),
        ) {
            (Ok(url), Ok(token)) if !url.is_empty() && !token.is_empty() => {
                Some((url, SecretValue::new(token)))
            }
            _ => None,
        };

        Self {
            http: reqwest::Client::new(),
            github_api: "https://api.github.com".to_string(),
            aws_cli: "aws".to_string(),
            oidc_request,
        }
    }
}

/// Turn a stored value into the credential a caller receives
pub async fn translate(
    mech: Mechanism,
    stored: SecretValue,
    stored_expires_at: Option<DateTime<Utc>>,
    ctx: &MechContext,
) -> Result<MechOutput> {
    debug!(mech = %mech, "translating stored value");
    match mech {
        Mechanism::PermanentViaReplica => Ok(MechOutput {
            value: stored,
            expires_at: stored_expires_at,
        }),
        Mechanism::EphemeralViaGithubApp => github_app::exchange(&stored, ctx).await,
        Mechanism::EphemeralViaAwsSso => aws_sso::exchange(&stored, ctx).await,
        Mechanism::EphemeralViaGithubOidc => github_oidc::exchange(&stored, ctx).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mechanism() {
        assert_eq!(
            "PERMANENT_VIA_REPLICA".parse::<Mechanism>().unwrap(),
            Mechanism::PermanentViaReplica
        );
        assert_eq!(
            "ephemeral-via-aws-sso".parse::<Mechanism>().unwrap(),
            Mechanism::EphemeralViaAwsSso
        );
        assert!("VIA_CARRIER_PIGEON".parse::<Mechanism>().is_err());
    }

    #[test]
    fn test_serde_names_match_as_str() {
        for mech in Mechanism::all() {
            let json = serde_json::to_string(mech).unwrap();
            assert_eq!(json, format!("\"{}\"", mech.as_str()));
        }
    }

    #[test]
    fn test_durations() {
        assert_eq!(Mechanism::PermanentViaReplica.duration(), Duration::Permanent);
        assert_eq!(Mechanism::EphemeralViaGithubApp.duration(), Duration::Ephemeral);
    }

    #[tokio::test]
    async fn test_replica_passes_through() {
        let ctx = MechContext::from_env();
        let out = translate(
            Mechanism::PermanentViaReplica,
            SecretValue::new("stored"),
            None,
            &ctx,
        )
        .await
        .unwrap();
        assert_eq!(out.value.expose(), "stored");
        assert!(out.expires_at.is_none());
    }
}
