//! AWS SSO session credentials
//!
//! The stored value is only a profile name. The aws cli resolves it against
//! its own sso cache and hands back temporary credentials in the
//! `credential_process` format, which is what the caller receives.

use crate::error::{KeyrackError, Result};
use crate::mech::{MechContext, MechOutput};
use crate::secret::SecretValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

const MECH: &str = "EPHEMERAL_VIA_AWS_SSO";

/// `credential_process` output, version 1
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ProcessCredentials {
    version: u8,
    access_key_id: SecretValue,
    secret_access_key: SecretValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_token: Option<SecretValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    expiration: Option<DateTime<Utc>>,
}

pub async fn exchange(profile: &SecretValue, ctx: &MechContext) -> Result<MechOutput> {
    let profile = profile.expose().trim();
    if profile.is_empty() {
        return Err(KeyrackError::mech(MECH, "no aws profile recorded for this key"));
    }

    let output = Command::new(&ctx.aws_cli)
        .args([
            "configure",
            "export-credentials",
            "--profile",
            profile,
            "--format",
            "process",
        ])
        .output()
        .await
        .map_err(|e| KeyrackError::mech(MECH, format!("failed to run {}: {}", ctx.aws_cli, e)))?;

    if !output.status.success() {
        debug!(profile = profile, code = ?output.status.code(), "aws export-credentials failed");
        return Err(KeyrackError::MechNotAuthorized {
            mech: MECH.to_string(),
            fix: format!("run `aws sso login --profile {}`", profile),
        });
    }

    let credentials: ProcessCredentials = serde_json::from_slice(&output.stdout)
        .map_err(|_| KeyrackError::mech(MECH, "aws cli returned unexpected credential output"))?;

    let expires_at = credentials.expiration;
    let value = serde_json::to_string(&credentials)?;

    debug!(profile = profile, expires_at = ?expires_at, "exported sso session");

    Ok(MechOutput {
        value: SecretValue::new(value),
        expires_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_aws(dir: &TempDir, script: &str) -> String {
        let path = dir.path().join("aws");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn context(aws_cli: String) -> MechContext {
        MechContext {
            aws_cli,
            ..MechContext::from_env()
        }
    }

    #[tokio::test]
    async fn test_exports_session_credentials() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_aws(
            &tmp,
            r#"echo '{"Version":1,"AccessKeyId":"ASIAEXAMPLE","SecretAccessKey":"s","SessionToken":"t","Expiration":"2030-01-01T00:00:00Z"}'"#,
        );

        let out = exchange(&SecretValue::new("dev"), &context(cli)).await.unwrap();
        assert!(out.value.expose().contains("ASIAEXAMPLE"));
        assert_eq!(
            out.expires_at.unwrap().to_rfc3339(),
            "2030-01-01T00:00:00+00:00"
        );
    }

    #[tokio::test]
    async fn test_expired_session_is_not_authorized() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_aws(&tmp, "echo 'token expired' >&2; exit 255");

        let err = exchange(&SecretValue::new("dev"), &context(cli)).await.unwrap_err();
        match err {
            KeyrackError::MechNotAuthorized { fix, .. } => {
                assert!(fix.contains("aws sso login --profile dev"))
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_profile_rejected() {
        let err = exchange(&SecretValue::new("  "), &MechContext::from_env())
            .await
            .unwrap_err();
        assert!(matches!(err, KeyrackError::MechExchange { .. }));
    }
}
