//! `1password`: values stay in 1Password, keyrack keeps the reference
//!
//! The `exid` is an `op://vault/item/field` reference read with the `op`
//! cli at grant time.

use crate::error::{KeyrackError, Result};
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

pub struct OnePasswordVault {
    cli: String,
}

impl Default for OnePasswordVault {
    fn default() -> Self {
        Self::new("op")
    }
}

impl OnePasswordVault {
    pub fn new(cli: impl Into<String>) -> Self {
        Self { cli: cli.into() }
    }

    fn require_exid<'a>(slug: &Slug, exid: Option<&'a str>) -> Result<&'a str> {
        exid.filter(|e| !e.is_empty()).ok_or_else(|| {
            KeyrackError::InvalidInput(format!(
                "{} in 1password needs --exid op://<vault>/<item>/<field>",
                slug
            ))
        })
    }
}

#[async_trait]
impl Vault for OnePasswordVault {
    fn kind(&self) -> VaultKind {
        VaultKind::OnePassword
    }

    async fn unlock(&self, _passphrase: Option<&SecretValue>, _silent: bool) -> Result<()> {
        if self.is_unlocked().await {
            Ok(())
        } else {
            Err(KeyrackError::UnlockFailed(
                "1password cli is not signed in; run `op signin`".to_string(),
            ))
        }
    }

    async fn is_unlocked(&self) -> bool {
        Command::new(&self.cli)
            .arg("whoami")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        let exid = Self::require_exid(req.slug, req.exid)?;

        let output = Command::new(&self.cli)
            .args(["read", "--no-newline", exid])
            .output()
            .await
            .map_err(|e| KeyrackError::vault("1password", format!("failed to run {}: {}", self.cli, e)))?;

        if !output.status.success() {
            debug!(slug = %req.slug, code = ?output.status.code(), "op read failed");
            return Ok(None);
        }

        let value = String::from_utf8(output.stdout)
            .map_err(|_| KeyrackError::vault("1password", "value is not valid UTF-8"))?;
        Ok(Some(Stored::new(SecretValue::new(value))))
    }

    /// Only the reference is recorded; the value is managed in 1Password
    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        Self::require_exid(req.slug, req.exid)?;
        Ok(())
    }

    async fn del(&self, _slug: &Slug, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn unlock_hint(&self, _env: &str, _owner: Option<&str>) -> String {
        "run `op signin`".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn fake_op(dir: &TempDir, script: &str) -> String {
        let path = dir.path().join("op");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_reads_reference() {
        let tmp = TempDir::new().unwrap();
        let cli = fake_op(
            &tmp,
            r#"case "$1" in whoami) exit 0;; read) printf 'from-op';; esac"#,
        );
        let vault = OnePasswordVault::new(cli);
        let slug: Slug = "acme.prod.API_KEY".parse().unwrap();

        assert!(vault.is_unlocked().await);
        let got = vault
            .get(VaultGet {
                slug: &slug,
                exid: Some("op://dev/api/credential"),
                vault_recipient: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.value.expose(), "from-op");
    }

    #[tokio::test]
    async fn test_signed_out_is_locked() {
        let tmp = TempDir::new().unwrap();
        let vault = OnePasswordVault::new(fake_op(&tmp, "exit 1"));
        assert!(!vault.is_unlocked().await);
        assert!(matches!(
            vault.unlock(None, true).await,
            Err(KeyrackError::UnlockFailed(_))
        ));
        assert_eq!(vault.unlock_hint("prod", None), "run `op signin`");
    }

    #[tokio::test]
    async fn test_exid_required() {
        let vault = OnePasswordVault::new("op");
        let slug: Slug = "acme.prod.API_KEY".parse().unwrap();
        let value = SecretValue::new("ignored");
        let err = vault
            .set(VaultSet {
                slug: &slug,
                value: &value,
                env: "prod",
                org: "acme",
                exid: None,
                expires_at: None,
                vault_recipient: None,
                recipients: &[],
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("--exid"));
    }
}
