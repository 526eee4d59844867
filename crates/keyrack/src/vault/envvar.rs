//! `os.envvar`: read-only passthrough from the process environment
//!
//! Lets CI inject a credential under the key's raw name without any vault
//! file. Values still go through the firewall.

use crate::error::{KeyrackError, Result};
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;

#[derive(Debug, Default)]
pub struct EnvVault;

impl EnvVault {
    /// Value of the variable named after the key, if set and non-empty
    pub fn lookup(name: &str) -> Option<SecretValue> {
        std::env::var(name)
            .ok()
            .filter(|v| !v.is_empty())
            .map(SecretValue::new)
    }
}

#[async_trait]
impl Vault for EnvVault {
    fn kind(&self) -> VaultKind {
        VaultKind::OsEnvvar
    }

    async fn unlock(&self, _passphrase: Option<&SecretValue>, _silent: bool) -> Result<()> {
        Ok(())
    }

    async fn is_unlocked(&self) -> bool {
        true
    }

    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        Ok(Self::lookup(&req.slug.name).map(Stored::new))
    }

    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        Err(KeyrackError::vault(
            VaultKind::OsEnvvar.as_str(),
            format!("read-only; export {} instead", req.slug.name),
        ))
    }

    async fn del(&self, _slug: &Slug, _exid: Option<&str>) -> Result<()> {
        Ok(())
    }
}
