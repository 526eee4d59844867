//! `os.direct`: plaintext JSON file for low-sensitivity dev values

use crate::atomic;
use crate::error::{KeyrackError, Result};
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

const STORE_FILE: &str = "direct.json";

/// Values at rest carry no expiry; `max_duration` bounds session entries only
#[derive(Debug, Serialize, Deserialize)]
struct DirectRecord {
    value: SecretValue,
}

pub struct DirectVault {
    path: PathBuf,
}

impl DirectVault {
    /// `dir` is the owner-scoped vault directory
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(STORE_FILE),
        }
    }

    fn load(&self) -> Result<BTreeMap<String, DirectRecord>> {
        if !self.path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = std::fs::read(&self.path)?;
        serde_json::from_slice(&content)
            .map_err(|_| KeyrackError::malformed(&self.path, "not a direct vault store"))
    }

    fn save(&self, records: &BTreeMap<String, DirectRecord>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(records)?;
        atomic::write_private(&self.path, &bytes)
    }
}

#[async_trait]
impl Vault for DirectVault {
    fn kind(&self) -> VaultKind {
        VaultKind::OsDirect
    }

    async fn unlock(&self, _passphrase: Option<&SecretValue>, _silent: bool) -> Result<()> {
        Ok(())
    }

    async fn is_unlocked(&self) -> bool {
        true
    }

    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        let records = self.load()?;
        Ok(records
            .get(&req.slug.to_string())
            .map(|r| Stored::new(r.value.clone())))
    }

    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        let mut records = self.load()?;
        records.insert(
            req.slug.to_string(),
            DirectRecord {
                value: req.value.clone(),
            },
        );
        self.save(&records)?;
        debug!(slug = %req.slug, "stored direct value");
        Ok(())
    }

    async fn del(&self, slug: &Slug, _exid: Option<&str>) -> Result<()> {
        let mut records = self.load()?;
        if records.remove(&slug.to_string()).is_some() {
            self.save(&records)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set_req<'a>(slug: &'a Slug, value: &'a SecretValue) -> VaultSet<'a> {
        VaultSet {
            slug,
            value,
            env: "test",
            org: "acme",
            exid: None,
            expires_at: None,
            vault_recipient: None,
            recipients: &[],
        }
    }

    #[tokio::test]
    async fn test_set_get_del() {
        let tmp = TempDir::new().unwrap();
        let vault = DirectVault::new(tmp.path());
        let slug: Slug = "acme.test.DEV_TOKEN".parse().unwrap();
        let get = VaultGet {
            slug: &slug,
            exid: None,
            vault_recipient: None,
        };

        assert!(vault.get(get).await.unwrap().is_none());

        let value = SecretValue::new("dev-only");
        vault.set(set_req(&slug, &value)).await.unwrap();
        assert_eq!(vault.get(get).await.unwrap().unwrap().value.expose(), "dev-only");

        vault.del(&slug, None).await.unwrap();
        assert!(vault.get(get).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_expiry_not_kept_at_rest() {
        let tmp = TempDir::new().unwrap();
        let vault = DirectVault::new(tmp.path());
        let slug: Slug = "acme.test.DEV_TOKEN".parse().unwrap();
        let value = SecretValue::new("dev-only");

        let mut req = set_req(&slug, &value);
        req.expires_at = Some(chrono::Utc::now() - chrono::Duration::minutes(5));
        vault.set(req).await.unwrap();

        let stored = vault
            .get(VaultGet {
                slug: &slug,
                exid: None,
                vault_recipient: None,
            })
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.value.expose(), "dev-only");
        assert!(stored.expires_at.is_none());
        let raw = std::fs::read_to_string(tmp.path().join(STORE_FILE)).unwrap();
        assert!(!raw.contains("expiresAt"));
    }
}
