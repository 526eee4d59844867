//! `os.daemon`: keys that only ever live in the session daemon
//!
//! Nothing is written to disk. `set` pushes the value into the running
//! session with the given expiry; the key disappears on relock, expiry or
//! daemon exit. `unlock` never fills this vault, so a missing entry is
//! `absent` and the fix is another `set`.

use crate::config::expiry_after;
use crate::daemon::{DaemonClient, SessionEntry};
use crate::error::{KeyrackError, Result};
use crate::mech::Mechanism;
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

pub struct DaemonVault {
    client: DaemonClient,
    owner: Option<String>,
    default_ttl: chrono::Duration,
}

impl DaemonVault {
    pub fn new(client: DaemonClient, owner: Option<String>, default_ttl: chrono::Duration) -> Self {
        Self {
            client,
            owner,
            default_ttl,
        }
    }
}

#[async_trait]
impl Vault for DaemonVault {
    fn kind(&self) -> VaultKind {
        VaultKind::OsDaemon
    }

    async fn unlock(&self, _passphrase: Option<&SecretValue>, _silent: bool) -> Result<()> {
        Ok(())
    }

    async fn is_unlocked(&self) -> bool {
        self.client.is_running().await
    }

    /// A daemon that is down or slow reads as empty
    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        match self.client.get(self.owner.as_deref(), req.slug).await {
            Ok(entry) => Ok(entry.map(|e| Stored {
                value: e.value,
                expires_at: Some(e.expires_at),
            })),
            Err(e) => {
                debug!(slug = %req.slug, error = %e, "daemon vault miss");
                Ok(None)
            }
        }
    }

    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        let expires_at = match req.expires_at {
            Some(at) => at,
            None => expiry_after(Utc::now(), self.default_ttl)?,
        };
        let entry = SessionEntry {
            slug: req.slug.clone(),
            value: req.value.clone(),
            mech: Mechanism::PermanentViaReplica,
            expires_at,
        };
        self.client
            .unlock(self.owner.as_deref(), vec![entry])
            .await
            .map_err(|e| KeyrackError::vault(VaultKind::OsDaemon.as_str(), e.to_string()))?;
        Ok(())
    }

    /// `unlock` has nothing on disk to load; the value has to be set again
    fn unlock_hint(&self, env: &str, owner: Option<&str>) -> String {
        match owner {
            Some(owner) => format!(
                "run `keyrack set --env {} --vault os.daemon --for {}`",
                env, owner
            ),
            None => format!("run `keyrack set --env {} --vault os.daemon`", env),
        }
    }

    async fn del(&self, slug: &Slug, _exid: Option<&str>) -> Result<()> {
        if let Err(e) = self.client.relock(self.owner.as_deref(), None, Some(slug)).await {
            debug!(slug = %slug, error = %e, "daemon not reachable for delete");
        }
        Ok(())
    }
}
