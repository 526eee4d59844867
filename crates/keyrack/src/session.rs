//! Unlock and relock
//!
//! `unlock` opens the host's secure and direct entries for an env (or one
//! key) and pushes them into the session daemon, spawning it if needed.
//! `relock` clears them again, in the daemon and in this process.

use crate::config::{expiry_after, parse_duration};
use crate::daemon::SessionEntry;
use crate::error::{KeyrackError, Result};
use crate::host::KeyHost;
use crate::rack::Keyrack;
use crate::secret::SecretValue;
use crate::slug::{Slug, ALL_ENV};
use crate::vault::{VaultGet, VaultKind};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct UnlockRequest {
    pub env: Option<String>,
    /// Bare key name or `org.env.key`
    pub key: Option<String>,
    pub passphrase: Option<SecretValue>,
    /// Never prompt
    pub silent: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlockReport {
    pub count: usize,
    pub slugs: Vec<Slug>,
    /// True when this call started the daemon
    pub spawned: bool,
}

/// Whether a host entry falls under an unlock or relock selection
fn selected(host: &KeyHost, env: Option<&str>, key: Option<&str>) -> bool {
    let env_ok = match env {
        Some(env) => host.env == env || host.env == ALL_ENV,
        None => true,
    };
    let key_ok = match key {
        Some(key) if Slug::looks_like(key) => host.slug.to_string() == key,
        Some(key) => host.slug.name == key,
        None => true,
    };
    env_ok && key_ok
}

pub async fn unlock(rack: &Keyrack, req: UnlockRequest) -> Result<UnlockReport> {
    let hosts: Vec<KeyHost> = rack
        .list()?
        .into_iter()
        .filter(|h| h.vault.is_unlockable())
        .filter(|h| selected(h, req.env.as_deref(), req.key.as_deref()))
        .collect();

    if let Some(key) = &req.key {
        if hosts.is_empty() {
            return Err(KeyrackError::InvalidInput(format!(
                "no unlockable key '{}' on this host",
                key
            )));
        }
    }

    let mut kinds: Vec<VaultKind> = vec![];
    for host in &hosts {
        if !kinds.contains(&host.vault) {
            kinds.push(host.vault);
        }
    }
    for kind in kinds {
        rack.vaults()
            .get(kind)?
            .unlock(req.passphrase.as_ref(), req.silent)
            .await?;
    }

    let session_ttl = rack.config().daemon.session_ttl()?;
    let now = Utc::now();
    let mut entries = vec![];
    for host in &hosts {
        let stored = rack
            .vaults()
            .get(host.vault)?
            .get(VaultGet {
                slug: &host.slug,
                exid: host.exid.as_deref(),
                vault_recipient: host.vault_recipient.as_deref(),
            })
            .await?;
        let Some(stored) = stored else {
            warn!(slug = %host.slug, vault = %host.vault, "no stored value, skipped");
            continue;
        };

        let ttl = match &host.max_duration {
            Some(max) => parse_duration(max)?.min(session_ttl),
            None => session_ttl,
        };
        let mut expires_at = expiry_after(now, ttl)?;
        if let Some(stored_expiry) = stored.expires_at {
            expires_at = expires_at.min(stored_expiry);
        }

        entries.push(SessionEntry {
            slug: host.slug.clone(),
            value: stored.value,
            mech: host.mech,
            expires_at,
        });
    }

    if entries.is_empty() {
        info!(env = ?req.env, "nothing to unlock");
        return Ok(UnlockReport {
            count: 0,
            slugs: vec![],
            spawned: false,
        });
    }

    let slugs: Vec<Slug> = entries.iter().map(|e| e.slug.clone()).collect();
    let spawned = rack.ensure_daemon().await?;
    let count = rack.daemon().unlock(rack.owner(), entries).await?;

    info!(
        owner = rack.owner().unwrap_or("default"),
        env = ?req.env,
        count = count,
        spawned = spawned,
        "unlocked"
    );
    Ok(UnlockReport {
        count,
        slugs,
        spawned,
    })
}

/// Clear unlocked keys; returns how many session entries went
///
/// A daemon that is not running holds nothing, so it counts as zero.
pub async fn relock(rack: &Keyrack, env: Option<&str>, slug: Option<&Slug>) -> Result<usize> {
    let count = match rack.daemon().relock(rack.owner(), env, slug).await {
        Ok(count) => count,
        Err(KeyrackError::DaemonUnavailable(reason)) => {
            debug!(reason = %reason, "no daemon to relock");
            0
        }
        Err(e) => return Err(e),
    };

    for vault in rack.vaults().all() {
        let forgotten = vault.relock(slug).await?;
        if forgotten > 0 {
            debug!(vault = %vault.kind(), count = forgotten, "relocked in process");
        }
    }

    info!(
        owner = rack.owner().unwrap_or("default"),
        env = ?env,
        count = count,
        "relocked"
    );
    Ok(count)
}
