//! The per-command keyrack context
//!
//! `Keyrack` wires paths, config, identities, the vault registry and the
//! daemon client together for one owner. Every command builds one and drops
//! it on exit, taking any decrypted state with it.

use crate::config::{self, KeyrackConfig};
use crate::daemon::{spawn, DaemonClient, DAEMON_NAME};
use crate::envelope::Identities;
use crate::error::{KeyrackError, Result};
use crate::grade::GradeRequirement;
use crate::host::{Findsert, HostStore, KeyHost, KeyHostInput};
use crate::mech::{MechContext, Mechanism};
use crate::prompt::SecretReader;
use crate::repo_manifest::{self, RepoManifest};
use crate::secret::SecretValue;
use crate::slug::{self, Slug};
use crate::vault::aws_sso::AwsSsoVault;
use crate::vault::daemon::DaemonVault;
use crate::vault::direct::DirectVault;
use crate::vault::envvar::EnvVault;
use crate::vault::onepassword::OnePasswordVault;
use crate::vault::secure::SecureVault;
use crate::vault::{Vault, VaultKind, VaultRegistry, VaultSet};
use chrono::Utc;
use keyrack_core::Paths;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

pub struct Keyrack {
    paths: Paths,
    config: KeyrackConfig,
    owner: Option<String>,
    identities: Arc<Identities>,
    vaults: VaultRegistry,
    daemon: DaemonClient,
    mech: MechContext,
}

/// Arguments of `keyrack set`
#[derive(Debug, Clone)]
pub struct SetRequest {
    pub name: String,
    pub env: String,
    /// Falls back to the repo manifest's org
    pub org: Option<String>,
    pub vault: VaultKind,
    pub mech: Mechanism,
    pub exid: Option<String>,
    pub vault_recipient: Option<String>,
    pub max_duration: Option<String>,
    pub value: Option<SecretValue>,
    /// Also declare the key in this repo manifest
    pub at: Option<PathBuf>,
    /// Grade keyword recorded with the declaration
    pub grade: Option<GradeRequirement>,
}

impl Keyrack {
    /// Load config from the default location and build the context
    pub fn open(paths: Paths, owner: Option<&str>, reader: Arc<dyn SecretReader>) -> Result<Self> {
        let config = KeyrackConfig::load(&paths)?;
        Self::with_config(paths, config, owner, reader)
    }

    pub fn with_config(
        paths: Paths,
        config: KeyrackConfig,
        owner: Option<&str>,
        reader: Arc<dyn SecretReader>,
    ) -> Result<Self> {
        if let Some(owner) = owner {
            slug::validate_segment("owner", owner)?;
        }

        let identities = Arc::new(Identities::discover(&paths, &config));
        let daemon = DaemonClient::new(paths.socket(DAEMON_NAME), config.daemon.timeout());
        let session_ttl = config.daemon.session_ttl()?;

        let vaults: Vec<Arc<dyn Vault>> = vec![
            Arc::new(EnvVault),
            Arc::new(DirectVault::new(
                &paths.vault_dir(VaultKind::OsDirect.as_str(), owner),
            )),
            Arc::new(SecureVault::new(
                &paths.vault_dir(VaultKind::OsSecure.as_str(), owner),
                identities.clone(),
                reader,
            )),
            Arc::new(DaemonVault::new(
                daemon.clone(),
                owner.map(str::to_string),
                session_ttl,
            )),
            Arc::new(OnePasswordVault::default()),
            Arc::new(AwsSsoVault),
        ];

        debug!(
            owner = owner.unwrap_or("default"),
            identities = identities.len(),
            "keyrack context ready"
        );

        Ok(Self {
            paths,
            config,
            owner: owner.map(str::to_string),
            identities,
            vaults: VaultRegistry::new(vaults),
            daemon,
            mech: MechContext::from_env(),
        })
    }

    /// Replace the endpoints used by ephemeral mechanisms
    pub fn with_mech_context(mut self, mech: MechContext) -> Self {
        self.mech = mech;
        self
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &KeyrackConfig {
        &self.config
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn identities(&self) -> &Identities {
        &self.identities
    }

    pub fn vaults(&self) -> &VaultRegistry {
        &self.vaults
    }

    pub fn daemon(&self) -> &DaemonClient {
        &self.daemon
    }

    pub fn mech(&self) -> &MechContext {
        &self.mech
    }

    pub fn host(&self) -> Result<HostStore> {
        HostStore::new(&self.paths, self.owner(), self.identities.clone())
    }

    /// Spawn the session daemon unless one is answering
    pub async fn ensure_daemon(&self) -> Result<bool> {
        spawn::ensure_running(
            &self.daemon,
            &self.paths.log_file(DAEMON_NAME),
            std::time::Duration::from_millis(self.config.daemon.spawn_wait_ms),
        )
        .await
    }

    /// Record where a key lives and store its value
    ///
    /// With `at`, the key is first declared in that repo manifest. The
    /// manifest's grade for the key then bounds the storage chosen here.
    pub async fn set_key(&self, req: SetRequest, repo: Option<&RepoManifest>) -> Result<Findsert> {
        let stores_value = matches!(
            req.vault,
            VaultKind::OsSecure | VaultKind::OsDirect | VaultKind::OsDaemon
        );
        if stores_value && req.value.is_none() {
            return Err(KeyrackError::InvalidInput(format!(
                "{} needs a value for {}",
                req.vault, req.name
            )));
        }

        // Checked before any write
        let expires_at = match &req.max_duration {
            Some(max) => Some(config::expiry_after(Utc::now(), config::parse_duration(max)?)?),
            None => None,
        };

        let declared;
        let repo = match &req.at {
            Some(at) => {
                let org = req.org.as_deref().or(repo.map(|r| r.org.as_str()));
                repo_manifest::declare_key(at, org, &req.env, &req.name, req.grade, Some(req.mech))?;
                declared = repo_manifest::resolve(at)?;
                Some(&declared)
            }
            None => repo,
        };

        let org = req
            .org
            .as_deref()
            .or(repo.map(|r| r.org.as_str()))
            .ok_or_else(|| {
                KeyrackError::InvalidInput("no repo manifest found; pass --org".to_string())
            })?;
        let slug = Slug::new(org, &req.env, &req.name)?;
        let required = repo.and_then(|r| r.allows(&slug)).and_then(|spec| spec.grade);

        let host = self.host()?;
        let outcome = host.set_host(
            KeyHostInput {
                slug: slug.clone(),
                vault: req.vault,
                mech: req.mech,
                exid: req.exid.clone(),
                vault_recipient: req.vault_recipient.clone(),
                max_duration: req.max_duration.clone(),
            },
            required.as_ref(),
        )?;

        if let Some(value) = &req.value {
            if req.vault == VaultKind::OsDaemon {
                self.ensure_daemon().await?;
            }
            let recipients = host.load()?.pubkeys();
            self.vaults
                .get(req.vault)?
                .set(VaultSet {
                    slug: &slug,
                    value,
                    env: &slug.env,
                    org: &slug.org,
                    exid: req.exid.as_deref(),
                    expires_at,
                    vault_recipient: req.vault_recipient.as_deref(),
                    recipients: &recipients,
                })
                .await?;
        }

        info!(slug = %slug, vault = %req.vault, outcome = outcome.as_str(), "key set");
        Ok(outcome)
    }

    /// Remove a key's host entry and its stored value
    pub async fn del_key(&self, slug: &Slug) -> Result<Option<KeyHost>> {
        let removed = self.host()?.del_host(slug)?;
        if let Some(host) = &removed {
            self.vaults
                .get(host.vault)?
                .del(slug, host.exid.as_deref())
                .await?;
            if let Err(e) = self.daemon.relock(self.owner(), None, Some(slug)).await {
                debug!(slug = %slug, error = %e, "no session to clear");
            }
            info!(slug = %slug, vault = %host.vault, "key deleted");
        }
        Ok(removed)
    }

    /// Every host entry, in slug order
    pub fn list(&self) -> Result<Vec<KeyHost>> {
        Ok(self.host()?.load()?.hosts.into_values().collect())
    }
}
