use crate::atomic;
use crate::config::parse_duration;
use crate::envelope::{self, Identities};
use crate::error::{KeyrackError, Result};
use crate::grade::{self, GradeRequirement};
use crate::host::{Findsert, HostManifest, KeyHost, KeyHostInput, Recipient};
use crate::slug::{self, Slug};
use chrono::Utc;
use keyrack_core::Paths;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DEFAULT_LABEL: &str = "local";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// A manifest already existed and was left alone
    Found { path: PathBuf },
    Created { path: PathBuf, pubkey: String },
}

/// Access to one owner's host manifest
pub struct HostStore {
    path: PathBuf,
    identity_path: PathBuf,
    owner: Option<String>,
    identities: Arc<Identities>,
}

impl HostStore {
    pub fn new(paths: &Paths, owner: Option<&str>, identities: Arc<Identities>) -> Result<Self> {
        if let Some(owner) = owner {
            slug::validate_segment("owner", owner)?;
        }
        Ok(Self {
            path: paths.host_manifest(owner),
            identity_path: paths.identity(),
            owner: owner.map(str::to_string),
            identities,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn owner_label(&self) -> &str {
        self.owner.as_deref().unwrap_or("default")
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create the manifest, never overwriting an existing one
    ///
    /// Without a pubkey, keyrack's own identity is used (and generated on
    /// first use).
    pub fn init(&self, pubkey: Option<&str>, label: Option<&str>) -> Result<InitOutcome> {
        if self.exists() {
            debug!(path = %self.path.display(), "host manifest already present");
            return Ok(InitOutcome::Found {
                path: self.path.clone(),
            });
        }

        let pubkey = match pubkey {
            Some(p) => p.trim().to_string(),
            None => envelope::ensure_identity(&self.identity_path)?,
        };
        let label = label.unwrap_or(DEFAULT_LABEL);
        let recipient = new_recipient(&pubkey, label)?;

        let manifest = HostManifest {
            uri: self.path.display().to_string(),
            owner: self.owner.clone(),
            recipients: vec![recipient],
            hosts: Default::default(),
        };
        self.save(&manifest)?;

        info!(owner = self.owner_label(), path = %self.path.display(), "initialized host manifest");
        Ok(InitOutcome::Created {
            path: self.path.clone(),
            pubkey,
        })
    }

    pub fn load(&self) -> Result<HostManifest> {
        if !self.exists() {
            return Err(KeyrackError::HostManifestNotFound {
                owner: self.owner_label().to_string(),
            });
        }

        let sealed = std::fs::read(&self.path)?;
        let plaintext = envelope::open(&sealed, &self.identities, None)?;
        serde_json::from_slice(&plaintext)
            .map_err(|e| KeyrackError::malformed(&self.path, e.to_string()))
    }

    /// Encrypt to the manifest's current recipients and replace the file
    fn save(&self, manifest: &HostManifest) -> Result<()> {
        if manifest.recipients.is_empty() {
            return Err(KeyrackError::LastRecipient(self.owner_label().to_string()));
        }
        let plaintext = serde_json::to_vec(manifest)?;
        let sealed = envelope::encrypt_to(&plaintext, &manifest.pubkeys())?;
        atomic::write_private(&self.path, &sealed)?;
        debug!(
            path = %self.path.display(),
            recipients = manifest.recipients.len(),
            hosts = manifest.hosts.len(),
            "wrote host manifest"
        );
        Ok(())
    }

    pub fn recipients(&self) -> Result<Vec<Recipient>> {
        Ok(self.load()?.recipients)
    }

    pub fn set_recipient(&self, pubkey: &str, label: &str) -> Result<Recipient> {
        let mut manifest = self.load()?;
        if manifest.recipients.iter().any(|r| r.label == label) {
            return Err(KeyrackError::DuplicateRecipient(label.to_string()));
        }

        let recipient = new_recipient(pubkey, label)?;
        manifest.recipients.push(recipient.clone());
        self.save(&manifest)?;

        info!(owner = self.owner_label(), label = label, "added recipient");
        Ok(recipient)
    }

    pub fn del_recipient(&self, label: &str) -> Result<Recipient> {
        let mut manifest = self.load()?;
        let index = manifest
            .recipients
            .iter()
            .position(|r| r.label == label)
            .ok_or_else(|| KeyrackError::RecipientNotFound(label.to_string()))?;

        if manifest.recipients.len() == 1 {
            return Err(KeyrackError::LastRecipient(label.to_string()));
        }

        let removed = manifest.recipients.remove(index);
        self.save(&manifest)?;

        info!(owner = self.owner_label(), label = label, "removed recipient");
        Ok(removed)
    }

    pub fn get_host(&self, slug: &Slug) -> Result<Option<KeyHost>> {
        Ok(self.load()?.hosts.get(slug).cloned())
    }

    /// Find-or-insert a storage record
    ///
    /// Identical attributes return the existing record untouched. A change
    /// must not degrade the key's grade, and any write must meet the grade
    /// the repo requires.
    pub fn set_host(
        &self,
        input: KeyHostInput,
        required: Option<&GradeRequirement>,
    ) -> Result<Findsert> {
        if let Some(max) = &input.max_duration {
            parse_duration(max)?;
        }
        if input.vault.requires_exid() && input.exid.as_deref().map_or(true, str::is_empty) {
            return Err(KeyrackError::InvalidInput(format!(
                "vault {} needs --exid",
                input.vault
            )));
        }
        if let Some(recipient) = &input.vault_recipient {
            envelope::parse_recipient(recipient)?;
        }

        let mut manifest = self.load()?;
        let slug_str = input.slug.to_string();
        let now = Utc::now();

        let outcome = match manifest.hosts.get(&input.slug) {
            Some(existing) if existing.same_storage(&input) => {
                return Ok(Findsert::Found(existing.clone()));
            }
            Some(existing) => {
                grade::assert_protected(&slug_str, &existing.grade(), &input.grade())?;
                if let Some(required) = required {
                    grade::assert_satisfies(&slug_str, required, &input.grade())?;
                }
                Findsert::Updated(KeyHost {
                    created_at: existing.created_at,
                    updated_at: now,
                    ..host_from(&input, now)
                })
            }
            None => {
                if let Some(required) = required {
                    grade::assert_satisfies(&slug_str, required, &input.grade())?;
                }
                Findsert::Created(host_from(&input, now))
            }
        };

        manifest
            .hosts
            .insert(input.slug.clone(), outcome.host().clone());
        self.save(&manifest)?;

        info!(
            slug = %input.slug,
            vault = %input.vault,
            mech = %input.mech,
            outcome = outcome.as_str(),
            "set key host"
        );
        Ok(outcome)
    }

    pub fn del_host(&self, slug: &Slug) -> Result<Option<KeyHost>> {
        let mut manifest = self.load()?;
        let removed = manifest.hosts.remove(slug);
        if removed.is_some() {
            self.save(&manifest)?;
            info!(slug = %slug, "deleted key host");
        }
        Ok(removed)
    }
}

fn new_recipient(pubkey: &str, label: &str) -> Result<Recipient> {
    if label.trim().is_empty() {
        return Err(KeyrackError::InvalidInput(
            "recipient label cannot be empty".to_string(),
        ));
    }
    let (mech, _) = envelope::parse_recipient(pubkey)?;
    Ok(Recipient {
        mech,
        pubkey: pubkey.trim().to_string(),
        label: label.to_string(),
        added_at: Utc::now(),
    })
}

fn host_from(input: &KeyHostInput, now: chrono::DateTime<Utc>) -> KeyHost {
    KeyHost {
        slug: input.slug.clone(),
        exid: input.exid.clone(),
        vault: input.vault,
        mech: input.mech,
        env: input.slug.env.clone(),
        org: input.slug.org.clone(),
        vault_recipient: input.vault_recipient.clone(),
        max_duration: input.max_duration.clone(),
        created_at: now,
        updated_at: now,
    }
}
