//! `os.secure`: one age file per key
//!
//! Values are sealed to the host manifest recipients (or to a single
//! `vault_recipient`), or to a passphrase when the vault was unlocked with
//! one. Reading needs an `unlock` in this process; other processes go
//! through the session daemon instead.

use crate::atomic;
use crate::config::PASSPHRASE_ENV;
use crate::envelope::{self, Identities};
use crate::error::{KeyrackError, Result};
use crate::prompt::SecretReader;
use crate::secret::SecretValue;
use crate::slug::Slug;
use crate::vault::{Stored, Vault, VaultGet, VaultKind, VaultSet};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Default)]
struct UnlockState {
    passphrase: Option<SecretValue>,
}

pub struct SecureVault {
    dir: PathBuf,
    identities: Arc<Identities>,
    reader: Arc<dyn SecretReader>,
    state: Mutex<Option<UnlockState>>,
}

impl SecureVault {
    pub fn new(dir: &Path, identities: Arc<Identities>, reader: Arc<dyn SecretReader>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            identities,
            reader,
            state: Mutex::new(None),
        }
    }

    fn path_for(&self, slug: &Slug) -> PathBuf {
        self.dir.join(format!("{}.age", slug))
    }

    fn stored_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(vec![]);
        }
        let mut files = vec![];
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "age") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn held_passphrase(&self) -> Option<SecretValue> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(|s| s.passphrase.clone())
    }
}

#[async_trait]
impl Vault for SecureVault {
    fn kind(&self) -> VaultKind {
        VaultKind::OsSecure
    }

    /// Passphrase sources, first hit wins: the argument, `KEYRACK_PASSPHRASE`,
    /// then a hidden prompt (only when not `silent` and a stored value is
    /// passphrase-sealed). The first stored file of each sealing kind is
    /// opened to prove the unlock works.
    async fn unlock(&self, passphrase: Option<&SecretValue>, silent: bool) -> Result<()> {
        let mut passphrase = passphrase.cloned().or_else(|| {
            std::env::var(PASSPHRASE_ENV)
                .ok()
                .filter(|p| !p.is_empty())
                .map(SecretValue::new)
        });

        let mut passphrase_sealed = None;
        let mut recipient_sealed = None;
        for path in self.stored_files()? {
            let bytes = std::fs::read(&path)?;
            if envelope::is_passphrase_sealed(&bytes)? {
                passphrase_sealed.get_or_insert(bytes);
            } else {
                recipient_sealed.get_or_insert(bytes);
            }
        }

        if passphrase_sealed.is_some() && passphrase.is_none() && !silent {
            passphrase = Some(self.reader.read_secret("keyrack passphrase: ")?);
        }

        if passphrase.is_none() && self.identities.is_empty() {
            return Err(KeyrackError::UnlockFailed(format!(
                "no identity found and no passphrase given (set {} or pass --passphrase)",
                PASSPHRASE_ENV
            )));
        }

        if let Some(sealed) = &passphrase_sealed {
            envelope::open(sealed, &self.identities, passphrase.as_ref())?;
        }
        if let Some(sealed) = &recipient_sealed {
            envelope::open(sealed, &self.identities, None)?;
        }

        info!(
            identities = self.identities.len(),
            passphrase = passphrase.is_some(),
            "secure vault unlocked"
        );
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(UnlockState { passphrase });
        Ok(())
    }

    async fn is_unlocked(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    async fn get(&self, req: VaultGet<'_>) -> Result<Option<Stored>> {
        if !self.is_unlocked().await {
            return Err(KeyrackError::vault(VaultKind::OsSecure.as_str(), "locked"));
        }

        let path = self.path_for(req.slug);
        if !path.exists() {
            return Ok(None);
        }

        let sealed = std::fs::read(&path)?;
        let plaintext = envelope::open(&sealed, &self.identities, self.held_passphrase().as_ref())?;
        let value = String::from_utf8(plaintext).map_err(|_| {
            KeyrackError::Decryption(format!("{} is not valid UTF-8", req.slug))
        })?;

        debug!(slug = %req.slug, "opened secure value");
        Ok(Some(Stored::new(SecretValue::new(value))))
    }

    async fn set(&self, req: VaultSet<'_>) -> Result<()> {
        let plaintext = req.value.expose().as_bytes();

        let sealed = match (req.vault_recipient, self.held_passphrase()) {
            (Some(recipient), _) => envelope::encrypt_to(plaintext, &[recipient.to_string()])?,
            (None, Some(passphrase)) => envelope::encrypt_with_passphrase(plaintext, &passphrase)?,
            (None, None) if !req.recipients.is_empty() => {
                envelope::encrypt_to(plaintext, req.recipients)?
            }
            (None, None) => {
                return Err(KeyrackError::vault(
                    VaultKind::OsSecure.as_str(),
                    "no recipients to encrypt to",
                ))
            }
        };

        atomic::write_private(&self.path_for(req.slug), &sealed)?;
        debug!(slug = %req.slug, "sealed secure value");
        Ok(())
    }

    async fn del(&self, slug: &Slug, _exid: Option<&str>) -> Result<()> {
        let path = self.path_for(slug);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    async fn relock(&self, _slug: Option<&Slug>) -> Result<usize> {
        let was = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match was {
            Some(_) => Ok(self.stored_files()?.len()),
            None => Ok(0),
        }
    }
}
