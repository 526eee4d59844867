//! Grant resolver
//!
//! Decides what a caller gets for a key. Steps run in order and stop at the
//! first that settles the outcome:
//!
//! 1. the key must be on the repo manifest allowlist, else `absent`
//! 2. the value comes from the environment, then the session daemon, then
//!    the vault recorded on the key's host entry
//! 3. the mechanism turns the stored value into the credential
//! 4. the firewall checks the final value, else `blocked`
//!
//! `locked`, `absent` and `blocked` are ordinary results, not errors.

use crate::error::{KeyrackError, Result};
use crate::firewall;
use crate::mech::{self, Mechanism};
use crate::rack::Keyrack;
use crate::repo_manifest::{KeySpec, RepoManifest};
use crate::secret::SecretValue;
use crate::slug::{Slug, ALL_ENV};
use crate::vault::envvar::EnvVault;
use crate::vault::{Stored, VaultGet, VaultKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GrantStatus {
    Granted,
    Locked,
    Blocked,
    Absent,
}

impl GrantStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Granted => "granted",
            Self::Locked => "locked",
            Self::Blocked => "blocked",
            Self::Absent => "absent",
        }
    }
}

/// The credential handed out with a `granted` status
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantedKey {
    pub slug: Slug,
    pub secret: SecretValue,
    pub mech: Mechanism,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub status: GrantStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<Slug>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<GrantedKey>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<VaultKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Grant {
    fn empty(status: GrantStatus, slug: Option<Slug>) -> Self {
        Self {
            status,
            slug,
            key: None,
            source: None,
            expires_at: None,
            reasons: vec![],
            fix: None,
            message: None,
        }
    }

    /// Same shape whether the key exists elsewhere or nowhere
    fn not_allowed(key: &str) -> Self {
        Self {
            message: Some(format!("{} is not declared in the repo manifest", key)),
            fix: Some("declare it in keyrack.yml".to_string()),
            ..Self::empty(GrantStatus::Absent, None)
        }
    }

    fn absent(slug: Slug, message: String, fix: String) -> Self {
        Self {
            message: Some(message),
            fix: Some(fix),
            ..Self::empty(GrantStatus::Absent, Some(slug))
        }
    }

    fn locked(slug: Slug, fix: String) -> Self {
        Self {
            message: Some(format!("{} is locked", slug)),
            fix: Some(fix),
            ..Self::empty(GrantStatus::Locked, Some(slug))
        }
    }

    fn blocked(slug: Slug, source: VaultKind, reasons: Vec<String>) -> Self {
        Self {
            source: Some(source),
            reasons,
            ..Self::empty(GrantStatus::Blocked, Some(slug))
        }
    }

    pub fn is_granted(&self) -> bool {
        self.status == GrantStatus::Granted
    }
}

/// Arguments of `keyrack get`
#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    /// Bare key name or `org.env.key`
    pub key: String,
    pub env: Option<String>,
    pub allow_dangerous: bool,
}

/// Resolves grants for one repo manifest
pub struct GrantResolver<'a> {
    rack: &'a Keyrack,
    repo: &'a RepoManifest,
}

impl<'a> GrantResolver<'a> {
    pub fn new(rack: &'a Keyrack, repo: &'a RepoManifest) -> Self {
        Self { rack, repo }
    }

    pub async fn get(&self, req: &GetRequest) -> Result<Grant> {
        let Some(spec) = self.allowlisted(req)? else {
            debug!("key not on the allowlist");
            return Ok(Grant::not_allowed(&req.key));
        };
        let slug = spec.slug.clone();

        let grant = self.resolve(spec, req.allow_dangerous).await?;
        info!(slug = %slug, status = grant.status.as_str(), source = ?grant.source, "grant resolved");
        Ok(grant)
    }

    /// Grants for every key visible from `env` (`get --for repo`)
    pub async fn get_repo(&self, env: Option<&str>, allow_dangerous: bool) -> Result<Vec<Grant>> {
        let env = match env {
            Some(env) => env.to_string(),
            None => match self.repo.envs.as_slice() {
                [] => ALL_ENV.to_string(),
                [only] => only.clone(),
                envs => {
                    return Err(KeyrackError::InvalidInput(format!(
                        "repo declares several envs ({}); pass --env",
                        envs.join(", ")
                    )))
                }
            },
        };

        let mut grants = vec![];
        for spec in self.repo.keys_for_env(&env) {
            let req = GetRequest {
                key: spec.name.clone(),
                env: Some(env.clone()),
                allow_dangerous,
            };
            grants.push(self.get(&req).await?);
        }
        Ok(grants)
    }

    /// The manifest declaration the request names, if any
    fn allowlisted(&self, req: &GetRequest) -> Result<Option<&'a KeySpec>> {
        if Slug::looks_like(&req.key) {
            let Ok(slug) = req.key.parse::<Slug>() else {
                return Ok(None);
            };
            return Ok(self.repo.allows(&slug));
        }

        let Some(env) = self.repo.resolve_env(&req.key, req.env.as_deref())? else {
            return Ok(None);
        };
        Ok(self.repo.lookup(&env, &req.key))
    }

    async fn resolve(&self, spec: &KeySpec, allow_dangerous: bool) -> Result<Grant> {
        let slug = &spec.slug;

        if let Some(value) = EnvVault::lookup(&spec.name) {
            debug!(slug = %slug, "found in environment");
            return self
                .finish(
                    slug,
                    VaultKind::OsEnvvar,
                    Mechanism::PermanentViaReplica,
                    Stored::new(value),
                    allow_dangerous,
                )
                .await;
        }

        match self.rack.daemon().get(self.rack.owner(), slug).await {
            Ok(Some(entry)) => {
                debug!(slug = %slug, "served from session");
                let stored = Stored {
                    value: entry.value,
                    expires_at: Some(entry.expires_at),
                };
                return self
                    .finish(slug, VaultKind::OsDaemon, entry.mech, stored, allow_dangerous)
                    .await;
            }
            Ok(None) => debug!(slug = %slug, "not in session"),
            Err(e) => debug!(slug = %slug, error = %e, "session miss"),
        }

        let host = match self.rack.host()?.get_host(slug) {
            Ok(Some(host)) => host,
            Ok(None) => {
                return Ok(Grant::absent(
                    slug.clone(),
                    format!("{} is declared but not stored on this host", slug),
                    format!("run `keyrack set --key {} --env {}`", spec.name, spec.env),
                ))
            }
            Err(e @ KeyrackError::HostManifestNotFound { .. }) => {
                let fix = e.fix().unwrap_or_default();
                return Ok(Grant::absent(slug.clone(), e.to_string(), fix));
            }
            Err(e) => return Err(e),
        };

        let set_fix = format!(
            "run `keyrack set --key {} --env {} --vault {}`",
            spec.name, spec.env, host.vault
        );

        // The session was consulted above; an os.daemon key has nowhere else to live
        if host.vault == VaultKind::OsDaemon {
            return Ok(Grant::absent(
                slug.clone(),
                format!("{} is not in the session", slug),
                set_fix,
            ));
        }

        let vault = self.rack.vaults().get(host.vault)?;
        if !vault.is_unlocked().await {
            return Ok(Grant::locked(
                slug.clone(),
                vault.unlock_hint(&host.env, self.rack.owner()),
            ));
        }

        let stored = vault
            .get(VaultGet {
                slug,
                exid: host.exid.as_deref(),
                vault_recipient: host.vault_recipient.as_deref(),
            })
            .await?;
        match stored {
            Some(stored) => {
                self.finish(slug, host.vault, host.mech, stored, allow_dangerous)
                    .await
            }
            None => Ok(Grant::absent(
                slug.clone(),
                format!("no value stored for {} in {}", slug, host.vault),
                set_fix,
            )),
        }
    }

    /// Translate through the mechanism, then firewall the result
    async fn finish(
        &self,
        slug: &Slug,
        source: VaultKind,
        mech: Mechanism,
        stored: Stored,
        allow_dangerous: bool,
    ) -> Result<Grant> {
        if mech.is_replica() {
            let verdict = firewall::check(&stored.value, allow_dangerous);
            if verdict.blocked {
                return Ok(Grant::blocked(slug.clone(), source, verdict.reasons));
            }
        }

        let output = match mech::translate(mech, stored.value, stored.expires_at, self.rack.mech()).await {
            Ok(output) => output,
            Err(KeyrackError::MechNotAuthorized { fix, .. }) => {
                return Ok(Grant::locked(slug.clone(), fix))
            }
            Err(e) => return Err(e),
        };

        let verdict = firewall::check(&output.value, allow_dangerous);
        if verdict.blocked {
            return Ok(Grant::blocked(slug.clone(), source, verdict.reasons));
        }
        if !verdict.matches.is_empty() {
            warn!(slug = %slug, labels = ?verdict.matches, "dangerous value granted on request");
        }

        Ok(Grant {
            key: Some(GrantedKey {
                slug: slug.clone(),
                secret: output.value,
                mech,
            }),
            source: Some(source),
            expires_at: output.expires_at,
            ..Grant::empty(GrantStatus::Granted, Some(slug.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::{DaemonServer, DAEMON_NAME};
    use crate::host::KeyHostInput;
    use crate::rack::tests::{secure_set, setup};
    use crate::session::{self, UnlockRequest};
    use crate::vault::VaultKind;

    fn get(key: &str) -> GetRequest {
        GetRequest {
            key: key.to_string(),
            env: None,
            allow_dangerous: false,
        }
    }

    #[tokio::test]
    async fn test_locked_unlock_relock_cycle() {
        let (_tmp, rack, repo) = setup();
        rack.set_key(secure_set("ALLOWED_KEY", "s3cret"), Some(&repo))
            .await
            .unwrap();

        let paths = rack.paths();
        let server = DaemonServer::bind(&paths.socket(DAEMON_NAME), None).unwrap();
        let serving = tokio::spawn(server.serve());

        let resolver = GrantResolver::new(&rack, &repo);
        let before = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(before.status, GrantStatus::Locked);
        assert!(before.fix.as_deref().unwrap().contains("unlock"));
        assert!(before.key.is_none());

        let report = session::unlock(
            &rack,
            UnlockRequest {
                env: Some("test".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.count, 1);

        let after = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(after.status, GrantStatus::Granted);
        assert_eq!(after.source, Some(VaultKind::OsDaemon));
        assert_eq!(after.key.as_ref().unwrap().secret.expose(), "s3cret");

        let cleared = session::relock(&rack, Some("test"), None).await.unwrap();
        assert_eq!(cleared, 1);

        let relocked = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(relocked.status, GrantStatus::Locked);

        rack.daemon().stop().await.unwrap();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_absent_shape_does_not_leak_host_entries() {
        let (_tmp, rack, repo) = setup();
        let mut hidden = secure_set("HOST_ONLY", "x");
        hidden.org = Some("acme".to_string());
        rack.set_key(hidden, None).await.unwrap();

        let resolver = GrantResolver::new(&rack, &repo);
        let on_host = resolver.get(&get("HOST_ONLY")).await.unwrap();
        let nowhere = resolver.get(&get("NOWHERE")).await.unwrap();

        let shape = |g: &Grant| {
            let mut v = serde_json::to_value(g).unwrap();
            let message = v["message"].as_str().unwrap().to_string();
            v["message"] = serde_json::Value::Null;
            (v, message)
        };
        let (on_host_shape, on_host_msg) = shape(&on_host);
        let (nowhere_shape, nowhere_msg) = shape(&nowhere);

        assert_eq!(on_host.status, GrantStatus::Absent);
        assert_eq!(on_host_shape, nowhere_shape);
        assert_eq!(
            on_host_msg.replace("HOST_ONLY", "KEY"),
            nowhere_msg.replace("NOWHERE", "KEY")
        );
        assert!(on_host_msg.contains("repo manifest"));

        let slug_form = resolver.get(&get("acme.test.HOST_ONLY")).await.unwrap();
        assert_eq!(slug_form.status, GrantStatus::Absent);
        assert!(slug_form.slug.is_none());
    }

    #[tokio::test]
    async fn test_declared_but_not_stored() {
        let (_tmp, rack, repo) = setup();
        let grant = GrantResolver::new(&rack, &repo)
            .get(&get("ALLOWED_KEY"))
            .await
            .unwrap();
        assert_eq!(grant.status, GrantStatus::Absent);
        assert!(grant.fix.unwrap().contains("keyrack set"));
    }

    #[tokio::test]
    async fn test_firewall_blocks_unless_allowed() {
        let (_tmp, rack, repo) = setup();
        let token = format!("ghp_{}", "a".repeat(36));
        let mut req = secure_set("ALLOWED_KEY", &token);
        req.vault = VaultKind::OsDirect;
        rack.set_key(req, Some(&repo)).await.unwrap();

        let resolver = GrantResolver::new(&rack, &repo);
        let blocked = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(blocked.status, GrantStatus::Blocked);
        assert!(!blocked.reasons.is_empty());
        let json = serde_json::to_string(&blocked).unwrap();
        assert!(!json.contains(&token));

        let allowed = resolver
            .get(&GetRequest {
                allow_dangerous: true,
                ..get("ALLOWED_KEY")
            })
            .await
            .unwrap();
        assert_eq!(allowed.status, GrantStatus::Granted);
        assert_eq!(allowed.key.unwrap().secret.expose(), token);
    }

    #[tokio::test]
    async fn test_direct_vault_granted_without_unlock() {
        let (_tmp, rack, repo) = setup();
        let mut req = secure_set("ALLOWED_KEY", "plain-dev-value");
        req.vault = VaultKind::OsDirect;
        rack.set_key(req, Some(&repo)).await.unwrap();

        let grants = GrantResolver::new(&rack, &repo)
            .get_repo(None, false)
            .await
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].status, GrantStatus::Granted);
        assert_eq!(grants[0].source, Some(VaultKind::OsDirect));
    }

    /// Repo declaring `keys` in env `test`, under org acme
    fn repo_with(tmp: &tempfile::TempDir, file: &str, keys: &[&str]) -> RepoManifest {
        let path = tmp.path().join(file);
        let mut yaml = "org: acme\nenv.test:\n".to_string();
        for key in keys {
            yaml.push_str(&format!("  - {}\n", key));
        }
        std::fs::write(&path, yaml).unwrap();
        crate::repo_manifest::resolve(&path).unwrap()
    }

    #[tokio::test]
    async fn test_environment_wins_and_is_firewalled() {
        // Names unique to this test; the process environment is shared
        let (tmp, rack, _repo) = setup();
        let repo = repo_with(
            &tmp,
            "envvar.yml",
            &["KEYRACK_GRANT_ENV_OVERRIDE", "KEYRACK_GRANT_ENV_TOKEN"],
        );

        let mut req = secure_set("KEYRACK_GRANT_ENV_OVERRIDE", "from-vault");
        req.vault = VaultKind::OsDirect;
        rack.set_key(req, Some(&repo)).await.unwrap();

        let token = format!("ghp_{}", "b".repeat(36));
        std::env::set_var("KEYRACK_GRANT_ENV_OVERRIDE", "from-env");
        std::env::set_var("KEYRACK_GRANT_ENV_TOKEN", &token);

        let resolver = GrantResolver::new(&rack, &repo);
        let overridden = resolver.get(&get("KEYRACK_GRANT_ENV_OVERRIDE")).await.unwrap();
        let blocked = resolver.get(&get("KEYRACK_GRANT_ENV_TOKEN")).await.unwrap();

        std::env::remove_var("KEYRACK_GRANT_ENV_OVERRIDE");
        std::env::remove_var("KEYRACK_GRANT_ENV_TOKEN");

        assert_eq!(overridden.status, GrantStatus::Granted);
        assert_eq!(overridden.source, Some(VaultKind::OsEnvvar));
        assert_eq!(overridden.key.unwrap().secret.expose(), "from-env");

        assert_eq!(blocked.status, GrantStatus::Blocked);
        assert_eq!(blocked.source, Some(VaultKind::OsEnvvar));
        assert!(!serde_json::to_string(&blocked).unwrap().contains(&token));

        let from_vault = resolver.get(&get("KEYRACK_GRANT_ENV_OVERRIDE")).await.unwrap();
        assert_eq!(from_vault.source, Some(VaultKind::OsDirect));
    }

    #[tokio::test]
    async fn test_unresponsive_daemon_falls_through_to_vault() {
        let (_tmp, rack, repo) = setup();
        let mut req = secure_set("ALLOWED_KEY", "plain-dev-value");
        req.vault = VaultKind::OsDirect;
        rack.set_key(req, Some(&repo)).await.unwrap();

        // Accepts connections but never answers
        let socket = rack.paths().socket(DAEMON_NAME);
        std::fs::create_dir_all(socket.parent().unwrap()).unwrap();
        let _listener = tokio::net::UnixListener::bind(&socket).unwrap();

        let grant = GrantResolver::new(&rack, &repo)
            .get(&get("ALLOWED_KEY"))
            .await
            .unwrap();
        assert_eq!(grant.status, GrantStatus::Granted);
        assert_eq!(grant.source, Some(VaultKind::OsDirect));
        assert_eq!(grant.key.unwrap().secret.expose(), "plain-dev-value");
    }

    #[tokio::test]
    async fn test_daemon_vault_key_outside_session_is_absent() {
        let (_tmp, rack, repo) = setup();
        rack.host()
            .unwrap()
            .set_host(
                KeyHostInput {
                    slug: "acme.test.ALLOWED_KEY".parse().unwrap(),
                    vault: VaultKind::OsDaemon,
                    mech: Mechanism::PermanentViaReplica,
                    exid: None,
                    vault_recipient: None,
                    max_duration: None,
                },
                None,
            )
            .unwrap();

        let resolver = GrantResolver::new(&rack, &repo);
        let grant = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(grant.status, GrantStatus::Absent);
        let fix = grant.fix.unwrap();
        assert!(fix.contains("keyrack set") && fix.contains("os.daemon"), "{}", fix);

        // unlock has nothing to load for this vault
        let report = session::unlock(
            &rack,
            UnlockRequest {
                env: Some("test".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(report.count, 0);
        assert!(!report.spawned);
        let again = resolver.get(&get("ALLOWED_KEY")).await.unwrap();
        assert_eq!(again.status, GrantStatus::Absent);
    }

    #[tokio::test]
    async fn test_ambiguous_env_is_an_error() {
        let (tmp, rack, _repo) = setup();
        let path = tmp.path().join("multi.yml");
        std::fs::write(
            &path,
            "org: acme\nenv.test:\n  - SHARED\nenv.prod:\n  - SHARED\n",
        )
        .unwrap();
        let repo = crate::repo_manifest::resolve(&path).unwrap();

        let resolver = GrantResolver::new(&rack, &repo);
        assert!(matches!(
            resolver.get(&get("SHARED")).await,
            Err(KeyrackError::AmbiguousEnv { .. })
        ));
        assert!(resolver.get_repo(None, false).await.is_err());
    }
}
