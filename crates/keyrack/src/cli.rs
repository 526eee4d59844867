//! CLI command definitions and handlers

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use keyrack::daemon::{DaemonServer, Response, DAEMON_NAME};
use keyrack::grade::GradeRequirement;
use keyrack::host::{Findsert, InitOutcome};
use keyrack::mech::Mechanism;
use keyrack::prompt::{SecretReader, TerminalReader};
use keyrack::repo_manifest::{self, RepoManifest};
use keyrack::session::{self, UnlockRequest};
use keyrack::vault::VaultKind;
use keyrack::{GetRequest, Grant, GrantResolver, GrantStatus, Keyrack, SetRequest, Slug};
use keyrack_core::daemon::check_daemon;
use keyrack_core::process::find_pids;
use keyrack_core::Paths;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// keyrack - Credential resolver for humans and agents
#[derive(Parser)]
#[command(name = "keyrack")]
#[command(version)]
#[command(about = "Resolve credentials for humans and agents without leaking them")]
#[command(after_help = "EXAMPLES:\n\
    keyrack init\n\
    keyrack set --key DB_PASSWORD --env test --vault os.secure\n\
    keyrack unlock --env test\n\
    keyrack get --key DB_PASSWORD\n\
    keyrack get --for repo --env test --json\n\
    keyrack relock")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the host manifest (and optionally a repo manifest)
    Init {
        /// Owner whose manifest to create
        #[arg(long = "for")]
        owner: Option<String>,
        /// Label of the first recipient
        #[arg(long)]
        label: Option<String>,
        /// Recipient public key (age1... or ssh-...); keyrack's own identity if omitted
        #[arg(long)]
        pubkey: Option<String>,
        /// Also create a repo manifest here
        #[arg(long)]
        at: Option<PathBuf>,
        /// Org for the repo manifest created with --at
        #[arg(long)]
        org: Option<String>,
    },

    /// Manage host manifest recipients
    Recipient {
        #[command(subcommand)]
        action: RecipientAction,
    },

    /// Record where a key lives and store its value (read from a hidden prompt or stdin)
    Set {
        #[arg(long)]
        key: String,
        #[arg(long)]
        env: String,
        /// os.secure, os.direct, os.daemon, os.envvar, 1password, aws.iam.sso
        #[arg(long, default_value = "os.secure")]
        vault: VaultKind,
        #[arg(long, default_value = "PERMANENT_VIA_REPLICA")]
        mech: Mechanism,
        /// External id: op:// reference or aws profile
        #[arg(long)]
        exid: Option<String>,
        /// Seal to this public key instead of the host recipients
        #[arg(long)]
        vault_recipient: Option<String>,
        /// Upper bound on how long an unlocked value lives (30m, 9h, 7d)
        #[arg(long)]
        max_duration: Option<String>,
        #[arg(long)]
        org: Option<String>,
        /// Declare the key in this repo manifest too
        #[arg(long)]
        at: Option<PathBuf>,
        /// Grade keyword for the declaration: encrypted, ephemeral
        #[arg(long)]
        grade: Option<String>,
        #[arg(long = "for")]
        owner: Option<String>,
    },

    /// Resolve a key (or every key of the repo) into a grant
    Get {
        /// Key name or org.env.key
        #[arg(long, required_unless_present = "scope")]
        key: Option<String>,
        /// `repo`: resolve every key the repo declares
        #[arg(long = "for", value_name = "repo", conflicts_with = "key")]
        scope: Option<String>,
        #[arg(long)]
        env: Option<String>,
        #[arg(long)]
        json: bool,
        /// Grant values that look like long-lived tokens
        #[arg(long)]
        allow_dangerous: bool,
        /// Repo manifest path (default: discovered from the working directory)
        #[arg(long)]
        at: Option<PathBuf>,
        #[arg(long)]
        owner: Option<String>,
    },

    /// Unlock keys into the session daemon
    Unlock {
        #[arg(long)]
        env: Option<String>,
        #[arg(long)]
        key: Option<String>,
        /// Prompt for the vault passphrase
        #[arg(long)]
        passphrase: bool,
        #[arg(long = "for")]
        owner: Option<String>,
    },

    /// Clear unlocked keys from the session
    Relock {
        #[arg(long)]
        env: Option<String>,
        /// org.env.key of a single key
        #[arg(long)]
        key: Option<Slug>,
        #[arg(long = "for")]
        owner: Option<String>,
    },

    /// List keys stored on this host (values never shown)
    List {
        #[arg(long)]
        json: bool,
        #[arg(long = "for")]
        owner: Option<String>,
    },

    /// Delete a key's host entry and stored value
    Del {
        #[arg(long)]
        key: String,
        #[arg(long)]
        env: String,
        #[arg(long)]
        org: Option<String>,
        #[arg(long)]
        at: Option<PathBuf>,
        #[arg(long = "for")]
        owner: Option<String>,
    },

    /// Manage the session daemon
    Daemon {
        #[command(subcommand)]
        action: DaemonAction,
    },
}

#[derive(Subcommand)]
pub enum RecipientAction {
    /// List recipients
    Get {
        #[arg(long)]
        json: bool,
        #[arg(long = "for")]
        owner: Option<String>,
    },
    /// Add a recipient and re-encrypt
    Set {
        #[arg(long)]
        pubkey: String,
        #[arg(long)]
        label: String,
        #[arg(long = "for")]
        owner: Option<String>,
    },
    /// Remove a recipient and re-encrypt
    Del {
        #[arg(long)]
        label: String,
        #[arg(long = "for")]
        owner: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Run the daemon in the foreground
    #[command(hide = true)]
    Serve,
    /// Show daemon status
    Status,
    /// Stop the daemon, dropping every unlocked key
    Stop,
}

fn open(owner: Option<&str>) -> Result<Keyrack> {
    Ok(Keyrack::open(Paths::new(), owner, Arc::new(TerminalReader))?)
}

/// Repo manifest at `at`, else the one found above the working directory
fn repo(at: Option<&Path>) -> Result<RepoManifest> {
    let path = match at {
        Some(at) => at.to_path_buf(),
        None => {
            let cwd = std::env::current_dir().context("Failed to read working directory")?;
            repo_manifest::discover(&cwd)?
        }
    };
    Ok(repo_manifest::resolve(&path)?)
}

pub async fn cmd_init(
    owner: Option<String>,
    label: Option<String>,
    pubkey: Option<String>,
    at: Option<PathBuf>,
    org: Option<String>,
) -> Result<()> {
    let rack = open(owner.as_deref())?;
    let host = rack.host()?;

    match host.init(pubkey.as_deref(), label.as_deref())? {
        InitOutcome::Found { path } => {
            println!("found: host manifest for {} at {}", host.owner_label(), path.display());
        }
        InitOutcome::Created { path, pubkey } => {
            println!("created: host manifest for {} at {}", host.owner_label(), path.display());
            println!("recipient: {}", pubkey);
        }
    }

    if let Some(at) = at {
        let Some(org) = org else {
            bail!("--at needs --org to create a repo manifest");
        };
        if repo_manifest::init_manifest(&at, &org)? {
            println!("created: repo manifest {}", at.display());
        } else {
            println!("found: repo manifest {}", at.display());
        }
    }

    Ok(())
}

pub async fn cmd_recipient(action: RecipientAction) -> Result<()> {
    match action {
        RecipientAction::Get { json, owner } => {
            let recipients = open(owner.as_deref())?.host()?.recipients()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&recipients)?);
                return Ok(());
            }
            for r in recipients {
                println!(
                    "  {:<16} {:<4} {}  (added {})",
                    r.label,
                    r.mech.as_str(),
                    r.pubkey,
                    r.added_at.format("%Y-%m-%d")
                );
            }
        }
        RecipientAction::Set {
            pubkey,
            label,
            owner,
        } => {
            let added = open(owner.as_deref())?.host()?.set_recipient(&pubkey, &label)?;
            println!("added: recipient {} ({})", added.label, added.mech.as_str());
        }
        RecipientAction::Del { label, owner } => {
            let removed = open(owner.as_deref())?.host()?.del_recipient(&label)?;
            println!("removed: recipient {}", removed.label);
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_set(
    key: String,
    env: String,
    vault: VaultKind,
    mech: Mechanism,
    exid: Option<String>,
    vault_recipient: Option<String>,
    max_duration: Option<String>,
    org: Option<String>,
    at: Option<PathBuf>,
    grade: Option<String>,
    owner: Option<String>,
) -> Result<()> {
    let grade = match grade {
        Some(g) => Some(
            GradeRequirement::from_keywords(&g)
                .with_context(|| format!("unknown grade '{}': expected encrypted, ephemeral", g))?,
        ),
        None => None,
    };

    let value = match vault {
        VaultKind::OsSecure | VaultKind::OsDirect | VaultKind::OsDaemon => {
            Some(TerminalReader.read_secret(&format!("value for {}: ", key))?)
        }
        _ => None,
    };

    // A repo manifest is optional here; --org covers its absence
    let discovered = match &at {
        Some(_) => None,
        None => repo(None).ok(),
    };

    let rack = open(owner.as_deref())?;
    let outcome = rack
        .set_key(
            SetRequest {
                name: key,
                env,
                org,
                vault,
                mech,
                exid,
                vault_recipient,
                max_duration,
                value,
                at,
                grade,
            },
            discovered.as_ref(),
        )
        .await?;

    let host = outcome.host();
    let verb = match outcome {
        Findsert::Found(_) => "unchanged",
        Findsert::Created(_) => "created",
        Findsert::Updated(_) => "updated",
    };
    println!("{}: {} in {} via {} ({})", verb, host.slug, host.vault, host.mech, host.grade());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
pub async fn cmd_get(
    key: Option<String>,
    scope: Option<String>,
    env: Option<String>,
    json: bool,
    allow_dangerous: bool,
    at: Option<PathBuf>,
    owner: Option<String>,
) -> Result<()> {
    let repo = repo(at.as_deref())?;
    let rack = open(owner.as_deref())?;
    let resolver = GrantResolver::new(&rack, &repo);

    if let Some(scope) = scope {
        if scope != "repo" {
            bail!("--for takes `repo`, got '{}'", scope);
        }
        let grants = resolver.get_repo(env.as_deref(), allow_dangerous).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&grants)?);
        } else {
            for grant in &grants {
                print_grant_summary(grant);
            }
        }
        return Ok(());
    }

    let Some(key) = key else {
        bail!("pass --key <key> or --for repo");
    };
    let grant = resolver
        .get(&GetRequest {
            key,
            env,
            allow_dangerous,
        })
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&grant)?);
        return Ok(());
    }

    match (&grant.status, &grant.key) {
        (GrantStatus::Granted, Some(key)) => println!("{}", key.secret.expose()),
        _ => print_grant_summary(&grant),
    }
    Ok(())
}

/// One status line plus reasons and fix, on stderr; never the value
fn print_grant_summary(grant: &Grant) {
    let slug = grant
        .slug
        .as_ref()
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    match grant.source {
        Some(source) => eprintln!("{:<8} {} (from {})", grant.status.as_str(), slug, source),
        None => eprintln!("{:<8} {}", grant.status.as_str(), slug),
    }
    if let Some(message) = &grant.message {
        eprintln!("  {}", message);
    }
    for reason in &grant.reasons {
        eprintln!("  reason: {}", reason);
    }
    if let Some(fix) = &grant.fix {
        eprintln!("  fix: {}", fix);
    }
}

pub async fn cmd_unlock(
    env: Option<String>,
    key: Option<String>,
    passphrase: bool,
    owner: Option<String>,
) -> Result<()> {
    let passphrase = if passphrase {
        Some(TerminalReader.read_secret("keyrack passphrase: ")?)
    } else {
        None
    };

    let rack = open(owner.as_deref())?;
    let report = session::unlock(
        &rack,
        UnlockRequest {
            env,
            key,
            passphrase,
            silent: false,
        },
    )
    .await?;

    if report.spawned {
        println!("started: session daemon");
    }
    println!("unlocked: {} key(s)", report.count);
    for slug in &report.slugs {
        println!("  {}", slug);
    }
    Ok(())
}

pub async fn cmd_relock(env: Option<String>, key: Option<Slug>, owner: Option<String>) -> Result<()> {
    let rack = open(owner.as_deref())?;
    let count = session::relock(&rack, env.as_deref(), key.as_ref()).await?;
    println!("relocked: {} key(s)", count);
    Ok(())
}

pub async fn cmd_list(json: bool, owner: Option<String>) -> Result<()> {
    let hosts = open(owner.as_deref())?.list()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hosts)?);
        return Ok(());
    }

    if hosts.is_empty() {
        println!("No keys stored. Add one with: keyrack set --key <key> --env <env>");
        return Ok(());
    }

    for host in &hosts {
        println!(
            "  {:<40} {:<12} {:<26} {}",
            host.slug.to_string(),
            host.vault.as_str(),
            host.mech.as_str(),
            host.grade()
        );
    }
    Ok(())
}

pub async fn cmd_del(
    key: String,
    env: String,
    org: Option<String>,
    at: Option<PathBuf>,
    owner: Option<String>,
) -> Result<()> {
    let org = match org {
        Some(org) => org,
        None => {
            repo(at.as_deref())
                .context("no repo manifest to take the org from; pass --org")?
                .org
        }
    };
    let slug = Slug::new(&org, &env, &key)?;

    match open(owner.as_deref())?.del_key(&slug).await? {
        Some(_) => println!("deleted: {}", slug),
        None => println!("not found: {}", slug),
    }
    Ok(())
}

pub async fn cmd_daemon(action: DaemonAction) -> Result<()> {
    let paths = Paths::new();
    let socket = paths.socket(DAEMON_NAME);
    let pid_file = paths.pid_file(DAEMON_NAME);

    match action {
        DaemonAction::Serve => {
            let server = DaemonServer::bind(&socket, Some(pid_file))?;
            server.serve().await?;
        }
        DaemonAction::Status => {
            let info = check_daemon(&socket, &pid_file);
            println!("{} keyrack daemon: {}", info.status.symbol(), info.status.as_str());
            if let Some(pid) = info.pid {
                println!("  pid:     {}", pid);
            }
            println!("  socket:  {}", socket.display());

            let rack = open(None)?;
            if let Ok(Response::Status {
                entries,
                started_at,
                ..
            }) = rack.daemon().send(&keyrack::daemon::Request::Status).await
            {
                println!("  entries: {}", entries);
                println!("  since:   {}", started_at.format("%Y-%m-%d %H:%M:%S"));
            }
        }
        DaemonAction::Stop => {
            let rack = open(None)?;
            match rack.daemon().stop().await {
                Ok(()) => println!("stopped: keyrack daemon"),
                Err(e) => {
                    // Unresponsive or orphaned daemons still get terminated
                    let pids = find_pids(&["keyrack", "daemon", "serve"]);
                    if pids.is_empty() {
                        println!("keyrack daemon is not running ({})", e);
                    }
                    for pid in pids {
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGTERM);
                        }
                        println!("terminated: keyrack daemon (pid {})", pid);
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_get() {
        let cli = Cli::try_parse_from(["keyrack", "get", "--key", "API_KEY", "--json"]).unwrap();
        match cli.command {
            Commands::Get { key, json, scope, .. } => {
                assert_eq!(key.as_deref(), Some("API_KEY"));
                assert!(json);
                assert!(scope.is_none());
            }
            _ => panic!("Expected Get command"),
        }

        let cli = Cli::try_parse_from(["keyrack", "get", "--for", "repo", "--env", "test"]).unwrap();
        assert!(matches!(cli.command, Commands::Get { scope: Some(_), .. }));

        assert!(Cli::try_parse_from(["keyrack", "get"]).is_err());
    }

    #[test]
    fn test_cli_parse_set() {
        let cli = Cli::try_parse_from([
            "keyrack",
            "set",
            "--key",
            "AWS",
            "--env",
            "prod",
            "--vault",
            "aws.iam.sso",
            "--mech",
            "EPHEMERAL_VIA_AWS_SSO",
            "--exid",
            "acme-prod",
        ])
        .unwrap();
        match cli.command {
            Commands::Set {
                vault, mech, exid, ..
            } => {
                assert_eq!(vault, VaultKind::AwsIamSso);
                assert_eq!(mech, Mechanism::EphemeralViaAwsSso);
                assert_eq!(exid.as_deref(), Some("acme-prod"));
            }
            _ => panic!("Expected Set command"),
        }

        assert!(Cli::try_parse_from(["keyrack", "set", "--key", "K", "--env", "e", "--vault", "keychain"]).is_err());
    }

    #[test]
    fn test_cli_parse_owner_and_daemon() {
        let cli = Cli::try_parse_from(["keyrack", "relock", "--for", "ci", "--key", "acme.test.K"]).unwrap();
        match cli.command {
            Commands::Relock { owner, key, .. } => {
                assert_eq!(owner.as_deref(), Some("ci"));
                assert_eq!(key.unwrap().to_string(), "acme.test.K");
            }
            _ => panic!("Expected Relock command"),
        }

        let cli = Cli::try_parse_from(["keyrack", "daemon", "serve"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Daemon {
                action: DaemonAction::Serve
            }
        ));
    }
}
