//! keyrack - Credential resolver for humans and agents
//!
//! Commands:
//! - init: Create the host manifest for an owner
//! - recipient get|set|del: Manage who can decrypt the host manifest
//! - set: Record where a key lives and store its value
//! - get: Resolve a key into granted | locked | blocked | absent
//! - unlock / relock: Fill or clear the session daemon
//! - list / del: Inspect or remove host entries
//! - daemon status|stop: Manage the session daemon

mod cli;

use clap::Parser;
use keyrack::KeyrackError;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

fn main() {
    // stdout carries command output only
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let result = tokio::runtime::Runtime::new()
        .map_err(anyhow::Error::from)
        .and_then(|rt| rt.block_on(run_command(cli.command)));

    if let Err(e) = result {
        eprintln!("error: {:#}", e);
        if let Some(fix) = e.downcast_ref::<KeyrackError>().and_then(|k| k.fix()) {
            eprintln!("fix: {}", fix);
        }
        std::process::exit(1);
    }
}

async fn run_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Init {
            owner,
            label,
            pubkey,
            at,
            org,
        } => cli::cmd_init(owner, label, pubkey, at, org).await,
        Commands::Recipient { action } => cli::cmd_recipient(action).await,
        Commands::Set {
            key,
            env,
            vault,
            mech,
            exid,
            vault_recipient,
            max_duration,
            org,
            at,
            grade,
            owner,
        } => {
            cli::cmd_set(
                key,
                env,
                vault,
                mech,
                exid,
                vault_recipient,
                max_duration,
                org,
                at,
                grade,
                owner,
            )
            .await
        }
        Commands::Get {
            key,
            scope,
            env,
            json,
            allow_dangerous,
            at,
            owner,
        } => cli::cmd_get(key, scope, env, json, allow_dangerous, at, owner).await,
        Commands::Unlock {
            env,
            key,
            passphrase,
            owner,
        } => cli::cmd_unlock(env, key, passphrase, owner).await,
        Commands::Relock { env, key, owner } => cli::cmd_relock(env, key, owner).await,
        Commands::List { json, owner } => cli::cmd_list(json, owner).await,
        Commands::Del {
            key,
            env,
            org,
            at,
            owner,
        } => cli::cmd_del(key, env, org, at, owner).await,
        Commands::Daemon { action } => cli::cmd_daemon(action).await,
    }
}
