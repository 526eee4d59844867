//! Session daemon server
//!
//! Owns one in-memory table of unlocked values, keyed by owner and slug.
//! Every request takes the table lock for its whole read or write, so a
//! `get` never sees half of an `unlock`.

use crate::atomic;
use crate::daemon::protocol::{Request, Response, SessionEntry};
use crate::error::{KeyrackError, Result};
use crate::slug::Slug;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs::Permissions;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// Upper bound on a request body
const MAX_REQUEST_BYTES: u64 = 1024 * 1024;

type TableKey = (Option<String>, Slug);

/// Unlocked values, scoped by owner
#[derive(Debug, Default)]
pub struct SessionTable {
    entries: HashMap<TableKey, SessionEntry>,
}

impl SessionTable {
    /// Merge entries in; existing keys are refreshed, others untouched
    pub fn upsert(&mut self, owner: Option<&str>, entries: Vec<SessionEntry>) -> usize {
        let count = entries.len();
        for entry in entries {
            self.entries
                .insert((owner.map(str::to_string), entry.slug.clone()), entry);
        }
        count
    }

    pub fn get(&self, owner: Option<&str>, slug: &Slug, now: DateTime<Utc>) -> Option<SessionEntry> {
        self.entries
            .get(&(owner.map(str::to_string), slug.clone()))
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Remove matching entries of one owner
    ///
    /// With an env, entries of that env and of the `all` bucket go (an
    /// `env.all` key is unlocked alongside every env). With neither env nor
    /// slug, everything the owner holds goes.
    pub fn relock(&mut self, owner: Option<&str>, env: Option<&str>, slug: Option<&Slug>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(entry_owner, entry_slug), _| {
            if entry_owner.as_deref() != owner {
                return true;
            }
            let matches = match (slug, env) {
                (Some(slug), _) => entry_slug == slug,
                (None, Some(env)) => entry_slug.env == env || entry_slug.is_all(),
                (None, None) => true,
            };
            !matches
        });
        before - self.entries.len()
    }

    /// Drop every expired entry
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A bound daemon, ready to serve
pub struct DaemonServer {
    listener: UnixListener,
    socket_path: PathBuf,
    pid_file: Option<PathBuf>,
    table: Arc<Mutex<SessionTable>>,
    shutdown: Arc<Notify>,
    started_at: DateTime<Utc>,
    sweep_interval: Duration,
}

impl DaemonServer {
    /// Bind the socket (0600 in a 0700 directory), replacing a stale one
    pub fn bind(socket_path: &Path, pid_file: Option<PathBuf>) -> Result<Self> {
        if let Some(dir) = socket_path.parent() {
            atomic::ensure_private_dir(dir)?;
        }
        cleanup_stale_socket(socket_path)?;

        let listener = UnixListener::bind(socket_path)?;
        std::fs::set_permissions(socket_path, Permissions::from_mode(0o600))?;

        if let Some(pid_file) = &pid_file {
            std::fs::write(pid_file, std::process::id().to_string())?;
        }

        info!(socket = %socket_path.display(), pid = std::process::id(), "daemon listening");

        Ok(Self {
            listener,
            socket_path: socket_path.to_path_buf(),
            pid_file,
            table: Arc::new(Mutex::new(SessionTable::default())),
            shutdown: Arc::new(Notify::new()),
            started_at: Utc::now(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        })
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Serve until a `stop` request arrives
    pub async fn serve(self) -> Result<()> {
        let sweeper = {
            let table = Arc::clone(&self.table);
            let interval = self.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let purged = table.lock().await.sweep(Utc::now());
                    if purged > 0 {
                        debug!(purged = purged, "swept expired entries");
                    }
                }
            })
        };

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, _) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let table = Arc::clone(&self.table);
                    let shutdown = Arc::clone(&self.shutdown);
                    let started_at = self.started_at;
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, table, shutdown, started_at).await {
                            warn!(error = %e, "connection failed");
                        }
                    });
                }
                _ = self.shutdown.notified() => break,
            }
        }

        sweeper.abort();
        self.table.lock().await.entries.clear();
        self.cleanup();
        info!("daemon stopped");
        Ok(())
    }

    fn cleanup(&self) {
        if let Err(e) = std::fs::remove_file(&self.socket_path) {
            warn!(socket = %self.socket_path.display(), error = %e, "failed to remove socket");
        }
        if let Some(pid_file) = &self.pid_file {
            let _ = std::fs::remove_file(pid_file);
        }
    }
}

fn cleanup_stale_socket(path: &Path) -> Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };

    if !metadata.file_type().is_socket() {
        return Err(KeyrackError::DaemonUnavailable(format!(
            "{} exists but is not a socket",
            path.display()
        )));
    }

    if std::os::unix::net::UnixStream::connect(path).is_ok() {
        return Err(KeyrackError::DaemonUnavailable(format!(
            "another daemon is already listening on {}",
            path.display()
        )));
    }

    std::fs::remove_file(path)?;
    debug!(path = %path.display(), "removed stale socket");
    Ok(())
}

async fn handle_connection(
    mut stream: UnixStream,
    table: Arc<Mutex<SessionTable>>,
    shutdown: Arc<Notify>,
    started_at: DateTime<Utc>,
) -> Result<()> {
    let mut body = Vec::new();
    (&mut stream)
        .take(MAX_REQUEST_BYTES)
        .read_to_end(&mut body)
        .await?;

    let response = match serde_json::from_slice::<Request>(&body) {
        Ok(request) => {
            debug!(request = request.name(), "daemon request");
            dispatch(request, &table, started_at).await
        }
        Err(e) => Response::Error {
            message: format!("bad request: {}", e),
        },
    };

    let bytes = serde_json::to_vec(&response)?;
    stream.write_all(&bytes).await?;
    stream.shutdown().await?;

    // Answer first, so the caller of `stop` sees the acknowledgement
    if matches!(response, Response::Stopping) {
        shutdown.notify_one();
    }
    Ok(())
}

async fn dispatch(
    request: Request,
    table: &Mutex<SessionTable>,
    started_at: DateTime<Utc>,
) -> Response {
    match request {
        Request::Status => Response::Status {
            pid: std::process::id(),
            entries: table.lock().await.len(),
            started_at,
        },
        Request::Unlock { owner, entries } => {
            let count = table.lock().await.upsert(owner.as_deref(), entries);
            info!(owner = owner.as_deref().unwrap_or("default"), count = count, "unlocked");
            Response::Unlocked { count }
        }
        Request::Get { owner, slug } => {
            let entry = table.lock().await.get(owner.as_deref(), &slug, Utc::now());
            debug!(slug = %slug, hit = entry.is_some(), "session lookup");
            Response::Value { entry }
        }
        Request::Relock { owner, env, slug } => {
            let count = table
                .lock()
                .await
                .relock(owner.as_deref(), env.as_deref(), slug.as_ref());
            info!(owner = owner.as_deref().unwrap_or("default"), count = count, "relocked");
            Response::Relocked { count }
        }
        Request::Stop => Response::Stopping,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::client::DaemonClient;
    use crate::mech::Mechanism;
    use crate::secret::SecretValue;
    use tempfile::TempDir;

    fn entry(slug: &str, value: &str, ttl_secs: i64) -> SessionEntry {
        SessionEntry {
            slug: slug.parse().unwrap(),
            value: SecretValue::new(value),
            mech: Mechanism::PermanentViaReplica,
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    fn slug(s: &str) -> Slug {
        s.parse().unwrap()
    }

    #[test]
    fn test_upserts_merge() {
        let mut table = SessionTable::default();
        table.upsert(None, vec![entry("acme.test.A", "1", 60)]);
        table.upsert(None, vec![entry("acme.test.B", "2", 60)]);
        table.upsert(None, vec![entry("acme.test.A", "3", 60)]);

        let now = Utc::now();
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(None, &slug("acme.test.A"), now).unwrap().value.expose(), "3");
        assert_eq!(table.get(None, &slug("acme.test.B"), now).unwrap().value.expose(), "2");
    }

    #[test]
    fn test_expired_entries_are_invisible() {
        let mut table = SessionTable::default();
        table.upsert(None, vec![entry("acme.test.OLD", "x", -1), entry("acme.test.NEW", "y", 60)]);

        let now = Utc::now();
        assert!(table.get(None, &slug("acme.test.OLD"), now).is_none());
        assert_eq!(table.sweep(now), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_owners_are_isolated() {
        let mut table = SessionTable::default();
        table.upsert(Some("ci"), vec![entry("acme.test.KEY", "ci-value", 60)]);

        let now = Utc::now();
        assert!(table.get(None, &slug("acme.test.KEY"), now).is_none());
        assert!(table.get(Some("ci"), &slug("acme.test.KEY"), now).is_some());
        assert_eq!(table.relock(None, None, None), 0);
        assert_eq!(table.relock(Some("ci"), None, None), 1);
    }

    #[test]
    fn test_relock_by_env_includes_all_bucket() {
        let mut table = SessionTable::default();
        table.upsert(
            None,
            vec![
                entry("acme.test.A", "1", 60),
                entry("acme.prod.B", "2", 60),
                entry("acme.all.C", "3", 60),
            ],
        );

        assert_eq!(table.relock(None, Some("test"), None), 2);
        assert_eq!(table.relock(None, Some("test"), None), 0);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_serve_round_trip_and_stop() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("run/keyrack.sock");
        let pid_file = tmp.path().join("run/keyrack.pid");

        let server = DaemonServer::bind(&socket, Some(pid_file.clone())).unwrap();
        let mode = std::fs::metadata(&socket).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let handle = tokio::spawn(server.serve());

        let client = DaemonClient::new(socket.clone(), Duration::from_secs(2));
        assert!(client.is_running().await);

        let count = client
            .unlock(None, vec![entry("acme.test.KEY", "hunter2", 60)])
            .await
            .unwrap();
        assert_eq!(count, 1);

        let got = client.get(None, &slug("acme.test.KEY")).await.unwrap().unwrap();
        assert_eq!(got.value.expose(), "hunter2");
        assert!(client.get(Some("ci"), &slug("acme.test.KEY")).await.unwrap().is_none());

        assert_eq!(client.relock(None, None, None).await.unwrap(), 1);
        assert!(client.get(None, &slug("acme.test.KEY")).await.unwrap().is_none());

        client.stop().await.unwrap();
        handle.await.unwrap().unwrap();
        assert!(!socket.exists());
        assert!(!pid_file.exists());
    }

    #[tokio::test]
    async fn test_refuses_to_replace_live_daemon() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("keyrack.sock");

        let _live = DaemonServer::bind(&socket, None).unwrap();
        assert!(DaemonServer::bind(&socket, None).is_err());
    }

    #[tokio::test]
    async fn test_replaces_stale_socket() {
        let tmp = TempDir::new().unwrap();
        let socket = tmp.path().join("keyrack.sock");

        drop(std::os::unix::net::UnixListener::bind(&socket).unwrap());
        assert!(socket.exists());

        assert!(DaemonServer::bind(&socket, None).is_ok());
    }
}
