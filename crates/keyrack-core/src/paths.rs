//! Standard paths used by keyrack

use std::path::{Path, PathBuf};

/// Environment variable that relocates all per-user state under one root
pub const HOME_ENV: &str = "KEYRACK_HOME";

/// Environment variable that overrides the daemon socket path
pub const SOCKET_ENV: &str = "KEYRACK_SOCKET";

/// Standard keyrack paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// Data directory (~/.local/share/keyrack)
    pub data: PathBuf,
    /// Config directory (~/.config/keyrack)
    pub config: PathBuf,
    /// Runtime directory for the daemon socket ($XDG_RUNTIME_DIR/keyrack)
    pub runtime: PathBuf,
    /// Home directory, used to discover ssh identities
    pub home: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        if let Ok(root) = std::env::var(HOME_ENV) {
            if !root.is_empty() {
                return Self::with_root(root);
            }
        }

        let data = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("keyrack");

        let config = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("keyrack");

        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"));

        // Prefer the user-scoped runtime dir, fall back to data dir
        let runtime = dirs::runtime_dir()
            .map(|dir| dir.join("keyrack"))
            .unwrap_or_else(|| data.join("run"));

        Self {
            data,
            config,
            runtime,
            home,
        }
    }

    /// Keep every path under a single root (tests, sandboxed agents)
    pub fn with_root(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data: root.join("data"),
            config: root.join("config"),
            runtime: root.join("run"),
            home: root.to_path_buf(),
        }
    }

    /// Encrypted host manifest, one file per owner
    pub fn host_manifest(&self, owner: Option<&str>) -> PathBuf {
        match owner {
            Some(owner) => self.data.join(format!("keyrack.host.{}.age", owner)),
            None => self.data.join("keyrack.host.age"),
        }
    }

    /// keyrack's own age identity, created by `init` when no pubkey is given
    pub fn identity(&self) -> PathBuf {
        self.data.join("identity.key")
    }

    /// Storage directory for a vault backend, isolated per owner
    pub fn vault_dir(&self, vault: &str, owner: Option<&str>) -> PathBuf {
        let scope = match owner {
            Some(owner) => format!("owner={}", owner),
            None => "owner=default".to_string(),
        };
        self.data.join("vault").join(vault).join(scope)
    }

    /// Get socket path for a daemon
    pub fn socket(&self, daemon: &str) -> PathBuf {
        if let Ok(path) = std::env::var(SOCKET_ENV) {
            if !path.is_empty() {
                return PathBuf::from(path);
            }
        }
        self.runtime.join(format!("{}.sock", daemon))
    }

    /// Pid file written by a running daemon
    pub fn pid_file(&self, daemon: &str) -> PathBuf {
        self.runtime.join(format!("{}.pid", daemon))
    }

    /// stderr of a lazily spawned daemon
    pub fn log_file(&self, daemon: &str) -> PathBuf {
        self.data.join("logs").join(format!("{}.log", daemon))
    }

    /// User configuration file
    pub fn config_file(&self) -> PathBuf {
        self.config.join("config.yaml")
    }

    /// Directory holding the user's ssh keys
    pub fn ssh_dir(&self) -> PathBuf {
        self.home.join(".ssh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_manifests_are_distinct_files() {
        let paths = Paths::with_root("/tmp/keyrack-test");
        let default = paths.host_manifest(None);
        let owned = paths.host_manifest(Some("ci"));

        assert_ne!(default, owned);
        assert!(default.ends_with("keyrack.host.age"));
        assert!(owned.ends_with("keyrack.host.ci.age"));
    }

    #[test]
    fn test_vault_dir_scoped_by_owner() {
        let paths = Paths::with_root("/tmp/keyrack-test");
        assert_ne!(
            paths.vault_dir("os.secure", None),
            paths.vault_dir("os.secure", Some("ci"))
        );
    }

    #[test]
    fn test_with_root_contains_everything() {
        let paths = Paths::with_root("/tmp/keyrack-test");
        for path in [&paths.data, &paths.config, &paths.runtime, &paths.home] {
            assert!(path.starts_with("/tmp/keyrack-test"));
        }
        assert!(paths.ssh_dir().starts_with("/tmp/keyrack-test"));
    }
}
