//! Client for the session daemon

use crate::daemon::protocol::{Request, Response, SessionEntry};
use crate::error::{KeyrackError, Result};
use crate::slug::Slug;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Client for communicating with the keyrack daemon
#[derive(Debug, Clone)]
pub struct DaemonClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DaemonClient {
    pub fn new(socket_path: PathBuf, timeout: Duration) -> Self {
        Self {
            socket_path,
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and wait at most `timeout` for the response
    pub async fn send(&self, request: &Request) -> Result<Response> {
        let name = request.name();
        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path)
                .await
                .map_err(|e| KeyrackError::DaemonUnavailable(e.to_string()))?;

            let bytes = serde_json::to_vec(request)?;
            stream.write_all(&bytes).await?;
            stream.shutdown().await?;

            let mut response = Vec::new();
            stream.read_to_end(&mut response).await?;

            let response: Response = serde_json::from_slice(&response)?;
            Ok::<_, KeyrackError>(response)
        };

        let response = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| KeyrackError::DaemonTimeout(self.timeout.as_millis() as u64))??;

        debug!(request = name, "daemon responded");
        match response {
            Response::Error { message } => Err(KeyrackError::DaemonUnavailable(message)),
            other => Ok(other),
        }
    }

    /// True when something answers on the socket
    pub async fn is_running(&self) -> bool {
        matches!(self.send(&Request::Status).await, Ok(Response::Status { .. }))
    }

    pub async fn unlock(&self, owner: Option<&str>, entries: Vec<SessionEntry>) -> Result<usize> {
        let request = Request::Unlock {
            owner: owner.map(str::to_string),
            entries,
        };
        match self.send(&request).await? {
            Response::Unlocked { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn get(&self, owner: Option<&str>, slug: &Slug) -> Result<Option<SessionEntry>> {
        let request = Request::Get {
            owner: owner.map(str::to_string),
            slug: slug.clone(),
        };
        match self.send(&request).await? {
            Response::Value { entry } => Ok(entry),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn relock(
        &self,
        owner: Option<&str>,
        env: Option<&str>,
        slug: Option<&Slug>,
    ) -> Result<usize> {
        let request = Request::Relock {
            owner: owner.map(str::to_string),
            env: env.map(str::to_string),
            slug: slug.cloned(),
        };
        match self.send(&request).await? {
            Response::Relocked { count } => Ok(count),
            other => Err(unexpected(&other)),
        }
    }

    pub async fn stop(&self) -> Result<()> {
        match self.send(&Request::Stop).await? {
            Response::Stopping => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(response: &Response) -> KeyrackError {
    let kind = serde_json::to_value(response)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(str::to_string))
        .unwrap_or_else(|| "unknown".to_string());
    KeyrackError::DaemonUnavailable(format!("unexpected response: {}", kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_socket_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let client = DaemonClient::new(tmp.path().join("none.sock"), Duration::from_millis(200));

        assert!(!client.is_running().await);
        let slug: Slug = "acme.test.KEY".parse().unwrap();
        assert!(matches!(
            client.get(None, &slug).await,
            Err(KeyrackError::DaemonUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_silent_listener_times_out() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hung.sock");
        // Accepts connections but never answers
        let _listener = tokio::net::UnixListener::bind(&path).unwrap();

        let client = DaemonClient::new(path, Duration::from_millis(100));
        let err = client.send(&Request::Status).await.unwrap_err();
        assert!(matches!(err, KeyrackError::DaemonTimeout(100)));
    }
}
