use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::digest::file_sha256;
use crate::error::HailstormError;

pub mod process;
pub mod retry;

pub use retry::{retry, wait_for, RetryPolicy};

// ---------------------------------------------------------------------------
// HostSpec / ExecOutput
// ---------------------------------------------------------------------------

/// Address and credentials for one remote host.
#[derive(Debug, Clone)]
pub struct HostSpec {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub identity: PathBuf,
}

impl HostSpec {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        user: impl Into<String>,
        identity: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            identity: identity.into(),
        }
    }
}

/// Outcome of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ---------------------------------------------------------------------------
// RemoteShell — the transport seam
// ---------------------------------------------------------------------------

/// Primitive shell and file-transfer operations on a single host.
///
/// Implementations map transport-level failures (connect refused, resets,
/// timeouts) to [`HailstormError::TransientHost`]; the [`RemoteExecutor`]
/// retries those. A command that runs but exits non-zero is *not* an error
/// at this layer — it surfaces through [`ExecOutput::exit_code`].
#[async_trait]
pub trait RemoteShell: Send + Sync {
    async fn exec(&self, host: &HostSpec, command: &str) -> Result<ExecOutput, HailstormError>;

    async fn upload(
        &self,
        host: &HostSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), HailstormError>;

    async fn download(
        &self,
        host: &HostSpec,
        remote: &str,
        local: &Path,
    ) -> Result<(), HailstormError>;

    /// Probe reachability once.
    async fn connect(&self, host: &HostSpec, timeout: Duration) -> Result<(), HailstormError>;

    /// SHA-256 of a remote file, or `None` when the file does not exist.
    async fn remote_sha256(
        &self,
        host: &HostSpec,
        remote: &str,
    ) -> Result<Option<String>, HailstormError> {
        let out = self
            .exec(host, &format!("sha256sum {remote} 2>/dev/null"))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        Ok(out.stdout.split_whitespace().next().map(str::to_string))
    }
}

// ---------------------------------------------------------------------------
// RemoteExecutor
// ---------------------------------------------------------------------------

/// Uniform remote-execution API (C2): any [`RemoteShell`] plus bounded
/// retries, idempotent uploads, and connectivity checks.
#[derive(Clone)]
pub struct RemoteExecutor {
    shell: Arc<dyn RemoteShell>,
    policy: RetryPolicy,
}

impl RemoteExecutor {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(shell: Arc<dyn RemoteShell>, policy: RetryPolicy) -> Self {
        Self { shell, policy }
    }

    pub fn shell(&self) -> &Arc<dyn RemoteShell> {
        &self.shell
    }

    /// Run a command, retrying transient transport failures.
    pub async fn exec(
        &self,
        host: &HostSpec,
        command: &str,
    ) -> Result<ExecOutput, HailstormError> {
        retry(&self.policy, command, || self.shell.exec(host, command)).await
    }

    /// Run a command and fail unless it exits zero.
    pub async fn exec_checked(
        &self,
        host: &HostSpec,
        command: &str,
    ) -> Result<ExecOutput, HailstormError> {
        let out = self.exec(host, command).await?;
        if !out.success() {
            return Err(HailstormError::Agent(format!(
                "'{command}' on {} exited {}: {}",
                host.host,
                out.exit_code,
                out.stderr.trim()
            )));
        }
        Ok(out)
    }

    /// Run a command, feeding each stdout line to `on_line`.
    pub async fn exec_streaming<F>(
        &self,
        host: &HostSpec,
        command: &str,
        mut on_line: F,
    ) -> Result<ExecOutput, HailstormError>
    where
        F: FnMut(&str),
    {
        let out = self.exec(host, command).await?;
        for line in out.stdout.lines() {
            on_line(line);
        }
        Ok(out)
    }

    pub async fn upload(
        &self,
        host: &HostSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), HailstormError> {
        retry(&self.policy, "upload", || {
            self.shell.upload(host, local, remote)
        })
        .await
    }

    /// Upload only when the remote copy differs. Returns whether a transfer
    /// actually happened.
    pub async fn upload_idempotent(
        &self,
        host: &HostSpec,
        local: &Path,
        remote: &str,
    ) -> Result<bool, HailstormError> {
        let local_hash = file_sha256(local).await?;
        let remote_hash = self.shell.remote_sha256(host, remote).await?;
        if remote_hash.as_deref() == Some(local_hash.as_str()) {
            debug!(remote, host = %host.host, "remote copy up to date, skipping upload");
            return Ok(false);
        }
        self.upload(host, local, remote).await?;
        Ok(true)
    }

    pub async fn download(
        &self,
        host: &HostSpec,
        remote: &str,
        local: &Path,
    ) -> Result<(), HailstormError> {
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        retry(&self.policy, "download", || {
            self.shell.download(host, remote, local)
        })
        .await
    }

    /// Poll until the host accepts connections, or give up after `timeout`
    /// with a transient error the caller may retry at a higher level.
    pub async fn ensure_connectivity(
        &self,
        host: &HostSpec,
        timeout: Duration,
    ) -> Result<(), HailstormError> {
        let label = format!("connectivity to {}", host.host);
        let probe_timeout = Duration::from_secs(5).min(timeout);
        let result = wait_for(&label, timeout, Duration::from_secs(1), || async {
            match self.shell.connect(host, probe_timeout).await {
                Ok(()) => Ok(true),
                Err(err) if err.is_transient() => Ok(false),
                Err(err) => Err(err),
            }
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(HailstormError::Timeout(_)) => Err(HailstormError::transient(
                host.host.clone(),
                format!("not reachable within {timeout:?}"),
            )),
            Err(err) => Err(err),
        }
    }
}

// ---------------------------------------------------------------------------
// Test double
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
