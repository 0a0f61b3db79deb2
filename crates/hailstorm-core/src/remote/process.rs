use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::HailstormError;
use crate::remote::{ExecOutput, HostSpec, RemoteShell};

/// [`RemoteShell`] backed by the system `ssh`/`scp` binaries.
///
/// Runs non-interactively (`BatchMode=yes`) with host-key checking disabled,
/// matching the throwaway nature of load-agent hosts. SSH's exit code 255
/// (transport failure) maps to a transient error; any other exit code is the
/// remote command's own.
#[derive(Debug, Clone, Default)]
pub struct OpenSshShell;

impl OpenSshShell {
    pub fn new() -> Self {
        Self
    }

    fn common_args(host: &HostSpec) -> Vec<String> {
        vec![
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-i".to_string(),
            host.identity.to_string_lossy().into_owned(),
        ]
    }

    fn destination(host: &HostSpec) -> String {
        format!("{}@{}", host.user, host.host)
    }
}

#[async_trait]
impl RemoteShell for OpenSshShell {
    async fn exec(&self, host: &HostSpec, command: &str) -> Result<ExecOutput, HailstormError> {
        let output = Command::new("ssh")
            .args(Self::common_args(host))
            .arg("-p")
            .arg(host.port.to_string())
            .arg(Self::destination(host))
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HailstormError::transient(&host.host, e.to_string()))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if exit_code == 255 {
            return Err(HailstormError::transient(&host.host, stderr.trim().to_string()));
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            exit_code,
        })
    }

    async fn upload(
        &self,
        host: &HostSpec,
        local: &Path,
        remote: &str,
    ) -> Result<(), HailstormError> {
        let output = Command::new("scp")
            .args(Self::common_args(host))
            .arg("-P")
            .arg(host.port.to_string())
            .arg(local)
            .arg(format!("{}:{remote}", Self::destination(host)))
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HailstormError::transient(&host.host, e.to_string()))?;
        if !output.status.success() {
            return Err(HailstormError::transient(
                &host.host,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn download(
        &self,
        host: &HostSpec,
        remote: &str,
        local: &Path,
    ) -> Result<(), HailstormError> {
        let output = Command::new("scp")
            .args(Self::common_args(host))
            .arg("-P")
            .arg(host.port.to_string())
            .arg(format!("{}:{remote}", Self::destination(host)))
            .arg(local)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HailstormError::transient(&host.host, e.to_string()))?;
        if !output.status.success() {
            return Err(HailstormError::transient(
                &host.host,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }

    async fn connect(&self, host: &HostSpec, timeout: Duration) -> Result<(), HailstormError> {
        let addr = format!("{}:{}", host.host, host.port);
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&addr)).await {
            Ok(Ok(_stream)) => Ok(()),
            Ok(Err(e)) => Err(HailstormError::transient(&host.host, e.to_string())),
            Err(_) => Err(HailstormError::transient(&host.host, "connect timed out")),
        }
    }
}
