//! Fabric backend.
//!
//! Runs extraction through the local `fabric` CLI in subprocess mode: the
//! prompt is piped to stdin and the raw completion is read from stdout. The
//! model after `fabric:` is passed through with `-m`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;

use super::{Backend, BackendError};

/// Fabric backend using subprocess mode
pub struct FabricBackend {
    id: String,
    model: String,
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,
}

impl FabricBackend {
    /// Create a Fabric backend for `model`
    ///
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new(model: &str) -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self::with_binary_path(model, binary_path)
    }

    /// Create a Fabric backend with a custom binary path
    pub fn with_binary_path(model: &str, binary_path: impl Into<String>) -> Self {
        Self {
            id: format!("fabric:{}", model),
            model: model.to_string(),
            binary_path: binary_path.into(),
        }
    }

    async fn execute_subprocess(
        &self,
        prompt: &str,
        call_timeout: Duration,
    ) -> Result<String, BackendError> {
        let mut child = Command::new(&self.binary_path)
            .args(["-m", &self.model])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::InvalidRequest(format!(
                    "failed to spawn {}: {}",
                    self.binary_path, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(prompt.as_bytes())
                .await
                .map_err(|e| BackendError::Transient(format!("failed to write to fabric stdin: {}", e)))?;
            // stdin dropped here to signal EOF
        }

        let output = timeout(call_timeout, child.wait_with_output())
            .await
            .map_err(|_| BackendError::Timeout(call_timeout))?
            .map_err(|e| BackendError::Transient(format!("failed to wait for fabric: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(BackendError::Transient(format!(
                "fabric exited with code {}: {}",
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| BackendError::Malformed("fabric output is not valid UTF-8".to_string()))
    }
}

#[async_trait]
impl Backend for FabricBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, prompt: &str, timeout: Duration) -> Result<String, BackendError> {
        self.execute_subprocess(prompt, timeout).await
    }
}
