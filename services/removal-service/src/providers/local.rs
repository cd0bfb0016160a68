use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{BackgroundRemover, ProviderError};

const MAX_STDERR_CHARS: usize = 512;

/// Unmetered removal through a local inference command (for example
/// `rembg i`). The image goes in on stdin, the cutout comes back on stdout.
pub struct LocalRemover {
    command: Option<Vec<String>>,
    timeout: Duration,
}

impl LocalRemover {
    pub fn new(command: Option<Vec<String>>, timeout: Duration) -> Self {
        Self {
            command: command.filter(|argv| !argv.is_empty()),
            timeout,
        }
    }

    /// Splits a configured command line on whitespace.
    pub fn from_command_line(command_line: Option<&str>, timeout: Duration) -> Self {
        let command = command_line.map(|line| {
            line.split_whitespace()
                .map(str::to_string)
                .collect::<Vec<_>>()
        });
        Self::new(command, timeout)
    }

    pub fn is_configured(&self) -> bool {
        self.command.is_some()
    }
}

#[async_trait]
impl BackgroundRemover for LocalRemover {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn process(&self, image: Bytes) -> Result<Bytes, ProviderError> {
        let argv = self
            .command
            .as_ref()
            .ok_or_else(|| ProviderError::generic("local background removal is not configured"))?;

        let start = Instant::now();
        let mut process = Command::new(&argv[0]);
        process
            .args(&argv[1..])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = process.spawn().map_err(|err| {
            ProviderError::generic(format!("failed to start local remover {}: {err}", argv[0]))
        })?;

        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(err) = stdin.write_all(&image).await {
                    debug!(error = %err, "local remover closed stdin early");
                }
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|err| {
                ProviderError::generic(format!("local remover did not complete: {err}"))
            })?,
            Err(_) => {
                warn!(timeout = ?self.timeout, "local remover timed out");
                return Err(ProviderError::generic(format!(
                    "local background removal timed out after {}s",
                    self.timeout.as_secs()
                )));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr: String = stderr.trim().chars().take(MAX_STDERR_CHARS).collect();
            return Err(ProviderError::generic(format!(
                "local remover exited with {}: {}",
                output.status, stderr
            )));
        }

        if output.stdout.is_empty() {
            return Err(ProviderError::generic("local remover produced no output"));
        }

        debug!(
            bytes = output.stdout.len(),
            latency = ?start.elapsed(),
            "local remover finished"
        );
        Ok(Bytes::from(output.stdout))
    }
}
