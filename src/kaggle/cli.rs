//! Child-process wrapper around the `kaggle` command-line tool.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::traits::HarvestError;

/// Runs one invocation of the external tool and returns its stdout.
///
/// Implementations classify failures into [`HarvestError`] themselves, so
/// callers only ever see `Transient`, `Terminal` or `Defect`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, args: &[&str]) -> Result<String, HarvestError>;
}

/// Output fragments of a dropped or refused connection.
const NETWORK_MARKERS: &[&str] = &[
    "Connection aborted",
    "RemoteDisconnected",
    "BrokenPipe",
    "connection reset",
    "Connection reset",
    "Read timed out",
];

const RATE_LIMIT_MARKERS: &[&str] = &["429", "Too Many Requests"];

/// Maps a finished invocation onto the error taxonomy. `None` means success.
///
/// Network and rate-limit markers count even when the tool exits 0: it is
/// known to print a traceback and still report success.
pub fn classify(success: bool, output: &str) -> Option<HarvestError> {
    let first_line = || {
        let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        line.trim().to_string()
    };

    if NETWORK_MARKERS.iter().any(|m| output.contains(m)) {
        return Some(HarvestError::transient(format!("connection dropped: {}", first_line())));
    }
    let rate_limited = RATE_LIMIT_MARKERS.iter().any(|m| output.contains(m));
    if rate_limited && (!success || output.contains("429 -")) {
        return Some(HarvestError::transient(format!("rate limited: {}", first_line())));
    }
    if success {
        return None;
    }

    let lower = output.to_lowercase();
    if lower.contains("404") || lower.contains("not found") {
        return Some(HarvestError::not_found(first_line()));
    }
    if lower.contains("403") || lower.contains("forbidden") || lower.contains("401") {
        return Some(HarvestError::rejected(first_line()));
    }
    Some(HarvestError::transient(format!(
        "command failed without a recognised cause: {}",
        first_line()
    )))
}

/// Invokes the real `kaggle` executable.
#[derive(Debug, Clone)]
pub struct KaggleCli {
    program: String,
    timeout: Duration,
}

impl KaggleCli {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }
}

#[async_trait]
impl CommandRunner for KaggleCli {
    async fn run(&self, args: &[&str]) -> Result<String, HarvestError> {
        debug!(program = %self.program, args = ?args, "Running command");

        let child = Command::new(&self.program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| HarvestError::defect(format!("cannot start '{}': {}", self.program, e)))?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(HarvestError::transient(format!(
                    "'{} {}' timed out after {}s",
                    self.program,
                    args.join(" "),
                    self.timeout.as_secs()
                )))
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = format!("{}{}", stdout, stderr);

        match classify(output.status.success(), &combined) {
            None => Ok(stdout),
            Some(err) => {
                debug!(status = ?output.status.code(), error = %err, "Command failed");
                Err(err)
            }
        }
    }
}
