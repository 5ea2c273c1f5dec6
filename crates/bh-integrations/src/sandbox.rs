//! Local process sandbox: shallow clone into a temp directory, write the
//! patched file, run the configured command under a timeout.

use std::path::{Component, Path};
use std::process::{Output, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bh_core::collaborators::{SandboxRunner, VerifyRequest};
use bh_core::config::SandboxConfig;
use bh_core::types::{RepoRef, SandboxResult};
use tokio::process::Command;
use tracing::{debug, info, warn};

enum RunError {
    Spawn(std::io::Error),
    Wait(std::io::Error),
    TimedOut,
}

/// Run `cmd` as the leader of a new process group and wait at most
/// `timeout`. The whole group is killed afterwards, so neither a timeout nor
/// a command that backgrounds work leaves processes behind.
async fn run_bounded(cmd: &mut Command, timeout: Duration) -> Result<Output, RunError> {
    #[cfg(unix)]
    cmd.process_group(0);
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunError::Spawn)?;
    let pid = child.id();

    let waited = tokio::time::timeout(timeout, child.wait_with_output()).await;
    kill_group(pid);
    match waited {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(e)) => Err(RunError::Wait(e)),
        Err(_) => Err(RunError::TimedOut),
    }
}

#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: signals only the group this runner created; ESRCH when it
        // already exited is ignored.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: Option<u32>) {}

#[derive(Debug, Clone)]
pub struct LocalSandboxRunner {
    command: String,
    timeout: Duration,
    max_output_bytes: usize,
    clone_base_url: String,
    git_ref: Option<String>,
}

impl LocalSandboxRunner {
    pub fn new(config: &SandboxConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            max_output_bytes: config.max_output_bytes,
            clone_base_url: config.clone_base_url.clone(),
            git_ref: config.git_ref.clone(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = command.into();
        self
    }

    async fn clone_into(&self, repository: &RepoRef, dir: &Path) -> Result<(), String> {
        let url = repository.clone_url(&self.clone_base_url);
        let mut cmd = Command::new("git");
        cmd.args(["clone", "--depth", "1", "--quiet"]);
        if let Some(git_ref) = &self.git_ref {
            cmd.args(["--branch", git_ref]);
        }
        cmd.arg(&url).arg(dir).env("GIT_TERMINAL_PROMPT", "0");

        debug!(%url, "cloning repository");
        let output = match run_bounded(&mut cmd, self.timeout).await {
            Ok(output) => output,
            Err(RunError::Spawn(e) | RunError::Wait(e)) => {
                return Err(format!("failed to run git: {e}"))
            }
            Err(RunError::TimedOut) => {
                return Err(format!(
                    "git clone of {url} timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(format!("git clone of {url} failed: {}", stderr.trim()));
        }
        Ok(())
    }

    /// Apply the patch (if any) inside an existing checkout and run the
    /// command there.
    pub async fn run_in_directory(
        &self,
        dir: &Path,
        target_file: Option<&str>,
        patched_content: Option<&str>,
    ) -> SandboxResult {
        if let (Some(target), Some(content)) = (target_file, patched_content) {
            if let Err(msg) = write_patch(dir, target, content).await {
                return SandboxResult::diagnostic(msg);
            }
        }

        let started = Instant::now();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.command).current_dir(dir);
        let waited = run_bounded(&mut cmd, self.timeout).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match waited {
            Err(RunError::Spawn(e)) => {
                SandboxResult::diagnostic(format!("failed to start command: {e}"))
            }
            Ok(output) => {
                let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                SandboxResult {
                    succeeded: output.status.success(),
                    output: truncate_tail(&combined, self.max_output_bytes),
                    exit_code: output.status.code(),
                    timed_out: false,
                    duration_ms,
                }
            }
            Err(RunError::Wait(e)) => SandboxResult {
                duration_ms,
                ..SandboxResult::diagnostic(format!("failed waiting for command: {e}"))
            },
            Err(RunError::TimedOut) => {
                warn!(command = %self.command, "sandbox command timed out");
                SandboxResult {
                    succeeded: false,
                    output: format!(
                        "Command timed out after {}s and was killed",
                        self.timeout.as_secs_f64()
                    ),
                    exit_code: None,
                    timed_out: true,
                    duration_ms,
                }
            }
        }
    }
}

#[async_trait]
impl SandboxRunner for LocalSandboxRunner {
    async fn verify(&self, request: VerifyRequest<'_>) -> SandboxResult {
        let workspace = match tempfile::Builder::new().prefix("bughunt-sandbox-").tempdir() {
            Ok(dir) => dir,
            Err(e) => return SandboxResult::diagnostic(format!("failed to create workspace: {e}")),
        };
        let checkout = workspace.path().join(request.repository.name());

        if let Err(msg) = self.clone_into(request.repository, &checkout).await {
            warn!(repository = %request.repository, error = %msg, "sandbox provisioning failed");
            return SandboxResult::diagnostic(msg);
        }

        let result = self
            .run_in_directory(&checkout, request.target_file, request.patched_content)
            .await;
        info!(
            repository = %request.repository,
            succeeded = result.succeeded,
            exit_code = ?result.exit_code,
            duration_ms = result.duration_ms,
            "sandbox run finished"
        );
        result
    }
}

/// Reject paths that could escape the checkout.
fn checked_relative(target: &str) -> Result<&Path, String> {
    let path = Path::new(target);
    if target.trim().is_empty() {
        return Err("empty target path".into());
    }
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe {
        return Err(format!("refusing to write outside the repository: {target}"));
    }
    Ok(path)
}

async fn write_patch(dir: &Path, target: &str, content: &str) -> Result<(), String> {
    let full = dir.join(checked_relative(target)?);
    if let Some(parent) = full.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| format!("failed to create {}: {e}", parent.display()))?;
    }
    tokio::fs::write(&full, content)
        .await
        .map_err(|e| format!("failed to write {target}: {e}"))?;
    debug!(target, bytes = content.len(), "wrote patched file");
    Ok(())
}

/// Keep the last `max` bytes; the end of the output is where failures show.
fn truncate_tail(output: &str, max: usize) -> String {
    if output.len() <= max {
        return output.to_string();
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    format!(
        "[output truncated, first {start} bytes omitted]\n{}",
        &output[start..]
    )
}
