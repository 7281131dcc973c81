//! One-shot helper subprocesses that run beside interactive sessions.
//!
//! These never touch a session's terminal stream: working-directory lookup,
//! command existence checks, shell completions and the command inventory
//! scan all run as short-lived tracked subprocesses with hard timeouts.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::SessionError;
use crate::tracker::CommandTracker;

/// Most completion candidates ever returned to a caller.
pub const MAX_COMPLETIONS: usize = 15;
/// Most command names ever returned by a full scan.
pub const MAX_SCANNED_COMMANDS: usize = 500;

/// Captured result of a one-shot command.
#[derive(Clone, Debug)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// The user's interactive shell, falling back to a sane default.
pub fn default_shell() -> String {
    if cfg!(windows) {
        return "powershell.exe".to_string();
    }
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

/// Single-quote a string for safe interpolation into a shell command line.
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Runs ancillary subprocesses: tracked, time-bounded, never interactive.
pub struct ProbeRunner {
    shell: String,
    tracker: Arc<CommandTracker>,
    timeout: Duration,
}

impl ProbeRunner {
    pub fn new(shell: String, tracker: Arc<CommandTracker>, timeout: Duration) -> Self {
        Self {
            shell,
            tracker,
            timeout,
        }
    }

    pub fn tracker(&self) -> &Arc<CommandTracker> {
        &self.tracker
    }

    /// Run `command` through the shell, optionally in `cwd`.
    pub async fn run_shell(
        &self,
        cwd: Option<&Path>,
        command: &str,
    ) -> Result<ExecOutput, SessionError> {
        let mut cmd = Command::new(&self.shell);
        if self.shell.contains("powershell") || self.shell.contains("pwsh") {
            cmd.arg("-Command").arg(command);
        } else {
            cmd.arg("-c").arg(command);
        }
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        self.output(cmd).await
    }

    /// Spawn and collect a subprocess, enforcing the probe timeout.
    /// The child is registered with the tracker for its whole lifetime and
    /// killed on drop if the timeout fires first.
    async fn output(&self, mut cmd: Command) -> Result<ExecOutput, SessionError> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| SessionError::ExecFailed(e.to_string()))?;
        let _guard = self.tracker.track(child.id());

        match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(out)) => Ok(ExecOutput {
                stdout: String::from_utf8_lossy(&out.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&out.stderr).into_owned(),
                exit_code: out.status.code().unwrap_or(-1),
            }),
            Ok(Err(e)) => Err(SessionError::ExecFailed(e.to_string())),
            Err(_) => Err(SessionError::ExecFailed(format!(
                "timed out after {:?}",
                self.timeout
            ))),
        }
    }

    /// Working directory of the shell process with pid `pid`.
    /// Best-effort: `None` when the pid is synthetic, the process is gone,
    /// or the platform offers no way to ask.
    pub async fn shell_cwd(&self, pid: i64) -> Option<PathBuf> {
        if pid <= 0 {
            return None;
        }
        #[cfg(target_os = "linux")]
        {
            match tokio::fs::read_link(format!("/proc/{}/cwd", pid)).await {
                Ok(path) => Some(path),
                Err(e) => {
                    debug!("cwd lookup for pid {} failed: {}", pid, e);
                    None
                }
            }
        }
        #[cfg(target_os = "macos")]
        {
            let mut cmd = Command::new("lsof");
            cmd.args(["-a", "-p", &pid.to_string(), "-d", "cwd", "-Fn"]);
            match self.output(cmd).await {
                Ok(out) if out.exit_code == 0 => out
                    .stdout
                    .lines()
                    .find_map(|line| line.strip_prefix('n'))
                    .map(PathBuf::from),
                Ok(_) | Err(_) => None,
            }
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos")))]
        {
            None
        }
    }

    /// Whether `name` resolves to a runnable command.
    pub async fn command_exists(&self, name: &str) -> bool {
        if name.is_empty() {
            return false;
        }
        let probe = if cfg!(windows) {
            let mut cmd = Command::new("where");
            cmd.arg(name);
            self.output(cmd).await
        } else {
            self.run_shell(None, &format!("command -v -- {}", shell_quote(name)))
                .await
        };
        match probe {
            Ok(out) => out.exit_code == 0,
            Err(e) => {
                debug!("command existence check for {:?} failed: {}", name, e);
                false
            }
        }
    }

    /// Completion candidates for a partial command line.
    ///
    /// A single-token input completes command names; more than one token
    /// completes file paths relative to `cwd`. Best-effort: any failure
    /// yields an empty list.
    pub async fn completions(&self, input: &str, cwd: Option<&Path>) -> Vec<String> {
        let parts: Vec<&str> = input.split_whitespace().collect();
        let script = if parts.len() > 1 {
            let word = parts.last().copied().unwrap_or("");
            format!("compgen -f -- {}", shell_quote(word))
        } else {
            let word = parts.first().copied().unwrap_or("");
            if word.is_empty() {
                return Vec::new();
            }
            format!("compgen -c -- {}", shell_quote(word))
        };

        // compgen is a bash builtin, so the probe always goes through bash.
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&script);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        match self.output(cmd).await {
            Ok(out) => dedupe_sort_cap(out.stdout.lines(), MAX_COMPLETIONS),
            Err(e) => {
                debug!("completion probe failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Every command name visible to a login shell, capped. Best-effort.
    pub async fn scan_commands(&self) -> Vec<String> {
        let mut cmd = Command::new("bash");
        cmd.args(["-lc", "compgen -c"]);
        match self.output(cmd).await {
            Ok(out) => dedupe_sort_cap(out.stdout.lines(), MAX_SCANNED_COMMANDS),
            Err(e) => {
                debug!("command scan failed: {}", e);
                Vec::new()
            }
        }
    }
}

/// Deduplicate, order shortest-first (ties lexicographic) and cap.
pub(crate) fn dedupe_sort_cap<'a>(lines: impl Iterator<Item = &'a str>, cap: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut items: Vec<String> = lines
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| seen.insert(l.to_string()))
        .map(str::to_string)
        .collect();
    items.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    items.truncate(cap);
    items
}
