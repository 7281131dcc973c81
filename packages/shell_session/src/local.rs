use anyhow::Context;
use portable_pty::{Child, CommandBuilder, MasterPty, PtySize, native_pty_system};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::error::SessionError;
use crate::handle::{SessionCommand, SessionHandle, SessionKind, SessionOutput, ShellFamily};
use crate::probe::default_shell;

/// Configuration for spawning a local shell session.
#[derive(Clone, Debug)]
pub struct LocalShellConfig {
    /// Shell program; defaults to the user's shell.
    pub shell: Option<String>,
    /// Working directory; defaults to the user's home.
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub rows: u16,
    pub cols: u16,
}

impl Default for LocalShellConfig {
    fn default() -> Self {
        Self {
            shell: None,
            working_dir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
        }
    }
}

/// A shell running on a local pseudo-terminal.
pub struct LocalShell {
    handle: SessionHandle,
    program: String,
}

impl LocalShell {
    /// Spawn the shell and return once the process is running.
    pub fn spawn(config: LocalShellConfig) -> Result<LocalShell, SessionError> {
        let program = config.shell.clone().unwrap_or_else(default_shell);
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("Failed to open PTY")
            .map_err(SessionError::from)?;

        let mut cmd = CommandBuilder::new(&program);

        let working_dir = config.working_dir.clone().or_else(dirs::home_dir);
        if let Some(dir) = &working_dir {
            cmd.cwd(dir);
        }

        // Set environment for proper terminal behavior
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");

        // Inherit PATH and other essential environment variables
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        if let Ok(home) = std::env::var("HOME") {
            cmd.env("HOME", home);
        }
        if let Ok(user) = std::env::var("USER") {
            cmd.env("USER", user);
        }

        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        // For shells, ensure they know they're interactive
        if program.ends_with("bash") || program.ends_with("sh") || program.ends_with("zsh") {
            cmd.env("PS1", "$ ");
        }

        info!(shell = %program, dir = ?working_dir, "Spawning local shell");

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            error!("Failed to spawn shell '{}': {}", program, e);
            SessionError::SpawnFailed(e.to_string())
        })?;

        let pid = child.process_id();
        info!("Shell process started with PID: {:?}", pid);

        let (output_tx, _) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (eof_tx, eof_rx) = mpsc::unbounded_channel();

        let mut actor = ShellActor {
            master: pair.master,
            writer: None,
            child,
            pid,
            receiver: msg_rx,
            eof_rx,
            exit_tx,
        };

        let output_tx_clone = output_tx.clone();
        let mut reader = actor
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .map_err(SessionError::from)?;

        // Blocking reader thread: PTY output into the broadcast channel,
        // EOF signalled to the actor so it can reap the child.
        std::thread::spawn(move || {
            let mut buffer = vec![0u8; 4096];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        debug!("PTY EOF - shell has exited");
                        break;
                    }
                    Ok(n) => {
                        let _ = output_tx_clone.send(SessionOutput::now(buffer[..n].to_vec()));
                    }
                    Err(e) => {
                        warn!("Error reading PTY output: {}", e);
                        break;
                    }
                }
            }
            let _ = eof_tx.send(());
        });

        tokio::spawn(async move {
            actor.run().await;
        });

        let handle = SessionHandle::new(
            msg_tx,
            output_tx,
            exit_rx,
            pid.map(i64::from).unwrap_or_default(),
            SessionKind::Local,
        );
        Ok(LocalShell { handle, program })
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn family(&self) -> ShellFamily {
        ShellFamily::of_program(&self.program)
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Actor owning the PTY master and child process.
struct ShellActor {
    master: Box<dyn MasterPty + Send>,
    writer: Option<Box<dyn Write + Send>>,
    child: Box<dyn Child + Send + Sync>,
    pid: Option<u32>,
    receiver: mpsc::Receiver<SessionCommand>,
    eof_rx: mpsc::UnboundedReceiver<()>,
    exit_tx: watch::Sender<Option<i32>>,
}

impl ShellActor {
    async fn run(&mut self) {
        // Take the writer immediately to keep the PTY stdin open
        match self.master.take_writer() {
            Ok(writer) => self.writer = Some(writer),
            Err(e) => error!("Failed to get PTY writer: {}", e),
        }

        let (code, kill_ack) = loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(SessionCommand::Write { data, respond_to }) => {
                        let _ = respond_to.send(self.handle_write(&data));
                    }
                    Some(SessionCommand::Resize { rows, cols, respond_to }) => {
                        let _ = respond_to.send(self.handle_resize(rows, cols));
                    }
                    Some(SessionCommand::Kill { respond_to }) => {
                        self.signal_term();
                        break (self.reap().await, Some(respond_to));
                    }
                    // All handles dropped: nothing can reach this shell
                    // again, so take it down with us.
                    None => {
                        self.signal_term();
                        break (self.reap().await, None);
                    }
                },
                _ = self.eof_rx.recv() => {
                    break (self.reap().await, None);
                }
            }
        };

        // The exit code is published exactly once, before any kill
        // acknowledgment, so a caller returning from kill() always sees
        // the session as dead.
        let _ = self.exit_tx.send(Some(code));
        if let Some(ack) = kill_ack {
            let _ = ack.send(());
        }
        info!("Local shell actor shutting down (exit code {})", code);
    }

    fn handle_write(&mut self, data: &[u8]) -> Result<usize, SessionError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed("No PTY writer available".into()))?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(data.len())
    }

    fn handle_resize(&mut self, rows: u16, cols: u16) -> Result<(), SessionError> {
        self.master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    fn signal_term(&self) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            if let Some(pid) = self.pid {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    debug!("SIGTERM to {} failed (already gone?): {}", pid, e);
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = &self.pid;
        }
    }

    /// Collect the child's exit code, escalating to a hard kill if it
    /// ignores SIGTERM for too long.
    async fn reap(&mut self) -> i32 {
        for _ in 0..40 {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.exit_code() as i32,
                Ok(None) => tokio::time::sleep(Duration::from_millis(50)).await,
                Err(e) => {
                    warn!("Failed to poll shell process: {}", e);
                    return -1;
                }
            }
        }
        warn!("Shell ignored SIGTERM, killing");
        if let Err(e) = self.child.kill() {
            warn!("Failed to kill shell process: {}", e);
        }
        match self.child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn bash_config() -> LocalShellConfig {
        LocalShellConfig {
            shell: Some("/bin/bash".to_string()),
            working_dir: Some(std::env::temp_dir()),
            ..Default::default()
        }
    }

    async fn collect_until(
        rx: &mut broadcast::Receiver<SessionOutput>,
        needle: &str,
    ) -> String {
        let mut seen = String::new();
        loop {
            let chunk = timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for output")
                .expect("output stream closed");
            seen.push_str(&String::from_utf8_lossy(&chunk.data));
            if seen.contains(needle) {
                return seen;
            }
        }
    }

    #[tokio::test]
    async fn spawn_write_and_observe_output() {
        let shell = LocalShell::spawn(bash_config()).unwrap();
        let handle = shell.handle().clone();
        assert!(handle.pid() > 0);
        assert_eq!(handle.kind(), SessionKind::Local);
        assert!(handle.is_alive());

        let mut rx = handle.subscribe();
        handle.write_str("echo marker_$((20+3))\n").await.unwrap();
        let seen = collect_until(&mut rx, "marker_23").await;
        assert!(seen.contains("marker_23"));

        handle.kill().await;
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn exit_code_is_published_once() {
        let shell = LocalShell::spawn(bash_config()).unwrap();
        let handle = shell.handle().clone();

        handle.write_str("exit 7\n").await.unwrap();
        let code = timeout(Duration::from_secs(10), handle.wait_exit())
            .await
            .expect("shell did not exit");
        assert_eq!(code, 7);
        // Late observers still see the same final value.
        assert_eq!(handle.exit_code(), Some(7));
        assert_eq!(handle.wait_exit().await, 7);
    }

    #[tokio::test]
    async fn kill_is_idempotent() {
        let shell = LocalShell::spawn(bash_config()).unwrap();
        let handle = shell.handle().clone();

        handle.kill().await;
        handle.kill().await;
        assert!(!handle.is_alive());
        assert!(matches!(
            handle.write(b"echo nope\n").await,
            Err(SessionError::Closed)
        ));
    }

    #[tokio::test]
    async fn resize_succeeds_on_live_shell() {
        let shell = LocalShell::spawn(bash_config()).unwrap();
        let handle = shell.handle().clone();
        handle.resize(50, 132).await.unwrap();
        handle.kill().await;
    }

    #[tokio::test]
    async fn family_follows_program() {
        let shell = LocalShell::spawn(bash_config()).unwrap();
        assert_eq!(shell.family(), ShellFamily::Posix);
        assert_eq!(shell.program(), "/bin/bash");
        shell.handle().kill().await;
    }
}
