use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::SessionError;

/// Transport backing a session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionKind {
    /// Shell on a local pseudo-terminal.
    Local,
    /// Shell on a remote SSH connection.
    Remote,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Local => "local",
            SessionKind::Remote => "remote",
        }
    }
}

/// Shell dialect of a session, used to phrase command trailers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShellFamily {
    Posix,
    PowerShell,
}

impl ShellFamily {
    /// Classify a shell by its program path.
    pub fn of_program(program: &str) -> Self {
        let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
        let name = name.strip_suffix(".exe").unwrap_or(name);
        match name {
            "powershell" | "pwsh" => ShellFamily::PowerShell,
            _ => ShellFamily::Posix,
        }
    }
}

/// Output event from a session's data stream.
#[derive(Clone, Debug)]
pub struct SessionOutput {
    pub data: Vec<u8>,
    pub timestamp: i64,
}

impl SessionOutput {
    pub(crate) fn now(data: Vec<u8>) -> Self {
        Self {
            data,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Messages serviced by a session's actor task.
pub(crate) enum SessionCommand {
    Write {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<usize, SessionError>>,
    },
    Resize {
        rows: u16,
        cols: u16,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
    Kill {
        respond_to: oneshot::Sender<()>,
    },
}

/// Handle to a live shell session.
///
/// Both transports expose exactly this surface: write bytes, resize,
/// terminate, subscribe to the data stream, observe the exit code once.
/// Clones share the underlying session.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
    output_tx: broadcast::Sender<SessionOutput>,
    exit_rx: watch::Receiver<Option<i32>>,
    pid: i64,
    kind: SessionKind,
}

impl SessionHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<SessionCommand>,
        output_tx: broadcast::Sender<SessionOutput>,
        exit_rx: watch::Receiver<Option<i32>>,
        pid: i64,
        kind: SessionKind,
    ) -> Self {
        Self {
            sender,
            output_tx,
            exit_rx,
            pid,
            kind,
        }
    }

    /// Write raw bytes to the session's input.
    pub async fn write(&self, data: &[u8]) -> Result<usize, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Write {
                data: data.to_vec(),
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Write a string to the session's input.
    pub async fn write_str(&self, text: &str) -> Result<usize, SessionError> {
        self.write(text.as_bytes()).await
    }

    /// Resize the session's terminal.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Resize {
                rows,
                cols,
                respond_to: tx,
            })
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    /// Terminate the session. Idempotent: killing an already-dead session
    /// is a no-op.
    pub async fn kill(&self) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Kill { respond_to: tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }

    /// Subscribe to the session's data stream. Each receiver is
    /// independent; dropping one never affects the others.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionOutput> {
        self.output_tx.subscribe()
    }

    /// Exit code if the session has terminated.
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn is_alive(&self) -> bool {
        self.exit_code().is_none()
    }

    /// Wait for the session to terminate and return its exit code.
    /// The exit value is published exactly once; late callers still see it.
    pub async fn wait_exit(&self) -> i32 {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return (*rx.borrow()).unwrap_or(-1);
            }
        }
    }

    /// Process id of the shell. Remote sessions carry a synthetic
    /// negative value that is never a real local pid.
    pub fn pid(&self) -> i64 {
        self.pid
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }
}
