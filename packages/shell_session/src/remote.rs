//! Shell sessions over SSH.
//!
//! One authenticated connection per session: the interactive shell runs on
//! a single channel satisfying the session handle contract, while one-shot
//! commands (cwd lookup, system fingerprint, completions) each open their
//! own short-lived exec channel so they never disturb the terminal stream.

use russh::client::{self, Handle, Msg};
use russh::keys::agent::client::AgentClient;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::{AuthKind, ConnectError, SessionError};
use crate::handle::{SessionCommand, SessionHandle, SessionKind, SessionOutput};
use crate::probe::{ExecOutput, MAX_COMPLETIONS, dedupe_sort_cap, shell_quote};

// Remote shells have no local process, so their pids come from a synthetic
// negative range that can never collide with a real one.
static NEXT_REMOTE_PID: AtomicI64 = AtomicI64::new(-2);

fn next_remote_pid() -> i64 {
    NEXT_REMOTE_PID.fetch_sub(1, Ordering::Relaxed)
}

/// How to authenticate against the remote host.
#[derive(Clone, Debug)]
pub enum RemoteAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Agent,
}

impl RemoteAuth {
    pub fn kind(&self) -> AuthKind {
        match self {
            RemoteAuth::Password(_) => AuthKind::Password,
            RemoteAuth::Key { .. } => AuthKind::Key,
            RemoteAuth::Agent => AuthKind::Agent,
        }
    }
}

/// Configuration for establishing a remote shell session.
#[derive(Clone, Debug)]
pub struct RemoteShellConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: RemoteAuth,
    pub rows: u16,
    pub cols: u16,
    pub connect_timeout: Duration,
    pub keepalive: Duration,
    pub exec_timeout: Duration,
}

/// A shell running on a remote host over SSH.
pub struct RemoteShell {
    handle: SessionHandle,
    client: Arc<Mutex<Handle<ClientHandler>>>,
    host: String,
    username: String,
    fingerprint: Option<String>,
    exec_timeout: Duration,
    cwd_cache: RwLock<Option<String>>,
    sysinfo_cache: RwLock<Option<String>>,
}

// Manual impl: the russh client handle is not Debug.
impl std::fmt::Debug for RemoteShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteShell")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("fingerprint", &self.fingerprint)
            .field("exec_timeout", &self.exec_timeout)
            .finish_non_exhaustive()
    }
}

struct ClientHandler {
    fingerprint: Arc<std::sync::Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fp = server_public_key.fingerprint(Default::default()).to_string();
        debug!("Server key fingerprint: {}", fp);
        if let Ok(mut slot) = self.fingerprint.lock() {
            *slot = Some(fp);
        }
        Ok(true)
    }
}

impl RemoteShell {
    /// Connect, authenticate and open the interactive shell channel.
    /// Returns only once the shell is fully established.
    pub async fn connect(config: RemoteShellConfig) -> Result<RemoteShell, ConnectError> {
        let host = config.host.clone();
        let port = config.port;

        // Key-based auth fails before any network I/O when the file is gone.
        if let RemoteAuth::Key { path, .. } = &config.auth {
            if !path.exists() {
                return Err(ConnectError::KeyFileMissing(path.display().to_string()));
            }
        }

        // Resolve explicitly so a bad hostname maps to its own category
        // instead of a generic transport failure.
        let addr = tokio::net::lookup_host((host.as_str(), port))
            .await
            .map_err(|_| ConnectError::HostUnresolved(host.clone()))?
            .next()
            .ok_or_else(|| ConnectError::HostUnresolved(host.clone()))?;

        let ssh_config = Arc::new(client::Config {
            keepalive_interval: Some(config.keepalive),
            ..Default::default()
        });
        let fingerprint_slot = Arc::new(std::sync::Mutex::new(None));
        let handler = ClientHandler {
            fingerprint: fingerprint_slot.clone(),
        };

        let mut handle = match tokio::time::timeout(
            config.connect_timeout,
            client::connect(ssh_config, addr, handler),
        )
        .await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => return Err(ConnectError::from_ssh(e, &host, port)),
            Err(_) => return Err(ConnectError::TimedOut),
        };

        let method = config.auth.kind();
        let authed = match &config.auth {
            RemoteAuth::Password(password) => handle
                .authenticate_password(config.username.clone(), password.clone())
                .await
                .map_err(|e| ConnectError::from_ssh(e, &host, port))?
                .success(),
            RemoteAuth::Key { path, passphrase } => {
                let key = load_secret_key(path, passphrase.as_deref()).map_err(|e| {
                    ConnectError::Protocol(format!("could not read key {}: {}", path.display(), e))
                })?;
                let hash = handle
                    .best_supported_rsa_hash()
                    .await
                    .map_err(|e| ConnectError::from_ssh(e, &host, port))?
                    .flatten();
                handle
                    .authenticate_publickey(
                        config.username.clone(),
                        PrivateKeyWithHashAlg::new(Arc::new(key), hash),
                    )
                    .await
                    .map_err(|e| ConnectError::from_ssh(e, &host, port))?
                    .success()
            }
            RemoteAuth::Agent => authenticate_via_agent(&mut handle, &config.username).await?,
        };
        if !authed {
            return Err(ConnectError::AuthRejected { method });
        }

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| ConnectError::from_ssh(e, &host, port))?;
        channel
            .request_pty(
                false,
                "xterm-256color",
                config.cols as u32,
                config.rows as u32,
                0,
                0,
                &[],
            )
            .await
            .map_err(|e| ConnectError::from_ssh(e, &host, port))?;
        channel
            .request_shell(true)
            .await
            .map_err(|e| ConnectError::from_ssh(e, &host, port))?;

        let (output_tx, _) = broadcast::channel(1024);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        let (exit_tx, exit_rx) = watch::channel(None);

        let client = Arc::new(Mutex::new(handle));
        tokio::spawn(shell_channel_task(
            channel,
            msg_rx,
            output_tx.clone(),
            exit_tx,
            client.clone(),
            host.clone(),
        ));

        let pid = next_remote_pid();
        info!(host = %host, user = %config.username, pid, "Remote shell established");

        let session_handle =
            SessionHandle::new(msg_tx, output_tx, exit_rx, pid, SessionKind::Remote);
        let fingerprint = fingerprint_slot.lock().ok().and_then(|slot| slot.clone());

        Ok(RemoteShell {
            handle: session_handle,
            client,
            host,
            username: config.username,
            fingerprint,
            exec_timeout: config.exec_timeout,
            cwd_cache: RwLock::new(None),
            sysinfo_cache: RwLock::new(None),
        })
    }

    /// Connect and authenticate only, then disconnect. Used to validate a
    /// profile without opening a session.
    pub async fn test(config: RemoteShellConfig) -> Result<(), ConnectError> {
        let shell = Self::connect(config).await?;
        shell.handle.kill().await;
        Ok(())
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Fingerprint of the server's host key, recorded during the handshake.
    pub fn fingerprint(&self) -> Option<&str> {
        self.fingerprint.as_deref()
    }

    /// Run a command out-of-band on a fresh exec channel. The interactive
    /// stream never sees it.
    pub async fn exec(&self, command: &str) -> Result<ExecOutput, SessionError> {
        let channel = {
            let client = self.client.lock().await;
            match tokio::time::timeout(self.exec_timeout, client.channel_open_session()).await {
                Ok(Ok(channel)) => channel,
                Ok(Err(e)) => return Err(SessionError::ExecFailed(e.to_string())),
                Err(_) => {
                    return Err(SessionError::ExecFailed(
                        "timed out opening exec channel".into(),
                    ));
                }
            }
        };
        let mut channel = channel;
        channel
            .exec(true, command)
            .await
            .map_err(|e| SessionError::ExecFailed(e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut code = None;
        let deadline = tokio::time::Instant::now() + self.exec_timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, channel.wait()).await {
                Ok(msg) => msg,
                Err(_) => {
                    let _ = channel.close().await;
                    return Err(SessionError::ExecFailed(format!(
                        "command timed out after {:?}",
                        self.exec_timeout
                    )));
                }
            };
            match msg {
                Some(ChannelMsg::Data { data }) => stdout.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { data, ext: 1 }) => stderr.extend_from_slice(&data),
                Some(ChannelMsg::ExtendedData { .. }) => {}
                Some(ChannelMsg::ExitStatus { exit_status }) => code = Some(exit_status as i32),
                Some(ChannelMsg::Close) | None => break,
                Some(_) => {}
            }
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: code.unwrap_or(-1),
        })
    }

    /// Working directory of the remote shell's login environment.
    /// Re-probed on each call; serves the last known value if the probe
    /// fails.
    pub async fn current_dir(&self) -> Option<String> {
        match self.exec("pwd").await {
            Ok(out) if out.exit_code == 0 && !out.stdout.trim().is_empty() => {
                let cwd = out.stdout.trim().to_string();
                *self.cwd_cache.write().await = Some(cwd.clone());
                Some(cwd)
            }
            Ok(_) | Err(_) => self.cwd_cache.read().await.clone(),
        }
    }

    /// Remote system fingerprint (`uname`), probed once and cached.
    pub async fn system_info(&self) -> Option<String> {
        if let Some(cached) = self.sysinfo_cache.read().await.clone() {
            return Some(cached);
        }
        match self.exec("uname -sr").await {
            Ok(out) if out.exit_code == 0 && !out.stdout.trim().is_empty() => {
                let info = out.stdout.trim().to_string();
                *self.sysinfo_cache.write().await = Some(info.clone());
                Some(info)
            }
            Ok(_) | Err(_) => None,
        }
    }

    /// Completion candidates from the remote host, same token rule as the
    /// local probe. Best-effort.
    pub async fn completions(&self, input: &str) -> Vec<String> {
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
        match self.exec(&format!("bash -c {}", shell_quote(&script))).await {
            Ok(out) => dedupe_sort_cap(out.stdout.lines(), MAX_COMPLETIONS),
            Err(e) => {
                debug!("remote completion probe failed: {}", e);
                Vec::new()
            }
        }
    }
}

async fn authenticate_via_agent(
    handle: &mut Handle<ClientHandler>,
    username: &str,
) -> Result<bool, ConnectError> {
    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| ConnectError::Protocol(format!("ssh-agent unavailable: {}", e)))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| ConnectError::Protocol(format!("ssh-agent error: {}", e)))?;
    let hash = handle
        .best_supported_rsa_hash()
        .await
        .map_err(|e| ConnectError::Protocol(e.to_string()))?
        .flatten();
    for key in identities {
        match handle
            .authenticate_publickey_with(username, key, hash, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => continue,
            Err(e) => {
                debug!("agent identity rejected: {}", e);
                continue;
            }
        }
    }
    Ok(false)
}

/// Drives the interactive shell channel: data and extended data both feed
/// the output broadcast, exit status and close drive the exit watch.
async fn shell_channel_task(
    mut channel: Channel<Msg>,
    mut receiver: mpsc::Receiver<SessionCommand>,
    output_tx: broadcast::Sender<SessionOutput>,
    exit_tx: watch::Sender<Option<i32>>,
    client: Arc<Mutex<Handle<ClientHandler>>>,
    host: String,
) {
    let mut status: Option<i32> = None;
    let code = loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => {
                    let _ = output_tx.send(SessionOutput::now(data.to_vec()));
                }
                Some(ChannelMsg::ExtendedData { data, .. }) => {
                    let _ = output_tx.send(SessionOutput::now(data.to_vec()));
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = Some(exit_status as i32);
                }
                Some(ChannelMsg::ExitSignal { signal_name, .. }) => {
                    warn!(host = %host, "Remote shell killed by signal {:?}", signal_name);
                    status = Some(-1);
                }
                Some(ChannelMsg::Eof) => {}
                Some(ChannelMsg::Close) | None => break status.unwrap_or(-1),
                Some(_) => {}
            },
            cmd = receiver.recv() => match cmd {
                Some(SessionCommand::Write { data, respond_to }) => {
                    let n = data.len();
                    let result = channel
                        .data(&data[..])
                        .await
                        .map(|_| n)
                        .map_err(|e| SessionError::WriteFailed(e.to_string()));
                    let _ = respond_to.send(result);
                }
                Some(SessionCommand::Resize { rows, cols, respond_to }) => {
                    let result = channel
                        .window_change(cols as u32, rows as u32, 0, 0)
                        .await
                        .map_err(|e| SessionError::ResizeFailed(e.to_string()));
                    let _ = respond_to.send(result);
                }
                Some(SessionCommand::Kill { respond_to }) => {
                    let _ = channel.close().await;
                    disconnect(&client).await;
                    let _ = respond_to.send(());
                    // Deliberate close counts as clean.
                    break status.unwrap_or(0);
                }
                None => {
                    let _ = channel.close().await;
                    disconnect(&client).await;
                    break status.unwrap_or(0);
                }
            }
        }
    };
    let _ = exit_tx.send(Some(code));
    info!(host = %host, "Remote shell closed (exit code {})", code);
}

async fn disconnect(client: &Arc<Mutex<Handle<ClientHandler>>>) {
    let client = client.lock().await;
    if let Err(e) = client
        .disconnect(Disconnect::ByApplication, "", "English")
        .await
    {
        debug!("SSH disconnect: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(host: &str, port: u16) -> RemoteShellConfig {
        RemoteShellConfig {
            host: host.to_string(),
            port,
            username: "tester".to_string(),
            auth: RemoteAuth::Password("secret".to_string()),
            rows: 24,
            cols: 80,
            connect_timeout: Duration::from_secs(2),
            keepalive: Duration::from_secs(15),
            exec_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn synthetic_pids_are_negative_and_distinct() {
        let a = next_remote_pid();
        let b = next_remote_pid();
        assert!(a < 0);
        assert!(b < a);
    }

    #[test]
    fn auth_kinds_match_methods() {
        assert_eq!(
            RemoteAuth::Password("x".into()).kind(),
            AuthKind::Password
        );
        assert_eq!(
            RemoteAuth::Key {
                path: PathBuf::from("/k"),
                passphrase: None
            }
            .kind(),
            AuthKind::Key
        );
        assert_eq!(RemoteAuth::Agent.kind(), AuthKind::Agent);
    }

    #[tokio::test]
    async fn unresolvable_host_maps_to_host_unresolved() {
        let err = RemoteShell::connect(config_for("no-such-host.invalid", 22))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "host_unresolved");
    }

    #[tokio::test]
    async fn closed_port_maps_to_connection_refused() {
        // Grab a port the kernel just released; nothing listens on it.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = RemoteShell::connect(config_for("127.0.0.1", port))
            .await
            .unwrap_err();
        assert!(
            matches!(err, ConnectError::Refused { .. } | ConnectError::TimedOut),
            "unexpected category: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn missing_key_file_fails_before_the_network() {
        // The host is unresolvable, but the key check comes first.
        let mut config = config_for("no-such-host.invalid", 22);
        config.auth = RemoteAuth::Key {
            path: PathBuf::from("/definitely/not/a/key"),
            passphrase: None,
        };
        let err = RemoteShell::connect(config).await.unwrap_err();
        assert_eq!(err.code(), "key_file_missing");
    }
}
