//! Live session table and the per-session output pumps.
//!
//! Every session gets one pump task that moves its output into the bounded
//! history and on to the owning client. History is written before the chunk
//! is forwarded, so a `GetHistory` reply can never be ahead of what the
//! client has been shown.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use shell_session::{
    CommandTracker, LocalShell, LocalShellConfig, RemoteShell, SessionError, SessionHandle,
    SessionKind, SessionOutput, ShellFamily,
};

use crate::clients::ClientRegistry;
use crate::config::GateConfig;
use crate::history::SessionHistory;
use crate::ws::protocol::ServerMessage;

pub type SessionId = String;

/// Transport-specific half of a live session.
pub enum SessionBackend {
    Local(LocalShell),
    Remote(RemoteShell),
}

struct SessionEntry {
    handle: SessionHandle,
    backend: Arc<SessionBackend>,
    owner: String,
    family: ShellFamily,
    history: SessionHistory,
    created_at: DateTime<Utc>,
}

/// What a client sees when listing its sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub kind: String,
    pub pid: i64,
}

/// Everything an operation needs from a session, cloned out of the table so
/// no lock is held while the operation runs.
#[derive(Clone)]
pub struct SessionAccess {
    pub handle: SessionHandle,
    pub backend: Arc<SessionBackend>,
    pub kind: SessionKind,
    pub family: ShellFamily,
}

pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, SessionEntry>>,
    clients: Arc<ClientRegistry>,
    tracker: Arc<CommandTracker>,
    config: Arc<GateConfig>,
}

impl SessionRegistry {
    pub fn new(
        clients: Arc<ClientRegistry>,
        tracker: Arc<CommandTracker>,
        config: Arc<GateConfig>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            clients,
            tracker,
            config,
        }
    }

    /// Spawn a local shell owned by `owner` and start pumping its output.
    pub async fn create_local(
        self: &Arc<Self>,
        owner: &str,
        cols: u16,
        rows: u16,
        working_dir: Option<PathBuf>,
    ) -> Result<SessionId, SessionError> {
        let shell = LocalShell::spawn(LocalShellConfig {
            shell: self.config.shell.clone(),
            working_dir,
            env: Vec::new(),
            rows,
            cols,
        })?;

        // Subscribe before anything else awaits so the first prompt bytes
        // land in history.
        let rx = shell.handle().subscribe();
        let family = shell.family();
        let id = Uuid::new_v4().to_string();
        info!(
            "Created local session {} (pid {}, {})",
            id,
            shell.handle().pid(),
            shell.program()
        );

        self.install(id.clone(), owner, SessionBackend::Local(shell), family, rx)
            .await;
        Ok(id)
    }

    /// Take ownership of an already-connected remote shell.
    pub async fn register_remote(self: &Arc<Self>, owner: &str, shell: RemoteShell) -> SessionId {
        let rx = shell.handle().subscribe();
        let id = Uuid::new_v4().to_string();
        info!(
            "Registered remote session {} for {}@{}",
            id,
            shell.username(),
            shell.host()
        );

        // Remote shells are always driven with POSIX syntax.
        self.install(
            id.clone(),
            owner,
            SessionBackend::Remote(shell),
            ShellFamily::Posix,
            rx,
        )
        .await;
        id
    }

    async fn install(
        self: &Arc<Self>,
        id: SessionId,
        owner: &str,
        backend: SessionBackend,
        family: ShellFamily,
        rx: broadcast::Receiver<SessionOutput>,
    ) {
        let handle = match &backend {
            SessionBackend::Local(shell) => shell.handle().clone(),
            SessionBackend::Remote(shell) => shell.handle().clone(),
        };

        let entry = SessionEntry {
            handle: handle.clone(),
            backend: Arc::new(backend),
            owner: owner.to_string(),
            family,
            history: SessionHistory::new(
                self.config.history_max_bytes,
                self.config.history_keep_bytes,
            ),
            created_at: Utc::now(),
        };
        self.sessions.write().await.insert(id.clone(), entry);

        let registry = Arc::clone(self);
        tokio::spawn(registry.pump(id, handle, rx));
    }

    /// Forward output until the session exits, then report the exit and drop
    /// the entry.
    async fn pump(
        self: Arc<Self>,
        id: SessionId,
        handle: SessionHandle,
        mut rx: broadcast::Receiver<SessionOutput>,
    ) {
        let exit_code = loop {
            tokio::select! {
                biased;
                chunk = rx.recv() => match chunk {
                    Ok(out) => self.forward(&id, &out.data).await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Session {} output pump lagged by {} chunks", id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break handle.exit_code().unwrap_or(-1);
                    }
                },
                code = handle.wait_exit() => {
                    // Both transports publish the exit code strictly after the
                    // final data chunk, so whatever is still queued is drained
                    // before the exit notice goes out.
                    loop {
                        match rx.try_recv() {
                            Ok(out) => self.forward(&id, &out.data).await,
                            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                                warn!("Session {} output pump lagged by {} chunks", id, n);
                            }
                            Err(_) => break,
                        }
                    }
                    break code;
                }
            }
        };
        self.finish(&id, exit_code).await;
    }

    async fn forward(&self, id: &str, data: &[u8]) {
        let text = String::from_utf8_lossy(data).into_owned();
        let owner = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(id) else {
                return;
            };
            entry.history.append(&text);
            entry.owner.clone()
        };
        self.clients
            .deliver(
                &owner,
                ServerMessage::Output {
                    session_id: id.to_string(),
                    data: text,
                },
            )
            .await;
    }

    async fn finish(&self, id: &str, exit_code: i32) {
        let owner = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(entry) => entry.owner.clone(),
                None => return,
            }
        };
        info!("Session {} exited with code {}", id, exit_code);
        self.clients
            .deliver(
                &owner,
                ServerMessage::Exit {
                    session_id: id.to_string(),
                    exit_code,
                },
            )
            .await;
        self.sessions.write().await.remove(id);
    }

    /// Look up a session for an operation. Sessions owned by other clients
    /// are treated as absent.
    pub async fn access(&self, client: &str, id: &str) -> Option<SessionAccess> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(id)?;
        if entry.owner != client {
            return None;
        }
        Some(SessionAccess {
            handle: entry.handle.clone(),
            backend: Arc::clone(&entry.backend),
            kind: entry.handle.kind(),
            family: entry.family,
        })
    }

    pub async fn history_snapshot(&self, client: &str, id: &str) -> Option<String> {
        let sessions = self.sessions.read().await;
        let entry = sessions.get(id)?;
        (entry.owner == client).then(|| entry.history.snapshot())
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Re-attach a caller to a live local session instead of spawning a new
    /// one. The session is resized to the caller's dimensions and rebound.
    pub async fn adopt_local(&self, id: &str, client: &str, cols: u16, rows: u16) -> bool {
        let handle = {
            let mut sessions = self.sessions.write().await;
            let Some(entry) = sessions.get_mut(id) else {
                return false;
            };
            if entry.handle.kind() != SessionKind::Local || !entry.handle.is_alive() {
                return false;
            }
            entry.owner = client.to_string();
            entry.handle.clone()
        };
        debug!("Client {} adopted session {}", client, id);
        if let Err(e) = handle.resize(rows, cols).await {
            debug!("Resize of adopted session {} failed: {}", id, e);
        }
        true
    }

    /// Kill a session owned by `client`. The pump forwards the exit notice
    /// and removes the entry.
    pub async fn close(&self, client: &str, id: &str) -> bool {
        let handle = {
            let sessions = self.sessions.read().await;
            match sessions.get(id) {
                Some(entry) if entry.owner == client => entry.handle.clone(),
                _ => return false,
            }
        };
        handle.kill().await;
        true
    }

    /// Drop a session outright, without an exit notice. Safe on unknown ids.
    pub async fn remove(&self, id: &str) -> bool {
        let entry = self.sessions.write().await.remove(id);
        match entry {
            Some(entry) => {
                entry.handle.kill().await;
                true
            }
            None => false,
        }
    }

    /// Tear down every session owned by a client whose grace period expired.
    pub async fn teardown_client(&self, client: &str) -> usize {
        let ids: Vec<SessionId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, entry)| entry.owner == client)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for id in &ids {
            self.remove(id).await;
        }
        if !ids.is_empty() {
            info!("Tore down {} sessions for client {}", ids.len(), client);
        }
        ids.len()
    }

    /// Summaries of a client's sessions, newest first.
    pub async fn list_owned(&self, client: &str) -> Vec<SessionSummary> {
        let sessions = self.sessions.read().await;
        let mut entries: Vec<(&SessionId, &SessionEntry)> = sessions
            .iter()
            .filter(|(_, entry)| entry.owner == client)
            .collect();
        entries.sort_by(|a, b| b.1.created_at.cmp(&a.1.created_at));
        entries
            .into_iter()
            .map(|(id, entry)| SessionSummary {
                id: id.clone(),
                kind: entry.handle.kind().as_str().to_string(),
                pid: entry.handle.pid(),
            })
            .collect()
    }

    /// Kill every live session and drain the subprocess tracker.
    pub async fn shutdown_all(&self) {
        let entries: Vec<(SessionId, SessionHandle)> = {
            let mut sessions = self.sessions.write().await;
            sessions
                .drain()
                .map(|(id, entry)| (id, entry.handle))
                .collect()
        };
        if !entries.is_empty() {
            info!("Shutting down {} live sessions", entries.len());
        }
        for (id, handle) in entries {
            debug!("Killing session {}", id);
            handle.kill().await;
        }
        let killed = self.tracker.kill_all();
        if killed > 0 {
            info!("Killed {} tracked subprocesses", killed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FileConfig;
    use std::time::Duration;

    fn test_registry() -> Arc<SessionRegistry> {
        let config = Arc::new(GateConfig::from_file(&FileConfig::default()));
        Arc::new(SessionRegistry::new(
            Arc::new(ClientRegistry::new()),
            Arc::new(CommandTracker::new()),
            config,
        ))
    }

    async fn wait_gone(registry: &SessionRegistry, id: &str) {
        for _ in 0..100 {
            if !registry.contains(id).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("Session {} still present after 5s", id);
    }

    #[tokio::test]
    async fn create_list_and_close() {
        let registry = test_registry();
        let id = registry
            .create_local("client-a", 80, 24, None)
            .await
            .unwrap();

        let mine = registry.list_owned("client-a").await;
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].id, id);
        assert_eq!(mine[0].kind, "local");
        assert!(mine[0].pid > 0);
        assert!(registry.list_owned("client-b").await.is_empty());

        assert!(registry.close("client-a", &id).await);
        wait_gone(&registry, &id).await;
    }

    #[tokio::test]
    async fn access_is_owner_scoped() {
        let registry = test_registry();
        let id = registry
            .create_local("client-a", 80, 24, None)
            .await
            .unwrap();

        assert!(registry.access("client-b", &id).await.is_none());
        let access = registry.access("client-a", &id).await.unwrap();
        assert_eq!(access.kind, SessionKind::Local);
        assert!(access.handle.is_alive());

        registry.remove(&id).await;
    }

    #[tokio::test]
    async fn output_lands_in_history() {
        let registry = test_registry();
        let id = registry
            .create_local("client-a", 80, 24, None)
            .await
            .unwrap();

        let access = registry.access("client-a", &id).await.unwrap();
        access
            .handle
            .write_str("echo history_probe_$((40+2))\n")
            .await
            .unwrap();

        let mut seen = false;
        for _ in 0..100 {
            if registry
                .history_snapshot("client-a", &id)
                .await
                .is_some_and(|h| h.contains("history_probe_42"))
            {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(seen, "Command output never reached the history buffer");

        registry.remove(&id).await;
    }

    #[tokio::test]
    async fn adopt_rebinds_owner() {
        let registry = test_registry();
        let id = registry
            .create_local("client-a", 80, 24, None)
            .await
            .unwrap();

        assert!(registry.adopt_local(&id, "client-b", 100, 30).await);
        assert!(registry.access("client-a", &id).await.is_none());
        assert!(registry.access("client-b", &id).await.is_some());

        assert!(!registry.adopt_local("no-such-session", "client-b", 80, 24).await);

        registry.remove(&id).await;
    }

    #[tokio::test]
    async fn exit_notice_reaches_the_owner() {
        let config = Arc::new(GateConfig::from_file(&FileConfig::default()));
        let clients = Arc::new(ClientRegistry::new());
        let registry = Arc::new(SessionRegistry::new(
            Arc::clone(&clients),
            Arc::new(CommandTracker::new()),
            config,
        ));

        let (client_id, _seq, mut rx) = clients.connect(Some("tok-exit".to_string())).await;
        let id = registry.create_local(&client_id, 80, 24, None).await.unwrap();

        let access = registry.access(&client_id, &id).await.unwrap();
        access.handle.write_str("exit 5\n").await.unwrap();

        let exit = loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("Timed out waiting for the exit notice")
            {
                Some(ServerMessage::Exit {
                    session_id,
                    exit_code,
                }) => break (session_id, exit_code),
                Some(_) => continue,
                None => panic!("Client channel closed before the exit notice"),
            }
        };
        assert_eq!(exit.0, id);
        assert_eq!(exit.1, 5);

        wait_gone(&registry, &id).await;
    }

    #[tokio::test]
    async fn teardown_client_removes_only_theirs() {
        let registry = test_registry();
        let a1 = registry.create_local("client-a", 80, 24, None).await.unwrap();
        let a2 = registry.create_local("client-a", 80, 24, None).await.unwrap();
        let b1 = registry.create_local("client-b", 80, 24, None).await.unwrap();

        assert_eq!(registry.teardown_client("client-a").await, 2);
        assert!(!registry.contains(&a1).await);
        assert!(!registry.contains(&a2).await);
        assert!(registry.contains(&b1).await);

        registry.remove(&b1).await;
    }

    #[tokio::test]
    async fn remove_is_safe_on_unknown_ids() {
        let registry = test_registry();
        assert!(!registry.remove("never-existed").await);
    }

    #[tokio::test]
    async fn shutdown_all_clears_the_table() {
        let registry = test_registry();
        registry.create_local("client-a", 80, 24, None).await.unwrap();
        registry.create_local("client-b", 80, 24, None).await.unwrap();
        assert_eq!(registry.count().await, 2);

        registry.shutdown_all().await;
        assert_eq!(registry.count().await, 0);
    }
}
