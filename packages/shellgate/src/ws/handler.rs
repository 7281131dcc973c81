//! WebSocket Handler
//!
//! One connection per client: hello first, then request dispatch until the
//! socket closes, then grace-period accounting. Slow operations (execs,
//! captures, SSH connects, probes) run in their own tasks so the input loop
//! never stalls behind them; keystroke writes stay inline to preserve their
//! order.

use axum::extract::ws::{Message, WebSocket};
use futures::{sink::SinkExt, stream::StreamExt};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use shell_session::{ProbeRunner, RemoteShell, RemoteShellConfig, SessionKind};

use crate::capture;
use crate::clients::ClientRegistry;
use crate::config::GateConfig;
use crate::profiles::{ProfileStore, SshProfile};
use crate::registry::{SessionBackend, SessionRegistry};
use crate::security::{OpClass, SecurityMode, classify};

use super::protocol::{ClientOp, ClientRequest, ErrorCode, ServerMessage};

/// Everything one connection's dispatch needs, cheap to clone into spawned
/// operation tasks.
#[derive(Clone)]
pub(crate) struct ConnCtx {
    pub clients: Arc<ClientRegistry>,
    pub registry: Arc<SessionRegistry>,
    pub profiles: Arc<ProfileStore>,
    pub probe: Arc<ProbeRunner>,
    pub config: Arc<GateConfig>,
    pub mode: SecurityMode,
    pub client_id: String,
}

impl ConnCtx {
    async fn reply(&self, message: ServerMessage) {
        self.clients.deliver(&self.client_id, message).await;
    }

    async fn error(&self, id: Option<u64>, code: ErrorCode, message: String) {
        debug!("Client {} error ({:?}): {}", self.client_id, code, message);
        self.reply(ServerMessage::Error { id, code, message }).await;
    }
}

/// Handle one client WebSocket connection.
pub async fn handle_gate_ws(
    socket: WebSocket,
    clients: Arc<ClientRegistry>,
    registry: Arc<SessionRegistry>,
    profiles: Arc<ProfileStore>,
    probe: Arc<ProbeRunner>,
    config: Arc<GateConfig>,
    token: Option<String>,
) {
    let mode = SecurityMode::from_flag(config.ssh_only);
    let (client_id, seq, mut rx) = clients.connect(token).await;
    info!("Client {} connected (seq {})", client_id, seq);

    // The hello carries the durable id (for reconnection), the operating
    // mode and any sessions that survived a previous connection.
    let sessions = registry.list_owned(&client_id).await;
    clients
        .deliver(
            &client_id,
            ServerMessage::Hello {
                client_id: client_id.clone(),
                ssh_only: mode.is_ssh_only(),
                sessions,
            },
        )
        .await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task to push queued messages out the socket
    let sender_task = async move {
        while let Some(msg) = rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    error!("Failed to serialize message: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    // Task to parse and dispatch incoming requests
    let ctx = ConnCtx {
        clients: Arc::clone(&clients),
        registry: Arc::clone(&registry),
        profiles,
        probe,
        config: Arc::clone(&config),
        mode,
        client_id: client_id.clone(),
    };
    let input_task = async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientRequest>(&text) {
                    Ok(req) => dispatch(&ctx, req).await,
                    Err(e) => {
                        ctx.error(
                            None,
                            ErrorCode::BadRequest,
                            format!("Unparseable request: {}", e),
                        )
                        .await;
                    }
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("WebSocket error for client {}: {}", ctx.client_id, e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        _ = sender_task => debug!("Sender task ended"),
        _ = input_task => debug!("Input task ended"),
    }

    info!("Client {} connection closed (seq {})", client_id, seq);
    clients
        .connection_closed(&client_id, seq, registry, config.grace_period)
        .await;
}

/// Session id targeted by a session-scoped operation.
fn target_session(op: &ClientOp) -> Option<&str> {
    match op {
        ClientOp::Write { session_id, .. }
        | ClientOp::Resize { session_id, .. }
        | ClientOp::CloseSession { session_id }
        | ClientOp::Exec { session_id, .. }
        | ClientOp::ExecVisible { session_id, .. }
        | ClientOp::GetCwd { session_id }
        | ClientOp::GetHistory { session_id } => Some(session_id),
        ClientOp::GetCompletions {
            session_id: Some(session_id),
            ..
        } => Some(session_id),
        _ => None,
    }
}

/// Operations that get no reply on success. Their failures surface as
/// unsolicited errors without an id.
fn fire_and_forget(op: &ClientOp) -> bool {
    matches!(
        op,
        ClientOp::Write { .. }
            | ClientOp::Resize { .. }
            | ClientOp::CloseSession { .. }
            | ClientOp::SaveProfiles { .. }
    )
}

pub(crate) async fn dispatch(ctx: &ConnCtx, req: ClientRequest) {
    let reply_id = if fire_and_forget(&req.op) {
        None
    } else {
        Some(req.id)
    };

    // The security gate runs before any operation logic.
    match classify(&req.op) {
        OpClass::LocalMachine if ctx.mode.is_ssh_only() => {
            ctx.error(
                reply_id,
                ErrorCode::Restricted,
                "Operation not available in SSH-only mode".to_string(),
            )
            .await;
            return;
        }
        OpClass::SessionScoped if ctx.mode.is_ssh_only() => {
            let sid = target_session(&req.op).unwrap_or("");
            match ctx.registry.access(&ctx.client_id, sid).await {
                None => {
                    ctx.error(reply_id, ErrorCode::NoSession, format!("No session {}", sid))
                        .await;
                    return;
                }
                Some(access) if access.kind != SessionKind::Remote => {
                    ctx.error(
                        reply_id,
                        ErrorCode::NotRemote,
                        "Only remote sessions are available in SSH-only mode".to_string(),
                    )
                    .await;
                    return;
                }
                Some(_) => {}
            }
        }
        _ => {}
    }

    let id = req.id;
    match req.op {
        ClientOp::CreateSession {
            cols,
            rows,
            cwd,
            reconnect_id,
        } => create_session(ctx, id, cols, rows, cwd, reconnect_id).await,
        ClientOp::Write { session_id, data } => write_input(ctx, session_id, data).await,
        ClientOp::Resize {
            session_id,
            cols,
            rows,
        } => resize_session(ctx, session_id, cols, rows).await,
        ClientOp::CloseSession { session_id } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                if !ctx.registry.close(&ctx.client_id, &session_id).await {
                    debug!("Close of unknown session {} ignored", session_id);
                }
            });
        }
        ClientOp::Exec {
            session_id,
            command,
        } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { exec_command(&ctx, id, session_id, command).await });
        }
        ClientOp::ExecVisible {
            session_id,
            command,
        } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { capture_command(&ctx, id, session_id, command).await });
        }
        ClientOp::GetCwd { session_id } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { session_cwd(&ctx, id, session_id).await });
        }
        ClientOp::GetHistory { session_id } => {
            match ctx.registry.history_snapshot(&ctx.client_id, &session_id).await {
                Some(data) => ctx.reply(ServerMessage::History { id, data }).await,
                None => {
                    ctx.error(Some(id), ErrorCode::NoSession, format!("No session {}", session_id))
                        .await;
                }
            }
        }
        ClientOp::CheckCommand { name } => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let exists = ctx.probe.command_exists(&name).await;
                ctx.reply(ServerMessage::CommandExists { id, exists }).await;
            });
        }
        ClientOp::GetCompletions {
            input,
            cwd,
            session_id,
        } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { complete(&ctx, id, input, cwd, session_id).await });
        }
        ClientOp::ScanCommands => {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let items = ctx.probe.scan_commands().await;
                ctx.reply(ServerMessage::Commands { id, items }).await;
            });
        }
        ClientOp::RemoteConnect { profile, save } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { remote_connect(&ctx, id, profile, save).await });
        }
        ClientOp::RemoteTest { profile } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { remote_test(&ctx, id, profile).await });
        }
        ClientOp::RemoteDisconnect { session_id } => {
            let ctx = ctx.clone();
            tokio::spawn(async move { remote_disconnect(&ctx, id, session_id).await });
        }
        ClientOp::ListProfiles => {
            let profiles = ctx.profiles.list().await;
            ctx.reply(ServerMessage::Profiles { id, profiles }).await;
        }
        ClientOp::SaveProfiles { profiles } => {
            if let Err(e) = ctx.profiles.save_all(profiles).await {
                warn!("Failed to persist profiles: {}", e);
            }
        }
        ClientOp::ListSessions => {
            let sessions = ctx.registry.list_owned(&ctx.client_id).await;
            ctx.reply(ServerMessage::Sessions { id, sessions }).await;
        }
    }
}

async fn create_session(
    ctx: &ConnCtx,
    id: u64,
    cols: u16,
    rows: u16,
    cwd: Option<String>,
    reconnect_id: Option<String>,
) {
    if let Some(rid) = reconnect_id {
        if ctx.registry.adopt_local(&rid, &ctx.client_id, cols, rows).await {
            ctx.reply(ServerMessage::Created {
                id,
                session_id: rid,
            })
            .await;
            return;
        }
        debug!("Reconnect target {} is gone, spawning a fresh session", rid);
    }

    match ctx
        .registry
        .create_local(&ctx.client_id, cols, rows, cwd.map(PathBuf::from))
        .await
    {
        Ok(session_id) => ctx.reply(ServerMessage::Created { id, session_id }).await,
        Err(e) => {
            ctx.error(
                Some(id),
                ErrorCode::SessionFailed,
                format!("Failed to spawn shell: {}", e),
            )
            .await;
        }
    }
}

async fn write_input(ctx: &ConnCtx, session_id: String, data: String) {
    let Some(access) = ctx.registry.access(&ctx.client_id, &session_id).await else {
        ctx.error(None, ErrorCode::NoSession, format!("No session {}", session_id))
            .await;
        return;
    };
    if let Err(e) = access.handle.write(data.as_bytes()).await {
        ctx.error(
            None,
            ErrorCode::SessionFailed,
            format!("Write to session {} failed: {}", session_id, e),
        )
        .await;
    }
}

async fn resize_session(ctx: &ConnCtx, session_id: String, cols: u16, rows: u16) {
    let Some(access) = ctx.registry.access(&ctx.client_id, &session_id).await else {
        ctx.error(None, ErrorCode::NoSession, format!("No session {}", session_id))
            .await;
        return;
    };
    if let Err(e) = access.handle.resize(rows, cols).await {
        ctx.error(
            None,
            ErrorCode::SessionFailed,
            format!("Resize of session {} failed: {}", session_id, e),
        )
        .await;
    }
}

async fn exec_command(ctx: &ConnCtx, id: u64, session_id: String, command: String) {
    let Some(access) = ctx.registry.access(&ctx.client_id, &session_id).await else {
        ctx.error(Some(id), ErrorCode::NoSession, format!("No session {}", session_id))
            .await;
        return;
    };
    let result = match access.backend.as_ref() {
        SessionBackend::Local(_) => {
            // Out-of-band, but anchored in the shell's current directory.
            let cwd = ctx.probe.shell_cwd(access.handle.pid()).await;
            ctx.probe.run_shell(cwd.as_deref(), &command).await
        }
        SessionBackend::Remote(shell) => shell.exec(&command).await,
    };
    match result {
        Ok(out) => {
            ctx.reply(ServerMessage::ExecResult {
                id,
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: out.exit_code,
            })
            .await;
        }
        Err(e) => {
            ctx.error(Some(id), ErrorCode::SessionFailed, format!("Exec failed: {}", e))
                .await;
        }
    }
}

async fn capture_command(ctx: &ConnCtx, id: u64, session_id: String, command: String) {
    let Some(access) = ctx.registry.access(&ctx.client_id, &session_id).await else {
        ctx.error(Some(id), ErrorCode::NoSession, format!("No session {}", session_id))
            .await;
        return;
    };
    match capture::run_visible(
        &access.handle,
        access.family,
        &command,
        ctx.config.capture_timeout,
        ctx.config.capture_output_limit,
    )
    .await
    {
        Ok(outcome) => {
            ctx.reply(ServerMessage::CaptureResult {
                id,
                stdout: outcome.stdout,
                exit_code: outcome.exit_code,
                timed_out: outcome.timed_out,
            })
            .await;
        }
        Err(e) => {
            ctx.error(Some(id), ErrorCode::SessionFailed, format!("Capture failed: {}", e))
                .await;
        }
    }
}

async fn session_cwd(ctx: &ConnCtx, id: u64, session_id: String) {
    let Some(access) = ctx.registry.access(&ctx.client_id, &session_id).await else {
        ctx.error(Some(id), ErrorCode::NoSession, format!("No session {}", session_id))
            .await;
        return;
    };
    let path = match access.backend.as_ref() {
        SessionBackend::Local(_) => ctx
            .probe
            .shell_cwd(access.handle.pid())
            .await
            .map(|p| p.to_string_lossy().into_owned()),
        SessionBackend::Remote(shell) => shell.current_dir().await,
    };
    ctx.reply(ServerMessage::Cwd { id, path }).await;
}

async fn complete(
    ctx: &ConnCtx,
    id: u64,
    input: String,
    cwd: Option<String>,
    session_id: Option<String>,
) {
    let items = match session_id {
        Some(sid) => {
            let Some(access) = ctx.registry.access(&ctx.client_id, &sid).await else {
                ctx.error(Some(id), ErrorCode::NoSession, format!("No session {}", sid))
                    .await;
                return;
            };
            match access.backend.as_ref() {
                SessionBackend::Remote(shell) => shell.completions(&input).await,
                SessionBackend::Local(_) => {
                    let anchor = match cwd {
                        Some(dir) => Some(PathBuf::from(dir)),
                        None => ctx.probe.shell_cwd(access.handle.pid()).await,
                    };
                    ctx.probe.completions(&input, anchor.as_deref()).await
                }
            }
        }
        None => {
            let anchor = cwd.map(PathBuf::from);
            ctx.probe.completions(&input, anchor.as_deref()).await
        }
    };
    ctx.reply(ServerMessage::Completions { id, items }).await;
}

fn remote_config(profile: &SshProfile, config: &GateConfig) -> RemoteShellConfig {
    RemoteShellConfig {
        host: profile.host.clone(),
        port: profile.port,
        username: profile.username.clone(),
        auth: profile.auth(),
        rows: 24,
        cols: 80,
        connect_timeout: config.connect_timeout,
        keepalive: config.keepalive,
        exec_timeout: config.exec_timeout,
    }
}

async fn remote_connect(ctx: &ConnCtx, id: u64, profile: SshProfile, save: bool) {
    match RemoteShell::connect(remote_config(&profile, &ctx.config)).await {
        Ok(shell) => {
            let fingerprint = shell.fingerprint().map(str::to_string);
            let session_id = ctx.registry.register_remote(&ctx.client_id, shell).await;
            if save {
                if let Err(e) = ctx.profiles.record_connected(profile, fingerprint).await {
                    warn!("Failed to persist profile: {}", e);
                }
            }
            ctx.reply(ServerMessage::Created { id, session_id }).await;
        }
        Err(e) => {
            warn!("Remote connect failed ({}): {}", e.code(), e);
            ctx.error(Some(id), ErrorCode::ConnectFailed, e.to_string())
                .await;
        }
    }
}

async fn remote_test(ctx: &ConnCtx, id: u64, profile: SshProfile) {
    match RemoteShell::test(remote_config(&profile, &ctx.config)).await {
        Ok(()) => {
            ctx.reply(ServerMessage::TestResult {
                id,
                success: true,
                error: None,
            })
            .await;
        }
        Err(e) => {
            ctx.reply(ServerMessage::TestResult {
                id,
                success: false,
                error: Some(e.to_string()),
            })
            .await;
        }
    }
}

async fn remote_disconnect(ctx: &ConnCtx, id: u64, session_id: String) {
    let closed = match ctx.registry.access(&ctx.client_id, &session_id).await {
        Some(access) if access.kind == SessionKind::Remote => {
            ctx.registry.close(&ctx.client_id, &session_id).await
        }
        _ => false,
    };
    ctx.reply(ServerMessage::Disconnected { id, closed }).await;
}
