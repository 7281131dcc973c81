//! WebSocket Protocol Types
//!
//! Tagged JSON messages for client-server communication. Requests carry a
//! caller-chosen `id` that is echoed in the reply; fire-and-forget
//! operations produce no reply at all.

use serde::{Deserialize, Serialize};

use crate::profiles::SshProfile;
use crate::registry::SessionSummary;

/// One request envelope: correlation id plus the operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Echoed in the reply. Fire-and-forget operations may omit it.
    #[serde(default)]
    pub id: u64,
    #[serde(flatten)]
    pub op: ClientOp,
}

/// Operations sent FROM the client TO the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientOp {
    // === Session lifecycle ===
    /// Spawn a local shell, or re-attach to a live one via `reconnect_id`.
    CreateSession {
        cols: u16,
        rows: u16,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reconnect_id: Option<String>,
    },
    /// Keystrokes for the interactive stream. Fire-and-forget.
    Write { session_id: String, data: String },
    /// Terminal dimension change. Fire-and-forget.
    Resize {
        session_id: String,
        cols: u16,
        rows: u16,
    },
    /// Kill a session. Fire-and-forget; the exit notice follows as a push.
    CloseSession { session_id: String },

    // === Command execution ===
    /// Run a command out-of-band, invisible to the interactive stream.
    Exec { session_id: String, command: String },
    /// Run a command through the interactive shell and capture its output.
    ExecVisible { session_id: String, command: String },

    // === Session probes ===
    /// Working directory of the session's shell process.
    GetCwd { session_id: String },
    /// Replay of the session's retained output.
    GetHistory { session_id: String },

    // === Local machine probes ===
    /// Does a command exist on the PATH?
    CheckCommand { name: String },
    /// Shell completions for a partial input line. With a `session_id`, the
    /// completion runs against that (remote) session instead of locally.
    GetCompletions {
        input: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Full inventory of available command names.
    ScanCommands,

    // === Remote sessions and profiles ===
    /// Open an SSH session; with `save` set the profile is persisted.
    RemoteConnect { profile: SshProfile, save: bool },
    /// Probe an SSH destination without keeping a session.
    RemoteTest { profile: SshProfile },
    /// Close a remote session.
    RemoteDisconnect { session_id: String },
    ListProfiles,
    /// Replace the stored profile list. Fire-and-forget.
    SaveProfiles { profiles: Vec<SshProfile> },

    // === Introspection ===
    /// Summaries of the caller's live sessions.
    ListSessions,
}

/// Messages sent FROM the server TO the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    // === Connection handshake ===
    /// First message on every connection: the durable client id (to be
    /// presented on reconnect), the operating mode and the caller's live
    /// sessions.
    Hello {
        client_id: String,
        ssh_only: bool,
        sessions: Vec<SessionSummary>,
    },

    // === Replies ===
    Created { id: u64, session_id: String },
    ExecResult {
        id: u64,
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    CaptureResult {
        id: u64,
        stdout: String,
        exit_code: i32,
        timed_out: bool,
    },
    Cwd {
        id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    History { id: u64, data: String },
    CommandExists { id: u64, exists: bool },
    Completions { id: u64, items: Vec<String> },
    Commands { id: u64, items: Vec<String> },
    TestResult {
        id: u64,
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Disconnected { id: u64, closed: bool },
    Profiles {
        id: u64,
        profiles: Vec<SshProfile>,
    },
    Sessions {
        id: u64,
        sessions: Vec<SessionSummary>,
    },

    // === Server pushes ===
    /// Session output chunk.
    Output { session_id: String, data: String },
    /// Session terminated.
    Exit { session_id: String, exit_code: i32 },

    /// Failure reply, or an unsolicited notice when a fire-and-forget
    /// operation went wrong (`id` absent in that case).
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        code: ErrorCode,
        message: String,
    },
}

/// Stable machine-readable failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Operation not allowed in SSH-only mode.
    Restricted,
    /// Unknown session id (or a session owned by someone else).
    NoSession,
    /// Session-scoped operation on a non-remote session in SSH-only mode.
    NotRemote,
    /// The session itself failed (spawn, write, exec).
    SessionFailed,
    /// SSH connection could not be established.
    ConnectFailed,
    /// Malformed request.
    BadRequest,
}
