//! SSH-only operation gating.
//!
//! In SSH-only mode the gateway refuses to touch the local machine: no local
//! shells, no local filesystem or PATH probes. Operations on existing
//! sessions are allowed only against remote sessions, and remote-session and
//! profile management stays fully reachable.

use crate::ws::protocol::ClientOp;

/// Operating mode of the gateway, fixed at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityMode {
    /// Everything allowed.
    Full,
    /// Only remote sessions and their supporting operations.
    SshOnly,
}

impl SecurityMode {
    pub fn from_flag(ssh_only: bool) -> Self {
        if ssh_only {
            SecurityMode::SshOnly
        } else {
            SecurityMode::Full
        }
    }

    pub fn is_ssh_only(&self) -> bool {
        matches!(self, SecurityMode::SshOnly)
    }
}

/// What an operation is allowed to touch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpClass {
    /// Reachable in every mode.
    Open,
    /// Spawns on, reads from or scans the local machine.
    LocalMachine,
    /// Targets an existing session; in SSH-only mode that session must be
    /// remote.
    SessionScoped,
}

pub fn classify(op: &ClientOp) -> OpClass {
    match op {
        ClientOp::CreateSession { .. } | ClientOp::CheckCommand { .. } | ClientOp::ScanCommands => {
            OpClass::LocalMachine
        }
        // Completions run locally unless anchored to a session.
        ClientOp::GetCompletions {
            session_id: None, ..
        } => OpClass::LocalMachine,
        ClientOp::GetCompletions {
            session_id: Some(_),
            ..
        } => OpClass::SessionScoped,
        ClientOp::Write { .. }
        | ClientOp::Resize { .. }
        | ClientOp::CloseSession { .. }
        | ClientOp::Exec { .. }
        | ClientOp::ExecVisible { .. }
        | ClientOp::GetCwd { .. }
        | ClientOp::GetHistory { .. } => OpClass::SessionScoped,
        ClientOp::RemoteConnect { .. }
        | ClientOp::RemoteTest { .. }
        | ClientOp::RemoteDisconnect { .. }
        | ClientOp::ListProfiles
        | ClientOp::SaveProfiles { .. }
        | ClientOp::ListSessions => OpClass::Open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiles::{AuthMethod, SshProfile};

    fn profile() -> SshProfile {
        SshProfile {
            id: String::new(),
            name: String::new(),
            host: "h".to_string(),
            port: 22,
            username: "u".to_string(),
            auth_method: AuthMethod::Agent,
            key_path: None,
            password: None,
            passphrase: None,
            fingerprint: None,
            last_connected: None,
        }
    }

    #[test]
    fn local_machine_ops_are_flagged() {
        let ops = [
            ClientOp::CreateSession {
                cols: 80,
                rows: 24,
                cwd: None,
                reconnect_id: None,
            },
            ClientOp::CheckCommand {
                name: "git".to_string(),
            },
            ClientOp::ScanCommands,
            ClientOp::GetCompletions {
                input: "gi".to_string(),
                cwd: None,
                session_id: None,
            },
        ];
        for op in &ops {
            assert_eq!(classify(op), OpClass::LocalMachine, "{:?}", op);
        }
    }

    #[test]
    fn session_ops_are_session_scoped() {
        let sid = "s1".to_string();
        let ops = [
            ClientOp::Write {
                session_id: sid.clone(),
                data: "ls\n".to_string(),
            },
            ClientOp::Resize {
                session_id: sid.clone(),
                cols: 80,
                rows: 24,
            },
            ClientOp::CloseSession {
                session_id: sid.clone(),
            },
            ClientOp::Exec {
                session_id: sid.clone(),
                command: "pwd".to_string(),
            },
            ClientOp::ExecVisible {
                session_id: sid.clone(),
                command: "pwd".to_string(),
            },
            ClientOp::GetCwd {
                session_id: sid.clone(),
            },
            ClientOp::GetHistory {
                session_id: sid.clone(),
            },
            ClientOp::GetCompletions {
                input: "ls ".to_string(),
                cwd: None,
                session_id: Some(sid),
            },
        ];
        for op in &ops {
            assert_eq!(classify(op), OpClass::SessionScoped, "{:?}", op);
        }
    }

    #[test]
    fn remote_and_profile_ops_stay_open() {
        let ops = [
            ClientOp::RemoteConnect {
                profile: profile(),
                save: false,
            },
            ClientOp::RemoteTest { profile: profile() },
            ClientOp::RemoteDisconnect {
                session_id: "s1".to_string(),
            },
            ClientOp::ListProfiles,
            ClientOp::SaveProfiles {
                profiles: Vec::new(),
            },
            ClientOp::ListSessions,
        ];
        for op in &ops {
            assert_eq!(classify(op), OpClass::Open, "{:?}", op);
        }
    }

    #[test]
    fn mode_follows_the_flag() {
        assert_eq!(SecurityMode::from_flag(false), SecurityMode::Full);
        assert_eq!(SecurityMode::from_flag(true), SecurityMode::SshOnly);
        assert!(SecurityMode::SshOnly.is_ssh_only());
        assert!(!SecurityMode::Full.is_ssh_only());
    }
}
