//! Shell Session - local PTY and remote SSH shells behind one handle
//!
//! This crate provides a uniform session abstraction over two transports:
//! a shell on a local pseudo-terminal and a shell on a remote SSH
//! connection. Both yield the same `SessionHandle`, so everything above
//! (registries, output capture, multiplexing) never branches on transport.
//! It has no HTTP dependencies and no protocol knowledge.
//!
//! # Example
//!
//! ```no_run
//! use shell_session::{LocalShell, LocalShellConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let shell = LocalShell::spawn(LocalShellConfig::default()).unwrap();
//!     let handle = shell.handle().clone();
//!
//!     let mut rx = handle.subscribe();
//!     handle.write_str("echo hello\n").await.unwrap();
//!
//!     while let Ok(chunk) = rx.recv().await {
//!         print!("{}", String::from_utf8_lossy(&chunk.data));
//!         if handle.exit_code().is_some() {
//!             break;
//!         }
//!     }
//! }
//! ```

mod error;
mod handle;
mod local;
mod probe;
mod remote;
mod tracker;

pub use error::{AuthKind, ConnectError, SessionError};
pub use handle::{SessionHandle, SessionKind, SessionOutput, ShellFamily};
pub use local::{LocalShell, LocalShellConfig};
pub use probe::{
    ExecOutput, MAX_COMPLETIONS, MAX_SCANNED_COMMANDS, ProbeRunner, default_shell,
};
pub use remote::{RemoteAuth, RemoteShell, RemoteShellConfig};
pub use tracker::CommandTracker;
