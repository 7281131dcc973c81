//! Visible command capture over a live terminal.
//!
//! A terminal stream has no request/response structure, so getting "the
//! output and exit code of this one command" out of an interactive shell
//! takes a sentinel: the command is written as typed input with a trailer
//! that echoes a nonce marker plus the shell's reported exit status, and
//! the session's output is watched until that marker comes back. Fragile
//! by nature (the user can type over it, prompts vary), but it is the only
//! way to run a command *in* the user's visible session and still return
//! a structured result.

use shell_session::{SessionError, SessionHandle, ShellFamily};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ansi::strip_ansi;

/// Exit code reported when the capture deadline passes, mirroring the
/// conventional shell timeout code.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Result of a visible capture.
#[derive(Clone, Debug)]
pub struct CaptureOutcome {
    pub stdout: String,
    pub exit_code: i32,
    pub timed_out: bool,
}

/// Run `command` inside the session's visible terminal and capture its
/// cleaned output and exit code. Resolves with partial output and exit
/// code 124 if the deadline passes first.
pub async fn run_visible(
    handle: &SessionHandle,
    family: ShellFamily,
    command: &str,
    deadline: Duration,
    output_limit: usize,
) -> Result<CaptureOutcome, SessionError> {
    let marker = format!("__SHELLGATE_DONE_{}__", Uuid::new_v4().simple());
    let wrapped = wrap_command(command, &marker, family);

    // Subscribe before writing so no output can slip past.
    let mut rx = handle.subscribe();
    handle.write(wrapped.as_bytes()).await?;

    let mut buf = String::new();
    let until = tokio::time::Instant::now() + deadline;
    loop {
        let chunk = match tokio::time::timeout_at(until, rx.recv()).await {
            Ok(Ok(chunk)) => chunk,
            Ok(Err(RecvError::Lagged(n))) => {
                warn!("capture fell {} chunks behind on the output stream", n);
                continue;
            }
            // Session torn down mid-capture: resolve like a timeout rather
            // than hanging the caller.
            Ok(Err(RecvError::Closed)) => {
                debug!("session closed during capture");
                return Ok(timed_out_outcome(&buf, output_limit));
            }
            Err(_) => return Ok(timed_out_outcome(&buf, output_limit)),
        };
        buf.push_str(&String::from_utf8_lossy(&chunk.data));

        let stripped = strip_ansi(&buf);
        if let Some((at, code)) = find_sentinel(&stripped, &marker) {
            let stdout = clamp_output(&clean_output(&stripped[..at], &marker), output_limit);
            return Ok(CaptureOutcome {
                stdout,
                exit_code: code,
                timed_out: false,
            });
        }
    }
}

fn timed_out_outcome(buf: &str, output_limit: usize) -> CaptureOutcome {
    let stripped = strip_ansi(buf);
    CaptureOutcome {
        stdout: clamp_output(&clean_output(&stripped, ""), output_limit),
        exit_code: TIMEOUT_EXIT_CODE,
        timed_out: true,
    }
}

/// Append the sentinel trailer in the session's shell dialect. The trailer
/// rides the same input line, so it reports the exit status of exactly the
/// command before it.
fn wrap_command(command: &str, marker: &str, family: ShellFamily) -> String {
    match family {
        ShellFamily::Posix => format!("{}; echo \"{} $?\"\n", command, marker),
        ShellFamily::PowerShell => {
            format!("{}; echo \"{} $LASTEXITCODE\"\n", command, marker)
        }
    }
}

/// Find the first marker occurrence that is followed by a numeric exit
/// code and return its byte offset and the parsed code.
///
/// The shell's own echo of the typed trailer contains the marker too, but
/// there it is followed by the literal `$?` / `$LASTEXITCODE` text, never
/// by digits, so scanning for marker-then-digits skips it. The marker is
/// matched as a literal substring; its nonce makes it unambiguous.
fn find_sentinel(stripped: &str, marker: &str) -> Option<(usize, i32)> {
    let mut from = 0;
    while let Some(rel) = stripped[from..].find(marker) {
        let at = from + rel;
        let after = &stripped[at + marker.len()..];
        let rest = after.trim_start_matches([' ', '\t']);
        let end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        let digits = &rest[..end];
        if !digits.is_empty() {
            if let Ok(code) = digits.parse::<i32>() {
                return Some((at, code));
            }
        }
        from = at + marker.len();
    }
    None
}

/// Clean the raw capture region: drop the shell's echo of the typed
/// command (the first line), drop stray trailing echo fragments of the
/// trailer, and trim surrounding whitespace.
fn clean_output(region: &str, marker: &str) -> String {
    let mut lines: Vec<&str> = region.lines().collect();
    if !lines.is_empty() {
        lines.remove(0);
    }
    while let Some(last) = lines.last() {
        let trailing_echo = (!marker.is_empty() && last.contains(marker))
            || last.trim_end().ends_with("; echo");
        if trailing_echo {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n").trim().to_string()
}

/// Clamp to `limit` bytes, keeping a head and tail slice around an
/// elision marker.
fn clamp_output(s: &str, limit: usize) -> String {
    if s.len() <= limit {
        return s.to_string();
    }
    let half = limit / 2;
    let mut head_end = half.min(s.len());
    while head_end > 0 && !s.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = s.len() - half.min(s.len());
    while tail_start < s.len() && !s.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    format!(
        "{}\n... [output truncated] ...\n{}",
        &s[..head_end],
        &s[tail_start..]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use shell_session::{LocalShell, LocalShellConfig};

    const MARKER: &str = "__SHELLGATE_DONE_abc123__";

    fn bash_session() -> LocalShell {
        LocalShell::spawn(LocalShellConfig {
            shell: Some("/bin/bash".to_string()),
            working_dir: Some(std::env::temp_dir()),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn wrap_command_uses_the_shell_dialect() {
        let posix = wrap_command("ls -la", MARKER, ShellFamily::Posix);
        assert_eq!(posix, format!("ls -la; echo \"{} $?\"\n", MARKER));

        let ps = wrap_command("dir", MARKER, ShellFamily::PowerShell);
        assert!(ps.contains("$LASTEXITCODE"));
    }

    #[test]
    fn sentinel_requires_digits_after_the_marker() {
        // The echoed trailer shows the literal `$?`, which must not match.
        let echo_only = format!("$ ls; echo \"{} $?\"\r\n", MARKER);
        assert!(find_sentinel(&echo_only, MARKER).is_none());

        let with_result = format!("{}file.txt\r\n{} 0\r\n", echo_only, MARKER);
        let (at, code) = find_sentinel(&with_result, MARKER).unwrap();
        assert_eq!(code, 0);
        assert!(with_result[..at].ends_with("file.txt\r\n"));
    }

    #[test]
    fn sentinel_parses_multidigit_codes() {
        let buf = format!("$ boom; echo \"{} $?\"\r\n{} 127\r\n", MARKER, MARKER);
        let (_, code) = find_sentinel(&buf, MARKER).unwrap();
        assert_eq!(code, 127);
    }

    #[test]
    fn clean_output_drops_echo_and_trailing_fragments() {
        let region = format!(
            "$ cat notes; echo \"{} $?\"\r\nline one\r\nline two\r\n",
            MARKER
        );
        assert_eq!(clean_output(&region, MARKER), "line one\nline two");

        // A wrapped echo fragment left dangling at the end is dropped too.
        let region = format!("$ true; ec\r\nho \"{} $?\"\r\n", MARKER);
        assert_eq!(clean_output(&region, MARKER), "");
    }

    #[test]
    fn clamp_keeps_head_and_tail() {
        let long = "a".repeat(6000) + &"b".repeat(6000);
        let clamped = clamp_output(&long, 8000);
        assert!(clamped.len() < long.len());
        assert!(clamped.starts_with("aaaa"));
        assert!(clamped.ends_with("bbbb"));
        assert!(clamped.contains("... [output truncated] ..."));

        assert_eq!(clamp_output("short", 8000), "short");
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let shell = bash_session();
        let handle = shell.handle().clone();
        let outcome = run_visible(
            &handle,
            ShellFamily::Posix,
            "echo hello",
            Duration::from_secs(15),
            8000,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "hello");
        assert_eq!(outcome.exit_code, 0);
        assert!(!outcome.timed_out);
        handle.kill().await;
    }

    #[tokio::test]
    async fn captures_failure_exit_codes() {
        let shell = bash_session();
        let handle = shell.handle().clone();
        let outcome = run_visible(
            &handle,
            ShellFamily::Posix,
            "false",
            Duration::from_secs(15),
            8000,
        )
        .await
        .unwrap();
        assert_eq!(outcome.exit_code, 1);
        assert!(!outcome.timed_out);
        handle.kill().await;
    }

    #[tokio::test]
    async fn hanging_command_resolves_at_the_deadline() {
        let shell = bash_session();
        let handle = shell.handle().clone();
        let outcome = run_visible(
            &handle,
            ShellFamily::Posix,
            "sleep 30",
            Duration::from_secs(1),
            8000,
        )
        .await
        .unwrap();
        assert!(outcome.timed_out);
        assert_eq!(outcome.exit_code, TIMEOUT_EXIT_CODE);
        handle.kill().await;
    }

    #[tokio::test]
    async fn concurrent_captures_do_not_cross_match() {
        let shell = bash_session();
        let handle = shell.handle().clone();
        let first = run_visible(
            &handle,
            ShellFamily::Posix,
            "echo alpha-result",
            Duration::from_secs(15),
            8000,
        );
        let second = run_visible(
            &handle,
            ShellFamily::Posix,
            "echo beta-result",
            Duration::from_secs(15),
            8000,
        );
        let (a, b) = tokio::join!(first, second);
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.exit_code, 0);
        assert_eq!(b.exit_code, 0);
        assert!(a.stdout.contains("alpha-result"));
        assert!(!a.stdout.contains("beta-result"));
        assert!(b.stdout.contains("beta-result"));
        handle.kill().await;
    }

    #[tokio::test]
    async fn ansi_noise_is_stripped_from_captures() {
        let shell = bash_session();
        let handle = shell.handle().clone();
        let outcome = run_visible(
            &handle,
            ShellFamily::Posix,
            "printf '\\033[31mcolored\\033[0m\\n'",
            Duration::from_secs(15),
            8000,
        )
        .await
        .unwrap();
        assert_eq!(outcome.stdout, "colored");
        assert_eq!(outcome.exit_code, 0);
        handle.kill().await;
    }
}
