use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Registry of live ancillary subprocesses.
///
/// Every one-shot helper process (cwd lookup, completion probe, command
/// scan) registers here for its lifetime so shutdown can forcibly kill
/// stragglers. Entries are released by RAII guard, so no completion path
/// can leak one.
pub struct CommandTracker {
    procs: Mutex<HashMap<u64, u32>>,
    next_token: AtomicU64,
}

impl CommandTracker {
    pub fn new() -> Self {
        Self {
            procs: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
        }
    }

    /// Register a subprocess pid and get a guard that deregisters it on drop.
    pub fn track(&self, pid: Option<u32>) -> TrackGuard<'_> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        if let Some(pid) = pid {
            if let Ok(mut procs) = self.procs.lock() {
                procs.insert(token, pid);
            }
        }
        TrackGuard {
            tracker: self,
            token,
        }
    }

    fn release(&self, token: u64) {
        if let Ok(mut procs) = self.procs.lock() {
            procs.remove(&token);
        }
    }

    /// Number of subprocesses currently alive.
    pub fn len(&self) -> usize {
        self.procs.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Kill every tracked subprocess. Called on shutdown and bulk teardown.
    pub fn kill_all(&self) -> usize {
        let pids: Vec<u32> = match self.procs.lock() {
            Ok(mut procs) => procs.drain().map(|(_, pid)| pid).collect(),
            Err(_) => return 0,
        };
        let count = pids.len();
        for pid in pids {
            #[cfg(unix)]
            {
                use nix::sys::signal::{Signal, kill};
                use nix::unistd::Pid;
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                    debug!("Tracked subprocess {} already gone: {}", pid, e);
                }
            }
            #[cfg(not(unix))]
            {
                debug!("Leaving subprocess {} to kill-on-drop", pid);
            }
        }
        if count > 0 {
            warn!("Killed {} lingering ancillary subprocess(es)", count);
        }
        count
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the tracked entry when the subprocess completes.
pub struct TrackGuard<'a> {
    tracker: &'a CommandTracker,
    token: u64,
}

impl Drop for TrackGuard<'_> {
    fn drop(&mut self) {
        self.tracker.release(self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_releases_on_drop() {
        let tracker = CommandTracker::new();
        assert!(tracker.is_empty());
        {
            let _guard = tracker.track(Some(12345));
            assert_eq!(tracker.len(), 1);
        }
        assert!(tracker.is_empty());
    }

    #[test]
    fn untracked_pid_is_not_counted() {
        let tracker = CommandTracker::new();
        let _guard = tracker.track(None);
        assert!(tracker.is_empty());
    }

    #[test]
    fn kill_all_drains_the_table() {
        let tracker = CommandTracker::new();
        // A pid far above any kernel's pid_max; the kill is best-effort.
        let guard = tracker.track(Some(i32::MAX as u32));
        assert_eq!(tracker.kill_all(), 1);
        assert!(tracker.is_empty());
        drop(guard);
        assert!(tracker.is_empty());
    }
}
