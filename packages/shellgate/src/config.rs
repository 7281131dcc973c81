use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [gateway]
//                    ssh_only = true
//
//   env var:         SHELLGATE_GATEWAY__SSH_ONLY=true   (double underscore = nesting)
//
//   (single underscore stays within field names: SHELLGATE_SESSION__HISTORY_MAX_BYTES)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub gateway: GatewayFileConfig,
    #[serde(default)]
    pub session: SessionFileConfig,
    #[serde(default)]
    pub capture: CaptureFileConfig,
    #[serde(default)]
    pub timeouts: TimeoutsFileConfig,
}

/// Listener knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Gateway behavior (lives under `[gateway]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GatewayFileConfig {
    /// Reject local-machine operations, allowing only remote sessions.
    #[serde(default)]
    pub ssh_only: bool,
    /// How long a disconnected client keeps its sessions alive.
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
}

impl Default for GatewayFileConfig {
    fn default() -> Self {
        Self {
            ssh_only: false,
            grace_period_secs: default_grace_period_secs(),
        }
    }
}

/// Per-session tunables (lives under `[session]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionFileConfig {
    /// Shell program for local sessions; defaults to the user's shell.
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_history_max_bytes")]
    pub history_max_bytes: usize,
    #[serde(default = "default_history_keep_bytes")]
    pub history_keep_bytes: usize,
}

impl Default for SessionFileConfig {
    fn default() -> Self {
        Self {
            shell: None,
            history_max_bytes: default_history_max_bytes(),
            history_keep_bytes: default_history_keep_bytes(),
        }
    }
}

/// Visible-capture tunables (lives under `[capture]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CaptureFileConfig {
    #[serde(default = "default_capture_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_capture_output_limit")]
    pub output_limit_bytes: usize,
}

impl Default for CaptureFileConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_capture_timeout_secs(),
            output_limit_bytes: default_capture_output_limit(),
        }
    }
}

/// Wall-clock bounds for everything that waits (lives under `[timeouts]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutsFileConfig {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_exec_secs")]
    pub exec_secs: u64,
    #[serde(default = "default_probe_secs")]
    pub probe_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
}

impl Default for TimeoutsFileConfig {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            exec_secs: default_exec_secs(),
            probe_secs: default_probe_secs(),
            keepalive_secs: default_keepalive_secs(),
        }
    }
}

fn default_grace_period_secs() -> u64 {
    180
}
fn default_history_max_bytes() -> usize {
    100_000
}
fn default_history_keep_bytes() -> usize {
    80_000
}
fn default_capture_timeout_secs() -> u64 {
    30
}
fn default_capture_output_limit() -> usize {
    8_000
}
fn default_connect_secs() -> u64 {
    15
}
fn default_exec_secs() -> u64 {
    30
}
fn default_probe_secs() -> u64 {
    5
}
fn default_keepalive_secs() -> u64 {
    15
}

/// Default data directory (`~/.shellgate`), where config.toml and saved
/// profiles live.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".shellgate")
}

/// Build a figment that layers: struct defaults → config.toml → SHELLGATE_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `SHELLGATE_GATEWAY__SSH_ONLY=true`  →  `gateway.ssh_only = true`
///   `SHELLGATE_SESSION__HISTORY_MAX_BYTES=50000`  →  `session.history_max_bytes = 50000`
pub fn load_config(data_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(data_dir.join("config.toml")))
        .merge(Env::prefixed("SHELLGATE_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Listener configuration (runtime view).
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_file(fc: &ServerFileConfig) -> Self {
        Self {
            host: fc.host.clone().unwrap_or_else(|| "127.0.0.1".to_string()),
            port: fc.port.unwrap_or(7850),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Gateway configuration (runtime view).
#[derive(Clone, Debug)]
pub struct GateConfig {
    /// Reject local-machine operations entirely.
    pub ssh_only: bool,
    /// Disconnected clients keep sessions this long before teardown.
    pub grace_period: Duration,
    /// Shell program for local sessions.
    pub shell: Option<String>,
    /// Hard cap on stored history per session.
    pub history_max_bytes: usize,
    /// Suffix retained when the cap is exceeded.
    pub history_keep_bytes: usize,
    /// Deadline for a visible capture.
    pub capture_timeout: Duration,
    /// Ceiling on captured output returned to the caller.
    pub capture_output_limit: usize,
    /// Bound on establishing a remote connection.
    pub connect_timeout: Duration,
    /// Bound on out-of-band command execution.
    pub exec_timeout: Duration,
    /// Bound on ancillary probe subprocesses.
    pub probe_timeout: Duration,
    /// Transport keepalive for remote connections.
    pub keepalive: Duration,
}

impl GateConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        let max = fc.session.history_max_bytes.max(1);
        let mut keep = fc.session.history_keep_bytes;
        if keep >= max {
            warn!(
                "session.history_keep_bytes ({}) must be below history_max_bytes ({}); clamping",
                keep, max
            );
            keep = max * 4 / 5;
        }
        Self {
            ssh_only: fc.gateway.ssh_only,
            grace_period: Duration::from_secs(fc.gateway.grace_period_secs),
            shell: fc.session.shell.clone(),
            history_max_bytes: max,
            history_keep_bytes: keep,
            capture_timeout: Duration::from_secs(fc.capture.timeout_secs),
            capture_output_limit: fc.capture.output_limit_bytes,
            connect_timeout: Duration::from_secs(fc.timeouts.connect_secs),
            exec_timeout: Duration::from_secs(fc.timeouts.exec_secs),
            probe_timeout: Duration::from_secs(fc.timeouts.probe_secs),
            keepalive: Duration::from_secs(fc.timeouts.keepalive_secs),
        }
    }
}
