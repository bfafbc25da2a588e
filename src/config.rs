/*!
 * Configuration types for the build worker
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WorkerError};

/// Main configuration for a build worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Hostname or address of the coordinator
    #[serde(default = "default_master")]
    pub master: String,

    /// Coordinator port for the session channel
    #[serde(default = "default_session_port")]
    pub session_port: u16,

    /// Coordinator port for the transfer channel
    #[serde(default = "default_transfer_port")]
    pub transfer_port: u16,

    /// Time to wait before assuming a build has failed, in seconds
    #[serde(default = "default_build_timeout")]
    pub build_timeout_secs: u64,

    /// Executable used to build wheels
    #[serde(default = "default_build_tool")]
    pub build_tool: PathBuf,

    /// Executable listing the shared libraries a binary links against
    #[serde(default = "default_linker_tool")]
    pub linker_tool: PathBuf,

    /// Directory holding the dpkg `*.list` file manifests
    #[serde(default = "default_dpkg_info_dir")]
    pub dpkg_info_dir: PathBuf,

    /// Interpreter probed for the build-target tags
    #[serde(default = "default_python")]
    pub python: PathBuf,

    /// Interpreter version tag override (e.g. "34")
    #[serde(default)]
    pub impl_tag: Option<String>,

    /// ABI tag override (e.g. "cp34m")
    #[serde(default)]
    pub abi_tag: Option<String>,

    /// Platform tag override (e.g. "linux_armv7l")
    #[serde(default)]
    pub platform_tag: Option<String>,

    /// Data segment ceiling applied to each build, in bytes
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: u64,

    /// Protocol and supervision intervals
    #[serde(default)]
    pub timings: Timings,

    /// Log level for diagnostic output
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log file path (None = stderr)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    #[serde(default)]
    pub verbose: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            master: default_master(),
            session_port: default_session_port(),
            transfer_port: default_transfer_port(),
            build_timeout_secs: default_build_timeout(),
            build_tool: default_build_tool(),
            linker_tool: default_linker_tool(),
            dpkg_info_dir: default_dpkg_info_dir(),
            python: default_python(),
            impl_tag: None,
            abi_tag: None,
            platform_tag: None,
            memory_limit_bytes: default_memory_limit(),
            timings: Timings::default(),
            log_level: LogLevel::Info,
            log_file: None,
            verbose: false,
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            WorkerError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        toml::from_str(&contents).map_err(|e| {
            WorkerError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    /// `host:port` of the session channel
    pub fn session_addr(&self) -> String {
        format!("{}:{}", self.master, self.session_port)
    }

    /// `host:port` of the transfer channel
    pub fn transfer_addr(&self) -> String {
        format!("{}:{}", self.master, self.transfer_port)
    }
}

/// Every interval the worker waits on, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Maximum wait for a coordinator reply before reconnecting
    pub reply_timeout_ms: u64,
    /// Lower bound of the pause after SLEEP
    pub sleep_min_ms: u64,
    /// Upper bound of the pause after SLEEP
    pub sleep_max_ms: u64,
    /// Interval between checks on a running build
    pub build_poll_ms: u64,
    /// How long a terminated build gets to exit before it is killed
    pub terminate_grace_ms: u64,
    /// Idle wait on the transfer channel before greeting again
    pub transfer_retry_ms: u64,
    /// Limit for each linker-inspection run
    pub inspect_timeout_ms: u64,
    /// Pause after a refused connection
    pub reconnect_delay_ms: u64,
    /// How long the farewell may take to flush
    pub farewell_linger_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 60_000,
            sleep_min_ms: 5_000,
            sleep_max_ms: 15_000,
            build_poll_ms: 10_000,
            terminate_grace_ms: 10_000,
            transfer_retry_ms: 5_000,
            inspect_timeout_ms: 10_000,
            reconnect_delay_ms: 1_000,
            farewell_linger_ms: 1_000,
        }
    }
}

impl Timings {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }

    pub fn build_poll(&self) -> Duration {
        Duration::from_millis(self.build_poll_ms)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn transfer_retry(&self) -> Duration {
        Duration::from_millis(self.transfer_retry_ms)
    }

    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_millis(self.inspect_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn farewell_linger(&self) -> Duration {
        Duration::from_millis(self.farewell_linger_ms)
    }
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// Parse a human duration such as `3h`, `90m`, `1h30m`, `45s` or `3600`.
///
/// A bare number is seconds. Units: `d`, `h`, `m`, `s`.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    let text = text.trim();
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total: u64 = 0;
    let mut digits = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        if ch.is_whitespace() {
            continue;
        }
        let multiplier = match ch.to_ascii_lowercase() {
            'd' => 86_400,
            'h' => 3_600,
            'm' => 60,
            's' => 1,
            other => return Err(format!("unknown unit '{}' in {:?}", other, text)),
        };
        if digits.is_empty() {
            return Err(format!("missing number before '{}' in {:?}", ch, text));
        }
        let value: u64 = digits
            .parse()
            .map_err(|e| format!("invalid number in {:?}: {}", text, e))?;
        total = value
            .checked_mul(multiplier)
            .and_then(|v| total.checked_add(v))
            .ok_or_else(|| format!("duration {:?} is too large", text))?;
        digits.clear();
    }
    if !digits.is_empty() {
        return Err(format!("trailing number without unit in {:?}", text));
    }
    Ok(Duration::from_secs(total))
}

// Default value functions for serde
fn default_master() -> String {
    "localhost".to_string()
}

fn default_session_port() -> u16 {
    wheelwright_proto::SESSION_PORT
}

fn default_transfer_port() -> u16 {
    wheelwright_proto::TRANSFER_PORT
}

fn default_build_timeout() -> u64 {
    3 * 60 * 60 // 3 hours
}

fn default_build_tool() -> PathBuf {
    PathBuf::from("pip3")
}

fn default_linker_tool() -> PathBuf {
    PathBuf::from("ldd")
}

fn default_dpkg_info_dir() -> PathBuf {
    PathBuf::from("/var/lib/dpkg/info")
}

fn default_python() -> PathBuf {
    PathBuf::from("python3")
}

fn default_memory_limit() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}
