//! Configuration system for Box.
//!
//! The configuration is a TOML property list at `<root>/config` with three
//! sections: `common` (identities, root servers), `server`, and `client`.
//! The root directory is `~/.box`, overridable through `BOX_HOME`.
//!
//! Node and user UUIDs are generated on first run and written back to the
//! file; every later run reuses them verbatim.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::WHOSWHO;

// ── On-disk layout ────────────────────────────────────────────────────────────

/// Resolved locations below the Box root directory.
#[derive(Debug, Clone)]
pub struct BoxPaths {
    root: PathBuf,
}

impl BoxPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// `$BOX_HOME`, or `~/.box`, or `/tmp/.box` when no home is known.
    pub fn default_root() -> PathBuf {
        std::env::var("BOX_HOME").map(PathBuf::from).unwrap_or_else(|_| {
            std::env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp"))
                .join(".box")
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.root.join("keys")
    }

    pub fn queues_dir(&self) -> PathBuf {
        self.root.join("queues")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn admin_socket(&self) -> PathBuf {
        self.run_dir().join("admin.sock")
    }
}

// ── Enumerated settings ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Critical,
}

impl LogLevel {
    /// Directive string understood by tracing's env filter.
    /// `critical` has no tracing equivalent and maps to `error`.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error | LogLevel::Critical => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            other => Err(ConfigError::Invalid(format!("unknown log level {other:?}"))),
        }
    }
}

/// Where log lines go: `stderr`, `stdout`, or `file:<path>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LogTarget {
    Stderr,
    Stdout,
    File(PathBuf),
}

impl fmt::Display for LogTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogTarget::Stderr => f.write_str("stderr"),
            LogTarget::Stdout => f.write_str("stdout"),
            LogTarget::File(path) => write!(f, "file:{}", path.display()),
        }
    }
}

impl FromStr for LogTarget {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogTarget::Stderr),
            "stdout" => Ok(LogTarget::Stdout),
            other => match other.strip_prefix("file:") {
                Some(path) if !path.is_empty() => Ok(LogTarget::File(PathBuf::from(path))),
                _ => Err(ConfigError::Invalid(format!("unknown log target {other:?}"))),
            },
        }
    }
}

impl TryFrom<String> for LogTarget {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LogTarget> for String {
    fn from(t: LogTarget) -> String {
        t.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Clear-text UDP. The baseline.
    Clear,
    /// AEAD-framed UDP behind a Noise handshake. Reserved; not yet usable.
    Noise,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Clear => f.write_str("clear"),
            TransportKind::Noise => f.write_str("noise"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoisePattern {
    Nk,
    Ik,
}

// ── Sections ──────────────────────────────────────────────────────────────────

/// Default UDP port for both roles.
pub const DEFAULT_PORT: u16 = 12567;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoxConfig {
    pub common: CommonConfig,
    pub server: ServerConfig,
    pub client: ClientConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommonConfig {
    /// Persistent identity of this daemon instance. Autogenerated.
    pub node_uuid: Uuid,
    /// Persistent identity of the owning human/organisation. Autogenerated.
    pub user_uuid: Uuid,
    /// Fallback resolvers consulted when no explicit endpoint is given,
    /// as `ip:port` or bare `ip` strings.
    pub root_servers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub log_level: LogLevel,
    pub log_target: LogTarget,
    pub transport: TransportKind,
    /// Expose the local admin socket.
    pub admin_channel: bool,
    /// Ask the gateway for a port mapping on startup.
    pub port_mapping: bool,
    /// Queues whose GET never removes. `whoswho` is implicitly included.
    pub permanent_queues: Vec<String>,
    /// Hex-encoded pre-shared key for the keyed transport.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pre_share_key: Option<String>,
    pub noise_pattern: NoisePattern,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default server address. Empty means loopback.
    pub address: String,
    pub port: u16,
    pub log_level: LogLevel,
    pub log_target: LogTarget,
}

impl Default for BoxConfig {
    fn default() -> Self {
        Self {
            common: CommonConfig::default(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            node_uuid: Uuid::new_v4(),
            user_uuid: Uuid::new_v4(),
            root_servers: Vec::new(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            log_level: LogLevel::Info,
            log_target: LogTarget::Stderr,
            transport: TransportKind::Clear,
            admin_channel: true,
            port_mapping: false,
            permanent_queues: Vec::new(),
            pre_share_key: None,
            noise_pattern: NoisePattern::Nk,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            port: DEFAULT_PORT,
            log_level: LogLevel::Info,
            log_target: LogTarget::Stderr,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl BoxConfig {
    /// Load the property list from `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: BoxConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the property list, creating it with fresh identities if absent.
    ///
    /// A hand-written file that omits the identity section is completed and
    /// written back, so identities stay stable across runs either way.
    pub fn load_or_init(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            let config = BoxConfig::default();
            config.save(path)?;
            return Ok(config);
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: BoxConfig =
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        if !text.contains("node_uuid") || !text.contains("user_uuid") {
            config.save(path)?;
        }
        Ok(config)
    }

    /// Write the property list, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let text = toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)?;
        std::fs::write(path, text).map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))
    }

    /// Reject settings that cannot be acted on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(psk) = &self.server.pre_share_key {
            if hex::decode(psk).is_err() {
                return Err(ConfigError::Invalid(
                    "pre_share_key must be hex-encoded".to_owned(),
                ));
            }
        }
        Ok(())
    }

    /// The permanent-queue set: configuration plus the implicit `whoswho`.
    pub fn permanent_queues(&self) -> Vec<String> {
        let mut queues = self.server.permanent_queues.clone();
        if !queues.iter().any(|q| q == WHOSWHO) {
            queues.push(WHOSWHO.to_owned());
        }
        queues
    }
}
