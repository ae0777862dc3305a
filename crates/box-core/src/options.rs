//! Runtime options — the value the CLI and configuration reader agree on.
//!
//! The argument parser produces a `RuntimeOptions`; the configuration file
//! fills whatever the command line left unset. The core consumes only the
//! merged view.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

use crate::config::{BoxConfig, LogLevel, LogTarget};
use crate::record::{MappingOrigin, PortMappingPreference};

/// Which half of the binary runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Role {
    #[default]
    Client,
    Server,
}

/// What a client invocation should do once the handshake is through.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ClientAction {
    /// HELLO + STATUS ping, then exit. The default.
    #[default]
    Handshake,
    /// Capture the server's identification string.
    Ping,
    Put {
        queue: String,
        content_type: String,
        data: Vec<u8>,
    },
    Get {
        queue: String,
    },
    Locate {
        subject: Uuid,
    },
    /// Stream every object in a queue (SEARCH).
    Sync {
        queue: String,
    },
}

/// Everything the outer layers resolved before handing control to the core.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    pub role: Role,
    /// Alternate Box root directory. Defaults to `~/.box`.
    pub home: Option<PathBuf>,
    /// Alternate configuration file. Defaults to `<root>/config`.
    pub config_path: Option<PathBuf>,
    /// Remote (client) or bind (server) address override.
    pub address: Option<String>,
    pub port: Option<u16>,
    pub log_level: Option<LogLevel>,
    pub log_target: Option<LogTarget>,
    /// Port-mapping preference override from the command line.
    pub port_mapping: Option<bool>,
    pub action: ClientAction,
    /// Per-attempt client timeout.
    pub timeout: Option<Duration>,
}

impl RuntimeOptions {
    /// The effective port for the current role.
    pub fn effective_port(&self, config: &BoxConfig) -> u16 {
        self.port.unwrap_or(match self.role {
            Role::Server => config.server.port,
            Role::Client => config.client.port,
        })
    }

    /// The effective port-mapping preference, tracking who decided it.
    pub fn port_mapping_preference(&self, config: &BoxConfig) -> PortMappingPreference {
        match self.port_mapping {
            Some(enabled) => PortMappingPreference {
                enabled,
                origin: MappingOrigin::Cli,
            },
            None => PortMappingPreference {
                enabled: config.server.port_mapping,
                origin: if config.server.port_mapping {
                    MappingOrigin::Config
                } else {
                    MappingOrigin::Default
                },
            },
        }
    }

    pub fn effective_log_level(&self, config: &BoxConfig) -> LogLevel {
        self.log_level.unwrap_or(match self.role {
            Role::Server => config.server.log_level,
            Role::Client => config.client.log_level,
        })
    }

    pub fn effective_log_target(&self, config: &BoxConfig) -> LogTarget {
        self.log_target.clone().unwrap_or(match self.role {
            Role::Server => config.server.log_target.clone(),
            Role::Client => config.client.log_target.clone(),
        })
    }
}
