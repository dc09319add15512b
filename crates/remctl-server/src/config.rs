//! Server configuration

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::{Acl, CommandTable};
use crate::program::ProgramHandler;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Configuration for the remctld daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the listener to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Path to the keytab with client keys
    pub keytab: PathBuf,

    /// Server principal; derived from the hostname when absent
    pub principal: Option<String>,

    /// Commands the server offers
    #[serde(default, rename = "command")]
    pub commands: Vec<CommandConfig>,
}

/// One `[[command]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    /// Command word (first argument)
    pub command: String,

    /// Subcommand word; `ALL` or absent matches any subcommand
    pub subcommand: Option<String>,

    /// Executable to run
    pub program: PathBuf,

    /// Principals allowed to run this entry; absent means anyone
    pub acl: Option<Vec<String>>,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    remctl_protocol::DEFAULT_PORT
}

/// Load configuration from a file
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("failed to read config: {}", e)))?;

    let config: ServerConfig = toml::from_str(&content)?;
    Ok(config)
}

impl ServerConfig {
    /// Address suitable for binding a listener
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Build the dispatch table from the configured command entries
    pub fn command_table(&self) -> CommandTable {
        let mut table = CommandTable::new();
        for entry in &self.commands {
            let acl = match &entry.acl {
                Some(list) => Acl::Principals(list.clone()),
                None => Acl::AnyUser,
            };
            table.add(
                entry.command.clone(),
                entry.subcommand.as_deref(),
                acl,
                Arc::new(ProgramHandler::new(&entry.program)),
            );
        }
        table
    }
}
