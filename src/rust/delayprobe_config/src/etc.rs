//! Manages the `/etc/delayprobe.conf` file.

use crate::params::{FlowDirection, ParamsConfig, RecordFlags};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use toml_edit::DocumentMut;
use tracing::{error, info};

/// Where the configuration lives unless overridden.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/delayprobe.conf";

/// Environment variable that overrides `DEFAULT_CONFIG_PATH`.
pub const CONFIG_ENV_VAR: &str = "DELAYPROBE_CONFIG";

const CONFIG_VERSION: &str = "1.0";

fn default_workers() -> usize {
    1
}

fn default_log2_size() -> u8 {
    18
}

fn default_max_interfaces() -> u32 {
    4096
}

fn default_ipfix_port() -> u16 {
    4739
}

fn default_domain_id() -> u32 {
    1
}

fn default_path_mtu() -> u16 {
    1500
}

fn default_template_interval() -> u64 {
    20
}

/// Top-level configuration file for delayprobe.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Version number for the configuration file. Must be "1.0".
    pub version: String,

    /// Number of flow workers. Each owns a disjoint flow table and timer wheel.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Flow table sizing
    #[serde(default)]
    pub table: TableConfig,

    /// Where IPFIX datagrams go
    pub exporter: ExporterConfig,

    /// If present, parameters to apply at startup
    pub params: Option<ParamsConfig>,

    /// Interfaces to enable at startup. Requires `params`.
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

/// `[table]` section
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableConfig {
    /// log2 of the per-worker hash table (and entry pool) size
    #[serde(default = "default_log2_size")]
    pub log2_size: u8,

    /// Interface indices must be below this value
    #[serde(default = "default_max_interfaces")]
    pub max_interfaces: u32,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            log2_size: default_log2_size(),
            max_interfaces: default_max_interfaces(),
        }
    }
}

/// `[exporter]` section: the IPFIX transport.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Collector IPv4 address
    pub collector_address: Ipv4Addr,

    /// Collector UDP port
    #[serde(default = "default_ipfix_port")]
    pub collector_port: u16,

    /// Source address written into the IPv4 header
    pub source_address: Ipv4Addr,

    /// Source UDP port
    #[serde(default = "default_ipfix_port")]
    pub source_port: u16,

    /// IPFIX observation domain id
    #[serde(default = "default_domain_id")]
    pub domain_id: u32,

    /// Largest datagram (IPv4 header included) that will be built
    #[serde(default = "default_path_mtu")]
    pub path_mtu: u16,

    /// How often templates are re-sent, in seconds
    #[serde(default = "default_template_interval")]
    pub template_interval_seconds: u64,
}

/// One `[[interfaces]]` entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceConfig {
    /// Interface index in the forwarding engine
    pub sw_if_index: u32,

    /// "rx", "tx" or "both"
    pub direction: FlowDirection,
}

impl Config {
    /// Loads the configuration from `DELAYPROBE_CONFIG`, or from
    /// `/etc/delayprobe.conf` if the variable isn't set.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from_path(&path)
    }

    /// Loads a specific file.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            error!("{} does not exist!", path.display());
            return Err(ConfigError::ConfigDoesNotExist);
        }
        if let Ok(raw) = std::fs::read_to_string(path) {
            info!("Loading configuration from {}", path.display());
            Self::load_from_string(&raw)
        } else {
            error!("Unable to read contents of {}", path.display());
            Err(ConfigError::CannotReadFile)
        }
    }

    /// Parses and validates a configuration held in memory.
    pub fn load_from_string(raw: &str) -> Result<Self, ConfigError> {
        let document = raw.parse::<DocumentMut>().map_err(|e| {
            error!("Unable to parse TOML configuration");
            error!("Full error: {:?}", e);
            ConfigError::CannotParseToml
        })?;
        let config = toml_edit::de::from_document::<Config>(document).map_err(|e| {
            error!("Configuration does not match the expected layout");
            error!("Full error: {:?}", e);
            ConfigError::CannotParseToml
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Test if a configuration is valid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version.trim() != CONFIG_VERSION {
            return Err(ConfigError::Invalid(format!(
                "Configuration file is at version [{}], but this version of delayprobe only supports version {CONFIG_VERSION}",
                self.version
            )));
        }
        if self.workers == 0 {
            return Err(ConfigError::Invalid("At least one worker is required".to_string()));
        }
        if !(4..=24).contains(&self.table.log2_size) {
            return Err(ConfigError::Invalid(format!(
                "table.log2_size must be between 4 and 24, got {}",
                self.table.log2_size
            )));
        }
        if self.table.max_interfaces == 0 {
            return Err(ConfigError::Invalid("table.max_interfaces must be non-zero".to_string()));
        }
        if self.exporter.collector_port == 0 {
            return Err(ConfigError::Invalid("exporter.collector_port must be set".to_string()));
        }
        if self.exporter.path_mtu < 576 {
            return Err(ConfigError::Invalid(format!(
                "exporter.path_mtu must be at least 576, got {}",
                self.exporter.path_mtu
            )));
        }
        if self.exporter.template_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "exporter.template_interval_seconds must be non-zero".to_string(),
            ));
        }
        if let Some(params) = &self.params {
            if RecordFlags::from_names(&params.record).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "Unknown record layer in {:?}",
                    params.record
                )));
            }
        } else if !self.interfaces.is_empty() {
            return Err(ConfigError::Invalid(
                "[[interfaces]] requires a [params] section".to_string(),
            ));
        }
        for interface in self.interfaces.iter() {
            if interface.sw_if_index >= self.table.max_interfaces {
                return Err(ConfigError::Invalid(format!(
                    "Interface {} is above table.max_interfaces",
                    interface.sw_if_index
                )));
            }
        }
        Ok(())
    }
}

/// Load the configuration from its usual location.
pub fn load_config() -> Result<Config, ConfigError> {
    Config::load()
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found. You must setup /etc/delayprobe.conf to use delayprobe.")]
    ConfigDoesNotExist,
    #[error("Unable to read contents of the configuration file.")]
    CannotReadFile,
    #[error("Unable to parse TOML in the configuration file")]
    CannotParseToml,
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
