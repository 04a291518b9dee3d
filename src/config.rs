//! Configuration surface of the receiver.
//!
//! Values come from a TOML file and may be overridden on the command
//! line by the `waps-ies` executable. A minimal file:
//!
//! ```toml
//! ip_address = "localhost"
//! port = 12345
//! tcp_timeout = 2.1
//! output_path = "output/"
//! log_path = "log/"
//! log_level = "info"
//! image_timeout = 600
//! memory_slot_change_detection = true
//!
//! [ec_positions]
//! 171 = ".EC_A4"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::assemble::{AssemblyOptions, EcTable};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read the configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not parse the configuration file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("server IP address not specified; pass -i/--ip or set ip_address")]
    MissingIpAddress,

    #[error("server port not specified; pass -p/--port or set port")]
    MissingPort,

    #[error("EC address {0:?} is not a byte value")]
    BadEcAddress(String),
}

/// Log verbosity, `info` unless configured otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by the `tracing` filter.
    pub fn directive(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Receiver configuration, file plus defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// TCP server distributing the CCSDS stream. Required.
    pub ip_address: Option<String>,
    /// TCP server port. Required.
    pub port: Option<u16>,
    /// Seconds of socket silence before the operator is notified.
    /// Packets are expected at least once a second; the default allows
    /// a bit more than double that.
    pub tcp_timeout: f64,
    /// Root of the extracted image tree.
    pub output_path: PathBuf,
    /// Catalog database file.
    pub catalog_file: PathBuf,
    /// Directory receiving the daily process logs.
    pub log_path: PathBuf,
    pub log_level: LogLevel,
    /// Minutes before an incomplete image is declared outdated.
    /// Zero disables the timeout entirely.
    pub image_timeout: u64,
    /// Detect slot reuse from general BIOLAB telemetry.
    pub memory_slot_change_detection: bool,
    /// EC address to position label table.
    pub ec_positions: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ip_address: None,
            port: None,
            tcp_timeout: 2.1,
            output_path: PathBuf::from("output"),
            catalog_file: PathBuf::from("waps_pd.db"),
            log_path: PathBuf::from("log"),
            log_level: LogLevel::Info,
            image_timeout: 600,
            memory_slot_change_detection: false,
            ec_positions: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads a TOML configuration file.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// Checks that the mandatory connection parameters are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ip_address.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingIpAddress);
        }
        if self.port.is_none() {
            return Err(ConfigError::MissingPort);
        }
        Ok(())
    }

    /// `host:port` of the TCP server.
    pub fn server_address(&self) -> Result<String, ConfigError> {
        self.validate()?;
        Ok(format!(
            "{}:{}",
            self.ip_address.as_deref().unwrap(),
            self.port.unwrap()
        ))
    }

    pub fn tcp_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.tcp_timeout)
    }

    /// The image timeout, `None` when disabled.
    pub fn image_timeout(&self) -> Option<chrono::Duration> {
        match self.image_timeout {
            0 => None,
            minutes => Some(chrono::Duration::minutes(minutes as i64)),
        }
    }

    pub fn assembly_options(&self) -> AssemblyOptions {
        AssemblyOptions {
            image_timeout: self.image_timeout(),
            detect_slot_change: self.memory_slot_change_detection,
        }
    }

    /// Builds the EC table from the configured address/position pairs.
    pub fn ec_table(&self) -> Result<EcTable, ConfigError> {
        let mut pairs = Vec::new();
        for (address, position) in &self.ec_positions {
            let address: u8 = address
                .parse()
                .map_err(|_| ConfigError::BadEcAddress(address.clone()))?;
            pairs.push((address, position.clone()));
        }
        Ok(EcTable::seed(pairs))
    }
}
