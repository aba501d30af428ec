use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{error::Error, serial::settings::PortSettings};

/// Network settings for the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the websocket server binds to.
    pub address: String,

    /// Upper bound on concurrent client connections.
    pub max_connections: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:3123".into(),
            max_connections: 100,
        }
    }
}

/// TLS material for a fronting proxy.
///
/// The agent itself speaks plain websockets; these knobs are validated,
/// surfaced through agent info, and consumed by whatever terminates TLS in
/// front of it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Whether TLS termination is expected.
    pub enabled: bool,

    /// Certificate path.
    pub cert_file: Option<PathBuf>,

    /// Private key path.
    pub key_file: Option<PathBuf>,

    /// Optional CA bundle for client verification.
    pub ca_file: Option<PathBuf>,
}

/// Serial-side settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Settings applied when an open request does not supply any.
    pub defaults: PortSettings,

    /// Ports whose names match any of these regexes are never reported or
    /// opened.
    pub exclude_patterns: Vec<String>,

    /// Permit a client to re-attach to its own non-exclusive session.
    pub allow_shared_access: bool,

    /// Seconds between hotplug scans. `0` disables the watch loop.
    pub scan_interval_secs: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            defaults: PortSettings::default(),
            exclude_patterns: Vec::new(),
            allow_shared_access: false,
            scan_interval_secs: 5,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Minimum level for stdout: `trace`, `debug`, `info`, `warn` or `error`.
    pub level: String,

    /// When set, also log to a daily-rolling file in this directory.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            directory: None,
        }
    }
}

/// The configuration used for running the agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Network settings.
    pub server: ServerConfig,

    /// TLS expectations.
    pub tls: TlsConfig,

    /// Serial-side settings.
    pub serial: SerialConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

impl Config {
    fn ron() -> ron::Options {
        ron::Options::default()
            .with_default_extension(ron::extensions::Extensions::IMPLICIT_SOME)
            .with_default_extension(ron::extensions::Extensions::UNWRAP_NEWTYPES)
    }

    /// Deserialize a .ron file's contents.
    /// Panics if the input is not valid .ron.
    pub fn deserialize(input: &str) -> Self {
        Self::ron().from_str::<Config>(input).unwrap()
    }

    /// An example configuration with some fields filled in.
    pub fn example() -> Self {
        Self {
            server: ServerConfig {
                address: "0.0.0.0:3123".into(),
                max_connections: 64,
            },
            serial: SerialConfig {
                exclude_patterns: vec![r"^/dev/ttyS\d+$".into()],
                allow_shared_access: true,
                ..Default::default()
            },
            logging: LoggingConfig {
                level: "debug".into(),
                directory: Some(PathBuf::from("/var/log/serial-bridge")),
            },
            ..Default::default()
        }
    }

    /// Serialize the configuration in a "pretty" (i.e. non-compact) fashion.
    pub fn serialize_pretty(&self) -> String {
        Self::ron()
            .to_string_pretty(self, ron::ser::PrettyConfig::default())
            .unwrap()
    }

    /// Setup a new configuration from a RON file.
    pub fn new_from_path<P: AsRef<Path>>(p: P) -> Self {
        let s = std::fs::read_to_string(p).unwrap();

        Self::deserialize(&s)
    }

    /// Check the configuration is usable before the server starts.
    pub fn validate(&self) -> Result<(), Error> {
        if self.server.address.is_empty() {
            return Err(Error::InvalidConfig("server address is empty".into()));
        }

        if self.server.max_connections == 0 {
            return Err(Error::InvalidConfig(
                "max_connections must be at least 1".into(),
            ));
        }

        if self.tls.enabled && (self.tls.cert_file.is_none() || self.tls.key_file.is_none()) {
            return Err(Error::InvalidConfig(
                "TLS is enabled but cert_file/key_file are missing".into(),
            ));
        }

        self.serial.defaults.validate()?;

        for pattern in &self.serial.exclude_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                Error::InvalidConfig(format!("bad exclude pattern `{pattern}`: {e}"))
            })?;
        }

        if !matches!(
            self.logging.level.to_lowercase().as_str(),
            "trace" | "debug" | "info" | "warn" | "error"
        ) {
            return Err(Error::InvalidConfig(format!(
                "unknown log level `{}`",
                self.logging.level
            )));
        }

        Ok(())
    }
}
