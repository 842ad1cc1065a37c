use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_PORTAL_CONFIG_PATH: &str = "/etc/swarm-gateway/apsystems.conf";
pub const DEFAULT_INFLUX_CONFIG_PATH: &str = "/etc/swarm-gateway/influx.conf";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{file}: missing key `{key}`")]
    MissingKey { file: String, key: &'static str },
    #[error("{file}: invalid value for `{key}`: {value:?}")]
    InvalidValue {
        file: String,
        key: &'static str,
        value: String,
    },
}

/// A line that did not split into exactly one key and one value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedLine {
    pub line_no: usize,
    pub content: String,
}

/// Flat `key=value` mapping read from one config file.
#[derive(Debug, Default)]
pub struct KeyValues {
    source: String,
    values: HashMap<String, String>,
    pub skipped: Vec<SkippedLine>,
}

impl KeyValues {
    /// Parse `key=value` lines leniently.
    ///
    /// A line is kept only when splitting on `=` yields exactly two fields;
    /// key and value are whitespace-trimmed. Everything else is recorded in
    /// `skipped` (blank lines are dropped without a diagnostic).
    pub fn parse(source: impl Into<String>, text: &str) -> Self {
        let mut values = HashMap::new();
        let mut skipped = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            let fields: Vec<&str> = line.split('=').collect();
            match fields.as_slice() {
                [key, value] => {
                    values.insert(key.trim().to_string(), value.trim().to_string());
                }
                _ if line.trim().is_empty() => {}
                _ => skipped.push(SkippedLine {
                    line_no: idx + 1,
                    content: line.to_string(),
                }),
            }
        }

        Self {
            source: source.into(),
            values,
            skipped,
        }
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let parsed = Self::parse(path.display().to_string(), &text);

        for line in &parsed.skipped {
            debug!(
                file = %parsed.source,
                line = line.line_no,
                content = %line.content,
                "ignoring config line without a single `=`"
            );
        }

        Ok(parsed)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    fn require(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key)
            .map(str::to_string)
            .ok_or_else(|| ConfigError::MissingKey {
                file: self.source.clone(),
                key,
            })
    }
}

/// Portal credentials and the device the report is requested for.
#[derive(Clone)]
pub struct PortalConfig {
    pub username: String,
    pub password: String,
    pub system_id: String,
    pub ecu_id: String,
    pub location_general: String,
}

impl PortalConfig {
    pub fn from_key_values(kv: &KeyValues) -> Result<Self, ConfigError> {
        Ok(Self {
            username: kv.require("username")?,
            password: kv.require("password")?,
            system_id: kv.require("system_id")?,
            ecu_id: kv.require("ecu_id")?,
            location_general: kv.require("location_general")?,
        })
    }
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("username", &self.username)
            .field("password", &"***")
            .field("system_id", &self.system_id)
            .field("ecu_id", &self.ecu_id)
            .field("location_general", &self.location_general)
            .finish()
    }
}

#[derive(Clone)]
pub struct InfluxConfig {
    /// Host name, optionally with an explicit scheme. Files only accept `https://`.
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: String,
}

impl InfluxConfig {
    pub fn from_key_values(kv: &KeyValues) -> Result<Self, ConfigError> {
        let raw_port = kv.require("port")?;
        let port = raw_port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidValue {
                file: kv.source.clone(),
                key: "port",
                value: raw_port.clone(),
            })?;

        // Writes carry credentials, so config files may not opt out of TLS.
        let host = kv.require("url")?;
        if host.starts_with("http://") {
            return Err(ConfigError::InvalidValue {
                file: kv.source.clone(),
                key: "url",
                value: host,
            });
        }

        Ok(Self {
            host,
            port,
            username: kv.require("username")?,
            password: kv.require("password")?,
            database: kv.require("database")?,
        })
    }

    /// Base URL of the InfluxDB HTTP API. Plain host names default to TLS.
    pub fn endpoint(&self) -> String {
        let host = self.host.trim_end_matches('/');
        if host.starts_with("https://") || host.starts_with("http://") {
            format!("{}:{}", host, self.port)
        } else {
            format!("https://{}:{}", host, self.port)
        }
    }
}

impl fmt::Debug for InfluxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InfluxConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("database", &self.database)
            .finish()
    }
}

/// Everything a run needs, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub portal: PortalConfig,
    pub influx: InfluxConfig,
}

impl Config {
    pub fn load(portal_path: &Path, influx_path: &Path) -> Result<Self, ConfigError> {
        let portal = PortalConfig::from_key_values(&KeyValues::load(portal_path)?)?;
        let influx = InfluxConfig::from_key_values(&KeyValues::load(influx_path)?)?;
        Ok(Self { portal, influx })
    }
}
