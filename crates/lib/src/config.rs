//! Agent configuration.
//!
//! The configuration is a JSON document with a `connection` section for
//! site-wide settings and an optional `vsites` map for per-VSite settings:
//!
//! ```json
//! {
//!   "connection": {
//!     "statedirectory": "/var/lib/siteagent",
//!     "sitename": "siteA",
//!     "database_url": "postgres://agent@db/accounts",
//!     "slave_listener_port": "7001",
//!     "backend": "homedir"
//!   },
//!   "vsites": {
//!     "proj1": { "update_retry_interval": 120, "homeskeleton": "/etc/skel" }
//!   }
//! }
//! ```
//!
//! Intervals are in seconds and may be fractional. Every validation failure
//! is a [`ConfigError`], which is fatal at startup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::{hooks::FilterHook, site::SiteOptions};

pub const DEFAULT_MASTER_RETRY_INTERVAL: f64 = 60.0;
pub const DEFAULT_DATABASE_RETRY_INTERVAL: f64 = 60.0;
pub const DEFAULT_MAXIMUM_NAP_TIME: f64 = 36000.0;
pub const DEFAULT_UPDATE_HEARTBEAT: f64 = 3600.0;
pub const DEFAULT_CONNECT_TIMEOUT: f64 = 10.0;
pub const DEFAULT_NOTIFY_CHANNEL: &str = "site_update";
pub const DEFAULT_LOG_LEVEL: &str = "warn";
/// `logfile` value meaning "log to standard error".
pub const STDERR_LOGFILE: &str = "STDERR";

const SSL_MODES: [&str; 6] = [
    "disable",
    "allow",
    "prefer",
    "require",
    "verify-ca",
    "verify-full",
];
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors. All of them terminate the process at startup.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("Missing required setting '{key}'")]
    Missing { key: String },

    #[error("Invalid value for '{key}': {value} ({reason})")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Invalid address for '{key}': {value} ({reason})")]
    InvalidAddress {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Cannot read configuration file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse configuration file {path}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("No configuration file found for agent '{key}' (tried {tried:?})")]
    NotFound { key: String, tried: Vec<PathBuf> },

    #[error("State directory {path} is unusable: {reason}")]
    StateDirectory { path: PathBuf, reason: String },

    #[error("Unusable hook '{command}': {reason}")]
    Hook { command: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Get the setting this error is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            ConfigError::Missing { key }
            | ConfigError::InvalidValue { key, .. }
            | ConfigError::InvalidAddress { key, .. } => Some(key),
            _ => None,
        }
    }
}

impl From<ConfigError> for crate::Error {
    fn from(err: ConfigError) -> Self {
        crate::Error::Config(err)
    }
}

/// The whole configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentConfig {
    pub connection: ConnectionSection,
    #[serde(default)]
    pub vsites: BTreeMap<String, VSiteSection>,
}

/// Site-wide settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionSection {
    pub statedirectory: Option<PathBuf>,
    pub logfile: Option<String>,
    pub loglevel: Option<String>,

    pub database_url: Option<String>,
    pub host: Option<String>,
    pub dbport: Option<u16>,
    pub dbuser: Option<String>,
    pub dbpassword: Option<String>,
    pub database: Option<String>,
    pub sslmode: Option<String>,

    pub sitename: Option<String>,
    pub slave_listener_port: Option<String>,
    pub master_agent: Option<String>,
    pub master_retry_interval: Option<f64>,
    pub database_retry_interval: Option<f64>,
    pub maximum_nap_time: Option<f64>,
    pub update_heartbeat: Option<f64>,
    pub connect_timeout: Option<f64>,
    pub notify_channel: Option<String>,

    /// Accepted for compatibility with older configurations; hooks get their
    /// variables through the process environment instead.
    pub env_command: Option<String>,
    pub vsite_ready_escape: Option<String>,

    pub backend: Option<String>,
    pub password_type: Option<String>,
}

/// Settings for one VSite. Keys other than `update_retry_interval` belong to
/// the backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VSiteSection {
    pub update_retry_interval: Option<f64>,
    #[serde(flatten)]
    pub settings: BTreeMap<String, serde_json::Value>,
}

impl VSiteSection {
    /// A backend setting rendered as text. Numbers and booleans are accepted.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.settings.get(key)? {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            serde_json::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

/// Where log output goes and how verbose it is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: String,
    /// `None` for standard error.
    pub file: Option<PathBuf>,
}

/// Candidate configuration files for `agent_key`, in search order.
pub fn search_paths(agent_key: &str, explicit: Option<&Path>) -> Vec<PathBuf> {
    match explicit {
        Some(path) => vec![path.to_path_buf()],
        None => vec![
            PathBuf::from(format!("{agent_key}.json")),
            PathBuf::from(format!("/etc/{agent_key}.json")),
        ],
    }
}

impl AgentConfig {
    /// Parse a configuration document.
    pub fn from_json(text: &str, path: &Path) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Read the configuration for `agent_key`, from `explicit` if given,
    /// else from the first existing file in [`search_paths`].
    pub fn load(agent_key: &str, explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let tried = search_paths(agent_key, explicit);
        for path in &tried {
            match std::fs::read_to_string(path) {
                Ok(text) => {
                    debug!(path = %path.display(), "Loaded configuration");
                    return Self::from_json(&text, path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => {
                    continue;
                }
                Err(source) => {
                    return Err(ConfigError::Io {
                        path: path.clone(),
                        source,
                    });
                }
            }
        }
        Err(ConfigError::NotFound {
            key: agent_key.to_string(),
            tried,
        })
    }

    pub fn site_name(&self) -> Result<&str, ConfigError> {
        match self.connection.sitename.as_deref() {
            Some(name) if !name.trim().is_empty() => Ok(name),
            _ => Err(ConfigError::Missing {
                key: "sitename".to_string(),
            }),
        }
    }

    pub fn log_settings(&self) -> Result<LogSettings, ConfigError> {
        let level = self
            .connection
            .loglevel
            .as_deref()
            .unwrap_or(DEFAULT_LOG_LEVEL)
            .to_ascii_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::invalid("loglevel", &level, "unknown level"));
        }
        let file = match self.connection.logfile.as_deref() {
            None | Some(STDERR_LOGFILE) => None,
            Some(path) => Some(PathBuf::from(path)),
        };
        Ok(LogSettings { level, file })
    }

    /// PostgreSQL URL from `database_url`, or assembled from the individual
    /// connection keys. `None` when neither form is present.
    pub fn database_url(&self) -> Result<Option<String>, ConfigError> {
        let c = &self.connection;
        if let Some(sslmode) = &c.sslmode
            && !SSL_MODES.contains(&sslmode.as_str())
        {
            return Err(ConfigError::invalid("sslmode", sslmode, "unknown SSL mode"));
        }
        if let Some(url) = &c.database_url {
            url::Url::parse(url)
                .map_err(|e| ConfigError::invalid("database_url", "<redacted>", e.to_string()))?;
            return Ok(Some(url.clone()));
        }
        if c.host.is_none() && c.database.is_none() && c.dbuser.is_none() {
            return Ok(None);
        }

        let host = c.host.as_deref().unwrap_or("localhost");
        let mut url = url::Url::parse(&format!("postgres://{host}"))
            .map_err(|e| ConfigError::invalid("host", host, e.to_string()))?;
        let unsettable = |key: &str| ConfigError::invalid(key, "<redacted>", "cannot be used in a URL");
        if let Some(port) = c.dbport {
            url.set_port(Some(port)).map_err(|()| unsettable("dbport"))?;
        }
        if let Some(user) = &c.dbuser {
            url.set_username(user).map_err(|()| unsettable("dbuser"))?;
        }
        if let Some(password) = &c.dbpassword {
            url.set_password(Some(password))
                .map_err(|()| unsettable("dbpassword"))?;
        }
        if let Some(database) = &c.database {
            url.set_path(&format!("/{}", database.trim_start_matches('/')));
        }
        if let Some(sslmode) = &c.sslmode {
            url.query_pairs_mut().append_pair("sslmode", sslmode);
        }
        Ok(Some(url.to_string()))
    }

    /// Settings for `vsite`, or the defaults if it has no section.
    pub fn vsite(&self, vsite: &str) -> VSiteSection {
        self.vsites.get(vsite).cloned().unwrap_or_default()
    }

    /// Validate the site-wide settings into reactor options.
    pub fn site_options(&self, agent_key: &str) -> Result<SiteOptions, ConfigError> {
        let c = &self.connection;
        let state_dir = c.statedirectory.clone().ok_or_else(|| ConfigError::Missing {
            key: "statedirectory".to_string(),
        })?;

        let mut options = SiteOptions::new(agent_key, self.site_name()?, state_dir);
        options.listen_addr = c
            .slave_listener_port
            .as_deref()
            .map(|v| parse_address("slave_listener_port", v, false))
            .transpose()?;
        options.master_addr = c
            .master_agent
            .as_deref()
            .map(|v| parse_address("master_agent", v, true))
            .transpose()?;
        options.master_retry_interval = interval(
            "master_retry_interval",
            c.master_retry_interval,
            DEFAULT_MASTER_RETRY_INTERVAL,
        )?;
        options.database_retry_interval = interval(
            "database_retry_interval",
            c.database_retry_interval,
            DEFAULT_DATABASE_RETRY_INTERVAL,
        )?;
        options.max_nap = interval("maximum_nap_time", c.maximum_nap_time, DEFAULT_MAXIMUM_NAP_TIME)?;
        options.heartbeat = interval("update_heartbeat", c.update_heartbeat, DEFAULT_UPDATE_HEARTBEAT)?;
        options.connect_timeout =
            interval("connect_timeout", c.connect_timeout, DEFAULT_CONNECT_TIMEOUT)?;
        if let Some(channel) = &c.notify_channel {
            if channel.is_empty() || !channel.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
                return Err(ConfigError::invalid("notify_channel", channel, "not a plain identifier"));
            }
            options.notify_channel = channel.clone();
        }
        options.ready_hook = c
            .vsite_ready_escape
            .as_deref()
            .map(FilterHook::parse)
            .transpose()?
            .map(Arc::new);

        for (name, section) in &self.vsites {
            if let Some(secs) = section.update_retry_interval {
                let key = format!("{name}.update_retry_interval");
                options
                    .vsite_retry_intervals
                    .insert(name.clone(), interval(&key, Some(secs), 0.0)?);
            }
        }
        Ok(options)
    }
}

/// Convert a seconds value to a duration, rejecting negative and non-finite
/// values.
pub fn interval(key: &str, value: Option<f64>, default: f64) -> Result<Duration, ConfigError> {
    let secs = value.unwrap_or(default);
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::invalid(key, secs, e.to_string()))
}

/// Parse `[host:]port`. A missing host means all interfaces, unless
/// `need_host` is set.
pub fn parse_address(key: &str, value: &str, need_host: bool) -> Result<String, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = match value.trim().split_once(':') {
        Some((_, rest)) if rest.contains(':') => return Err(invalid("too many ':'")),
        Some((host, port)) => (host, port),
        None => ("", value.trim()),
    };
    if host.is_empty() && need_host {
        return Err(invalid("host name required"));
    }
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok(format!("{host}:{port}"))
}

/// Create the state directory if needed and check that it is writable.
pub fn prepare_state_dir(path: &Path) -> Result<(), ConfigError> {
    let unusable = |reason: String| ConfigError::StateDirectory {
        path: path.to_path_buf(),
        reason,
    };
    std::fs::create_dir_all(path).map_err(|e| unusable(e.to_string()))?;
    if !path.is_dir() {
        return Err(unusable("not a directory".to_string()));
    }
    let check_file = path.join(".siteagent-write-check");
    std::fs::write(&check_file, b"").map_err(|e| unusable(format!("not writable: {e}")))?;
    std::fs::remove_file(&check_file).map_err(|e| unusable(e.to_string()))?;
    Ok(())
}
