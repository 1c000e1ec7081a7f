//! Bundled VSite backends.
//!
//! The agent core only knows the [`VSiteBackend`] contract. This module
//! provides the backends that ship with the binary, selected by the
//! `backend` key of the configuration:
//!
//! - `null` logs every row it reads and changes nothing;
//! - `homedir` creates home directories from a skeleton.
//!
//! Backends for directory services or remote proxies plug in through the
//! same [`BackendFactory`] trait from outside this crate.

pub mod homedir;
pub mod null;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use homedir::{HomeDirBackend, HomeDirSettings};
pub use null::NullBackend;

use crate::{
    Result,
    config::{AgentConfig, ConfigError},
    vsite::{BackendFactory, VSiteBackend},
};

/// Which bundled backend the site uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    #[default]
    Null,
    HomeDir,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Null => "null",
            BackendKind::HomeDir => "homedir",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "null" => Ok(BackendKind::Null),
            "homedir" => Ok(BackendKind::HomeDir),
            _ => Err(ConfigError::invalid("backend", s, "expected 'null' or 'homedir'")),
        }
    }
}

/// Builds bundled backends from the configuration file.
///
/// Every VSite section present in the configuration is validated when the
/// factory is built, so mistakes surface at startup. VSites the database
/// lists later without a section of their own are validated on creation.
#[derive(Debug)]
pub struct ConfiguredBackends {
    kind: BackendKind,
    password_type: Option<String>,
    homedir: BTreeMap<String, HomeDirSettings>,
    config: AgentConfig,
}

impl ConfiguredBackends {
    pub fn from_config(config: &AgentConfig) -> std::result::Result<Self, ConfigError> {
        let kind = match config.connection.backend.as_deref() {
            Some(name) => name.parse()?,
            None => BackendKind::default(),
        };
        let mut homedir = BTreeMap::new();
        if kind == BackendKind::HomeDir {
            for name in config.vsites.keys() {
                homedir.insert(name.clone(), HomeDirSettings::from_section(name, &config.vsite(name))?);
            }
        }
        Ok(Self {
            kind,
            password_type: config.connection.password_type.clone(),
            homedir,
            config: config.clone(),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }
}

impl BackendFactory for ConfiguredBackends {
    fn create(&self, vsite: &str) -> Result<Box<dyn VSiteBackend>> {
        match self.kind {
            BackendKind::Null => Ok(Box::new(NullBackend::new(self.password_type.clone()))),
            BackendKind::HomeDir => {
                let settings = match self.homedir.get(vsite) {
                    Some(settings) => settings.clone(),
                    None => HomeDirSettings::from_section(vsite, &self.config.vsite(vsite))?,
                };
                Ok(Box::new(HomeDirBackend::new(settings)))
            }
        }
    }
}
