//! CLI argument definitions for the siteagent binary.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

/// Where site data comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Database {
    /// PostgreSQL, using the connection settings of the configuration file
    Postgres,
    /// Empty in-process database serving the configured VSites (for development)
    Inmemory,
}

/// Site agent: propagates account and group state from the site database to
/// provisioning backends and notifies slave agents of completed updates
#[derive(Parser, Debug)]
#[command(name = "siteagent")]
#[command(version)]
pub struct Cli {
    /// Agent key; names the configuration file and the timestamp files
    #[arg(short, long, default_value = "siteagent", env = "SITEAGENT_KEY")]
    pub key: String,

    /// Configuration file (default: ./<key>.json, then /etc/<key>.json)
    #[arg(short, long, env = "SITEAGENT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Resynchronize every VSite from scratch on the first update pass
    #[arg(short, long)]
    pub bootstrap: bool,

    /// Site database to use
    #[arg(long, value_enum, default_value = "postgres", env = "SITEAGENT_DATABASE")]
    pub database: Database,
}
