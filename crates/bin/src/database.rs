//! Database connector selection.

use siteagent::{
    config::AgentConfig,
    db::{Connector, InMemoryDatabase, PostgresConnector},
};

use crate::cli::Database;

/// Redact credentials from a PostgreSQL connection URL for safe logging
pub fn redact_postgres_url(url: &str) -> String {
    if let Ok(parsed) = url::Url::parse(url) {
        let mut redacted = parsed.clone();
        if !parsed.username().is_empty() {
            let _ = redacted.set_username("***");
        }
        if parsed.password().is_some() {
            let _ = redacted.set_password(Some("***"));
        }
        redacted.to_string()
    } else {
        "postgres://***@<unparsable-url>".to_string()
    }
}

/// Create the connector the agent opens its database sessions with
pub fn create_connector(
    config: &AgentConfig,
    database: Database,
) -> Result<Box<dyn Connector>, Box<dyn std::error::Error>> {
    match database {
        Database::Postgres => {
            let url = config.database_url()?.ok_or(
                "PostgreSQL requires 'database_url' or 'host'/'database' in the connection section",
            )?;
            tracing::info!("Using PostgreSQL at {}", redact_postgres_url(&url));
            Ok(Box::new(PostgresConnector::new(url)))
        }
        Database::Inmemory => {
            let site = config.site_name()?;
            let db = InMemoryDatabase::new();
            for vsite in config.vsites.keys() {
                db.allow_vsite(site, vsite);
            }
            tracing::info!(
                vsites = config.vsites.len(),
                "Using an empty in-memory database"
            );
            Ok(Box::new(db))
        }
    }
}
