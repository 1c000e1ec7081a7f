//! Site database contract.
//!
//! The reactor talks to the authoritative database through two traits:
//!
//! - [`Connector`] opens a fresh session; the reactor calls it at startup and
//!   after every failure or heartbeat reset.
//! - [`SiteDb`] is one open session. It answers the handful of questions the
//!   agent needs (which VSites this site serves, the database clock, the
//!   changed rows for a VSite) and carries asynchronous change notifications.
//!
//! Row schemas differ between backends, so a [`RowQuery`] names the columns
//! it wants and every value comes back as optional text in a [`Row`].
//!
//! ## Implementations
//!
//! - [`postgres`] (feature `postgres`): sqlx session plus a `LISTEN`er.
//! - [`in_memory`]: shared in-process tables for development and tests.

mod errors;
pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use errors::DatabaseError;
pub use in_memory::InMemoryDatabase;
#[cfg(feature = "postgres")]
pub use postgres::PostgresConnector;

use async_trait::async_trait;

use crate::{Result, vsite::Watermark};

/// Table a row query reads from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RowSource {
    Users,
    Groups,
    GroupMembers,
}

impl RowSource {
    pub fn table(&self) -> &'static str {
        match self {
            RowSource::Users => "vs_user_accounts",
            RowSource::Groups => "vs_groups",
            RowSource::GroupMembers => "vs_group_members",
        }
    }
}

/// Column holding the last-modification timestamp of every row.
pub const MODIFIED_COLUMN: &str = "modified";

/// Rows of one VSite changed inside a watermark window.
#[derive(Debug, Clone, PartialEq)]
pub struct RowQuery {
    pub source: RowSource,
    pub site: String,
    pub vsite: String,
    pub columns: Vec<String>,
    /// Extra `column = value` conditions.
    pub filters: Vec<(String, String)>,
    /// Exclusive lower bound on `modified`.
    pub after: Option<Watermark>,
    /// Inclusive upper bound on `modified`.
    pub through: Option<Watermark>,
}

impl RowQuery {
    pub fn new(source: RowSource, site: impl Into<String>, vsite: impl Into<String>) -> Self {
        Self {
            source,
            site: site.into(),
            vsite: vsite.into(),
            columns: Vec::new(),
            filters: Vec::new(),
            after: None,
            through: None,
        }
    }

    pub fn columns<S: AsRef<str>>(mut self, columns: &[S]) -> Self {
        self.columns = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<String>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    /// Only rows modified strictly after `watermark`. The epoch means no bound.
    pub fn after(mut self, watermark: &Watermark) -> Self {
        self.after = (!watermark.is_epoch()).then(|| watermark.clone());
        self
    }

    /// Only rows modified at or before `watermark`, if given.
    pub fn through(mut self, watermark: Option<&Watermark>) -> Self {
        self.through = watermark.cloned();
        self
    }

    /// Reject names that could not be spliced into SQL as bare identifiers.
    pub fn validate(&self) -> std::result::Result<(), DatabaseError> {
        let names = self
            .columns
            .iter()
            .chain(self.filters.iter().map(|(c, _)| c));
        for name in names {
            let plain = !name.is_empty()
                && !name.starts_with(|c: char| c.is_ascii_digit())
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !plain {
                return Err(DatabaseError::InvalidIdentifier {
                    identifier: name.clone(),
                });
            }
        }
        Ok(())
    }
}

/// One result row: column names in query order with optional text values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: Vec<(String, Option<String>)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style column append.
    pub fn with(mut self, column: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        self.push(column, value.map(Into::into));
        self
    }

    /// Set `column`, replacing an existing column of the same name.
    pub fn push(&mut self, column: impl Into<String>, value: Option<String>) {
        let column = column.into();
        match self
            .columns
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case(&column))
        {
            Some(existing) => existing.1 = value,
            None => self.columns.push((column, value)),
        }
    }

    /// Value of `column`, matched case-insensitively. `None` for SQL NULL or
    /// an absent column.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .and_then(|(_, value)| value.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.columns
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_deref()))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// An asynchronous change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
}

/// Opens database sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn SiteDb>>;
}

/// One open database session.
#[async_trait]
pub trait SiteDb: Send {
    /// Names of the VSites `site` is allowed to serve, in stable order.
    async fn allowed_vsites(&mut self, site: &str) -> Result<Vec<String>>;

    /// The database's current time.
    async fn now(&mut self) -> Result<Watermark>;

    /// Rows matching `query`, ascending by modification time where the
    /// source has one.
    async fn fetch_rows(&mut self, query: &RowQuery) -> Result<Vec<Row>>;

    /// Subscribe to `channel`. Subscribing twice is a no-op.
    async fn listen(&mut self, channel: &str) -> Result<()>;

    /// Wait for the next notification on any subscribed channel.
    ///
    /// Cancel-safe: dropping the future loses nothing. Never resolves if
    /// nothing is subscribed.
    async fn recv_notification(&mut self) -> Result<Notification>;

    /// Notifications that have already arrived, without waiting.
    fn drain_notifications(&mut self) -> Vec<Notification>;

    /// Close the session, ignoring errors.
    async fn close(self: Box<Self>);
}
