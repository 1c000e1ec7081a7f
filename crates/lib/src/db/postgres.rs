//! PostgreSQL site database.
//!
//! A session is one plain [`PgConnection`] in autocommit mode for queries,
//! plus a [`PgListener`] opened on the first `LISTEN`. Keeping notifications
//! on their own connection means row queries never have to juggle the
//! listener's buffered messages.

use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgListener, PgNotification, Postgres};
use sqlx::{Connection, QueryBuilder, Row as _};
use tracing::debug;

use super::{Connector, DatabaseError, MODIFIED_COLUMN, Notification, Row, RowQuery, SiteDb};
use crate::{Result, vsite::Watermark};

/// Extension trait for sqlx Result types to simplify error handling.
///
/// Similar to `anyhow::Context`, this converts sqlx errors to
/// `DatabaseError::Sqlx` with a context message.
pub(crate) trait SqlxResultExt<T> {
    fn sql_context(self, context: &str) -> Result<T>;
}

impl<T> SqlxResultExt<T> for std::result::Result<T, sqlx::Error> {
    fn sql_context(self, context: &str) -> Result<T> {
        self.map_err(|e| {
            DatabaseError::Sqlx {
                reason: format!("{context}: {e}"),
                source: Some(e),
            }
            .into()
        })
    }
}

/// Opens sessions against a PostgreSQL URL.
#[derive(Clone)]
pub struct PostgresConnector {
    url: String,
}

impl PostgresConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl fmt::Debug for PostgresConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The URL may carry a password.
        f.debug_struct("PostgresConnector").finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn connect(&self) -> Result<Box<dyn SiteDb>> {
        let conn = PgConnection::connect(&self.url).await.map_err(|e| {
            DatabaseError::ConnectionFailed {
                reason: e.to_string(),
            }
        })?;
        debug!("Opened PostgreSQL session");
        Ok(Box::new(PgSession {
            url: self.url.clone(),
            conn,
            listener: None,
            channels: BTreeSet::new(),
        }))
    }
}

/// One open PostgreSQL session.
pub struct PgSession {
    url: String,
    conn: PgConnection,
    listener: Option<PgListener>,
    channels: BTreeSet<String>,
}

impl fmt::Debug for PgSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgSession")
            .field("listening", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

fn notification(n: PgNotification) -> Notification {
    Notification {
        channel: n.channel().to_string(),
        payload: n.payload().to_string(),
    }
}

/// Build the SELECT for `query`. Every column is cast to text so backends see
/// the database's own rendering of numbers and timestamps.
fn build_select(query: &RowQuery) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new("SELECT ");
    {
        let mut columns = qb.separated(", ");
        for column in &query.columns {
            columns.push(format!("{column}::text"));
        }
    }
    qb.push(" FROM ").push(query.source.table());
    qb.push(" WHERE siteName = ").push_bind(query.site.clone());
    qb.push(" AND vsName = ").push_bind(query.vsite.clone());
    for (column, value) in &query.filters {
        qb.push(format!(" AND {column} = ")).push_bind(value.clone());
    }
    if let Some(after) = &query.after {
        qb.push(format!(" AND {MODIFIED_COLUMN} > CAST("))
            .push_bind(after.as_str().to_string())
            .push(" AS timestamptz)");
    }
    if let Some(through) = &query.through {
        qb.push(format!(" AND {MODIFIED_COLUMN} <= CAST("))
            .push_bind(through.as_str().to_string())
            .push(" AS timestamptz)");
    }
    qb.push(format!(" ORDER BY {MODIFIED_COLUMN}"));
    qb
}

#[async_trait]
impl SiteDb for PgSession {
    async fn allowed_vsites(&mut self, site: &str) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT vsName FROM virtual_sites_allowed WHERE siteName = $1 ORDER BY vsName",
        )
        .bind(site)
        .fetch_all(&mut self.conn)
        .await
        .sql_context("Failed to get allowed VSites")
    }

    async fn now(&mut self) -> Result<Watermark> {
        let now: String = sqlx::query_scalar("SELECT now()::text")
            .fetch_one(&mut self.conn)
            .await
            .sql_context("Failed to read database time")?;
        Ok(Watermark::new(now))
    }

    async fn fetch_rows(&mut self, query: &RowQuery) -> Result<Vec<Row>> {
        query.validate()?;
        let mut qb = build_select(query);
        let context = format!("Failed to fetch from {}", query.source.table());
        let pg_rows = qb
            .build()
            .fetch_all(&mut self.conn)
            .await
            .sql_context(&context)?;

        let mut rows = Vec::with_capacity(pg_rows.len());
        for pg_row in pg_rows {
            let mut row = Row::new();
            for (i, column) in query.columns.iter().enumerate() {
                let value: Option<String> = pg_row.try_get(i).sql_context(&context)?;
                row.push(column.clone(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn listen(&mut self, channel: &str) -> Result<()> {
        if self.listener.is_some() && self.channels.contains(channel) {
            return Ok(());
        }
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => PgListener::connect(&self.url)
                .await
                .sql_context("Failed to open listener connection")?,
        };
        let listener = self.listener.insert(listener);
        listener
            .listen(channel)
            .await
            .sql_context(&format!("Failed to LISTEN {channel}"))?;
        debug!(channel, "Listening for notifications");
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn recv_notification(&mut self) -> Result<Notification> {
        let Some(listener) = &mut self.listener else {
            return std::future::pending().await;
        };
        match listener.try_recv().await {
            Ok(Some(n)) => Ok(notification(n)),
            // The listener reconnects on its next use, but anything sent in
            // between is gone; report it so the session is rebuilt.
            Ok(None) => Err(DatabaseError::ConnectionLost.into()),
            Err(e) => Err(e).sql_context("Failed to receive notification"),
        }
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        let Some(listener) = &mut self.listener else {
            return Vec::new();
        };
        std::iter::from_fn(|| listener.next_buffered())
            .map(notification)
            .collect()
    }

    async fn close(self: Box<Self>) {
        let PgSession { conn, listener, .. } = *self;
        drop(listener);
        if let Err(e) = conn.close().await {
            debug!("Error closing PostgreSQL session: {e}");
        }
    }
}
