//! In-memory site database.
//!
//! All clones of an [`InMemoryDatabase`] share the same tables, so a test (or
//! a development harness) can keep one handle to mutate rows, advance the
//! database clock, post notifications and inject failures while the reactor
//! holds sessions opened through the [`Connector`] impl.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::trace;

use super::{
    Connector, DatabaseError, MODIFIED_COLUMN, Notification, Row, RowQuery, RowSource, SiteDb,
};
use crate::{Result, vsite::Watermark};

/// Operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbOp {
    Connect,
    AllowedVSites,
    Now,
    Fetch(RowSource),
    Listen,
    Recv,
}

#[derive(Debug, Clone)]
struct StoredRow {
    source: RowSource,
    site: String,
    vsite: String,
    modified: Watermark,
    row: Row,
}

#[derive(Debug, Default)]
struct State {
    allowed: BTreeMap<String, Vec<String>>,
    rows: Vec<StoredRow>,
    /// `None` follows the wall clock.
    now: Option<Watermark>,
    /// Bumped to invalidate every open session.
    generation: u64,
    failures: VecDeque<DbOp>,
    listening: BTreeSet<String>,
    notifications: VecDeque<Notification>,
    queries: Vec<RowQuery>,
    connects: u64,
}

impl State {
    fn take_failure(&mut self, op: DbOp) -> Result<()> {
        if let Some(pos) = self.failures.iter().position(|f| *f == op) {
            self.failures.remove(pos);
            return Err(DatabaseError::QueryFailed {
                operation: format!("{op:?}"),
                reason: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

/// Shared in-process database.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allow `site` to serve `vsite`.
    pub fn allow_vsite(&self, site: &str, vsite: &str) {
        self.lock()
            .allowed
            .entry(site.to_string())
            .or_default()
            .push(vsite.to_string());
    }

    /// Pin the value returned by `SiteDb::now`. Until set it follows the
    /// wall clock.
    pub fn set_now(&self, now: impl Into<Watermark>) {
        self.lock().now = Some(now.into());
    }

    /// Insert a row for (`site`, `vsite`) last modified at `modified`.
    pub fn insert_row(
        &self,
        source: RowSource,
        site: &str,
        vsite: &str,
        modified: impl Into<Watermark>,
        row: Row,
    ) {
        self.lock().rows.push(StoredRow {
            source,
            site: site.to_string(),
            vsite: vsite.to_string(),
            modified: modified.into(),
            row,
        });
    }

    /// Post a notification. Dropped unless some session listens on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) {
        {
            let mut state = self.lock();
            if !state.listening.contains(channel) {
                trace!(channel, "Notification dropped, nobody listening");
                return;
            }
            state.notifications.push_back(Notification {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        self.notify.notify_waiters();
    }

    /// Make the next `op` fail with a database error.
    pub fn fail_next(&self, op: DbOp) {
        self.lock().failures.push_back(op);
    }

    /// Invalidate every open session, as if the server restarted.
    pub fn drop_sessions(&self) {
        {
            let mut state = self.lock();
            state.generation += 1;
            state.listening.clear();
            state.notifications.clear();
        }
        self.notify.notify_waiters();
    }

    /// Every row query issued so far.
    pub fn queries(&self) -> Vec<RowQuery> {
        self.lock().queries.clone()
    }

    /// Number of sessions opened so far.
    pub fn connect_count(&self) -> u64 {
        self.lock().connects
    }

    pub fn is_listening(&self, channel: &str) -> bool {
        self.lock().listening.contains(channel)
    }
}

#[async_trait]
impl Connector for InMemoryDatabase {
    async fn connect(&self) -> Result<Box<dyn SiteDb>> {
        let mut state = self.lock();
        if state.take_failure(DbOp::Connect).is_err() {
            return Err(DatabaseError::ConnectionFailed {
                reason: "injected failure".to_string(),
            }
            .into());
        }
        state.connects += 1;
        Ok(Box::new(InMemorySession {
            db: self.clone(),
            generation: state.generation,
            listening: BTreeSet::new(),
        }))
    }
}

/// A session on an [`InMemoryDatabase`].
#[derive(Debug)]
pub struct InMemorySession {
    db: InMemoryDatabase,
    generation: u64,
    listening: BTreeSet<String>,
}

impl InMemorySession {
    /// Lock the shared state, failing if this session has been invalidated.
    fn live(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.db.lock();
        if state.generation != self.generation {
            return Err(DatabaseError::ConnectionLost.into());
        }
        Ok(state)
    }
}

#[async_trait]
impl SiteDb for InMemorySession {
    async fn allowed_vsites(&mut self, site: &str) -> Result<Vec<String>> {
        let mut state = self.live()?;
        state.take_failure(DbOp::AllowedVSites)?;
        Ok(state.allowed.get(site).cloned().unwrap_or_default())
    }

    async fn now(&mut self) -> Result<Watermark> {
        let mut state = self.live()?;
        state.take_failure(DbOp::Now)?;
        Ok(state.now.clone().unwrap_or_else(Watermark::current))
    }

    async fn fetch_rows(&mut self, query: &RowQuery) -> Result<Vec<Row>> {
        query.validate()?;
        let mut state = self.live()?;
        state.take_failure(DbOp::Fetch(query.source))?;
        state.queries.push(query.clone());

        let mut matched: Vec<&StoredRow> = state
            .rows
            .iter()
            .filter(|r| r.source == query.source && r.site == query.site && r.vsite == query.vsite)
            .filter(|r| {
                query
                    .filters
                    .iter()
                    .all(|(col, value)| r.row.get(col) == Some(value.as_str()))
            })
            .filter(|r| query.after.as_ref().is_none_or(|a| r.modified.is_newer_than(a)))
            .filter(|r| query.through.as_ref().is_none_or(|t| !r.modified.is_newer_than(t)))
            .collect();
        matched.sort_by(|a, b| a.modified.compare(&b.modified));

        let mut rows = Vec::with_capacity(matched.len());
        for stored in matched {
            let mut row = Row::new();
            for column in &query.columns {
                if column.eq_ignore_ascii_case(MODIFIED_COLUMN) {
                    row.push(column.clone(), Some(stored.modified.to_string()));
                    continue;
                }
                let value = stored
                    .row
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(column))
                    .ok_or_else(|| DatabaseError::QueryFailed {
                        operation: format!("fetch {}", query.source.table()),
                        reason: format!("column \"{column}\" does not exist"),
                    })?
                    .1;
                row.push(column.clone(), value.map(str::to_string));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    async fn listen(&mut self, channel: &str) -> Result<()> {
        if self.listening.contains(channel) {
            return Ok(());
        }
        let mut state = self.live()?;
        state.take_failure(DbOp::Listen)?;
        state.listening.insert(channel.to_string());
        drop(state);
        self.listening.insert(channel.to_string());
        Ok(())
    }

    async fn recv_notification(&mut self) -> Result<Notification> {
        if self.listening.is_empty() {
            return std::future::pending().await;
        }
        loop {
            let notified = self.db.notify.notified();
            {
                let mut state = self.live()?;
                state.take_failure(DbOp::Recv)?;
                if let Some(pos) = state
                    .notifications
                    .iter()
                    .position(|n| self.listening.contains(&n.channel))
                    && let Some(n) = state.notifications.remove(pos)
                {
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    fn drain_notifications(&mut self) -> Vec<Notification> {
        let Ok(mut state) = self.live() else {
            return Vec::new();
        };
        let (mine, others): (VecDeque<_>, VecDeque<_>) = state
            .notifications
            .drain(..)
            .partition(|n| self.listening.contains(&n.channel));
        state.notifications = others;
        mine.into_iter().collect()
    }

    async fn close(self: Box<Self>) {
        let mut state = self.db.lock();
        if state.generation == self.generation {
            for channel in &self.listening {
                state.listening.remove(channel);
            }
        }
    }
}
