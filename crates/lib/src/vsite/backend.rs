//! Backend contract for VSite update cycles.

use std::fmt::Debug;

use async_trait::async_trait;

use super::Watermark;
use crate::{
    Result,
    db::{RowQuery, RowSource, SiteDb},
};

/// The window one update cycle covers.
#[derive(Debug, Clone, Copy)]
pub struct UpdateScope<'a> {
    pub site: &'a str,
    pub vsite: &'a str,
    /// Exclusive lower bound; the epoch while bootstrapping.
    pub lower: &'a Watermark,
    /// Inclusive upper bound. `VSite` always sets it; `None` means unbounded.
    pub upper: Option<&'a Watermark>,
    pub bootstrapping: bool,
}

impl UpdateScope<'_> {
    /// A query over `source` restricted to this scope's VSite and window.
    pub fn query<S: AsRef<str>>(&self, source: RowSource, columns: &[S]) -> RowQuery {
        RowQuery::new(source, self.site, self.vsite)
            .columns(columns)
            .after(self.lower)
            .through(self.upper)
    }
}

/// The provisioning steps of one VSite.
///
/// Steps receive the open database session and the cycle's [`UpdateScope`].
/// Returning a database error makes the cycle retry on the site-wide database
/// interval; any other error uses the VSite's own retry interval.
#[async_trait]
pub trait VSiteBackend: Send + Debug {
    /// Called before any rows are read.
    async fn prepare_update(&mut self, _db: &mut dyn SiteDb, _scope: &UpdateScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn update_groups(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()>;

    async fn update_users(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()>;

    /// Called once the cycle is over. `completed` is false when an update
    /// step failed; the watermark will not move in that case.
    async fn finish_update(
        &mut self,
        _db: &mut dyn SiteDb,
        _scope: &UpdateScope<'_>,
        _completed: bool,
    ) -> Result<()> {
        Ok(())
    }
}

/// Builds the backend for each VSite the site serves.
pub trait BackendFactory: Send + Sync + Debug {
    fn create(&self, vsite: &str) -> Result<Box<dyn VSiteBackend>>;
}
