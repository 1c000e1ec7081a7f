//! VSite update state machine.
//!
//! A [`VSite`] owns its backend, its persisted watermark and its retry
//! deadline. One call to [`VSite::update`] runs a full
//! prepare → update(groups, users) → finish cycle:
//!
//! - the watermark moves only when every step succeeded and the new value
//!   was written to disk, and it never moves backwards;
//! - any failure leaves the watermark alone and sets `retry_at`, using the
//!   site-wide database retry interval for database errors and the VSite's
//!   own interval for everything else;
//! - an optional readiness hook can abandon the cycle up front without it
//!   counting as a failure.

pub mod backend;
mod errors;
mod store;
mod watermark;

pub use backend::{BackendFactory, UpdateScope, VSiteBackend};
pub use errors::UpdateError;
pub use store::TimestampStore;
pub use watermark::Watermark;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    Clock, Error, Result,
    db::SiteDb,
    hooks::{FilterHook, HookVerdict},
};

/// Operation name passed to the readiness hook.
pub const READY_OPERATION: &str = "vsite_ready";

/// Where an update cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Preparing,
    Updating,
    Finishing,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Preparing => "preparing",
            UpdatePhase::Updating => "updating",
            UpdatePhase::Finishing => "finishing",
        })
    }
}

/// How a cycle that did not fail ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Every step succeeded. `advanced` is false when the candidate
    /// watermark was not newer than the stored one.
    Completed { watermark: Watermark, advanced: bool },
    /// The readiness hook declined; nothing ran and any pending retry is
    /// dropped.
    NotReady,
}

/// Per-VSite timing and hook settings.
#[derive(Debug, Clone)]
pub struct VSiteSettings {
    /// Retry delay after a backend failure.
    pub retry_interval: Duration,
    /// Retry delay after a database failure.
    pub database_retry_interval: Duration,
    pub ready_hook: Option<Arc<FilterHook>>,
}

/// One VSite and its update state.
#[derive(Debug)]
pub struct VSite {
    name: String,
    site: String,
    backend: Box<dyn VSiteBackend>,
    store: TimestampStore,
    watermark: Watermark,
    bootstrapping: bool,
    retry_at: Option<u64>,
    settings: VSiteSettings,
    clock: Arc<dyn Clock>,
    phase: UpdatePhase,
}

impl VSite {
    /// Create a VSite, loading its last watermark from `store`.
    pub fn new(
        name: impl Into<String>,
        site: impl Into<String>,
        backend: Box<dyn VSiteBackend>,
        store: TimestampStore,
        settings: VSiteSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let name = name.into();
        let watermark = store.load(&name);
        debug!(vsite = %name, %watermark, "Loaded VSite");
        Self {
            name,
            site: site.into(),
            backend,
            store,
            watermark,
            bootstrapping: false,
            retry_at: None,
            settings,
            clock,
            phase: UpdatePhase::Idle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Last persisted watermark.
    pub fn watermark(&self) -> &Watermark {
        &self.watermark
    }

    /// Lower bound for the next cycle: the epoch while bootstrapping.
    pub fn get_timestamp(&self) -> Watermark {
        if self.bootstrapping {
            Watermark::epoch()
        } else {
            self.watermark.clone()
        }
    }

    /// Resynchronize from the epoch on the next cycle.
    pub fn enable_bootstrap(&mut self) {
        self.bootstrapping = true;
    }

    pub fn is_bootstrapping(&self) -> bool {
        self.bootstrapping
    }

    /// Deadline of the pending retry, if a cycle failed.
    pub fn retry_at(&self) -> Option<u64> {
        self.retry_at
    }

    /// Whether a retry is pending and due at `now`.
    pub fn is_due(&self, now: u64) -> bool {
        self.retry_at.is_some_and(|at| at <= now)
    }

    /// Schedule a retry `interval` from now without running a cycle.
    pub fn defer(&mut self, interval: Duration) {
        self.retry_at = Some(self.clock.deadline_after(interval));
    }

    pub fn phase(&self) -> UpdatePhase {
        self.phase
    }

    /// Run one update cycle.
    ///
    /// `end` is the inclusive upper bound from an upstream refresh; without it
    /// the cycle takes everything up to the database's current time, read
    /// once before the backend runs. The ready hook only gates cycles without
    /// `end`. Errors are returned after `retry_at` has been set.
    pub async fn update(
        &mut self,
        db: &mut dyn SiteDb,
        end: Option<&Watermark>,
    ) -> Result<UpdateOutcome> {
        let span = info_span!("vsite_update", vsite = %self.name);
        async move {
            self.phase = UpdatePhase::Preparing;
            // Refreshes from the master already passed its own ready check.
            let hook = self.settings.ready_hook.as_ref().filter(|_| end.is_none());
            if let Some(hook) = hook {
                let verdict = hook
                    .run(READY_OPERATION, [("vsite", Some(self.name.as_str()))])
                    .await;
                if let HookVerdict::Skip(code) = verdict {
                    warn!(code, "VSite is not ready");
                    self.retry_at = None;
                    self.phase = UpdatePhase::Idle;
                    return Ok(UpdateOutcome::NotReady);
                }
            }

            let result = self.run_cycle(db, end).await;
            self.phase = UpdatePhase::Idle;
            match result {
                Ok(candidate) => self.complete(candidate),
                Err(e) => {
                    self.schedule_retry(&e);
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// The backend steps proper. Returns the candidate watermark.
    async fn run_cycle(
        &mut self,
        db: &mut dyn SiteDb,
        end: Option<&Watermark>,
    ) -> Result<Watermark> {
        let lower = self.get_timestamp();
        // Fix the upper bound before any fetch so rows committed mid-cycle
        // fall into the next window.
        let upper = match end {
            Some(end) => end.clone(),
            None => db.now().await?,
        };
        let Self {
            name,
            site,
            backend,
            phase,
            bootstrapping,
            ..
        } = self;
        let scope = UpdateScope {
            site,
            vsite: name,
            lower: &lower,
            upper: Some(&upper),
            bootstrapping: *bootstrapping,
        };
        debug!(lower = %lower, upper = %upper, "Starting update cycle");

        backend.prepare_update(db, &scope).await?;

        *phase = UpdatePhase::Updating;
        let updated = match backend.update_groups(db, &scope).await {
            Ok(()) => backend.update_users(db, &scope).await,
            Err(e) => Err(e),
        };
        if let Err(e) = updated {
            if let Err(finish_err) = backend.finish_update(db, &scope, false).await {
                warn!("Failed to finish abandoned update: {finish_err}");
            }
            return Err(e);
        }

        *phase = UpdatePhase::Finishing;
        backend.finish_update(db, &scope, true).await?;
        Ok(upper)
    }

    fn complete(&mut self, candidate: Watermark) -> Result<UpdateOutcome> {
        self.retry_at = None;
        if !candidate.is_newer_than(&self.watermark) {
            self.bootstrapping = false;
            debug!(current = %self.watermark, %candidate, "Watermark unchanged");
            return Ok(UpdateOutcome::Completed {
                watermark: self.watermark.clone(),
                advanced: false,
            });
        }
        if let Err(e) = self.store.save(&self.name, &candidate) {
            self.schedule_retry(&e);
            return Err(e);
        }
        self.bootstrapping = false;
        self.watermark = candidate;
        info!(watermark = %self.watermark, "VSite updated");
        Ok(UpdateOutcome::Completed {
            watermark: self.watermark.clone(),
            advanced: true,
        })
    }

    fn schedule_retry(&mut self, err: &Error) {
        let interval = if err.is_database_error() {
            self.settings.database_retry_interval
        } else {
            self.settings.retry_interval
        };
        let at = self.clock.deadline_after(interval);
        self.retry_at = Some(at);
        warn!(vsite = %self.name, retry_in = ?interval, "Update failed: {err}");
    }
}
