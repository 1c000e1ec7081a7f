//! One reactor iteration.
//!
//! Every [`Site::turn`] runs, in order:
//!
//! 1. the database heartbeat: a session older than `heartbeat` is closed and
//!    reopened right away;
//! 2. the database reconnect, loading the VSite list on first success and
//!    queueing a full update pass if this site has no master;
//! 3. the update pass: every VSite if a full pass is queued, otherwise only
//!    VSites whose retry is due;
//! 4. `LISTEN` on the notify channel if this site has no master;
//! 5. master connects and handshakes;
//! 6. readiness registration of every peer socket;
//! 7. the wait deadline;
//! 8. the single wait of the iteration;
//! 9. dispatch: slave I/O, master I/O (refreshes run updates) and database
//!    notifications (each runs a full pass).
//!
//! Database errors close the session and schedule a reconnect. Configuration
//! errors end the loop. Everything else is logged and the loop goes on.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, error, info, trace, warn};

use super::Site;
use crate::{
    Error, Result,
    clock::deadline_after,
    db::Notification,
    peer::ReadySet,
    vsite::{UpdateError, UpdateOutcome, Watermark},
    wire::Refresh,
};

/// Deadlines this close to now count as due.
const DEADLINE_SLACK: Duration = Duration::from_millis(500);

/// What ended the wait.
enum Wake {
    Timeout,
    Ready,
    Accepted(io::Result<(TcpStream, SocketAddr)>),
    Notification(Result<Notification>),
}

impl Site {
    /// Run the reactor until a configuration error stops it.
    pub async fn run(&mut self) -> Result<()> {
        info!(site = %self.options.site_name, "Entering main loop");
        loop {
            self.turn().await?;
        }
    }

    /// Run one reactor iteration.
    ///
    /// Only configuration errors are returned; database, backend and peer
    /// failures are absorbed and retried on their own schedules.
    pub async fn turn(&mut self) -> Result<()> {
        let now = self.clock.now_millis();
        let slack = deadline_after(now, DEADLINE_SLACK);

        if self.db.is_some() && self.db_reset_at <= slack {
            info!("Database session reached its heartbeat, reconnecting");
            self.close_db(now, Duration::ZERO).await;
        }

        if self.db.is_none() && self.db_reconnect_at <= slack {
            if let Err(e) = self.open_db(now).await {
                self.absorb(e, now).await?;
            }
        }

        if self.db.is_some() && self.registry.is_loaded() {
            let due = if std::mem::take(&mut self.full_pass_pending) {
                None
            } else {
                Some(now)
            };
            if let Err(e) = self.site_update(due).await {
                self.absorb(e, now).await?;
            }
        }

        if self.upstream.is_none() {
            let listened = match self.db.as_deref_mut() {
                Some(db) => db.listen(&self.options.notify_channel).await,
                None => Ok(()),
            };
            if let Err(e) = listened {
                self.absorb(e, now).await?;
            }
        }

        // Updates may have taken a while.
        let now = self.clock.now_millis();
        if self.registry.is_loaded()
            && let Some(upstream) = &mut self.upstream
        {
            upstream.work_if_ready(now, &self.registry).await;
        }

        let deadline = self.compute_deadline(now);
        let timeout = Duration::from_millis(deadline.saturating_sub(now));
        trace!(now, deadline, "Waiting");
        let wake = self.wait(timeout).await;

        let now = self.clock.now_millis();
        self.dispatch(wake, now).await
    }

    /// Earliest moment the next iteration has work to do.
    fn compute_deadline(&self, now: u64) -> u64 {
        let mut deadline = deadline_after(now, self.options.max_nap);
        if self.db.is_none() {
            deadline = deadline.min(self.db_reconnect_at);
        } else {
            deadline = deadline.min(self.db_reset_at);
            // Retries need a session; while there is none the reconnect
            // deadline covers them.
            if let Some(at) = self.registry.next_retry() {
                deadline = deadline.min(at);
            }
        }
        if self.registry.is_loaded()
            && let Some(upstream) = &self.upstream
        {
            deadline = upstream.compute_wake_time(deadline);
        }
        deadline
    }

    /// Block until a notification, a new slave, socket readiness or the
    /// timeout, whichever comes first.
    async fn wait(&mut self, timeout: Duration) -> Wake {
        let Self {
            db,
            upstream,
            downstream,
            ..
        } = self;

        let mut ready = ReadySet::new();
        if let Some(upstream) = upstream.as_ref() {
            upstream.prepare_readiness(&mut ready);
        }
        if let Some(downstream) = downstream.as_ref() {
            downstream.prepare_readiness(&mut ready);
        }
        let listener = downstream.as_ref().map(|d| d.listener());

        tokio::select! {
            notification = async {
                match db.as_deref_mut() {
                    Some(db) => db.recv_notification().await,
                    None => std::future::pending::<Result<Notification>>().await,
                }
            } => Wake::Notification(notification),
            accepted = async {
                match listener {
                    Some(listener) => listener.accept().await,
                    None => std::future::pending::<io::Result<(TcpStream, SocketAddr)>>().await,
                }
            } => Wake::Accepted(accepted),
            _ = ready.wait() => Wake::Ready,
            _ = tokio::time::sleep(timeout) => Wake::Timeout,
        }
    }

    async fn dispatch(&mut self, wake: Wake, now: u64) -> Result<()> {
        let mut notifications = Vec::new();
        match wake {
            Wake::Accepted(Ok((stream, addr))) => {
                if let Some(downstream) = &mut self.downstream {
                    downstream.accept(stream, addr);
                }
            }
            Wake::Accepted(Err(e)) => warn!("Failed to accept slave connection: {e}"),
            Wake::Notification(Ok(notification)) => notifications.push(notification),
            Wake::Notification(Err(e)) => self.absorb(e, now).await?,
            Wake::Ready | Wake::Timeout => {}
        }

        if let Some(downstream) = &mut self.downstream {
            downstream.read_if_ready(now, &self.registry);
            downstream.write_if_ready(now);
        }

        let mut refreshes = Vec::new();
        if let Some(upstream) = &mut self.upstream {
            upstream.read_if_ready(now, &self.registry, &mut refreshes);
            upstream.write_if_ready(now);
        }
        for refresh in refreshes {
            if let Err(e) = self.handle_refresh(refresh, now).await {
                self.absorb(e, now).await?;
            }
        }

        if let Some(db) = self.db.as_deref_mut() {
            notifications.extend(db.drain_notifications());
        }
        for notification in notifications {
            if notification.channel != self.options.notify_channel {
                debug!(channel = %notification.channel, "Ignoring notification");
                continue;
            }
            debug!(payload = %notification.payload, "Database reported changes");
            if let Err(e) = self.site_update(None).await {
                self.absorb(e, now).await?;
            }
        }

        // Send whatever the updates above queued for slaves.
        if let Some(downstream) = &mut self.downstream {
            downstream.write_if_ready(now);
        }
        Ok(())
    }

    /// Update the VSite named by a master's refresh, up to its timestamp.
    async fn handle_refresh(&mut self, refresh: Refresh, now: u64) -> Result<()> {
        if self.registry.get(&refresh.vsite).is_none() {
            warn!(vsite = %refresh.vsite, "Refresh for a VSite this site does not serve");
            return Ok(());
        }
        if self.db.is_none() {
            if let Err(e) = self.open_db(now).await {
                let retry = self.options.database_retry_interval;
                if let Some(vsite) = self.registry.get_mut(&refresh.vsite) {
                    vsite.defer(retry);
                }
                return Err(e);
            }
        }
        self.update_vsite(&refresh.vsite, Some(&refresh.timestamp)).await
    }

    /// Run one update pass. `due` limits it to VSites whose retry is due at
    /// that time; `None` updates every VSite.
    async fn site_update(&mut self, due: Option<u64>) -> Result<()> {
        if std::mem::take(&mut self.bootstrap_pending) {
            info!("Bootstrapping every VSite");
            self.registry.enable_bootstrap();
        }
        let names = match due {
            Some(now) => self.registry.due(now),
            None => self.registry.names().to_vec(),
        };
        if names.is_empty() {
            return Ok(());
        }
        debug!(count = names.len(), full = due.is_none(), "Update pass");

        for (i, name) in names.iter().enumerate() {
            if let Err(e) = self.update_vsite(name, None).await {
                if e.is_database_error() {
                    // The rest of the pass waits for the next session.
                    let retry = self.options.database_retry_interval;
                    for rest in &names[i + 1..] {
                        if let Some(vsite) = self.registry.get_mut(rest) {
                            vsite.defer(retry);
                        }
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run one cycle of `name` and tell its slaves if the watermark moved.
    ///
    /// Backend failures were already logged and scheduled by the VSite and
    /// are swallowed here.
    async fn update_vsite(&mut self, name: &str, end: Option<&Watermark>) -> Result<()> {
        let Self {
            db,
            registry,
            downstream,
            ..
        } = self;
        let Some(db) = db.as_deref_mut() else {
            return Ok(());
        };
        let Some(vsite) = registry.get_mut(name) else {
            return Err(UpdateError::UnknownVSite {
                vsite: name.to_string(),
            }
            .into());
        };
        match vsite.update(db, end).await {
            Ok(UpdateOutcome::Completed {
                watermark,
                advanced: true,
            }) => {
                if let Some(downstream) = downstream {
                    downstream.notify_vsite(name, &watermark);
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(e) if e.is_database_error() || e.is_config_error() => Err(e),
            Err(_) => Ok(()),
        }
    }

    async fn open_db(&mut self, now: u64) -> Result<()> {
        let db = self.connector.connect().await?;
        self.db = Some(db);
        self.db_reset_at = deadline_after(now, self.options.heartbeat);
        info!("Connected to database");

        if !self.registry.is_loaded() {
            self.load_registry().await?;
        }
        if self.upstream.is_none() {
            self.full_pass_pending = true;
        }
        Ok(())
    }

    /// Drop the session and try again `retry` after `now`.
    async fn close_db(&mut self, now: u64, retry: Duration) {
        if let Some(db) = self.db.take() {
            db.close().await;
        }
        self.db_reconnect_at = deadline_after(now, retry);
    }

    /// Decide what an error means for the loop.
    async fn absorb(&mut self, err: Error, now: u64) -> Result<()> {
        if err.is_config_error() {
            error!("Configuration error: {err}");
            return Err(err);
        }
        if err.is_database_error() {
            let retry = self.options.database_retry_interval;
            warn!(retry_in = ?retry, "Database connection broken: {err}");
            self.close_db(now, retry).await;
        } else {
            warn!(module = err.module(), "{err}");
        }
        Ok(())
    }
}
