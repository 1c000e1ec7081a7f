//! The site agent.
//!
//! A [`Site`] owns everything one agent process manages: the database
//! session, the registry of VSites it serves, the link to its master (if it
//! has one) and the slaves connected to it. [`Site::turn`] runs one reactor
//! iteration, see the [`reactor`] module.

mod reactor;
mod registry;

pub use registry::VSiteRegistry;

use std::collections::BTreeMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::{
    Clock, Result, SystemClock,
    config::{
        DEFAULT_CONNECT_TIMEOUT, DEFAULT_DATABASE_RETRY_INTERVAL, DEFAULT_MASTER_RETRY_INTERVAL,
        DEFAULT_MAXIMUM_NAP_TIME, DEFAULT_NOTIFY_CHANNEL, DEFAULT_UPDATE_HEARTBEAT,
    },
    db::{Connector, SiteDb},
    hooks::FilterHook,
    peer::{DownstreamSet, UpstreamLink, UpstreamSet},
    vsite::{BackendFactory, TimestampStore, VSite, VSiteSettings},
};

/// Everything a [`Site`] needs to know besides its collaborators.
///
/// Built from the configuration file by
/// [`AgentConfig::site_options`](crate::config::AgentConfig::site_options).
#[derive(Debug, Clone)]
pub struct SiteOptions {
    /// Names timestamp files and, by default, the configuration file.
    pub agent_key: String,
    pub site_name: String,
    pub state_dir: PathBuf,
    /// `host:port` to accept slaves on.
    pub listen_addr: Option<String>,
    /// `host:port` of our master. Without one this agent is authoritative
    /// and listens for database notifications instead.
    pub master_addr: Option<String>,
    pub master_retry_interval: Duration,
    pub database_retry_interval: Duration,
    /// Longest single wait.
    pub max_nap: Duration,
    /// Maximum age of a database session.
    pub heartbeat: Duration,
    pub connect_timeout: Duration,
    pub notify_channel: String,
    pub ready_hook: Option<Arc<FilterHook>>,
    /// Per-VSite backend retry intervals; others use
    /// `database_retry_interval`.
    pub vsite_retry_intervals: BTreeMap<String, Duration>,
    /// Resynchronize every VSite from the epoch on the first pass.
    pub bootstrap: bool,
}

impl SiteOptions {
    pub fn new(
        agent_key: impl Into<String>,
        site_name: impl Into<String>,
        state_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_key: agent_key.into(),
            site_name: site_name.into(),
            state_dir: state_dir.into(),
            listen_addr: None,
            master_addr: None,
            master_retry_interval: Duration::from_secs_f64(DEFAULT_MASTER_RETRY_INTERVAL),
            database_retry_interval: Duration::from_secs_f64(DEFAULT_DATABASE_RETRY_INTERVAL),
            max_nap: Duration::from_secs_f64(DEFAULT_MAXIMUM_NAP_TIME),
            heartbeat: Duration::from_secs_f64(DEFAULT_UPDATE_HEARTBEAT),
            connect_timeout: Duration::from_secs_f64(DEFAULT_CONNECT_TIMEOUT),
            notify_channel: DEFAULT_NOTIFY_CHANNEL.to_string(),
            ready_hook: None,
            vsite_retry_intervals: BTreeMap::new(),
            bootstrap: false,
        }
    }

    /// Timing and hook settings for `vsite`.
    pub fn vsite_settings(&self, vsite: &str) -> VSiteSettings {
        VSiteSettings {
            retry_interval: self
                .vsite_retry_intervals
                .get(vsite)
                .copied()
                .unwrap_or(self.database_retry_interval),
            database_retry_interval: self.database_retry_interval,
            ready_hook: self.ready_hook.clone(),
        }
    }
}

/// One running site agent.
pub struct Site {
    options: SiteOptions,
    connector: Box<dyn Connector>,
    backends: Arc<dyn BackendFactory>,
    clock: Arc<dyn Clock>,
    store: TimestampStore,
    registry: VSiteRegistry,

    db: Option<Box<dyn SiteDb>>,
    /// When to try opening a session while there is none.
    db_reconnect_at: u64,
    /// When the open session is recycled.
    db_reset_at: u64,
    full_pass_pending: bool,
    bootstrap_pending: bool,

    upstream: Option<UpstreamSet>,
    downstream: Option<DownstreamSet>,
}

impl fmt::Debug for Site {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Site")
            .field("site", &self.options.site_name)
            .field("registry", &self.registry)
            .field("db_connected", &self.db.is_some())
            .field("db_reconnect_at", &self.db_reconnect_at)
            .field("db_reset_at", &self.db_reset_at)
            .field("upstream", &self.upstream)
            .field("downstream", &self.downstream)
            .finish_non_exhaustive()
    }
}

impl Site {
    /// Create a site agent.
    ///
    /// Binds the slave listener if one is configured; nothing else touches
    /// the network or the database until the first [`turn`](Self::turn).
    ///
    /// # Arguments
    /// * `options` - Site settings
    /// * `connector` - Opens database sessions
    /// * `backends` - Builds the backend of each VSite once the VSite list
    ///   is known
    pub async fn open(
        options: SiteOptions,
        connector: Box<dyn Connector>,
        backends: Arc<dyn BackendFactory>,
    ) -> Result<Self> {
        Self::open_impl(options, connector, backends, Arc::new(SystemClock)).await
    }

    /// Same as [`Site::open`] with an injected clock.
    ///
    /// Only available with the `testing` feature or in test builds.
    #[cfg(any(test, feature = "testing"))]
    pub async fn open_with_clock(
        options: SiteOptions,
        connector: Box<dyn Connector>,
        backends: Arc<dyn BackendFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::open_impl(options, connector, backends, clock).await
    }

    async fn open_impl(
        options: SiteOptions,
        connector: Box<dyn Connector>,
        backends: Arc<dyn BackendFactory>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let downstream = match &options.listen_addr {
            Some(addr) => Some(DownstreamSet::bind(addr).await?),
            None => None,
        };
        let upstream = options.master_addr.as_ref().map(|addr| {
            let mut set = UpstreamSet::new();
            set.insert(UpstreamLink::new(
                addr.clone(),
                options.master_retry_interval,
                options.connect_timeout,
            ));
            set
        });
        info!(
            site = %options.site_name,
            master = ?options.master_addr,
            listen = ?options.listen_addr,
            bootstrap = options.bootstrap,
            "Site agent starting"
        );

        Ok(Self {
            store: TimestampStore::new(&options.state_dir, &options.agent_key, &options.site_name),
            registry: VSiteRegistry::new(&options.site_name),
            bootstrap_pending: options.bootstrap,
            options,
            connector,
            backends,
            clock,
            db: None,
            db_reconnect_at: 0,
            db_reset_at: 0,
            full_pass_pending: false,
            upstream,
            downstream,
        })
    }

    pub fn options(&self) -> &SiteOptions {
        &self.options
    }

    pub fn site_name(&self) -> &str {
        &self.options.site_name
    }

    pub fn registry(&self) -> &VSiteRegistry {
        &self.registry
    }

    pub fn vsite(&self, name: &str) -> Option<&VSite> {
        self.registry.get(name)
    }

    pub fn is_database_connected(&self) -> bool {
        self.db.is_some()
    }

    /// Next session attempt while disconnected.
    pub fn database_reconnect_at(&self) -> Option<u64> {
        self.db.is_none().then_some(self.db_reconnect_at)
    }

    /// Address the slave listener is bound to.
    pub fn downstream_addr(&self) -> Option<SocketAddr> {
        self.downstream.as_ref()?.local_addr().ok()
    }

    pub fn downstream(&self) -> Option<&DownstreamSet> {
        self.downstream.as_ref()
    }

    pub fn upstream(&self) -> Option<&UpstreamSet> {
        self.upstream.as_ref()
    }

    /// Whether any master link is connected.
    pub fn is_upstream_connected(&self) -> bool {
        self.upstream
            .as_ref()
            .is_some_and(|set| set.iter().any(|(_, link)| link.is_connected()))
    }

    /// Build the VSite list from the database's allowed VSites.
    async fn load_registry(&mut self) -> Result<()> {
        let Some(db) = self.db.as_deref_mut() else {
            return Ok(());
        };
        let names = db.allowed_vsites(&self.options.site_name).await?;
        let mut vsites = Vec::with_capacity(names.len());
        for name in names {
            let backend = self.backends.create(&name)?;
            vsites.push(VSite::new(
                name.as_str(),
                self.options.site_name.as_str(),
                backend,
                self.store.clone(),
                self.options.vsite_settings(&name),
                self.clock.clone(),
            ));
        }
        info!(count = vsites.len(), "Loaded VSite list");
        self.registry.load(vsites);
        Ok(())
    }
}
