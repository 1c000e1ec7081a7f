//! Shared fixtures: a recording backend, site construction and raw peers
//! speaking the wire protocol from the other end of a socket.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use siteagent::{
    FixedClock, Result, Site, Watermark,
    db::{InMemoryDatabase, RowSource, SiteDb},
    site::SiteOptions,
    vsite::{BackendFactory, UpdateError, UpdatePhase, UpdateScope, VSiteBackend},
    wire::{Frame, decode_frame},
};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub const SITE: &str = "siteA";

/// Turns allowed before a wait condition is declared stuck.
const MAX_TURNS: usize = 200;

/// One update cycle as seen by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cycle {
    pub vsite: String,
    pub lower: Watermark,
    pub upper: Option<Watermark>,
    pub bootstrapping: bool,
}

/// Cycle log and failure switches shared by every backend a factory makes.
#[derive(Debug, Clone, Default)]
pub struct Recording {
    cycles: Arc<Mutex<Vec<Cycle>>>,
    failing: Arc<Mutex<BTreeMap<String, bool>>>,
}

impl Recording {
    pub fn cycles(&self) -> Vec<Cycle> {
        self.cycles.lock().unwrap().clone()
    }

    pub fn cycles_of(&self, vsite: &str) -> Vec<Cycle> {
        self.cycles()
            .into_iter()
            .filter(|c| c.vsite == vsite)
            .collect()
    }

    /// Make the user step of `vsite` fail until cleared.
    pub fn set_failing(&self, vsite: &str, failing: bool) {
        self.failing
            .lock()
            .unwrap()
            .insert(vsite.to_string(), failing);
    }

    fn is_failing(&self, vsite: &str) -> bool {
        self.failing
            .lock()
            .unwrap()
            .get(vsite)
            .copied()
            .unwrap_or(false)
    }
}

/// Records each cycle and reads the VSite's users so database failures
/// injected on user fetches surface inside the cycle.
#[derive(Debug)]
pub struct RecordingBackend {
    recording: Recording,
}

#[async_trait]
impl VSiteBackend for RecordingBackend {
    async fn update_groups(&mut self, _db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        self.recording.cycles.lock().unwrap().push(Cycle {
            vsite: scope.vsite.to_string(),
            lower: scope.lower.clone(),
            upper: scope.upper.cloned(),
            bootstrapping: scope.bootstrapping,
        });
        Ok(())
    }

    async fn update_users(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        db.fetch_rows(&scope.query(RowSource::Users, &["UserName"]))
            .await?;
        if self.recording.is_failing(scope.vsite) {
            return Err(UpdateError::Backend {
                vsite: scope.vsite.to_string(),
                phase: UpdatePhase::Updating,
                reason: "backend unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

impl BackendFactory for Recording {
    fn create(&self, _vsite: &str) -> Result<Box<dyn VSiteBackend>> {
        Ok(Box::new(RecordingBackend {
            recording: self.clone(),
        }))
    }
}

/// Everything one test site needs kept alive.
pub struct TestSite {
    pub site: Site,
    pub db: InMemoryDatabase,
    pub clock: Arc<FixedClock>,
    pub recording: Recording,
    pub state_dir: TempDir,
}

/// Options for a standalone site that naps briefly so tests stay quick.
pub fn test_options(state_dir: &TempDir) -> SiteOptions {
    let mut options = SiteOptions::new("agent", SITE, state_dir.path());
    options.max_nap = Duration::from_millis(50);
    options.connect_timeout = Duration::from_secs(2);
    options
}

/// A database serving `vsites` for [`SITE`], its clock pinned at `now`.
pub fn database(vsites: &[&str], now: &str) -> InMemoryDatabase {
    let db = InMemoryDatabase::new();
    for vsite in vsites {
        db.allow_vsite(SITE, vsite);
    }
    db.set_now(now);
    db
}

/// Open a site on `db` after letting `configure` adjust its options.
pub async fn open_site(
    db: &InMemoryDatabase,
    state_dir: TempDir,
    configure: impl FnOnce(&mut SiteOptions),
) -> TestSite {
    let mut options = test_options(&state_dir);
    configure(&mut options);
    let clock = Arc::new(FixedClock::new(1_000_000));
    let recording = Recording::default();
    let site = Site::open_with_clock(
        options,
        Box::new(db.clone()),
        Arc::new(recording.clone()),
        clock.clone(),
    )
    .await
    .unwrap();
    TestSite {
        site,
        db: db.clone(),
        clock,
        recording,
        state_dir,
    }
}

/// Turn `site` until `done` holds.
pub async fn turn_until(site: &mut Site, mut done: impl FnMut(&Site) -> bool) {
    for _ in 0..MAX_TURNS {
        if done(site) {
            return;
        }
        site.turn().await.unwrap();
    }
    assert!(done(site), "condition not reached after {MAX_TURNS} turns");
}

/// The far end of a peer socket: writes raw frames and decodes what the
/// site sends back.
pub struct RawPeer {
    pub stream: TcpStream,
    buf: Vec<u8>,
    closed: bool,
}

impl RawPeer {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            closed: false,
        }
    }

    pub async fn connect(addr: std::net::SocketAddr) -> Self {
        Self::new(TcpStream::connect(addr).await.unwrap())
    }

    pub async fn send<F: Frame>(&mut self, frame: &F) {
        self.send_bytes(&frame.to_bytes()).await;
    }

    pub async fn send_bytes(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Pull in whatever has arrived without waiting.
    fn fill(&mut self) {
        let mut chunk = [0u8; 4096];
        loop {
            match self.stream.try_read(&mut chunk) {
                Ok(0) => {
                    self.closed = true;
                    return;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(_) => {
                    self.closed = true;
                    return;
                }
            }
        }
    }

    /// The next complete frame already received, if any.
    pub fn try_frame<F: Frame>(&mut self) -> Option<F> {
        self.fill();
        let (frame, used) = decode_frame::<F>(&self.buf).unwrap()?;
        self.buf.drain(..used);
        Some(frame)
    }

    /// Whether the site has closed the connection.
    pub fn is_closed(&mut self) -> bool {
        self.fill();
        self.closed
    }

    /// Turn `site` until the next frame arrives.
    pub async fn next_frame<F: Frame>(&mut self, site: &mut Site) -> F {
        for _ in 0..MAX_TURNS {
            if let Some(frame) = self.try_frame() {
                return frame;
            }
            site.turn().await.unwrap();
        }
        panic!("no frame after {MAX_TURNS} turns");
    }

    /// Turn `site` until it closes this connection.
    pub async fn wait_closed(&mut self, site: &mut Site) {
        for _ in 0..MAX_TURNS {
            if self.is_closed() {
                return;
            }
            site.turn().await.unwrap();
        }
        panic!("connection still open after {MAX_TURNS} turns");
    }
}
